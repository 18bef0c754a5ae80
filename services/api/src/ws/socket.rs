//! Adapts axum WebSocket frames to the bridge's client frames.

use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, close_code};
use futures_util::{Sink, SinkExt, Stream, StreamExt, future};
use live_bridge_core::{ClientFrame, TransportError};
use std::pin::Pin;

pub type ClientStream = Pin<Box<dyn Stream<Item = Result<ClientFrame, TransportError>> + Send>>;
pub type ClientSink = Pin<Box<dyn Sink<ClientFrame, Error = TransportError> + Send>>;

/// Splits a socket into the inbound frame stream and outbound frame sink.
/// Ping and pong frames are answered by axum and never surface here.
pub fn split(socket: WebSocket) -> (ClientStream, ClientSink) {
    let (sink, stream) = socket.split();

    let incoming = stream.filter_map(|message| {
        future::ready(match message {
            Ok(message) => inbound_frame(message).map(Ok),
            Err(e) => Some(Err(TransportError(e.to_string()))),
        })
    });
    let outgoing = sink
        .sink_map_err(|e| TransportError(e.to_string()))
        .with(|frame: ClientFrame| future::ready(Ok::<_, TransportError>(outbound_message(frame))));

    (Box::pin(incoming), Box::pin(outgoing))
}

fn inbound_frame(message: Message) -> Option<ClientFrame> {
    match message {
        Message::Text(text) => Some(ClientFrame::Text(text.to_string())),
        Message::Binary(data) => Some(ClientFrame::Binary(data)),
        Message::Close(_) => Some(ClientFrame::Close),
        Message::Ping(_) | Message::Pong(_) => None,
    }
}

fn outbound_message(frame: ClientFrame) -> Message {
    match frame {
        ClientFrame::Text(text) => Message::Text(text.into()),
        ClientFrame::Binary(data) => Message::Binary(data),
        ClientFrame::Close => Message::Close(Some(CloseFrame {
            code: close_code::NORMAL,
            reason: Utf8Bytes::from_static("session closed"),
        })),
    }
}
