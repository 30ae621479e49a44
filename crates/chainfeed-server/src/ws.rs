//! Adapts an axum [`WebSocket`] to the broadcast crate's frame transport.

use axum::extract::ws::{Message, WebSocket};
use chainfeed_broadcast::{ConnectionError, Frame, FrameSink, FrameStream};
use futures::future;
use futures::{SinkExt, StreamExt};

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text),
        Frame::Ping(data) => Message::Ping(data),
        Frame::Pong(data) => Message::Pong(data),
        Frame::Close => Message::Close(None),
    }
}

fn to_frame(msg: Result<Message, axum::Error>) -> Result<Frame, ConnectionError> {
    match msg {
        Ok(Message::Text(text)) => Ok(Frame::Text(text)),
        Ok(Message::Binary(data)) => String::from_utf8(data)
            .map(Frame::Text)
            .map_err(|_| ConnectionError::Malformed("binary frame is not UTF-8".into())),
        Ok(Message::Ping(data)) => Ok(Frame::Ping(data)),
        Ok(Message::Pong(data)) => Ok(Frame::Pong(data)),
        Ok(Message::Close(_)) => Ok(Frame::Close),
        Err(e) => Err(ConnectionError::Transport(e.to_string())),
    }
}

/// Split `socket` into a frame sink and a frame stream.
pub fn split(socket: WebSocket) -> (FrameSink, FrameStream) {
    let (tx, rx) = socket.split();
    let sink: FrameSink = Box::pin(
        tx.with(|frame: Frame| future::ready(Ok::<_, axum::Error>(to_message(frame))))
            .sink_map_err(|e| ConnectionError::Transport(e.to_string())),
    );
    let stream: FrameStream = Box::pin(rx.map(to_frame));
    (sink, stream)
}
