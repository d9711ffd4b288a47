use axum::extract::ws::{Message, WebSocket};
use futures_util::{stream::SplitSink, SinkExt};
use tokio::{sync::mpsc, task::JoinHandle};

/// Drains `rx` into the socket. The task ends after a close frame has been
/// written, when the socket errors, or once every sender is gone.
pub fn spawn_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                break;
            }
        }
    })
}

/// Payload bytes of a data frame; control frames yield `None`.
pub fn data_bytes(message: Message) -> Option<Vec<u8>> {
    match message {
        Message::Text(text) => Some(text.into_bytes()),
        Message::Binary(bytes) => Some(bytes),
        _ => None,
    }
}
