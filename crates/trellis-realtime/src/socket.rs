//! One connected WebSocket client.
//!
//! A socket moves `Connecting -> Open -> Closed` and never back. The phase
//! and the outbound sink share one lock, so a transmit either completes
//! before the socket closes or does nothing at all.

use std::pin::Pin;

use axum::extract::ws::Message;
use futures::{Sink, SinkExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{Span, debug, info_span};

/// The raw text frame sent on every heartbeat.
pub const HEARTBEAT: &str = "beat";

/// Channel carrying framework messages to the client.
pub const SYSTEM_CHANNEL: &str = "system";

/// Where a socket's outbound frames go.
pub type Outbound = Pin<Box<dyn Sink<Message, Error = axum::Error> + Send>>;

/// A frame sent to the client: `{"channel": ..., "payload": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Channel the message was broadcast on.
    pub channel: String,
    /// The message.
    pub payload: serde_json::Value,
}

/// Lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Registered with nothing sent yet.
    Connecting,
    /// Accepting frames.
    Open,
    /// Done. Frames are dropped.
    Closed,
}

struct State {
    phase: Phase,
    sink: Option<Outbound>,
}

/// A connected client.
pub struct Socket {
    id: String,
    span: Span,
    state: Mutex<State>,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket").field("id", &self.id).finish_non_exhaustive()
    }
}

impl Socket {
    /// A socket for client `id` writing to `sink`.
    pub fn new(id: impl Into<String>, sink: Outbound) -> Self {
        let id = id.into();
        let short: String = id.chars().take(8).collect();
        Self {
            span: info_span!("socket", id = %short),
            id,
            state: Mutex::new(State {
                phase: Phase::Connecting,
                sink: Some(sink),
            }),
        }
    }

    /// The client id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The socket span. Log through it so messages carry the socket id.
    pub const fn span(&self) -> &Span {
        &self.span
    }

    /// The current phase.
    pub async fn phase(&self) -> Phase {
        self.state.lock().await.phase
    }

    /// Move from `Connecting` to `Open`. Returns whether the socket opened.
    pub async fn open(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.phase != Phase::Connecting {
            return false;
        }
        state.phase = Phase::Open;
        true
    }

    /// Send a text frame. Does nothing unless the socket is open; returns
    /// whether the frame was written.
    pub async fn transmit(&self, text: &str) -> bool {
        let mut state = self.state.lock().await;
        if state.phase != Phase::Open {
            return false;
        }
        let Some(sink) = state.sink.as_mut() else {
            return false;
        };
        match sink.send(Message::Text(text.to_owned().into())).await {
            Ok(()) => true,
            Err(error) => {
                self.span.in_scope(|| debug!(error = %error, "send failed on closing socket"));
                false
            }
        }
    }

    /// Send `envelope` as JSON.
    pub async fn transmit_envelope(&self, envelope: &Envelope) -> Result<bool, serde_json::Error> {
        let json = serde_json::to_string(envelope)?;
        Ok(self.transmit(&json).await)
    }

    /// Close the socket. Only the first call has an effect; returns whether
    /// this call closed it.
    pub async fn close(&self) -> bool {
        let mut state = self.state.lock().await;
        if state.phase == Phase::Closed {
            return false;
        }
        state.phase = Phase::Closed;
        if let Some(mut sink) = state.sink.take() {
            if let Err(error) = sink.close().await {
                self.span.in_scope(|| debug!(error = %error, "socket already gone at close"));
            }
        }
        true
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use futures::channel::mpsc;
    use futures::{FutureExt, SinkExt, StreamExt};

    use super::{Message, Outbound};

    /// An outbound sink backed by a channel, for inspecting sent frames.
    pub(crate) fn sink() -> (Outbound, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded();
        let sink = tx.sink_map_err(axum::Error::new);
        (Box::pin(sink), rx)
    }

    /// The text of every frame sent so far.
    pub(crate) fn drain(rx: &mut mpsc::UnboundedReceiver<Message>) -> Vec<String> {
        let mut frames = Vec::new();
        while let Some(Some(message)) = rx.next().now_or_never() {
            if let Message::Text(text) = message {
                frames.push(text.as_str().to_owned());
            }
        }
        frames
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::testing::{drain, sink};
    use super::*;

    #[tokio::test]
    async fn transmits_only_while_open() {
        let (out, mut rx) = sink();
        let socket = Socket::new("abcdef0123456789", out);

        assert!(!socket.transmit("early").await);
        assert!(socket.open().await);
        assert!(!socket.open().await);
        assert!(socket.transmit("hello").await);

        assert!(socket.close().await);
        assert!(!socket.close().await);
        assert!(!socket.transmit("late").await);
        assert_eq!(socket.phase().await, Phase::Closed);

        assert_eq!(drain(&mut rx), ["hello"]);
    }

    #[tokio::test]
    async fn envelopes_are_channel_and_payload() {
        let (out, mut rx) = sink();
        let socket = Socket::new("s1", out);
        socket.open().await;

        let envelope = Envelope {
            channel: "posts".into(),
            payload: serde_json::json!([{"id": 1}]),
        };
        socket.transmit_envelope(&envelope).await.unwrap();

        let frames = drain(&mut rx);
        let sent: Envelope = serde_json::from_str(frames.first().unwrap()).unwrap();
        assert_eq!(sent, envelope);
    }
}
