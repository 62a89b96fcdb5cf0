//! The WebSocket upgrade action.
//!
//! Clients open a socket with `GET <realtime path>?id=<signed id>` and an
//! `Upgrade: websocket` header. The id is checked with the environment's
//! [`MessageVerifier`] before any socket state exists: a valid id leaves a
//! [`PendingUpgrade`] on the connection for the transport to complete, a
//! missing or tampered one answers 403.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use tracing::{debug, warn};
use trellis_core::signing::MessageVerifier;
use trellis_core::value::Value;
use trellis_core::{Action, Connection, Flow, PipelineObject};

use crate::server::RealtimeServer;

/// Body sent when the socket id fails verification.
pub const FORBIDDEN_BODY: &str = "403 Forbidden";

/// Left on a connection whose upgrade was accepted.
#[derive(Debug, Clone)]
pub struct PendingUpgrade {
    /// The verified socket id.
    pub socket_id: String,
    /// The server that will own the socket.
    pub server: Arc<RealtimeServer>,
}

/// Accepts WebSocket upgrades on one path.
#[derive(Debug)]
pub struct Upgrader {
    path: String,
    verifier: MessageVerifier,
    server: Arc<RealtimeServer>,
}

impl Upgrader {
    /// An upgrader for `path`, verifying ids with `verifier`.
    pub fn new(path: impl Into<String>, verifier: MessageVerifier, server: Arc<RealtimeServer>) -> Self {
        Self {
            path: path.into(),
            verifier,
            server,
        }
    }

    fn wants_upgrade(&self, conn: &Connection) -> bool {
        conn.path() == self.path
            && conn
                .request_header("upgrade")
                .is_some_and(|upgrade| upgrade.eq_ignore_ascii_case("websocket"))
    }
}

#[async_trait]
impl Action<Connection> for Upgrader {
    async fn call(&self, conn: &mut Connection) -> anyhow::Result<Flow> {
        if !self.wants_upgrade(conn) {
            return Ok(Flow::Continue);
        }

        let verified = conn
            .param("id")
            .and_then(Value::as_str)
            .map(|token| self.verifier.verify(token));

        match verified {
            Some(Ok(socket_id)) => {
                conn.logger().in_scope(|| debug!(socket_id = %socket_id, "upgrade accepted"));
                conn.extensions_mut().insert(PendingUpgrade {
                    socket_id,
                    server: Arc::clone(&self.server),
                });
            }
            Some(Err(_)) | None => {
                conn.logger().in_scope(|| warn!("rejected socket with a missing or tampered id"));
                conn.set_status(StatusCode::FORBIDDEN);
                conn.set_body(FORBIDDEN_BODY);
            }
        }
        Ok(conn.halt())
    }

    fn name(&self) -> &str {
        "upgrader"
    }
}

/// A fresh socket id and the signed token a client presents as `id`.
pub fn issue_token(verifier: &MessageVerifier) -> (String, String) {
    let id = uuid::Uuid::new_v4().simple().to_string();
    let token = verifier.generate(&id);
    (id, token)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use axum::http::Method;
    use trellis_core::config::RealtimeTimeouts;

    use super::*;
    use crate::adapter::MemoryChannelAdapter;

    fn upgrader(verifier: MessageVerifier) -> Upgrader {
        let server = RealtimeServer::new(
            Arc::new(MemoryChannelAdapter::new()),
            RealtimeTimeouts::default(),
        );
        Upgrader::new("/pw-socket", verifier, server)
    }

    fn upgrade_request(uri: &str) -> Connection {
        Connection::builder(Method::GET, uri)
            .header("upgrade", "websocket")
            .header("connection", "upgrade")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn verified_id_leaves_a_pending_upgrade() {
        let verifier = MessageVerifier::new("secret");
        let (id, token) = issue_token(&verifier);
        let action = upgrader(verifier);

        let mut conn = upgrade_request(&format!("/pw-socket?id={token}"));
        assert_eq!(action.call(&mut conn).await.unwrap(), Flow::Halt);
        assert!(conn.is_halted());

        let pending = conn.extensions().get::<PendingUpgrade>().unwrap();
        assert_eq!(pending.socket_id, id);
        assert_eq!(conn.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn tampered_id_is_forbidden() {
        let verifier = MessageVerifier::new("secret");
        let (_, token) = issue_token(&MessageVerifier::new("other"));
        let action = upgrader(verifier);

        let mut conn = upgrade_request(&format!("/pw-socket?id={token}"));
        assert_eq!(action.call(&mut conn).await.unwrap(), Flow::Halt);
        assert_eq!(conn.status(), StatusCode::FORBIDDEN);
        assert!(conn.extensions().get::<PendingUpgrade>().is_none());
    }

    #[tokio::test]
    async fn missing_id_is_forbidden() {
        let action = upgrader(MessageVerifier::new("secret"));
        let mut conn = upgrade_request("/pw-socket");
        action.call(&mut conn).await.unwrap();
        assert_eq!(conn.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn other_requests_pass_through() {
        let action = upgrader(MessageVerifier::new("secret"));

        let mut plain = Connection::builder(Method::GET, "/pw-socket").build().unwrap();
        assert_eq!(action.call(&mut plain).await.unwrap(), Flow::Continue);

        let mut elsewhere = upgrade_request("/posts");
        assert_eq!(action.call(&mut elsewhere).await.unwrap(), Flow::Continue);
        assert!(!elsewhere.is_halted());
    }
}
