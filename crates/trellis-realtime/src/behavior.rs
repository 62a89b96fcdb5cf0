//! Wires realtime into an application.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use trellis_core::signing::MessageVerifier;
use trellis_core::{ApplicationBuilder, Stage};
use trellis_data::Subscribers;

use crate::handler::{DataPresence, SOCKET_HANDLER, SocketHandler};
use crate::server::RealtimeServer;
use crate::upgrader::Upgrader;

/// Install realtime on `app`.
///
/// Adds the upgrade action ahead of the routes, makes `server` and the
/// socket id verifier available as application state, and shuts the server
/// down with the environment. With `subscribers`, data subscriptions can
/// deliver to sockets and follow socket presence.
///
/// Does nothing when `realtime.enabled` is false.
pub fn install(
    app: &mut ApplicationBuilder,
    server: Arc<RealtimeServer>,
    subscribers: Option<Arc<Subscribers>>,
) {
    let config = Arc::clone(app.config());
    if !config.realtime.enabled {
        debug!(app = app.name(), "realtime disabled");
        return;
    }

    let verifier = MessageVerifier::new(&config.secret);
    app.push_action(
        Stage::Early,
        Upgrader::new(config.realtime.path.clone(), verifier.clone(), Arc::clone(&server)),
    );
    app.insert_state(verifier);
    app.insert_state(Arc::clone(&server));

    if let Some(subscribers) = subscribers {
        subscribers.register_handler(SOCKET_HANDLER, Arc::new(SocketHandler::new(Arc::clone(&server))));
        server.add_presence_hook(Arc::new(DataPresence::new(
            subscribers,
            Duration::from_secs(config.realtime.timeouts.disconnect_secs),
        )));
    }

    app.on_shutdown(move || async move {
        if let Err(error) = server.shutdown().await {
            warn!(error = %error, "realtime server shutdown failed");
        }
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use axum::http::{Method, StatusCode};
    use trellis_core::config::{EnvironmentConfig, RealtimeTimeouts};
    use trellis_core::{Application, Connection};

    use super::*;
    use crate::adapter::MemoryChannelAdapter;
    use crate::upgrader::issue_token;

    fn server() -> Arc<RealtimeServer> {
        RealtimeServer::new(Arc::new(MemoryChannelAdapter::new()), RealtimeTimeouts::default())
    }

    #[tokio::test]
    async fn installed_app_rejects_tampered_sockets() {
        let config = Arc::new(EnvironmentConfig {
            secret: "s3cret".into(),
            ..EnvironmentConfig::default()
        });
        let app = Application::builder("app", config)
            .behavior(|app| install(app, server(), Some(Arc::new(Subscribers::memory()))))
            .build();

        let verifier = app.state::<MessageVerifier>().unwrap();
        let (_, token) = issue_token(verifier);
        let mut conn = Connection::builder(Method::GET, &format!("/pw-socket?id={token}x"))
            .header("upgrade", "websocket")
            .build()
            .unwrap();
        app.call(&mut conn).await.unwrap();

        assert_eq!(conn.status(), StatusCode::FORBIDDEN);
        assert!(app.state::<Arc<RealtimeServer>>().is_some());
        app.shutdown().await;
    }

    #[test]
    fn disabled_realtime_installs_nothing() {
        let mut config = EnvironmentConfig::default();
        config.realtime.enabled = false;
        let app = Application::builder("app", Arc::new(config))
            .behavior(|app| install(app, server(), None))
            .build();
        assert!(app.state::<Arc<RealtimeServer>>().is_none());
    }
}
