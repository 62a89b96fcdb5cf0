//! Axum router construction.
//!
//! The router has no routes of its own: a single fallback handler feeds
//! every request to the environment pipeline, which owns routing.

use std::sync::Arc;

use axum::Router;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{Request, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use trellis_core::{Connection, Environment};
use trellis_realtime::PendingUpgrade;

/// Build the router serving `env`.
pub fn build_router(env: Arc<Environment>) -> Router {
    Router::new()
        .fallback(handle)
        .layer(TraceLayer::new_for_http())
        .with_state(env)
}

async fn handle(
    State(env): State<Arc<Environment>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    request: Request,
) -> Response {
    let mut conn = match Connection::from_request(request).await {
        Ok(conn) => conn,
        Err(error) => {
            warn!(error = %error, "unreadable request");
            return (StatusCode::BAD_REQUEST, error.to_string()).into_response();
        }
    };

    let realtime = &env.config().realtime;
    if realtime.log_initial_request || conn.path() != realtime.path {
        conn.logger().in_scope(|| {
            info!(method = %conn.method(), path = %conn.fullpath(), "request");
        });
    }

    env.call(&mut conn).await;

    let Some(PendingUpgrade { socket_id, server }) = conn.extensions_mut().remove::<PendingUpgrade>() else {
        return conn.into_response();
    };
    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| server.serve(socket, socket_id)),
        Err(rejection) => {
            conn.logger().in_scope(|| warn!(error = %rejection, "upgrade accepted but not upgradable"));
            rejection.into_response()
        }
    }
}
