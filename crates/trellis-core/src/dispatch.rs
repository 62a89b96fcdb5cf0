//! Routes each connection to the mounted applications.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use futures::FutureExt;

use crate::app::Application;
use crate::connection::Connection;
use crate::pipeline::{Action, Flow, Outcome, PipelineObject};

/// Body sent when no application halts the connection.
pub const NOT_FOUND_BODY: &str = "404 Not Found";

/// Body sent when an application fails.
pub const SERVER_ERROR_BODY: &str = "500 Server Error";

/// The last action of the environment pipeline.
///
/// Offers the connection to every application whose mount path prefixes the
/// request path, in mount order. The first application that halts owns the
/// request; an application that rejects or completes without halting passes
/// it to the next one. Application failures become a 500 response and are
/// never returned to the caller.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    apps: Arc<[Arc<Application>]>,
}

impl Dispatcher {
    /// Dispatch over `apps` in the given order.
    pub const fn new(apps: Arc<[Arc<Application>]>) -> Self {
        Self { apps }
    }

    /// Offer `conn` to the applications and make sure it ends up halted with
    /// a response.
    pub async fn dispatch(&self, conn: &mut Connection) {
        let path = conn.path().to_owned();
        for app in self.apps.iter().filter(|app| app.mounts(&path)) {
            let result = AssertUnwindSafe(app.call(conn)).catch_unwind().await;

            match result {
                Ok(Ok(Outcome::Halted)) => return,
                Ok(Ok(Outcome::Rejected | Outcome::Completed)) => {
                    conn.pipeline_state_mut().clear_rejected();
                }
                Ok(Err(error)) => {
                    fail(conn, app.name(), error);
                    return;
                }
                Err(panic) => {
                    let error = anyhow::anyhow!("panicked: {}", panic_message(panic.as_ref()));
                    fail(conn, app.name(), error);
                    return;
                }
            }
        }

        conn.set_status(StatusCode::NOT_FOUND);
        conn.set_body(NOT_FOUND_BODY);
        conn.halt();
    }
}

#[async_trait]
impl Action<Connection> for Dispatcher {
    async fn call(&self, conn: &mut Connection) -> anyhow::Result<Flow> {
        self.dispatch(conn).await;
        Ok(Flow::Halt)
    }

    fn name(&self) -> &str {
        "dispatcher"
    }
}

fn fail(conn: &mut Connection, app: &str, error: anyhow::Error) {
    conn.logger().in_scope(|| {
        tracing::error!(app, error = %format!("{error:#}"), "application failed");
    });
    conn.set_error(error);
    conn.set_status(StatusCode::INTERNAL_SERVER_ERROR);
    conn.set_body(SERVER_ERROR_BODY);
    conn.halt();
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use axum::http::Method;

    use super::*;
    use crate::app::ApplicationBuilder;
    use crate::config::EnvironmentConfig;
    use crate::pipeline::action_fn;

    fn builder(name: &str) -> ApplicationBuilder {
        Application::builder(name, Arc::new(EnvironmentConfig::default()))
    }

    fn dispatcher(apps: Vec<Application>) -> Dispatcher {
        Dispatcher::new(apps.into_iter().map(Arc::new).collect())
    }

    async fn body(conn: Connection) -> String {
        let bytes = axum::body::to_bytes(conn.into_response().into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn conn(path: &str) -> Connection {
        Connection::builder(Method::GET, path).build().unwrap()
    }

    #[tokio::test]
    async fn nothing_halts_is_not_found() {
        let dispatcher = dispatcher(vec![builder("empty").build()]);
        let mut conn = conn("/missing");
        dispatcher.dispatch(&mut conn).await;

        assert!(conn.is_halted());
        assert_eq!(conn.status(), StatusCode::NOT_FOUND);
        assert_eq!(body(conn).await, NOT_FOUND_BODY);
    }

    #[tokio::test]
    async fn rejecting_app_passes_to_next() {
        let first = builder("first")
            .action(action_fn(|conn: &mut Connection| Ok(conn.reject())))
            .build();
        let second = builder("second")
            .action(action_fn(|conn: &mut Connection| {
                conn.set_body("second");
                Ok(conn.halt())
            }))
            .build();

        let mut conn = conn("/");
        dispatcher(vec![first, second]).dispatch(&mut conn).await;
        assert!(!conn.is_rejected());
        assert_eq!(conn.status(), StatusCode::OK);
        assert_eq!(body(conn).await, "second");
    }

    #[tokio::test]
    async fn first_halting_app_wins() {
        let first = builder("first")
            .action(action_fn(|conn: &mut Connection| {
                conn.set_body("first");
                Ok(conn.halt())
            }))
            .build();
        let second = builder("second")
            .action(action_fn(|conn: &mut Connection| {
                conn.set_body("second");
                Ok(conn.halt())
            }))
            .build();

        let mut conn = conn("/");
        dispatcher(vec![first, second]).dispatch(&mut conn).await;
        assert_eq!(body(conn).await, "first");
    }

    #[tokio::test]
    async fn apps_outside_the_mount_path_are_skipped() {
        let admin = builder("admin")
            .mount_at("/admin")
            .action(action_fn(|conn: &mut Connection| Ok(conn.halt())))
            .build();

        let mut conn = conn("/public");
        dispatcher(vec![admin]).dispatch(&mut conn).await;
        assert_eq!(conn.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn application_error_is_a_server_error() {
        let failing = builder("failing")
            .action(action_fn(|_: &mut Connection| Err(anyhow::anyhow!("db down"))))
            .build();

        let mut conn = conn("/");
        dispatcher(vec![failing]).dispatch(&mut conn).await;
        assert!(conn.is_halted());
        assert_eq!(conn.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(conn.error().map(ToString::to_string).as_deref(), Some("db down"));
        assert_eq!(body(conn).await, SERVER_ERROR_BODY);
    }

    #[tokio::test]
    async fn application_panic_is_a_server_error() {
        let panicking = builder("panicking")
            .action(action_fn(|_: &mut Connection| -> anyhow::Result<Flow> {
                panic!("kaboom")
            }))
            .build();

        let mut conn = conn("/");
        dispatcher(vec![panicking]).dispatch(&mut conn).await;
        assert_eq!(conn.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(conn.error().is_some_and(|e| e.to_string().contains("kaboom")));
    }

    #[test]
    fn panic_messages_are_extracted() {
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned"));
        let borrowed: Box<dyn Any + Send> = Box::new("borrowed");
        assert_eq!(panic_message(owned.as_ref()), "owned");
        assert_eq!(panic_message(borrowed.as_ref()), "borrowed");
    }
}
