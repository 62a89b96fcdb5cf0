//! Applications and the builder that composes them.
//!
//! An [`Application`] is a mounted pipeline over [`Connection`]s plus the
//! state its actions share. Framework features are added with behaviours:
//! plain functions that receive the [`ApplicationBuilder`] and register
//! actions, state and shutdown hooks on it.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use axum::http::Extensions;
use futures::future::BoxFuture;

use crate::config::EnvironmentConfig;
use crate::connection::Connection;
use crate::pipeline::{Action, Outcome, PipelineBuilder, PipelineObject, Pipeline, Stage};

/// Application-level error hook.
///
/// Given the error raised by the application's pipeline, a handler may render
/// a response on the connection and return `true`, in which case the
/// connection is halted and the error never reaches the dispatcher.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    /// Try to handle `error` for `conn`.
    ///
    /// # Errors
    ///
    /// An error returned here replaces the original one.
    async fn handle(&self, conn: &mut Connection, error: &anyhow::Error) -> anyhow::Result<bool>;
}

type ShutdownHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// A mounted application.
pub struct Application {
    name: String,
    mount_path: String,
    pipeline: Pipeline<Connection>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    state: Extensions,
    shutdown_hooks: Mutex<Vec<ShutdownHook>>,
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application")
            .field("name", &self.name)
            .field("mount_path", &self.mount_path)
            .field("pipeline", &self.pipeline)
            .finish_non_exhaustive()
    }
}

impl Application {
    /// Start building an application.
    pub fn builder(name: impl Into<String>, config: Arc<EnvironmentConfig>) -> ApplicationBuilder {
        ApplicationBuilder::new(name, config)
    }

    /// The application's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The path prefix this application answers under.
    pub fn mount_path(&self) -> &str {
        &self.mount_path
    }

    /// Whether `path` falls under this application's mount path.
    pub fn mounts(&self, path: &str) -> bool {
        let prefix = self.mount_path.trim_end_matches('/');
        prefix.is_empty()
            || path == prefix
            || path
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/'))
    }

    /// The frozen pipeline.
    pub const fn pipeline(&self) -> &Pipeline<Connection> {
        &self.pipeline
    }

    /// A value registered on the application by a behaviour.
    pub fn state<S: Clone + Send + Sync + 'static>(&self) -> Option<&S> {
        self.state.get::<S>()
    }

    /// Run the application's pipeline.
    ///
    /// When the pipeline fails and the application has an error handler that
    /// handles the error, the error is recorded on the connection and the
    /// connection is halted.
    ///
    /// # Errors
    ///
    /// Returns the pipeline error when no handler handled it.
    pub async fn call(&self, conn: &mut Connection) -> anyhow::Result<Outcome> {
        let error = match self.pipeline.call(conn).await {
            Ok(outcome) => return Ok(outcome),
            Err(error) => error,
        };

        let Some(handler) = &self.error_handler else {
            return Err(error);
        };

        if handler.handle(conn, &error).await? {
            conn.set_error(error);
            conn.halt();
            Ok(Outcome::Halted)
        } else {
            Err(error)
        }
    }

    /// Run the registered shutdown hooks. Hooks run at most once.
    pub async fn shutdown(&self) {
        let hooks = std::mem::take(
            &mut *self
                .shutdown_hooks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for hook in hooks {
            hook().await;
        }
    }
}

/// Collects everything an [`Application`] is made of.
pub struct ApplicationBuilder {
    name: String,
    mount_path: String,
    config: Arc<EnvironmentConfig>,
    pipeline: PipelineBuilder<Connection>,
    error_handler: Option<Arc<dyn ErrorHandler>>,
    state: Extensions,
    shutdown_hooks: Vec<ShutdownHook>,
}

impl fmt::Debug for ApplicationBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationBuilder")
            .field("name", &self.name)
            .field("mount_path", &self.mount_path)
            .field("actions", &self.pipeline.len())
            .finish_non_exhaustive()
    }
}

impl ApplicationBuilder {
    /// A builder for an application mounted at `/`.
    pub fn new(name: impl Into<String>, config: Arc<EnvironmentConfig>) -> Self {
        Self {
            name: name.into(),
            mount_path: String::from("/"),
            config,
            pipeline: PipelineBuilder::new(),
            error_handler: None,
            state: Extensions::new(),
            shutdown_hooks: Vec::new(),
        }
    }

    /// The environment configuration, for behaviours that read settings.
    pub fn config(&self) -> &Arc<EnvironmentConfig> {
        &self.config
    }

    /// The application name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Mount the application under `path`.
    #[must_use]
    pub fn mount_at(mut self, path: impl Into<String>) -> Self {
        self.mount_path = path.into();
        self
    }

    /// Apply a behaviour.
    #[must_use]
    pub fn behavior(mut self, behavior: impl FnOnce(&mut Self)) -> Self {
        behavior(&mut self);
        self
    }

    /// Register a user action in the routes stage.
    #[must_use]
    pub fn action(mut self, action: impl Action<Connection> + 'static) -> Self {
        self.push_action(Stage::Routes, action);
        self
    }

    /// Register an action in a specific stage.
    pub fn push_action(&mut self, stage: Stage, action: impl Action<Connection> + 'static) {
        self.pipeline.push(stage, Arc::new(action));
    }

    /// Install the application error handler, replacing any previous one.
    #[must_use]
    pub fn on_error(mut self, handler: impl ErrorHandler + 'static) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Make a value available through [`Application::state`].
    pub fn insert_state<S: Clone + Send + Sync + 'static>(&mut self, value: S) {
        self.state.insert(value);
    }

    /// A value inserted by an earlier behaviour.
    pub fn state<S: Clone + Send + Sync + 'static>(&self) -> Option<&S> {
        self.state.get::<S>()
    }

    /// Run `hook` when the environment shuts down.
    pub fn on_shutdown<F, Fut>(&mut self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.shutdown_hooks.push(Box::new(move || Box::pin(hook())));
    }

    /// Freeze the application.
    pub fn build(self) -> Application {
        let pipeline = self.pipeline.build();
        tracing::debug!(
            app = %self.name,
            mount_path = %self.mount_path,
            actions = ?pipeline.names(),
            "application built"
        );
        Application {
            name: self.name,
            mount_path: self.mount_path,
            pipeline,
            error_handler: self.error_handler,
            state: self.state,
            shutdown_hooks: Mutex::new(self.shutdown_hooks),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::http::{Method, StatusCode};

    use super::*;
    use crate::pipeline::{action_fn, Flow};

    struct RenderBoom;

    #[async_trait]
    impl ErrorHandler for RenderBoom {
        async fn handle(&self, conn: &mut Connection, error: &anyhow::Error) -> anyhow::Result<bool> {
            if error.to_string() != "boom" {
                return Ok(false);
            }
            conn.set_status(StatusCode::UNPROCESSABLE_ENTITY);
            conn.set_body("handled");
            Ok(true)
        }
    }

    fn config() -> Arc<EnvironmentConfig> {
        Arc::new(EnvironmentConfig::default())
    }

    fn conn(path: &str) -> Connection {
        Connection::builder(Method::GET, path).build().unwrap()
    }

    #[test]
    fn mount_paths_match_whole_segments() {
        let app = Application::builder("admin", config()).mount_at("/admin").build();
        assert!(app.mounts("/admin"));
        assert!(app.mounts("/admin/users"));
        assert!(!app.mounts("/administrator"));

        let root = Application::builder("root", config()).build();
        assert!(root.mounts("/anything"));
    }

    #[tokio::test]
    async fn error_handler_can_halt() {
        let app = Application::builder("app", config())
            .action(action_fn(|_: &mut Connection| Err(anyhow::anyhow!("boom"))))
            .on_error(RenderBoom)
            .build();

        let mut conn = conn("/");
        let outcome = app.call(&mut conn).await.unwrap();
        assert_eq!(outcome, Outcome::Halted);
        assert!(conn.is_halted());
        assert_eq!(conn.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(conn.error().is_some());
    }

    #[tokio::test]
    async fn unhandled_errors_propagate() {
        let app = Application::builder("app", config())
            .action(action_fn(|_: &mut Connection| Err(anyhow::anyhow!("other"))))
            .on_error(RenderBoom)
            .build();

        let mut conn = conn("/");
        assert!(app.call(&mut conn).await.is_err());
        assert!(!conn.is_halted());
    }

    #[tokio::test]
    async fn behaviours_compose_in_stage_order() {
        fn late(builder: &mut ApplicationBuilder) {
            builder.push_action(
                Stage::Late,
                action_fn(|_: &mut Connection| Ok(Flow::Continue)).named("late"),
            );
        }
        fn early(builder: &mut ApplicationBuilder) {
            builder.push_action(
                Stage::Early,
                action_fn(|_: &mut Connection| Ok(Flow::Continue)).named("early"),
            );
        }

        let app = Application::builder("app", config())
            .behavior(late)
            .action(action_fn(|_: &mut Connection| Ok(Flow::Continue)).named("user"))
            .behavior(early)
            .build();

        assert_eq!(app.pipeline().names(), vec!["early", "user", "late"]);
    }

    #[tokio::test]
    async fn shutdown_hooks_run_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let hook_count = Arc::clone(&count);
        let app = Application::builder("app", config())
            .behavior(move |builder| {
                builder.on_shutdown(move || async move {
                    hook_count.fetch_add(1, Ordering::SeqCst);
                });
            })
            .build();

        app.shutdown().await;
        app.shutdown().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
