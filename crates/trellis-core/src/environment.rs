//! The environment: configuration, mounted applications and the outer
//! pipeline every request enters through.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::http::StatusCode;
use futures::FutureExt;

use crate::actions::Normalizer;
use crate::app::{Application, ApplicationBuilder};
use crate::config::EnvironmentConfig;
use crate::connection::Connection;
use crate::dispatch::{Dispatcher, panic_message};
use crate::error::CoreError;
use crate::pipeline::{Action, Pipeline, PipelineBuilder, PipelineObject};

/// Body sent when the environment pipeline itself fails.
pub const LOW_LEVEL_ERROR_BODY: &str = "500 Low-Level Server Error";

/// A booted set of applications sharing one configuration.
#[derive(Debug)]
pub struct Environment {
    config: Arc<EnvironmentConfig>,
    apps: Arc<[Arc<Application>]>,
    pipeline: Pipeline<Connection>,
    shut_down: AtomicBool,
}

impl Environment {
    /// Start building an environment.
    pub fn builder(config: EnvironmentConfig) -> EnvironmentBuilder {
        EnvironmentBuilder {
            config: Arc::new(config),
            apps: Vec::new(),
            actions: PipelineBuilder::new(),
        }
    }

    /// The configuration.
    pub const fn config(&self) -> &Arc<EnvironmentConfig> {
        &self.config
    }

    /// Mounted applications, in mount order.
    pub fn applications(&self) -> &[Arc<Application>] {
        &self.apps
    }

    /// Look up a mounted application by name.
    pub fn application(&self, name: &str) -> Option<&Arc<Application>> {
        self.apps.iter().find(|app| app.name() == name)
    }

    /// Run `conn` through the environment pipeline.
    ///
    /// Never fails: application errors are handled by the dispatcher, and
    /// anything escaping the environment pipeline becomes a low-level 500.
    pub async fn call(&self, conn: &mut Connection) {
        let result = AssertUnwindSafe(self.pipeline.call(conn)).catch_unwind().await;

        let error = match result {
            Ok(Ok(_)) => return,
            Ok(Err(error)) => error,
            Err(panic) => anyhow::anyhow!("panicked: {}", panic_message(panic.as_ref())),
        };

        conn.logger().in_scope(|| {
            tracing::error!(error = %format!("{error:#}"), "environment pipeline failed");
        });
        conn.set_error(error);
        conn.set_status(StatusCode::INTERNAL_SERVER_ERROR);
        conn.set_body(LOW_LEVEL_ERROR_BODY);
        conn.halt();
    }

    /// Run every application's shutdown hooks. Later calls do nothing.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(apps = self.apps.len(), "environment shutting down");
        for app in self.apps.iter() {
            app.shutdown().await;
        }
    }
}

/// Collects applications and environment actions.
pub struct EnvironmentBuilder {
    config: Arc<EnvironmentConfig>,
    apps: Vec<Arc<Application>>,
    actions: PipelineBuilder<Connection>,
}

impl std::fmt::Debug for EnvironmentBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentBuilder")
            .field("apps", &self.apps)
            .field("actions", &self.actions.len())
            .finish_non_exhaustive()
    }
}

impl EnvironmentBuilder {
    /// The configuration applications will be built with.
    pub const fn config(&self) -> &Arc<EnvironmentConfig> {
        &self.config
    }

    /// A builder for an application sharing this environment's config.
    pub fn application(&self, name: impl Into<String>) -> ApplicationBuilder {
        Application::builder(name, Arc::clone(&self.config))
    }

    /// Add an environment action. Environment actions run after the
    /// normalizer and before dispatch, for every request.
    #[must_use]
    pub fn action(mut self, action: impl Action<Connection> + 'static) -> Self {
        self.actions = self.actions.action(action);
        self
    }

    /// Mount an application after the ones already mounted.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateApplication`] if an application with the
    /// same name is already mounted.
    pub fn mount(mut self, app: Application) -> Result<Self, CoreError> {
        if self.apps.iter().any(|mounted| mounted.name() == app.name()) {
            return Err(CoreError::DuplicateApplication(app.name().to_owned()));
        }
        tracing::info!(app = app.name(), mount_path = app.mount_path(), "application mounted");
        self.apps.push(Arc::new(app));
        Ok(self)
    }

    /// Freeze the environment.
    pub fn build(self) -> Environment {
        let apps: Arc<[Arc<Application>]> = self.apps.into();
        let pipeline = PipelineBuilder::new()
            .action(Normalizer::new(self.config.normalizer))
            .action(self.actions.build())
            .action(Dispatcher::new(Arc::clone(&apps)))
            .build();

        Environment {
            config: self.config,
            apps,
            pipeline,
            shut_down: AtomicBool::new(false),
        }
    }
}
