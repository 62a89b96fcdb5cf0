//! Request pipeline, dispatch, and input verification for the Trellis
//! framework.
//!
//! Every HTTP request becomes a [`Connection`] that travels through the
//! [`Environment`] pipeline: the normalizer, environment-wide actions, and
//! finally the [`Dispatcher`], which offers the connection to each mounted
//! [`Application`] until one halts it.
//!
//! # Modules
//!
//! - [`pipeline`] -- [`Action`], [`Pipeline`] and the halt/reject protocol.
//! - [`connection`] -- Per-request state and the buffered response.
//! - [`app`] -- Applications, behaviours, and the application error hook.
//! - [`dispatch`] -- Mount-ordered dispatch with 404/500 fallbacks.
//! - [`environment`] -- The outer pipeline and shutdown.
//! - [`actions`] -- Normalizer and respond-missing.
//! - [`controller`] -- Method and path routing with captured params.
//! - [`verifier`] -- Sanitization, coercion, and validation of input values.
//! - [`operation`] -- Verified pipelines over plain values.
//! - [`signing`] -- HMAC-signed tokens.
//! - [`config`] -- `trellis.yaml` loading.
//! - [`value`] -- The dynamic [`Value`] type shared with the data layer.
//!
//! [`Action`]: pipeline::Action
//! [`Pipeline`]: pipeline::Pipeline
//! [`Connection`]: connection::Connection
//! [`Environment`]: environment::Environment
//! [`Dispatcher`]: dispatch::Dispatcher
//! [`Application`]: app::Application
//! [`Value`]: value::Value

pub mod actions;
pub mod app;
pub mod config;
pub mod connection;
pub mod controller;
pub mod dispatch;
pub mod environment;
pub mod error;
pub mod operation;
pub mod pipeline;
pub mod signing;
pub mod value;
pub mod verifier;

// Re-export primary types for convenience.
pub use app::{Application, ApplicationBuilder, ErrorHandler};
pub use connection::Connection;
pub use environment::Environment;
pub use error::CoreError;
pub use pipeline::{Action, Flow, Outcome, Pipeline, PipelineObject, Stage};
pub use value::{FieldType, Value, Values};
