//! Method and path routing.
//!
//! A [`Controller`] owns a list of routes under a common path prefix. Route
//! paths are `/`-separated segments where `:name` captures the segment into
//! a path param:
//!
//! ```
//! use axum::http::Method;
//! use trellis_core::controller::Controller;
//! use trellis_core::connection::Connection;
//! use trellis_core::pipeline::{action_fn, Flow};
//!
//! let posts = Controller::new("/posts").get(
//!     "/:id",
//!     action_fn(|conn: &mut Connection| {
//!         let id = conn.param("id").map(ToString::to_string).unwrap_or_default();
//!         conn.set_body(id);
//!         Ok(Flow::Continue)
//!     }),
//! );
//! # let _ = (posts, Method::GET);
//! ```
//!
//! Each route runs as its own nested pipeline: the controller's shared
//! actions first, then the route handler. A route that completes halts the
//! connection; a route that rejects lets the next matching route try.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::Method;

use crate::connection::Connection;
use crate::pipeline::{Action, Flow, Outcome, Pipeline, PipelineBuilder, PipelineObject, Stage};
use crate::value::Values;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Capture(String),
}

fn parse_segments(path: &str) -> Vec<Segment> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(|s| match s.strip_prefix(':') {
            Some(name) => Segment::Capture(name.to_owned()),
            None => Segment::Literal(s.to_owned()),
        })
        .collect()
}

#[derive(Debug)]
struct Pattern {
    method: Method,
    segments: Vec<Segment>,
}

impl Pattern {
    fn matches(&self, method: &Method, path: &str) -> Option<Values> {
        if self.method != method {
            return None;
        }

        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut captures = Values::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(literal) if literal == part => {}
                Segment::Literal(_) => return None,
                Segment::Capture(name) => {
                    captures.insert(name.clone(), part.into());
                }
            }
        }
        Some(captures)
    }
}

/// A group of routes sharing a path prefix and a set of actions.
pub struct Controller {
    prefix: Vec<Segment>,
    shared: PipelineBuilder<Connection>,
    routes: Vec<(Pattern, Arc<dyn Action<Connection>>)>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("prefix", &self.prefix)
            .field("routes", &self.routes.len())
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// A controller whose routes live under `prefix` (use `"/"` for none).
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: parse_segments(prefix),
            shared: PipelineBuilder::new(),
            routes: Vec::new(),
        }
    }

    /// Run `action` before the handler of every route.
    #[must_use]
    pub fn action(mut self, action: impl Action<Connection> + 'static) -> Self {
        self.shared = self.shared.action(action);
        self
    }

    /// Register a route.
    #[must_use]
    pub fn route(
        mut self,
        method: Method,
        path: &str,
        handler: impl Action<Connection> + 'static,
    ) -> Self {
        let mut segments = self.prefix.clone();
        segments.extend(parse_segments(path));
        self.routes
            .push((Pattern { method, segments }, Arc::new(handler)));
        self
    }

    /// Register a `GET` route.
    #[must_use]
    pub fn get(self, path: &str, handler: impl Action<Connection> + 'static) -> Self {
        self.route(Method::GET, path, handler)
    }

    /// Register a `POST` route.
    #[must_use]
    pub fn post(self, path: &str, handler: impl Action<Connection> + 'static) -> Self {
        self.route(Method::POST, path, handler)
    }

    /// Register a `PATCH` route.
    #[must_use]
    pub fn patch(self, path: &str, handler: impl Action<Connection> + 'static) -> Self {
        self.route(Method::PATCH, path, handler)
    }

    /// Register a `DELETE` route.
    #[must_use]
    pub fn delete(self, path: &str, handler: impl Action<Connection> + 'static) -> Self {
        self.route(Method::DELETE, path, handler)
    }

    /// Freeze the controller into an action.
    pub fn build(self) -> RoutingAction {
        let shared = self.shared.build();
        let routes = self
            .routes
            .into_iter()
            .map(|(pattern, handler)| {
                let mut pipeline = PipelineBuilder::new().action(shared.clone());
                pipeline.push(Stage::Routes, handler);
                (pattern, pipeline.build())
            })
            .collect();
        RoutingAction { routes }
    }
}

/// A frozen [`Controller`].
pub struct RoutingAction {
    routes: Vec<(Pattern, Pipeline<Connection>)>,
}

impl std::fmt::Debug for RoutingAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let routes: Vec<String> = self
            .routes
            .iter()
            .map(|(pattern, _)| format!("{} {:?}", pattern.method, pattern.segments))
            .collect();
        f.debug_struct("RoutingAction").field("routes", &routes).finish()
    }
}

#[async_trait]
impl Action<Connection> for RoutingAction {
    async fn call(&self, conn: &mut Connection) -> anyhow::Result<Flow> {
        let method = conn.method().clone();
        let path = conn.path().to_owned();

        for (pattern, pipeline) in &self.routes {
            let Some(captures) = pattern.matches(&method, &path) else {
                continue;
            };
            for (name, value) in captures {
                conn.set_path_param(name, value);
            }

            match pipeline.call(conn).await? {
                Outcome::Completed | Outcome::Halted => return Ok(conn.halt()),
                Outcome::Rejected => conn.pipeline_state_mut().clear_rejected(),
            }
        }

        Ok(Flow::Continue)
    }

    fn name(&self) -> &str {
        "controller"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use axum::http::StatusCode;

    use super::*;
    use crate::pipeline::action_fn;
    use crate::value::Value;

    fn conn(method: Method, path: &str) -> Connection {
        Connection::builder(method, path).build().unwrap()
    }

    fn echo_id() -> impl Action<Connection> {
        action_fn(|conn: &mut Connection| {
            let id = conn.param("id").map(ToString::to_string).unwrap_or_default();
            conn.set_body(format!("post {id}"));
            Ok(Flow::Continue)
        })
    }

    #[tokio::test]
    async fn captures_become_path_params_and_route_halts() {
        let routes = Controller::new("/posts").get("/:id", echo_id()).build();

        let mut conn = conn(Method::GET, "/posts/42");
        assert_eq!(routes.call(&mut conn).await.unwrap(), Flow::Halt);
        assert!(conn.is_halted());
        assert_eq!(conn.path_params().get("id"), Some(&Value::from("42")));
    }

    #[tokio::test]
    async fn unmatched_requests_continue() {
        let routes = Controller::new("/posts").get("/:id", echo_id()).build();

        let mut wrong_method = conn(Method::POST, "/posts/42");
        assert_eq!(routes.call(&mut wrong_method).await.unwrap(), Flow::Continue);

        let mut wrong_path = conn(Method::GET, "/posts/42/comments");
        assert_eq!(routes.call(&mut wrong_path).await.unwrap(), Flow::Continue);
        assert!(!wrong_path.is_halted());
    }

    #[tokio::test]
    async fn shared_actions_run_before_handlers() {
        let routes = Controller::new("/")
            .action(action_fn(|conn: &mut Connection| {
                conn.set_header("x-shared", "1")?;
                Ok(Flow::Continue)
            }))
            .get("/", action_fn(|conn: &mut Connection| {
                let shared = conn.header("x-shared").unwrap_or("missing").to_owned();
                conn.set_body(shared);
                Ok(Flow::Continue)
            }))
            .build();

        let mut conn = conn(Method::GET, "/");
        routes.call(&mut conn).await.unwrap();
        assert_eq!(conn.header("x-shared"), Some("1"));
    }

    #[tokio::test]
    async fn rejecting_route_falls_through_to_next_match() {
        let routes = Controller::new("/")
            .get("/:slug", action_fn(|conn: &mut Connection| Ok(conn.reject())))
            .get("/:slug", action_fn(|conn: &mut Connection| {
                conn.set_status(StatusCode::ACCEPTED);
                Ok(Flow::Continue)
            }))
            .build();

        let mut conn = conn(Method::GET, "/hello");
        assert_eq!(routes.call(&mut conn).await.unwrap(), Flow::Halt);
        assert_eq!(conn.status(), StatusCode::ACCEPTED);
        assert!(!conn.is_rejected());
    }
}
