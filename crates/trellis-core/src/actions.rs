//! Framework actions shipped with every environment.

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::http::header::LOCATION;

use crate::config::NormalizerConfig;
use crate::connection::Connection;
use crate::dispatch::NOT_FOUND_BODY;
use crate::pipeline::{Action, Flow, PipelineObject};

/// Redirects requests to the canonical host and path with a 301.
#[derive(Debug, Clone, Copy, Default)]
pub struct Normalizer {
    config: NormalizerConfig,
}

impl Normalizer {
    /// A normalizer applying `config`.
    pub const fn new(config: NormalizerConfig) -> Self {
        Self { config }
    }

    /// Where `conn` should be redirected, if anywhere.
    pub fn location(&self, conn: &Connection) -> Option<String> {
        let NormalizerConfig {
            strict_path,
            strict_www,
            require_www,
        } = self.config;

        let authority = conn.authority();
        let www = conn.subdomain() == Some("www");

        if strict_www && require_www && !www {
            let authority = authority?;
            let subdomain = conn.host().is_some_and(|host| host.matches('.').count() > 1);
            if !subdomain {
                return Some(format!("//www.{authority}{}", conn.fullpath()));
            }
        } else if strict_www && !require_www && www {
            let bare = authority?.split_once('.').map(|(_, rest)| rest)?;
            return Some(format!("//{bare}{}", conn.fullpath()));
        }

        if strict_path && needs_path_normalization(conn.path()) {
            let path = normalize_path(conn.path());
            return Some(match conn.fullpath().split_once('?') {
                Some((_, query)) => format!("{path}?{query}"),
                None => path,
            });
        }

        None
    }
}

#[async_trait]
impl Action<Connection> for Normalizer {
    async fn call(&self, conn: &mut Connection) -> anyhow::Result<Flow> {
        let Some(location) = self.location(conn) else {
            return Ok(Flow::Continue);
        };

        conn.set_status(StatusCode::MOVED_PERMANENTLY);
        conn.set_header(LOCATION.as_str(), &location)?;
        Ok(conn.halt())
    }

    fn name(&self) -> &str {
        "normalizer"
    }
}

fn needs_path_normalization(path: &str) -> bool {
    path.contains("//") || (path.len() > 1 && path.ends_with('/'))
}

/// Collapse repeated slashes and drop the trailing slash.
pub fn normalize_path(path: &str) -> String {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

/// Answers 404 and halts. Registered last so it only runs when nothing
/// else claimed the request.
#[derive(Debug, Clone, Copy, Default)]
pub struct RespondMissing;

#[async_trait]
impl Action<Connection> for RespondMissing {
    async fn call(&self, conn: &mut Connection) -> anyhow::Result<Flow> {
        conn.set_status(StatusCode::NOT_FOUND);
        conn.set_body(NOT_FOUND_BODY);
        Ok(conn.halt())
    }

    fn name(&self) -> &str {
        "respond_missing"
    }
}
