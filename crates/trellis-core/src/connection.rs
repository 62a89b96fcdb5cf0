//! Per-request state carried through the pipeline.
//!
//! A [`Connection`] is created by the transport for every inbound request,
//! mutated by each action it passes through, and turned back into an HTTP
//! response once the environment is done with it. Response status, headers
//! and body are buffered on the connection, so actions may keep changing
//! headers until the last one runs.

use std::fmt;

use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::header::{CONTENT_TYPE, HOST};
use axum::http::{Extensions, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::Response;
use tracing::Span;
use uuid::Uuid;

use crate::error::CoreError;
use crate::pipeline::{PipelineObject, PipelineState};
use crate::value::{Value, Values};

/// Largest request body read into memory when decoding params.
pub const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// One inbound request/response cycle.
pub struct Connection {
    state: PipelineState,
    id: Uuid,
    method: Method,
    uri: Uri,
    request_headers: HeaderMap,
    request_body: Bytes,
    query_params: Values,
    body_params: Values,
    path_params: Values,
    status: StatusCode,
    response_headers: HeaderMap,
    body: Body,
    error: Option<anyhow::Error>,
    span: Span,
    extensions: Extensions,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("status", &self.status)
            .field("halted", &self.is_halted())
            .field("rejected", &self.is_rejected())
            .field("error", &self.error.as_ref().map(ToString::to_string))
            .finish_non_exhaustive()
    }
}

impl PipelineObject for Connection {
    fn pipeline_state(&self) -> &PipelineState {
        &self.state
    }

    fn pipeline_state_mut(&mut self) -> &mut PipelineState {
        &mut self.state
    }
}

impl Connection {
    /// Create a connection for `method` and `uri` with no headers or body.
    pub fn new(method: Method, uri: Uri) -> Self {
        let id = Uuid::new_v4();
        let span = tracing::info_span!(
            "request",
            id = %id,
            method = %method,
            path = uri.path(),
        );
        let query_params = uri.query().map(parse_form).unwrap_or_default();

        Self {
            state: PipelineState::default(),
            id,
            method,
            uri,
            request_headers: HeaderMap::new(),
            request_body: Bytes::new(),
            query_params,
            body_params: Values::new(),
            path_params: Values::new(),
            status: StatusCode::OK,
            response_headers: HeaderMap::new(),
            body: Body::empty(),
            error: None,
            span,
            extensions: Extensions::new(),
        }
    }

    /// Start building a connection by hand (tests, internal requests).
    pub fn builder(method: Method, uri: &str) -> ConnectionBuilder {
        ConnectionBuilder {
            method,
            uri: uri.to_owned(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Build a connection from an inbound request, reading and decoding the
    /// body params.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Body`] if the body cannot be read and
    /// [`CoreError::Json`] if a JSON body does not parse.
    pub async fn from_request(request: Request) -> Result<Self, CoreError> {
        let (parts, body) = request.into_parts();
        let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
            .await
            .map_err(|e| CoreError::Body(e.to_string()))?;

        let mut connection = Self::new(parts.method, parts.uri);
        connection.request_headers = parts.headers;
        connection.attach_body(bytes)?;
        Ok(connection)
    }

    fn attach_body(&mut self, bytes: Bytes) -> Result<(), CoreError> {
        let media_type = self
            .request_header(CONTENT_TYPE.as_str())
            .and_then(|ct| ct.split(';').next())
            .map(|ct| ct.trim().to_ascii_lowercase());

        self.body_params = match media_type.as_deref() {
            Some("application/json") if !bytes.is_empty() => {
                match Value::from(serde_json::from_slice::<serde_json::Value>(&bytes)?) {
                    Value::Map(map) => map,
                    _ => Values::new(),
                }
            }
            Some("application/x-www-form-urlencoded") => {
                parse_form(&String::from_utf8_lossy(&bytes))
            }
            _ => Values::new(),
        };
        self.request_body = bytes;
        Ok(())
    }

    // =========================================================================
    // Request
    // =========================================================================

    /// Unique id for this request, used in logs.
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// The request method.
    pub const fn method(&self) -> &Method {
        &self.method
    }

    /// The request path, without the query string.
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    /// Path plus query string, as received.
    pub fn fullpath(&self) -> &str {
        self.uri
            .path_and_query()
            .map_or_else(|| self.uri.path(), |pq| pq.as_str())
    }

    /// The authority (`host[:port]`), from the URI or the `Host` header.
    pub fn authority(&self) -> Option<&str> {
        self.uri
            .authority()
            .map(|a| a.as_str())
            .or_else(|| self.request_header(HOST.as_str()))
    }

    /// The host name without the port.
    pub fn host(&self) -> Option<&str> {
        self.authority()
            .map(|authority| authority.split(':').next().unwrap_or(authority))
    }

    /// The left-most label of the host when the host has more than two.
    pub fn subdomain(&self) -> Option<&str> {
        let host = self.host()?;
        let mut labels = host.split('.');
        let first = labels.next()?;
        (labels.count() >= 2).then_some(first)
    }

    /// Request headers (case-insensitive).
    pub const fn request_headers(&self) -> &HeaderMap {
        &self.request_headers
    }

    /// A request header as text, if present and valid UTF-8.
    pub fn request_header(&self, name: &str) -> Option<&str> {
        self.request_headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// The raw request body.
    pub const fn request_body(&self) -> &Bytes {
        &self.request_body
    }

    /// Params from the query string.
    pub const fn query_params(&self) -> &Values {
        &self.query_params
    }

    /// Params decoded from the request body.
    pub const fn body_params(&self) -> &Values {
        &self.body_params
    }

    /// Params captured from the matched route path.
    pub const fn path_params(&self) -> &Values {
        &self.path_params
    }

    /// Record a captured path param.
    pub fn set_path_param(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.path_params.insert(name.into(), value.into());
    }

    /// All params merged. Body params win over query params; path params win
    /// over both.
    pub fn params(&self) -> Values {
        let mut merged = self.query_params.clone();
        merged.extend(self.body_params.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged.extend(self.path_params.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    /// Look up a single param with the same precedence as [`Self::params`].
    pub fn param(&self, name: &str) -> Option<&Value> {
        self.path_params
            .get(name)
            .or_else(|| self.body_params.get(name))
            .or_else(|| self.query_params.get(name))
    }

    // =========================================================================
    // Response
    // =========================================================================

    /// The response status (200 until changed).
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Set the response status.
    pub const fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    /// Set (replace) a response header.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Header`] if the name or value is not a legal
    /// header.
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<(), CoreError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| CoreError::Header(format!("{name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| CoreError::Header(format!("{name}: {e}")))?;
        self.response_headers.insert(name, value);
        Ok(())
    }

    /// A response header as text.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.response_headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Response headers set so far.
    pub const fn response_headers(&self) -> &HeaderMap {
        &self.response_headers
    }

    /// Replace the entire response body.
    pub fn set_body(&mut self, body: impl Into<Body>) {
        self.body = body.into();
    }

    // =========================================================================
    // Error slot, logging, extensions
    // =========================================================================

    /// Record the error that ended this request. Only the first call has an
    /// effect; returns whether the error was stored.
    pub fn set_error(&mut self, error: anyhow::Error) -> bool {
        if self.error.is_some() {
            return false;
        }
        self.error = Some(error);
        true
    }

    /// The error recorded for this request, if any.
    pub const fn error(&self) -> Option<&anyhow::Error> {
        self.error.as_ref()
    }

    /// The request span. Log through it so messages carry the request id.
    pub const fn logger(&self) -> &Span {
        &self.span
    }

    /// Typed values attached to the connection by actions.
    pub const fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    /// Mutable access to the typed values.
    pub const fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Finish the request, producing the buffered response.
    pub fn into_response(self) -> Response {
        let mut response = Response::new(self.body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.response_headers;
        response
    }
}

/// Hand-built connections.
#[derive(Debug)]
pub struct ConnectionBuilder {
    method: Method,
    uri: String,
    headers: HeaderMap,
    body: Bytes,
}

impl ConnectionBuilder {
    /// Add a request header. Invalid headers are ignored.
    #[must_use]
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    /// Use `json` as a JSON request body.
    #[must_use]
    pub fn json(mut self, json: &serde_json::Value) -> Self {
        self.body = Bytes::from(json.to_string());
        self.header(CONTENT_TYPE.as_str(), "application/json")
    }

    /// Use `form` as a urlencoded request body.
    #[must_use]
    pub fn form(mut self, form: &str) -> Self {
        self.body = Bytes::from(form.to_owned());
        self.header(CONTENT_TYPE.as_str(), "application/x-www-form-urlencoded")
    }

    /// Finish the connection.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Body`] for an unparseable URI and
    /// [`CoreError::Json`] for a malformed JSON body.
    pub fn build(self) -> Result<Connection, CoreError> {
        let uri: Uri = self
            .uri
            .parse()
            .map_err(|e| CoreError::Body(format!("invalid uri {}: {e}", self.uri)))?;
        let mut connection = Connection::new(self.method, uri);
        connection.request_headers = self.headers;
        connection.attach_body(self.body)?;
        Ok(connection)
    }
}

fn parse_form(input: &str) -> Values {
    url::form_urlencoded::parse(input.as_bytes())
        .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
        .collect()
}
