//! The demo application: posts with comments, pushed live to sockets.
//!
//! | Route | Description |
//! |-------|-------------|
//! | `GET /posts` | Every post with its comments |
//! | `POST /posts` | Create a post (`title`, `body`) |
//! | `POST /posts/:id/comments` | Comment on a post (`body`) |
//! | `GET /realtime/token` | A fresh socket id and its signed token |
//! | `POST /realtime/subscribe` | Push post changes to the socket (`token`) |

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use trellis_core::config::EnvironmentConfig;
use trellis_core::controller::Controller;
use trellis_core::environment::EnvironmentBuilder;
use trellis_core::signing::MessageVerifier;
use trellis_core::value::{FieldType, Value};
use trellis_core::verifier::{Field, Validation, Verifier};
use trellis_core::{Action, Application, Connection, Flow, PipelineObject};
use trellis_data::{Lookup, SourceDefinition, Subscribers};
use trellis_realtime::handler::subscribe_socket;
use trellis_realtime::{RealtimeServer, behavior, issue_token};

/// Channel post changes are pushed on.
const POSTS_CHANNEL: &str = "posts";

fn definitions() -> [SourceDefinition; 2] {
    [
        SourceDefinition::new("posts")
            .primary_id()
            .timestamps()
            .attribute("title", FieldType::String)
            .attribute("body", FieldType::String)
            .has_many("comments"),
        SourceDefinition::new("comments")
            .primary_id()
            .timestamps()
            .attribute("body", FieldType::String),
    ]
}

/// Build the demo application.
pub fn application(
    env: &EnvironmentBuilder,
    subscribers: Arc<Subscribers>,
    realtime: Arc<RealtimeServer>,
) -> anyhow::Result<Application> {
    let lookup = Lookup::with_definitions(definitions(), Arc::clone(&subscribers))?;
    let verifier = socket_verifier(env.config());

    let routes = Controller::new("/")
        .get("/posts", ListPosts { lookup: lookup.clone() })
        .post(
            "/posts",
            CreatePost {
                lookup: lookup.clone(),
                verifier: Verifier::new()
                    .field(Field::required("title").typed(FieldType::String).validate(Validation::Presence))
                    .field(Field::optional("body").typed(FieldType::String)),
            },
        )
        .post(
            "/posts/:id/comments",
            CreateComment {
                lookup: lookup.clone(),
                verifier: Verifier::new()
                    .field(Field::required("body").typed(FieldType::String).validate(Validation::Presence)),
            },
        )
        .get("/realtime/token", IssueToken { verifier: verifier.clone() })
        .post(
            "/realtime/subscribe",
            SubscribePosts {
                lookup,
                server: Arc::clone(&realtime),
                verifier,
            },
        )
        .build();

    let shutdown_subscribers = Arc::clone(&subscribers);
    Ok(env
        .application("demo")
        .behavior(|app| behavior::install(app, realtime, Some(subscribers)))
        .behavior(|app| {
            app.on_shutdown(move || async move {
                if let Err(error) = shutdown_subscribers.shutdown().await {
                    tracing::warn!(error = %error, "subscription engine shutdown failed");
                }
            });
        })
        .action(routes)
        .build())
}

fn socket_verifier(config: &EnvironmentConfig) -> MessageVerifier {
    MessageVerifier::new(&config.secret)
}

fn respond_json(conn: &mut Connection, status: StatusCode, body: &serde_json::Value) -> anyhow::Result<()> {
    conn.set_status(status);
    conn.set_header("content-type", "application/json")?;
    conn.set_body(body.to_string());
    Ok(())
}

fn respond_invalid(conn: &mut Connection, messages: &BTreeMap<String, Vec<String>>) -> anyhow::Result<()> {
    let body = serde_json::json!({ "errors": messages });
    respond_json(conn, StatusCode::UNPROCESSABLE_ENTITY, &body)
}

struct ListPosts {
    lookup: Lookup,
}

#[async_trait]
impl Action<Connection> for ListPosts {
    async fn call(&self, conn: &mut Connection) -> anyhow::Result<Flow> {
        let posts = self.lookup.source("posts")?.including("comments")?.to_a().await?;
        respond_json(conn, StatusCode::OK, &serde_json::to_value(&posts)?)?;
        Ok(Flow::Continue)
    }

    fn name(&self) -> &str {
        "list_posts"
    }
}

struct CreatePost {
    lookup: Lookup,
    verifier: Verifier,
}

#[async_trait]
impl Action<Connection> for CreatePost {
    async fn call(&self, conn: &mut Connection) -> anyhow::Result<Flow> {
        let verification = self.verifier.call(&conn.params());
        if !verification.is_verified() {
            respond_invalid(conn, verification.messages())?;
            return Ok(conn.halt());
        }

        let created = self.lookup.source("posts")?.create(verification.into_values()).await?;
        respond_json(conn, StatusCode::CREATED, &serde_json::to_value(&created)?)?;
        Ok(Flow::Continue)
    }

    fn name(&self) -> &str {
        "create_post"
    }
}

struct CreateComment {
    lookup: Lookup,
    verifier: Verifier,
}

#[async_trait]
impl Action<Connection> for CreateComment {
    async fn call(&self, conn: &mut Connection) -> anyhow::Result<Flow> {
        let Some(post_id) = conn
            .param("id")
            .cloned()
            .and_then(|id| FieldType::Integer.coerce(id).ok())
        else {
            return Ok(conn.reject());
        };
        let posts = self.lookup.source("posts")?.query("by_id", vec![post_id.clone()])?;
        if posts.count().await? == 0 {
            return Ok(conn.reject());
        }

        let verification = self.verifier.call(&conn.params());
        if !verification.is_verified() {
            respond_invalid(conn, verification.messages())?;
            return Ok(conn.halt());
        }

        let mut values = verification.into_values();
        values.insert("post_id".to_owned(), post_id);
        let created = self.lookup.source("comments")?.create(values).await?;
        respond_json(conn, StatusCode::CREATED, &serde_json::to_value(&created)?)?;
        Ok(Flow::Continue)
    }

    fn name(&self) -> &str {
        "create_comment"
    }
}

struct IssueToken {
    verifier: MessageVerifier,
}

#[async_trait]
impl Action<Connection> for IssueToken {
    async fn call(&self, conn: &mut Connection) -> anyhow::Result<Flow> {
        let (id, token) = issue_token(&self.verifier);
        respond_json(conn, StatusCode::OK, &serde_json::json!({ "id": id, "token": token }))?;
        Ok(Flow::Continue)
    }

    fn name(&self) -> &str {
        "issue_token"
    }
}

struct SubscribePosts {
    lookup: Lookup,
    server: Arc<RealtimeServer>,
    verifier: MessageVerifier,
}

#[async_trait]
impl Action<Connection> for SubscribePosts {
    async fn call(&self, conn: &mut Connection) -> anyhow::Result<Flow> {
        let socket_id = conn
            .param("token")
            .and_then(Value::as_str)
            .and_then(|token| self.verifier.verify(token).ok());
        let Some(socket_id) = socket_id else {
            conn.set_status(StatusCode::FORBIDDEN);
            conn.set_body(trellis_realtime::upgrader::FORBIDDEN_BODY);
            return Ok(conn.halt());
        };

        let posts = self.lookup.source("posts")?.including("comments")?;
        let key = subscribe_socket(&posts, &self.server, &socket_id, POSTS_CHANNEL).await?;
        respond_json(
            conn,
            StatusCode::OK,
            &serde_json::json!({ "channel": POSTS_CHANNEL, "subscription": key.as_str() }),
        )?;
        Ok(Flow::Continue)
    }

    fn name(&self) -> &str {
        "subscribe_posts"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;
    use trellis_core::config::RealtimeTimeouts;
    use trellis_realtime::adapter::MemoryChannelAdapter;

    use super::*;

    fn router() -> axum::Router {
        let builder = trellis_core::Environment::builder(EnvironmentConfig::default());
        let realtime = RealtimeServer::new(Arc::new(MemoryChannelAdapter::new()), RealtimeTimeouts::default());
        let app = application(&builder, Arc::new(Subscribers::memory()), realtime).unwrap();
        let env = builder.mount(app).unwrap().build();
        trellis_server::build_router(Arc::new(env))
    }

    async fn json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_json(uri: &str, body: &serde_json::Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn posts_and_comments_round_trip() {
        let router = router();

        let created = router
            .clone()
            .oneshot(post_json("/posts", &serde_json::json!({"title": "hello"})))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);
        let id = json(created).await[0]["id"].as_i64().unwrap();

        let comment = router
            .clone()
            .oneshot(post_json(&format!("/posts/{id}/comments"), &serde_json::json!({"body": "first"})))
            .await
            .unwrap();
        assert_eq!(comment.status(), StatusCode::CREATED);

        let listed = router
            .oneshot(Request::get("/posts").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let posts = json(listed).await;
        assert_eq!(posts[0]["title"], "hello");
        assert_eq!(posts[0]["comments"][0]["body"], "first");
    }

    #[tokio::test]
    async fn invalid_posts_are_unprocessable() {
        let response = router()
            .oneshot(post_json("/posts", &serde_json::json!({"title": "  "})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json(response).await["errors"]["title"][0], "cannot be blank");
    }

    #[tokio::test]
    async fn comments_on_missing_posts_are_not_found() {
        let response = router()
            .oneshot(post_json("/posts/99/comments", &serde_json::json!({"body": "lost"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
