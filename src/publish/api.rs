use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;

use crate::errors::PublishError;

use super::orchestrator::PublishOrchestrator;

/// Header carrying the shared secret.
pub const AUTH_HEADER: &str = "x-auth-key";

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orchestrator: PublishOrchestrator,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    #[serde(rename = "userId")]
    pub user_id: String,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    Unauthenticated,
    NotFound,
    BadRequest,
    BadGateway(String),
    Internal,
}

impl From<PublishError> for ApiError {
    fn from(err: PublishError) -> Self {
        match err {
            PublishError::Unauthenticated => ApiError::Unauthenticated,
            PublishError::ProjectNotFound { .. } => ApiError::NotFound,
            e if e.is_backend_failure() => {
                tracing::error!(error = %e, "deployment backend failed");
                ApiError::BadGateway(e.to_string())
            }
            e => {
                tracing::error!(error = ?e, "publish failed");
                ApiError::Internal
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthenticated => (StatusCode::UNAUTHORIZED, "Unauthenticated.".to_string()),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "Not found.".to_string()),
            ApiError::BadRequest => (StatusCode::BAD_REQUEST, "Invalid request body.".to_string()),
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error.".to_string(),
            ),
        };
        (status, Json(serde_json::json!({ "message": message }))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/", get(hello))
        .route("/api/publish/{project_id}", post(publish))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn hello() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "hello": "world." }))
}

/// Authentication is checked before the body is looked at, so an
/// unauthenticated caller always gets 401 whatever it sent.
async fn publish(
    State(state): State<SharedState>,
    Path(project_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<serde_json::Value>, ApiError> {
    let auth_key = headers.get(AUTH_HEADER).and_then(|v| v.to_str().ok());
    state.orchestrator.authenticate(auth_key)?;

    let request: PublishRequest = serde_json::from_slice(&body).map_err(|e| {
        tracing::debug!(project_id = %project_id, error = %e, "rejecting publish body");
        ApiError::BadRequest
    })?;

    let accepted = state
        .orchestrator
        .publish(auth_key, &project_id, &request.user_id)
        .await?;
    tracing::info!(
        project_id = %accepted.project_id,
        target_id = ?accepted.target_id,
        total_steps = accepted.total_steps,
        "publish accepted"
    );

    Ok(Json(serde_json::json!({ "message": "Success." })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::config::{AppBuildConfig, PollingConfig, RemoteApiConfig};
    use crate::publish::backend::remote::testing::FakePlatform;
    use crate::publish::backend::{DeploymentBackend, RemoteApiBackend};
    use crate::publish::models::sample_project;
    use crate::publish::store::SqliteProjectStore;

    const TOKEN: &str = "secret-token";

    async fn test_app(platform: Arc<FakePlatform>) -> (Router, Arc<SqliteProjectStore>) {
        let store = SqliteProjectStore::in_memory().unwrap();
        store.upsert_project(&sample_project("p1", "u1")).await.unwrap();
        let store = Arc::new(store);

        let app = AppBuildConfig {
            main_host_domain: "sites.example.com".into(),
            base_image: "base:latest".into(),
            ..AppBuildConfig::default()
        };
        let backend = DeploymentBackend::Remote(RemoteApiBackend::new(
            platform,
            app,
            &RemoteApiConfig::default(),
        ));
        let orchestrator =
            PublishOrchestrator::new(store.clone(), backend, TOKEN, &PollingConfig::default());
        let state = Arc::new(AppState { orchestrator });
        (api_router().with_state(state), store)
    }

    async fn body_json(body: Body) -> serde_json::Value {
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn publish_request(key: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/api/publish/p1")
            .header("content-type", "application/json");
        if let Some(key) = key {
            builder = builder.header("X-Auth-Key", key);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn test_hello() {
        let (app, _) = test_app(Arc::new(FakePlatform::default())).await;
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response.into_body()).await,
            serde_json::json!({"hello": "world."})
        );
    }

    #[tokio::test]
    async fn test_publish_success() {
        let platform = Arc::new(FakePlatform::default());
        let (app, store) = test_app(platform.clone()).await;

        let response = app
            .oneshot(publish_request(Some(TOKEN), r#"{"userId":"u1"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response.into_body()).await,
            serde_json::json!({"message": "Success."})
        );

        assert_eq!(platform.count("create"), 1);
        assert_eq!(platform.count("deploy"), 1);
        let saved = store.get_project("p1").await.unwrap().unwrap();
        assert_eq!(saved.deployment_target_id, "app-uuid-1");
        assert_eq!(saved.build_total_step, 12);
    }

    #[tokio::test]
    async fn test_publish_missing_key() {
        let platform = Arc::new(FakePlatform::default());
        let (app, _) = test_app(platform.clone()).await;

        let response = app
            .oneshot(publish_request(None, r#"{"userId":"u1"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            body_json(response.into_body()).await,
            serde_json::json!({"message": "Unauthenticated."})
        );
        assert!(platform.calls().is_empty());
    }

    #[tokio::test]
    async fn test_publish_auth_checked_before_body() {
        let (app, _) = test_app(Arc::new(FakePlatform::default())).await;
        let response = app
            .oneshot(publish_request(Some("wrong"), "not json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_publish_invalid_body() {
        let platform = Arc::new(FakePlatform::default());
        let (app, _) = test_app(platform.clone()).await;

        let response = app
            .oneshot(publish_request(Some(TOKEN), r#"{"user":"u1"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response.into_body()).await,
            serde_json::json!({"message": "Invalid request body."})
        );
        assert!(platform.calls().is_empty());
    }

    #[tokio::test]
    async fn test_publish_wrong_owner() {
        let platform = Arc::new(FakePlatform::default());
        let (app, _) = test_app(platform.clone()).await;

        let response = app
            .oneshot(publish_request(Some(TOKEN), r#"{"userId":"u2"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            body_json(response.into_body()).await,
            serde_json::json!({"message": "Not found."})
        );
        assert!(platform.calls().is_empty());
    }

    #[tokio::test]
    async fn test_publish_backend_failure_is_bad_gateway() {
        let platform = Arc::new(FakePlatform::default());
        *platform.fail_create_with.lock().unwrap() = Some(422);
        let (app, _) = test_app(platform).await;

        let response = app
            .oneshot(publish_request(Some(TOKEN), r#"{"userId":"u1"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response.into_body()).await;
        assert!(body["message"].as_str().unwrap().contains("422"));
    }

    #[test]
    fn test_persistence_error_hides_details() {
        let err: ApiError = PublishError::persistence(anyhow::anyhow!("password=hunter2")).into();
        assert!(matches!(err, ApiError::Internal));
    }
}
