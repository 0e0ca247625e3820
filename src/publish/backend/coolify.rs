//! Coolify REST client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::config::RemoteApiConfig;
use crate::errors::{PublishError, PublishResult};

use super::remote::{CreateApplication, PlatformApi};
use super::{DeploymentHandle, DeploymentLog};

const CREATE_APPLICATION_PATH: &str = "/api/v1/applications/dockerfile";
const DEPLOY_PATH: &str = "/api/v1/deploy";
const DEPLOYMENTS_PATH: &str = "/api/v1/deployments";

#[derive(Debug, Deserialize)]
struct CreatedApplication {
    uuid: String,
}

/// Error payload the platform attaches to non-2xx responses.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

/// [`PlatformApi`] over HTTP with bearer-token auth.
#[derive(Clone)]
pub struct CoolifyClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl CoolifyClient {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> PublishResult<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    pub fn from_config(config: &RemoteApiConfig) -> PublishResult<Self> {
        Self::new(
            &config.base_url,
            &config.api_token,
            Duration::from_secs(config.http_timeout_secs),
        )
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Turn a non-2xx response into [`PublishError::Platform`].
    async fn check(endpoint: &str, resp: reqwest::Response) -> PublishResult<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let message = error_message(resp).await;
        Err(PublishError::Platform {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
            message,
        })
    }

    async fn decode<T: DeserializeOwned>(endpoint: &str, resp: reqwest::Response) -> PublishResult<T> {
        let status = resp.status().as_u16();
        let body = resp.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| PublishError::Platform {
            endpoint: endpoint.to_string(),
            status,
            message: format!("undecodable response: {}", e),
        })
    }
}

async fn error_message(resp: reqwest::Response) -> String {
    let text = resp.text().await.unwrap_or_default();
    serde_json::from_str::<ErrorBody>(&text)
        .ok()
        .and_then(|b| b.message)
        .unwrap_or(text)
}

#[async_trait]
impl PlatformApi for CoolifyClient {
    async fn create_application(&self, request: &CreateApplication) -> PublishResult<String> {
        let resp = self
            .http
            .post(self.url(CREATE_APPLICATION_PATH))
            .bearer_auth(&self.token)
            .json(request)
            .send()
            .await?;

        if resp.status() == StatusCode::CONFLICT {
            return Err(PublishError::DomainConflict {
                name: request.name.clone(),
                message: error_message(resp).await,
            });
        }

        let resp = Self::check(CREATE_APPLICATION_PATH, resp).await?;
        let created: CreatedApplication = Self::decode(CREATE_APPLICATION_PATH, resp).await?;
        Ok(created.uuid)
    }

    async fn update_domains(
        &self,
        app_id: &str,
        domains: &str,
        instant_deploy: bool,
    ) -> PublishResult<()> {
        let endpoint = format!("/api/v1/applications/{}", app_id);
        let resp = self
            .http
            .patch(self.url(&endpoint))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({
                "domains": domains,
                "instant_deploy": instant_deploy,
            }))
            .send()
            .await?;
        Self::check(&endpoint, resp).await?;
        Ok(())
    }

    async fn deploy(&self, app_id: &str) -> PublishResult<()> {
        let resp = self
            .http
            .get(self.url(DEPLOY_PATH))
            .bearer_auth(&self.token)
            .query(&[("uuid", app_id), ("force", "true")])
            .send()
            .await?;
        Self::check(DEPLOY_PATH, resp).await?;
        Ok(())
    }

    async fn list_deployments(&self) -> PublishResult<Vec<DeploymentHandle>> {
        let resp = self
            .http
            .get(self.url(DEPLOYMENTS_PATH))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let resp = Self::check(DEPLOYMENTS_PATH, resp).await?;
        Self::decode(DEPLOYMENTS_PATH, resp).await
    }

    async fn deployment(&self, deployment_uuid: &str) -> PublishResult<DeploymentLog> {
        let endpoint = format!("{}/{}", DEPLOYMENTS_PATH, deployment_uuid);
        let resp = self
            .http
            .get(self.url(&endpoint))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let resp = Self::check(&endpoint, resp).await?;
        Self::decode(&endpoint, resp).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use axum::extract::{Path, Query, State};
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::{get, patch, post};
    use axum::{Json, Router};
    use serde_json::{Value, json};

    use super::*;

    #[derive(Clone, Default)]
    struct Recorded {
        requests: Arc<Mutex<Vec<(String, Option<String>, Value)>>>,
        conflict: Arc<Mutex<bool>>,
    }

    impl Recorded {
        fn push(&self, what: String, headers: &HeaderMap, body: Value) {
            let auth = headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .map(String::from);
            self.requests.lock().unwrap().push((what, auth, body));
        }
    }

    async fn create(
        State(rec): State<Recorded>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> (AxumStatus, Json<Value>) {
        rec.push("create".into(), &headers, body);
        if *rec.conflict.lock().unwrap() {
            return (
                AxumStatus::CONFLICT,
                Json(json!({"message": "Domain already in use"})),
            );
        }
        (AxumStatus::CREATED, Json(json!({"uuid": "app-123"})))
    }

    async fn update(
        State(rec): State<Recorded>,
        Path(id): Path<String>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        rec.push(format!("update {}", id), &headers, body);
        Json(json!({"uuid": id}))
    }

    async fn deploy(
        State(rec): State<Recorded>,
        Query(query): Query<HashMap<String, String>>,
        headers: HeaderMap,
    ) -> Json<Value> {
        rec.push("deploy".into(), &headers, json!(query));
        Json(json!({"deployments": []}))
    }

    async fn list(State(rec): State<Recorded>, headers: HeaderMap) -> Json<Value> {
        rec.push("list".into(), &headers, Value::Null);
        Json(json!([
            {
                "deployment_uuid": "dep-1",
                "deployment_url": "/project/p/application/app-123/deployment/dep-1",
                "status": "in_progress"
            }
        ]))
    }

    async fn detail(Path(uuid): Path<String>) -> (AxumStatus, Json<Value>) {
        if uuid == "missing" {
            return (AxumStatus::NOT_FOUND, Json(json!({"message": "Deployment not found."})));
        }
        if uuid == "garbled" {
            return (AxumStatus::OK, Json(json!("not an object")));
        }
        (
            AxumStatus::OK,
            Json(json!({
                "logs": "[{\"output\":\"#5 [installer 1/2] FROM\"}]",
                "status": "finished"
            })),
        )
    }

    async fn serve(rec: Recorded) -> CoolifyClient {
        let app = Router::new()
            .route(CREATE_APPLICATION_PATH, post(create))
            .route("/api/v1/applications/{id}", patch(update))
            .route(DEPLOY_PATH, get(deploy))
            .route(DEPLOYMENTS_PATH, get(list))
            .route("/api/v1/deployments/{uuid}", get(detail))
            .with_state(rec);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        CoolifyClient::new(&format!("http://{}/", addr), "tok-1", Duration::from_secs(5)).unwrap()
    }

    fn request() -> CreateApplication {
        CreateApplication {
            name: "acme-bakery".into(),
            domains: "https://acme-bakery.sites.example.com".into(),
            server_uuid: "srv".into(),
            project_uuid: "prj".into(),
            environment_name: "production".into(),
            dockerfile: "RlJPTQ==".into(),
            instant_deploy: false,
        }
    }

    #[tokio::test]
    async fn test_create_application_sends_body_and_token() {
        let rec = Recorded::default();
        let client = serve(rec.clone()).await;

        let id = client.create_application(&request()).await.unwrap();
        assert_eq!(id, "app-123");

        let requests = rec.requests.lock().unwrap().clone();
        let (what, auth, body) = &requests[0];
        assert_eq!(what, "create");
        assert_eq!(auth.as_deref(), Some("Bearer tok-1"));
        assert_eq!(body["name"], "acme-bakery");
        assert_eq!(body["instant_deploy"], false);
        assert_eq!(body["environment_name"], "production");
    }

    #[tokio::test]
    async fn test_conflict_maps_to_domain_conflict() {
        let rec = Recorded::default();
        *rec.conflict.lock().unwrap() = true;
        let client = serve(rec).await;

        let err = client.create_application(&request()).await.unwrap_err();
        match err {
            PublishError::DomainConflict { name, message } => {
                assert_eq!(name, "acme-bakery");
                assert_eq!(message, "Domain already in use");
            }
            other => panic!("expected DomainConflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_deploy_passes_uuid_and_force() {
        let rec = Recorded::default();
        let client = serve(rec.clone()).await;

        client.deploy("app-123").await.unwrap();

        let requests = rec.requests.lock().unwrap().clone();
        let (_, _, query) = &requests[0];
        assert_eq!(query["uuid"], "app-123");
        assert_eq!(query["force"], "true");
    }

    #[tokio::test]
    async fn test_update_domains_patches_application() {
        let rec = Recorded::default();
        let client = serve(rec.clone()).await;

        client
            .update_domains("app-123", "https://shop.example.org", true)
            .await
            .unwrap();

        let requests = rec.requests.lock().unwrap().clone();
        let (what, _, body) = &requests[0];
        assert_eq!(what, "update app-123");
        assert_eq!(body["domains"], "https://shop.example.org");
        assert_eq!(body["instant_deploy"], true);
    }

    #[tokio::test]
    async fn test_list_and_fetch_deployment() {
        let client = serve(Recorded::default()).await;

        let deployments = client.list_deployments().await.unwrap();
        assert_eq!(deployments.len(), 1);
        assert_eq!(deployments[0].deployment_uuid, "dep-1");

        let log = client.deployment("dep-1").await.unwrap();
        assert!(log.is_terminal());
        assert_eq!(log.chunks(), vec!["#5 [installer 1/2] FROM".to_string()]);
    }

    #[tokio::test]
    async fn test_non_success_maps_to_platform_error() {
        let client = serve(Recorded::default()).await;

        let err = client.deployment("missing").await.unwrap_err();
        match err {
            PublishError::Platform {
                endpoint,
                status,
                message,
            } => {
                assert_eq!(endpoint, "/api/v1/deployments/missing");
                assert_eq!(status, 404);
                assert_eq!(message, "Deployment not found.");
            }
            other => panic!("expected Platform, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_undecodable_body_is_platform_error() {
        let client = serve(Recorded::default()).await;
        let err = client.deployment("garbled").await.unwrap_err();
        assert!(matches!(err, PublishError::Platform { status: 200, .. }));
    }

    #[tokio::test]
    async fn test_unreachable_platform_is_transport_error() {
        let client =
            CoolifyClient::new("http://127.0.0.1:1", "tok", Duration::from_secs(2)).unwrap();
        let err = client.deploy("app-1").await.unwrap_err();
        assert!(matches!(err, PublishError::Transport(_)));
        assert!(err.is_backend_failure());
    }
}
