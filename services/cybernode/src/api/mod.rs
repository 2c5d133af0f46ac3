//! HTTP API orchestrators and operators use to drive the node.
//!
//! Routes:
//! - `POST /v1/instantiate`: admit and run one service instance
//! - `GET /v1/services`: deployed services
//! - `DELETE /v1/instances/{id}`: stop one instance
//! - `POST /v1/enlist`, `POST /v1/release`: join or leave provisioning
//! - `GET /healthz`: liveness

mod error;

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use cybernode_id::ServiceBeanId;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::model::{DeployedService, ServiceElement};
use crate::node::{Cybernode, InstantiationOutcome, InstantiationRequest, ProvisionEventKind};

pub use error::{ApiError, ProblemDetails};

/// Body of `POST /v1/instantiate`.
#[derive(Debug, Deserialize)]
pub struct InstantiateBody {
    #[serde(default = "default_event_kind")]
    pub event_kind: ProvisionEventKind,
    pub element: ServiceElement,
    /// Base URL of the requesting orchestrator.
    #[serde(default)]
    pub orchestrator: Option<String>,
}

fn default_event_kind() -> ProvisionEventKind {
    ProvisionEventKind::Instantiate
}

/// Body of `POST /v1/release`.
#[derive(Debug, Default, Deserialize)]
pub struct ReleaseBody {
    #[serde(default)]
    pub terminate_services: bool,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub node_id: String,
    pub services: usize,
    pub enlisted: bool,
    pub managers: usize,
}

#[derive(Debug, Serialize)]
pub struct EnlistResponse {
    pub registered: usize,
}

/// Build the API router.
pub fn router(node: Arc<Cybernode>) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/v1/instantiate", post(instantiate))
        .route("/v1/services", get(list_services))
        .route("/v1/instances/{id}", delete(terminate_instance))
        .route("/v1/enlist", post(enlist))
        .route("/v1/release", post(release))
        .layer(TraceLayer::new_for_http())
        .with_state(node)
}

async fn health(State(node): State<Arc<Cybernode>>) -> Json<HealthResponse> {
    let ctx = node.context();
    Json(HealthResponse {
        status: if ctx.is_shutting_down() {
            "shutting_down"
        } else {
            "ok"
        },
        node_id: ctx.node_id().to_string(),
        services: node.container().service_counter(),
        enlisted: node.consumer().is_enlisted(),
        managers: node.consumer().registered_count(),
    })
}

async fn instantiate(
    State(node): State<Arc<Cybernode>>,
    Json(body): Json<InstantiateBody>,
) -> Result<Json<InstantiationOutcome>, ApiError> {
    let mut request = InstantiationRequest::new(body.element);
    request.event_kind = body.event_kind;
    if let Some(url) = &body.orchestrator {
        let manager = node
            .manager_for_url(url)
            .map_err(|e| ApiError::bad_request("invalid_orchestrator", e.to_string()))?;
        request = request.from_orchestrator(manager);
    }

    let outcome = node.instantiate(request).await?;
    Ok(Json(outcome))
}

async fn list_services(State(node): State<Arc<Cybernode>>) -> Json<Vec<DeployedService>> {
    Json(node.deployed_services())
}

async fn terminate_instance(
    State(node): State<Arc<Cybernode>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let id: ServiceBeanId = id
        .parse()
        .map_err(|e| ApiError::bad_request("invalid_instance_id", format!("{e}")))?;
    if node.terminate_instance(id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(
            "instance_not_found",
            format!("no live instance {id}"),
        ))
    }
}

async fn enlist(State(node): State<Arc<Cybernode>>) -> impl IntoResponse {
    let registered = node.enlist().await;
    info!(registered, "Enlisted via API");
    Json(EnlistResponse { registered })
}

async fn release(
    State(node): State<Arc<Cybernode>>,
    body: Option<Json<ReleaseBody>>,
) -> StatusCode {
    let body = body.map(|Json(b)| b).unwrap_or_default();
    node.release(body.terminate_services).await;
    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capacity::NodeCapacity;
    use crate::config::Config;
    use crate::runtime::MockRuntime;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn node() -> Arc<Cybernode> {
        Cybernode::with_static_capacity(
            Config::default(),
            NodeCapacity::default(),
            Arc::new(MockRuntime::new()),
        )
        .await
        .unwrap()
    }

    async fn post_json(router: Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let response = router
            .oneshot(
                Request::post(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn element_json(planned: u32) -> Value {
        json!({
            "name": "cart",
            "opstring_name": "shop",
            "planned": planned,
            "provision_type": "dynamic"
        })
    }

    #[tokio::test]
    async fn test_instantiate_then_not_needed() {
        let node = node().await;
        let router = router(Arc::clone(&node));

        let (status, body) = post_json(
            router.clone(),
            "/v1/instantiate",
            json!({ "element": element_json(1) }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "deployed");
        assert_eq!(body["instance"]["instance_id"], 0);

        let (status, body) = post_json(
            router,
            "/v1/instantiate",
            json!({ "element": element_json(1) }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "not_needed");
    }

    #[tokio::test]
    async fn test_unknown_event_is_problem_json() {
        let node = node().await;
        let (status, body) = post_json(
            router(node),
            "/v1/instantiate",
            json!({ "event_kind": "update", "element": element_json(1) }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "unknown_event");
        assert_eq!(body["retryable"], false);
    }

    #[tokio::test]
    async fn test_terminate_unknown_instance() {
        let node = node().await;
        let response = router(node)
            .oneshot(
                Request::delete(format!("/v1/instances/{}", ServiceBeanId::new()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
