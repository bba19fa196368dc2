//! HTTP API over the [`Engine`].
//!
//! Callers identify themselves with an `x-user-id` header; authentication
//! happens in front of this service. Presigned artifact links are served
//! from `/objects` so the filesystem store works without a separate CDN.

use std::net::{IpAddr, SocketAddr};

use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts, Path, Query, State},
    http::{header, request::Parts, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use lectern_shared::types::{DeviceId, JobId, JobPriority, MaterialId, Platform, UserId};
use lectern_store::Device;

use crate::audit::Actor;
use crate::error::OfflineError;
use crate::license::{IssueOutcome, JobView, License};
use crate::Engine;

#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/devices", get(list_devices).post(register_device))
        .route("/devices/:id", delete(revoke_device))
        .route("/licenses", post(issue_license))
        .route("/licenses/validate", post(validate_license))
        .route("/licenses/renew", post(renew_license))
        .route("/licenses/rotate", post(rotate_key))
        .route("/jobs/:id", get(job_status))
        .route("/objects/:bucket/*key", get(download_object))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─── Caller identity ───

#[async_trait]
impl<S: Send + Sync> FromRequestParts<S> for Actor {
    type Rejection = OfflineError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user_id = parts
            .headers
            .get("x-user-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<UserId>().ok())
            .ok_or_else(|| OfflineError::InvalidRequest("missing or invalid x-user-id header".into()))?;

        let user_agent = parts
            .headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        Ok(Actor {
            user_id,
            ip_address: extract_client_ip(parts).map(|ip| ip.to_string()),
            user_agent,
        })
    }
}

/// Socket peer first, then the usual proxy headers.
fn extract_client_ip(parts: &Parts) -> Option<IpAddr> {
    if let Some(connect_info) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
        return Some(connect_info.0.ip());
    }
    forwarded_ip(&parts.headers)
}

fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    if let Some(forwarded) = headers.get("x-forwarded-for") {
        if let Ok(value) = forwarded.to_str() {
            if let Some(first) = value.split(',').next() {
                if let Ok(ip) = first.trim().parse::<IpAddr>() {
                    return Some(ip);
                }
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip") {
        if let Ok(value) = real_ip.to_str() {
            if let Ok(ip) = value.trim().parse::<IpAddr>() {
                return Some(ip);
            }
        }
    }

    None
}

// ─── Request / response bodies ───

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Deserialize)]
struct RegisterDeviceRequest {
    fingerprint: String,
    name: String,
    platform: Platform,
}

#[derive(Serialize)]
struct RevokeResponse {
    revoked: bool,
}

#[derive(Deserialize)]
struct LicenseRequest {
    material_id: MaterialId,
    device_id: DeviceId,
    /// 1 (high) to 3 (low); defaults to normal.
    #[serde(default)]
    priority: Option<JobPriority>,
}

#[derive(Deserialize)]
struct PresignedQuery {
    expires: Option<i64>,
    signature: Option<String>,
}

// ─── Handlers ───

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn list_devices(
    State(state): State<AppState>,
    actor: Actor,
) -> Result<Json<Vec<Device>>, OfflineError> {
    Ok(Json(state.engine.devices.list(&actor)?))
}

async fn register_device(
    State(state): State<AppState>,
    actor: Actor,
    Json(req): Json<RegisterDeviceRequest>,
) -> Result<(StatusCode, Json<Device>), OfflineError> {
    let device = state
        .engine
        .devices
        .register(&actor, &req.fingerprint, &req.name, req.platform)?;
    Ok((StatusCode::CREATED, Json(device)))
}

async fn revoke_device(
    State(state): State<AppState>,
    actor: Actor,
    Path(device_id): Path<DeviceId>,
) -> Result<Json<RevokeResponse>, OfflineError> {
    state.engine.devices.revoke(&actor, device_id)?;
    Ok(Json(RevokeResponse { revoked: true }))
}

async fn issue_license(
    State(state): State<AppState>,
    actor: Actor,
    Json(req): Json<LicenseRequest>,
) -> Result<Json<IssueOutcome>, OfflineError> {
    let priority = req.priority.unwrap_or(JobPriority::Normal);
    let outcome = state
        .engine
        .licenses
        .issue_or_get_cek_with_priority(&actor, req.material_id, req.device_id, priority)
        .await?;
    Ok(Json(outcome))
}

async fn validate_license(
    State(state): State<AppState>,
    actor: Actor,
    Json(req): Json<LicenseRequest>,
) -> Result<Json<License>, OfflineError> {
    let license = state
        .engine
        .licenses
        .validate_license(&actor, req.material_id, req.device_id)
        .await?;
    Ok(Json(license))
}

async fn renew_license(
    State(state): State<AppState>,
    actor: Actor,
    Json(req): Json<LicenseRequest>,
) -> Result<Json<License>, OfflineError> {
    let license = state
        .engine
        .licenses
        .renew_license(&actor, req.material_id, req.device_id)
        .await?;
    Ok(Json(license))
}

async fn rotate_key(
    State(state): State<AppState>,
    actor: Actor,
    Json(req): Json<LicenseRequest>,
) -> Result<Json<IssueOutcome>, OfflineError> {
    let outcome = state
        .engine
        .licenses
        .rotate_key(&actor, req.material_id, req.device_id)
        .await?;
    Ok(Json(outcome))
}

async fn job_status(
    State(state): State<AppState>,
    actor: Actor,
    Path(job_id): Path<JobId>,
) -> Result<Json<JobView>, OfflineError> {
    Ok(Json(state.engine.licenses.get_job_status(&actor, job_id)?))
}

/// Serve an object behind a presigned link. Anything without a valid,
/// unexpired signature is a plain 403.
async fn download_object(
    State(state): State<AppState>,
    Path((bucket, key)): Path<(String, String)>,
    Query(query): Query<PresignedQuery>,
) -> Result<Response, OfflineError> {
    let key = key.trim_start_matches('/');
    let storage = &state.engine.storage;

    let (Some(expires), Some(signature)) = (query.expires, query.signature.as_deref()) else {
        return Ok(StatusCode::FORBIDDEN.into_response());
    };
    if !storage.verify_presigned_get(&bucket, key, expires, signature) {
        warn!(%bucket, key, "Rejected presigned download");
        return Ok(StatusCode::FORBIDDEN.into_response());
    }

    let data = match storage.get_object(&bucket, key).await {
        Ok(data) => data,
        Err(e) if e.is_not_found() => return Ok(StatusCode::NOT_FOUND.into_response()),
        Err(e) => return Err(e.into()),
    };
    let content_type = if key.ends_with(".json") {
        "application/json"
    } else {
        "application/octet-stream"
    };
    Ok(([(header::CONTENT_TYPE, content_type)], data).into_response())
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::jobs::JobOutcome;
    use crate::test_support::{harness, Harness};

    fn router(h: &Harness) -> Router {
        build_router(AppState {
            engine: h.engine.clone(),
        })
    }

    async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
        let resp = app.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let value = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap_or(Value::Null)
        };
        (status, value)
    }

    fn post_json(uri: &str, user: UserId, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("x-user-id", user.to_string())
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_as(uri: &str, user: UserId) -> Request<Body> {
        Request::get(uri)
            .header("x-user-id", user.to_string())
            .body(Body::empty())
            .unwrap()
    }

    async fn register(app: &Router, user: UserId, fingerprint: char) -> DeviceId {
        let (status, body) = send(
            app,
            post_json(
                "/devices",
                user,
                json!({
                    "fingerprint": fingerprint.to_string().repeat(40),
                    "name": "Reader",
                    "platform": "ios",
                }),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        body["id"].as_str().unwrap().parse().unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let h = harness().await;
        let app = router(&h);
        let (status, body) = send(&app, Request::get("/health").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_missing_user_header_is_rejected() {
        let h = harness().await;
        let app = router(&h);
        let (status, body) = send(&app, Request::get("/devices").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "INVALID_REQUEST");
        assert_eq!(body["error"]["kind"], "validation");
    }

    #[tokio::test]
    async fn test_device_lifecycle() {
        let h = harness().await;
        let app = router(&h);
        let user = UserId::new();
        let device = register(&app, user, 'x').await;

        let (status, body) = send(&app, get_as("/devices", user)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let duplicate = post_json(
            "/devices",
            user,
            json!({ "fingerprint": "x".repeat(40), "name": "Again", "platform": "ios" }),
        );
        let (status, body) = send(&app, duplicate).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "DUPLICATE_DEVICE");

        let revoke = Request::delete(format!("/devices/{device}"))
            .header("x-user-id", user.to_string())
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&app, revoke).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["revoked"], true);

        let (_, body) = send(&app, get_as("/devices", user)).await;
        assert!(body[0]["revoked_at"].is_string());
    }

    #[tokio::test]
    async fn test_license_flow_and_download() {
        let h = harness().await;
        let app = router(&h);
        let user = UserId::new();
        let device = register(&app, user, 'y').await;
        let material = MaterialId::new();
        h.put_source(material, b"%PDF-1.7 lecture").await;

        let request = json!({ "material_id": material, "device_id": device, "priority": 1 });
        let (status, body) = send(&app, post_json("/licenses", user, request.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["artifact_ready"], false);
        assert!(body.get("download_url").is_none());
        let job_id = body["job_id"].as_str().unwrap().to_string();

        let (status, body) = send(&app, get_as(&format!("/jobs/{job_id}"), user)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "pending");
        assert_eq!(body["priority"], 1);

        let (status, _) = send(&app, get_as(&format!("/jobs/{job_id}"), UserId::new())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        assert!(matches!(
            h.engine.worker.run_once().await.unwrap(),
            Some(JobOutcome::Completed(_))
        ));

        let (status, body) = send(&app, post_json("/licenses", user, request)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["artifact_ready"], true);
        let url = body["download_url"].as_str().unwrap();
        let path = url.strip_prefix("http://localhost").unwrap();

        let resp = app
            .clone()
            .oneshot(Request::get(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let artifact = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert!(!artifact.is_empty());

        // A tampered signature is refused.
        let forged = format!("{}0", path);
        let resp = app
            .clone()
            .oneshot(Request::get(forged).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let unsigned = path.split('?').next().unwrap();
        let resp = app
            .clone()
            .oneshot(Request::get(unsigned).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_validate_and_revoked_device() {
        let h = harness().await;
        let app = router(&h);
        let user = UserId::new();
        let device = register(&app, user, 'z').await;
        let material = MaterialId::new();
        let request = json!({ "material_id": material, "device_id": device });

        let (status, body) = send(&app, post_json("/licenses/validate", user, request.clone())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "NO_LICENSE");

        send(&app, post_json("/licenses", user, request.clone())).await;
        let (status, body) = send(&app, post_json("/licenses/validate", user, request.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["key_version"], 1);
        assert!(body["expires_at"].is_string());
        assert!(body["offline_until"].is_string());

        let (status, body) = send(&app, post_json("/licenses/renew", user, request.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["key_version"], 1);

        let (status, body) = send(&app, post_json("/licenses/rotate", user, request.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["cek"]["key_version"], 2);

        h.engine.devices.revoke(&Actor::user(user), device).unwrap();
        let (status, body) = send(&app, post_json("/licenses", user, request)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"]["code"], "DEVICE_NOT_ACTIVE");
        assert_eq!(body["error"]["kind"], "security");
    }

    #[tokio::test]
    async fn test_actor_carries_forwarded_ip() {
        let h = harness().await;
        let app = router(&h);
        let user = UserId::new();
        let req = Request::post("/devices")
            .header("x-user-id", user.to_string())
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .header(header::USER_AGENT, "lectern-ios/2.1")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({ "fingerprint": "f".repeat(32), "name": "Pad", "platform": "ios" }).to_string(),
            ))
            .unwrap();
        let (status, _) = send(&app, req).await;
        assert_eq!(status, StatusCode::CREATED);

        let entries = h
            .engine
            .db()
            .call(|db| db.list_audit_for_user(user, 10))
            .unwrap();
        assert_eq!(entries[0].ip_address.as_deref(), Some("203.0.113.7"));
        assert_eq!(entries[0].user_agent.as_deref(), Some("lectern-ios/2.1"));
    }
}
