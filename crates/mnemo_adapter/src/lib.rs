#![forbid(unsafe_code)]

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use mnemo_engines::slo::BreakerSnapshot;
use mnemo_kernel_contracts::audit::{AuditReceipt, ChainVerification, LedgerExport, LedgerHead};
use mnemo_kernel_contracts::keys::JwkSet;
use mnemo_kernel_contracts::operations::{
    DistillRequest, DistillResponse, ExportResponse, FilterRequest, ForgetResponse,
    KeyRotationResponse, RecallResponse, RotateMasterKeyRequest, RotateSigningKeyRequest,
    StoreRequest, StoreResponse,
};
use mnemo_kernel_contracts::{GovernanceError, PublicErrorCode};
use mnemo_os::governance::{
    chain_integrity_error, DecodedBody, GovernanceRuntime, RequestEnvelope,
};
use serde::Serialize;

pub const TRACE_ID_HEADER: &str = "x-trace-id";

pub type SharedRuntime = Arc<GovernanceRuntime>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub ledger_height: u64,
}

/// Carries a governance error out through axum with the mapped status.
#[derive(Debug)]
pub struct ApiError(pub GovernanceError);

impl From<GovernanceError> for ApiError {
    fn from(err: GovernanceError) -> Self {
        Self(err)
    }
}

/// Serde messages can quote submitted values, so only the rejection kind is reported.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        let reason = match rejection {
            JsonRejection::JsonDataError(_) => "request body does not match the expected shape",
            JsonRejection::JsonSyntaxError(_) => "request body is not valid json",
            JsonRejection::MissingJsonContentType(_) => "expected content-type application/json",
            _ => "request body could not be read",
        };
        Self(GovernanceError::validation(reason))
    }
}

pub fn status_for(code: PublicErrorCode) -> StatusCode {
    match code {
        PublicErrorCode::ValidationFailure => StatusCode::BAD_REQUEST,
        PublicErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        PublicErrorCode::Forbidden => StatusCode::FORBIDDEN,
        PublicErrorCode::NotFound => StatusCode::NOT_FOUND,
        PublicErrorCode::Conflict => StatusCode::CONFLICT,
        PublicErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        PublicErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let code = self.0.public_code();
        let status = status_for(code);
        let retry_after_ms = match &self.0 {
            GovernanceError::ServiceUnavailable { retry_after_ms, .. } => Some(*retry_after_ms),
            _ => None,
        };
        if status.is_server_error() && code != PublicErrorCode::ServiceUnavailable {
            tracing::error!(target: "mnemo.http", error = code.as_str(), "request failed");
        }
        let body = ErrorBody {
            error: code.as_str(),
            message: self.0.to_string(),
            retry_after_ms,
        };
        let mut response = (status, Json(body)).into_response();
        if let Some(ms) = retry_after_ms {
            let secs = ms.div_ceil(1_000).max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }
        response
    }
}

/// `Authorization: Bearer <token>`, scheme matched case-insensitively.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = raw.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

pub fn trace_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(TRACE_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Decode failures ride along to the runtime, which reports them only once
/// the caller has been admitted.
fn decoded<T>(body: Result<Json<T>, JsonRejection>) -> DecodedBody<T> {
    body.map(|Json(request)| request)
        .map_err(|rejection| ApiError::from(rejection).0)
}

fn request_envelope(tier: String, headers: &HeaderMap) -> RequestEnvelope {
    RequestEnvelope {
        bearer: bearer_token(headers),
        tier,
        trace_id: trace_id(headers),
    }
}

pub fn router(runtime: SharedRuntime) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/.well-known/jwks.json", get(jwks))
        .route("/metrics", get(metrics))
        .route("/v1/memory/:tier/store", post(store))
        .route("/v1/memory/:tier/recall", post(recall))
        .route("/v1/memory/:tier/forget", post(forget))
        .route("/v1/memory/:tier/export", post(export))
        .route("/v1/memory/:tier/distill", post(distill))
        .route("/v1/audit/head", get(audit_head))
        .route("/v1/audit/verify", get(audit_verify))
        .route("/v1/audit/export", get(audit_export))
        .route("/v1/audit/receipts/:event_id", get(audit_receipt))
        .route("/v1/audit/verify-receipt", post(verify_receipt))
        .route("/v1/admin/keys/signing/rotate", post(rotate_signing_key))
        .route("/v1/admin/keys/master/rotate", post(rotate_master_key))
        .route("/v1/breakers/:operation", get(breaker))
        .with_state(runtime)
}

pub async fn healthz(State(rt): State<SharedRuntime>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        ledger_height: rt.ledger_height(),
    })
}

pub async fn jwks(State(rt): State<SharedRuntime>) -> Json<JwkSet> {
    Json(rt.jwks())
}

pub async fn metrics(State(rt): State<SharedRuntime>) -> Response {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        rt.metrics(),
    )
        .into_response()
}

pub async fn store(
    State(rt): State<SharedRuntime>,
    Path(tier): Path<String>,
    headers: HeaderMap,
    body: Result<Json<StoreRequest>, JsonRejection>,
) -> Result<Json<StoreResponse>, ApiError> {
    let envelope = request_envelope(tier, &headers);
    Ok(Json(rt.store_body(&envelope, decoded(body)).await?))
}

pub async fn recall(
    State(rt): State<SharedRuntime>,
    Path(tier): Path<String>,
    headers: HeaderMap,
    body: Result<Json<FilterRequest>, JsonRejection>,
) -> Result<Json<RecallResponse>, ApiError> {
    let envelope = request_envelope(tier, &headers);
    Ok(Json(rt.recall_body(&envelope, decoded(body)).await?))
}

pub async fn forget(
    State(rt): State<SharedRuntime>,
    Path(tier): Path<String>,
    headers: HeaderMap,
    body: Result<Json<FilterRequest>, JsonRejection>,
) -> Result<Json<ForgetResponse>, ApiError> {
    let envelope = request_envelope(tier, &headers);
    Ok(Json(rt.forget_body(&envelope, decoded(body)).await?))
}

pub async fn export(
    State(rt): State<SharedRuntime>,
    Path(tier): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ExportResponse>, ApiError> {
    let envelope = request_envelope(tier, &headers);
    Ok(Json(rt.export(&envelope).await?))
}

pub async fn distill(
    State(rt): State<SharedRuntime>,
    Path(tier): Path<String>,
    headers: HeaderMap,
    body: Result<Json<DistillRequest>, JsonRejection>,
) -> Result<Json<DistillResponse>, ApiError> {
    let envelope = request_envelope(tier, &headers);
    Ok(Json(rt.distill_body(&envelope, decoded(body)).await?))
}

pub async fn audit_head(State(rt): State<SharedRuntime>) -> Json<LedgerHead> {
    Json(rt.ledger_head())
}

/// Admin-only. 200 with the verification when the chain holds, 500 naming the
/// broken index otherwise.
pub async fn audit_verify(
    State(rt): State<SharedRuntime>,
    headers: HeaderMap,
) -> Result<Json<ChainVerification>, ApiError> {
    let verification = rt.verify_ledger_as_admin(bearer_token(&headers).as_deref())?;
    match chain_integrity_error(&verification) {
        Some(err) => Err(err.into()),
        None => Ok(Json(verification)),
    }
}

pub async fn audit_export(
    State(rt): State<SharedRuntime>,
    headers: HeaderMap,
) -> Result<Json<LedgerExport>, ApiError> {
    Ok(Json(rt.export_ledger(bearer_token(&headers).as_deref())?))
}

pub async fn audit_receipt(
    State(rt): State<SharedRuntime>,
    Path(event_id): Path<String>,
) -> Result<Json<AuditReceipt>, ApiError> {
    Ok(Json(rt.receipt(&event_id)?))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReceiptVerification {
    pub valid: bool,
}

pub async fn verify_receipt(
    State(rt): State<SharedRuntime>,
    body: Result<Json<AuditReceipt>, JsonRejection>,
) -> Result<Json<ReceiptVerification>, ApiError> {
    let Json(receipt) = body?;
    rt.verify_receipt(&receipt)?;
    Ok(Json(ReceiptVerification { valid: true }))
}

pub async fn rotate_signing_key(
    State(rt): State<SharedRuntime>,
    headers: HeaderMap,
    body: Result<Json<RotateSigningKeyRequest>, JsonRejection>,
) -> Result<Json<KeyRotationResponse>, ApiError> {
    let bearer = bearer_token(&headers);
    rt.require_admin(bearer.as_deref())?;
    let Json(request) = body?;
    Ok(Json(rt.rotate_signing_key(bearer.as_deref(), request).await?))
}

pub async fn rotate_master_key(
    State(rt): State<SharedRuntime>,
    headers: HeaderMap,
    body: Result<Json<RotateMasterKeyRequest>, JsonRejection>,
) -> Result<Json<KeyRotationResponse>, ApiError> {
    let bearer = bearer_token(&headers);
    rt.require_admin(bearer.as_deref())?;
    let Json(request) = body?;
    Ok(Json(rt.rotate_master_key(bearer.as_deref(), request).await?))
}

pub async fn breaker(
    State(rt): State<SharedRuntime>,
    Path(operation): Path<String>,
) -> Json<BreakerSnapshot> {
    Json(rt.breaker(&operation))
}
