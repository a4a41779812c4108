//! HTTP handlers for the guardrail REST surface.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};

use proctor_core::{
    AlertType, EvidenceChainPolicy, ExportMode, GuardrailError, MonitorPolicy, PolicyScope,
    ScreenShareSignal, Severity,
};
use proctor_guardrail::{ApplyMode, GuardrailEngine};

use crate::SharedState;

// ============================================================================
// Response envelope
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
            error_code: None,
        })
    }

    fn err(msg: &str) -> Json<Self> {
        Json(Self {
            success: false,
            data: None,
            error: Some(msg.to_string()),
            error_code: None,
        })
    }
}

type JsonResult = (StatusCode, Json<ApiResponse<serde_json::Value>>);

fn ok(data: impl Serialize) -> JsonResult {
    (
        StatusCode::OK,
        ApiResponse::ok(serde_json::to_value(data).unwrap_or(serde_json::Value::Null)),
    )
}

fn fail(err: GuardrailError) -> JsonResult {
    let status = match &err {
        GuardrailError::Validation(_) => StatusCode::BAD_REQUEST,
        GuardrailError::NotFound(_) => StatusCode::NOT_FOUND,
        GuardrailError::Permission(_) => StatusCode::FORBIDDEN,
        GuardrailError::RaceConflict(_) => StatusCode::CONFLICT,
        GuardrailError::ChainIntegrity { .. } => StatusCode::CONFLICT,
        GuardrailError::Transport(_) => StatusCode::BAD_GATEWAY,
        GuardrailError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ApiResponse {
            success: false,
            data: None,
            error: Some(err.to_string()),
            error_code: Some(err.code().to_string()),
        }),
    )
}

fn bad_request(msg: &str) -> JsonResult {
    (StatusCode::BAD_REQUEST, ApiResponse::err(msg))
}

fn actor_from(headers: &HeaderMap) -> String {
    headers
        .get("x-actor")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("operator")
        .to_string()
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

// ============================================================================
// Policy endpoints
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SavePolicyRequest {
    pub policy: MonitorPolicy,
    pub reason: Option<String>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RollbackRequest {
    pub version_id: String,
    pub reason: Option<String>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CompanyApplyRequest {
    /// Defaults to the current company template when omitted
    pub policy: Option<MonitorPolicy>,
    pub mode: ApplyMode,
    pub statuses: Vec<String>,
    pub limit: Option<usize>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Deserialize)]
pub struct SaveChainPolicyRequest {
    pub policy: EvidenceChainPolicy,
    pub reason: Option<String>,
    pub idempotency_key: Option<String>,
}

pub async fn get_policy(
    State(state): State<SharedState>,
    Path(scope): Path<String>,
) -> impl IntoResponse {
    let scope = parse_scope(&scope);
    match state.monitor_policies.current(&scope) {
        Ok(current) => ok(current),
        Err(e) => fail(e),
    }
}

pub async fn put_policy(
    State(state): State<SharedState>,
    Path(scope): Path<String>,
    headers: HeaderMap,
    Json(req): Json<SavePolicyRequest>,
) -> impl IntoResponse {
    let scope = parse_scope(&scope);
    let actor = actor_from(&headers);
    match state.monitor_policies.save(
        &scope,
        req.policy,
        req.reason,
        req.idempotency_key,
        &actor,
    ) {
        Ok(outcome) => ok(serde_json::json!({
            "policy": outcome.version.policy,
            "reason": outcome.version.reason,
            "saved_at": outcome.version.created_at,
            "version_id": outcome.version.id,
            "idempotent_replay": outcome.idempotent_replay,
        })),
        Err(e) => fail(e),
    }
}

pub async fn policy_history(
    State(state): State<SharedState>,
    Path(scope): Path<String>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    let scope = parse_scope(&scope);
    match state
        .monitor_policies
        .history(&scope, query.limit.unwrap_or(20))
    {
        Ok(entries) => ok(entries),
        Err(e) => fail(e),
    }
}

pub async fn policy_rollback(
    State(state): State<SharedState>,
    Path(scope): Path<String>,
    headers: HeaderMap,
    Json(req): Json<RollbackRequest>,
) -> impl IntoResponse {
    let scope = parse_scope(&scope);
    let actor = actor_from(&headers);
    match state.monitor_policies.rollback(
        &scope,
        &req.version_id,
        req.reason,
        req.idempotency_key,
        &actor,
    ) {
        Ok(outcome) => ok(serde_json::json!({
            "policy": outcome.version.policy,
            "version_id": outcome.version.id,
            "rollback_from": outcome.version.rollback_from,
            "idempotent_replay": outcome.idempotent_replay,
        })),
        Err(e) => fail(e),
    }
}

pub async fn company_apply(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<CompanyApplyRequest>,
) -> impl IntoResponse {
    let actor = actor_from(&headers);
    let policy = match req.policy {
        Some(policy) => policy,
        None => match state.monitor_policies.current(&PolicyScope::CompanyDefault) {
            Ok(current) => current.policy,
            Err(e) => return fail(e),
        },
    };

    match state.monitor_policies.apply_to_sessions(
        state.db.as_ref(),
        policy,
        &req.statuses,
        req.mode,
        req.limit.unwrap_or(200),
        req.dry_run,
        &actor,
    ) {
        Ok(report) => ok(report),
        Err(e) => fail(e),
    }
}

pub async fn get_chain_policy(State(state): State<SharedState>) -> impl IntoResponse {
    match state.chain_policies.current(&PolicyScope::CompanyDefault) {
        Ok(current) => ok(current),
        Err(e) => fail(e),
    }
}

pub async fn put_chain_policy(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(req): Json<SaveChainPolicyRequest>,
) -> impl IntoResponse {
    let actor = actor_from(&headers);
    match state.chain_policies.save(
        &PolicyScope::CompanyDefault,
        req.policy,
        req.reason,
        req.idempotency_key,
        &actor,
    ) {
        Ok(outcome) => ok(serde_json::json!({
            "policy": outcome.version.policy,
            "saved_at": outcome.version.created_at,
            "idempotent_replay": outcome.idempotent_replay,
        })),
        Err(e) => fail(e),
    }
}

fn parse_scope(raw: &str) -> PolicyScope {
    if raw == "company" {
        PolicyScope::CompanyDefault
    } else {
        PolicyScope::Session(raw.to_string())
    }
}

// ============================================================================
// Session endpoints
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub id: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TerminateRequest {
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateAlertRequest {
    #[serde(rename = "type")]
    pub alert_type: String,
    pub severity: String,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct ExportRequest {
    pub mode: String,
    pub files: Option<Vec<String>>,
}

pub async fn create_session(
    State(state): State<SharedState>,
    Json(req): Json<CreateSessionRequest>,
) -> impl IntoResponse {
    let id = req
        .id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let status = req.status.unwrap_or_else(|| "active".to_string());
    match state.db.create_session(&id, &status) {
        Ok(record) => ok(record),
        Err(e) => fail(GuardrailError::Storage(e.to_string())),
    }
}

pub async fn list_sessions(State(state): State<SharedState>) -> impl IntoResponse {
    match state.db.list_sessions() {
        Ok(records) => ok(records),
        Err(e) => fail(GuardrailError::Storage(e.to_string())),
    }
}

pub async fn ingest_signal(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(signal): Json<ScreenShareSignal>,
) -> impl IntoResponse {
    let mut engines = state.engines.write().await;
    let engine = entry_engine(&state, &mut engines, &id);
    match engine.handle_signal(&signal) {
        Ok(outcome) => ok(serde_json::json!({
            "state": outcome.state,
            "alerts": outcome.alerts,
            "reshare_requested": outcome.reshare_requested,
            "room": engine.room_state(),
        })),
        Err(e) => fail(e),
    }
}

pub async fn room_state(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let mut engines = state.engines.write().await;
    let engine = entry_engine(&state, &mut engines, &id);
    engine.broadcast_room_state();
    ok(serde_json::json!({
        "room": engine.room_state(),
        "state": engine.state(),
    }))
}

pub async fn terminate_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<TerminateRequest>,
) -> impl IntoResponse {
    let actor = actor_from(&headers);
    let mut engines = state.engines.write().await;
    let engine = entry_engine(&state, &mut engines, &id);
    match engine.manual_terminate(&req.reason, &actor) {
        Ok(alert) => ok(serde_json::json!({
            "state": engine.state(),
            "alert": alert,
            "already_terminated": alert.is_none(),
        })),
        Err(e) => fail(e),
    }
}

pub async fn create_alert(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<CreateAlertRequest>,
) -> impl IntoResponse {
    let Some(alert_type) = AlertType::from_str(&req.alert_type) else {
        return bad_request(&format!("unknown alert type: {}", req.alert_type));
    };
    let Some(severity) = Severity::from_str(&req.severity) else {
        return bad_request(&format!("unknown severity: {}", req.severity));
    };

    let mut engines = state.engines.write().await;
    let engine = entry_engine(&state, &mut engines, &id);
    let alert = engine.operator_alert(
        alert_type,
        severity,
        &req.message,
        req.metadata.unwrap_or(serde_json::Value::Null),
    );
    ok(serde_json::json!({
        "alert": alert,
        "suppressed": alert.is_none(),
    }))
}

pub async fn verify_chain(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    match state.ledger.verify(&id, query.limit) {
        Ok(result) => ok(result),
        Err(e) => fail(e),
    }
}

pub async fn create_export(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<ExportRequest>,
) -> impl IntoResponse {
    let Some(mode) = ExportMode::from_str(&req.mode) else {
        return bad_request(&format!("unknown export mode: {}", req.mode));
    };
    let actor = actor_from(&headers);
    match state
        .exports
        .build_export(&id, mode, req.files.unwrap_or_default(), &actor)
    {
        Ok(record) => ok(record),
        Err(e) => fail(e),
    }
}

pub async fn evidence_timeline(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> impl IntoResponse {
    match state.ledger.timeline(&id, query.limit.unwrap_or(100)) {
        Ok(entries) => ok(entries),
        Err(e) => fail(e),
    }
}

pub async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

fn entry_engine<'a>(
    state: &SharedState,
    engines: &'a mut std::collections::HashMap<String, GuardrailEngine>,
    session_id: &str,
) -> &'a mut GuardrailEngine {
    engines.entry(session_id.to_string()).or_insert_with(|| {
        GuardrailEngine::new(
            session_id,
            state.monitor_policies.clone(),
            state.ledger.clone(),
            state.registry.clone(),
            state.clock.clone(),
        )
    })
}
