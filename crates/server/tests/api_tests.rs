//! End-to-end tests for the guardrail REST surface: policy CRUD and
//! history, signal ingestion, termination, chain verification, and
//! evidence exports, all over an in-memory state.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use proctor_guardrail::{Clock, ManualClock};
use proctor_server::{build_router, AppState, SharedState};
use tower::ServiceExt;

const T0: i64 = 1_700_000_000_000;

fn setup() -> (Router, SharedState, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(T0));
    let state = AppState::open_in_memory(clock.clone() as Arc<dyn Clock>).unwrap();
    (build_router(state.clone()), state, clock)
}

async fn send(
    app: &Router,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
) -> (StatusCode, serde_json::Value) {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-actor", "alice");
    let request = match body {
        Some(json) => builder.body(Body::from(json.to_string())).unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

fn missing_share_signal(now_ms: i64) -> serde_json::Value {
    serde_json::json!({
        "active": false,
        "surface": "unknown",
        "timestamp": now_ms,
        "candidate_online": true,
    })
}

#[tokio::test]
async fn health_reports_ok() {
    let (app, _, _) = setup();
    let (status, json) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn sessions_can_be_created_and_listed() {
    let (app, _, _) = setup();
    let (status, json) = send(
        &app,
        "POST",
        "/api/sessions",
        Some(serde_json::json!({ "id": "sess-1", "status": "active" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["id"], "sess-1");

    let (_, listed) = send(&app, "GET", "/api/sessions", None).await;
    assert_eq!(listed["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn company_policy_defaults_until_saved() {
    let (app, _, _) = setup();
    let (status, json) = send(&app, "GET", "/api/policy/company", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["source"], "default");
    assert_eq!(json["data"]["policy"]["auto_terminate_enabled"], false);

    let mut policy = json["data"]["policy"].clone();
    policy["auto_terminate_enabled"] = serde_json::json!(true);
    let (status, saved) = send(
        &app,
        "PUT",
        "/api/policy/company",
        Some(serde_json::json!({ "policy": policy, "reason": "tighten defaults" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(saved["data"]["idempotent_replay"], false);

    let (_, current) = send(&app, "GET", "/api/policy/company", None).await;
    assert_eq!(current["data"]["source"], "saved");
    assert_eq!(current["data"]["policy"]["auto_terminate_enabled"], true);
    assert_eq!(current["data"]["updated_by"], "alice");
}

#[tokio::test]
async fn invalid_policy_is_rejected_with_bad_request() {
    let (app, _, _) = setup();
    let (_, current) = send(&app, "GET", "/api/policy/company", None).await;
    let mut policy = current["data"]["policy"].clone();
    policy["max_auto_reshare_attempts"] = serde_json::json!(0);

    let (status, json) = send(
        &app,
        "PUT",
        "/api/policy/company",
        Some(serde_json::json!({ "policy": policy })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["success"], false);
    assert_eq!(json["error_code"], "validation_error");
}

#[tokio::test]
async fn session_policy_overrides_mask_the_company_template() {
    let (app, _, _) = setup();
    let (_, current) = send(&app, "GET", "/api/policy/sess-1", None).await;
    let mut policy = current["data"]["policy"].clone();
    policy["max_auto_reshare_attempts"] = serde_json::json!(5);

    send(
        &app,
        "PUT",
        "/api/policy/sess-1",
        Some(serde_json::json!({ "policy": policy })),
    )
    .await;

    let (_, session) = send(&app, "GET", "/api/policy/sess-1", None).await;
    assert_eq!(session["data"]["source"], "saved");
    assert_eq!(session["data"]["policy"]["max_auto_reshare_attempts"], 5);

    // The company template is untouched.
    let (_, company) = send(&app, "GET", "/api/policy/company", None).await;
    assert_eq!(company["data"]["source"], "default");
}

#[tokio::test]
async fn repeated_idempotency_key_replays_without_a_new_version() {
    let (app, _, _) = setup();
    let (_, current) = send(&app, "GET", "/api/policy/company", None).await;
    let mut policy = current["data"]["policy"].clone();
    policy["enforce_fullscreen"] = serde_json::json!(true);
    let body = serde_json::json!({ "policy": policy, "idempotency_key": "req-1" });

    let (_, first) = send(&app, "PUT", "/api/policy/company", Some(body.clone())).await;
    let (_, second) = send(&app, "PUT", "/api/policy/company", Some(body)).await;
    assert_eq!(first["data"]["idempotent_replay"], false);
    assert_eq!(second["data"]["idempotent_replay"], true);
    assert_eq!(second["data"]["version_id"], first["data"]["version_id"]);

    let (_, history) = send(&app, "GET", "/api/policy/company/history", None).await;
    assert_eq!(history["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn history_carries_field_level_diffs() {
    let (app, _, clock) = setup();
    let (_, current) = send(&app, "GET", "/api/policy/company", None).await;
    let mut policy = current["data"]["policy"].clone();
    policy["auto_terminate_enabled"] = serde_json::json!(true);
    send(
        &app,
        "PUT",
        "/api/policy/company",
        Some(serde_json::json!({ "policy": policy.clone() })),
    )
    .await;

    clock.advance(1_000);
    policy["max_auto_reshare_attempts"] = serde_json::json!(7);
    send(
        &app,
        "PUT",
        "/api/policy/company",
        Some(serde_json::json!({ "policy": policy })),
    )
    .await;

    let (_, history) = send(&app, "GET", "/api/policy/company/history?limit=10", None).await;
    let entries = history["data"].as_array().unwrap();
    assert_eq!(entries.len(), 2);
    let newest_changes = entries[0]["diff"]["changes"].as_array().unwrap();
    assert_eq!(newest_changes.len(), 1);
    assert_eq!(newest_changes[0]["field"], "max_auto_reshare_attempts");
    assert_eq!(newest_changes[0]["before"], 3);
    assert_eq!(newest_changes[0]["after"], 7);
}

#[tokio::test]
async fn history_survives_an_extreme_limit_parameter() {
    let (app, _, _) = setup();
    let (_, current) = send(&app, "GET", "/api/policy/company", None).await;
    let policy = current["data"]["policy"].clone();
    send(
        &app,
        "PUT",
        "/api/policy/company",
        Some(serde_json::json!({ "policy": policy })),
    )
    .await;

    let uri = format!("/api/policy/company/history?limit={}", usize::MAX);
    let (status, history) = send(&app, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(history["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn rollback_restores_an_earlier_version() {
    let (app, _, clock) = setup();
    let (_, current) = send(&app, "GET", "/api/policy/company", None).await;
    let mut policy = current["data"]["policy"].clone();
    policy["code_sync_interval_ms"] = serde_json::json!(500);
    let (_, first) = send(
        &app,
        "PUT",
        "/api/policy/company",
        Some(serde_json::json!({ "policy": policy.clone() })),
    )
    .await;
    let first_id = first["data"]["version_id"].as_str().unwrap().to_string();

    clock.advance(1_000);
    policy["code_sync_interval_ms"] = serde_json::json!(2000);
    send(
        &app,
        "PUT",
        "/api/policy/company",
        Some(serde_json::json!({ "policy": policy })),
    )
    .await;

    clock.advance(1_000);
    let (status, rolled) = send(
        &app,
        "POST",
        "/api/policy/company/rollback",
        Some(serde_json::json!({ "version_id": first_id, "reason": "too aggressive" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rolled["data"]["rollback_from"], first_id);
    assert_eq!(rolled["data"]["policy"]["code_sync_interval_ms"], 500);
}

#[tokio::test]
async fn rollback_of_unknown_version_is_not_found() {
    let (app, _, _) = setup();
    let (status, json) = send(
        &app,
        "POST",
        "/api/policy/company/rollback",
        Some(serde_json::json!({ "version_id": "no-such-version" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json["error_code"], "not_found");
}

#[tokio::test]
async fn company_apply_reaches_sessions_without_overrides() {
    let (app, _, clock) = setup();
    for id in ["sess-1", "sess-2", "sess-3"] {
        send(
            &app,
            "POST",
            "/api/sessions",
            Some(serde_json::json!({ "id": id, "status": "active" })),
        )
        .await;
    }

    // sess-2 gets its own override first.
    let (_, current) = send(&app, "GET", "/api/policy/sess-2", None).await;
    send(
        &app,
        "PUT",
        "/api/policy/sess-2",
        Some(serde_json::json!({ "policy": current["data"]["policy"] })),
    )
    .await;
    clock.advance(1_000);

    let (_, company) = send(&app, "GET", "/api/policy/company", None).await;
    let mut policy = company["data"]["policy"].clone();
    policy["auto_terminate_enabled"] = serde_json::json!(true);

    let (status, report) = send(
        &app,
        "POST",
        "/api/policy/company/apply",
        Some(serde_json::json!({
            "policy": policy,
            "mode": "missing_only",
            "statuses": ["active"],
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["data"]["total_candidates"], 3);
    assert_eq!(report["data"]["applied"], 2);
    assert_eq!(report["data"]["skipped"], 1);

    let (_, skipped) = send(&app, "GET", "/api/policy/sess-2", None).await;
    assert_eq!(skipped["data"]["policy"]["auto_terminate_enabled"], false);
    let (_, applied) = send(&app, "GET", "/api/policy/sess-1", None).await;
    assert_eq!(applied["data"]["policy"]["auto_terminate_enabled"], true);
}

#[tokio::test]
async fn evidence_chain_policy_round_trips() {
    let (app, _, _) = setup();
    let (_, current) = send(&app, "GET", "/api/policy/company/evidence-chain", None).await;
    assert_eq!(current["data"]["policy"]["block_on_broken_chain"], true);
    assert_eq!(current["data"]["policy"]["block_on_partial_chain"], false);

    let (status, _) = send(
        &app,
        "PUT",
        "/api/policy/company/evidence-chain",
        Some(serde_json::json!({
            "policy": { "block_on_broken_chain": true, "block_on_partial_chain": true },
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, updated) = send(&app, "GET", "/api/policy/company/evidence-chain", None).await;
    assert_eq!(updated["data"]["policy"]["block_on_partial_chain"], true);
}

#[tokio::test]
async fn missing_share_signal_raises_an_alert_and_reshare() {
    let (app, _, clock) = setup();
    let (status, json) = send(
        &app,
        "POST",
        "/api/sessions/sess-1/signals",
        Some(missing_share_signal(clock.now_ms())),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["reshare_requested"], true);
    assert_eq!(json["data"]["state"], "auto_reshare_requested");
    let alerts = json["data"]["alerts"].as_array().unwrap();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0]["alert_type"], "screen_share_missing");
    assert_eq!(alerts[0]["severity"], "high");
}

#[tokio::test]
async fn room_state_reflects_the_latest_signal() {
    let (app, _, clock) = setup();
    send(
        &app,
        "POST",
        "/api/sessions/sess-1/signals",
        Some(serde_json::json!({
            "active": true,
            "surface": "monitor",
            "timestamp": clock.now_ms(),
            "monitor_count": 2,
        })),
    )
    .await;

    let (status, json) = send(&app, "GET", "/api/sessions/sess-1/room-state", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["room"]["screen_share_active"], true);
    assert_eq!(json["data"]["room"]["monitor_count"], 2);
    assert_eq!(json["data"]["state"], "healthy");
}

#[tokio::test]
async fn terminate_is_idempotent_over_http() {
    let (app, _, _) = setup();
    let (status, first) = send(
        &app,
        "POST",
        "/api/sessions/sess-1/terminate",
        Some(serde_json::json!({ "reason": "answer sharing" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["data"]["state"], "terminated");
    assert_eq!(first["data"]["already_terminated"], false);

    let (_, second) = send(
        &app,
        "POST",
        "/api/sessions/sess-1/terminate",
        Some(serde_json::json!({ "reason": "again" })),
    )
    .await;
    assert_eq!(second["data"]["already_terminated"], true);
}

#[tokio::test]
async fn operator_alerts_validate_type_and_severity() {
    let (app, _, _) = setup();
    let (status, json) = send(
        &app,
        "POST",
        "/api/sessions/sess-1/alerts",
        Some(serde_json::json!({
            "type": "manual_intervention",
            "severity": "medium",
            "message": "please face the camera",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["suppressed"], false);

    let (status, json) = send(
        &app,
        "POST",
        "/api/sessions/sess-1/alerts",
        Some(serde_json::json!({
            "type": "nonsense",
            "severity": "medium",
            "message": "x",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["success"], false);
}

#[tokio::test]
async fn chain_verification_tracks_session_activity() {
    let (app, _, _) = setup();
    let (_, empty) = send(
        &app,
        "GET",
        "/api/sessions/sess-1/evidence-chain/verify",
        None,
    )
    .await;
    assert_eq!(empty["data"]["status"], "not_initialized");

    send(
        &app,
        "POST",
        "/api/sessions/sess-1/terminate",
        Some(serde_json::json!({ "reason": "done" })),
    )
    .await;

    let (_, verified) = send(
        &app,
        "GET",
        "/api/sessions/sess-1/evidence-chain/verify",
        None,
    )
    .await;
    assert_eq!(verified["data"]["status"], "valid");
    // Manual alert + terminate alert + termination event.
    assert_eq!(verified["data"]["linked_events"], 3);
}

#[tokio::test]
async fn evidence_timeline_lists_chained_events() {
    let (app, _, _) = setup();
    send(
        &app,
        "POST",
        "/api/sessions/sess-1/terminate",
        Some(serde_json::json!({ "reason": "done" })),
    )
    .await;

    let (status, json) = send(
        &app,
        "GET",
        "/api/sessions/sess-1/evidence-timeline?limit=10",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let entries = json["data"].as_array().unwrap();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0]["action"], "session_terminated");
}

#[tokio::test]
async fn evidence_export_returns_a_summary_record() {
    let (app, _, clock) = setup();
    send(
        &app,
        "POST",
        "/api/sessions/sess-1/signals",
        Some(missing_share_signal(clock.now_ms())),
    )
    .await;

    let (status, json) = send(
        &app,
        "POST",
        "/api/sessions/sess-1/evidence-exports",
        Some(serde_json::json!({ "mode": "bundle", "files": ["timeline.json"] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["mode"], "bundle");
    assert_eq!(json["data"]["summary"]["monitor_alert_count"], 1);
    assert_eq!(json["data"]["summary"]["chain_status"], "valid");

    let (status, json) = send(
        &app,
        "POST",
        "/api/sessions/sess-1/evidence-exports",
        Some(serde_json::json!({ "mode": "paper" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["success"], false);
}
