//! Guardrail HTTP server.
//!
//! Wires the session registry, policy stores, evidence ledger, export
//! service, and per-session guardrail engines behind an axum router.
//! Engines are created lazily per session and live for the process.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use proctor_core::{EvidenceChainPolicy, GuardrailError, MonitorPolicy};
use proctor_guardrail::{
    Clock, EventLog, ExportService, GuardrailEngine, InProcessRegistry, Ledger, PolicyStore,
    SystemClock,
};

pub mod api;
pub mod db;

pub use db::{Database, SessionRecord};

pub struct AppState {
    pub db: Arc<Database>,
    pub log: Arc<EventLog>,
    pub ledger: Arc<Ledger>,
    pub monitor_policies: Arc<PolicyStore<MonitorPolicy>>,
    pub chain_policies: Arc<PolicyStore<EvidenceChainPolicy>>,
    pub exports: ExportService,
    pub registry: Arc<InProcessRegistry>,
    pub engines: tokio::sync::RwLock<HashMap<String, GuardrailEngine>>,
    pub clock: Arc<dyn Clock>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// File-backed state: `sessions.db` and `integrity_log.db` under
    /// `data_dir`.
    pub fn open(data_dir: &Path) -> Result<SharedState, GuardrailError> {
        let db = Database::open(&data_dir.join("sessions.db"))
            .map_err(|e| GuardrailError::Storage(e.to_string()))?;
        let log = EventLog::open(&data_dir.join("integrity_log.db"))?;
        Ok(Self::assemble(db, log, Arc::new(SystemClock)))
    }

    /// In-memory state for tests.
    pub fn open_in_memory(clock: Arc<dyn Clock>) -> Result<SharedState, GuardrailError> {
        let db = Database::open_in_memory().map_err(|e| GuardrailError::Storage(e.to_string()))?;
        let log = EventLog::open_in_memory()?;
        Ok(Self::assemble(db, log, clock))
    }

    fn assemble(db: Database, log: EventLog, clock: Arc<dyn Clock>) -> SharedState {
        let log = Arc::new(log);
        let registry = Arc::new(InProcessRegistry::new());
        let ledger = Arc::new(Ledger::new(log.clone(), clock.clone()));
        let monitor_policies = Arc::new(PolicyStore::new(
            log.clone(),
            ledger.clone(),
            registry.clone(),
            clock.clone(),
        ));
        let chain_policies = Arc::new(PolicyStore::new(
            log.clone(),
            ledger.clone(),
            registry.clone(),
            clock.clone(),
        ));
        let exports = ExportService::new(
            log.clone(),
            ledger.clone(),
            chain_policies.clone(),
            registry.clone(),
            clock.clone(),
        );

        Arc::new(AppState {
            db: Arc::new(db),
            log,
            ledger,
            monitor_policies,
            chain_policies,
            exports,
            registry,
            engines: tokio::sync::RwLock::new(HashMap::new()),
            clock,
        })
    }
}

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/api/sessions", get(api::list_sessions).post(api::create_session))
        .route("/api/policy/company/apply", post(api::company_apply))
        .route(
            "/api/policy/company/evidence-chain",
            get(api::get_chain_policy).put(api::put_chain_policy),
        )
        .route("/api/policy/:scope", get(api::get_policy).put(api::put_policy))
        .route("/api/policy/:scope/history", get(api::policy_history))
        .route("/api/policy/:scope/rollback", post(api::policy_rollback))
        .route("/api/sessions/:id/signals", post(api::ingest_signal))
        .route("/api/sessions/:id/room-state", get(api::room_state))
        .route("/api/sessions/:id/terminate", post(api::terminate_session))
        .route("/api/sessions/:id/alerts", post(api::create_alert))
        .route(
            "/api/sessions/:id/evidence-chain/verify",
            get(api::verify_chain),
        )
        .route(
            "/api/sessions/:id/evidence-exports",
            post(api::create_export),
        )
        .route(
            "/api/sessions/:id/evidence-timeline",
            get(api::evidence_timeline),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}
