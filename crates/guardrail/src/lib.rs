//! Guardrail engine layer: append-only event log, versioned policy
//! store, hash-chained evidence ledger, realtime decision engine, and
//! the chain-gated export service.

pub mod clock;
pub mod engine;
pub mod event_log;
pub mod expiring;
pub mod export;
pub mod ledger;
pub mod policy_store;
pub mod registry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{GuardrailEngine, SessionGuardState};
pub use event_log::{actions, EventLog, EventRecord};
pub use expiring::ExpiringStore;
pub use export::ExportService;
pub use ledger::{ChainVerification, Ledger, TimelineEntry};
pub use policy_store::{ApplyMode, ApplyReport, PolicyStore, SaveOutcome, SessionDirectory};
pub use registry::{InProcessRegistry, MonitorRegistry, RealtimeEvent};
