pub mod alert;
pub mod canonical;
pub mod chain;
pub mod error;
pub mod export;
pub mod policy;
pub mod room;
pub mod version;

pub use alert::{AlertType, MonitorAlert, Severity};
pub use canonical::canonical_json;
pub use chain::{ChainStatus, EvidenceChainLink};
pub use error::GuardrailError;
pub use export::{EvidenceExportRecord, ExportMode, ExportSummary};
pub use policy::{EvidenceChainPolicy, MonitorPolicy, PolicyDiff};
pub use room::{RoomState, ScreenShareSignal, ScreenSurface};
pub use version::{CurrentPolicy, PolicyScope, PolicySource, PolicyVersion, VersionSource};
