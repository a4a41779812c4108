//! Append-only policy versioning records.
//!
//! A scope's versions form a strictly time-ordered sequence; "current" is
//! always the newest entry. Rollback never rewrites history: it appends a
//! fresh version carrying an older payload with `rollback_from` set.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The unit a versioned policy applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PolicyScope {
    /// Shared company-wide template
    CompanyDefault,
    /// Per-session override (masks the company default once any explicit
    /// save exists for the session, even if later reset to default values)
    Session(String),
}

impl PolicyScope {
    /// Stable storage key: `company` or `session:<id>`.
    pub fn storage_key(&self) -> String {
        match self {
            Self::CompanyDefault => "company".to_string(),
            Self::Session(id) => format!("session:{}", id),
        }
    }

    pub fn parse(s: &str) -> Self {
        match s.strip_prefix("session:") {
            Some(id) => Self::Session(id.to_string()),
            None => Self::CompanyDefault,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Session(id) => Some(id),
            Self::CompanyDefault => None,
        }
    }
}

/// How a version came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionSource {
    Manual,
    Rollback,
    CompanyApplyBulk,
    CompanyApplyOverwrite,
}

impl VersionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Rollback => "rollback",
            Self::CompanyApplyBulk => "company_apply_bulk",
            Self::CompanyApplyOverwrite => "company_apply_overwrite",
        }
    }
}

/// One immutable entry in a scope's policy history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyVersion<P> {
    pub id: String,
    pub policy: P,
    pub source: VersionSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback_from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

impl<P> PolicyVersion<P> {
    pub fn new(policy: P, source: VersionSource, created_by: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            policy,
            source,
            reason: None,
            rollback_from: None,
            idempotency_key: None,
            created_by: created_by.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Whether a resolved policy came from a saved version or the frozen default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicySource {
    Saved,
    Default,
}

/// Resolved "current policy" view for a scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentPolicy<P> {
    pub policy: P,
    pub source: PolicySource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_storage_key_round_trips() {
        let company = PolicyScope::CompanyDefault;
        let session = PolicyScope::Session("sess-42".to_string());

        assert_eq!(PolicyScope::parse(&company.storage_key()), company);
        assert_eq!(PolicyScope::parse(&session.storage_key()), session);
        assert_eq!(session.session_id(), Some("sess-42"));
    }

    #[test]
    fn version_source_strings_are_stable() {
        assert_eq!(VersionSource::CompanyApplyBulk.as_str(), "company_apply_bulk");
        assert_eq!(VersionSource::Rollback.as_str(), "rollback");
    }
}
