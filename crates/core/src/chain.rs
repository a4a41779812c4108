//! Evidence chain links and hash computation.
//!
//! One link per integrity-relevant event (alert, policy change,
//! termination, export). Links form a per-session singly-linked hash
//! chain: `hash = sha256(prev_hash || event_digest)` over the
//! lowercase-hex string concatenation. The first link's `prev_hash` is a
//! fixed genesis value so verification never special-cases an empty
//! predecessor.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::canonical::canonical_json;

/// Hash algorithm identifier recorded alongside exports.
pub const HASH_ALGORITHM: &str = "sha256";

const GENESIS_SEED: &[u8] = b"evidence-chain-genesis";

/// Genesis `prev_hash` for the first link of every session chain.
pub fn genesis_hash() -> String {
    sha256_hex(GENESIS_SEED)
}

/// Lowercase hex SHA-256 of raw bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Digest of an event payload over its canonical JSON form.
pub fn event_digest<T: Serialize>(event: &T) -> String {
    sha256_hex(canonical_json(event).as_bytes())
}

/// Combine a predecessor hash with an event digest into a link hash.
pub fn link_hash(prev_hash: &str, event_digest: &str) -> String {
    sha256_hex(format!("{}{}", prev_hash, event_digest).as_bytes())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceChainLink {
    pub event_id: String,
    pub prev_hash: String,
    pub event_digest: String,
    pub hash: String,
    pub sequence: u64,
}

impl EvidenceChainLink {
    /// Build the successor link for `event_digest` after `prev`, or the
    /// genesis link when `prev` is None.
    pub fn next(prev: Option<&EvidenceChainLink>, event_id: &str, event_digest: &str) -> Self {
        let (prev_hash, sequence) = match prev {
            Some(link) => (link.hash.clone(), link.sequence + 1),
            None => (genesis_hash(), 1),
        };
        let hash = link_hash(&prev_hash, event_digest);
        Self {
            event_id: event_id.to_string(),
            prev_hash,
            event_digest: event_digest.to_string(),
            hash,
            sequence,
        }
    }

    /// Does this link's stored hash recompute from its stored inputs?
    pub fn recomputes(&self) -> bool {
        link_hash(&self.prev_hash, &self.event_digest) == self.hash
    }
}

/// Outcome of verifying a session's chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    /// Zero links exist yet
    NotInitialized,
    /// All checked links recompute and the chain is unbroken
    Valid,
    /// Links verify but expected events are missing from the chain
    Partial,
    /// A stored hash fails to recompute or a prev_hash mismatch was found
    Broken,
}

impl ChainStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotInitialized => "not_initialized",
            Self::Valid => "valid",
            Self::Partial => "partial",
            Self::Broken => "broken",
        }
    }
}
