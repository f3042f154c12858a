//! Identifiers used across exchanges.
//!
//! Exchange ids are assigned by the agent service and are opaque here.
//! Holder identifiers are generated locally, one per accepted credential,
//! so that two credentials can never be correlated through them.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Identifier assigned by the agent service to a connection or exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExchangeId(pub String);

impl ExchangeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl std::fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ExchangeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ExchangeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Holder-side identifier submitted when accepting a credential offer.
///
/// Format: `hid_` + base58 of the first 16 bytes of
/// SHA-256(exchange id || 32 random bytes || timestamp).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HolderIdentifier(pub String);

impl HolderIdentifier {
    /// Generate a fresh identifier for the given credential exchange.
    pub fn generate(exchange_id: &ExchangeId) -> Self {
        let mut nonce = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut nonce);

        let mut hasher = Sha256::new();
        hasher.update(exchange_id.0.as_bytes());
        hasher.update(nonce);
        hasher.update(crate::time::now_micros().to_be_bytes());
        let hash = hasher.finalize();

        let encoded = bs58::encode(&hash[..16]).into_string();
        Self(format!("hid_{encoded}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for HolderIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
