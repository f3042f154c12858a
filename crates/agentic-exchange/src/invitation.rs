//! Invitation artifacts.
//!
//! An invitation is an opaque, encoded payload that bootstraps a
//! connection. Agents hand them out as URLs with the JSON invitation
//! base64url-encoded in a `c_i` or `oob` query parameter; some hand out the
//! bare base64 string or the raw JSON instead. All three are accepted.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{ExchangeError, Result};

/// Query parameters that may carry an encoded invitation.
const INVITATION_PARAMS: [&str; 2] = ["c_i", "oob"];

/// The invitation exactly as produced by the inviter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InvitationArtifact(pub String);

impl InvitationArtifact {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode the artifact into its JSON invitation.
    ///
    /// # Errors
    ///
    /// Returns `ExchangeError::Validation` if the artifact is empty, carries
    /// no decodable payload, or the payload is not a JSON object.
    pub fn decode(&self) -> Result<DecodedInvitation> {
        let raw = self.0.trim();
        if raw.is_empty() {
            return Err(ExchangeError::Validation("invitation is empty".into()));
        }

        let value = if raw.starts_with('{') {
            serde_json::from_str::<serde_json::Value>(raw)
                .map_err(|e| ExchangeError::Validation(format!("invitation JSON: {e}")))?
        } else if let Some(encoded) = query_param(raw) {
            decode_base64_json(&encoded)?
        } else if raw.contains("://") {
            return Err(ExchangeError::Validation(format!(
                "invitation URL has no {} parameter",
                INVITATION_PARAMS.join("/")
            )));
        } else {
            decode_base64_json(raw)?
        };

        if !value.is_object() {
            return Err(ExchangeError::Validation(
                "invitation payload is not a JSON object".into(),
            ));
        }

        Ok(DecodedInvitation {
            label: value
                .get("label")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            invitation_type: value
                .get("@type")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            content: value,
        })
    }

    /// Build a URL-style artifact from a JSON invitation.
    pub fn encode(base_url: &str, invitation: &serde_json::Value) -> Self {
        let encoded = URL_SAFE_NO_PAD.encode(invitation.to_string());
        Self(format!("{base_url}?c_i={encoded}"))
    }
}

impl std::fmt::Display for InvitationArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A decoded invitation.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedInvitation {
    /// Human-readable label of the inviter, if present.
    pub label: Option<String>,
    /// The `@type` message type, if present.
    pub invitation_type: Option<String>,
    /// The full JSON invitation.
    pub content: serde_json::Value,
}

/// Extract the first invitation-carrying query parameter.
fn query_param(raw: &str) -> Option<String> {
    let (_, query) = raw.split_once('?')?;
    let query = query.split('#').next().unwrap_or(query);
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        INVITATION_PARAMS
            .contains(&key)
            .then(|| value.replace("%3D", "=").replace("%3d", "="))
    })
}

fn decode_base64_json(encoded: &str) -> Result<serde_json::Value> {
    let trimmed = encoded.trim().trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| STANDARD_NO_PAD.decode(trimmed))
        .or_else(|_| URL_SAFE.decode(encoded.trim()))
        .or_else(|_| STANDARD.decode(encoded.trim()))
        .map_err(|e| ExchangeError::Validation(format!("invitation encoding: {e}")))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| ExchangeError::Validation(format!("invitation JSON: {e}")))
}
