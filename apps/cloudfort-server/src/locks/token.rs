//! Lock token types
//!
//! A `LockToken` is the lease record for one world. The same value lives in
//! the `LockManager` map and in the world's `.dftk` record on disk.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Constants
// ============================================================================

/// Auth token value meaning "no active lease"
pub const SENTINEL_AUTH_TOKEN: &str = "0";

// ============================================================================
// Status
// ============================================================================

/// Lease status of a world
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockStatus {
    /// Nobody holds the world
    Available,
    /// A client is downloading the world
    Downloading,
    /// A client holds the world and is expected to check it back in
    CheckedOut,
}

impl LockStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Downloading => "downloading",
            Self::CheckedOut => "checked-out",
        }
    }
}

impl std::fmt::Display for LockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Token
// ============================================================================

/// Per-world lease record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockToken {
    pub status: LockStatus,

    /// RFC 3339 timestamp. Kept as text so a damaged record can still be
    /// loaded and then reclaimed by the expiry monitor.
    pub expires: String,

    /// Last actor to touch the world
    pub current_overseer: String,

    /// Secret required for checkin/release. Blank in public snapshots.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub auth_token: String,
}

impl LockToken {
    /// Token for a world nobody holds
    pub fn available(overseer: &str, now: DateTime<Utc>) -> Self {
        Self {
            status: LockStatus::Available,
            expires: now.to_rfc3339(),
            current_overseer: overseer.to_string(),
            auth_token: SENTINEL_AUTH_TOKEN.to_string(),
        }
    }

    /// Token for a world whose archive is being streamed to `overseer`.
    /// A fresh auth token is minted on every call.
    pub fn downloading(overseer: &str, now: DateTime<Utc>, limit: Duration) -> Self {
        Self {
            status: LockStatus::Downloading,
            expires: (now + limit).to_rfc3339(),
            current_overseer: overseer.to_string(),
            auth_token: mint_auth_token(),
        }
    }

    /// The long-lived lease handed to the client once its download is done
    pub fn promote_to_checked_out(&self, now: DateTime<Utc>, limit: Duration) -> Self {
        Self {
            status: LockStatus::CheckedOut,
            expires: (now + limit).to_rfc3339(),
            ..self.clone()
        }
    }

    pub fn is_available(&self) -> bool {
        self.status == LockStatus::Available
    }

    /// Parse the `expires` field
    pub fn expires_at(&self) -> Result<DateTime<Utc>, chrono::ParseError> {
        DateTime::parse_from_rfc3339(&self.expires).map(|t| t.with_timezone(&Utc))
    }

    /// Whether `candidate` proves authority over this lease
    pub fn authorizes(&self, candidate: &str) -> bool {
        !self.is_available()
            && self.auth_token != SENTINEL_AUTH_TOKEN
            && !self.auth_token.is_empty()
            && self.auth_token == candidate
    }

    /// Copy with the secret removed, for broadcast views
    pub fn redacted(&self) -> Self {
        Self {
            auth_token: String::new(),
            ..self.clone()
        }
    }
}

/// Mint a fresh high-entropy auth token.
///
/// Standard base64 never produces `:`, so the token is safe to embed in a
/// command line.
pub fn mint_auth_token() -> String {
    BASE64.encode(Uuid::new_v4().as_bytes())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_kebab_case() {
        let json = serde_json::to_string(&LockStatus::CheckedOut).unwrap();
        assert_eq!(json, "\"checked-out\"");
    }

    #[test]
    fn test_available_token_uses_sentinel() {
        let token = LockToken::available("<Server>", Utc::now());
        assert!(token.is_available());
        assert_eq!(token.auth_token, SENTINEL_AUTH_TOKEN);
        assert!(!token.authorizes(SENTINEL_AUTH_TOKEN));
    }

    #[test]
    fn test_downloading_tokens_rotate_secret() {
        let now = Utc::now();
        let a = LockToken::downloading("urist", now, Duration::minutes(30));
        let b = LockToken::downloading("urist", now, Duration::minutes(30));
        assert_ne!(a.auth_token, b.auth_token);
        assert!(!a.auth_token.contains(':'));
        assert!(a.authorizes(&a.auth_token));
        assert!(!a.authorizes(&b.auth_token));
    }

    #[test]
    fn test_promote_keeps_secret() {
        let now = Utc::now();
        let dl = LockToken::downloading("urist", now, Duration::minutes(30));
        let co = dl.promote_to_checked_out(now, Duration::hours(8));
        assert_eq!(co.status, LockStatus::CheckedOut);
        assert_eq!(co.auth_token, dl.auth_token);
        assert!(co.expires_at().unwrap() > dl.expires_at().unwrap());
    }

    #[test]
    fn test_redacted_omits_secret_from_json() {
        let token = LockToken::downloading("urist", Utc::now(), Duration::minutes(1));
        let json = serde_json::to_value(token.redacted()).unwrap();
        assert!(json.get("authToken").is_none());
        assert_eq!(json["currentOverseer"], "urist");
        assert_eq!(json["status"], "downloading");
    }

    #[test]
    fn test_bad_expiry_fails_to_parse() {
        let mut token = LockToken::available("x", Utc::now());
        token.expires = "whenever".to_string();
        assert!(token.expires_at().is_err());
    }
}
