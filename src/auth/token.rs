//! Token values and the per-provider session snapshot

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Tokens this close to expiry are treated as expired.
const EXPIRY_MARGIN_SECS: u64 = 300;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Opaque bearer credential.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub secret: String,
    pub expires_at: Option<u64>,
}

impl Token {
    pub fn new(secret: impl Into<String>, expires_in_secs: Option<u64>) -> Self {
        Self {
            secret: secret.into(),
            expires_at: expires_in_secs.map(|secs| now_secs().saturating_add(secs)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.secret.is_empty()
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(exp) => now_secs().saturating_add(EXPIRY_MARGIN_SECS) >= exp,
            None => false,
        }
    }

    /// Short form for logs: a prefix and the length, never the whole secret.
    pub fn preview(&self) -> String {
        if self.secret.is_empty() {
            return "<none>".to_string();
        }
        let prefix: String = self.secret.chars().take(8).collect();
        format!("{}... ({} chars)", prefix, self.secret.len())
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("secret", &self.preview())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// What a backend hands back after a successful acquisition.
#[derive(Debug, Clone, Default)]
pub struct AuthResult {
    pub token: Token,
    /// Second token when the backend issues two (e.g. the OpenID id_token).
    pub secondary_token: Option<Token>,
    /// Backend-assigned user identifier, persisted in the identity mapping.
    pub account_id: Option<String>,
    pub username: Option<String>,
    pub picture: Option<Vec<u8>>,
}

/// Authentication state a provider exposes to the consumer.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub token: Token,
    pub secondary_token: Token,
    pub username: String,
    pub picture: Option<Vec<u8>>,
}

impl Session {
    pub fn is_signed_in(&self) -> bool {
        !self.token.is_empty()
    }
}
