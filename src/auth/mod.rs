//! Authentication engine
//!
//! Six interchangeable login providers behind one contract. Each runs
//! silent acquisition first and falls back to an interactive flow or the
//! device code flow, remembering the last user per provider so the next
//! silent attempt can target it.

pub mod claims;
pub mod client;
pub mod error;
pub mod log_buffer;
pub mod platform;
pub mod providers;
pub mod registry;
pub mod token;
pub mod token_cache;
pub mod user_store;

pub use log_buffer::{DiagnosticLine, Diagnostics};
pub use platform::PlatformSurface;
pub use providers::LoginProvider;
pub use registry::ProviderRegistry;
pub use token::Token;

use crate::config::Settings;

/// Azure AD public client configuration for the library backends
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Login instance, e.g. `https://login.microsoftonline.com`
    pub instance: String,
    /// Tenant id or "common"
    pub tenant: String,
    /// OAuth2 client ID (public client)
    pub client_id: String,
    /// Resource scopes; the OpenID scopes are added per request
    pub scopes: Vec<String>,
}

impl AuthConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            instance: settings.instance.trim_end_matches('/').to_string(),
            tenant: settings.tenant_id.clone(),
            client_id: settings.client_id.clone(),
            scopes: settings
                .scope
                .split_whitespace()
                .map(str::to_string)
                .collect(),
        }
    }

    /// v2.0 endpoint URL, e.g. `endpoint("token")`.
    pub fn endpoint(&self, name: &str) -> String {
        format!("{}/{}/oauth2/v2.0/{}", self.instance, self.tenant, name)
    }
}
