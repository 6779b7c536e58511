//! Legacy directory library provider.
//!
//! Its identity client is built on the durable token cache, so accounts
//! survive restarts. Sign-out drops the whole cache file.

use std::sync::Arc;

use async_trait::async_trait;

use super::{run_login, ClientFlow, LoginProvider, ProviderContext, ProviderCore, ProviderKind};
use crate::auth::client::IdentityClient;
use crate::auth::error::AuthError;
use crate::auth::token::Token;

pub struct AdalProvider {
    core: ProviderCore,
    client: Arc<dyn IdentityClient>,
}

impl AdalProvider {
    pub fn new(ctx: &ProviderContext, client: Arc<dyn IdentityClient>) -> Self {
        Self {
            core: ProviderCore::new(ProviderKind::Adal, ctx),
            client,
        }
    }
}

#[async_trait]
impl LoginProvider for AdalProvider {
    fn core(&self) -> &ProviderCore {
        &self.core
    }

    async fn login(&self) -> Result<Token, AuthError> {
        self.core.log("Logging in with ADAL...");

        let cached = self.client.accounts().await;
        self.core
            .log(&format!("Token cache holds {} account(s)", cached.len()));

        let mut flow = ClientFlow::new(self.client.as_ref());
        let token = run_login(&self.core, &mut flow, self.client.as_ref()).await?;

        if !token.is_empty() {
            let session = self.core.session();
            self.core.log(&format!(
                "Signed in as {} (expires {})",
                session.username,
                token
                    .expires_at
                    .and_then(|at| chrono::DateTime::<chrono::Utc>::from_timestamp(at as i64, 0))
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "unknown".to_string())
            ));
        }
        Ok(token)
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        self.core.clear_log();
        let backend = self.client.clear_cache().await;
        self.core.finish_sign_out(backend)
    }
}
