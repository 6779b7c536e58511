//! Modern identity library provider.

use std::sync::Arc;

use async_trait::async_trait;

use super::{run_login, ClientFlow, LoginProvider, ProviderContext, ProviderCore, ProviderKind};
use crate::auth::client::IdentityClient;
use crate::auth::error::AuthError;
use crate::auth::token::Token;

pub struct MsalProvider {
    core: ProviderCore,
    client: Arc<dyn IdentityClient>,
}

impl MsalProvider {
    pub fn new(ctx: &ProviderContext, client: Arc<dyn IdentityClient>) -> Self {
        Self {
            core: ProviderCore::new(ProviderKind::Msal, ctx),
            client,
        }
    }
}

#[async_trait]
impl LoginProvider for MsalProvider {
    fn core(&self) -> &ProviderCore {
        &self.core
    }

    async fn login(&self) -> Result<Token, AuthError> {
        self.core.log("Logging in with MSAL...");
        let mut flow = ClientFlow::new(self.client.as_ref());
        run_login(&self.core, &mut flow, self.client.as_ref()).await
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        self.core.clear_log();
        let backend = match self.core.stored_user_id() {
            Some(id) => self.client.remove_account(&id).await,
            None => Ok(()),
        };
        self.core.finish_sign_out(backend)
    }
}
