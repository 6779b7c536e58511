//! Platform web-account manager provider.
//!
//! Tokens come from accounts already known to the platform. The flow here
//! is shared with the combined broker and the account picker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use super::{
    run_login, ClientFlow, LoginFlow, LoginProvider, ProviderContext, ProviderCore, ProviderKind,
};
use crate::auth::client::IdentityClient;
use crate::auth::error::AuthError;
use crate::auth::platform::{
    ConsentResult, WebAccount, WebAccountManager, WebAccountProvider, WebTokenRequest,
    WebTokenResult, WebTokenStatus,
};
use crate::auth::token::{AuthResult, Token};

/// Account provider id for work, school and personal Microsoft accounts.
pub const MICROSOFT_ACCOUNT_PROVIDER: &str = "https://login.microsoft.com";

const CONSENT_MESSAGE: &str = "Please verify your credentials";

pub struct WamProvider {
    core: ProviderCore,
    client: Arc<dyn IdentityClient>,
    biometrics_required: AtomicBool,
}

impl WamProvider {
    pub fn new(ctx: &ProviderContext, client: Arc<dyn IdentityClient>) -> Self {
        Self {
            core: ProviderCore::new(ProviderKind::Wam, ctx),
            client,
            biometrics_required: AtomicBool::new(false),
        }
    }

    async fn verify_user(&self, wam: Option<&dyn WebAccountManager>) -> bool {
        let Some(wam) = wam else {
            self.core.log("Biometric verification is not available");
            return false;
        };

        match wam.request_user_consent(CONSENT_MESSAGE).await {
            Ok(ConsentResult::Verified) => {
                self.core.log("User verified");
                true
            }
            Ok(ConsentResult::NotAvailable) => {
                self.core.log("Biometric verification is not available");
                false
            }
            Ok(ConsentResult::Rejected) => {
                self.core.log("Biometric verification failed");
                false
            }
            Err(err) => {
                for line in err.describe() {
                    self.core.log(&line);
                }
                false
            }
        }
    }
}

#[async_trait]
impl LoginProvider for WamProvider {
    fn core(&self) -> &ProviderCore {
        &self.core
    }

    async fn login(&self) -> Result<Token, AuthError> {
        self.core.log("Logging in with WebAuthenticationCoreManager...");
        let wam = self.core.surface().web_accounts.clone();

        if self.biometrics_required.load(Ordering::Relaxed) && !self.verify_user(wam.as_deref()).await
        {
            return Ok(Token::default());
        }

        match wam {
            Some(wam) => {
                let mut flow = WebAccountFlow::new(&self.core, wam.as_ref());
                run_login(&self.core, &mut flow, self.client.as_ref()).await
            }
            None => {
                self.core
                    .log("Web account manager not available, using the identity client");
                let mut flow = ClientFlow::device_only(self.client.as_ref());
                run_login(&self.core, &mut flow, self.client.as_ref()).await
            }
        }
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        self.core.clear_log();
        let backend = match (
            self.core.surface().web_accounts.as_deref(),
            self.core.stored_user_id(),
        ) {
            (Some(wam), Some(id)) => sign_out_web_account(&self.core, wam, &id).await,
            (None, Some(id)) => self.client.remove_account(&id).await,
            (_, None) => Ok(()),
        };
        self.core.finish_sign_out(backend)
    }

    fn set_biometrics_required(&self, required: bool) -> bool {
        self.biometrics_required.store(required, Ordering::Relaxed);
        true
    }
}

/// Token request for the configured scope and resource.
pub(crate) fn token_request(provider: WebAccountProvider, ctx: &ProviderContext) -> WebTokenRequest {
    WebTokenRequest {
        provider,
        scope: ctx.auth.scopes.join(" "),
        client_id: ctx.auth.client_id.clone(),
        properties: vec![("resource".to_string(), ctx.resource.clone())],
    }
}

pub(crate) async fn sign_out_web_account(
    core: &ProviderCore,
    wam: &dyn WebAccountManager,
    account_id: &str,
) -> Result<(), AuthError> {
    let provider = wam
        .find_account_provider(MICROSOFT_ACCOUNT_PROVIDER, &core.context().authority)
        .await?;
    match wam.find_account(&provider, account_id).await? {
        Some(account) => {
            wam.sign_out(&account).await?;
            core.log(&format!("Signed out web account {}", account.username));
        }
        None => core.log(&format!("Web account {} is no longer present", account_id)),
    }
    Ok(())
}

/// Map a web token result onto the provider outcome. On success the
/// account picture is fetched when a manager is at hand; a missing picture
/// never fails the login.
pub(crate) async fn web_token_outcome(
    core: &ProviderCore,
    wam: Option<&dyn WebAccountManager>,
    result: WebTokenResult,
) -> Result<AuthResult, AuthError> {
    core.log(&format!("Token broker status: {:?}", result.status));

    match result.status {
        WebTokenStatus::Success => {
            let response = result.data.into_iter().next().ok_or_else(|| {
                AuthError::service("empty_response", "token broker returned no token")
            })?;
            core.log(&format!(
                "Account: {} ({})",
                response.account.username, response.account.state
            ));

            let picture = match wam {
                Some(wam) => match wam.account_picture(&response.account).await {
                    Ok(bytes) => Some(bytes),
                    Err(err) => {
                        core.log(&format!("Could not read account picture: {}", err));
                        None
                    }
                },
                None => None,
            };

            Ok(AuthResult {
                token: Token::new(response.token, None),
                secondary_token: None,
                account_id: Some(response.account.id),
                username: Some(response.account.username),
                picture,
            })
        }
        WebTokenStatus::UserInteractionRequired => Err(AuthError::InteractionRequired(
            "token broker needs the user".to_string(),
        )),
        WebTokenStatus::UserCancel => Err(AuthError::client(
            "user_cancel",
            "the user cancelled the request",
        )),
        status => Err(match result.error {
            Some(err) => {
                for (key, value) in &err.properties {
                    core.log(&format!("Error property {}: {}", key, value));
                }
                AuthError::service(format!("0x{:08X}", err.code), err.message)
            }
            None => AuthError::service(
                format!("{:?}", status),
                "token broker reported no error details",
            ),
        }),
    }
}

/// Silent and interactive token requests through the web-account manager.
pub(crate) struct WebAccountFlow<'a> {
    core: &'a ProviderCore,
    wam: &'a dyn WebAccountManager,
    request: Option<WebTokenRequest>,
    account: Option<WebAccount>,
}

impl<'a> WebAccountFlow<'a> {
    pub(crate) fn new(core: &'a ProviderCore, wam: &'a dyn WebAccountManager) -> Self {
        Self {
            core,
            wam,
            request: None,
            account: None,
        }
    }

    /// Resolve the account provider and the stored account, once per login.
    pub(crate) async fn prepare(
        &mut self,
        user_id: Option<&str>,
    ) -> Result<WebTokenRequest, AuthError> {
        if let Some(request) = &self.request {
            return Ok(request.clone());
        }

        let ctx = self.core.context();
        let provider = self
            .wam
            .find_account_provider(MICROSOFT_ACCOUNT_PROVIDER, &ctx.authority)
            .await?;
        self.core.log(&format!(
            "Account provider: {} ({})",
            provider.display_name, provider.id
        ));

        if let Some(id) = user_id {
            self.account = self.wam.find_account(&provider, id).await?;
            if self.account.is_none() {
                self.core
                    .log(&format!("Stored account {} not found on this device", id));
            }
        }

        let request = token_request(provider, ctx);
        self.request = Some(request.clone());
        Ok(request)
    }

    pub(crate) fn provider(&self) -> Option<&WebAccountProvider> {
        self.request.as_ref().map(|r| &r.provider)
    }

    pub(crate) fn account(&self) -> Option<&WebAccount> {
        self.account.as_ref()
    }
}

#[async_trait]
impl LoginFlow for WebAccountFlow<'_> {
    async fn silent(&mut self, user_id: Option<&str>) -> Result<AuthResult, AuthError> {
        // No account means the platform's default account for the provider.
        let request = self.prepare(user_id).await?;
        let result = self
            .wam
            .get_token_silently(&request, self.account.as_ref())
            .await?;
        web_token_outcome(self.core, Some(self.wam), result).await
    }

    fn interactive_available(&self) -> bool {
        true
    }

    async fn interactive(&mut self, user_id: Option<&str>) -> Result<AuthResult, AuthError> {
        let request = self.prepare(user_id).await?;
        let result = self.wam.request_token(&request, self.account.as_ref()).await?;
        web_token_outcome(self.core, Some(self.wam), result).await
    }
}
