//! Account picker provider: the user chooses (or adds) an account in the
//! platform accounts pane.

use std::sync::Arc;

use async_trait::async_trait;

use super::wam::{
    sign_out_web_account, token_request, web_token_outcome, WebAccountFlow,
    MICROSOFT_ACCOUNT_PROVIDER,
};
use super::{
    run_login, ClientFlow, LoginFlow, LoginProvider, ProviderContext, ProviderCore, ProviderKind,
};
use crate::auth::client::IdentityClient;
use crate::auth::error::AuthError;
use crate::auth::platform::{AccountPicker, WebAccountManager, WebAccountProvider};
use crate::auth::token::{AuthResult, Token};

pub struct WapProvider {
    core: ProviderCore,
    client: Arc<dyn IdentityClient>,
}

impl WapProvider {
    pub fn new(ctx: &ProviderContext, client: Arc<dyn IdentityClient>) -> Self {
        Self {
            core: ProviderCore::new(ProviderKind::Wap, ctx),
            client,
        }
    }
}

struct PickerFlow<'a> {
    core: &'a ProviderCore,
    picker: &'a dyn AccountPicker,
    wam: Option<&'a dyn WebAccountManager>,
    web: Option<WebAccountFlow<'a>>,
    client: &'a dyn IdentityClient,
}

#[async_trait]
impl LoginFlow for PickerFlow<'_> {
    async fn silent(&mut self, user_id: Option<&str>) -> Result<AuthResult, AuthError> {
        match self.web.as_mut() {
            Some(web) => web.silent(user_id).await,
            None => self.client.acquire_token_silent(user_id).await,
        }
    }

    fn interactive_available(&self) -> bool {
        true
    }

    async fn interactive(&mut self, user_id: Option<&str>) -> Result<AuthResult, AuthError> {
        let request = match self.web.as_mut() {
            Some(web) => web.prepare(user_id).await?,
            None => token_request(
                WebAccountProvider {
                    id: MICROSOFT_ACCOUNT_PROVIDER.to_string(),
                    display_name: "Microsoft".to_string(),
                    authority: self.core.context().authority.clone(),
                },
                self.core.context(),
            ),
        };

        self.core.log("Showing account picker...");
        let result = self.picker.pick(&request).await?;
        web_token_outcome(self.core, self.wam, result).await
    }
}

#[async_trait]
impl LoginProvider for WapProvider {
    fn core(&self) -> &ProviderCore {
        &self.core
    }

    async fn login(&self) -> Result<Token, AuthError> {
        self.core.log("Logging in with WindowsAccountProvider...");
        let surface = self.core.surface();
        let wam = surface.web_accounts.as_deref();

        match surface.account_picker.as_deref() {
            Some(picker) => {
                let mut flow = PickerFlow {
                    core: &self.core,
                    picker,
                    wam,
                    web: wam.map(|wam| WebAccountFlow::new(&self.core, wam)),
                    client: self.client.as_ref(),
                };
                run_login(&self.core, &mut flow, self.client.as_ref()).await
            }
            None => {
                self.core
                    .log("Account picker not available, using the identity client");
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
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::auth::platform::{PlatformSurface, WebTokenStatus};
    use crate::auth::user_store::UserStore;

    fn surface(picker: Arc<FakePicker>, wam: Option<Arc<FakeWebAccounts>>) -> PlatformSurface {
        PlatformSurface {
            supports_interactive_ui: true,
            account_picker: Some(picker as Arc<dyn AccountPicker>),
            web_accounts: wam.map(|w| w as Arc<dyn WebAccountManager>),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_picked_account_is_remembered() {
        let picker = Arc::new(FakePicker::new().pick_result(Ok(web_success("web-7", "eve@contoso.com"))));
        let wam = Arc::new(FakeWebAccounts::new().with_picture(b"jpg"));
        let (ctx, store) = context(surface(picker.clone(), Some(wam)));
        let provider = WapProvider::new(&ctx, Arc::new(ScriptedClient::new()));

        let token = provider.login().await.unwrap();

        assert_eq!(token.secret, "web-token-web-7");
        assert_eq!(picker.picks(), 1);
        assert_eq!(provider.session().username, "eve@contoso.com");
        assert_eq!(provider.session().picture.as_deref(), Some(&b"jpg"[..]));
        assert_eq!(store.get_user_id("UserIdKeyWAP").as_deref(), Some("web-7"));
    }

    #[tokio::test]
    async fn test_cancelled_pick_is_a_client_error() {
        let picker = Arc::new(FakePicker::new().pick_result(Ok(web_status(WebTokenStatus::UserCancel))));
        let (ctx, store) = context(surface(picker, None));
        let provider = WapProvider::new(&ctx, Arc::new(ScriptedClient::new()));

        let token = provider.login().await.unwrap();

        assert!(token.is_empty());
        assert!(provider
            .log_content()
            .contains("Client error (code user_cancel)"));
        assert_eq!(store.get_user_id("UserIdKeyWAP"), None);
    }

    #[tokio::test]
    async fn test_headless_skips_picker() {
        let picker = Arc::new(FakePicker::new());
        let mut surface = surface(picker.clone(), None);
        surface.supports_interactive_ui = false;
        let (ctx, _store) = context(surface);
        let client = Arc::new(ScriptedClient::new().device(Ok(success("oid.tid", "x@contoso.com"))));
        let provider = WapProvider::new(&ctx, client.clone());

        provider.login().await.unwrap();

        assert_eq!(picker.picks(), 0);
        assert_eq!(client.calls(), vec!["silent(None)", "device_code"]);
        assert!(provider.is_signed_in());
    }

    #[tokio::test]
    async fn test_sign_out_clears_everything() {
        let picker = Arc::new(FakePicker::new().pick_result(Ok(web_success("web-7", "eve@contoso.com"))));
        let wam = Arc::new(FakeWebAccounts::new().with_account("web-7", "eve@contoso.com"));
        let (ctx, store) = context(surface(picker, Some(wam.clone())));
        let provider = WapProvider::new(&ctx, Arc::new(ScriptedClient::new()));
        provider.login().await.unwrap();

        provider.sign_out().await.unwrap();

        let session = provider.session();
        assert!(!session.is_signed_in());
        assert!(session.username.is_empty());
        assert!(session.picture.is_none());
        assert_eq!(store.get_user_id("UserIdKeyWAP"), None);
        assert!(wam.calls().contains(&"sign_out(web-7)".to_string()));
    }
}
