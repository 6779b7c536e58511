//! Scripted backends for provider tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use url::Url;

use super::ProviderContext;
use crate::auth::claims::encode_unsigned;
use crate::auth::client::{DeviceCode, IdentityClient};
use crate::auth::error::AuthError;
use crate::auth::log_buffer::Diagnostics;
use crate::auth::platform::*;
use crate::auth::token::{AuthResult, Token};
use crate::auth::token_cache::CachedAccount;
use crate::auth::user_store::MemoryUserStore;
use crate::auth::AuthConfig;

pub(crate) const DEVICE_CODE_MESSAGE: &str =
    "To sign in, open https://microsoft.com/devicelogin and enter the code ABC-123";

pub(crate) fn auth_config() -> AuthConfig {
    AuthConfig {
        instance: "https://login.microsoftonline.com".to_string(),
        tenant: "common".to_string(),
        client_id: "00000000-0000-0000-0000-000000000001".to_string(),
        scopes: vec!["https://sts.mixedreality.azure.com/.default".to_string()],
    }
}

pub(crate) fn context(surface: PlatformSurface) -> (ProviderContext, Arc<MemoryUserStore>) {
    let store = Arc::new(MemoryUserStore::new());
    let ctx = ProviderContext {
        diagnostics: Diagnostics::detached(),
        store: store.clone(),
        surface,
        auth: auth_config(),
        authority: "organizations".to_string(),
        resource: "https://sts.mixedreality.azure.com".to_string(),
    };
    (ctx, store)
}

/// Interactive surface without any platform broker.
pub(crate) fn interactive_surface() -> PlatformSurface {
    PlatformSurface {
        supports_interactive_ui: true,
        ..Default::default()
    }
}

pub(crate) fn success(account_id: &str, username: &str) -> AuthResult {
    AuthResult {
        token: Token::new(format!("token-{}", account_id), Some(3600)),
        secondary_token: Some(Token::new(format!("id-{}", account_id), None)),
        account_id: Some(account_id.to_string()),
        username: Some(username.to_string()),
        picture: None,
    }
}

fn record(calls: &Mutex<Vec<String>>, call: String) {
    calls.lock().unwrap().push(call);
}

fn next<T>(queue: &Mutex<VecDeque<T>>) -> Option<T> {
    queue.lock().unwrap().pop_front()
}

type Outcome = Result<AuthResult, AuthError>;

/// Identity client answering from per-grant queues.
#[derive(Default)]
pub(crate) struct ScriptedClient {
    interactive_ui: bool,
    silent: Mutex<VecDeque<Outcome>>,
    interactive: Mutex<VecDeque<Outcome>>,
    device: Mutex<VecDeque<Outcome>>,
    accounts: Mutex<Vec<CachedAccount>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedClient {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_interactive_ui(mut self) -> Self {
        self.interactive_ui = true;
        self
    }

    pub(crate) fn silent(self, outcome: Outcome) -> Self {
        self.silent.lock().unwrap().push_back(outcome);
        self
    }

    pub(crate) fn interactive(self, outcome: Outcome) -> Self {
        self.interactive.lock().unwrap().push_back(outcome);
        self
    }

    pub(crate) fn device(self, outcome: Outcome) -> Self {
        self.device.lock().unwrap().push_back(outcome);
        self
    }

    pub(crate) fn with_account(self, account_id: &str) -> Self {
        self.accounts.lock().unwrap().push(CachedAccount {
            account_id: account_id.to_string(),
            ..Default::default()
        });
        self
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl IdentityClient for ScriptedClient {
    fn supports_interactive(&self) -> bool {
        self.interactive_ui
    }

    async fn acquire_token_silent(&self, account_id: Option<&str>) -> Outcome {
        record(
            &self.calls,
            format!("silent({})", account_id.unwrap_or("None")),
        );
        next(&self.silent)
            .unwrap_or_else(|| Err(AuthError::InteractionRequired("nothing cached".into())))
    }

    async fn acquire_token_interactive(&self, account_id: Option<&str>) -> Outcome {
        record(
            &self.calls,
            format!("interactive({})", account_id.unwrap_or("None")),
        );
        next(&self.interactive)
            .unwrap_or_else(|| Err(AuthError::client("unscripted", "no interactive outcome")))
    }

    async fn acquire_token_with_device_code(
        &self,
        on_code: &(dyn for<'c> Fn(&'c DeviceCode) + Send + Sync),
    ) -> Outcome {
        record(&self.calls, "device_code".to_string());
        on_code(&DeviceCode {
            user_code: "ABC-123".to_string(),
            verification_uri: "https://microsoft.com/devicelogin".to_string(),
            expires_in: std::time::Duration::from_secs(900),
            message: DEVICE_CODE_MESSAGE.to_string(),
        });
        next(&self.device)
            .unwrap_or_else(|| Err(AuthError::client("expired_token", "device code expired")))
    }

    async fn accounts(&self) -> Vec<CachedAccount> {
        self.accounts.lock().unwrap().clone()
    }

    async fn remove_account(&self, account_id: &str) -> Result<(), AuthError> {
        record(&self.calls, format!("remove_account({})", account_id));
        self.accounts
            .lock()
            .unwrap()
            .retain(|a| a.account_id != account_id);
        Ok(())
    }

    async fn clear_cache(&self) -> Result<(), AuthError> {
        record(&self.calls, "clear_cache".to_string());
        self.accounts.lock().unwrap().clear();
        Ok(())
    }
}

pub(crate) fn web_success(account_id: &str, username: &str) -> WebTokenResult {
    WebTokenResult {
        status: WebTokenStatus::Success,
        data: vec![WebTokenResponse {
            token: format!("web-token-{}", account_id),
            account: web_account(account_id, username),
            properties: Vec::new(),
        }],
        error: None,
    }
}

pub(crate) fn web_status(status: WebTokenStatus) -> WebTokenResult {
    WebTokenResult {
        status,
        data: Vec::new(),
        error: None,
    }
}

pub(crate) fn web_account(id: &str, username: &str) -> WebAccount {
    WebAccount {
        id: id.to_string(),
        username: username.to_string(),
        state: "Connected".to_string(),
    }
}

type WebOutcome = Result<WebTokenResult, AuthError>;

/// Web-account manager with a fixed account list and scripted token calls.
pub(crate) struct FakeWebAccounts {
    accounts: Vec<WebAccount>,
    silent: Mutex<VecDeque<WebOutcome>>,
    request: Mutex<VecDeque<WebOutcome>>,
    picture: Option<Vec<u8>>,
    consent: ConsentResult,
    sign_out_error: Option<AuthError>,
    calls: Mutex<Vec<String>>,
}

impl FakeWebAccounts {
    pub(crate) fn new() -> Self {
        Self {
            accounts: Vec::new(),
            silent: Mutex::default(),
            request: Mutex::default(),
            picture: None,
            consent: ConsentResult::Verified,
            sign_out_error: None,
            calls: Mutex::default(),
        }
    }

    pub(crate) fn with_account(mut self, id: &str, username: &str) -> Self {
        self.accounts.push(web_account(id, username));
        self
    }

    pub(crate) fn silent(self, outcome: WebOutcome) -> Self {
        self.silent.lock().unwrap().push_back(outcome);
        self
    }

    pub(crate) fn request(self, outcome: WebOutcome) -> Self {
        self.request.lock().unwrap().push_back(outcome);
        self
    }

    pub(crate) fn with_picture(mut self, picture: &[u8]) -> Self {
        self.picture = Some(picture.to_vec());
        self
    }

    pub(crate) fn with_consent(mut self, consent: ConsentResult) -> Self {
        self.consent = consent;
        self
    }

    pub(crate) fn failing_sign_out(mut self, err: AuthError) -> Self {
        self.sign_out_error = Some(err);
        self
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl WebAccountManager for FakeWebAccounts {
    async fn find_account_provider(
        &self,
        provider_id: &str,
        authority: &str,
    ) -> Result<WebAccountProvider, AuthError> {
        Ok(WebAccountProvider {
            id: provider_id.to_string(),
            display_name: "Microsoft".to_string(),
            authority: authority.to_string(),
        })
    }

    async fn find_all_accounts(
        &self,
        _provider: &WebAccountProvider,
    ) -> Result<Vec<WebAccount>, AuthError> {
        record(&self.calls, "find_all_accounts".to_string());
        Ok(self.accounts.clone())
    }

    async fn find_account(
        &self,
        _provider: &WebAccountProvider,
        account_id: &str,
    ) -> Result<Option<WebAccount>, AuthError> {
        Ok(self.accounts.iter().find(|a| a.id == account_id).cloned())
    }

    async fn get_token_silently(
        &self,
        _request: &WebTokenRequest,
        account: Option<&WebAccount>,
    ) -> WebOutcome {
        record(
            &self.calls,
            format!(
                "get_token_silently({})",
                account.map(|a| a.id.as_str()).unwrap_or("None")
            ),
        );
        next(&self.silent)
            .unwrap_or_else(|| Ok(web_status(WebTokenStatus::UserInteractionRequired)))
    }

    async fn request_token(
        &self,
        _request: &WebTokenRequest,
        account: Option<&WebAccount>,
    ) -> WebOutcome {
        record(
            &self.calls,
            format!(
                "request_token({})",
                account.map(|a| a.id.as_str()).unwrap_or("None")
            ),
        );
        next(&self.request).unwrap_or_else(|| Ok(web_status(WebTokenStatus::UserCancel)))
    }

    async fn account_picture(&self, _account: &WebAccount) -> Result<Vec<u8>, AuthError> {
        self.picture
            .clone()
            .ok_or_else(|| AuthError::client("no_picture", "account has no picture"))
    }

    async fn sign_out(&self, account: &WebAccount) -> Result<(), AuthError> {
        record(&self.calls, format!("sign_out({})", account.id));
        match &self.sign_out_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn request_user_consent(&self, _message: &str) -> Result<ConsentResult, AuthError> {
        record(&self.calls, "request_user_consent".to_string());
        Ok(self.consent)
    }
}

/// What the fake broker answers with. Token replies echo the request's
/// `state` so they pass the state check.
#[derive(Clone)]
pub(crate) enum BrokerReply {
    Tokens { oid: String, tid: String, username: String },
    Error { code: String, description: String },
    Status(WebAuthStatus, u32),
    Raw(String),
}

impl BrokerReply {
    pub(crate) fn tokens(oid: &str, tid: &str, username: &str) -> Self {
        Self::Tokens {
            oid: oid.to_string(),
            tid: tid.to_string(),
            username: username.to_string(),
        }
    }
}

pub(crate) const BROKER_CALLBACK: &str = "ms-app://s-1-15-2-test/";

/// Web-authentication broker answering from queues.
#[derive(Default)]
pub(crate) struct FakeWebAuth {
    silent: Mutex<VecDeque<BrokerReply>>,
    interactive: Mutex<VecDeque<BrokerReply>>,
    requests: Mutex<Vec<Url>>,
}

impl FakeWebAuth {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn silent(self, reply: BrokerReply) -> Self {
        self.silent.lock().unwrap().push_back(reply);
        self
    }

    pub(crate) fn interactive(self, reply: BrokerReply) -> Self {
        self.interactive.lock().unwrap().push_back(reply);
        self
    }

    pub(crate) fn requests(&self) -> Vec<Url> {
        self.requests.lock().unwrap().clone()
    }

    fn answer(&self, request: &Url, reply: BrokerReply) -> WebAuthResult {
        self.requests.lock().unwrap().push(request.clone());
        let state = request
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap_or_default();

        let ok = |fragment: String| WebAuthResult {
            status: WebAuthStatus::Success,
            response_data: format!("{}#{}", BROKER_CALLBACK, fragment),
            error_detail: 0,
        };
        match reply {
            BrokerReply::Tokens { oid, tid, username } => {
                let id_token = encode_unsigned(&serde_json::json!({
                    "oid": oid,
                    "tid": tid,
                    "preferred_username": username,
                }));
                ok(format!(
                    "access_token=at-{}&token_type=Bearer&expires_in=3599&id_token={}&state={}",
                    oid, id_token, state
                ))
            }
            BrokerReply::Error { code, description } => ok(format!(
                "error={}&error_description={}&state={}",
                code,
                description.replace(' ', "+"),
                state
            )),
            BrokerReply::Status(status, detail) => WebAuthResult {
                status,
                response_data: String::new(),
                error_detail: detail,
            },
            BrokerReply::Raw(data) => WebAuthResult {
                status: WebAuthStatus::Success,
                response_data: data,
                error_detail: 0,
            },
        }
    }
}

#[async_trait]
impl WebAuthBroker for FakeWebAuth {
    fn callback_uri(&self) -> String {
        BROKER_CALLBACK.to_string()
    }

    async fn authenticate_silently(&self, request: &Url) -> Result<WebAuthResult, AuthError> {
        let reply = next(&self.silent).unwrap_or(BrokerReply::Error {
            code: "login_required".to_string(),
            description: "no session".to_string(),
        });
        Ok(self.answer(request, reply))
    }

    async fn authenticate(&self, request: &Url) -> Result<WebAuthResult, AuthError> {
        let reply = next(&self.interactive)
            .unwrap_or(BrokerReply::Status(WebAuthStatus::UserCancel, 0));
        Ok(self.answer(request, reply))
    }
}

/// Account picker returning scripted results.
#[derive(Default)]
pub(crate) struct FakePicker {
    results: Mutex<VecDeque<WebOutcome>>,
    picks: Mutex<u32>,
}

impl FakePicker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn pick_result(self, outcome: WebOutcome) -> Self {
        self.results.lock().unwrap().push_back(outcome);
        self
    }

    pub(crate) fn picks(&self) -> u32 {
        *self.picks.lock().unwrap()
    }
}

#[async_trait]
impl AccountPicker for FakePicker {
    async fn pick(&self, _request: &WebTokenRequest) -> WebOutcome {
        *self.picks.lock().unwrap() += 1;
        next(&self.results).unwrap_or_else(|| Ok(web_status(WebTokenStatus::UserCancel)))
    }
}
