//! Identity library backend: OAuth2 grants against Azure AD.
//!
//! `IdentityClient` is the seam providers talk to; `AadClient` implements it
//! with refresh-token (silent), auth-code + PKCE (interactive) and device
//! code grants, remembering accounts in a `TokenCache`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use oauth2::basic::{
    BasicErrorResponse, BasicRevocationErrorResponse, BasicTokenIntrospectionResponse,
    BasicTokenType,
};
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthUrl, AuthorizationCode, Client, ClientId, CsrfToken, DeviceAuthorizationUrl,
    ErrorResponse, ErrorResponseType, ExtraTokenFields, PkceCodeChallenge, RedirectUrl,
    RefreshToken, RequestTokenError, Scope, StandardDeviceAuthorizationResponse,
    StandardErrorResponse, StandardRevocableToken, StandardTokenResponse, TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};

use super::claims;
use super::error::AuthError;
use super::platform::BrowserSurface;
use super::token::{AuthResult, Token};
use super::token_cache::{CachedAccount, TokenCache};
use super::AuthConfig;

/// Error codes on a refresh that mean "ask the user", not "give up".
const INTERACTION_CODES: &[&str] = &[
    "invalid_grant",
    "interaction_required",
    "consent_required",
    "login_required",
];

/// Device-code instructions to show the user.
#[derive(Debug, Clone)]
pub struct DeviceCode {
    pub user_code: String,
    pub verification_uri: String,
    pub expires_in: Duration,
    pub message: String,
}

/// Token acquisition as offered by an identity library.
#[async_trait]
pub trait IdentityClient: Send + Sync {
    /// Whether `acquire_token_interactive` can present UI.
    fn supports_interactive(&self) -> bool;

    /// Non-interactive acquisition for `account_id`, or for the single
    /// cached account when `None`. Fails with `InteractionRequired` when
    /// the user must be involved.
    async fn acquire_token_silent(&self, account_id: Option<&str>)
        -> Result<AuthResult, AuthError>;

    async fn acquire_token_interactive(
        &self,
        account_id: Option<&str>,
    ) -> Result<AuthResult, AuthError>;

    /// Request a device code, hand it to `on_code`, then wait for the user
    /// to complete sign-in elsewhere.
    async fn acquire_token_with_device_code(
        &self,
        on_code: &(dyn for<'c> Fn(&'c DeviceCode) + Send + Sync),
    ) -> Result<AuthResult, AuthError>;

    async fn accounts(&self) -> Vec<CachedAccount>;

    async fn remove_account(&self, account_id: &str) -> Result<(), AuthError>;

    /// Drop every cached account, including any persisted copy.
    async fn clear_cache(&self) -> Result<(), AuthError>;
}

/// Token response fields Azure AD adds to the OAuth2 standard ones.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AadTokenFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

impl ExtraTokenFields for AadTokenFields {}

type AadTokenResponse = StandardTokenResponse<AadTokenFields, BasicTokenType>;

type AadOAuthClient = Client<
    BasicErrorResponse,
    AadTokenResponse,
    BasicTokenType,
    BasicTokenIntrospectionResponse,
    StandardRevocableToken,
    BasicRevocationErrorResponse,
>;

/// Azure AD public client.
pub struct AadClient {
    config: AuthConfig,
    cache: TokenCache,
    browser: Option<Arc<dyn BrowserSurface>>,
}

impl AadClient {
    pub fn new(config: AuthConfig, cache: TokenCache) -> Self {
        Self {
            config,
            cache,
            browser: None,
        }
    }

    pub fn with_browser(mut self, browser: Option<Arc<dyn BrowserSurface>>) -> Self {
        self.browser = browser;
        self
    }

    /// Build the OAuth2 client for the configured tenant
    fn oauth_client(&self, redirect: Option<RedirectUrl>) -> Result<AadOAuthClient, AuthError> {
        if self.config.client_id.is_empty() {
            return Err(AuthError::client(
                "invalid_client_config",
                "no client id configured",
            ));
        }
        let bad_config = |e: url::ParseError| AuthError::client("invalid_client_config", e.to_string());

        let auth_url = AuthUrl::new(self.config.endpoint("authorize")).map_err(bad_config)?;
        let token_url = TokenUrl::new(self.config.endpoint("token")).map_err(bad_config)?;
        let device_url =
            DeviceAuthorizationUrl::new(self.config.endpoint("devicecode")).map_err(bad_config)?;

        let client = AadOAuthClient::new(
            ClientId::new(self.config.client_id.clone()),
            None,
            auth_url,
            Some(token_url),
        )
        .set_device_authorization_url(device_url);

        Ok(match redirect {
            Some(redirect) => client.set_redirect_uri(redirect),
            None => client,
        })
    }

    /// Resource scopes plus the OpenID scopes that yield an id_token and a
    /// refresh token.
    fn scopes(&self) -> Vec<Scope> {
        self.config
            .scopes
            .iter()
            .map(String::as_str)
            .chain(["openid", "profile", "offline_access"])
            .map(|s| Scope::new(s.to_string()))
            .collect()
    }

    /// Turn a token response into a result and remember the account.
    async fn complete(
        &self,
        response: AadTokenResponse,
        previous: Option<CachedAccount>,
    ) -> Result<AuthResult, AuthError> {
        let access_token = Token::new(
            response.access_token().secret().clone(),
            response.expires_in().map(|d| d.as_secs()),
        );
        let id_token = response.extra_fields().id_token.clone();
        let id_claims = id_token.as_deref().and_then(claims::decode_unverified);

        let account_id = id_claims
            .as_ref()
            .and_then(|c| c.account_id())
            .or_else(|| previous.as_ref().map(|p| p.account_id.clone()))
            .ok_or_else(|| {
                AuthError::service("missing_id_token", "token response carried no account identity")
            })?;
        let username = id_claims
            .as_ref()
            .and_then(|c| c.username())
            .or_else(|| previous.as_ref().and_then(|p| p.username.clone()));
        let refresh_token = response
            .refresh_token()
            .map(|t| t.secret().clone())
            .or_else(|| previous.as_ref().and_then(|p| p.refresh_token.clone()));
        let id_token = id_token.map(|t| Token::new(t, None));

        self.cache
            .upsert(CachedAccount {
                account_id: account_id.clone(),
                username: username.clone(),
                refresh_token,
                access_token: Some(access_token.clone()),
                id_token: id_token.clone(),
            })
            .await;

        Ok(AuthResult {
            token: access_token,
            secondary_token: id_token,
            account_id: Some(account_id),
            username,
            picture: None,
        })
    }
}

#[async_trait]
impl IdentityClient for AadClient {
    fn supports_interactive(&self) -> bool {
        self.browser.is_some()
    }

    async fn acquire_token_silent(
        &self,
        account_id: Option<&str>,
    ) -> Result<AuthResult, AuthError> {
        let Some(account) = self.cache.account(account_id).await else {
            return Err(AuthError::InteractionRequired(match account_id {
                Some(id) => format!("account {} is not in the token cache", id),
                None => "no single cached account".to_string(),
            }));
        };

        if let Some(token) = account.access_token.as_ref().filter(|t| !t.is_expired()) {
            tracing::debug!("Using cached access token for {}", account.account_id);
            return Ok(AuthResult {
                token: token.clone(),
                secondary_token: account.id_token.clone(),
                account_id: Some(account.account_id.clone()),
                username: account.username.clone(),
                picture: None,
            });
        }

        let Some(refresh_token) = account.refresh_token.clone() else {
            return Err(AuthError::InteractionRequired(
                "no refresh token cached".to_string(),
            ));
        };

        tracing::debug!("Refreshing token for {}", account.account_id);
        let client = self.oauth_client(None)?;
        let refresh_token = RefreshToken::new(refresh_token);
        let request = self
            .scopes()
            .into_iter()
            .fold(client.exchange_refresh_token(&refresh_token), |r, s| r.add_scope(s));
        let response = request
            .request_async(async_http_client)
            .await
            .map_err(|e| interaction_or(classify(e, "refresh token")))?;

        self.complete(response, Some(account)).await
    }

    async fn acquire_token_interactive(
        &self,
        account_id: Option<&str>,
    ) -> Result<AuthResult, AuthError> {
        let browser = self
            .browser
            .as_ref()
            .ok_or_else(|| AuthError::client("no_ui", "no interactive surface available"))?;

        let login_hint = match account_id {
            Some(id) => self.cache.account(Some(id)).await.and_then(|a| a.username),
            None => None,
        };

        let mut session = browser.open().await?;
        let redirect = RedirectUrl::new(session.redirect_uri().to_string())
            .map_err(|e| AuthError::client("invalid_redirect", e.to_string()))?;
        let client = self.oauth_client(Some(redirect))?;

        let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();
        let mut request = self
            .scopes()
            .into_iter()
            .fold(client.authorize_url(CsrfToken::new_random), |r, s| r.add_scope(s))
            .set_pkce_challenge(challenge);
        if let Some(hint) = login_hint {
            request = request.add_extra_param("login_hint", hint);
        }
        let (authorize_url, csrf) = request.url();

        let callback = session.navigate(&authorize_url).await?;
        let params: HashMap<String, String> = callback.query_pairs().into_owned().collect();

        if let Some(error) = params.get("error") {
            return Err(AuthError::service(
                error.clone(),
                params.get("error_description").cloned().unwrap_or_default(),
            ));
        }
        if params.get("state") != Some(csrf.secret()) {
            return Err(AuthError::client(
                "state_mismatch",
                "redirect state does not match the request",
            ));
        }
        let code = params
            .get("code")
            .ok_or_else(|| AuthError::client("invalid_response", "redirect carried no code"))?;

        let response = client
            .exchange_code(AuthorizationCode::new(code.clone()))
            .set_pkce_verifier(verifier)
            .request_async(async_http_client)
            .await
            .map_err(|e| classify(e, "authorization code"))?;

        self.complete(response, None).await
    }

    async fn acquire_token_with_device_code(
        &self,
        on_code: &(dyn for<'c> Fn(&'c DeviceCode) + Send + Sync),
    ) -> Result<AuthResult, AuthError> {
        let client = self.oauth_client(None)?;
        let request = client
            .exchange_device_code()
            .map_err(|e| AuthError::client("invalid_client_config", e.to_string()))?;

        tracing::info!("Initiating device code flow...");
        let details: StandardDeviceAuthorizationResponse = self
            .scopes()
            .into_iter()
            .fold(request, |r, s| r.add_scope(s))
            .request_async(async_http_client)
            .await
            .map_err(|e| classify(e, "device code"))?;

        let verification_uri = details.verification_uri().as_str().to_string();
        let user_code = details.user_code().secret().clone();
        on_code(&DeviceCode {
            message: format!(
                "To sign in, use a web browser to open the page {} and enter the code {} to authenticate.",
                verification_uri, user_code
            ),
            user_code,
            verification_uri,
            expires_in: details.expires_in(),
        });

        tracing::info!("Waiting for authentication...");
        let response = client
            .exchange_device_access_token(&details)
            .request_async(async_http_client, tokio::time::sleep, None)
            .await
            .map_err(|e| classify(e, "device code token"))?;

        self.complete(response, None).await
    }

    async fn accounts(&self) -> Vec<CachedAccount> {
        self.cache.accounts().await
    }

    async fn remove_account(&self, account_id: &str) -> Result<(), AuthError> {
        self.cache.remove(account_id).await;
        Ok(())
    }

    async fn clear_cache(&self) -> Result<(), AuthError> {
        self.cache.clear().await
    }
}

/// Map an OAuth2 request failure onto the service/client split.
fn classify<RE, T>(err: RequestTokenError<RE, StandardErrorResponse<T>>, step: &str) -> AuthError
where
    RE: std::error::Error + 'static,
    T: ErrorResponseType,
    StandardErrorResponse<T>: ErrorResponse + 'static,
{
    match err {
        RequestTokenError::ServerResponse(resp) => {
            let code = serde_json::to_value(resp.error())
                .ok()
                .and_then(|v| v.as_str().map(str::to_owned))
                .unwrap_or_else(|| "unknown".to_string());
            let message = resp.error_description().cloned().unwrap_or_default();
            AuthError::service(code, message)
        }
        RequestTokenError::Request(e) => {
            AuthError::client("network_error", format!("{} request failed: {}", step, e))
        }
        RequestTokenError::Parse(e, _) => AuthError::client(
            "invalid_response",
            format!("{} response unreadable: {}", step, e),
        ),
        RequestTokenError::Other(msg) => AuthError::client("unknown", msg),
    }
}

/// On the silent path, rejections that a user could fix become
/// `InteractionRequired`.
fn interaction_or(err: AuthError) -> AuthError {
    match err {
        AuthError::Service { code, message } if INTERACTION_CODES.contains(&code.as_str()) => {
            AuthError::InteractionRequired(format!("{}: {}", code, message))
        }
        other => other,
    }
}
