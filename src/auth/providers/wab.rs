//! Web authentication broker provider.
//!
//! Runs an OAuth implicit flow through the platform broker: the broker
//! hosts the sign-in page and hands back the final redirect, whose fragment
//! carries the tokens.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use url::Url;
use uuid::Uuid;

use super::{
    run_login, ClientFlow, LoginFlow, LoginProvider, ProviderContext, ProviderCore, ProviderKind,
};
use crate::auth::claims;
use crate::auth::client::IdentityClient;
use crate::auth::error::AuthError;
use crate::auth::platform::{WebAuthBroker, WebAuthResult, WebAuthStatus};
use crate::auth::token::{AuthResult, Token};

/// `prompt=none` failures that a visible sign-in page can resolve.
const SILENT_REJECTIONS: &[&str] = &["login_required", "interaction_required", "consent_required"];

/// One authorize request with its own `state` and `nonce`.
pub(crate) struct ImplicitRequest {
    url: Url,
    state: String,
    silent: bool,
}

impl ImplicitRequest {
    pub(crate) fn new(
        ctx: &ProviderContext,
        redirect_uri: &str,
        silent: bool,
    ) -> Result<Self, AuthError> {
        let state = Uuid::new_v4().to_string();
        let nonce = Uuid::new_v4().to_string();
        let scope = ["openid", "profile"]
            .into_iter()
            .chain(ctx.auth.scopes.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");

        let mut url = Url::parse(&ctx.auth.endpoint("authorize"))
            .map_err(|e| AuthError::client("invalid_client_config", e.to_string()))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", &ctx.auth.client_id)
                .append_pair("response_type", "token id_token")
                .append_pair("redirect_uri", redirect_uri)
                .append_pair("scope", &scope)
                .append_pair("response_mode", "fragment")
                .append_pair("state", &state)
                .append_pair("nonce", &nonce);
            if silent {
                query.append_pair("prompt", "none");
            }
        }

        Ok(Self { url, state, silent })
    }

    pub(crate) fn url(&self) -> &Url {
        &self.url
    }

    /// Turn the broker's answer into tokens and identity.
    pub(crate) fn parse(&self, result: WebAuthResult) -> Result<AuthResult, AuthError> {
        match result.status {
            WebAuthStatus::Success => {}
            WebAuthStatus::UserCancel => {
                return Err(AuthError::client("user_cancel", "the user cancelled sign-in"))
            }
            WebAuthStatus::ErrorHttp => {
                return Err(AuthError::service(
                    format!("http_{}", result.error_detail),
                    format!(
                        "web authentication broker failed with HTTP {}",
                        result.error_detail
                    ),
                ))
            }
        }

        let params = response_params(&result.response_data);

        if let Some(error) = params.get("error") {
            let description = params.get("error_description").cloned().unwrap_or_default();
            if self.silent && SILENT_REJECTIONS.contains(&error.as_str()) {
                return Err(AuthError::InteractionRequired(format!(
                    "{}: {}",
                    error, description
                )));
            }
            return Err(AuthError::service(error.clone(), description));
        }

        if params.get("state") != Some(&self.state) {
            return Err(AuthError::client(
                "state_mismatch",
                "broker response state does not match the request",
            ));
        }

        let access_token = params.get("access_token").ok_or_else(|| {
            AuthError::service("invalid_response", "broker response carried no access token")
        })?;
        let expires_in = params.get("expires_in").and_then(|s| s.parse::<u64>().ok());
        let id_token = params.get("id_token");

        // Azure AD access tokens are JWTs too; use them when no id_token came back.
        let identity = id_token
            .and_then(|t| claims::decode_unverified(t))
            .or_else(|| claims::decode_unverified(access_token));

        Ok(AuthResult {
            token: Token::new(access_token.clone(), expires_in),
            secondary_token: id_token.map(|t| Token::new(t.clone(), expires_in)),
            account_id: identity.as_ref().and_then(|c| c.account_id()),
            username: identity.as_ref().and_then(|c| c.username()),
            picture: None,
        })
    }
}

/// Key/value pairs of the redirect fragment (or query). Accepts a bare
/// fragment too.
fn response_params(data: &str) -> HashMap<String, String> {
    let encoded = match Url::parse(data) {
        Ok(url) => url
            .fragment()
            .or_else(|| url.query())
            .unwrap_or_default()
            .to_string(),
        Err(_) => data.trim_start_matches('#').to_string(),
    };
    url::form_urlencoded::parse(encoded.as_bytes())
        .into_owned()
        .collect()
}

/// Logout through the broker so its cookies are dropped too.
pub(crate) async fn broker_sign_out(
    ctx: &ProviderContext,
    broker: &dyn WebAuthBroker,
) -> Result<(), AuthError> {
    let mut url = Url::parse(&ctx.auth.endpoint("logout"))
        .map_err(|e| AuthError::client("invalid_client_config", e.to_string()))?;
    url.query_pairs_mut()
        .append_pair("post_logout_redirect_uri", &broker.callback_uri());

    let result = broker.authenticate_silently(&url).await?;
    match result.status {
        WebAuthStatus::Success => Ok(()),
        status => Err(AuthError::client(
            "logout_failed",
            format!("broker logout returned {:?} ({})", status, result.error_detail),
        )),
    }
}

/// Implicit flow through the broker: `prompt=none` first, then the
/// hosted sign-in page.
pub(crate) struct BrokerFlow<'a> {
    core: &'a ProviderCore,
    broker: &'a dyn WebAuthBroker,
}

impl<'a> BrokerFlow<'a> {
    pub(crate) fn new(core: &'a ProviderCore, broker: &'a dyn WebAuthBroker) -> Self {
        Self { core, broker }
    }

    fn request(&self, silent: bool) -> Result<ImplicitRequest, AuthError> {
        let request =
            ImplicitRequest::new(self.core.context(), &self.broker.callback_uri(), silent)?;
        tracing::debug!("Broker start URI: {}", request.url());
        Ok(request)
    }
}

#[async_trait]
impl LoginFlow for BrokerFlow<'_> {
    async fn silent(&mut self, _user_id: Option<&str>) -> Result<AuthResult, AuthError> {
        let request = self.request(true)?;
        let result = self.broker.authenticate_silently(request.url()).await?;
        self.core
            .log(&format!("Silent broker result: {:?}", result.status));

        if result.status != WebAuthStatus::Success {
            return Err(AuthError::InteractionRequired(format!(
                "silent broker authentication returned {:?}",
                result.status
            )));
        }
        request.parse(result)
    }

    fn interactive_available(&self) -> bool {
        true
    }

    async fn interactive(&mut self, _user_id: Option<&str>) -> Result<AuthResult, AuthError> {
        let request = self.request(false)?;
        let result = self.broker.authenticate(request.url()).await?;
        self.core
            .log(&format!("Broker result: {:?}", result.status));
        request.parse(result)
    }
}

pub struct WabProvider {
    core: ProviderCore,
    client: Arc<dyn IdentityClient>,
}

impl WabProvider {
    pub fn new(ctx: &ProviderContext, client: Arc<dyn IdentityClient>) -> Self {
        Self {
            core: ProviderCore::new(ProviderKind::Wab, ctx),
            client,
        }
    }
}

#[async_trait]
impl LoginProvider for WabProvider {
    fn core(&self) -> &ProviderCore {
        &self.core
    }

    async fn login(&self) -> Result<Token, AuthError> {
        self.core.log("Logging in with WebAuthenticationBroker...");

        match self.core.surface().web_auth.as_deref() {
            Some(broker) => {
                self.core
                    .log(&format!("Callback URI: {}", broker.callback_uri()));
                let mut flow = BrokerFlow::new(&self.core, broker);
                run_login(&self.core, &mut flow, self.client.as_ref()).await
            }
            None => {
                self.core
                    .log("Web authentication broker not available, using the identity client");
                let mut flow = ClientFlow::device_only(self.client.as_ref());
                run_login(&self.core, &mut flow, self.client.as_ref()).await
            }
        }
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        self.core.clear_log();
        let backend = match self.core.surface().web_auth.as_deref() {
            Some(broker) => broker_sign_out(self.core.context(), broker).await,
            None => match self.core.stored_user_id() {
                Some(id) => self.client.remove_account(&id).await,
                None => Ok(()),
            },
        };
        self.core.finish_sign_out(backend)
    }
}
