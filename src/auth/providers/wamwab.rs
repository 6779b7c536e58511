//! Combined broker provider: web-account manager first, web authentication
//! broker when the manager cannot deliver.

use std::sync::Arc;

use async_trait::async_trait;

use super::wab::{broker_sign_out, BrokerFlow};
use super::wam::{sign_out_web_account, WebAccountFlow};
use super::{
    run_login, ClientFlow, LoginFlow, LoginProvider, ProviderContext, ProviderCore, ProviderKind,
};
use crate::auth::client::IdentityClient;
use crate::auth::error::AuthError;
use crate::auth::platform::WebAccountManager;
use crate::auth::token::{AuthResult, Token};

pub struct WamWabProvider {
    core: ProviderCore,
    client: Arc<dyn IdentityClient>,
}

impl WamWabProvider {
    pub fn new(ctx: &ProviderContext, client: Arc<dyn IdentityClient>) -> Self {
        Self {
            core: ProviderCore::new(ProviderKind::WamWab, ctx),
            client,
        }
    }
}

struct CombinedFlow<'a> {
    core: &'a ProviderCore,
    wam: Option<&'a dyn WebAccountManager>,
    web: Option<WebAccountFlow<'a>>,
    broker: Option<BrokerFlow<'a>>,
    /// Manager failure kept until the broker has had its turn.
    silent_failure: Option<AuthError>,
}

impl CombinedFlow<'_> {
    /// Log a manager failure the broker recovered from, or that never
    /// reached the broker.
    fn report_manager_failure(&mut self) {
        if let Some(err) = self.silent_failure.take() {
            for line in err.describe() {
                self.core
                    .log(&format!("Web account manager failed: {}", line));
            }
        }
    }

    async fn log_accounts(&mut self, user_id: Option<&str>) -> Result<(), AuthError> {
        let (Some(wam), Some(web)) = (self.wam, self.web.as_mut()) else {
            return Ok(());
        };
        web.prepare(user_id).await?;
        let Some(provider) = web.provider() else {
            return Ok(());
        };

        let accounts = wam.find_all_accounts(provider).await?;
        self.core
            .log(&format!("Found {} web account(s)", accounts.len()));
        for account in &accounts {
            self.core
                .log(&format!("  {} ({})", account.username, account.state));
        }
        Ok(())
    }
}

#[async_trait]
impl LoginFlow for CombinedFlow<'_> {
    async fn silent(&mut self, user_id: Option<&str>) -> Result<AuthResult, AuthError> {
        if self.web.is_none() {
            return match self.broker.as_mut() {
                Some(broker) => broker.silent(user_id).await,
                None => Err(AuthError::InteractionRequired("no broker available".into())),
            };
        }

        let outcome = match self.log_accounts(user_id).await {
            Ok(()) => match self.web.as_mut() {
                Some(web) => web.silent(user_id).await,
                None => Err(AuthError::InteractionRequired("no web account manager".into())),
            },
            Err(err) => Err(err),
        };

        match outcome {
            Err(err) if !err.is_interaction_required() && self.broker.is_some() => {
                self.silent_failure = Some(err);
                Err(AuthError::InteractionRequired(
                    "web account manager failed, trying the web authentication broker".into(),
                ))
            }
            other => other,
        }
    }

    fn interactive_available(&self) -> bool {
        self.broker.is_some() || self.web.is_some()
    }

    async fn interactive(&mut self, user_id: Option<&str>) -> Result<AuthResult, AuthError> {
        let Some(broker) = self.broker.as_mut() else {
            return match self.web.as_mut() {
                Some(web) => web.interactive(user_id).await,
                None => Err(AuthError::client("no_ui", "no broker available")),
            };
        };

        match broker.interactive(user_id).await {
            Ok(mut result) => {
                self.report_manager_failure();
                // Remember the device account when the manager knows it, so the
                // next silent attempt can find it.
                if let Some(account) = self.web.as_ref().and_then(|w| w.account()) {
                    result.account_id = Some(account.id.clone());
                }
                Ok(result)
            }
            Err(err) => match self.silent_failure.take() {
                Some(first) => Err(AuthError::Aggregate(vec![first, err])),
                None => Err(err),
            },
        }
    }
}

#[async_trait]
impl LoginProvider for WamWabProvider {
    fn core(&self) -> &ProviderCore {
        &self.core
    }

    async fn login(&self) -> Result<Token, AuthError> {
        self.core
            .log("Logging in with WebAuthenticationBroker & WebAuthenticationCoreManager...");
        let surface = self.core.surface();
        let wam = surface.web_accounts.as_deref();
        let broker = surface.web_auth.as_deref();

        if wam.is_none() && broker.is_none() {
            self.core
                .log("No platform broker available, using the identity client");
            let mut flow = ClientFlow::device_only(self.client.as_ref());
            return run_login(&self.core, &mut flow, self.client.as_ref()).await;
        }

        let mut flow = CombinedFlow {
            core: &self.core,
            wam,
            web: wam.map(|wam| WebAccountFlow::new(&self.core, wam)),
            broker: broker.map(|broker| BrokerFlow::new(&self.core, broker)),
            silent_failure: None,
        };
        let outcome = run_login(&self.core, &mut flow, self.client.as_ref()).await;
        flow.report_manager_failure();
        outcome
    }

    async fn sign_out(&self) -> Result<(), AuthError> {
        self.core.clear_log();
        let surface = self.core.surface();
        let mut failures = Vec::new();

        if let (Some(wam), Some(id)) = (surface.web_accounts.as_deref(), self.core.stored_user_id())
        {
            if let Err(err) = sign_out_web_account(&self.core, wam, &id).await {
                failures.push(err);
            }
        }
        if let Some(broker) = surface.web_auth.as_deref() {
            if let Err(err) = broker_sign_out(self.core.context(), broker).await {
                failures.push(err);
            }
        }

        let backend = if failures.is_empty() {
            Ok(())
        } else {
            Err(AuthError::aggregate(failures))
        };
        self.core.finish_sign_out(backend)
    }
}
