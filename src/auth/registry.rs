//! Provider registry: one instance of every provider, built once per process.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use anyhow::{anyhow, Result};

use super::client::{AadClient, IdentityClient};
use super::log_buffer::Diagnostics;
use super::platform::PlatformSurface;
use super::providers::{
    AdalProvider, LoginProvider, MsalProvider, ProviderContext, ProviderKind, WabProvider,
    WamProvider, WamWabProvider, WapProvider,
};
use super::token_cache::{DurableTokenCache, TokenCache};
use super::user_store::UserStore;
use super::AuthConfig;
use crate::config::Settings;

static REGISTRY: OnceLock<Arc<ProviderRegistry>> = OnceLock::new();

pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn LoginProvider>>,
}

impl ProviderRegistry {
    /// Build every provider against Azure AD. Each backend gets its own
    /// identity client; only ADAL's token cache is written to `cache_path`.
    pub fn register_all(
        diagnostics: Diagnostics,
        store: Arc<dyn UserStore>,
        settings: &Settings,
        surface: PlatformSurface,
        cache_path: PathBuf,
    ) -> Self {
        let ctx = ProviderContext {
            diagnostics,
            store,
            auth: AuthConfig::from_settings(settings),
            authority: settings.authority.clone(),
            resource: settings.resource.clone(),
            surface,
        };

        let mut durable = Some(DurableTokenCache::new(cache_path));
        let auth = ctx.auth.clone();
        let browser = ctx.surface.browser.clone();
        Self::register_with(ctx, move |kind| {
            let cache = match (kind, durable.take()) {
                (ProviderKind::Adal, Some(durable)) => TokenCache::persistent(durable),
                _ => TokenCache::in_memory(),
            };
            Arc::new(AadClient::new(auth.clone(), cache).with_browser(browser.clone()))
        })
    }

    /// Build every provider with identity clients from `make_client`.
    pub fn register_with(
        ctx: ProviderContext,
        mut make_client: impl FnMut(ProviderKind) -> Arc<dyn IdentityClient>,
    ) -> Self {
        let providers = ProviderKind::ALL
            .into_iter()
            .map(|kind| {
                let client = make_client(kind);
                let provider: Arc<dyn LoginProvider> = match kind {
                    ProviderKind::Wam => Arc::new(WamProvider::new(&ctx, client)),
                    ProviderKind::Msal => Arc::new(MsalProvider::new(&ctx, client)),
                    ProviderKind::Adal => Arc::new(AdalProvider::new(&ctx, client)),
                    ProviderKind::WamWab => Arc::new(WamWabProvider::new(&ctx, client)),
                    ProviderKind::Wab => Arc::new(WabProvider::new(&ctx, client)),
                    ProviderKind::Wap => Arc::new(WapProvider::new(&ctx, client)),
                };
                (kind, provider)
            })
            .collect();

        tracing::debug!(
            "Registered {} providers on a {} surface",
            ProviderKind::ALL.len(),
            ctx.surface.describe()
        );
        Self { providers }
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn LoginProvider>> {
        let kind = ProviderKind::from_id(id)?;
        self.providers.get(&kind).cloned()
    }

    /// All providers in a stable order.
    pub fn list(&self) -> Vec<Arc<dyn LoginProvider>> {
        ProviderKind::ALL
            .iter()
            .filter_map(|kind| self.providers.get(kind).cloned())
            .collect()
    }
}

/// Install the process-wide registry. Registration happens exactly once.
pub fn init(registry: ProviderRegistry) -> Result<Arc<ProviderRegistry>> {
    let registry = Arc::new(registry);
    REGISTRY
        .set(registry.clone())
        .map_err(|_| anyhow!("Provider registry is already initialised"))?;
    Ok(registry)
}
