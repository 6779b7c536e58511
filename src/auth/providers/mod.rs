//! Authentication providers.
//!
//! Every provider runs the same state machine against a different backend:
//!
//! ```text
//! START -> SILENT_ATTEMPT -> SUCCESS
//!                         -> NEEDS_INTERACTION -> INTERACTIVE | DEVICE_CODE -> SUCCESS | FAILED
//! ```
//!
//! `run_login` drives it; a provider only supplies a `LoginFlow` with its
//! silent and interactive steps. Device code always goes through the
//! provider's `IdentityClient`.

pub mod adal;
pub mod msal;
pub mod wab;
pub mod wam;
pub mod wamwab;
pub mod wap;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::client::{DeviceCode, IdentityClient};
use super::error::AuthError;
use super::log_buffer::{Diagnostics, LogBuffer};
use super::platform::PlatformSurface;
use super::token::{AuthResult, Session, Token};
use super::user_store::UserStore;
use super::AuthConfig;

pub use adal::AdalProvider;
pub use msal::MsalProvider;
pub use wab::WabProvider;
pub use wam::WamProvider;
pub use wamwab::WamWabProvider;
pub use wap::WapProvider;

/// The closed set of backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    /// Platform web-account manager.
    Wam,
    /// Modern identity library.
    Msal,
    /// Legacy directory library with a durable token cache.
    Adal,
    /// Web-account manager with web-authentication-broker fallback.
    WamWab,
    /// Platform web-authentication broker.
    Wab,
    /// Platform account picker.
    Wap,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 6] = [
        ProviderKind::Wam,
        ProviderKind::Msal,
        ProviderKind::Adal,
        ProviderKind::WamWab,
        ProviderKind::Wab,
        ProviderKind::Wap,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            ProviderKind::Wam => "WAM",
            ProviderKind::Msal => "MSAL",
            ProviderKind::Adal => "ADAL",
            ProviderKind::WamWab => "WAMWAB",
            ProviderKind::Wab => "WAB",
            ProviderKind::Wap => "WAP",
        }
    }

    /// Identity-store key for the last signed-in user.
    pub fn user_id_key(&self) -> &'static str {
        match self {
            ProviderKind::Wam => "UserIdWAM",
            ProviderKind::Msal => "UserIdMSAL",
            ProviderKind::Adal => "UserIdADAL",
            ProviderKind::WamWab => "UserIdWAMWAB",
            ProviderKind::Wab => "UserIdKeyWAB",
            ProviderKind::Wap => "UserIdKeyWAP",
        }
    }

    pub fn provider_name(&self) -> &'static str {
        match self {
            ProviderKind::Wam => "WebAuthenticationCoreManager",
            ProviderKind::Msal => "Microsoft Authentication Library (MSAL)",
            ProviderKind::Adal => "Active Directory Authentication Library (ADAL)",
            ProviderKind::WamWab => "WebAuthenticationBroker & WebAuthenticationCoreManager",
            ProviderKind::Wab => "WebAuthenticationBroker",
            ProviderKind::Wap => "WindowsAccountProvider",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ProviderKind::Wam => "Obtains tokens from the platform's web account providers, reusing accounts the user already signed into on this device.",
            ProviderKind::Msal => "Acquires tokens from the Microsoft identity platform endpoint with the modern identity library; the token cache lives for the process.",
            ProviderKind::Adal => "Acquires tokens from Azure AD with the legacy directory library; its token cache is persisted to disk between runs.",
            ProviderKind::WamWab => "Tries the web account manager silently first, then falls back to the web authentication broker's hosted sign-in page.",
            ProviderKind::Wab => "Drives an OAuth implicit flow through the platform web authentication broker, handling the identity provider page and redirects.",
            ProviderKind::Wap => "Lets the user pick or add an account in the platform accounts pane and returns its token.",
        }
    }

    /// Parse a provider id, ignoring case.
    pub fn from_id(id: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.id().eq_ignore_ascii_case(id))
    }
}

/// Everything a provider is constructed with.
#[derive(Clone)]
pub struct ProviderContext {
    pub diagnostics: Diagnostics,
    pub store: Arc<dyn UserStore>,
    pub surface: PlatformSurface,
    pub auth: AuthConfig,
    /// Authority passed to the platform account manager (e.g. "organizations").
    pub authority: String,
    /// Resource the platform brokers request tokens for.
    pub resource: String,
}

/// Common contract of all providers.
#[async_trait]
pub trait LoginProvider: Send + Sync {
    fn core(&self) -> &ProviderCore;

    /// Silent first, then interactive or device code. Classified failures
    /// are logged and yield an empty token; only aggregate failures are
    /// returned as errors.
    async fn login(&self) -> Result<Token, AuthError>;

    /// Clear backend and local session state. Local state is always
    /// cleared, even when the backend part fails.
    async fn sign_out(&self) -> Result<(), AuthError>;

    /// Returns false for providers without a consent step.
    fn set_biometrics_required(&self, _required: bool) -> bool {
        false
    }

    fn kind(&self) -> ProviderKind {
        self.core().kind()
    }

    fn id(&self) -> &'static str {
        self.kind().id()
    }

    fn provider_name(&self) -> &'static str {
        self.kind().provider_name()
    }

    fn description(&self) -> &'static str {
        self.kind().description()
    }

    fn user_id_key(&self) -> &'static str {
        self.kind().user_id_key()
    }

    fn session(&self) -> Session {
        self.core().session()
    }

    fn is_signed_in(&self) -> bool {
        self.core().session().is_signed_in()
    }

    /// User id kept from an earlier run, if any.
    fn remembered_user(&self) -> Option<String> {
        self.core().stored_user_id()
    }

    fn log(&self, message: &str) {
        self.core().log(message);
    }

    fn clear_log(&self) {
        self.core().clear_log();
    }

    fn log_content(&self) -> String {
        self.core().log_content()
    }

    fn set_prefer_device_code(&self, prefer: bool) {
        self.core().set_prefer_device_code(prefer);
    }
}

/// State shared by every provider variant.
pub struct ProviderCore {
    kind: ProviderKind,
    ctx: ProviderContext,
    log: LogBuffer,
    session: RwLock<Session>,
    prefer_device_code: AtomicBool,
}

impl ProviderCore {
    pub fn new(kind: ProviderKind, ctx: &ProviderContext) -> Self {
        Self {
            kind,
            ctx: ctx.clone(),
            log: LogBuffer::new(),
            session: RwLock::new(Session::default()),
            prefer_device_code: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> ProviderKind {
        self.kind
    }

    pub fn context(&self) -> &ProviderContext {
        &self.ctx
    }

    pub fn surface(&self) -> &PlatformSurface {
        &self.ctx.surface
    }

    /// Append to the provider log, the diagnostic stream and tracing.
    pub fn log(&self, message: &str) {
        tracing::info!(provider = self.kind.id(), "{}", message);
        self.log.log(message);
        self.ctx.diagnostics.emit(self.kind.id(), message);
    }

    pub fn clear_log(&self) {
        self.log.clear();
    }

    pub fn log_content(&self) -> String {
        self.log.to_string()
    }

    /// Snapshot of the session; the fields are always read together.
    pub fn session(&self) -> Session {
        self.session
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn prefers_device_code(&self) -> bool {
        self.prefer_device_code.load(Ordering::Relaxed)
    }

    pub fn set_prefer_device_code(&self, prefer: bool) {
        self.prefer_device_code.store(prefer, Ordering::Relaxed);
    }

    pub fn stored_user_id(&self) -> Option<String> {
        self.ctx.store.get_user_id(self.kind.user_id_key())
    }

    /// SUCCESS: publish the new session in one write and remember the user.
    fn complete(&self, result: AuthResult) -> Token {
        let token = result.token.clone();
        let username = result.username.clone().unwrap_or_default();

        {
            let mut session = self.session.write().unwrap_or_else(|e| e.into_inner());
            *session = Session {
                token: result.token,
                secondary_token: result.secondary_token.unwrap_or_default(),
                username: username.clone(),
                picture: result.picture,
            };
        }

        match result.account_id.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => self.ctx.store.save_user(self.kind.user_id_key(), id),
            None => self.log("Backend returned no account id; identity mapping not updated"),
        }

        self.log(&format!("Username = {}", username));
        self.log(&format!("Access Token: {}", token.preview()));
        token
    }

    /// Provider boundary: success is published, classified failures become
    /// log lines and an empty token, aggregates are logged and returned.
    pub fn settle(&self, outcome: Result<AuthResult, AuthError>) -> Result<Token, AuthError> {
        match outcome {
            Ok(result) => Ok(self.complete(result)),
            Err(err) => {
                for line in err.describe() {
                    self.log(&line);
                }
                match err {
                    AuthError::Aggregate(_) => Err(err),
                    _ => Ok(Token::default()),
                }
            }
        }
    }

    /// Finish a sign-out: log any backend failure, then clear the identity
    /// mapping and the session unconditionally.
    pub fn finish_sign_out(&self, backend: Result<(), AuthError>) -> Result<(), AuthError> {
        if let Err(err) = backend {
            for line in err.describe() {
                self.log(&format!("Backend sign-out failed: {}", line));
            }
        }

        self.ctx.store.clear_user(self.kind.user_id_key());
        *self.session.write().unwrap_or_else(|e| e.into_inner()) = Session::default();
        self.log("Signed Out");
        Ok(())
    }
}

/// Backend-specific steps of a login.
#[async_trait]
pub(crate) trait LoginFlow: Send {
    async fn silent(&mut self, user_id: Option<&str>) -> Result<AuthResult, AuthError>;

    /// Whether this backend can show its own UI here.
    fn interactive_available(&self) -> bool;

    async fn interactive(&mut self, user_id: Option<&str>) -> Result<AuthResult, AuthError>;
}

/// Drive one login through the state machine.
pub(crate) async fn run_login(
    core: &ProviderCore,
    flow: &mut dyn LoginFlow,
    client: &dyn IdentityClient,
) -> Result<Token, AuthError> {
    let user_id = core.stored_user_id();
    core.log(&format!(
        "User Id: {}",
        user_id.as_deref().unwrap_or("<any user>")
    ));

    core.log("Attempting silent token acquisition...");
    let outcome = match flow.silent(user_id.as_deref()).await {
        Err(AuthError::InteractionRequired(reason)) => {
            core.log(&format!("Silent acquisition needs interaction: {}", reason));
            let use_ui = core.surface().supports_interactive_ui
                && flow.interactive_available()
                && !core.prefers_device_code();
            if use_ui {
                core.log("Attempting interactive token acquisition...");
                flow.interactive(user_id.as_deref()).await
            } else {
                device_code(core, client).await
            }
        }
        other => other,
    };

    core.settle(outcome)
}

/// Device-code branch: the instructions go to the provider log so the
/// consumer sees them while the wait is in progress.
pub(crate) async fn device_code(
    core: &ProviderCore,
    client: &dyn IdentityClient,
) -> Result<AuthResult, AuthError> {
    core.log("Attempting device code token acquisition...");
    let show = |code: &DeviceCode| core.log(&code.message);
    client.acquire_token_with_device_code(&show).await
}

/// Flow backed entirely by the identity client.
pub(crate) struct ClientFlow<'a> {
    client: &'a dyn IdentityClient,
    allow_interactive: bool,
}

impl<'a> ClientFlow<'a> {
    pub(crate) fn new(client: &'a dyn IdentityClient) -> Self {
        Self {
            client,
            allow_interactive: true,
        }
    }

    /// For platform providers whose broker is missing: silent through the
    /// client, then straight to device code.
    pub(crate) fn device_only(client: &'a dyn IdentityClient) -> Self {
        Self {
            client,
            allow_interactive: false,
        }
    }
}

#[async_trait]
impl LoginFlow for ClientFlow<'_> {
    async fn silent(&mut self, user_id: Option<&str>) -> Result<AuthResult, AuthError> {
        self.client.acquire_token_silent(user_id).await
    }

    fn interactive_available(&self) -> bool {
        self.allow_interactive && self.client.supports_interactive()
    }

    async fn interactive(&mut self, user_id: Option<&str>) -> Result<AuthResult, AuthError> {
        self.client.acquire_token_interactive(user_id).await
    }
}
