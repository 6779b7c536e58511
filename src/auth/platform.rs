//! Execution-surface capabilities and platform broker seams.
//!
//! A provider never checks the OS itself. It is handed a `PlatformSurface`
//! at construction that says whether interactive UI can be shown and which
//! platform brokers exist. A missing broker short-circuits the provider to
//! the identity client's device-code branch.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use url::Url;

use super::error::AuthError;

/// How long the loopback browser waits for the redirect.
pub const INTERACTIVE_TIMEOUT: Duration = Duration::from_secs(300);

/// What the current execution surface can do.
#[derive(Clone, Default)]
pub struct PlatformSurface {
    /// Whether an interactive consent UI can be presented at all.
    pub supports_interactive_ui: bool,
    pub browser: Option<Arc<dyn BrowserSurface>>,
    pub web_accounts: Option<Arc<dyn WebAccountManager>>,
    pub web_auth: Option<Arc<dyn WebAuthBroker>>,
    pub account_picker: Option<Arc<dyn AccountPicker>>,
}

impl PlatformSurface {
    /// Surface of a desktop terminal: a loopback browser when interactive,
    /// no platform account brokers.
    pub fn detect(interactive: bool) -> Self {
        Self {
            supports_interactive_ui: interactive,
            browser: interactive
                .then(|| Arc::new(LoopbackBrowser::default()) as Arc<dyn BrowserSurface>),
            web_accounts: None,
            web_auth: None,
            account_picker: None,
        }
    }

    /// Surface with no UI and no brokers; everything ends in device code.
    pub fn headless() -> Self {
        Self::default()
    }

    pub fn describe(&self) -> String {
        let mut parts = vec![if self.supports_interactive_ui {
            "interactive"
        } else {
            "headless"
        }];
        if self.web_accounts.is_some() {
            parts.push("web-accounts");
        }
        if self.web_auth.is_some() {
            parts.push("web-auth-broker");
        }
        if self.account_picker.is_some() {
            parts.push("account-picker");
        }
        parts.join(", ")
    }
}

/// A place where an authorize URL can be shown and its redirect captured.
#[async_trait]
pub trait BrowserSurface: Send + Sync {
    async fn open(&self) -> Result<Box<dyn BrowserSession>, AuthError>;
}

/// One authorization round trip.
#[async_trait]
pub trait BrowserSession: Send {
    /// Redirect URI to register in the authorize request.
    fn redirect_uri(&self) -> &str;

    /// Send the user to `authorize_url` and return the URL the identity
    /// provider redirected back to.
    async fn navigate(&mut self, authorize_url: &Url) -> Result<Url, AuthError>;
}

/// How long one loopback connection may take to send its request line.
/// Browsers open idle preconnect sockets that never send anything.
pub const REQUEST_LINE_TIMEOUT: Duration = Duration::from_secs(5);

/// Captures the redirect on an ephemeral `http://localhost` port, listening
/// on both loopback addresses since `localhost` may resolve to either.
pub struct LoopbackBrowser {
    timeout: Duration,
    request_timeout: Duration,
}

impl LoopbackBrowser {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
            request_timeout: REQUEST_LINE_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }
}

impl Default for LoopbackBrowser {
    fn default() -> Self {
        Self::with_timeout(INTERACTIVE_TIMEOUT)
    }
}

fn bind_error(e: impl std::fmt::Display) -> AuthError {
    AuthError::client("no_ui", format!("loopback bind failed: {}", e))
}

/// Loopback listeners sharing one port: IPv4, IPv6, or both.
struct LoopbackListeners {
    port: u16,
    v4: Option<TcpListener>,
    v6: Option<TcpListener>,
}

impl LoopbackListeners {
    async fn bind() -> Result<Self, AuthError> {
        match TcpListener::bind(("127.0.0.1", 0)).await {
            Ok(v4) => {
                let port = v4.local_addr().map_err(bind_error)?.port();
                let v6 = match TcpListener::bind(("::1", port)).await {
                    Ok(listener) => Some(listener),
                    Err(e) => {
                        tracing::debug!("IPv6 loopback unavailable on port {}: {}", port, e);
                        None
                    }
                };
                Ok(Self {
                    port,
                    v4: Some(v4),
                    v6,
                })
            }
            Err(v4_err) => {
                let v6 = TcpListener::bind(("::1", 0))
                    .await
                    .map_err(|e| bind_error(format!("127.0.0.1 ({}); ::1 ({})", v4_err, e)))?;
                let port = v6.local_addr().map_err(bind_error)?.port();
                Ok(Self {
                    port,
                    v4: None,
                    v6: Some(v6),
                })
            }
        }
    }

    async fn accept(&self) -> std::io::Result<TcpStream> {
        let (stream, _) = match (&self.v4, &self.v6) {
            (Some(v4), Some(v6)) => tokio::select! {
                accepted = v4.accept() => accepted,
                accepted = v6.accept() => accepted,
            },
            (Some(listener), None) | (None, Some(listener)) => listener.accept().await,
            (None, None) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "no loopback listener",
                ))
            }
        }?;
        Ok(stream)
    }
}

#[async_trait]
impl BrowserSurface for LoopbackBrowser {
    async fn open(&self) -> Result<Box<dyn BrowserSession>, AuthError> {
        let listeners = LoopbackListeners::bind().await?;
        Ok(Box::new(LoopbackSession {
            redirect_uri: format!("http://localhost:{}", listeners.port),
            listeners,
            timeout: self.timeout,
            request_timeout: self.request_timeout,
        }))
    }
}

struct LoopbackSession {
    listeners: LoopbackListeners,
    redirect_uri: String,
    timeout: Duration,
    request_timeout: Duration,
}

const LOOPBACK_REPLY: &str = "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nConnection: close\r\n\r\n<html><body>Authentication complete. You can close this window.</body></html>";

impl LoopbackSession {
    /// Accept connections until one carries an authorization response.
    async fn wait_for_redirect(&self) -> Result<Url, AuthError> {
        let base = Url::parse(&self.redirect_uri)
            .map_err(|e| AuthError::client("invalid_redirect", e.to_string()))?;

        loop {
            let stream = self
                .listeners
                .accept()
                .await
                .map_err(|e| AuthError::client("no_ui", e.to_string()))?;
            let (read_half, mut write_half) = stream.into_split();
            let mut reader = BufReader::new(read_half);

            let mut request_line = String::new();
            match tokio::time::timeout(self.request_timeout, reader.read_line(&mut request_line))
                .await
            {
                Ok(Ok(_)) => {}
                _ => continue,
            }
            // "GET /?code=...&state=... HTTP/1.1"
            let Some(target) = request_line.split_whitespace().nth(1) else {
                continue;
            };
            let Ok(url) = base.join(target) else {
                continue;
            };
            let is_response = url
                .query_pairs()
                .any(|(k, _)| k == "code" || k == "error");
            if !is_response {
                let _ = write_half
                    .write_all(b"HTTP/1.1 404 Not Found\r\nConnection: close\r\n\r\n")
                    .await;
                continue;
            }

            let _ = write_half.write_all(LOOPBACK_REPLY.as_bytes()).await;
            let _ = write_half.shutdown().await;
            return Ok(url);
        }
    }
}

#[async_trait]
impl BrowserSession for LoopbackSession {
    fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    async fn navigate(&mut self, authorize_url: &Url) -> Result<Url, AuthError> {
        println!();
        println!("To sign in, open this URL in a browser:");
        println!("{}", authorize_url);
        println!();

        tracing::info!("Waiting for browser redirect on {}...", self.redirect_uri);
        tokio::time::timeout(self.timeout, self.wait_for_redirect())
            .await
            .map_err(|_| AuthError::client("timeout", "no browser redirect received"))?
    }
}

/// Identity provider registered with the platform account manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebAccountProvider {
    pub id: String,
    pub display_name: String,
    pub authority: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebAccount {
    pub id: String,
    pub username: String,
    pub state: String,
}

#[derive(Debug, Clone)]
pub struct WebTokenRequest {
    pub provider: WebAccountProvider,
    pub scope: String,
    pub client_id: String,
    pub properties: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebTokenStatus {
    Success,
    UserCancel,
    AccountSwitch,
    UserInteractionRequired,
    AccountProviderNotAvailable,
    ProviderError,
}

#[derive(Debug, Clone)]
pub struct WebProviderError {
    pub code: u32,
    pub message: String,
    pub properties: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct WebTokenResponse {
    pub token: String,
    pub account: WebAccount,
    pub properties: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct WebTokenResult {
    pub status: WebTokenStatus,
    pub data: Vec<WebTokenResponse>,
    pub error: Option<WebProviderError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentResult {
    Verified,
    NotAvailable,
    Rejected,
}

/// Platform web-account manager (token broker with system accounts).
#[async_trait]
pub trait WebAccountManager: Send + Sync {
    async fn find_account_provider(
        &self,
        provider_id: &str,
        authority: &str,
    ) -> Result<WebAccountProvider, AuthError>;

    async fn find_all_accounts(
        &self,
        provider: &WebAccountProvider,
    ) -> Result<Vec<WebAccount>, AuthError>;

    async fn find_account(
        &self,
        provider: &WebAccountProvider,
        account_id: &str,
    ) -> Result<Option<WebAccount>, AuthError>;

    async fn get_token_silently(
        &self,
        request: &WebTokenRequest,
        account: Option<&WebAccount>,
    ) -> Result<WebTokenResult, AuthError>;

    async fn request_token(
        &self,
        request: &WebTokenRequest,
        account: Option<&WebAccount>,
    ) -> Result<WebTokenResult, AuthError>;

    /// 64x64 account picture.
    async fn account_picture(&self, account: &WebAccount) -> Result<Vec<u8>, AuthError>;

    async fn sign_out(&self, account: &WebAccount) -> Result<(), AuthError>;

    /// Ask the platform to verify the user (biometrics or PIN).
    async fn request_user_consent(&self, message: &str) -> Result<ConsentResult, AuthError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebAuthStatus {
    Success,
    UserCancel,
    ErrorHttp,
}

#[derive(Debug, Clone)]
pub struct WebAuthResult {
    pub status: WebAuthStatus,
    /// Final redirect URL on success.
    pub response_data: String,
    /// HTTP status for `ErrorHttp`.
    pub error_detail: u32,
}

/// Platform web-authentication broker (hosted browser dialog).
#[async_trait]
pub trait WebAuthBroker: Send + Sync {
    fn callback_uri(&self) -> String;

    async fn authenticate_silently(&self, request: &Url) -> Result<WebAuthResult, AuthError>;

    async fn authenticate(&self, request: &Url) -> Result<WebAuthResult, AuthError>;
}

/// Platform account picker pane.
#[async_trait]
pub trait AccountPicker: Send + Sync {
    /// Show the pane and return the token for whichever account the user
    /// picked.
    async fn pick(&self, request: &WebTokenRequest) -> Result<WebTokenResult, AuthError>;
}
