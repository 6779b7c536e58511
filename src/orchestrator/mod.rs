//! Acquisition orchestrator: runs provider operations in the background
//! and hands settled results back to a single consumer.
//!
//! Uses an mpsc channel pair like a backend bridge. The consumer submits
//! `Command` values; a background task spawns one worker per command and
//! sends `Settled` values back. The consumer is the only writer of
//! `ViewState`.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::api::{self, SmokeTarget};
use crate::auth::{DiagnosticLine, LoginProvider, ProviderRegistry};

/// What a command does to its provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Login,
    SignOut,
    TestToken,
}

/// Work sent to the background task.
struct Command {
    provider: Arc<dyn LoginProvider>,
    seq: u64,
    operation: Operation,
}

/// Result of one command, produced exactly once.
struct Settled {
    provider: &'static str,
    seq: u64,
    operation: Operation,
    /// Every underlying failure, one line each.
    outcome: Result<(), Vec<String>>,
}

/// Events delivered to the consumer.
#[derive(Debug)]
pub enum Event {
    Settled {
        provider: &'static str,
        operation: Operation,
        outcome: Result<(), Vec<String>>,
    },
    Diagnostic(DiagnosticLine),
}

/// Consumer-visible fields, refreshed from the active provider.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ViewState {
    pub provider_id: String,
    pub provider_name: String,
    pub signed_in: bool,
    pub username: String,
    pub picture: Option<Vec<u8>>,
    pub log_text: String,
}

/// Per-provider sequencing: results are released in submission order.
#[derive(Default)]
struct Lane {
    next_seq: u64,
    next_release: u64,
    held: BTreeMap<u64, Settled>,
}

pub struct Orchestrator {
    registry: Arc<ProviderRegistry>,
    active: Arc<dyn LoginProvider>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    settled_rx: mpsc::UnboundedReceiver<Settled>,
    diagnostics: mpsc::UnboundedReceiver<DiagnosticLine>,
    lanes: HashMap<&'static str, Lane>,
    ready: VecDeque<Event>,
    view: ViewState,
}

impl Orchestrator {
    /// Start the background task. `active` picks the initial provider;
    /// unknown ids fall back to the first registered one.
    pub fn start(
        registry: Arc<ProviderRegistry>,
        active: &str,
        diagnostics: mpsc::UnboundedReceiver<DiagnosticLine>,
        target: SmokeTarget,
    ) -> anyhow::Result<Self> {
        let active = registry
            .get(active)
            .or_else(|| registry.list().into_iter().next())
            .ok_or_else(|| anyhow::anyhow!("No login providers registered"))?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (settled_tx, settled_rx) = mpsc::unbounded_channel();
        tokio::spawn(worker_loop(cmd_rx, settled_tx, Arc::new(target)));

        let mut orchestrator = Self {
            registry,
            active,
            cmd_tx,
            settled_rx,
            diagnostics,
            lanes: HashMap::new(),
            ready: VecDeque::new(),
            view: ViewState::default(),
        };
        orchestrator.refresh_view();
        Ok(orchestrator)
    }

    pub fn view(&self) -> &ViewState {
        &self.view
    }

    pub fn active(&self) -> &Arc<dyn LoginProvider> {
        &self.active
    }

    /// Select the provider later commands run against.
    pub fn set_active_provider(&mut self, id: &str) -> bool {
        match self.registry.get(id) {
            Some(provider) => {
                self.active = provider;
                self.refresh_view();
                true
            }
            None => false,
        }
    }

    pub fn login(&mut self) {
        self.active.log("Logging in with current Login Provider...");
        self.submit(Operation::Login);
    }

    pub fn sign_out(&mut self) {
        self.active.log("Logging out with current Login Provider...");
        self.submit(Operation::SignOut);
    }

    pub fn test_token(&mut self) {
        self.active.log("Testing token...");
        self.submit(Operation::TestToken);
    }

    pub fn clear_log(&mut self) {
        self.active.clear_log();
        self.refresh_view();
    }

    /// Applies to every provider.
    pub fn set_device_code_preference(&mut self, prefer: bool) {
        for provider in self.registry.list() {
            provider.set_prefer_device_code(prefer);
        }
    }

    /// Returns false when the active provider has no consent step.
    pub fn set_biometrics_required(&mut self, required: bool) -> bool {
        self.active.set_biometrics_required(required)
    }

    /// Operations submitted but not yet delivered.
    pub fn in_flight(&self) -> usize {
        self.lanes
            .values()
            .map(|lane| (lane.next_seq - lane.next_release) as usize)
            .sum()
    }

    fn submit(&mut self, operation: Operation) {
        let lane = self.lanes.entry(self.active.id()).or_default();
        let seq = lane.next_seq;
        lane.next_seq += 1;

        let cmd = Command {
            provider: self.active.clone(),
            seq,
            operation,
        };
        if self.cmd_tx.send(cmd).is_err() {
            tracing::error!("Orchestrator channel closed -- command dropped");
        }
        self.refresh_view();
    }

    /// Suspends until the next event. Returns `None` once both channels are
    /// closed. Designed to be used inside `tokio::select!`.
    pub async fn next_event(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.ready.pop_front() {
                return Some(event);
            }

            tokio::select! {
                Some(settled) = self.settled_rx.recv() => self.accept(settled),
                Some(line) = self.diagnostics.recv() => return Some(Event::Diagnostic(line)),
                else => return None,
            }
        }
    }

    /// Hold `settled` until every earlier result for its provider is out.
    fn accept(&mut self, settled: Settled) {
        let provider = settled.provider;
        let lane = self.lanes.entry(provider).or_default();
        lane.held.insert(settled.seq, settled);

        let mut released = Vec::new();
        while let Some(next) = lane.held.remove(&lane.next_release) {
            lane.next_release += 1;
            released.push(next);
        }

        for settled in released {
            self.deliver(settled);
        }
    }

    fn deliver(&mut self, settled: Settled) {
        // Failures were already logged where they happened.
        if settled.outcome.is_ok() {
            if let Some(provider) = self.registry.get(settled.provider) {
                provider.log("Completed successfully.");
            }
        }

        self.refresh_view();
        self.ready.push_back(Event::Settled {
            provider: settled.provider,
            operation: settled.operation,
            outcome: settled.outcome,
        });
    }

    fn refresh_view(&mut self) {
        let session = self.active.session();
        self.view = ViewState {
            provider_id: self.active.id().to_string(),
            provider_name: self.active.provider_name().to_string(),
            signed_in: session.is_signed_in(),
            username: session.username,
            picture: session.picture,
            log_text: self.active.log_content(),
        };
    }
}

/// Background loop: one task per command so a slow device-code wait never
/// holds up other work.
async fn worker_loop(
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    settled_tx: mpsc::UnboundedSender<Settled>,
    target: Arc<SmokeTarget>,
) {
    while let Some(cmd) = cmd_rx.recv().await {
        let settled_tx = settled_tx.clone();
        let target = Arc::clone(&target);

        tokio::spawn(async move {
            let provider = cmd.provider.clone();
            let (seq, operation) = (cmd.seq, cmd.operation);

            // The inner task turns a panic into a failure so the consumer
            // still hears back exactly once.
            let outcome = match tokio::spawn(run(cmd.provider, operation, target)).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let line = format!("{:?} task failed: {}", operation, e);
                    provider.log(&line);
                    Err(vec![line])
                }
            };
            let provider_id = provider.id();

            let _ = settled_tx.send(Settled {
                provider: provider_id,
                seq,
                operation,
                outcome,
            });
        });
    }
}

async fn run(
    provider: Arc<dyn LoginProvider>,
    operation: Operation,
    target: Arc<SmokeTarget>,
) -> Result<(), Vec<String>> {
    match operation {
        Operation::Login => provider
            .login()
            .await
            .map(|_| ())
            .map_err(|e| e.describe()),
        Operation::SignOut => provider.sign_out().await.map_err(|e| e.describe()),
        Operation::TestToken => {
            let token = provider.session().token;
            match api::test_token(&token, &target).await {
                Ok(lines) => {
                    for line in lines {
                        provider.log(&line);
                    }
                    Ok(())
                }
                Err(e) => {
                    let line = format!("{:#}", e);
                    provider.log(&line);
                    Err(vec![line])
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::client::{DeviceCode, IdentityClient};
    use crate::auth::error::AuthError;
    use crate::auth::providers::testing::{context, success, ScriptedClient};
    use crate::auth::token::AuthResult;
    use crate::auth::token_cache::CachedAccount;
    use crate::auth::providers::ProviderKind;
    use crate::auth::{Diagnostics, PlatformSurface};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Identity client whose silent calls take scripted amounts of time.
    struct SlowClient {
        delays: std::sync::Mutex<VecDeque<(Duration, &'static str)>>,
    }

    #[async_trait]
    impl IdentityClient for SlowClient {
        fn supports_interactive(&self) -> bool {
            false
        }

        async fn acquire_token_silent(&self, _: Option<&str>) -> Result<AuthResult, AuthError> {
            let next = self.delays.lock().unwrap().pop_front();
            let (delay, user) = next.expect("unscripted call");
            tokio::time::sleep(delay).await;
            if user == "panic" {
                panic!("backend crashed");
            }
            Ok(success(user, &format!("{}@contoso.com", user)))
        }

        async fn acquire_token_interactive(&self, _: Option<&str>) -> Result<AuthResult, AuthError> {
            Err(AuthError::client("no_ui", "headless"))
        }

        async fn acquire_token_with_device_code(
            &self,
            _: &(dyn for<'c> Fn(&'c DeviceCode) + Send + Sync),
        ) -> Result<AuthResult, AuthError> {
            Err(AuthError::client("no_ui", "headless"))
        }

        async fn accounts(&self) -> Vec<CachedAccount> {
            Vec::new()
        }

        async fn remove_account(&self, _: &str) -> Result<(), AuthError> {
            Ok(())
        }

        async fn clear_cache(&self) -> Result<(), AuthError> {
            Ok(())
        }
    }

    fn orchestrator(msal: Arc<dyn IdentityClient>) -> Orchestrator {
        let (mut ctx, _store) = context(PlatformSurface::headless());
        let (diagnostics, diag_rx) = Diagnostics::channel();
        ctx.diagnostics = diagnostics;

        let registry = ProviderRegistry::register_with(ctx, |kind| match kind {
            ProviderKind::Msal => msal.clone(),
            _ => Arc::new(ScriptedClient::new()),
        });
        Orchestrator::start(Arc::new(registry), "MSAL", diag_rx, SmokeTarget::default()).unwrap()
    }

    async fn next_settled(orch: &mut Orchestrator) -> (Operation, Result<(), Vec<String>>) {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), orch.next_event())
                .await
                .expect("no event")
                .expect("channels closed");
            if let Event::Settled {
                operation, outcome, ..
            } = event
            {
                return (operation, outcome);
            }
        }
    }

    #[tokio::test]
    async fn test_results_follow_submission_order() {
        let client = Arc::new(SlowClient {
            delays: std::sync::Mutex::new(VecDeque::from([
                (Duration::from_millis(200), "slow"),
                (Duration::from_millis(0), "fast"),
            ])),
        });
        let mut orch = orchestrator(client);

        orch.login();
        orch.login();
        orch.sign_out();
        assert_eq!(orch.in_flight(), 3);

        let ops: Vec<Operation> = vec![
            next_settled(&mut orch).await.0,
            next_settled(&mut orch).await.0,
            next_settled(&mut orch).await.0,
        ];
        assert_eq!(ops, vec![Operation::Login, Operation::Login, Operation::SignOut]);
        assert_eq!(orch.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_view_refreshes_on_success() {
        let client = Arc::new(ScriptedClient::new().silent(Ok(success("oid.tid", "ada@contoso.com"))));
        let mut orch = orchestrator(client);
        assert!(!orch.view().signed_in);
        assert_eq!(orch.view().provider_id, "MSAL");

        orch.login();
        let (_, outcome) = next_settled(&mut orch).await;

        assert!(outcome.is_ok());
        let view = orch.view();
        assert!(view.signed_in);
        assert_eq!(view.username, "ada@contoso.com");
        assert!(view.log_text.contains("Logging in with current Login Provider..."));
        assert!(view.log_text.contains("Completed successfully."));

        orch.sign_out();
        next_settled(&mut orch).await;
        assert!(!orch.view().signed_in);
        assert!(orch.view().username.is_empty());
    }

    #[tokio::test]
    async fn test_every_aggregate_cause_is_reported() {
        let client = Arc::new(ScriptedClient::new().silent(Err(AuthError::Aggregate(vec![
            AuthError::client("a", "first cause"),
            AuthError::service("b", "second cause"),
        ]))));
        let mut orch = orchestrator(client);

        orch.login();
        let (_, outcome) = next_settled(&mut orch).await;

        let failures = outcome.unwrap_err();
        assert_eq!(failures.len(), 2);
        assert!(failures[0].contains("first cause"));
        assert!(failures[1].contains("second cause"));
        assert!(!orch.view().signed_in);
        assert_eq!(orch.view().log_text.matches("first cause").count(), 1);
    }

    #[tokio::test]
    async fn test_panicking_backend_still_settles_once() {
        let client = Arc::new(SlowClient {
            delays: std::sync::Mutex::new(VecDeque::from([(Duration::from_millis(0), "panic")])),
        });
        let mut orch = orchestrator(client);

        orch.login();
        let (operation, outcome) = next_settled(&mut orch).await;

        assert_eq!(operation, Operation::Login);
        assert!(outcome.unwrap_err()[0].contains("task failed"));
        assert!(orch.view().log_text.contains("Login task failed"));
        assert_eq!(orch.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_diagnostics_are_forwarded() {
        let client = Arc::new(ScriptedClient::new().silent(Ok(success("a", "a@contoso.com"))));
        let mut orch = orchestrator(client);
        orch.login();

        let mut saw_diagnostic = false;
        loop {
            match orch.next_event().await.unwrap() {
                Event::Diagnostic(line) => {
                    assert_eq!(line.provider, "MSAL");
                    saw_diagnostic = true;
                }
                Event::Settled { .. } => break,
            }
        }
        assert!(saw_diagnostic);
    }

    #[tokio::test]
    async fn test_provider_switch_and_clear_log() {
        let client = Arc::new(ScriptedClient::new());
        let mut orch = orchestrator(client);

        assert!(orch.set_active_provider("wab"));
        assert_eq!(orch.view().provider_name, "WebAuthenticationBroker");
        assert!(!orch.set_active_provider("nope"));
        assert_eq!(orch.view().provider_id, "WAB");

        orch.active().log("something");
        orch.clear_log();
        assert!(orch.view().log_text.is_empty());

        assert!(!orch.set_biometrics_required(true));
        orch.set_active_provider("WAM");
        assert!(orch.set_biometrics_required(true));
    }

    #[tokio::test]
    async fn test_token_test_without_token_is_skipped() {
        let mut orch = orchestrator(Arc::new(ScriptedClient::new()));

        orch.test_token();
        let (operation, outcome) = next_settled(&mut orch).await;

        assert_eq!(operation, Operation::TestToken);
        assert!(outcome.is_ok());
        assert!(orch.view().log_text.contains("No valid token provided"));
    }
}
