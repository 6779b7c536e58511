//! aad-login-cli - Azure AD sign-in through interchangeable backends
//!
//! Silent first, then interactive or device code, with the last user
//! remembered per backend.

mod api;
mod auth;
mod config;
mod console;
mod orchestrator;

use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use auth::registry::{self, ProviderRegistry};
use auth::token_cache::DEFAULT_CACHE_FILE;
use auth::user_store::FileUserStore;
use auth::{Diagnostics, PlatformSurface};
use config::Settings;
use orchestrator::{Operation, Orchestrator};

#[derive(Parser)]
#[command(name = "aad-login-cli")]
#[command(about = "Sign in to Azure AD through six interchangeable login providers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// No interactive sign-in UI; interaction falls back to device code
    #[arg(long, global = true)]
    headless: bool,

    /// Prefer the device code flow whenever interaction is needed
    #[arg(long, global = true)]
    device_code: bool,

    /// Require user verification before web account manager requests
    #[arg(long, global = true)]
    biometrics: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List the login providers
    Providers,

    /// Sign in with a provider
    Login {
        /// Provider id (WAM, MSAL, ADAL, WAMWAB, WAB, WAP)
        #[arg(default_value = "MSAL")]
        provider: String,
    },

    /// Sign out of a provider
    Logout {
        /// Provider id
        #[arg(default_value = "MSAL")]
        provider: String,

        /// Sign out of every provider
        #[arg(long)]
        all: bool,
    },

    /// Sign in, then exchange the token with the Mixed Reality STS
    TestToken {
        /// Provider id
        #[arg(default_value = "MSAL")]
        provider: String,
    },

    /// Interactive console
    Console {
        /// Provider selected at start
        #[arg(default_value = "MSAL")]
        provider: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Settings unavailable, using defaults: {:#}", e);
            Settings::default()
        }
    };
    for warning in settings.warnings() {
        tracing::warn!("{}", warning);
    }

    let data_dir = Settings::data_dir()?;
    let store = Arc::new(FileUserStore::new(data_dir.join("users.toml")));
    let surface = PlatformSurface::detect(!cli.headless);
    tracing::debug!("Execution surface: {}", surface.describe());

    let (diagnostics, diagnostics_rx) = Diagnostics::channel();
    let registry = registry::init(ProviderRegistry::register_all(
        diagnostics,
        store,
        &settings,
        surface,
        data_dir.join(DEFAULT_CACHE_FILE),
    ))?;

    for provider in registry.list() {
        provider.set_prefer_device_code(cli.device_code);
        if cli.biometrics {
            provider.set_biometrics_required(true);
        }
    }

    let start = |provider: &str| -> Result<Orchestrator> {
        if registry.get(provider).is_none() {
            bail!(
                "Unknown provider '{}'. Run 'aad-login-cli providers' for the list.",
                provider
            );
        }
        Ok(Orchestrator::start(
            registry.clone(),
            provider,
            diagnostics_rx,
            api::SmokeTarget::from_settings(&settings),
        )?)
    };

    match cli.command {
        Commands::Providers => {
            for provider in registry.list() {
                println!(
                    "{:<7} {}{}",
                    provider.id(),
                    provider.provider_name(),
                    if provider.remembered_user().is_some() {
                        " (remembers a user)"
                    } else {
                        ""
                    }
                );
                println!("        {}", provider.description());
            }
        }
        Commands::Login { provider } => {
            let mut orch = start(&provider)?;
            console::run_operation(&mut orch, Operation::Login).await?;
        }
        Commands::Logout { all: true, .. } => {
            let providers = registry.list();
            let results =
                futures::future::join_all(providers.iter().map(|p| p.sign_out())).await;
            for (provider, result) in providers.iter().zip(results) {
                match result {
                    Ok(()) => println!("{}: signed out", provider.id()),
                    Err(e) => eprintln!("{}: {}", provider.id(), e),
                }
            }
        }
        Commands::Logout { provider, .. } => {
            let mut orch = start(&provider)?;
            console::run_operation(&mut orch, Operation::SignOut).await?;
        }
        Commands::TestToken { provider } => {
            let mut orch = start(&provider)?;
            console::run_operation(&mut orch, Operation::Login).await?;
            console::run_operation(&mut orch, Operation::TestToken).await?;
        }
        Commands::Console { provider } => {
            let mut orch = start(&provider)?;
            console::run(&mut orch).await?;
        }
    }

    Ok(())
}
