//! Line-oriented consumer of the orchestrator
//!
//! Reads commands from stdin and prints settled results and the diagnostic
//! stream as they arrive. This loop is the only place view state is read.

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;

use crate::orchestrator::{Event, Operation, Orchestrator};

/// One console line, parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Use(String),
    Login,
    Logout,
    Test,
    Clear,
    Status,
    Log,
    DeviceCode(bool),
    Biometrics(bool),
    Help,
    Quit,
}

const HELP: &str = "\
Commands:
  use <id>              switch provider (WAM, MSAL, ADAL, WAMWAB, WAB, WAP)
  login                 sign in with the current provider
  logout                sign out of the current provider
  test                  smoke-test the current token
  status                show the signed-in state
  log                   show the provider log
  clear                 clear the provider log
  device-code on|off    prefer the device code flow
  biometrics on|off     require user verification (WAM)
  help                  show this help
  quit                  exit";

fn parse_switch(arg: Option<&str>) -> Result<bool, String> {
    match arg {
        Some("on") | Some("true") | Some("1") => Ok(true),
        Some("off") | Some("false") | Some("0") => Ok(false),
        _ => Err("expected 'on' or 'off'".to_string()),
    }
}

pub fn parse_command(line: &str) -> Result<ConsoleCommand, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Err("empty command".to_string());
    };
    let arg = words.next();

    match verb.to_ascii_lowercase().as_str() {
        "use" => arg
            .map(|id| ConsoleCommand::Use(id.to_string()))
            .ok_or_else(|| "usage: use <provider id>".to_string()),
        "login" => Ok(ConsoleCommand::Login),
        "logout" | "signout" => Ok(ConsoleCommand::Logout),
        "test" => Ok(ConsoleCommand::Test),
        "clear" => Ok(ConsoleCommand::Clear),
        "status" => Ok(ConsoleCommand::Status),
        "log" => Ok(ConsoleCommand::Log),
        "device-code" => parse_switch(arg).map(ConsoleCommand::DeviceCode),
        "biometrics" => parse_switch(arg).map(ConsoleCommand::Biometrics),
        "help" | "?" => Ok(ConsoleCommand::Help),
        "quit" | "exit" => Ok(ConsoleCommand::Quit),
        other => Err(format!("unknown command '{}', try 'help'", other)),
    }
}

fn print_status(orch: &Orchestrator) {
    let view = orch.view();
    println!(
        "[{}] {}: {}{}",
        view.provider_id,
        view.provider_name,
        if view.signed_in { "Signed In" } else { "Not Signed In" },
        if view.username.is_empty() {
            String::new()
        } else {
            format!(" as {}", view.username)
        }
    );
    if let Some(picture) = view.picture.as_ref().filter(|p| !p.is_empty()) {
        println!("  picture: {} bytes", picture.len());
    }
}

fn print_event(orch: &Orchestrator, event: &Event) {
    match event {
        Event::Diagnostic(line) => println!("{}", line),
        Event::Settled {
            provider,
            operation,
            outcome,
        } => {
            match outcome {
                Ok(()) => println!("{:?} on {} completed", operation, provider),
                Err(failures) => {
                    eprintln!("{:?} on {} failed:", operation, provider);
                    for failure in failures {
                        eprintln!("  {}", failure);
                    }
                }
            }
            print_status(orch);
        }
    }
}

/// Returns false when the console should exit.
fn apply(orch: &mut Orchestrator, command: ConsoleCommand) -> bool {
    match command {
        ConsoleCommand::Use(id) => {
            if orch.set_active_provider(&id) {
                print_status(orch);
            } else {
                eprintln!("Unknown provider '{}'", id);
            }
        }
        ConsoleCommand::Login => orch.login(),
        ConsoleCommand::Logout => orch.sign_out(),
        ConsoleCommand::Test => orch.test_token(),
        ConsoleCommand::Clear => orch.clear_log(),
        ConsoleCommand::Status => print_status(orch),
        ConsoleCommand::Log => print!("{}", orch.view().log_text),
        ConsoleCommand::DeviceCode(on) => {
            orch.set_device_code_preference(on);
            println!("Device code flow {}", if on { "preferred" } else { "not preferred" });
        }
        ConsoleCommand::Biometrics(on) => {
            if !orch.set_biometrics_required(on) {
                eprintln!("{} has no user verification step", orch.active().id());
            }
        }
        ConsoleCommand::Help => println!("{}", HELP),
        ConsoleCommand::Quit => return false,
    }
    true
}

/// Interactive loop over stdin lines and orchestrator events.
pub async fn run(orch: &mut Orchestrator) -> Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = LinesStream::new(stdin.lines());

    println!("{}", HELP);
    print_status(orch);

    loop {
        tokio::select! {
            line = lines.next() => match line {
                Some(Ok(line)) if line.trim().is_empty() => {}
                Some(Ok(line)) => match parse_command(&line) {
                    Ok(command) => {
                        if !apply(orch, command) {
                            break;
                        }
                    }
                    Err(e) => eprintln!("{}", e),
                },
                Some(Err(e)) => return Err(e).context("Failed to read stdin"),
                None => break,
            },
            event = orch.next_event() => match event {
                Some(event) => print_event(orch, &event),
                None => break,
            },
        }
    }

    let pending = orch.in_flight();
    if pending > 0 {
        tracing::warn!("Exiting with {} operation(s) still running", pending);
    }
    Ok(())
}

/// Run one operation to completion, streaming diagnostics meanwhile.
pub async fn run_operation(orch: &mut Orchestrator, operation: Operation) -> Result<()> {
    match operation {
        Operation::Login => orch.login(),
        Operation::SignOut => orch.sign_out(),
        Operation::TestToken => orch.test_token(),
    }

    while let Some(event) = orch.next_event().await {
        print_event(orch, &event);
        if let Event::Settled { outcome, .. } = event {
            if let Err(failures) = outcome {
                bail!("{:?} failed: {}", operation, failures.join("; "));
            }
            if operation == Operation::Login && !orch.view().signed_in {
                bail!("Sign-in did not complete; see the log above");
            }
            return Ok(());
        }
    }
    bail!("Orchestrator stopped before {:?} settled", operation)
}
