// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use inquire::InquireError;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;

use clinicgate::api::HttpBackend;
use clinicgate::config::{self, ConsoleConfig};
use clinicgate::errors::AuthError;
use clinicgate::security::{
    decide, ConsoleSession, InputTarget, KeyChord, KeyDisposition, LoginOutcome, NavigationEvent,
    RouteDecision,
};
use clinicgate::types::{CaptchaAnswer, Credentials, Role};

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exit codes following sysexits.h conventions
mod exit_codes {
    pub const SUCCESS: i32 = 0;
    pub const ERROR: i32 = 1;
    pub const USAGE: i32 = 64;
    pub const CONFIG: i32 = 78;
}

use exit_codes::*;

type Console = ConsoleSession<HttpBackend, HttpBackend>;

/// clinicgate - clinic console session
#[derive(Parser)]
#[command(name = "clinicgate")]
#[command(version = VERSION)]
#[command(about = "Secure sign-in console for the clinic backend.")]
#[command(long_about = "clinicgate - clinic console session\n\n\
    Sign in and work:     clinicgate console\n\
    Check a route:        clinicgate route /patients --role doctor\n\
    Confirm an e-mail:    clinicgate verify-email <token>\n\
    Show configuration:   clinicgate config show")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (defaults to the user config directory)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Backend base URL (overrides config and CLINICGATE_API_URL)
    #[arg(long, global = true, value_name = "URL")]
    api_url: Option<String>,

    /// Quiet mode: warnings and errors only
    #[arg(short = 'q', long, global = true)]
    quiet: bool,

    /// Verbose mode: debug logging
    #[arg(short = 'v', long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive console session
    Console,

    /// Evaluate the route policy for a path
    ///
    /// Examples:
    ///   clinicgate route /settings
    ///   clinicgate route /request-assessment --role doctor
    Route {
        path: String,
        /// Role to evaluate as (anonymous when omitted)
        #[arg(long)]
        role: Option<String>,
    },

    /// Confirm an e-mail address with the token from the verification mail
    VerifyEmail { token: String },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Print the configuration file path
    Path,
}

fn init_tracing(verbose: bool, quiet: bool) {
    let default_level = if verbose {
        "clinicgate=debug"
    } else if quiet {
        "clinicgate=warn"
    } else {
        "clinicgate=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let mut config = match config::load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {:#}", "[X]".red(), e);
            std::process::exit(CONFIG);
        }
    };
    if let Some(url) = cli.api_url {
        config.api.base_url = url;
    }

    let result = match cli.command {
        Commands::Console => run_console(config).await,
        Commands::Route { path, role } => run_route(&path, role.as_deref()),
        Commands::VerifyEmail { token } => run_verify_email(config, &token).await,
        Commands::Config { command } => run_config(&config, cli.config, command),
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{} {:#}", "[X]".red(), e);
            std::process::exit(ERROR);
        }
    }
}

// ----------------------------------------------------------------------
// One-shot commands
// ----------------------------------------------------------------------

fn run_route(path: &str, role: Option<&str>) -> Result<i32> {
    let role = match role.map(str::parse::<Role>).transpose() {
        Ok(role) => role,
        Err(e) => {
            eprintln!("{} {}", "[X]".red(), e);
            return Ok(USAGE);
        }
    };
    print_decision(&decide(role, path));
    Ok(SUCCESS)
}

async fn run_verify_email(config: ConsoleConfig, token: &str) -> Result<i32> {
    let backend = Arc::new(HttpBackend::new(&config.api)?);
    let console = Console::in_memory(config, backend.clone(), backend);
    match console.machine().verify_email(token).await {
        Ok(message) => {
            println!("{} {}", "[OK]".green(), message);
            Ok(SUCCESS)
        }
        Err(e) => {
            eprintln!("{} {}", "[X]".red(), e);
            Ok(ERROR)
        }
    }
}

fn run_config(config: &ConsoleConfig, path: Option<PathBuf>, command: ConfigCommands) -> Result<i32> {
    match command {
        ConfigCommands::Show => {
            println!("{}", serde_json::to_string_pretty(config)?);
        }
        ConfigCommands::Path => {
            let path = match path {
                Some(p) => p,
                None => config::default_config_path()?,
            };
            println!("{}", path.display());
        }
    }
    Ok(SUCCESS)
}

fn print_decision(decision: &RouteDecision) {
    match decision {
        RouteDecision::Allow => println!("{} allow", "[OK]".green()),
        RouteDecision::Redirect { to, return_to } => {
            print!("{} redirect -> {}", "[!]".yellow(), to.bold());
            if let Some(original) = return_to {
                print!(" (return to {})", original);
            }
            println!();
        }
        RouteDecision::NotFound { within_shell } => {
            let shell = if *within_shell { "inside shell" } else { "standalone" };
            println!("{} not found ({})", "[X]".red(), shell);
        }
    }
}

// ----------------------------------------------------------------------
// Interactive console
// ----------------------------------------------------------------------

enum LoopExit {
    Quit,
    SignedOut,
}

async fn run_console(config: ConsoleConfig) -> Result<i32> {
    let backend = Arc::new(HttpBackend::new(&config.api)?);
    let console = match Console::for_current_tab(config.clone(), backend.clone(), backend.clone()) {
        Ok(console) => console,
        Err(e) => {
            tracing::warn!(error = %e, "lock state persistence unavailable; keeping it in memory");
            Console::in_memory(config, backend.clone(), backend)
        }
    };
    let console = Arc::new(console);

    println!("{} {}", "clinicgate".bold().cyan(), VERSION);
    let notifier = spawn_notifier(Arc::clone(&console));

    console.start().await;

    let code = loop {
        if !console.machine().is_authenticated() && !sign_in(&console).await? {
            break SUCCESS;
        }

        let destination = console.post_login_destination();
        if let Some(user) = console.machine().current_user() {
            println!(
                "{} Signed in as {} ({}) -> {}",
                "[OK]".green(),
                user.username.bold(),
                user.role,
                destination
            );
        }

        match command_loop(&console).await? {
            LoopExit::Quit => break SUCCESS,
            LoopExit::SignedOut => continue,
        }
    };

    notifier.abort();
    console.shutdown();
    Ok(code)
}

/// Print session notices as they happen.
fn spawn_notifier(console: Arc<Console>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut navigation = console.navigation();
        let mut inactivity = console.subscribe_inactivity();
        let mut advisory = console.gate().subscribe();

        loop {
            tokio::select! {
                event = navigation.recv() => match event {
                    Ok(NavigationEvent::Hard { path, reason }) => {
                        println!();
                        println!("{} Session ended ({}). Press Enter to return to {}.", "[!]".red(), reason, path);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(_) => break,
                },
                changed = inactivity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let shown = console.presented_inactivity();
                    if shown.warning_visible
                        && (shown.seconds_remaining % 10 == 0 || shown.seconds_remaining <= 5)
                    {
                        println!(
                            "{} Signing out in {}s due to inactivity. Type 'stay' to remain signed in.",
                            "[!]".yellow(),
                            shown.seconds_remaining
                        );
                    }
                }
                changed = advisory.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = advisory.borrow_and_update().clone();
                    if let Some(notice) = current.filter(|a| a.is_blocking()) {
                        let hint = if notice.closable {
                            "in grace period; 'dismiss' to continue"
                        } else {
                            "expired; request a renewal with 'renew <months>'"
                        };
                        println!("{} Organization contract {}.", "[!]".red(), hint);
                    }
                }
            }
        }
    })
}

/// Ask a question on a blocking thread. `None` when the user cancelled.
async fn prompt(message: &str, secret: bool) -> Result<Option<String>> {
    let message = message.to_string();
    let answer = tokio::task::spawn_blocking(move || {
        if secret {
            inquire::Password::new(&message)
                .without_confirmation()
                .prompt()
        } else {
            inquire::Text::new(&message).prompt()
        }
    })
    .await
    .context("prompt task failed")?;

    match answer {
        Ok(value) => Ok(Some(value)),
        Err(InquireError::OperationCanceled | InquireError::OperationInterrupted) => Ok(None),
        Err(e) => Err(e).context("failed to read input"),
    }
}

/// Run the sign-in dialogue. `Ok(false)` means the user gave up.
async fn sign_in(console: &Console) -> Result<bool> {
    let machine = console.machine();

    loop {
        let Some(email) = prompt("E-mail:", false).await? else {
            return Ok(false);
        };
        let Some(password) = prompt("Password:", true).await? else {
            return Ok(false);
        };
        let credentials = Credentials::new(email.trim(), password);

        let mut step = machine.login(&credentials).await;
        loop {
            match step {
                Ok(LoginOutcome::Established(_)) => return Ok(true),
                Ok(LoginOutcome::CaptchaRequired { session_id, prompt: question }) => {
                    let label = question.unwrap_or_else(|| "Captcha answer:".to_string());
                    let Some(answer) = prompt(&label, false).await? else {
                        machine.abandon_login();
                        break;
                    };
                    let answer = CaptchaAnswer { session_id, answer };
                    step = machine.submit_captcha(&credentials, &answer).await;
                }
                Ok(LoginOutcome::TwoFactorRequired) => {
                    let Some(code) =
                        prompt("Authentication code (or 'backup:<code>'):", false).await?
                    else {
                        machine.abandon_login();
                        break;
                    };
                    step = match code.trim().strip_prefix("backup:") {
                        Some(backup) => machine.submit_backup_code(&credentials, backup.trim()).await,
                        None => machine.submit_two_factor(&credentials, code.trim()).await,
                    };
                }
                Err(AuthError::StepInFlight) => {
                    println!("{} Still verifying, please wait.", "[!]".yellow());
                    break;
                }
                Err(e) => {
                    println!("{} {}", "[X]".red(), e);
                    break;
                }
            }
        }
    }
}

const HELP: &str = "\
Commands:
  go <path>           navigate
  lock                lock the screen (also: ctrl+shift+l)
  unlock              unlock the screen
  stay                stay signed in
  status              show session state
  contract            show contract status
  dismiss             close a grace-period contract notice
  renew <months> [message]
  logout              sign out
  quit                leave the console";

async fn command_loop(console: &Console) -> Result<LoopExit> {
    loop {
        let Some(line) = prompt("clinicgate>", false).await? else {
            return Ok(LoopExit::Quit);
        };
        if !console.machine().is_authenticated() {
            return Ok(LoopExit::SignedOut);
        }

        let line = line.trim();
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();

        let chord = if command.eq_ignore_ascii_case("ctrl+shift+l") {
            KeyChord::ctrl_shift('l')
        } else {
            KeyChord::plain('\n')
        };
        let target = if command == "unlock" {
            InputTarget::UnlockPassword
        } else {
            InputTarget::Other
        };

        match console.handle_key(chord, target) {
            KeyDisposition::Lock => {
                println!("{} Screen locked.", "[OK]".green());
                continue;
            }
            KeyDisposition::Suppress => {
                println!("{} Screen is locked. Type 'unlock'.", "[!]".yellow());
                continue;
            }
            KeyDisposition::Pass => {}
        }

        match command {
            "" => {}
            "help" | "?" => println!("{}", HELP),
            "go" => {
                let decision = console.navigate(rest);
                print_decision(&decision);
                if decision == RouteDecision::Allow && console.gate().blocks_action_screens() {
                    println!("{} Actions are blocked until the contract is renewed.", "[!]".red());
                }
            }
            "lock" => match console.lock_guard().lock() {
                Ok(()) => println!("{} Screen locked.", "[OK]".green()),
                Err(e) => println!("{} {}", "[X]".red(), e),
            },
            "unlock" => {
                let Some(password) = prompt("Password:", true).await? else {
                    continue;
                };
                match console.lock_guard().unlock(&password).await {
                    Ok(()) => println!("{} Unlocked.", "[OK]".green()),
                    Err(e) => println!("{} {}", "[X]".red(), e),
                }
            }
            "stay" => {
                console.stay_active();
                println!("{} Session extended.", "[OK]".green());
            }
            "status" => print_status(console),
            "contract" => print_contract(console),
            "dismiss" => {
                if console.gate().dismiss_advisory() {
                    println!("{} Notice closed.", "[OK]".green());
                } else {
                    println!("{} This notice cannot be closed.", "[!]".yellow());
                }
            }
            "renew" => {
                let (months, message) = rest.split_once(' ').unwrap_or((rest, ""));
                let Ok(months) = months.parse::<u32>() else {
                    println!("{} Usage: renew <months> [message]", "[!]".yellow());
                    continue;
                };
                match console.gate().request_renewal(message, months).await {
                    Ok(response) => println!("{} {}", "[OK]".green(), response.message),
                    Err(e) => println!("{} {}", "[X]".red(), e),
                }
            }
            "logout" => {
                console.logout().await;
                println!("{} Signed out.", "[OK]".green());
                return Ok(LoopExit::SignedOut);
            }
            "quit" | "exit" => return Ok(LoopExit::Quit),
            other => println!("{} Unknown command '{}'. Type 'help'.", "[!]".yellow(), other),
        }
    }
}

fn print_status(console: &Console) {
    let session = console.session();
    match &session.user {
        Some(user) => println!(
            "  User:       {} <{}> ({})",
            user.username, user.email, user.role
        ),
        None => println!("  User:       -"),
    }

    let lock = console.lock_guard().state();
    let lock_text = match console.lock_guard().lockout_remaining_secs() {
        Some(secs) => format!("locked out ({}s)", secs),
        None if lock.locked => "locked".to_string(),
        None => "unlocked".to_string(),
    };
    println!("  Screen:     {}", lock_text);

    let inactivity = console.timer().state();
    if inactivity.warning_visible {
        println!("  Inactivity: signing out in {}s", inactivity.seconds_remaining);
    } else if console.timer().is_armed() {
        println!("  Inactivity: active");
    } else {
        println!("  Inactivity: off");
    }
}

fn print_contract(console: &Console) {
    match console.gate().contract() {
        Some(contract) => {
            let state = if contract.is_valid {
                "valid".green()
            } else if contract.is_in_grace_period {
                "grace period".yellow()
            } else {
                "expired".red()
            };
            println!("  Contract:   {}", state);
            if let Some(days) = contract.days_until_expiry {
                println!("  Expires in: {} days", days);
            }
            if let Some(end) = contract.contract_end_date {
                println!("  End date:   {}", end);
            }
        }
        None => println!("  Contract:   not applicable"),
    }
}
