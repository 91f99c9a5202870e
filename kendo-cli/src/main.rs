mod cli;
mod config;

use std::path::Path;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use kendo_session::{
    Clock, CredentialStore, FileStore, SessionController, SessionEvent, SessionStatus,
    SystemClock,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::cli::{Args, Commands, OutputFormat};
use crate::config::AppConfig;

const DEFAULT_LOG_FILTER: &str = "kendo_session=info,kendo=info";

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    if let Err(e) = run(args).await {
        error!("Application error: {e:#}");
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = AppConfig::load(args.config.as_deref())?.with_args(&args)?;
    let session_file = config.session_file();
    debug!(session_file = %session_file.display(), backend = %config.session.base_url, "Configuration loaded");

    let store = CredentialStore::new(Arc::new(FileStore::new(&session_file)));
    let controller = SessionController::http(&config.session, store)?;

    match args.command {
        Commands::Login {
            username,
            password,
            stay,
        } => {
            let Some(username) = username else {
                bail!("A username is required (--username or KENDO_USERNAME)");
            };
            let password = match password {
                Some(password) => password,
                None => read_password().await?,
            };

            let outcome = controller.login(&username, &password).await?;
            println!(
                "Logged in as {} (token expires {})",
                outcome.user.username,
                format_expiry(outcome.credential.expires_at)
            );

            if stay {
                keep_alive(&controller).await?;
            }
        }

        Commands::Run => {
            if controller.resume().await?.is_none() {
                bail!(
                    "No valid session in {}; run `kendo login` first",
                    session_file.display()
                );
            }
            keep_alive(&controller).await?;
        }

        Commands::Status { output } => {
            let status = controller.status().await?;
            print_status(&status, output, &session_file)?;
        }

        Commands::Logout => {
            controller.logout().await?;
            println!("Logged out");
        }
    }

    Ok(())
}

/// Renew until interrupted or until a renewal fails.
async fn keep_alive(controller: &SessionController) -> Result<()> {
    let mut events = controller.subscribe();
    if controller.scheduler().state().await.is_idle() {
        bail!("Session is too close to expiry to be renewed; log in again");
    }
    info!("Keeping session alive; press Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted; the session stays persisted");
                controller.scheduler().cancel().await;
                return Ok(());
            }
            event = events.recv() => match event {
                Ok(SessionEvent::Renewed { expires_at }) => {
                    info!(expires = %format_expiry(expires_at), "Session renewed");
                }
                Ok(SessionEvent::RenewalSkipped { expires_at }) => {
                    bail!(
                        "Session expires {} and can no longer be renewed; log in again",
                        format_expiry(expires_at)
                    );
                }
                Ok(SessionEvent::RenewalStopped { kind, reason }) => {
                    bail!("Session renewal stopped ({kind}): {reason}");
                }
                Ok(event) => debug!(event = event.event_name(), "Session event"),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Session event receiver lagged");
                }
                Err(RecvError::Closed) => return Ok(()),
            },
        }
    }
}

async fn read_password() -> Result<String> {
    eprint!("Password: ");
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("Failed to read password from stdin")?;

    let password = line.trim_end_matches(['\r', '\n']).to_string();
    if password.is_empty() {
        bail!("Empty password");
    }
    Ok(password)
}

fn format_expiry(expires_at: i64) -> String {
    chrono::DateTime::from_timestamp_millis(expires_at)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| expires_at.to_string())
}

fn print_status(status: &SessionStatus, output: OutputFormat, session_file: &Path) -> Result<()> {
    let now = SystemClock.now_millis();

    match output {
        OutputFormat::Json => {
            let value = serde_json::json!({
                "session_file": session_file,
                "logged_in": status.credential.is_some(),
                "expires_at": status.credential.as_ref().map(|c| c.expires_at),
                "valid": status.credential.as_ref().is_some_and(|c| c.is_valid_at(now)),
                "remaining_ms": status.credential.as_ref().map(|c| c.remaining_millis(now)),
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        OutputFormat::Pretty => match &status.credential {
            Some(credential) => {
                let state = if credential.is_valid_at(now) {
                    "valid"
                } else {
                    "expired"
                };
                println!("Session: {state}");
                println!("Expires: {}", format_expiry(credential.expires_at));
                println!("File:    {}", session_file.display());
            }
            None => println!("Not logged in"),
        },
    }
    Ok(())
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}
