//! CLI entry point for signet.
//!
//! This binary provides the `signet` command with subcommands for
//! maintaining the sign-in database and administering sessions and
//! lockouts.

mod cli;
mod commands;
mod helpers;

use anyhow::Result;
use chrono::Utc;
use clap::Parser;
use signet_auth_engine::TracingAuditSink;
use tracing::debug;

use cli::{Cli, Commands, LockoutAction, SessionAction};
use helpers::{init_tracing, open_store};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine; variables may come from the environment.
    let dotenv = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.log_json);
    if let Ok(path) = dotenv {
        debug!(path = %path.display(), "loaded .env");
    }

    let now = Utc::now();
    match cli.command {
        Commands::Migrate => {
            let store = open_store(&cli.db).await?;
            let version = commands::migrate(&store).await?;
            println!("schema at version {version} ({})", cli.db.display());
        }

        Commands::Sweep => {
            let store = open_store(&cli.db).await?;
            println!("{}", commands::sweep(&store, now).await?);
        }

        Commands::CheckConfig { json } => {
            println!("{}", commands::check_config(&cli.config, json)?);
        }

        Commands::Sessions { action } => {
            let store = open_store(&cli.db).await?;
            match action {
                SessionAction::List { account, json } => {
                    let rows = commands::list_sessions(&store, &account, now).await?;
                    if json {
                        println!("{}", serde_json::to_string_pretty(&rows)?);
                    } else {
                        println!("{}", commands::render_sessions(&rows).trim_end());
                    }
                }
                SessionAction::Revoke { session } => {
                    if commands::revoke_session(&store, &TracingAuditSink, &session).await? {
                        println!("revoked session {session}");
                    } else {
                        println!("session {session} not found");
                    }
                }
                SessionAction::RevokeAll { account } => {
                    let removed = commands::revoke_all(&store, &TracingAuditSink, &account).await?;
                    println!("revoked {removed} session(s) of account {account}");
                }
            }
        }

        Commands::Lockout { action } => {
            let store = open_store(&cli.db).await?;
            match action {
                LockoutAction::Show { account } => {
                    println!("{}", commands::show_lockout(&store, &account, now).await?);
                }
                LockoutAction::Reset { account } => {
                    commands::reset_lockout(&store, &account).await?;
                    println!("lockout cleared for account {account}");
                }
            }
        }
    }

    Ok(())
}
