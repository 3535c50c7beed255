//! CLI argument definitions for signet.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// signet -- sign-in sessions for native apps.
#[derive(Parser)]
#[command(
    name = "signet",
    version,
    about = "signet -- operator tooling for the sign-in engine",
    long_about = "Maintains the signet database: schema migrations, expiry sweeps, \
                  session revocation and lockout administration."
)]
pub struct Cli {
    /// Path to the engine configuration (TOML).
    #[arg(long, global = true, env = "SIGNET_CONFIG", default_value = "config/signet.toml")]
    pub config: PathBuf,

    /// Path to the SQLite database.
    #[arg(long, global = true, env = "SIGNET_DB", default_value = "data/signet.db")]
    pub db: PathBuf,

    /// Default log level when `RUST_LOG` is unset.
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create or upgrade the database schema.
    Migrate,

    /// Delete expired pending sign-ins and sessions.
    Sweep,

    /// Load and validate the configuration, then print it with secrets hidden.
    CheckConfig {
        /// Print JSON instead of TOML.
        #[arg(long)]
        json: bool,
    },

    /// Inspect and revoke sessions.
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },

    /// Inspect and clear account lockouts.
    Lockout {
        #[command(subcommand)]
        action: LockoutAction,
    },
}

#[derive(Subcommand)]
pub enum SessionAction {
    /// List the active sessions of an account.
    List {
        #[arg(long)]
        account: String,

        /// Print JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Revoke one session.
    Revoke {
        #[arg(long)]
        session: String,
    },

    /// Revoke every session of an account.
    RevokeAll {
        #[arg(long)]
        account: String,
    },
}

#[derive(Subcommand)]
pub enum LockoutAction {
    /// Show the failure counters and lock status of an account.
    Show {
        #[arg(long)]
        account: String,
    },

    /// Clear the failure counters and any active lock.
    Reset {
        #[arg(long)]
        account: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_subcommands() {
        let cli = Cli::try_parse_from([
            "signet",
            "--db",
            "/tmp/x.db",
            "sessions",
            "revoke-all",
            "--account",
            "acct-1",
        ])
        .unwrap();
        assert_eq!(cli.db, PathBuf::from("/tmp/x.db"));
        match cli.command {
            Commands::Sessions {
                action: SessionAction::RevokeAll { account },
            } => assert_eq!(account, "acct-1"),
            _ => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn global_flags_follow_the_subcommand() {
        let cli = Cli::try_parse_from(["signet", "check-config", "--json", "--log-json"]).unwrap();
        assert!(cli.log_json);
        assert!(matches!(cli.command, Commands::CheckConfig { json: true }));
    }

    #[test]
    fn account_is_required() {
        assert!(Cli::try_parse_from(["signet", "lockout", "show"]).is_err());
    }

    #[test]
    fn definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
