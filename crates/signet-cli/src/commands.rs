//! Subcommand implementations.
//!
//! Each command works on an opened [`SqliteStore`] and returns a report;
//! `main` decides how to print it.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use signet_auth_engine::{
    AuditSink, AuthEvent, EngineConfig, LockedStatus, LockoutRepository, LockoutState,
    PendingAuthRepository, Session, SessionRepository,
};
use signet_store::SqliteStore;
use tracing::{info, warn};

use crate::helpers::{human_duration, timestamp};

// ---------------------------------------------------------------------------
// migrate / sweep
// ---------------------------------------------------------------------------

pub async fn migrate(store: &SqliteStore) -> Result<u32> {
    store
        .db
        .schema_version()
        .await
        .context("failed to read schema version")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub pending: u64,
    pub sessions: u64,
}

impl fmt::Display for SweepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "purged {} pending sign-in(s) and {} session(s)",
            self.pending, self.sessions
        )
    }
}

pub async fn sweep(store: &SqliteStore, now: DateTime<Utc>) -> Result<SweepReport> {
    let pending = store
        .pending
        .purge_expired(now)
        .await
        .context("failed to purge pending sign-ins")?;
    let sessions = store
        .sessions
        .purge_expired(now)
        .await
        .context("failed to purge sessions")?;
    info!(pending, sessions, "sweep complete");
    Ok(SweepReport { pending, sessions })
}

// ---------------------------------------------------------------------------
// check-config
// ---------------------------------------------------------------------------

/// The validated configuration at `path`, rendered without secrets.
pub fn check_config(path: &Path, json: bool) -> Result<String> {
    let config = EngineConfig::from_file(path)
        .with_context(|| format!("invalid configuration in {}", path.display()))?
        .redacted();
    if json {
        serde_json::to_string_pretty(&config).context("failed to render configuration")
    } else {
        toml::to_string_pretty(&config).context("failed to render configuration")
    }
}

// ---------------------------------------------------------------------------
// sessions
// ---------------------------------------------------------------------------

/// What an operator may see of a session. The refresh token hash stays in
/// the database.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRow {
    pub id: String,
    pub client_fingerprint: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<Session> for SessionRow {
    fn from(s: Session) -> Self {
        Self {
            id: s.id,
            client_fingerprint: s.client_fingerprint,
            created_at: s.created_at,
            last_used_at: s.last_used_at,
            expires_at: s.expires_at,
        }
    }
}

pub async fn list_sessions(
    store: &SqliteStore,
    account_id: &str,
    now: DateTime<Utc>,
) -> Result<Vec<SessionRow>> {
    let sessions = store
        .sessions
        .list_active_for_account(account_id, now)
        .await
        .context("failed to list sessions")?;
    Ok(sessions.into_iter().map(SessionRow::from).collect())
}

pub fn render_sessions(rows: &[SessionRow]) -> String {
    if rows.is_empty() {
        return "no active sessions".to_string();
    }
    let mut out = format!(
        "{:<38} {:<24} {:<20} {:<20}\n",
        "SESSION", "DEVICE", "LAST USED", "EXPIRES"
    );
    for row in rows {
        out.push_str(&format!(
            "{:<38} {:<24} {:<20} {:<20}\n",
            row.id,
            row.client_fingerprint,
            timestamp(row.last_used_at),
            timestamp(row.expires_at),
        ));
    }
    out
}

/// Revoke one session. Returns whether it existed.
pub async fn revoke_session(
    store: &SqliteStore,
    audit: &dyn AuditSink,
    session_id: &str,
) -> Result<bool> {
    let removed = store
        .sessions
        .delete_by_id(session_id)
        .await
        .context("failed to revoke session")?;
    if removed {
        audit
            .record(AuthEvent::SessionRevoked {
                session_id: session_id.to_string(),
            })
            .await;
    } else {
        warn!(session_id, "no such session");
    }
    Ok(removed)
}

pub async fn revoke_all(store: &SqliteStore, audit: &dyn AuditSink, account_id: &str) -> Result<u64> {
    let removed = store
        .sessions
        .delete_all_for_account(account_id)
        .await
        .context("failed to revoke sessions")?;
    audit
        .record(AuthEvent::AllSessionsRevoked {
            account_id: account_id.to_string(),
            removed,
        })
        .await;
    Ok(removed)
}

// ---------------------------------------------------------------------------
// lockout
// ---------------------------------------------------------------------------

pub struct LockoutReport {
    pub state: Option<LockoutState>,
    pub status: LockedStatus,
}

impl fmt::Display for LockoutReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(state) = &self.state else {
            return write!(f, "no failed sign-ins recorded");
        };
        writeln!(f, "failed attempts: {}", state.failed_attempts)?;
        writeln!(f, "lockouts:        {}", state.lockout_count)?;
        if let Some(at) = state.last_failed_at {
            writeln!(f, "last failure:    {}", timestamp(at))?;
        }
        match self.status {
            LockedStatus::Unlocked => write!(f, "status:          unlocked"),
            LockedStatus::Locked {
                until,
                retry_after_secs,
            } => write!(
                f,
                "status:          locked until {} ({} left)",
                timestamp(until),
                human_duration(retry_after_secs)
            ),
        }
    }
}

pub async fn show_lockout(
    store: &SqliteStore,
    account_id: &str,
    now: DateTime<Utc>,
) -> Result<LockoutReport> {
    let state = store
        .lockouts
        .get_state(account_id)
        .await
        .context("failed to read lockout state")?;
    let status = state
        .as_ref()
        .map_or(LockedStatus::Unlocked, |s| LockedStatus::of(s, now));
    Ok(LockoutReport { state, status })
}

pub async fn reset_lockout(store: &SqliteStore, account_id: &str) -> Result<()> {
    store
        .lockouts
        .apply_success(account_id)
        .await
        .context("failed to reset lockout")?;
    info!(account_id, "lockout reset");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Duration;
    use signet_auth_engine::{Account, AccountRepository, LockoutPolicy};

    use super::*;

    #[derive(Default)]
    struct Recorded(Mutex<Vec<AuthEvent>>);

    #[async_trait]
    impl AuditSink for Recorded {
        async fn record(&self, event: AuthEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    async fn store_with_account() -> (SqliteStore, String) {
        let store = SqliteStore::in_memory().await.unwrap();
        let account = Account {
            id: "acct-1".to_string(),
            external_subject: "sub-1".to_string(),
            email: None,
            email_verified: false,
            created_at: Utc::now(),
            last_login_at: None,
        };
        store.accounts.create(&account).await.unwrap();
        (store, account.id)
    }

    fn session(id: &str, account_id: &str, expires_at: DateTime<Utc>) -> Session {
        let now = Utc::now();
        Session {
            id: id.to_string(),
            account_id: account_id.to_string(),
            refresh_token_hash: format!("hash-{id}"),
            client_fingerprint: "signet-ios/1.0".to_string(),
            created_at: now,
            expires_at,
            last_used_at: now,
            rotated_at: None,
        }
    }

    #[tokio::test]
    async fn sweep_removes_only_expired_sessions() {
        let (store, account) = store_with_account().await;
        let now = Utc::now();
        store
            .sessions
            .create(&session("live", &account, now + Duration::days(1)))
            .await
            .unwrap();
        store
            .sessions
            .create(&session("dead", &account, now - Duration::days(1)))
            .await
            .unwrap();

        let report = sweep(&store, now).await.unwrap();
        assert_eq!(
            report,
            SweepReport {
                pending: 0,
                sessions: 1
            }
        );
        let rows = list_sessions(&store, &account, now).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "live");
    }

    #[tokio::test]
    async fn revocations_are_audited() {
        let (store, account) = store_with_account().await;
        let later = Utc::now() + Duration::days(1);
        for id in ["s1", "s2", "s3"] {
            store
                .sessions
                .create(&session(id, &account, later))
                .await
                .unwrap();
        }
        let audit = Recorded::default();

        assert!(revoke_session(&store, &audit, "s1").await.unwrap());
        assert!(!revoke_session(&store, &audit, "s1").await.unwrap());
        assert_eq!(revoke_all(&store, &audit, &account).await.unwrap(), 2);

        let events = audit.0.lock().unwrap();
        let names: Vec<_> = events.iter().map(AuthEvent::name).collect();
        assert_eq!(names, ["session_revoked", "all_sessions_revoked"]);
    }

    #[tokio::test]
    async fn lockout_show_and_reset() {
        let (store, account) = store_with_account().await;
        let now = Utc::now();

        let report = show_lockout(&store, &account, now).await.unwrap();
        assert!(report.state.is_none());
        assert_eq!(report.to_string(), "no failed sign-ins recorded");

        let policy = LockoutPolicy {
            threshold: 1,
            ..LockoutPolicy::default()
        };
        store
            .lockouts
            .apply_failure(&account, &policy, now)
            .await
            .unwrap();
        let report = show_lockout(&store, &account, now).await.unwrap();
        assert!(report.status.is_locked());
        assert!(report.to_string().contains("locked until"));

        reset_lockout(&store, &account).await.unwrap();
        let report = show_lockout(&store, &account, now).await.unwrap();
        assert!(!report.status.is_locked());
        assert_eq!(report.state.unwrap().lockout_count, 0);
    }

    #[test]
    fn check_config_hides_the_signing_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signet.toml");
        std::fs::write(
            &path,
            r#"
[provider]
issuer = "https://idp.example.com"
client_id = "com.example.app"
authorization_endpoint = "https://idp.example.com/auth/authorize"
redirect_uri = "https://app.example.com/callback"

[session]
signing_key = "c2lnbmV0LXRlc3Qtc2lnbmluZy1rZXktMzItYnl0ZXMtbG9uZw"
"#,
        )
        .unwrap();

        let rendered = check_config(&path, false).unwrap();
        assert!(rendered.contains("com.example.app"));
        assert!(!rendered.contains("c2lnbmV0"));

        let rendered = check_config(&path, true).unwrap();
        let value: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(value["lockout"]["threshold"], 5);
    }

    #[test]
    fn check_config_reports_invalid_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signet.toml");
        std::fs::write(&path, "[provider]\nissuer = \"\"\n").unwrap();
        let err = check_config(&path, false).unwrap_err();
        assert!(format!("{err:#}").contains("provider.issuer"));
    }

    #[test]
    fn empty_session_table() {
        assert_eq!(render_sessions(&[]), "no active sessions");
    }
}
