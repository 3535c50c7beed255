//! Session-lifecycle audit events.
//!
//! The orchestrator reports every security-relevant outcome to an
//! [`AuditSink`]. Reporting is fire-and-forget: a sink cannot fail the
//! operation that produced the event.

use async_trait::async_trait;
use serde::Serialize;

/// One audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuthEvent {
    SessionCreated {
        account_id: String,
        session_id: String,
        new_account: bool,
    },
    SessionRefreshed {
        account_id: String,
        previous_session_id: String,
        session_id: String,
    },
    /// Removed to make room under the concurrency cap.
    SessionEvicted {
        account_id: String,
        session_id: String,
    },
    SessionRevoked {
        session_id: String,
    },
    AllSessionsRevoked {
        account_id: String,
        removed: u64,
    },
    /// A rotated refresh token of `session_id` was presented again.
    TokenTheftDetected {
        account_id: String,
        session_id: String,
    },
    SignInFailed {
        /// `None` when the failure cannot be tied to a local account.
        account_id: Option<String>,
        reason: String,
    },
    AccountLocked {
        account_id: String,
        retry_after_secs: u64,
    },
}

impl AuthEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionCreated { .. } => "session_created",
            Self::SessionRefreshed { .. } => "session_refreshed",
            Self::SessionEvicted { .. } => "session_evicted",
            Self::SessionRevoked { .. } => "session_revoked",
            Self::AllSessionsRevoked { .. } => "all_sessions_revoked",
            Self::TokenTheftDetected { .. } => "token_theft_detected",
            Self::SignInFailed { .. } => "sign_in_failed",
            Self::AccountLocked { .. } => "account_locked",
        }
    }

    fn is_alarm(&self) -> bool {
        matches!(
            self,
            Self::TokenTheftDetected { .. } | Self::AccountLocked { .. }
        )
    }
}

/// Receives audit events.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuthEvent);
}

/// Writes each event as a structured `tracing` record under the
/// `signet::audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, event: AuthEvent) {
        let name = event.name();
        let detail = serde_json::to_string(&event).unwrap_or_default();
        if event.is_alarm() {
            tracing::warn!(target: "signet::audit", event = name, %detail, "audit");
        } else {
            tracing::info!(target: "signet::audit", event = name, %detail, "audit");
        }
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAuditSink;

#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn record(&self, _event: AuthEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_event_tag() {
        let event = AuthEvent::AccountLocked {
            account_id: "a".to_string(),
            retry_after_secs: 900,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "account_locked");
        assert_eq!(json["retry_after_secs"], 900);
        assert_eq!(event.name(), "account_locked");
    }

    #[tokio::test]
    async fn tracing_sink_accepts_every_event() {
        let sink = TracingAuditSink;
        sink.record(AuthEvent::SessionRevoked {
            session_id: "s".to_string(),
        })
        .await;
        sink.record(AuthEvent::TokenTheftDetected {
            account_id: "a".to_string(),
            session_id: "s".to_string(),
        })
        .await;
    }
}
