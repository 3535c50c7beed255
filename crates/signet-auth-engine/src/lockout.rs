//! Progressive account lockout.
//!
//! Consecutive authentication failures are counted per account. Reaching
//! the threshold locks the account; each lockout since the last success
//! lasts longer than the previous one:
//!
//! ```text
//! duration(n) = min(base * multiplier^(n-1), max)
//! ```
//!
//! With the defaults (15 min, x2, 24 h cap, threshold 5) the lockouts last
//! 15, 30, 60, 120, 240, 480 minutes, then 1440 minutes from the 7th on.
//! A lock is never permanent.
//!
//! The state transition itself lives in [`LockoutPolicy::register_failure`],
//! a pure function. [`LockoutRepository::apply_failure`] runs it inside the
//! store's atomic read-modify-write so concurrent failures for one account
//! cannot lose increments.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::LockoutConfig;
use crate::deadline::bounded;
use crate::error::Result;
use crate::model::LockoutState;
use crate::repository::LockoutRepository;

/// Lock status of an account at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockedStatus {
    Unlocked,
    Locked {
        until: DateTime<Utc>,
        /// Whole seconds until `until`, rounded up.
        retry_after_secs: u64,
    },
}

impl LockedStatus {
    /// Derive the status of `state` at `now`.
    pub fn of(state: &LockoutState, now: DateTime<Utc>) -> Self {
        match state.locked_until {
            Some(until) if until > now => {
                let remaining_ms = (until - now).num_milliseconds().max(0) as u64;
                Self::Locked {
                    until,
                    retry_after_secs: remaining_ms.div_ceil(1000),
                }
            }
            _ => Self::Unlocked,
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked { .. })
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Threshold and duration schedule for lockouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockoutPolicy {
    pub threshold: u32,
    pub base: Duration,
    pub multiplier: u32,
    pub max: Duration,
}

impl From<&LockoutConfig> for LockoutPolicy {
    fn from(config: &LockoutConfig) -> Self {
        Self {
            threshold: config.threshold,
            base: Duration::from_secs(config.base_duration_secs),
            multiplier: config.multiplier,
            max: Duration::from_secs(config.max_duration_secs),
        }
    }
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self::from(&LockoutConfig::default())
    }
}

impl LockoutPolicy {
    /// Duration of the `n`th lockout (1-based). `n = 0` is treated as 1.
    pub fn duration_for(&self, n: u32) -> Duration {
        let mut duration = self.base;
        for _ in 1..n.max(1) {
            if duration >= self.max {
                break;
            }
            duration = duration.saturating_mul(self.multiplier);
        }
        duration.min(self.max)
    }

    /// The state after one more failure at `now`.
    ///
    /// A failure that arrives while the account is already locked leaves
    /// the counters alone apart from `last_failed_at`; locked accounts are
    /// turned away before any credential check.
    pub fn register_failure(&self, state: &LockoutState, now: DateTime<Utc>) -> LockoutState {
        let mut next = state.clone();
        next.last_failed_at = Some(now);

        if LockedStatus::of(state, now).is_locked() {
            return next;
        }

        next.failed_attempts = state.failed_attempts.saturating_add(1);
        if next.failed_attempts >= self.threshold {
            next.lockout_count = state.lockout_count.saturating_add(1);
            let duration = self.duration_for(next.lockout_count);
            let until = chrono::Duration::from_std(duration)
                .ok()
                .and_then(|d| now.checked_add_signed(d))
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            next.locked_until = Some(until);
            next.failed_attempts = 0;
        }
        next
    }
}

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

/// The lockout state machine, backed by a [`LockoutRepository`].
pub struct LockoutGuard {
    repo: Arc<dyn LockoutRepository>,
    policy: LockoutPolicy,
    timeout: Duration,
}

impl LockoutGuard {
    pub fn new(repo: Arc<dyn LockoutRepository>, policy: LockoutPolicy, timeout: Duration) -> Self {
        Self {
            repo,
            policy,
            timeout,
        }
    }

    pub fn policy(&self) -> &LockoutPolicy {
        &self.policy
    }

    /// Whether `account_id` is currently locked.
    ///
    /// # Errors
    ///
    /// Returns [`AuthEngineError::Unavailable`](crate::AuthEngineError) on
    /// repository failure; a failed read is never treated as "unlocked".
    pub async fn check_locked(&self, account_id: &str) -> Result<LockedStatus> {
        let state = bounded(self.timeout, "lockout.get_state", self.repo.get_state(account_id))
            .await?;
        Ok(state
            .map(|s| LockedStatus::of(&s, Utc::now()))
            .unwrap_or(LockedStatus::Unlocked))
    }

    /// Count one failed authentication and return the resulting status.
    pub async fn record_failure(&self, account_id: &str) -> Result<LockedStatus> {
        let now = Utc::now();
        let state = bounded(
            self.timeout,
            "lockout.apply_failure",
            self.repo.apply_failure(account_id, &self.policy, now),
        )
        .await?;

        let status = LockedStatus::of(&state, now);
        match status {
            LockedStatus::Locked {
                until,
                retry_after_secs,
            } => tracing::warn!(
                account_id,
                lockout_count = state.lockout_count,
                %until,
                retry_after_secs,
                "account locked"
            ),
            LockedStatus::Unlocked => tracing::info!(
                account_id,
                failed_attempts = state.failed_attempts,
                threshold = self.policy.threshold,
                "authentication failure recorded"
            ),
        }
        Ok(status)
    }

    /// Reset counters after a successful authentication.
    pub async fn record_success(&self, account_id: &str) -> Result<()> {
        bounded(
            self.timeout,
            "lockout.apply_success",
            self.repo.apply_success(account_id),
        )
        .await?;
        tracing::debug!(account_id, "lockout counters reset");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
