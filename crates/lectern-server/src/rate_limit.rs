//! Per-device limiter for license validation attempts.
//!
//! State lives in the `device_rate_limits` table; every update is a
//! read-modify-write inside one immediate transaction, so parallel attempts
//! from the same device (in this process or another) are linearised.

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use lectern_shared::types::{DeviceId, UserId};
use lectern_store::{DeviceRateLimit, StoreError};

use crate::config::RateLimitPolicy;
use crate::db::Db;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Blocked { until: DateTime<Utc> },
}

/// Block length after `failed_attempts` consecutive failures:
/// `base * 2^(failed - threshold)`, capped at `max_block`.
pub fn block_duration(policy: &RateLimitPolicy, failed_attempts: u32) -> chrono::Duration {
    let over = failed_attempts.saturating_sub(policy.threshold).min(31);
    let block = policy
        .base_block
        .saturating_mul(1u32 << over)
        .min(policy.max_block);
    to_chrono(block)
}

pub(crate) fn to_chrono(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Apply one failed attempt at `now` to `current`.
///
/// Attempts are refused unrecorded while a block holds, so the quiet period
/// is measured from the end of the last block: a device that fails again as
/// soon as it is let back in keeps its count and gets a longer block.
pub fn apply_failure(
    policy: &RateLimitPolicy,
    current: Option<DeviceRateLimit>,
    device_id: DeviceId,
    now: DateTime<Utc>,
) -> DeviceRateLimit {
    let mut limit = current.unwrap_or_else(|| DeviceRateLimit::fresh(device_id, now));

    let since = limit
        .blocked_until
        .map_or(limit.last_attempt_at, |until| until.max(limit.last_attempt_at));
    let quiet = now - since;
    if !limit.is_blocked_at(now) && quiet > to_chrono(policy.window) {
        limit.failed_attempts = 0;
        limit.blocked_until = None;
    }

    limit.failed_attempts = limit.failed_attempts.saturating_add(1);
    limit.last_attempt_at = now;
    if limit.failed_attempts >= policy.threshold {
        limit.blocked_until = Some(now + block_duration(policy, limit.failed_attempts));
    }
    limit
}

/// Apply one successful attempt: the counter and any block are cleared.
pub fn apply_success(
    current: Option<DeviceRateLimit>,
    device_id: DeviceId,
    now: DateTime<Utc>,
) -> DeviceRateLimit {
    let mut limit = current.unwrap_or_else(|| DeviceRateLimit::fresh(device_id, now));
    limit.failed_attempts = 0;
    limit.blocked_until = None;
    limit.last_attempt_at = now;
    limit
}

#[derive(Clone)]
pub struct DeviceRateLimiter {
    db: Db,
    policy: RateLimitPolicy,
}

impl DeviceRateLimiter {
    pub fn new(db: Db, policy: RateLimitPolicy) -> Self {
        Self { db, policy }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Gate an attempt. Read-only; a failed read is treated as blocked.
    pub fn check(&self, device_id: DeviceId) -> RateDecision {
        self.check_at(device_id, Utc::now())
    }

    fn check_at(&self, device_id: DeviceId, now: DateTime<Utc>) -> RateDecision {
        match self.db.raw(|db| db.get_rate_limit(device_id)) {
            Ok(Ok(Some(limit))) => match limit.blocked_until {
                Some(until) if until > now => {
                    debug!(%device_id, %until, "Device is blocked");
                    RateDecision::Blocked { until }
                }
                _ => RateDecision::Allowed,
            },
            Ok(Ok(None)) => RateDecision::Allowed,
            Ok(Err(e)) => {
                error!(%device_id, error = %e, "Rate limit read failed, refusing attempt");
                self.fail_closed(now)
            }
            Err(_) => self.fail_closed(now),
        }
    }

    fn fail_closed(&self, now: DateTime<Utc>) -> RateDecision {
        RateDecision::Blocked {
            until: now + to_chrono(self.policy.base_block),
        }
    }

    /// Update the counters after an attempt by `owner`. Never fails the
    /// caller: the decision already made stands even if persisting it does
    /// not. Attempts against a device `owner` does not hold are not counted,
    /// so nobody can block another user's device.
    pub fn record_outcome(&self, device_id: DeviceId, owner: UserId, success: bool) {
        self.record_outcome_at(device_id, owner, success, Utc::now());
    }

    fn record_outcome_at(
        &self,
        device_id: DeviceId,
        owner: UserId,
        success: bool,
        now: DateTime<Utc>,
    ) {
        let policy = &self.policy;
        let result = self.db.raw(|db| {
            db.update_rate_limit(device_id, owner, |current| {
                let next = if success {
                    apply_success(current, device_id, now)
                } else {
                    apply_failure(policy, current, device_id, now)
                };
                let blocked_until = next.blocked_until;
                let failed = next.failed_attempts;
                (next, (failed, blocked_until))
            })
        });

        match result {
            Ok(Ok((failed, Some(until)))) if !success => {
                warn!(%device_id, failed_attempts = failed, %until, "Device blocked after repeated failures");
            }
            Ok(Ok((failed, _))) => {
                debug!(%device_id, success, failed_attempts = failed, "Recorded attempt");
            }
            Ok(Err(StoreError::NotFound)) => {
                debug!(%device_id, user_id = %owner, "Attempt not recorded: device not held by caller");
            }
            Ok(Err(e)) => error!(%device_id, error = %e, "Failed to record attempt"),
            Err(e) => error!(%device_id, error = %e, "Failed to record attempt"),
        }
    }

    #[cfg(test)]
    fn state(&self, device_id: DeviceId) -> Option<DeviceRateLimit> {
        self.db.call(|db| db.get_rate_limit(device_id)).ok().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use lectern_shared::types::{Platform, UserId};
    use lectern_store::{Database, NewDevice, RegisterOutcome};

    fn policy() -> RateLimitPolicy {
        RateLimitPolicy {
            threshold: 5,
            window: Duration::from_secs(3600),
            base_block: Duration::from_secs(3600),
            max_block: Duration::from_secs(24 * 3600),
        }
    }

    fn limiter_with_device() -> (DeviceRateLimiter, DeviceId, UserId) {
        let mut db = Database::open_in_memory().unwrap();
        let owner = UserId::new();
        let outcome = db
            .register_device_checked(
                &NewDevice {
                    owner_user_id: owner,
                    fingerprint: "r".repeat(32),
                    display_name: "Phone".into(),
                    platform: Platform::Android,
                },
                5,
                Utc::now(),
            )
            .unwrap();
        let RegisterOutcome::Registered(device) = outcome else {
            panic!("registration failed: {outcome:?}");
        };
        (DeviceRateLimiter::new(Db::new(db), policy()), device.id, owner)
    }

    #[test]
    fn test_block_duration_grows_and_caps() {
        let p = policy();
        assert_eq!(block_duration(&p, 5), chrono::Duration::hours(1));
        assert_eq!(block_duration(&p, 6), chrono::Duration::hours(2));
        assert_eq!(block_duration(&p, 8), chrono::Duration::hours(8));
        assert_eq!(block_duration(&p, 10), chrono::Duration::hours(24));
        assert_eq!(block_duration(&p, u32::MAX), chrono::Duration::hours(24));
    }

    #[test]
    fn test_failures_accumulate_then_block() {
        let p = policy();
        let device = DeviceId::new();
        let now = Utc::now();

        let mut state = None;
        for i in 1..=4 {
            let next = apply_failure(&p, state, device, now);
            assert_eq!(next.failed_attempts, i);
            assert!(next.blocked_until.is_none());
            state = Some(next);
        }
        let fifth = apply_failure(&p, state, device, now);
        assert_eq!(fifth.failed_attempts, 5);
        assert_eq!(fifth.blocked_until, Some(now + chrono::Duration::hours(1)));
    }

    #[test]
    fn test_quiet_period_resets_count() {
        let p = policy();
        let device = DeviceId::new();
        let start = Utc::now();

        let mut state = DeviceRateLimit::fresh(device, start);
        state.failed_attempts = 3;

        let later = start + chrono::Duration::hours(2);
        let next = apply_failure(&p, Some(state.clone()), device, later);
        assert_eq!(next.failed_attempts, 1);

        let soon = start + chrono::Duration::minutes(30);
        let next = apply_failure(&p, Some(state), device, soon);
        assert_eq!(next.failed_attempts, 4);
    }

    #[test]
    fn test_success_clears_state() {
        let device = DeviceId::new();
        let now = Utc::now();
        let mut state = DeviceRateLimit::fresh(device, now);
        state.failed_attempts = 7;
        state.blocked_until = Some(now + chrono::Duration::hours(3));

        let next = apply_success(Some(state), device, now);
        assert_eq!(next.failed_attempts, 0);
        assert!(next.blocked_until.is_none());
    }

    #[test]
    fn test_limiter_blocks_after_threshold() {
        let (limiter, device, owner) = limiter_with_device();
        let now = Utc::now();

        for _ in 0..5 {
            assert_eq!(limiter.check_at(device, now), RateDecision::Allowed);
            limiter.record_outcome_at(device, owner, false, now);
        }
        let RateDecision::Blocked { until } = limiter.check_at(device, now) else {
            panic!("expected block");
        };
        assert!(until > now);

        // Once the block elapses a success resets everything.
        let after = until + chrono::Duration::seconds(1);
        assert_eq!(limiter.check_at(device, after), RateDecision::Allowed);
        limiter.record_outcome_at(device, owner, true, after);
        let state = limiter.state(device).unwrap();
        assert_eq!(state.failed_attempts, 0);
        assert!(state.blocked_until.is_none());
    }

    #[test]
    fn test_unknown_device_is_allowed_and_not_recorded() {
        let (limiter, _, owner) = limiter_with_device();
        let stranger = DeviceId::new();
        assert_eq!(limiter.check(stranger), RateDecision::Allowed);
        limiter.record_outcome(stranger, owner, false);
        assert!(limiter.state(stranger).is_none());
    }

    #[test]
    fn test_failures_by_another_user_are_not_counted() {
        let (limiter, device, owner) = limiter_with_device();
        let mallory = UserId::new();
        let now = Utc::now();

        for _ in 0..10 {
            limiter.record_outcome_at(device, mallory, false, now);
        }
        assert!(limiter.state(device).is_none());
        assert_eq!(limiter.check_at(device, now), RateDecision::Allowed);

        limiter.record_outcome_at(device, owner, false, now);
        assert_eq!(limiter.state(device).unwrap().failed_attempts, 1);
    }

    #[test]
    fn test_repeat_offender_gets_longer_block() {
        let p = RateLimitPolicy::default();
        let device = DeviceId::new();
        let t0 = Utc::now();

        let mut state = None;
        for _ in 0..5 {
            state = Some(apply_failure(&p, state, device, t0));
        }
        let first = state.clone().unwrap();
        let first_until = first.blocked_until.unwrap();
        assert_eq!(first_until - t0, chrono::Duration::hours(1));

        // One more failure right after the block lifts.
        let back = first_until + chrono::Duration::seconds(1);
        let second = apply_failure(&p, state, device, back);
        assert_eq!(second.failed_attempts, 6);
        assert_eq!(second.blocked_until, Some(back + chrono::Duration::hours(2)));

        let back = back + chrono::Duration::hours(2) + chrono::Duration::seconds(1);
        let third = apply_failure(&p, Some(second), device, back);
        assert_eq!(third.failed_attempts, 7);
        assert_eq!(third.blocked_until, Some(back + chrono::Duration::hours(4)));
    }

    #[test]
    fn test_long_quiet_after_block_starts_over() {
        let p = RateLimitPolicy::default();
        let device = DeviceId::new();
        let t0 = Utc::now();

        let mut state = None;
        for _ in 0..5 {
            state = Some(apply_failure(&p, state, device, t0));
        }
        let until = state.as_ref().unwrap().blocked_until.unwrap();

        let much_later = until + chrono::Duration::hours(2);
        let next = apply_failure(&p, state, device, much_later);
        assert_eq!(next.failed_attempts, 1);
        assert!(next.blocked_until.is_none());
    }

    #[test]
    fn test_limiter_escalates_with_default_policy() {
        let (limiter, device, owner) = limiter_with_device();
        let limiter = DeviceRateLimiter::new(limiter.db.clone(), RateLimitPolicy::default());
        let t0 = Utc::now();

        for _ in 0..5 {
            limiter.record_outcome_at(device, owner, false, t0);
        }
        let RateDecision::Blocked { until } = limiter.check_at(device, t0) else {
            panic!("expected block");
        };

        let back = until + chrono::Duration::seconds(1);
        assert_eq!(limiter.check_at(device, back), RateDecision::Allowed);
        limiter.record_outcome_at(device, owner, false, back);
        assert_eq!(
            limiter.check_at(device, back),
            RateDecision::Blocked { until: back + chrono::Duration::hours(2) }
        );
    }

    #[test]
    fn test_read_failure_fails_closed() {
        let (limiter, device, _) = limiter_with_device();
        limiter
            .db
            .call(|db| {
                db.conn().execute_batch("DROP TABLE device_rate_limits")?;
                Ok(())
            })
            .unwrap();

        let now = Utc::now();
        assert_eq!(
            limiter.check_at(device, now),
            RateDecision::Blocked { until: now + chrono::Duration::hours(1) }
        );
    }
}
