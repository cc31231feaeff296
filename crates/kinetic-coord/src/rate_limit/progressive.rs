use kinetic_core::{Result, SharedClock};
use kinetic_kv::{KeyOptions, KeyValueStore};
use serde::Serialize;

use super::{RateLimitDecision, RateLimitPolicy, RateLimiter};

/// Violation counters live for an hour after the last violation.
const ATTEMPTS_TTL_SECS: u64 = 3600;

/// Upper bound on the window multiplier.
const MAX_MULTIPLIER: u64 = 16;

/// Window for `base_window_ms` after `violations` consecutive rejections:
/// `min(base * 2^violations, base * 16)`.
pub fn effective_window_ms(base_window_ms: u64, violations: u64) -> u64 {
    let multiplier = 1u64
        .checked_shl(violations.min(63) as u32)
        .unwrap_or(u64::MAX)
        .min(MAX_MULTIPLIER);
    base_window_ms.saturating_mul(multiplier)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressiveDecision {
    #[serde(flatten)]
    pub decision: RateLimitDecision,
    /// Violation count after this request.
    pub violations: u64,
    /// Window the request was counted under.
    pub effective_window_ms: u64,
}

/// Rate limiter whose window widens geometrically after repeated rejections.
///
/// Violations are tracked in a separate `attempts:<identity>` counter. Its
/// window counters are independent of any base limiter checking the same
/// identity.
#[derive(Clone)]
pub struct ProgressiveLockout {
    limiter: RateLimiter,
    store: KeyValueStore,
    base_window_ms: u64,
    opts: KeyOptions,
}

impl ProgressiveLockout {
    pub fn new(store: KeyValueStore, clock: SharedClock, policy: RateLimitPolicy, namespace: &str) -> Self {
        let namespace = format!("{namespace}:progressive");
        Self {
            limiter: RateLimiter::with_namespace(store.clone(), clock, policy, &namespace),
            store,
            base_window_ms: policy.window_ms,
            opts: KeyOptions::namespace(namespace),
        }
    }

    fn attempts_key(identity: &str) -> String {
        format!("attempts:{identity}")
    }

    /// Current violation count for `identity`.
    pub async fn violations(&self, identity: &str) -> Result<u64> {
        let attempts: Option<i64> = self
            .store
            .try_get(&Self::attempts_key(identity), &self.opts)
            .await?;
        Ok(attempts.unwrap_or(0).max(0) as u64)
    }

    /// Window the next request for `identity` will be counted under.
    pub async fn effective_window(&self, identity: &str) -> Result<u64> {
        Ok(effective_window_ms(self.base_window_ms, self.violations(identity).await?))
    }

    /// Count one request, widening the window on rejection and clearing the
    /// violation counter on success.
    pub async fn check(&self, identity: &str) -> Result<ProgressiveDecision> {
        let attempts_key = Self::attempts_key(identity);
        let violations = self.violations(identity).await?;
        let window_ms = effective_window_ms(self.base_window_ms, violations);

        let decision = self.limiter.check_with_window(identity, window_ms).await?;

        let violations = if decision.allowed {
            if violations > 0 {
                self.store.try_del(&attempts_key, &self.opts).await?;
            }
            0
        } else {
            let count = self
                .store
                .try_incr_with_expire(&attempts_key, ATTEMPTS_TTL_SECS, &self.opts)
                .await?;
            tracing::debug!(
                identity = %identity,
                violations = count,
                window_ms,
                "Progressive lockout violation"
            );
            count.max(0) as u64
        };

        Ok(ProgressiveDecision {
            decision,
            violations,
            effective_window_ms: window_ms,
        })
    }
}
