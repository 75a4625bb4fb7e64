// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Dual-dimension token bucket for replicator dispatch throttling.
//!
//! Each replicator may carry one [`DispatchRateLimiter`], holding a message
//! bucket and a byte bucket that share one rate period:
//!
//! ```text
//!            rate / period per second
//!                    │
//!                    ▼
//!   ┌─────────────────────────────┐  cap = rate (one period's worth)
//!   │ messages  ████████░░░░░░░░  │
//!   │ bytes     ██████████████░░  │
//!   └─────────────────────────────┘
//!        try_acquire(1, len) takes from both, or from neither
//! ```
//!
//! # Accrual
//!
//! Tokens accrue continuously (`tokens += rate × elapsed / period`) rather
//! than in period-aligned steps, so a 100-per-360s policy releases one
//! message every 3.6s instead of 100 at once every 6 minutes.
//!
//! # Grant Rules
//!
//! - Disabled dimensions (`-1`) are always satisfied.
//! - A request is granted only when every enabled dimension can cover it;
//!   then each enabled dimension is debited by exactly the request.
//! - A request larger than a dimension's capacity is granted once that
//!   bucket is full. The balance goes negative and is repaid by refill,
//!   so oversized entries are delayed, never starved.
//! - A dimension with rate `0` grants nothing: dispatch is paused until
//!   the policy changes.
//!
//! # Reconfiguration
//!
//! [`DispatchRateLimiter::reconfigure`] accrues up to "now" under the old
//! policy and then swaps it. A dimension that stays enabled keeps its fill
//! fraction, a newly enabled one starts full, a disabled one is dropped.
//!
//! Presence of a limiter is observable state in its own right: a replicator
//! with no enabled policy has [`LimiterSlot::Absent`], not a limiter that
//! happens to grant everything.

use crate::error::Result;
use crate::policy::DispatchRatePolicy;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Slack for float accrual (100 × 3.6 / 360 is not exactly 1.0).
const TOKEN_EPSILON: f64 = 1e-9;

/// Seconds to a wait hint, saturating at [`Duration::MAX`] for waits no
/// `Duration` can hold (huge periods, large debts).
fn wait_secs(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Outcome of a permit request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Acquire {
    /// Permits taken from every enabled dimension.
    Granted,
    /// Nothing taken. Retry after `wait`.
    Denied { wait: Duration },
}

impl Acquire {
    pub fn is_granted(&self) -> bool {
        matches!(self, Acquire::Granted)
    }
}

/// One dimension's balance.
#[derive(Debug, Clone, Copy)]
struct Bucket {
    /// Permits per period; also the burst cap.
    rate: f64,
    tokens: f64,
}

impl Bucket {
    fn full(rate: i64) -> Self {
        let rate = rate as f64;
        Self { rate, tokens: rate }
    }

    fn accrue(&mut self, elapsed_secs: f64, period_secs: f64) {
        self.tokens = (self.tokens + self.rate * elapsed_secs / period_secs).min(self.rate);
    }

    /// Amount that must be on hand before `amount` can be granted.
    fn required(&self, amount: f64) -> f64 {
        amount.min(self.rate)
    }

    fn covers(&self, amount: u64) -> bool {
        if amount == 0 {
            return true;
        }
        if self.rate <= 0.0 {
            return false;
        }
        self.tokens + TOKEN_EPSILON >= self.required(amount as f64)
    }

    fn wait_for(&self, amount: u64, period_secs: f64) -> Duration {
        if self.rate <= 0.0 {
            // Paused: re-check once per period or when the policy changes.
            return wait_secs(period_secs);
        }
        let deficit = (self.required(amount as f64) - self.tokens).max(0.0);
        wait_secs(deficit * period_secs / self.rate)
    }

    /// Keep the fill fraction under a new rate.
    fn rescale(&self, new_rate: i64) -> Self {
        let new_rate_f = new_rate as f64;
        let tokens = if self.rate <= 0.0 {
            new_rate_f
        } else {
            (self.tokens / self.rate * new_rate_f).min(new_rate_f)
        };
        Self {
            rate: new_rate_f,
            tokens,
        }
    }
}

#[derive(Debug)]
struct BucketState {
    policy: DispatchRatePolicy,
    messages: Option<Bucket>,
    bytes: Option<Bucket>,
    last_refill: Instant,
}

impl BucketState {
    fn new(policy: DispatchRatePolicy, now: Instant) -> Self {
        Self {
            policy,
            messages: policy
                .is_message_enabled()
                .then(|| Bucket::full(policy.message_dispatch_rate)),
            bytes: policy
                .is_byte_enabled()
                .then(|| Bucket::full(policy.byte_dispatch_rate)),
            last_refill: now,
        }
    }

    fn period_secs(&self) -> f64 {
        self.policy.rate_period_seconds as f64
    }

    fn accrue(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            let period = self.period_secs();
            if let Some(b) = self.messages.as_mut() {
                b.accrue(elapsed, period);
            }
            if let Some(b) = self.bytes.as_mut() {
                b.accrue(elapsed, period);
            }
        }
        self.last_refill = self.last_refill.max(now);
    }
}

/// Per-replicator token bucket over messages and bytes.
///
/// `configure`-style updates and `try_acquire` are serialized by one mutex
/// so a policy swap can never interleave with a deduction.
#[derive(Debug)]
pub struct DispatchRateLimiter {
    state: Mutex<BucketState>,
}

impl DispatchRateLimiter {
    /// Create a limiter with full buckets.
    ///
    /// The policy must validate and enable at least one dimension; a policy
    /// with both dimensions disabled has no limiter (see [`LimiterSlot`]).
    pub fn new(policy: DispatchRatePolicy) -> Result<Self> {
        Self::new_at(policy, Instant::now())
    }

    pub fn new_at(policy: DispatchRatePolicy, now: Instant) -> Result<Self> {
        policy.validate()?;
        if !policy.is_throttling() {
            return Err(crate::error::ReplicationError::InvalidPolicy(
                "a rate limiter needs at least one enabled dimension".to_string(),
            ));
        }
        Ok(Self {
            state: Mutex::new(BucketState::new(policy, now)),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BucketState> {
        // Bucket math cannot panic mid-update, so a poisoned lock still holds a consistent state.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Currently enforced policy.
    pub fn policy(&self) -> DispatchRatePolicy {
        self.lock().policy
    }

    /// Read-only view of the configured rates.
    pub fn view(&self) -> RateLimiterView {
        RateLimiterView::from_policy(&self.policy())
    }

    /// Request permits for `messages` messages totalling `bytes` bytes.
    pub fn try_acquire(&self, messages: u64, bytes: u64) -> Acquire {
        self.try_acquire_at(messages, bytes, Instant::now())
    }

    pub fn try_acquire_at(&self, messages: u64, bytes: u64, now: Instant) -> Acquire {
        let mut state = self.lock();
        state.accrue(now);

        let msg_ok = state.messages.map_or(true, |b| b.covers(messages));
        let byte_ok = state.bytes.map_or(true, |b| b.covers(bytes));

        if msg_ok && byte_ok {
            if let Some(b) = state.messages.as_mut() {
                b.tokens -= messages as f64;
            }
            if let Some(b) = state.bytes.as_mut() {
                b.tokens -= bytes as f64;
            }
            return Acquire::Granted;
        }

        let period = state.period_secs();
        let mut wait = Duration::ZERO;
        if let Some(b) = state.messages.filter(|_| !msg_ok) {
            wait = wait.max(b.wait_for(messages, period));
        }
        if let Some(b) = state.bytes.filter(|_| !byte_ok) {
            wait = wait.max(b.wait_for(bytes, period));
        }
        // Never hand back a zero wait for a denial; callers would spin.
        Acquire::Denied {
            wait: wait.max(Duration::from_millis(1)),
        }
    }

    /// Swap the policy in place, keeping balances where the dimension survives.
    ///
    /// Returns `Ok(false)` if the policy is identical (no-op). Invalid
    /// policies and policies that disable both dimensions are rejected with
    /// the previous state untouched; removing the limiter is the owning
    /// [`LimiterSlot`]'s job.
    pub fn reconfigure(&self, policy: DispatchRatePolicy) -> Result<bool> {
        self.reconfigure_at(policy, Instant::now())
    }

    pub fn reconfigure_at(&self, policy: DispatchRatePolicy, now: Instant) -> Result<bool> {
        policy.validate()?;
        if !policy.is_throttling() {
            return Err(crate::error::ReplicationError::InvalidPolicy(
                "cannot reconfigure a rate limiter to disable every dimension".to_string(),
            ));
        }

        let mut state = self.lock();
        if state.policy == policy {
            return Ok(false);
        }

        state.accrue(now);

        let messages = match (policy.is_message_enabled(), state.messages) {
            (true, Some(old)) => Some(old.rescale(policy.message_dispatch_rate)),
            (true, None) => Some(Bucket::full(policy.message_dispatch_rate)),
            (false, _) => None,
        };
        let bytes = match (policy.is_byte_enabled(), state.bytes) {
            (true, Some(old)) => Some(old.rescale(policy.byte_dispatch_rate)),
            (true, None) => Some(Bucket::full(policy.byte_dispatch_rate)),
            (false, _) => None,
        };

        state.policy = policy;
        state.messages = messages;
        state.bytes = bytes;
        state.last_refill = now.max(state.last_refill);
        Ok(true)
    }

    /// Current balances `(messages, bytes)` after accruing to `now`.
    /// `None` for a disabled dimension.
    pub fn available_at(&self, now: Instant) -> (Option<f64>, Option<f64>) {
        let mut state = self.lock();
        state.accrue(now);
        (state.messages.map(|b| b.tokens), state.bytes.map(|b| b.tokens))
    }
}

/// Read-only view of a replicator's rate limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimiterView {
    msg_rate: i64,
    byte_rate: i64,
    period: Duration,
}

impl RateLimiterView {
    fn from_policy(policy: &DispatchRatePolicy) -> Self {
        Self {
            msg_rate: policy.message_dispatch_rate,
            byte_rate: policy.byte_dispatch_rate,
            period: Duration::from_secs(policy.rate_period_seconds.max(0) as u64),
        }
    }

    /// Messages per period, `-1` when the dimension is disabled.
    pub fn dispatch_rate_on_msg(&self) -> i64 {
        self.msg_rate
    }

    /// Bytes per period, `-1` when the dimension is disabled.
    pub fn dispatch_rate_on_byte(&self) -> i64 {
        self.byte_rate
    }

    pub fn rate_period(&self) -> Duration {
        self.period
    }
}

/// A replicator's limiter: either absent (no throttling) or present.
#[derive(Debug, Clone, Default)]
pub enum LimiterSlot {
    #[default]
    Absent,
    Present(Arc<DispatchRateLimiter>),
}

impl LimiterSlot {
    pub fn is_present(&self) -> bool {
        matches!(self, LimiterSlot::Present(_))
    }

    pub fn limiter(&self) -> Option<&Arc<DispatchRateLimiter>> {
        match self {
            LimiterSlot::Present(l) => Some(l),
            LimiterSlot::Absent => None,
        }
    }

    pub fn view(&self) -> Option<RateLimiterView> {
        self.limiter().map(|l| l.view())
    }

    /// Apply a namespace policy (`None` = no policy set).
    ///
    /// - invalid policy: error, slot untouched
    /// - absent or fully disabled policy: slot becomes `Absent`
    /// - enabled policy: existing limiter is reconfigured in place, or a
    ///   full one is created
    ///
    /// Returns whether anything changed.
    pub fn configure(&mut self, policy: Option<&DispatchRatePolicy>) -> Result<bool> {
        self.configure_at(policy, Instant::now())
    }

    pub fn configure_at(&mut self, policy: Option<&DispatchRatePolicy>, now: Instant) -> Result<bool> {
        if let Some(p) = policy {
            p.validate()?;
        }

        match (policy.filter(|p| p.is_throttling()), &*self) {
            (None, LimiterSlot::Absent) => Ok(false),
            (None, LimiterSlot::Present(_)) => {
                *self = LimiterSlot::Absent;
                Ok(true)
            }
            (Some(p), LimiterSlot::Present(limiter)) => limiter.reconfigure_at(*p, now),
            (Some(p), LimiterSlot::Absent) => {
                *self = LimiterSlot::Present(Arc::new(DispatchRateLimiter::new_at(*p, now)?));
                Ok(true)
            }
        }
    }
}
