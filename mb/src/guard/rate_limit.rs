//! Proactive windowed rate limiter
//!
//! Truncated-to-minute and truncated-to-day windows, not sliding windows:
//! the intent is proactive cliff-avoidance with graceful reset, not strict
//! instantaneous rate shaping. Counters zero on window rollover, and the
//! limiter's breaker auto-closes when the window that tripped it rolls over.
//!
//! This breaker is distinct from the per-adapter consecutive-failure breaker;
//! the guarded adapter composes the two.

use std::sync::Mutex;

use chrono::{DateTime, NaiveDate, Timelike, Utc};
use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::error::GatewayError;

/// Which limit tripped the guard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Threshold {
    /// Requests per minute
    Rpm,
    /// Requests per day
    Rpd,
    /// Tokens per minute
    Tpm,
}

impl Threshold {
    fn reason(&self) -> &'static str {
        match self {
            Threshold::Rpm => "RPM threshold",
            Threshold::Rpd => "RPD threshold",
            Threshold::Tpm => "TPM threshold",
        }
    }

    /// The window whose rollover auto-closes a breaker opened by this limit
    fn minute_scoped(&self) -> bool {
        matches!(self, Threshold::Rpm | Threshold::Tpm)
    }
}

/// Aggregate limiter counters
#[derive(Debug, Clone, Default)]
pub struct LimiterMetrics {
    pub total_requests: u64,
    pub total_tokens: u64,
    pub circuit_open_count: u64,
    pub last_open: Option<DateTime<Utc>>,
    pub limit_reached_count: u64,
}

struct MinuteWindow {
    start: DateTime<Utc>,
    requests: u32,
    tokens: u64,
    /// Highest usage-warning tier already emitted this window (50/60/70)
    warned_pct: u8,
}

struct DayWindow {
    start: NaiveDate,
    requests: u32,
}

struct LimiterInner {
    minute: MinuteWindow,
    day: DayWindow,
    open: Option<Threshold>,
    metrics: LimiterMetrics,
}

/// Truncated-window rate limiter with an integrated breaker
pub struct RateLimiter {
    name: String,
    config: RateLimitConfig,
    inner: Mutex<LimiterInner>,
}

impl RateLimiter {
    pub fn new(name: impl Into<String>, config: RateLimitConfig) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(LimiterInner {
                minute: MinuteWindow {
                    start: minute_floor(now),
                    requests: 0,
                    tokens: 0,
                    warned_pct: 0,
                },
                day: DayWindow {
                    start: now.date_naive(),
                    requests: 0,
                },
                open: None,
                metrics: LimiterMetrics::default(),
            }),
        }
    }

    /// Admission check using the wall clock
    pub fn check(&self, estimated_tokens: u64) -> Result<(), GatewayError> {
        self.check_at(Utc::now(), estimated_tokens)
    }

    /// Admission check at an explicit instant (injectable for tests)
    pub fn check_at(&self, now: DateTime<Utc>, estimated_tokens: u64) -> Result<(), GatewayError> {
        let mut inner = self.inner.lock().expect("limiter lock poisoned");
        roll_windows(&mut inner, now);

        if let Some(tripped) = inner.open {
            return Err(GatewayError::RateLimited {
                reason: format!("{} open for '{}'", tripped.reason(), self.name),
            });
        }

        // After-this-request percentages against each declared limit
        let rpm_pct = pct(inner.minute.requests as u64 + 1, self.config.requests_per_minute as u64);
        let rpd_pct = pct(inner.day.requests as u64 + 1, self.config.requests_per_day as u64);
        let tpm_pct = pct(inner.minute.tokens + estimated_tokens, self.config.tokens_per_minute);

        let breach = [
            (Threshold::Rpm, rpm_pct),
            (Threshold::Rpd, rpd_pct),
            (Threshold::Tpm, tpm_pct),
        ]
        .into_iter()
        .find(|(_, p)| *p > self.config.threshold * 100.0);

        if let Some((tripped, p)) = breach {
            warn!(
                limiter = %self.name,
                threshold = tripped.reason(),
                pct = p,
                "Rate limit breaker opened"
            );
            inner.open = Some(tripped);
            inner.metrics.circuit_open_count += 1;
            inner.metrics.limit_reached_count += 1;
            inner.metrics.last_open = Some(now);
            return Err(GatewayError::RateLimited {
                reason: format!("{} for '{}' ({:.1}% projected)", tripped.reason(), self.name, p),
            });
        }

        self.maybe_warn(&mut inner, rpm_pct.max(tpm_pct));
        Ok(())
    }

    /// Report actual usage after a successful upstream round-trip
    pub fn record_request(&self, tokens: u64) {
        self.record_request_at(Utc::now(), tokens);
    }

    pub fn record_request_at(&self, now: DateTime<Utc>, tokens: u64) {
        let mut inner = self.inner.lock().expect("limiter lock poisoned");
        roll_windows(&mut inner, now);

        inner.minute.requests += 1;
        inner.minute.tokens += tokens;
        inner.day.requests += 1;
        inner.metrics.total_requests += 1;
        inner.metrics.total_tokens += tokens;
    }

    /// Whether the guard breaker is currently open
    pub fn is_open(&self) -> bool {
        self.inner.lock().expect("limiter lock poisoned").open.is_some()
    }

    pub fn metrics(&self) -> LimiterMetrics {
        self.inner.lock().expect("limiter lock poisoned").metrics.clone()
    }

    /// Current window counters (requests, tokens this minute; requests today)
    pub fn window_counts(&self) -> (u32, u64, u32) {
        let inner = self.inner.lock().expect("limiter lock poisoned");
        (inner.minute.requests, inner.minute.tokens, inner.day.requests)
    }

    /// Log-only usage warnings as consumption crosses 50 / 60 / 70 %
    fn maybe_warn(&self, inner: &mut LimiterInner, usage_pct: f64) {
        for tier in [70u8, 60, 50] {
            if usage_pct >= tier as f64 {
                if inner.minute.warned_pct < tier {
                    warn!(limiter = %self.name, pct = usage_pct, tier, "Rate limit usage warning");
                    inner.minute.warned_pct = tier;
                }
                break;
            }
        }
    }
}

fn pct(used: u64, limit: u64) -> f64 {
    if limit == 0 {
        0.0
    } else {
        (used as f64 / limit as f64) * 100.0
    }
}

fn minute_floor(now: DateTime<Utc>) -> DateTime<Utc> {
    now.with_second(0).and_then(|t| t.with_nanosecond(0)).unwrap_or(now)
}

/// Roll expired windows: zero counters, and auto-close a breaker that was
/// opened by the rolled-over window's threshold.
fn roll_windows(inner: &mut LimiterInner, now: DateTime<Utc>) {
    let minute_start = minute_floor(now);
    if minute_start != inner.minute.start {
        inner.minute.start = minute_start;
        inner.minute.requests = 0;
        inner.minute.tokens = 0;
        inner.minute.warned_pct = 0;
        if inner.open.map(|t| t.minute_scoped()).unwrap_or(false) {
            debug!("Minute window rolled over, closing rate-limit breaker");
            inner.open = None;
        }
    }

    let today = now.date_naive();
    if today != inner.day.start {
        inner.day.start = today;
        inner.day.requests = 0;
        if inner.open == Some(Threshold::Rpd) {
            debug!("Day window rolled over, closing rate-limit breaker");
            inner.open = None;
        }
    }
}
