//! Backend request/response types and shared adapter bookkeeping
//!
//! These types are provider-agnostic; each adapter translates them to and
//! from its own wire schema.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::breaker::{BreakerSnapshot, CircuitBreaker};
use crate::error::GatewayError;

/// Caller-tunable knobs for one completion
#[derive(Debug, Clone, Default)]
pub struct CompletionOptions {
    /// Output-token budget (adapter default when absent, always capped)
    pub max_tokens: Option<u32>,

    pub temperature: Option<f32>,

    pub top_p: Option<f32>,

    /// Request extended thinking where the provider supports it
    pub enable_thinking: bool,

    /// Overrides the adapter's dynamic timeout
    pub timeout: Option<Duration>,

    /// Local-adapter model profile hint (exact model id)
    pub model_profile: Option<String>,

    /// Local-adapter selection preference
    pub prefer: Option<ModelPreference>,
}

/// Local model selection preference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelPreference {
    /// Pick the model with the most parallel slots
    Speed,
    /// Pick the model with the largest context window
    Context,
}

/// Unified response from any adapter
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendResponse {
    /// Completion text
    pub content: String,

    /// Output tokens used (provider-reported or estimated)
    pub tokens: u64,

    /// Which backend served this
    pub backend: String,

    /// Round-trip latency in milliseconds
    pub latency_ms: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ResponseMetadata>,
}

/// Optional attribution details
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ResponseMetadata {
    /// Model that actually answered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,

    /// True when a per-adapter internal fallback served the request
    #[serde(default)]
    pub fallback_used: bool,
}

/// Latest observed health of one backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,

    pub latency_ms: u64,

    pub checked_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Model currently loaded/answering, where the probe reveals it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_model: Option<String>,
}

impl HealthStatus {
    /// A healthy probe result
    pub fn healthy(latency_ms: u64, active_model: Option<String>) -> Self {
        Self {
            healthy: true,
            latency_ms,
            checked_at: Utc::now(),
            error: None,
            active_model,
        }
    }

    /// An unhealthy probe result
    pub fn unhealthy(latency_ms: u64, error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            latency_ms,
            checked_at: Utc::now(),
            error: Some(error.into()),
            active_model: None,
        }
    }
}

/// Rolling per-backend counters
///
/// Average latency is computed over succeeded requests only.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackendStats {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub total_latency_ms: u64,
}

impl BackendStats {
    pub fn average_latency_ms(&self) -> u64 {
        if self.succeeded == 0 {
            0
        } else {
            self.total_latency_ms / self.succeeded
        }
    }
}

/// Shared mutable state every adapter carries: breaker, counters, last probe.
///
/// Callers never touch these directly; adapters funnel every outcome through
/// [`AdapterState::record`].
pub struct AdapterState {
    breaker: CircuitBreaker,
    stats: Mutex<BackendStats>,
    last_health: Mutex<Option<HealthStatus>>,
    protocol_mismatch_streak: Mutex<u32>,
}

impl AdapterState {
    pub fn new(breaker: CircuitBreaker) -> Self {
        Self {
            breaker,
            stats: Mutex::new(BackendStats::default()),
            last_health: Mutex::new(None),
            protocol_mismatch_streak: Mutex::new(0),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Record one execute outcome: counters plus breaker bookkeeping.
    ///
    /// ProtocolMismatch does not trip the breaker on first occurrence; a
    /// repeat (no intervening success or other failure) does.
    pub fn record(&self, result: &Result<BackendResponse, GatewayError>, latency_ms: u64) {
        let mut stats = self.stats.lock().expect("stats lock poisoned");
        stats.total += 1;

        match result {
            Ok(_) => {
                stats.succeeded += 1;
                stats.total_latency_ms += latency_ms;
                drop(stats);
                *self.protocol_mismatch_streak.lock().expect("streak lock poisoned") = 0;
                self.breaker.record_success();
            }
            Err(err) => {
                stats.failed += 1;
                drop(stats);

                let mut streak = self.protocol_mismatch_streak.lock().expect("streak lock poisoned");
                if matches!(err, GatewayError::ProtocolMismatch { .. }) {
                    *streak += 1;
                    if *streak >= 2 {
                        self.breaker.record_failure();
                    }
                } else {
                    *streak = 0;
                    if err.counts_as_breaker_failure() {
                        self.breaker.record_failure();
                    }
                }
            }
        }
    }

    pub fn stats(&self) -> BackendStats {
        self.stats.lock().expect("stats lock poisoned").clone()
    }

    /// Store a probe result; timestamps are monotonic per backend, so an
    /// out-of-order result is dropped.
    pub fn set_health(&self, health: HealthStatus) {
        let mut guard = self.last_health.lock().expect("health lock poisoned");
        if let Some(prev) = guard.as_ref()
            && health.checked_at < prev.checked_at
        {
            return;
        }
        *guard = Some(health);
    }

    pub fn last_health(&self) -> Option<HealthStatus> {
        self.last_health.lock().expect("health lock poisoned").clone()
    }

    pub fn breaker_snapshot(&self) -> BreakerSnapshot {
        self.breaker.snapshot()
    }
}

/// Compute a dynamic timeout from an output-token budget.
///
/// `ms_per_token` is the serialization estimate (local ≈25, cloud ≈40);
/// `multiplier` stretches it for thinking mode. Clamped to [60s, 600s].
pub fn dynamic_timeout(max_tokens: u32, ms_per_token: u64, multiplier: f64) -> Duration {
    let base_ms = (max_tokens as u64).saturating_mul(ms_per_token);
    let ms = (base_ms as f64 * multiplier) as u64;
    Duration::from_millis(ms.clamp(60_000, 600_000))
}
