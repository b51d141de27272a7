//! Backend adapters
//!
//! One adapter per configured endpoint, each encapsulating its provider's
//! wire schema, timeout policy, and circuit breaker behind a uniform
//! contract.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

pub mod breaker;
pub mod code;
pub mod fast;
pub mod local;
pub mod premium;
pub mod reasoning;
pub mod registry;
pub mod types;

pub use breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};
pub use registry::{BackendRegistry, FallbackOutcome};
pub use types::{
    AdapterState, BackendResponse, BackendStats, CompletionOptions, HealthStatus, ModelPreference, ResponseMetadata,
    dynamic_timeout,
};

use crate::config::{BackendEntry, BackendKind, BreakerConfig, DiscoveryConfig};
use crate::error::GatewayError;

/// Uniform contract over one LLM endpoint
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Registry name
    fn name(&self) -> &str;

    /// Adapter kind tag
    fn kind(&self) -> BackendKind;

    /// Model that would currently answer (configured, or discovered active)
    fn model_id(&self) -> String;

    /// Base URL of the endpoint (used for orchestrator-port detection)
    fn endpoint(&self) -> String;

    /// Perform one completion round-trip
    async fn execute(&self, prompt: &str, options: &CompletionOptions) -> Result<BackendResponse, GatewayError>;

    /// Issue a minimal-payload probe against the backend's chat surface
    async fn health_probe(&self) -> HealthStatus;

    /// Breaker, rolling counters, and last observed health
    fn state(&self) -> &AdapterState;

    /// True iff an attempt would be admitted by the breaker AND the last
    /// health probe (if any) was healthy. Does not re-probe.
    fn availability(&self) -> bool {
        self.state().breaker().would_allow() && self.state().last_health().map(|h| h.healthy).unwrap_or(true)
    }

    /// Advertised parallel-slot count, where the endpoint exposes one
    /// (the local adapter's model listing). Used to size orchestrator pools.
    async fn discovered_slots(&self) -> Option<u32> {
        None
    }
}

/// Instantiate the adapter for a configured backend entry
pub fn create_adapter(
    entry: &BackendEntry,
    breaker: &BreakerConfig,
    discovery: &DiscoveryConfig,
) -> Result<Arc<dyn BackendAdapter>, GatewayError> {
    debug!(name = %entry.name, kind = %entry.kind, "create_adapter: called");
    let adapter: Arc<dyn BackendAdapter> = match entry.kind {
        BackendKind::Local => Arc::new(local::LocalAdapter::new(entry, breaker, discovery)?),
        BackendKind::Reasoning => Arc::new(reasoning::ReasoningAdapter::new(entry, breaker)?),
        BackendKind::Code => Arc::new(code::CodeAdapter::new(entry, breaker)?),
        BackendKind::Fast => Arc::new(fast::FastAdapter::new(entry, breaker)?),
        BackendKind::Premium => Arc::new(premium::PremiumAdapter::new(entry, breaker)?),
    };
    Ok(adapter)
}

/// Read the credential for an entry from its configured environment variable.
///
/// Absence is not a construction error: the adapter materializes and refuses
/// requests with `Misconfigured` (no upstream is contacted, no breaker tick).
pub(crate) fn read_credential(entry: &BackendEntry) -> Option<String> {
    entry
        .settings
        .api_key_env
        .as_deref()
        .and_then(|var| std::env::var(var).ok())
        .filter(|v| !v.is_empty())
}

/// Build the shared HTTP client; per-request deadlines are attached per call.
pub(crate) fn build_http_client() -> Result<reqwest::Client, GatewayError> {
    reqwest::Client::builder()
        .build()
        .map_err(|e| GatewayError::Misconfigured(format!("HTTP client construction failed: {}", e)))
}
