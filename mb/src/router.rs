//! Router / fallback executor
//!
//! Glues the registry's fallback execution to capability scoring. Attempt
//! order: explicit preferred, capability-scored winner, the role's own
//! fallback order, then the registry's priority chain - deduplicated, so the
//! same backend is never retried within one invocation.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::backend::{BackendRegistry, CompletionOptions, FallbackOutcome};
use crate::capability::{Capability, ContextRoutingRules, ContextSize, find_best_backend, infer_capabilities, is_orchestrator};
use crate::config::MatcherConfig;
use crate::error::GatewayError;
use crate::guard::{PoolPriority, RequestPool};

/// One routed request
#[derive(Debug, Clone, Default)]
pub struct RouteRequest {
    pub prompt: String,
    pub options: CompletionOptions,

    /// Explicit backend to try first, when available
    pub preferred: Option<String>,

    /// Capabilities the serving backend should have
    pub required_capabilities: Vec<Capability>,

    /// Role-supplied fallback order
    pub fallback_order: Vec<String>,

    pub context_size: Option<ContextSize>,
    pub routing_rules: Option<ContextRoutingRules>,

    pub priority: PoolPriority,

    /// Worker tasks must never land on an orchestrator model
    pub exclude_orchestrators: bool,
}

/// Capability-aware fallback router
pub struct Router {
    registry: Arc<BackendRegistry>,
    pool: Arc<RequestPool>,
    matcher: MatcherConfig,
}

impl Router {
    pub fn new(registry: Arc<BackendRegistry>, pool: Arc<RequestPool>, matcher: MatcherConfig) -> Self {
        Self {
            registry,
            pool,
            matcher,
        }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<RequestPool> {
        &self.pool
    }

    /// Route a request to the best backend, falling back down the assembled
    /// order on failure. The whole invocation holds one pool slot; attempts
    /// within it are strictly sequential.
    pub async fn route(&self, request: RouteRequest) -> Result<FallbackOutcome, GatewayError> {
        let order = self.assemble_order(&request).await?;
        debug!(?order, "Route order assembled");

        let registry = self.registry.clone();
        let prompt = request.prompt.clone();
        let options = request.options.clone();
        self.pool
            .submit(request.priority, async move {
                registry.execute_in_order(&prompt, &order, &options).await
            })
            .await
    }

    /// Names currently available for worker routing (orchestrators filtered
    /// when the request demands it).
    pub async fn worker_backends(&self, exclude_orchestrators: bool) -> Vec<String> {
        let available = self.registry.available_backends().await;
        if !exclude_orchestrators {
            return available;
        }

        let mut workers = Vec::with_capacity(available.len());
        for name in available {
            if let Some(adapter) = self.registry.lookup_adapter(&name).await {
                if is_orchestrator(&adapter.model_id(), &adapter.endpoint(), &self.matcher) {
                    debug!(backend = %name, "Excluding orchestrator backend from worker routing");
                    continue;
                }
                workers.push(name);
            }
        }
        workers
    }

    async fn assemble_order(&self, request: &RouteRequest) -> Result<Vec<String>, GatewayError> {
        let available = self.worker_backends(request.exclude_orchestrators).await;
        let mut order: Vec<String> = Vec::new();

        // 1. Explicit preferred, when it is actually available
        if let Some(preferred) = &request.preferred {
            if available.iter().any(|a| a == preferred) {
                order.push(preferred.clone());
            } else {
                warn!(backend = %preferred, "Preferred backend unavailable, falling through");
            }
        }

        // 2. Capability-scored winner
        let caps_by_name = self.capability_map(&available).await;
        let winner = find_best_backend(
            &request.required_capabilities,
            &available,
            &request.fallback_order,
            request.context_size.unwrap_or(ContextSize::Small),
            request.routing_rules.as_ref(),
            &|name| caps_by_name.get(name).cloned().unwrap_or_else(|| vec![Capability::General]),
        );
        if let Ok(winner) = winner {
            debug!(backend = %winner.backend, score = winner.score, reason = %winner.reason, "Capability winner");
            if !order.contains(&winner.backend) {
                order.push(winner.backend);
            }
        }

        // 3. The role's fallback order
        for name in &request.fallback_order {
            if available.iter().any(|a| a == name) && !order.contains(name) {
                order.push(name.clone());
            }
        }

        // 4. The registry's priority chain
        for name in self.registry.fallback_chain().await {
            if available.iter().any(|a| a == &name) && !order.contains(&name) {
                order.push(name);
            }
        }

        if order.is_empty() {
            return Err(GatewayError::invalid("no available backend for this request"));
        }
        Ok(order)
    }

    async fn capability_map(&self, names: &[String]) -> HashMap<String, Vec<Capability>> {
        let mut map = HashMap::with_capacity(names.len());
        for name in names {
            if let Some(adapter) = self.registry.lookup_adapter(name).await {
                map.insert(name.clone(), infer_capabilities(&adapter.model_id()));
            }
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::registry::tests::{ScriptedAdapter, entry};
    use crate::config::{BreakerConfig, DiscoveryConfig};

    async fn router_with(
        adapters: Vec<(&str, i32, Arc<ScriptedAdapter>)>,
    ) -> Router {
        let registry = Arc::new(BackendRegistry::new(BreakerConfig::default(), DiscoveryConfig::default()));
        for (name, priority, adapter) in adapters {
            registry.register_adapter(entry(name, priority), adapter).await;
        }
        Router::new(registry, Arc::new(RequestPool::new(4)), MatcherConfig::default())
    }

    #[tokio::test]
    async fn test_preferred_wins_when_available() {
        let router = router_with(vec![
            ("a", 1, Arc::new(ScriptedAdapter::new("a", 0))),
            ("b", 2, Arc::new(ScriptedAdapter::new("b", 0))),
        ])
        .await;

        let outcome = router
            .route(RouteRequest {
                prompt: "hi".to_string(),
                preferred: Some("b".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(outcome.winner, "b");
    }

    #[tokio::test]
    async fn test_capability_winner_selected() {
        let router = router_with(vec![
            ("plain", 1, Arc::new(ScriptedAdapter::new("plain", 0))),
            (
                "coder",
                2,
                Arc::new(ScriptedAdapter::with_model("coder", "deepseek-coder-v2", 0)),
            ),
        ])
        .await;

        let outcome = router
            .route(RouteRequest {
                prompt: "hi".to_string(),
                required_capabilities: vec![Capability::CodeSpecialized],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(outcome.winner, "coder");
    }

    #[tokio::test]
    async fn test_orchestrator_excluded_for_worker_tasks() {
        let router = router_with(vec![
            (
                "router-box",
                1,
                Arc::new(ScriptedAdapter::with_model("router-box", "qwen-orchestrator", 0)),
            ),
            ("worker", 2, Arc::new(ScriptedAdapter::new("worker", 0))),
        ])
        .await;

        let outcome = router
            .route(RouteRequest {
                prompt: "hi".to_string(),
                exclude_orchestrators: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(outcome.winner, "worker");

        let workers = router.worker_backends(true).await;
        assert_eq!(workers, vec!["worker"]);
    }

    #[tokio::test]
    async fn test_fallback_continues_down_assembled_order() {
        let failing = Arc::new(ScriptedAdapter::new("first", usize::MAX));
        let router = router_with(vec![
            ("first", 1, failing),
            ("second", 2, Arc::new(ScriptedAdapter::new("second", 0))),
        ])
        .await;

        let outcome = router
            .route(RouteRequest {
                prompt: "hi".to_string(),
                preferred: Some("first".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(outcome.winner, "second");
        assert_eq!(outcome.attempted.len(), 1);
        assert_eq!(outcome.attempted[0].backend, "first");
    }

    #[tokio::test]
    async fn test_no_backends_is_invalid_input() {
        let router = router_with(vec![]).await;
        let err = router
            .route(RouteRequest {
                prompt: "hi".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidInput { .. }));
    }
}
