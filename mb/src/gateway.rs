//! Gateway process context
//!
//! One explicitly-constructed object wiring registry, pool, router, roles,
//! subagent executor, orchestrator, and guards together. No process-wide
//! mutable singletons: everything hangs off this context.

use std::sync::Arc;

use serde_json::json;
use tracing::info;

use crate::backend::BackendRegistry;
use crate::config::Config;
use crate::error::GatewayError;
use crate::fileops::FileOps;
use crate::guard::{FuzzyGuard, RequestPool};
use crate::orchestrator::ParallelOrchestrator;
use crate::roles::RoleRegistry;
use crate::router::Router;
use crate::subagent::SubagentExecutor;

/// The assembled gateway
pub struct Gateway {
    pub config: Config,
    pub registry: Arc<BackendRegistry>,
    pub pool: Arc<RequestPool>,
    pub router: Arc<Router>,
    pub roles: Arc<RoleRegistry>,
    pub subagent: Arc<SubagentExecutor>,
    pub orchestrator: ParallelOrchestrator,
    pub fuzzy: FuzzyGuard,
    pub editor: Option<Arc<dyn FileOps>>,
}

impl Gateway {
    /// Construct with no editor collaborator attached (file-op tools refuse)
    pub async fn new(config: Config) -> Result<Self, GatewayError> {
        Self::with_editor(config, None).await
    }

    /// Construct and register every enabled configured backend
    pub async fn with_editor(config: Config, editor: Option<Arc<dyn FileOps>>) -> Result<Self, GatewayError> {
        let registry = Arc::new(BackendRegistry::new(config.breaker.clone(), config.discovery.clone()));
        for entry in &config.backends {
            registry.register(entry.clone()).await?;
        }

        let pool = Arc::new(RequestPool::new(config.pool.max_concurrent));
        let router = Arc::new(Router::new(registry.clone(), pool.clone(), config.matcher.clone()));
        let roles = Arc::new(RoleRegistry::builtin());
        let subagent = Arc::new(SubagentExecutor::new(
            roles.clone(),
            router.clone(),
            config.matcher.clone(),
            editor.clone(),
        ));
        let orchestrator = ParallelOrchestrator::new(subagent.clone(), config.orchestrator.clone());
        let fuzzy = FuzzyGuard::new(config.fuzzy.clone());

        info!(
            backends = config.backends.len(),
            pool = config.pool.max_concurrent,
            "Gateway assembled"
        );

        Ok(Self {
            config,
            registry,
            pool,
            router,
            roles,
            subagent,
            orchestrator,
            fuzzy,
            editor,
        })
    }

    /// Global health view: per-backend breaker/stats/last-probe plus pool
    /// and executor metrics. Latest-observed facts only; nothing re-probes.
    pub async fn health_report(&self) -> serde_json::Value {
        let mut backends = serde_json::Map::new();
        for (name, report) in self.registry.all_health().await {
            backends.insert(
                name,
                json!({
                    "kind": report.kind.to_string(),
                    "enabled": report.enabled,
                    "priority": report.priority,
                    "breaker": report.breaker.as_ref().map(|b| json!({
                        "state": b.state.to_string(),
                        "consecutive_failures": b.consecutive_failures,
                        "open_for_secs": b.open_for.map(|d| d.as_secs()),
                    })),
                    "stats": report.stats.as_ref().map(|s| json!({
                        "total": s.total,
                        "succeeded": s.succeeded,
                        "failed": s.failed,
                        "avg_latency_ms": s.average_latency_ms(),
                    })),
                    "last_health": report.last_health,
                }),
            );
        }

        json!({
            "backends": backends,
            "fallback_chain": self.registry.fallback_chain().await,
            "pool": self.pool.metrics().await,
            "subagent": self.subagent.metrics(),
            "fuzzy_guard": self.fuzzy.metrics(),
            "dashboard": self.config.dashboard,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendEntry, BackendKind, BackendSettings};

    fn offline_config() -> Config {
        // Remote-only entries construct adapters without touching the network
        Config {
            backends: vec![
                BackendEntry {
                    name: "fast".to_string(),
                    kind: BackendKind::Fast,
                    enabled: true,
                    priority: 1,
                    settings: BackendSettings {
                        model: "llama-3.3-70b-versatile".to_string(),
                        base_url: "http://test.invalid".to_string(),
                        ..Default::default()
                    },
                },
                BackendEntry {
                    name: "disabled".to_string(),
                    kind: BackendKind::Code,
                    enabled: false,
                    priority: 2,
                    settings: BackendSettings::default(),
                },
            ],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_gateway_registers_enabled_backends() {
        let gateway = Gateway::new(offline_config()).await.unwrap();

        assert!(gateway.registry.lookup_adapter("fast").await.is_some());
        assert!(gateway.registry.lookup_adapter("disabled").await.is_none());
        assert_eq!(gateway.registry.fallback_chain().await, vec!["fast"]);
    }

    #[tokio::test]
    async fn test_health_report_shape() {
        let gateway = Gateway::new(offline_config()).await.unwrap();
        let report = gateway.health_report().await;

        assert!(report["backends"]["fast"]["breaker"]["state"].as_str().is_some());
        assert_eq!(report["backends"]["disabled"]["enabled"], false);
        assert!(report["pool"]["total"].as_u64().is_some());
        assert_eq!(report["dashboard"], false);
    }
}
