//! Backend registry
//!
//! Named catalog of adapters with a priority-sorted fallback chain. Adapters
//! materialize when an enabled entry is registered, drop on disable, and
//! re-materialize on enable. Readers of the chain receive a snapshot copy;
//! the chain is rebuilt synchronously on every priority or enabled change.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::types::{BackendResponse, BackendStats, CompletionOptions, HealthStatus};
use super::{BackendAdapter, BreakerSnapshot, create_adapter};
use crate::config::{BackendEntry, BackendKind, BreakerConfig, DiscoveryConfig};
use crate::error::{AttemptRecord, GatewayError};

/// Result of a fallback invocation: the winning response plus the trail of
/// backends tried before it.
#[derive(Debug, Clone)]
pub struct FallbackOutcome {
    pub response: BackendResponse,
    pub attempted: Vec<AttemptRecord>,
    pub winner: String,
}

/// One backend's row in the global health view
#[derive(Debug, Clone)]
pub struct BackendHealthReport {
    pub kind: BackendKind,
    pub enabled: bool,
    pub priority: i32,
    pub breaker: Option<BreakerSnapshot>,
    pub stats: Option<BackendStats>,
    pub last_health: Option<HealthStatus>,
}

struct RegistryEntry {
    entry: BackendEntry,
    adapter: Option<Arc<dyn BackendAdapter>>,
    inserted: u64,
}

struct RegistryInner {
    entries: HashMap<String, RegistryEntry>,
    /// Enabled names by ascending priority, insertion order breaking ties
    chain: Vec<String>,
    next_insert: u64,
}

impl RegistryInner {
    fn rebuild_chain(&mut self) {
        let mut enabled: Vec<(&String, &RegistryEntry)> =
            self.entries.iter().filter(|(_, e)| e.entry.enabled).collect();
        enabled.sort_by_key(|(_, e)| (e.entry.priority, e.inserted));
        self.chain = enabled.into_iter().map(|(name, _)| name.clone()).collect();
    }
}

/// Named catalog of backend adapters
pub struct BackendRegistry {
    breaker: BreakerConfig,
    discovery: DiscoveryConfig,
    inner: RwLock<RegistryInner>,
}

impl BackendRegistry {
    pub fn new(breaker: BreakerConfig, discovery: DiscoveryConfig) -> Self {
        Self {
            breaker,
            discovery,
            inner: RwLock::new(RegistryInner {
                entries: HashMap::new(),
                chain: Vec::new(),
                next_insert: 0,
            }),
        }
    }

    /// Register a backend; enabled entries materialize their adapter now
    pub async fn register(&self, entry: BackendEntry) -> Result<(), GatewayError> {
        let adapter = if entry.enabled {
            Some(create_adapter(&entry, &self.breaker, &self.discovery)?)
        } else {
            None
        };
        self.insert(entry, adapter).await;
        Ok(())
    }

    /// Register with a caller-supplied adapter (custom implementations, tests)
    pub async fn register_adapter(&self, entry: BackendEntry, adapter: Arc<dyn BackendAdapter>) {
        let adapter = entry.enabled.then_some(adapter);
        self.insert(entry, adapter).await;
    }

    async fn insert(&self, entry: BackendEntry, adapter: Option<Arc<dyn BackendAdapter>>) {
        let mut inner = self.inner.write().await;
        let inserted = inner.next_insert;
        inner.next_insert += 1;
        info!(backend = %entry.name, kind = %entry.kind, enabled = entry.enabled, "Backend registered");
        inner.entries.insert(
            entry.name.clone(),
            RegistryEntry {
                entry,
                adapter,
                inserted,
            },
        );
        inner.rebuild_chain();
    }

    /// Remove a backend entirely
    pub async fn unregister(&self, name: &str) -> bool {
        let mut inner = self.inner.write().await;
        let removed = inner.entries.remove(name).is_some();
        if removed {
            info!(backend = %name, "Backend unregistered");
            inner.rebuild_chain();
        }
        removed
    }

    /// Enable or disable; disabling drops the adapter, enabling re-materializes it
    pub async fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), GatewayError> {
        let mut inner = self.inner.write().await;
        let Some(reg) = inner.entries.get_mut(name) else {
            return Err(GatewayError::invalid(format!("unknown backend '{}'", name)));
        };

        reg.entry.enabled = enabled;
        if enabled {
            if reg.adapter.is_none() {
                reg.adapter = Some(create_adapter(&reg.entry, &self.breaker, &self.discovery)?);
            }
        } else {
            reg.adapter = None;
        }
        inner.rebuild_chain();
        Ok(())
    }

    /// Change a backend's priority (lower = preferred)
    pub async fn set_priority(&self, name: &str, priority: i32) -> Result<(), GatewayError> {
        let mut inner = self.inner.write().await;
        let Some(reg) = inner.entries.get_mut(name) else {
            return Err(GatewayError::invalid(format!("unknown backend '{}'", name)));
        };
        reg.entry.priority = priority;
        inner.rebuild_chain();
        Ok(())
    }

    /// Adapter handle for a named backend (enabled entries only)
    pub async fn lookup_adapter(&self, name: &str) -> Option<Arc<dyn BackendAdapter>> {
        self.inner.read().await.entries.get(name).and_then(|e| e.adapter.clone())
    }

    /// Snapshot of the fallback chain
    pub async fn fallback_chain(&self) -> Vec<String> {
        self.inner.read().await.chain.clone()
    }

    /// First chain member not excluded whose breaker would admit a request.
    /// Health is a latest-observed fact; nothing is re-probed here.
    pub async fn next_available(&self, exclude: &HashSet<String>) -> Option<String> {
        let inner = self.inner.read().await;
        for name in &inner.chain {
            if exclude.contains(name) {
                continue;
            }
            if let Some(adapter) = inner.entries.get(name).and_then(|e| e.adapter.as_ref())
                && adapter.state().breaker().would_allow()
            {
                return Some(name.clone());
            }
        }
        None
    }

    /// Names of backends that currently pass the availability check
    pub async fn available_backends(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        inner
            .chain
            .iter()
            .filter(|name| {
                inner
                    .entries
                    .get(*name)
                    .and_then(|e| e.adapter.as_ref())
                    .map(|a| a.availability())
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Latest-observed health for every registered backend
    pub async fn all_health(&self) -> BTreeMap<String, BackendHealthReport> {
        let inner = self.inner.read().await;
        inner
            .entries
            .iter()
            .map(|(name, reg)| {
                let report = BackendHealthReport {
                    kind: reg.entry.kind,
                    enabled: reg.entry.enabled,
                    priority: reg.entry.priority,
                    breaker: reg.adapter.as_ref().map(|a| a.state().breaker_snapshot()),
                    stats: reg.adapter.as_ref().map(|a| a.state().stats()),
                    last_health: reg.adapter.as_ref().and_then(|a| a.state().last_health()),
                };
                (name.clone(), report)
            })
            .collect()
    }

    /// Probe every enabled backend concurrently and return fresh health
    pub async fn probe_all(&self) -> BTreeMap<String, HealthStatus> {
        let adapters: Vec<Arc<dyn BackendAdapter>> = {
            let inner = self.inner.read().await;
            inner.entries.values().filter_map(|e| e.adapter.clone()).collect()
        };

        let probes = adapters.iter().map(|a| async {
            let health = a.health_probe().await;
            (a.name().to_string(), health)
        });
        join_all(probes).await.into_iter().collect()
    }

    /// Export the current catalog as configuration entries
    pub async fn export_config(&self) -> Vec<BackendEntry> {
        let inner = self.inner.read().await;
        let mut entries: Vec<&RegistryEntry> = inner.entries.values().collect();
        entries.sort_by_key(|e| e.inserted);
        entries.iter().map(|e| e.entry.clone()).collect()
    }

    /// Replace the catalog from configuration entries
    pub async fn load_config(&self, entries: Vec<BackendEntry>) -> Result<(), GatewayError> {
        {
            let mut inner = self.inner.write().await;
            inner.entries.clear();
            inner.chain.clear();
        }
        for entry in entries {
            self.register(entry).await?;
        }
        Ok(())
    }

    /// Try `preferred` (when registered) then walk the fallback chain,
    /// skipping names already attempted. Each failure is surfaced into the
    /// attempt list; the first success is annotated with the attempts and
    /// the winner. Exhaustion aggregates into `AllBackendsFailed`.
    pub async fn execute_with_fallback(
        &self,
        prompt: &str,
        preferred: Option<&str>,
        options: &CompletionOptions,
    ) -> Result<FallbackOutcome, GatewayError> {
        let chain = self.fallback_chain().await;

        let mut order: Vec<String> = Vec::with_capacity(chain.len() + 1);
        if let Some(name) = preferred {
            if self.lookup_adapter(name).await.is_some() {
                order.push(name.to_string());
            } else {
                warn!(backend = %name, "Preferred backend not registered, ignoring");
            }
        }
        for name in chain {
            if !order.contains(&name) {
                order.push(name);
            }
        }

        self.execute_in_order(prompt, &order, options).await
    }

    /// Walk an explicit order (deduplicated by the caller); used by the
    /// router once capability scoring has produced a full ordering.
    pub async fn execute_in_order(
        &self,
        prompt: &str,
        order: &[String],
        options: &CompletionOptions,
    ) -> Result<FallbackOutcome, GatewayError> {
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut last_error: Option<GatewayError> = None;

        for name in order {
            let Some(adapter) = self.lookup_adapter(name).await else {
                continue;
            };

            debug!(backend = %name, "Fallback attempt");
            match adapter.execute(prompt, options).await {
                Ok(response) => {
                    return Ok(FallbackOutcome {
                        response,
                        attempted: attempts,
                        winner: name.clone(),
                    });
                }
                Err(err) => {
                    if !err.worth_falling_back() {
                        return Err(err);
                    }
                    warn!(backend = %name, error = %err, "Backend attempt failed");
                    attempts.push(err.attempt_record(name));
                    last_error = Some(err);
                }
            }
        }

        Err(GatewayError::AllBackendsFailed {
            attempts,
            last: Box::new(last_error.unwrap_or_else(|| GatewayError::Misconfigured("no backends registered".to_string()))),
        })
    }
}
