//! Local OpenAI-compatible adapter with endpoint autodiscovery
//!
//! Probes a priority-ordered set of candidate hosts and ports for a running
//! OpenAI-compatible server, caches the winner, and picks among the loaded
//! models per request.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::types::{
    AdapterState, BackendResponse, CompletionOptions, HealthStatus, ModelPreference, ResponseMetadata, dynamic_timeout,
};
use super::{BackendAdapter, CircuitBreaker, build_http_client};
use crate::config::{BackendEntry, BackendKind, BreakerConfig, DiscoveryConfig};
use crate::error::GatewayError;

/// Local serialization estimate in milliseconds per output token
const MS_PER_TOKEN: u64 = 25;

/// Content length beyond which the largest-context model is preferred
const LARGE_CONTENT_CHARS: usize = 20_000;

/// Per-candidate probe timeout during discovery
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// One model advertised by the local server
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub id: String,
    pub context_window: Option<u64>,
    pub slots: Option<u32>,
    pub loaded: bool,
}

#[derive(Debug, Clone)]
struct CachedEndpoint {
    base_url: String,
    models: Vec<ModelInfo>,
    discovered_at: Instant,
}

/// Adapter over a locally running OpenAI-compatible server
pub struct LocalAdapter {
    name: String,
    http: Client,
    discovery: DiscoveryConfig,
    state: AdapterState,
    cache: Mutex<Option<CachedEndpoint>>,
    default_max_tokens: u32,
    max_tokens_cap: u32,
}

impl LocalAdapter {
    pub fn new(entry: &BackendEntry, breaker: &BreakerConfig, discovery: &DiscoveryConfig) -> Result<Self, GatewayError> {
        Ok(Self {
            name: entry.name.clone(),
            http: build_http_client()?,
            discovery: discovery.clone(),
            state: AdapterState::new(CircuitBreaker::new(
                entry.name.clone(),
                breaker.failure_threshold,
                Duration::from_secs(breaker.reset_secs),
            )),
            cache: Mutex::new(None),
            default_max_tokens: entry.settings.max_tokens,
            max_tokens_cap: entry.settings.max_tokens_cap,
        })
    }

    /// Candidate base URLs in fixed strategy order:
    /// loopback, gateway hosts, virtualization hosts, user interfaces,
    /// container-host hostnames - each crossed with the configured ports.
    fn candidates(&self) -> Vec<String> {
        if let Some(url) = &self.discovery.endpoint_override {
            return vec![url.trim_end_matches('/').to_string()];
        }

        let mut hosts: Vec<String> = vec!["127.0.0.1".to_string(), "localhost".to_string()];
        hosts.extend(self.discovery.gateway_hosts.iter().cloned());
        hosts.extend(self.discovery.virtualization_hosts.iter().cloned());
        hosts.extend(self.discovery.interfaces.iter().cloned());
        hosts.extend(self.discovery.container_hosts.iter().cloned());

        let mut urls = Vec::with_capacity(hosts.len() * self.discovery.ports.len());
        for host in hosts {
            for port in &self.discovery.ports {
                urls.push(format!("http://{}:{}", host, port));
            }
        }
        urls
    }

    /// Probe one candidate's model listing; `Some` only for a non-empty set
    async fn probe_candidate(&self, base_url: &str) -> Option<Vec<ModelInfo>> {
        let url = format!("{}/v1/models", base_url);
        let response = self.http.get(&url).timeout(PROBE_TIMEOUT).send().await.ok()?;
        if !response.status().is_success() {
            return None;
        }
        let doc: serde_json::Value = response.json().await.ok()?;
        let models = parse_model_listing(&doc);
        if models.is_empty() { None } else { Some(models) }
    }

    /// Return the cached endpoint or run discovery
    async fn ensure_endpoint(&self) -> Result<CachedEndpoint, GatewayError> {
        let ttl = Duration::from_secs(self.discovery.cache_ttl_secs);

        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref()
            && cached.discovered_at.elapsed() < ttl
        {
            return Ok(cached.clone());
        }

        for candidate in self.candidates() {
            debug!(backend = %self.name, %candidate, "Probing local endpoint candidate");
            if let Some(models) = self.probe_candidate(&candidate).await {
                info!(
                    backend = %self.name,
                    endpoint = %candidate,
                    models = models.len(),
                    "Local endpoint discovered"
                );
                let found = CachedEndpoint {
                    base_url: candidate,
                    models,
                    discovered_at: Instant::now(),
                };
                *cache = Some(found.clone());
                return Ok(found);
            }
        }

        *cache = None;
        Err(GatewayError::Transport {
            backend: self.name.clone(),
            message: "no local endpoint discovered".to_string(),
        })
    }

    async fn invalidate(&self) {
        *self.cache.lock().await = None;
    }

    /// Pick the model for this request per the selection policy
    fn select_model(&self, models: &[ModelInfo], options: &CompletionOptions, content_len: usize) -> Option<ModelInfo> {
        let loaded: Vec<&ModelInfo> = models.iter().filter(|m| m.loaded).collect();
        let pool: &[&ModelInfo] = if loaded.is_empty() {
            // Nothing reports loaded state; treat the full listing as loaded
            return self.select_from(&models.iter().collect::<Vec<_>>(), options, content_len);
        } else {
            &loaded
        };
        self.select_from(pool, options, content_len)
    }

    fn select_from(&self, pool: &[&ModelInfo], options: &CompletionOptions, content_len: usize) -> Option<ModelInfo> {
        if pool.is_empty() {
            return None;
        }

        if let Some(profile) = &options.model_profile {
            if let Some(m) = pool.iter().find(|m| &m.id == profile) {
                return Some((*m).clone());
            }
            // Requested model not loaded: substitute the first loaded one
            warn!(backend = %self.name, requested = %profile, "Requested model not loaded, substituting");
            return Some(pool[0].clone());
        }

        if content_len > LARGE_CONTENT_CHARS || options.prefer == Some(ModelPreference::Context) {
            return pool
                .iter()
                .max_by_key(|m| m.context_window.unwrap_or(0))
                .map(|m| (*m).clone());
        }

        if options.prefer == Some(ModelPreference::Speed) {
            return pool.iter().max_by_key(|m| m.slots.unwrap_or(0)).map(|m| (*m).clone());
        }

        Some(pool[0].clone())
    }

    /// One chat round-trip against the discovered endpoint
    async fn chat(
        &self,
        base_url: &str,
        model: &str,
        prompt: &str,
        options: &CompletionOptions,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<BackendResponse, GatewayError> {
        let url = format!("{}/v1/chat/completions", base_url);

        let mut body = serde_json::json!({
            "model": model,
            "messages": [{ "role": "user", "content": prompt }],
            "max_tokens": max_tokens,
        });
        if let Some(t) = options.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(p) = options.top_p {
            body["top_p"] = serde_json::json!(p);
        }

        let started = Instant::now();
        let response = self
            .http
            .post(&url)
            .header("content-type", "application/json")
            .json(&body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| GatewayError::from_reqwest(&self.name, timeout, e))?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GatewayError::from_status(&self.name, status, text));
        }

        let doc: serde_json::Value = response.json().await.map_err(|e| GatewayError::ProtocolMismatch {
            backend: self.name.clone(),
            message: e.to_string(),
        })?;

        let content = doc["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| GatewayError::ProtocolMismatch {
                backend: self.name.clone(),
                message: "missing choices[0].message.content".to_string(),
            })?
            .to_string();

        let tokens = doc["usage"]["completion_tokens"]
            .as_u64()
            .unwrap_or_else(|| (content.len() / 4) as u64);
        let finish_reason = doc["choices"][0]["finish_reason"].as_str().map(str::to_string);

        Ok(BackendResponse {
            content,
            tokens,
            backend: self.name.clone(),
            latency_ms: started.elapsed().as_millis() as u64,
            metadata: Some(ResponseMetadata {
                model: Some(model.to_string()),
                finish_reason,
                fallback_used: false,
            }),
        })
    }

}

#[async_trait]
impl BackendAdapter for LocalAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn model_id(&self) -> String {
        // Last discovered active model, when the cache is warm
        self.cache
            .try_lock()
            .ok()
            .and_then(|c| {
                c.as_ref()
                    .and_then(|e| e.models.iter().find(|m| m.loaded).or(e.models.first()).map(|m| m.id.clone()))
            })
            .unwrap_or_default()
    }

    fn endpoint(&self) -> String {
        self.cache
            .try_lock()
            .ok()
            .and_then(|c| c.as_ref().map(|e| e.base_url.clone()))
            .unwrap_or_default()
    }

    async fn execute(&self, prompt: &str, options: &CompletionOptions) -> Result<BackendResponse, GatewayError> {
        self.state.breaker().check()?;

        let max_tokens = options.max_tokens.unwrap_or(self.default_max_tokens).min(self.max_tokens_cap);
        let timeout = options.timeout.unwrap_or_else(|| dynamic_timeout(max_tokens, MS_PER_TOKEN, 1.0));

        let started = Instant::now();
        let mut retried = false;

        let result = loop {
            let endpoint = match self.ensure_endpoint().await {
                Ok(e) => e,
                Err(e) => break Err(e),
            };

            let model = match self.select_model(&endpoint.models, options, prompt.len()) {
                Some(m) => m,
                None => {
                    break Err(GatewayError::Misconfigured(format!(
                        "endpoint {} lists no usable model",
                        endpoint.base_url
                    )));
                }
            };

            match self.chat(&endpoint.base_url, &model.id, prompt, options, max_tokens, timeout).await {
                Ok(response) => break Ok(response),
                Err(e) if !retried && e.counts_as_breaker_failure() => {
                    // The cached endpoint may have moved; rediscover once
                    debug!(backend = %self.name, error = %e, "Request failed, rediscovering endpoint");
                    retried = true;
                    self.invalidate().await;
                }
                Err(e) => break Err(e),
            }
        };

        self.state.record(&result, started.elapsed().as_millis() as u64);
        result
    }

    async fn health_probe(&self) -> HealthStatus {
        let started = Instant::now();

        let health = match self.ensure_endpoint().await {
            Ok(endpoint) => {
                let probe = self
                    .chat(
                        &endpoint.base_url,
                        &endpoint
                            .models
                            .iter()
                            .find(|m| m.loaded)
                            .or(endpoint.models.first())
                            .map(|m| m.id.clone())
                            .unwrap_or_default(),
                        "ping",
                        &CompletionOptions::default(),
                        4,
                        Duration::from_secs(5),
                    )
                    .await;

                let latency = started.elapsed().as_millis() as u64;
                match probe {
                    Ok(r) => HealthStatus::healthy(latency, r.metadata.and_then(|m| m.model)),
                    Err(e) => HealthStatus::unhealthy(latency, e.to_string()),
                }
            }
            Err(e) => HealthStatus::unhealthy(started.elapsed().as_millis() as u64, e.to_string()),
        };

        self.state.set_health(health.clone());
        health
    }

    fn state(&self) -> &AdapterState {
        &self.state
    }

    /// Advertised parallel-slot count of the most capable loaded model
    async fn discovered_slots(&self) -> Option<u32> {
        let endpoint = self.ensure_endpoint().await.ok()?;
        endpoint.models.iter().filter(|m| m.loaded).filter_map(|m| m.slots).max()
    }
}

/// Parse a `/v1/models`-style listing, tolerating LM Studio extensions
fn parse_model_listing(doc: &serde_json::Value) -> Vec<ModelInfo> {
    let items = doc["data"].as_array().or_else(|| doc["models"].as_array());
    let Some(items) = items else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| {
            let id = item["id"].as_str()?.to_string();
            let context_window = item["max_context_length"]
                .as_u64()
                .or_else(|| item["context_length"].as_u64())
                .or_else(|| item["loaded_context_length"].as_u64());
            let slots = item["slots"]
                .as_u64()
                .or_else(|| item["parallel_slots"].as_u64())
                .map(|s| s as u32);
            // Listings without load state are treated as fully loaded
            let loaded = item["state"].as_str().map(|s| s == "loaded").unwrap_or(true);
            Some(ModelInfo {
                id,
                context_window,
                slots,
                loaded,
            })
        })
        .collect()
}
