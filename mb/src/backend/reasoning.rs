//! Remote reasoning adapter
//!
//! Carries a primary reasoning model and a pinned secondary. A primary
//! timeout, 5xx, or aborted response is silently retried against the
//! secondary with a shorter deadline; the outer router sees a single unit
//! and the response metadata attributes which model answered.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};

use super::types::{
    AdapterState, BackendResponse, CompletionOptions, HealthStatus, ResponseMetadata, dynamic_timeout,
};
use super::{BackendAdapter, CircuitBreaker, build_http_client, read_credential};
use crate::config::{BackendEntry, BackendKind, BreakerConfig};
use crate::error::GatewayError;

/// Cloud serialization estimate in milliseconds per output token
const MS_PER_TOKEN: u64 = 40;

/// Thinking-mode timeout stretch
const THINKING_MULTIPLIER: f64 = 1.5;

/// Deadline for the secondary-model retry
const FALLBACK_TIMEOUT: Duration = Duration::from_secs(60);

/// Adapter over a remote reasoning provider (OpenAI-compatible chat surface)
pub struct ReasoningAdapter {
    name: String,
    model: String,
    fallback_model: Option<String>,
    api_key: Option<String>,
    base_url: String,
    http: Client,
    state: AdapterState,
    default_max_tokens: u32,
    max_tokens_cap: u32,
}

impl ReasoningAdapter {
    pub fn new(entry: &BackendEntry, breaker: &BreakerConfig) -> Result<Self, GatewayError> {
        Ok(Self {
            name: entry.name.clone(),
            model: entry.settings.model.clone(),
            fallback_model: entry.settings.fallback_model.clone(),
            api_key: read_credential(entry),
            base_url: entry.settings.base_url.trim_end_matches('/').to_string(),
            http: build_http_client()?,
            state: AdapterState::new(CircuitBreaker::new(
                entry.name.clone(),
                breaker.failure_threshold,
                Duration::from_secs(breaker.reset_secs),
            )),
            default_max_tokens: entry.settings.max_tokens,
            max_tokens_cap: entry.settings.max_tokens_cap,
        })
    }

    fn credential(&self) -> Result<&str, GatewayError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| GatewayError::Misconfigured(format!("no credential configured for '{}'", self.name)))
    }

    fn build_body(&self, model: &str, prompt: &str, options: &CompletionOptions, max_tokens: u32) -> serde_json::Value {
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
        if options.enable_thinking {
            body["chat_template_kwargs"] = serde_json::json!({ "thinking": true });
        }
        body
    }

    async fn issue(
        &self,
        model: &str,
        prompt: &str,
        options: &CompletionOptions,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<BackendResponse, GatewayError> {
        let key = self.credential()?;
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = self.build_body(model, prompt, options, max_tokens);

        let started = Instant::now();
        let response = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", key))
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

        let message = &doc["choices"][0]["message"];
        let content = message["content"]
            .as_str()
            .filter(|s| !s.is_empty())
            .or_else(|| message["reasoning_content"].as_str())
            .ok_or_else(|| GatewayError::ProtocolMismatch {
                backend: self.name.clone(),
                message: "missing choices[0].message content".to_string(),
            })?
            .to_string();

        let tokens = doc["usage"]["completion_tokens"]
            .as_u64()
            .unwrap_or_else(|| (content.len() / 4) as u64);

        Ok(BackendResponse {
            content,
            tokens,
            backend: self.name.clone(),
            latency_ms: started.elapsed().as_millis() as u64,
            metadata: Some(ResponseMetadata {
                model: Some(model.to_string()),
                finish_reason: doc["choices"][0]["finish_reason"].as_str().map(str::to_string),
                fallback_used: false,
            }),
        })
    }

    /// Whether a primary failure is worth re-issuing against the secondary
    fn secondary_eligible(err: &GatewayError) -> bool {
        matches!(
            err,
            GatewayError::UpstreamTimeout { .. }
                | GatewayError::Transport { .. }
                | GatewayError::UpstreamError { status: 500..=599, .. }
        )
    }
}

#[async_trait]
impl BackendAdapter for ReasoningAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Reasoning
    }

    fn model_id(&self) -> String {
        self.model.clone()
    }

    fn endpoint(&self) -> String {
        self.base_url.clone()
    }

    async fn execute(&self, prompt: &str, options: &CompletionOptions) -> Result<BackendResponse, GatewayError> {
        self.state.breaker().check()?;

        let max_tokens = options.max_tokens.unwrap_or(self.default_max_tokens).min(self.max_tokens_cap);
        let multiplier = if options.enable_thinking { THINKING_MULTIPLIER } else { 1.0 };
        let timeout = options
            .timeout
            .unwrap_or_else(|| dynamic_timeout(max_tokens, MS_PER_TOKEN, multiplier));

        let started = Instant::now();
        let mut result = self.issue(&self.model, prompt, options, max_tokens, timeout).await;

        if let Err(err) = &result
            && Self::secondary_eligible(err)
            && let Some(secondary) = &self.fallback_model
        {
            warn!(
                backend = %self.name,
                primary = %self.model,
                secondary = %secondary,
                error = %err,
                "Primary model failed, re-issuing against secondary"
            );
            result = self
                .issue(secondary, prompt, options, max_tokens, FALLBACK_TIMEOUT)
                .await
                .map(|mut r| {
                    if let Some(meta) = r.metadata.as_mut() {
                        meta.fallback_used = true;
                    }
                    r
                });
        }

        self.state.record(&result, started.elapsed().as_millis() as u64);
        result
    }

    async fn health_probe(&self) -> HealthStatus {
        let started = Instant::now();
        let probe = self
            .issue(&self.model, "ping", &CompletionOptions::default(), 4, Duration::from_secs(10))
            .await;

        let latency = started.elapsed().as_millis() as u64;
        let health = match probe {
            Ok(_) => HealthStatus::healthy(latency, Some(self.model.clone())),
            Err(e) => {
                debug!(backend = %self.name, error = %e, "Health probe failed");
                HealthStatus::unhealthy(latency, e.to_string())
            }
        };
        self.state.set_health(health.clone());
        health
    }

    fn state(&self) -> &AdapterState {
        &self.state
    }
}
