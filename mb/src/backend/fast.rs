//! Remote low-latency adapter
//!
//! OpenAI-style chat schema, but this provider takes `max_completion_tokens`
//! and rejects the legacy field. Tight default timeout and output cap.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::types::{AdapterState, BackendResponse, CompletionOptions, HealthStatus, ResponseMetadata};
use super::{BackendAdapter, CircuitBreaker, build_http_client, read_credential};
use crate::config::{BackendEntry, BackendKind, BreakerConfig};
use crate::error::GatewayError;

pub struct FastAdapter {
    name: String,
    model: String,
    api_key: Option<String>,
    base_url: String,
    http: Client,
    state: AdapterState,
    default_max_tokens: u32,
    max_tokens_cap: u32,
    default_timeout: Duration,
}

impl FastAdapter {
    pub fn new(entry: &BackendEntry, breaker: &BreakerConfig) -> Result<Self, GatewayError> {
        Ok(Self {
            name: entry.name.clone(),
            model: entry.settings.model.clone(),
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
            default_timeout: Duration::from_millis(entry.settings.timeout_ms),
        })
    }

    fn build_body(&self, prompt: &str, options: &CompletionOptions, max_tokens: u32) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "max_completion_tokens": max_tokens,
        });
        if let Some(t) = options.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(p) = options.top_p {
            body["top_p"] = serde_json::json!(p);
        }
        body
    }

    async fn issue(
        &self,
        prompt: &str,
        options: &CompletionOptions,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<BackendResponse, GatewayError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| GatewayError::Misconfigured(format!("no credential configured for '{}'", self.name)))?;

        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = self.build_body(prompt, options, max_tokens);

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

        let content = doc["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| GatewayError::ProtocolMismatch {
                backend: self.name.clone(),
                message: "missing choices[0].message.content".to_string(),
            })?
            .to_string();

        Ok(BackendResponse {
            tokens: doc["usage"]["completion_tokens"]
                .as_u64()
                .unwrap_or_else(|| (content.len() / 4) as u64),
            content,
            backend: self.name.clone(),
            latency_ms: started.elapsed().as_millis() as u64,
            metadata: Some(ResponseMetadata {
                model: Some(self.model.clone()),
                finish_reason: doc["choices"][0]["finish_reason"].as_str().map(str::to_string),
                fallback_used: false,
            }),
        })
    }
}

#[async_trait]
impl BackendAdapter for FastAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Fast
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
        let timeout = options.timeout.unwrap_or(self.default_timeout);

        let started = Instant::now();
        let result = self.issue(prompt, options, max_tokens, timeout).await;
        self.state.record(&result, started.elapsed().as_millis() as u64);
        result
    }

    async fn health_probe(&self) -> HealthStatus {
        let started = Instant::now();
        let probe = self
            .issue("ping", &CompletionOptions::default(), 4, Duration::from_secs(5))
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
