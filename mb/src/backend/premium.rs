//! Remote premium adapter with a declared free-tier quota
//!
//! Provider-specific schema: `contents`/`parts` request shape with a
//! `generationConfig` block, answers at `candidates[0].content.parts[*].text`.
//! Composes the proactive rate limiter: a limiter denial force-opens the
//! adapter breaker before any upstream request is issued, and actual token
//! usage is reported back after success.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::types::{AdapterState, BackendResponse, CompletionOptions, HealthStatus, ResponseMetadata};
use super::{BackendAdapter, CircuitBreaker, build_http_client, read_credential};
use crate::config::{BackendEntry, BackendKind, BreakerConfig};
use crate::error::GatewayError;
use crate::guard::RateLimiter;

pub struct PremiumAdapter {
    name: String,
    model: String,
    api_key: Option<String>,
    base_url: String,
    http: Client,
    state: AdapterState,
    limiter: Option<RateLimiter>,
    default_max_tokens: u32,
    max_tokens_cap: u32,
    default_timeout: Duration,
}

impl PremiumAdapter {
    pub fn new(entry: &BackendEntry, breaker: &BreakerConfig) -> Result<Self, GatewayError> {
        let limiter = entry
            .settings
            .rate_limit
            .clone()
            .map(|limits| RateLimiter::new(entry.name.clone(), limits));

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
            limiter,
            default_max_tokens: entry.settings.max_tokens,
            max_tokens_cap: entry.settings.max_tokens_cap,
            default_timeout: Duration::from_millis(entry.settings.timeout_ms),
        })
    }

    /// The limiter, for health reporting
    pub fn limiter(&self) -> Option<&RateLimiter> {
        self.limiter.as_ref()
    }

    fn build_body(&self, prompt: &str, options: &CompletionOptions, max_tokens: u32) -> serde_json::Value {
        let mut generation = serde_json::json!({ "maxOutputTokens": max_tokens });
        if let Some(t) = options.temperature {
            generation["temperature"] = serde_json::json!(t);
        }
        if let Some(p) = options.top_p {
            generation["topP"] = serde_json::json!(p);
        }

        serde_json::json!({
            "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
            "generationConfig": generation,
        })
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

        let url = format!("{}/v1beta/models/{}:generateContent", self.base_url, self.model);
        let body = self.build_body(prompt, options, max_tokens);

        let started = Instant::now();
        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", key)
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

        let content = extract_candidate_text(&doc).ok_or_else(|| GatewayError::ProtocolMismatch {
            backend: self.name.clone(),
            message: "missing candidates[0].content.parts".to_string(),
        })?;

        Ok(BackendResponse {
            tokens: doc["usageMetadata"]["candidatesTokenCount"]
                .as_u64()
                .unwrap_or_else(|| (content.len() / 4) as u64),
            content,
            backend: self.name.clone(),
            latency_ms: started.elapsed().as_millis() as u64,
            metadata: Some(ResponseMetadata {
                model: Some(self.model.clone()),
                finish_reason: doc["candidates"][0]["finishReason"].as_str().map(str::to_string),
                fallback_used: false,
            }),
        })
    }
}

#[async_trait]
impl BackendAdapter for PremiumAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Premium
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

        // Proactive guard before the upstream request; a limiter open state
        // is mirrored into the adapter breaker so the fallback chain skips
        // this backend until the window rolls over.
        if let Some(limiter) = &self.limiter {
            let estimated = (prompt.len() / 4) as u64 + max_tokens as u64;
            if let Err(denied) = limiter.check(estimated) {
                self.state.breaker().force_open();
                return Err(denied);
            }
        }

        let timeout = options.timeout.unwrap_or(self.default_timeout);
        let started = Instant::now();
        let result = self.issue(prompt, options, max_tokens, timeout).await;
        self.state.record(&result, started.elapsed().as_millis() as u64);

        if let (Ok(response), Some(limiter)) = (&result, &self.limiter) {
            limiter.record_request(response.tokens);
        }

        result
    }

    async fn health_probe(&self) -> HealthStatus {
        let started = Instant::now();
        let probe = self
            .issue("ping", &CompletionOptions::default(), 4, Duration::from_secs(10))
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

fn extract_candidate_text(doc: &serde_json::Value) -> Option<String> {
    let parts = doc["candidates"][0]["content"]["parts"].as_array()?;
    let text: String = parts.iter().filter_map(|p| p["text"].as_str()).collect::<Vec<_>>().join("");
    if text.is_empty() { None } else { Some(text) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendSettings, RateLimitConfig};

    fn entry(rate_limit: Option<RateLimitConfig>) -> BackendEntry {
        BackendEntry {
            name: "premium".to_string(),
            kind: BackendKind::Premium,
            enabled: true,
            priority: 5,
            settings: BackendSettings {
                model: "gemini-2.0-flash".to_string(),
                api_key_env: Some("MB_TEST_PREMIUM_KEY_UNSET".to_string()),
                base_url: "https://generativelanguage.googleapis.com".to_string(),
                rate_limit,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_generation_config_schema() {
        let adapter = PremiumAdapter::new(&entry(None), &BreakerConfig::default()).unwrap();
        let options = CompletionOptions {
            temperature: Some(0.2),
            top_p: Some(0.9),
            ..Default::default()
        };
        let body = adapter.build_body("hello", &options, 2048);

        assert_eq!(body["contents"][0]["parts"][0]["text"], "hello");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 2048);
        assert_eq!(body["generationConfig"]["topP"], 0.9);
        assert!(body.get("messages").is_none());
    }

    #[test]
    fn test_extract_candidate_text() {
        let doc = serde_json::json!({
            "candidates": [{
                "content": { "parts": [{ "text": "Hello " }, { "text": "world" }] },
                "finishReason": "STOP"
            }]
        });
        assert_eq!(extract_candidate_text(&doc).unwrap(), "Hello world");
        assert!(extract_candidate_text(&serde_json::json!({})).is_none());
    }

    #[tokio::test]
    async fn test_limiter_denial_opens_breaker_before_upstream() {
        // Zero-token quota: the very first check denies
        let limits = RateLimitConfig {
            requests_per_minute: 1,
            requests_per_day: 1,
            tokens_per_minute: 1,
            threshold: 0.1,
        };
        let adapter = PremiumAdapter::new(&entry(Some(limits)), &BreakerConfig::default()).unwrap();

        let err = adapter.execute("hi", &CompletionOptions::default()).await.unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited { .. }));

        // Breaker state mirrors the limiter open
        assert!(!adapter.state().breaker().would_allow());
        // No upstream round-trip was recorded
        assert_eq!(adapter.state().stats().total, 0);
    }
}
