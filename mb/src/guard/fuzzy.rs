//! Fuzzy-edit complexity guard
//!
//! Pre-checks fuzzy find/replace payloads before any expensive matching work
//! runs, bounding attacker-controllable input size. The matching itself lives
//! in the external editor collaborator; this module only validates, clamps,
//! and enforces the deadline.

use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::FuzzyConfig;
use crate::error::GatewayError;

/// Default fuzzy-match threshold and its clamp band
pub const DEFAULT_THRESHOLD: f64 = 0.8;
/// Default suggestion count and its clamp band
pub const DEFAULT_MAX_SUGGESTIONS: usize = 3;

/// Outcome of a complexity validation
#[derive(Debug, Clone, serde::Serialize)]
pub struct EditValidation {
    pub valid: bool,
    pub errors: Vec<String>,
    pub total_chars: usize,
    pub edit_count: usize,
}

/// Counters emitted on every guard hit
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct GuardMetrics {
    pub validated: u64,
    pub rejected: u64,
    pub oversize_single: u64,
    pub oversize_lines: u64,
    pub oversize_total: u64,
    pub malformed: u64,
    pub timeouts: u64,
}

/// Input-size validator for fuzzy edits
pub struct FuzzyGuard {
    config: FuzzyConfig,
    metrics: Mutex<GuardMetrics>,
}

impl FuzzyGuard {
    pub fn new(config: FuzzyConfig) -> Self {
        Self {
            config,
            metrics: Mutex::new(GuardMetrics::default()),
        }
    }

    /// Validate an edits payload against the complexity limits.
    ///
    /// All failures are collected (not first-only), so adding edits can only
    /// add errors - never remove one.
    pub fn validate(&self, edits: &Value) -> EditValidation {
        let mut errors = Vec::new();
        let mut total_chars = 0usize;

        let items = match edits.as_array() {
            Some(items) => items,
            None => {
                self.bump(|m| m.malformed += 1);
                return self.rejected(vec!["edits must be an array".to_string()], 0, 0);
            }
        };

        if items.is_empty() {
            self.bump(|m| m.malformed += 1);
            return self.rejected(vec!["edits array is empty".to_string()], 0, 0);
        }

        for (idx, item) in items.iter().enumerate() {
            let Some(obj) = item.as_object() else {
                errors.push(format!("edit {} is not an object", idx));
                self.bump(|m| m.malformed += 1);
                continue;
            };

            let find = obj.get("find").and_then(Value::as_str);
            let replace = obj.get("replace").and_then(Value::as_str);

            let (Some(find), Some(replace)) = (find, replace) else {
                errors.push(format!("edit {} is missing string 'find'/'replace'", idx));
                self.bump(|m| m.malformed += 1);
                continue;
            };

            total_chars += find.len() + replace.len();

            if find.len() > self.config.max_single {
                errors.push(format!(
                    "edit {}: 'find' exceeds {} chars ({})",
                    idx,
                    self.config.max_single,
                    find.len()
                ));
                self.bump(|m| m.oversize_single += 1);
            }
            if replace.len() > self.config.max_single {
                errors.push(format!(
                    "edit {}: 'replace' exceeds {} chars ({})",
                    idx,
                    self.config.max_single,
                    replace.len()
                ));
                self.bump(|m| m.oversize_single += 1);
            }

            let newlines = find.matches('\n').count();
            if newlines > self.config.max_lines {
                errors.push(format!(
                    "edit {}: 'find' spans more than {} lines ({})",
                    idx, self.config.max_lines, newlines
                ));
                self.bump(|m| m.oversize_lines += 1);
            }
        }

        if total_chars > self.config.max_total {
            errors.push(format!(
                "total edit size exceeds {} chars ({})",
                self.config.max_total, total_chars
            ));
            self.bump(|m| m.oversize_total += 1);
        }

        self.bump(|m| m.validated += 1);
        if errors.is_empty() {
            EditValidation {
                valid: true,
                errors,
                total_chars,
                edit_count: items.len(),
            }
        } else {
            debug!(errors = errors.len(), total_chars, "Fuzzy edits rejected");
            self.rejected(errors, total_chars, items.len())
        }
    }

    /// Race a fuzzy worker against the configured deadline
    pub async fn with_deadline<F, T>(&self, work: F) -> Result<T, GatewayError>
    where
        F: Future<Output = T>,
    {
        let deadline = Duration::from_millis(self.config.timeout_ms);
        match tokio::time::timeout(deadline, work).await {
            Ok(value) => Ok(value),
            Err(_) => {
                self.bump(|m| m.timeouts += 1);
                warn!(?deadline, "Fuzzy operation deadline exceeded");
                Err(GatewayError::UpstreamTimeout {
                    backend: "fuzzy-edit".to_string(),
                    after: deadline,
                })
            }
        }
    }

    pub fn metrics(&self) -> GuardMetrics {
        self.metrics.lock().expect("guard metrics lock poisoned").clone()
    }

    fn rejected(&self, errors: Vec<String>, total_chars: usize, edit_count: usize) -> EditValidation {
        self.bump(|m| m.rejected += 1);
        EditValidation {
            valid: false,
            errors,
            total_chars,
            edit_count,
        }
    }

    fn bump(&self, f: impl FnOnce(&mut GuardMetrics)) {
        f(&mut self.metrics.lock().expect("guard metrics lock poisoned"));
    }
}

/// Clamp a fuzzy-match threshold into [0.1, 1.0]
pub fn clamp_threshold(value: Option<f64>) -> f64 {
    value.unwrap_or(DEFAULT_THRESHOLD).clamp(0.1, 1.0)
}

/// Clamp a suggestion count into [1, 10]
pub fn clamp_max_suggestions(value: Option<i64>) -> usize {
    value.unwrap_or(DEFAULT_MAX_SUGGESTIONS as i64).clamp(1, 10) as usize
}
