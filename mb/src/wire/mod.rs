//! Wire surface: tool dispatcher and JSON sanitization
//!
//! Maps incoming `{method, params}` tool calls to handlers and shapes every
//! reply as a single `{success, ..., error?, processing_time_ms?}` object.
//! Outgoing JSON is sanitized (control characters stripped, error strings
//! redacted) as the last line of defense before the transport.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::error::{GatewayError, redact};
use crate::fileops::{FuzzyEditMode, FuzzyEditRequest, WriteOp};
use crate::gateway::Gateway;
use crate::guard::{clamp_max_suggestions, clamp_threshold};
use crate::orchestrator::OrchestratorRequest;
use crate::router::RouteRequest;
use crate::subagent::SubagentRequest;

pub mod server;

/// One incoming tool call
#[derive(Debug, Clone, Deserialize)]
pub struct ToolRequest {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

/// Tool names this dispatcher answers
pub const KNOWN_TOOLS: &[&str] = &[
    "ask",
    "review",
    "explore",
    "analyze_file",
    "health",
    "subagent",
    "parallel_agents",
    "write_files",
    "fuzzy_edit",
    "backup_create",
    "backup_restore",
    "backup_list",
    "backup_cleanup",
];

/// Cap on file content inlined by analyze_file
const ANALYZE_FILE_CAP: usize = 100_000;

/// Maps tool calls to gateway operations
pub struct ToolDispatcher {
    gateway: Arc<Gateway>,
}

impl ToolDispatcher {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    /// Handle one call; the reply is always a sanitized response object
    pub async fn dispatch(&self, request: ToolRequest) -> Value {
        let started = Instant::now();
        let method = request.method.replace('-', "_");
        debug!(method = %method, "Tool call");

        let result = match method.as_str() {
            "ask" => self.handle_ask(&request.params).await,
            "review" => self.handle_review(&request.params).await,
            "explore" => self.handle_explore(&request.params).await,
            "analyze_file" => self.handle_analyze_file(&request.params).await,
            "health" => self.handle_health().await,
            "subagent" => self.handle_subagent(&request.params).await,
            "parallel_agents" => self.handle_parallel_agents(&request.params).await,
            "write_files" => self.handle_write_files(&request.params).await,
            "fuzzy_edit" => self.handle_fuzzy_edit(&request.params).await,
            "backup_create" | "backup_restore" | "backup_list" | "backup_cleanup" => {
                self.handle_backup(&method, &request.params).await
            }
            other => Err(GatewayError::InvalidInput {
                message: format!("unknown tool '{}'", other),
                suggestions: KNOWN_TOOLS.iter().map(|t| t.to_string()).collect(),
            }),
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let reply = match result {
            Ok(mut payload) => {
                payload.insert("success".to_string(), json!(true));
                payload.insert("processing_time_ms".to_string(), json!(elapsed_ms));
                Value::Object(payload)
            }
            Err(err) => failure(&err, elapsed_ms),
        };
        sanitize_value(reply)
    }

    async fn handle_ask(&self, params: &Value) -> Result<Map<String, Value>, GatewayError> {
        let prompt = required_str(params, "prompt")?;

        let outcome = self
            .gateway
            .router
            .route(RouteRequest {
                prompt: prompt.to_string(),
                options: crate::backend::CompletionOptions {
                    max_tokens: params["max_tokens"].as_u64().map(|v| v as u32),
                    temperature: params["temperature"].as_f64().map(|v| v as f32),
                    ..Default::default()
                },
                preferred: params["backend"].as_str().map(str::to_string),
                ..Default::default()
            })
            .await?;

        Ok(object(json!({
            "response": outcome.response.content,
            "backend": outcome.winner,
            "tokens": outcome.response.tokens,
            "latency_ms": outcome.response.latency_ms,
            "fallback_chain": outcome.attempted,
            "metadata": outcome.response.metadata,
        })))
    }

    async fn handle_review(&self, params: &Value) -> Result<Map<String, Value>, GatewayError> {
        let task = params["task"]
            .as_str()
            .or_else(|| params["content"].as_str())
            .ok_or_else(|| GatewayError::invalid("missing 'task' or 'content'"))?;

        let report = self
            .gateway
            .subagent
            .run(SubagentRequest {
                role: "code-reviewer".to_string(),
                task: task.to_string(),
                file_patterns: string_vec(&params["file_patterns"]),
                ..Default::default()
            })
            .await?;
        Ok(subagent_payload(report))
    }

    async fn handle_explore(&self, params: &Value) -> Result<Map<String, Value>, GatewayError> {
        let question = params["question"]
            .as_str()
            .unwrap_or("Explore this codebase and summarize its structure");
        let mut patterns = string_vec(&params["file_patterns"]);
        if patterns.is_empty() {
            patterns.push("**/*".to_string());
        }

        let report = self
            .gateway
            .subagent
            .run(SubagentRequest {
                role: "explorer".to_string(),
                task: question.to_string(),
                file_patterns: patterns,
                ..Default::default()
            })
            .await?;
        Ok(subagent_payload(report))
    }

    async fn handle_analyze_file(&self, params: &Value) -> Result<Map<String, Value>, GatewayError> {
        let path = PathBuf::from(required_str(params, "path")?);
        let content = std::fs::read_to_string(&path)
            .map_err(|e| GatewayError::invalid(format!("cannot read {}: {}", path.display(), e)))?;
        let truncated = content.len() > ANALYZE_FILE_CAP;
        let content = crate::repair::head(&content, ANALYZE_FILE_CAP);

        let question = params["question"].as_str().unwrap_or("Analyze this file");
        let task = format!("{}\n\n## File: {}\n```\n{}\n```", question, path.display(), content);

        let report = self
            .gateway
            .subagent
            .run(SubagentRequest {
                role: "code-reviewer".to_string(),
                task,
                ..Default::default()
            })
            .await?;

        let mut payload = subagent_payload(report);
        payload.insert("path".to_string(), json!(path));
        payload.insert("truncated".to_string(), json!(truncated));
        Ok(payload)
    }

    async fn handle_health(&self) -> Result<Map<String, Value>, GatewayError> {
        Ok(object(self.gateway.health_report().await))
    }

    async fn handle_subagent(&self, params: &Value) -> Result<Map<String, Value>, GatewayError> {
        let report = self
            .gateway
            .subagent
            .run(SubagentRequest {
                role: required_str(params, "role")?.to_string(),
                task: required_str(params, "task")?.to_string(),
                file_patterns: string_vec(&params["file_patterns"]),
                extra_context: params.get("context").filter(|c| !c.is_null()).cloned(),
                preferred_backend: params["backend"].as_str().map(str::to_string),
                ..Default::default()
            })
            .await?;
        Ok(subagent_payload(report))
    }

    async fn handle_parallel_agents(&self, params: &Value) -> Result<Map<String, Value>, GatewayError> {
        let report = self
            .gateway
            .orchestrator
            .run(OrchestratorRequest {
                task: required_str(params, "task")?.to_string(),
                max_parallel: params["max_parallel"].as_u64().map(|v| v as u32),
                work_dir: params["work_dir"].as_str().map(PathBuf::from),
                iterate: params["iterate"].as_bool(),
            })
            .await?;

        if report.quality_gate_failed {
            let quality = report.quality.clone();
            return Err(GatewayError::QualityGateFailed {
                iterations: report.iterations,
                score: quality.map(|q| q.score).unwrap_or(0),
            });
        }

        Ok(object(serde_json::to_value(&report)?))
    }

    async fn handle_write_files(&self, params: &Value) -> Result<Map<String, Value>, GatewayError> {
        let editor = self.editor()?;
        let ops: Vec<WriteOp> = serde_json::from_value(params["ops"].clone())
            .map_err(|e| GatewayError::invalid(format!("bad 'ops': {}", e)))?;
        if ops.is_empty() {
            return Err(GatewayError::invalid("'ops' is empty"));
        }

        let create_backup = params["create_backup"].as_bool().unwrap_or(true);
        let reports = editor.atomic_multi_write(&ops, create_backup).await?;
        Ok(object(json!({ "results": reports })))
    }

    async fn handle_fuzzy_edit(&self, params: &Value) -> Result<Map<String, Value>, GatewayError> {
        let editor = self.editor()?;
        let path = PathBuf::from(required_str(params, "path")?);

        // Complexity guard before any expensive matching work
        let validation = self.gateway.fuzzy.validate(&params["edits"]);
        if !validation.valid {
            return Err(GatewayError::InvalidInput {
                message: format!("fuzzy edits rejected: {}", validation.errors.join("; ")),
                suggestions: vec![],
            });
        }

        let edits: Vec<FuzzyEditRequest> = serde_json::from_value(params["edits"].clone())
            .map_err(|e| GatewayError::invalid(format!("bad 'edits': {}", e)))?;

        let mode = match params["mode"].as_str().unwrap_or("strict") {
            "strict" => FuzzyEditMode::Strict,
            "lenient" => FuzzyEditMode::Lenient,
            "dry-run" | "dry_run" => FuzzyEditMode::DryRun,
            other => return Err(GatewayError::invalid(format!("unknown mode '{}'", other))),
        };
        let threshold = clamp_threshold(params["threshold"].as_f64());
        let max_suggestions = clamp_max_suggestions(params["max_suggestions"].as_i64());
        let suggest = params["suggest_alternatives"].as_bool().unwrap_or(false);

        let report = self
            .gateway
            .fuzzy
            .with_deadline(editor.fuzzy_edit(&path, &edits, mode, threshold, max_suggestions, suggest))
            .await??;

        Ok(object(json!({ "report": report, "validated_chars": validation.total_chars })))
    }

    async fn handle_backup(&self, method: &str, params: &Value) -> Result<Map<String, Value>, GatewayError> {
        let editor = self.editor()?;
        match method {
            "backup_create" => {
                let path = PathBuf::from(required_str(params, "path")?);
                let info = editor.create_backup(&path).await?;
                Ok(object(json!({ "backup": info })))
            }
            "backup_restore" => {
                let id = required_str(params, "id")?;
                editor.restore_backup(id).await?;
                Ok(object(json!({ "restored": id })))
            }
            "backup_list" => {
                let backups = editor.list_backups().await?;
                Ok(object(json!({ "backups": backups })))
            }
            "backup_cleanup" => {
                let keep = params["keep"].as_u64().unwrap_or(10) as usize;
                let removed = editor.cleanup_backups(keep).await?;
                Ok(object(json!({ "removed": removed })))
            }
            _ => unreachable!("routed by dispatch"),
        }
    }

    fn editor(&self) -> Result<&Arc<dyn crate::fileops::FileOps>, GatewayError> {
        self.gateway
            .editor
            .as_ref()
            .ok_or_else(|| GatewayError::Misconfigured("no file editor collaborator attached".to_string()))
    }
}

/// Shape a failure into the wire envelope
fn failure(err: &GatewayError, elapsed_ms: u64) -> Value {
    let mut reply = json!({
        "success": false,
        "error": redact(&err.to_string()),
        "error_kind": err.kind(),
        "processing_time_ms": elapsed_ms,
    });

    if let GatewayError::InvalidInput { suggestions, .. } = err
        && !suggestions.is_empty()
    {
        reply["suggestions"] = json!(suggestions);
    }
    if let GatewayError::AllBackendsFailed { attempts, last } = err {
        reply["attempts"] = json!(attempts);
        reply["last_error_kind"] = json!(last.kind());
    }
    reply
}

fn subagent_payload(report: crate::subagent::SubagentReport) -> Map<String, Value> {
    object(json!({
        "role": report.role,
        "auto_selected": report.auto_selected,
        "response": report.response.content,
        "backend": report.response.backend,
        "tokens": report.response.tokens,
        "latency_ms": report.response.latency_ms,
        "fallback_chain": report.attempted,
        "verdict": report.verdict,
        "files": report.files,
    }))
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => {
            warn!("non-object payload coerced");
            let mut map = Map::new();
            map.insert("payload".to_string(), other);
            map
        }
    }
}

fn required_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, GatewayError> {
    params[key]
        .as_str()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GatewayError::invalid(format!("missing '{}'", key)))
}

fn string_vec(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

/// Strip control characters from every string in the tree, keeping `\n` and
/// `\t` inside values. Keys are sanitized the same way.
pub fn sanitize_value(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(sanitize_str(&s)),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_value).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (sanitize_str(&k), sanitize_value(v)))
                .collect(),
        ),
        other => other,
    }
}

fn sanitize_str(s: &str) -> String {
    s.chars().filter(|c| !c.is_control() || matches!(c, '\n' | '\t')).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    async fn dispatcher() -> ToolDispatcher {
        // Default config backends fail offline; enough for dispatch tests
        let gateway = Gateway::new(Config {
            backends: vec![],
            ..Default::default()
        })
        .await
        .unwrap();
        ToolDispatcher::new(Arc::new(gateway))
    }

    #[tokio::test]
    async fn test_unknown_tool_lists_known() {
        let d = dispatcher().await;
        let reply = d
            .dispatch(ToolRequest {
                method: "frobnicate".to_string(),
                params: json!({}),
            })
            .await;

        assert_eq!(reply["success"], false);
        assert_eq!(reply["error_kind"], "invalid-input");
        assert!(reply["suggestions"].as_array().unwrap().iter().any(|t| t == "ask"));
        assert!(reply["processing_time_ms"].as_u64().is_some());
    }

    #[tokio::test]
    async fn test_hyphenated_method_normalized() {
        let d = dispatcher().await;
        let reply = d
            .dispatch(ToolRequest {
                method: "parallel-agents".to_string(),
                params: json!({}),
            })
            .await;
        // Reaches the handler and fails on the missing task, not the name
        assert!(reply["error"].as_str().unwrap().contains("task"));
    }

    #[tokio::test]
    async fn test_health_succeeds_with_no_backends() {
        let d = dispatcher().await;
        let reply = d
            .dispatch(ToolRequest {
                method: "health".to_string(),
                params: json!({}),
            })
            .await;
        assert_eq!(reply["success"], true);
        assert!(reply["backends"].is_object());
    }

    #[tokio::test]
    async fn test_write_files_without_editor_is_misconfigured() {
        let d = dispatcher().await;
        let reply = d
            .dispatch(ToolRequest {
                method: "write_files".to_string(),
                params: json!({"ops": [{"op": "write", "path": "x", "content": "y"}]}),
            })
            .await;
        assert_eq!(reply["success"], false);
        assert_eq!(reply["error_kind"], "misconfigured");
    }

    #[tokio::test]
    async fn test_ask_with_no_backends_reports_failure() {
        let d = dispatcher().await;
        let reply = d
            .dispatch(ToolRequest {
                method: "ask".to_string(),
                params: json!({"prompt": "hi"}),
            })
            .await;
        assert_eq!(reply["success"], false);
    }

    #[test]
    fn test_sanitize_strips_control_chars() {
        let dirty = json!({
            "text": "line1\nline2\ttab\u{7}bell",
            "nested": ["ok\u{1}", {"k\u{2}ey": "v"}],
        });
        let clean = sanitize_value(dirty);
        assert_eq!(clean["text"], "line1\nline2\ttabbell");
        assert_eq!(clean["nested"][0], "ok");
        assert_eq!(clean["nested"][1]["key"], "v");
    }

    #[test]
    fn test_failure_envelope_for_all_backends_failed() {
        let err = GatewayError::AllBackendsFailed {
            attempts: vec![],
            last: Box::new(GatewayError::BackendUnavailable {
                backend: "a".to_string(),
            }),
        };
        let reply = failure(&err, 12);
        assert_eq!(reply["success"], false);
        assert_eq!(reply["error_kind"], "all-backends-failed");
        assert_eq!(reply["last_error_kind"], "backend-unavailable");
    }
}
