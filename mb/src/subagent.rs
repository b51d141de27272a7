//! Subagent executor
//!
//! Runs one role-bound task: validates the role (with nearest-name
//! suggestions), resolves the `auto` meta role via an orchestrator backend,
//! composes the final prompt, selects a non-orchestrator backend through the
//! router, and parses a verdict when the role demands one.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::backend::{BackendAdapter, BackendResponse, CompletionOptions};
use crate::capability::{estimate_context_size, is_orchestrator};
use crate::config::MatcherConfig;
use crate::error::{AttemptRecord, GatewayError};
use crate::fileops::{FileOps, resolve_patterns};
use crate::guard::PoolPriority;
use crate::roles::{RoleRegistry, RoleTemplate};
use crate::router::{RouteRequest, Router};
use crate::verdict::{Verdict, parse_verdict};

/// Role used when auto-selection cannot be parsed
const DEFAULT_AUTO_ROLE: &str = "code-reviewer";

/// One subagent invocation
#[derive(Debug, Clone, Default)]
pub struct SubagentRequest {
    /// Role name, or `auto` for meta selection
    pub role: String,

    pub task: String,

    /// Glob patterns resolved into a concrete file list
    pub file_patterns: Vec<String>,

    /// Arbitrary extra context, rendered as pretty JSON into the prompt
    pub extra_context: Option<Value>,

    /// Slot count substituted into the role prompt's placeholder
    pub max_parallel: Option<u32>,

    pub preferred_backend: Option<String>,

    pub priority: PoolPriority,
}

/// Result of a subagent run
#[derive(Debug, Clone)]
pub struct SubagentReport {
    /// The concrete role that ran (after auto resolution)
    pub role: String,
    pub auto_selected: bool,
    pub response: BackendResponse,
    pub attempted: Vec<AttemptRecord>,
    pub verdict: Option<Verdict>,
    pub files: Vec<PathBuf>,
    pub processing_ms: u64,
}

/// Rolling executor counters
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SubagentMetrics {
    pub attempts: u64,
    pub successes: u64,
    pub errors: u64,
    pub total_ms: u64,
}

/// Role-bound task executor
pub struct SubagentExecutor {
    roles: Arc<RoleRegistry>,
    router: Arc<Router>,
    matcher: MatcherConfig,
    editor: Option<Arc<dyn FileOps>>,
    metrics: Mutex<SubagentMetrics>,
}

impl SubagentExecutor {
    pub fn new(
        roles: Arc<RoleRegistry>,
        router: Arc<Router>,
        matcher: MatcherConfig,
        editor: Option<Arc<dyn FileOps>>,
    ) -> Self {
        Self {
            roles,
            router,
            matcher,
            editor,
            metrics: Mutex::new(SubagentMetrics::default()),
        }
    }

    pub fn roles(&self) -> &Arc<RoleRegistry> {
        &self.roles
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn metrics(&self) -> SubagentMetrics {
        self.metrics.lock().expect("subagent metrics lock poisoned").clone()
    }

    /// Execute one role-bound task
    pub async fn run(&self, request: SubagentRequest) -> Result<SubagentReport, GatewayError> {
        let started = Instant::now();
        self.bump(|m| m.attempts += 1);

        let result = self.run_inner(&request).await;

        let elapsed = started.elapsed().as_millis() as u64;
        match &result {
            Ok(report) => {
                info!(
                    role = %report.role,
                    backend = %report.response.backend,
                    elapsed_ms = elapsed,
                    "Subagent run succeeded"
                );
                self.bump(|m| {
                    m.successes += 1;
                    m.total_ms += elapsed;
                });
            }
            Err(err) => {
                warn!(role = %request.role, error = %err, elapsed_ms = elapsed, "Subagent run failed");
                self.bump(|m| {
                    m.errors += 1;
                    m.total_ms += elapsed;
                });
            }
        }
        result
    }

    async fn run_inner(&self, request: &SubagentRequest) -> Result<SubagentReport, GatewayError> {
        let role = self.validate_role(&request.role)?;

        let (role, auto_selected) = if role.meta {
            let resolved = self.resolve_auto_role(&request.task).await;
            let template = self
                .roles
                .get(&resolved)
                .ok_or_else(|| GatewayError::Misconfigured(format!("auto-selected role '{}' missing", resolved)))?;
            (template.clone(), true)
        } else {
            (role.clone(), false)
        };

        let system_prompt = self.roles.render_prompt(&role, request.max_parallel.unwrap_or(1))?;
        let files = self.resolve_files(&request.file_patterns)?;
        let prompt = compose_prompt(&role, &system_prompt, &request.task, &files, request.extra_context.as_ref());

        let context_size = estimate_context_size(&request.task, request.file_patterns.len());

        let outcome = self
            .router
            .route(RouteRequest {
                prompt,
                options: CompletionOptions {
                    max_tokens: Some(role.max_tokens),
                    enable_thinking: role.enable_thinking,
                    ..Default::default()
                },
                preferred: request.preferred_backend.clone(),
                required_capabilities: role.required_capabilities.clone(),
                fallback_order: role.fallback_order.clone(),
                context_size: Some(context_size),
                routing_rules: role.routing_rules.clone(),
                priority: request.priority,
                exclude_orchestrators: true,
            })
            .await?;

        let verdict = if role.requires_verdict {
            let parsed = parse_verdict(&outcome.response.content);
            if parsed.is_none() {
                debug!(role = %role.name, "Role requires a verdict but none was parseable");
            }
            parsed
        } else {
            None
        };

        Ok(SubagentReport {
            role: role.name.clone(),
            auto_selected,
            processing_ms: outcome.response.latency_ms,
            response: outcome.response,
            attempted: outcome.attempted,
            verdict,
            files,
        })
    }

    /// Exact role lookup, with a nearest-name suggestion on miss
    fn validate_role(&self, name: &str) -> Result<&RoleTemplate, GatewayError> {
        if name.trim().is_empty() {
            return Err(GatewayError::invalid("role name is empty"));
        }
        self.roles.get(name).ok_or_else(|| GatewayError::InvalidInput {
            message: format!("unknown role '{}'", name),
            suggestions: self.roles.nearest(name).map(|s| vec![s.to_string()]).unwrap_or_default(),
        })
    }

    /// Ask an orchestrator-capable backend to pick the best role by name.
    /// Any failure falls back to the default role.
    async fn resolve_auto_role(&self, task: &str) -> String {
        let names: Vec<&str> = self
            .roles
            .list()
            .into_iter()
            .filter(|r| !r.meta)
            .map(|r| r.name.as_str())
            .collect();

        let prompt = format!(
            "Pick the single best role for this task.\nRoles: {}\nTask: {}\nAnswer with one role name only.",
            names.join(", "),
            crate::repair::head(task, 500),
        );

        let reply = match self.orchestrator_backend().await {
            Some(adapter) => {
                adapter
                    .execute(
                        &prompt,
                        &CompletionOptions {
                            max_tokens: Some(64),
                            ..Default::default()
                        },
                    )
                    .await
            }
            None => {
                // No routing model present: any worker can answer this
                self.router
                    .route(RouteRequest {
                        prompt,
                        options: CompletionOptions {
                            max_tokens: Some(64),
                            ..Default::default()
                        },
                        priority: PoolPriority::High,
                        ..Default::default()
                    })
                    .await
                    .map(|o| o.response)
            }
        };

        match reply {
            Ok(response) => {
                let normalized = response.content.trim().to_lowercase();
                for name in &names {
                    if normalized.contains(name) {
                        debug!(role = %name, "Auto-selected role");
                        return name.to_string();
                    }
                }
                warn!(reply = %crate::repair::head(&normalized, 80), "Unparseable auto-role reply, using default");
                DEFAULT_AUTO_ROLE.to_string()
            }
            Err(err) => {
                warn!(error = %err, "Auto-role selection failed, using default");
                DEFAULT_AUTO_ROLE.to_string()
            }
        }
    }

    /// First registered backend whose model/endpoint marks it an orchestrator
    async fn orchestrator_backend(&self) -> Option<Arc<dyn BackendAdapter>> {
        for name in self.router.registry().fallback_chain().await {
            if let Some(adapter) = self.router.registry().lookup_adapter(&name).await
                && is_orchestrator(&adapter.model_id(), &adapter.endpoint(), &self.matcher)
            {
                return Some(adapter);
            }
        }
        None
    }

    fn resolve_files(&self, patterns: &[String]) -> Result<Vec<PathBuf>, GatewayError> {
        if patterns.is_empty() {
            return Ok(Vec::new());
        }
        match &self.editor {
            Some(editor) => editor.resolve_patterns(patterns),
            None => resolve_patterns(patterns),
        }
    }

    fn bump(&self, f: impl FnOnce(&mut SubagentMetrics)) {
        f(&mut self.metrics.lock().expect("subagent metrics lock poisoned"));
    }
}

/// Assemble the final prompt from its parts
fn compose_prompt(
    role: &RoleTemplate,
    system_prompt: &str,
    task: &str,
    files: &[PathBuf],
    extra_context: Option<&Value>,
) -> String {
    let mut prompt = String::with_capacity(system_prompt.len() + task.len() + 512);

    prompt.push_str(&format!("## Role: {}\n{}\n\n", role.name, role.description));
    prompt.push_str(system_prompt);
    prompt.push_str(&format!("\n\n## Task\n{}\n", task));

    if !files.is_empty() {
        prompt.push_str("\n## Files\n");
        for file in files {
            prompt.push_str(&format!("- {}\n", file.display()));
        }
    }

    if !role.suggested_tools.is_empty() {
        prompt.push_str(&format!("\n## Suggested Tools\n{}\n", role.suggested_tools.join(", ")));
    }

    if let Some(context) = extra_context {
        let pretty = serde_json::to_string_pretty(context).unwrap_or_else(|_| context.to_string());
        prompt.push_str(&format!("\n## Additional Context\n```json\n{}\n```\n", pretty));
    }

    if let Some(format) = &role.output_format {
        prompt.push_str(&format!("\n## Output Format\n{}\n", format));
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendRegistry;
    use crate::backend::registry::tests::{ScriptedAdapter, entry};
    use crate::config::{BreakerConfig, DiscoveryConfig};
    use crate::guard::RequestPool;

    async fn executor_with(adapters: Vec<(&str, i32, Arc<ScriptedAdapter>)>) -> SubagentExecutor {
        let registry = Arc::new(BackendRegistry::new(BreakerConfig::default(), DiscoveryConfig::default()));
        for (name, priority, adapter) in adapters {
            registry.register_adapter(entry(name, priority), adapter).await;
        }
        let router = Arc::new(Router::new(registry, Arc::new(RequestPool::new(4)), MatcherConfig::default()));
        SubagentExecutor::new(Arc::new(RoleRegistry::builtin()), router, MatcherConfig::default(), None)
    }

    #[tokio::test]
    async fn test_unknown_role_suggests_nearest() {
        let executor = executor_with(vec![("local", 1, Arc::new(ScriptedAdapter::new("local", 0)))]).await;

        let err = executor
            .run(SubagentRequest {
                role: "code-reviwer".to_string(),
                task: "review".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();

        match err {
            GatewayError::InvalidInput { suggestions, .. } => {
                assert_eq!(suggestions, vec!["code-reviewer".to_string()]);
            }
            other => panic!("expected InvalidInput, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_verdict_attached_for_review_roles() {
        let verdict_reply = "done\n```yaml\nverdict:\n  status: APPROVE\n  score: 9\n  reasoning: clean\n```";
        let adapter = Arc::new(ScriptedAdapter::with_response("local", "qwen3-coder", verdict_reply));
        let executor = executor_with(vec![("local", 1, adapter)]).await;

        let report = executor
            .run(SubagentRequest {
                role: "code-reviewer".to_string(),
                task: "review this".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let verdict = report.verdict.expect("verdict expected");
        assert_eq!(verdict.score, 9.0);
        assert!(!report.auto_selected);
        assert_eq!(report.role, "code-reviewer");
    }

    #[tokio::test]
    async fn test_auto_role_resolution_via_orchestrator() {
        // The orchestrator model answers the selection prompt; the worker
        // serves the actual task
        let selector = Arc::new(ScriptedAdapter::with_response("selector", "tiny-orchestrator", "test-writer"));
        let worker = Arc::new(ScriptedAdapter::with_response("worker", "qwen3-coder", "tests written"));
        let executor = executor_with(vec![("selector", 1, selector), ("worker", 2, worker)]).await;

        let report = executor
            .run(SubagentRequest {
                role: "auto".to_string(),
                task: "write tests for the parser".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(report.auto_selected);
        assert_eq!(report.role, "test-writer");
        // The worker, not the orchestrator, served the task
        assert_eq!(report.response.backend, "worker");
    }

    #[tokio::test]
    async fn test_auto_role_unparseable_falls_back_to_default() {
        let selector = Arc::new(ScriptedAdapter::with_response("selector", "tiny-orchestrator", "no idea"));
        let worker = Arc::new(ScriptedAdapter::with_response("worker", "qwen3-coder", "ok"));
        let executor = executor_with(vec![("selector", 1, selector), ("worker", 2, worker)]).await;

        let report = executor
            .run(SubagentRequest {
                role: "auto".to_string(),
                task: "do something".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(report.role, DEFAULT_AUTO_ROLE);
    }

    #[tokio::test]
    async fn test_metrics_recorded() {
        let executor = executor_with(vec![("local", 1, Arc::new(ScriptedAdapter::new("local", 0)))]).await;

        executor
            .run(SubagentRequest {
                role: "implementer".to_string(),
                task: "impl".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let _ = executor
            .run(SubagentRequest {
                role: "nope".to_string(),
                task: "x".to_string(),
                ..Default::default()
            })
            .await;

        let metrics = executor.metrics();
        assert_eq!(metrics.attempts, 2);
        assert_eq!(metrics.successes, 1);
        assert_eq!(metrics.errors, 1);
    }

    #[test]
    fn test_compose_prompt_sections() {
        let roles = RoleRegistry::builtin();
        let role = roles.get("code-reviewer").unwrap();
        let prompt = compose_prompt(
            role,
            "SYSTEM",
            "review the parser",
            &[PathBuf::from("src/parser.rs")],
            Some(&serde_json::json!({"pr": 42})),
        );

        assert!(prompt.contains("## Role: code-reviewer"));
        assert!(prompt.contains("SYSTEM"));
        assert!(prompt.contains("## Task\nreview the parser"));
        assert!(prompt.contains("- src/parser.rs"));
        assert!(prompt.contains("## Suggested Tools"));
        assert!(prompt.contains("\"pr\": 42"));
        assert!(prompt.contains("## Output Format"));
    }
}
