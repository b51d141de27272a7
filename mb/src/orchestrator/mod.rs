//! Parallel agents orchestrator
//!
//! Drives the decompose -> regroup-by-phase -> execute-in-batches ->
//! quality-gate -> synthesize workflow for test-driven code generation.
//! Batches run sequentially; tasks within a batch run concurrently under a
//! run-local pool sized from the discovered slot count.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{BackendKind, OrchestratorConfig};
use crate::error::GatewayError;
use crate::guard::{PoolPriority, RequestPool};
use crate::repair::{head, parse_llm_json};
use crate::subagent::{SubagentExecutor, SubagentRequest};

/// Per-task preview size fed to the quality reviewer
const REVIEW_PREVIEW_CHARS: usize = 500;
/// Per-task preview size in the synthesis artifact
const SYNTHESIS_PREVIEW_CHARS: usize = 200;
/// Slots assumed when neither the caller nor the local endpoint supplies one
const DEFAULT_SLOTS: u32 = 4;

/// TDD phase of one task
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskPhase {
    Red,
    Green,
    Refactor,
}

impl TaskPhase {
    /// Role a task of this phase runs under, absent an explicit override
    pub fn default_role(&self) -> &'static str {
        match self {
            TaskPhase::Red => "test-writer",
            TaskPhase::Green => "implementer",
            TaskPhase::Refactor => "refactorer",
        }
    }
}

/// One decomposed task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    pub phase: TaskPhase,
    pub task: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

/// One execution batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseGroup {
    /// Decomposer output calls this `group`
    #[serde(alias = "group")]
    pub index: u32,
    pub name: String,
    pub tasks: Vec<TaskSpec>,
}

/// Decomposer output shape
#[derive(Debug, Clone, Deserialize)]
struct Decomposition {
    parallel_groups: Vec<PhaseGroup>,
}

/// Result of one task execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub success: bool,
    pub phase: TaskPhase,
    pub role: String,
    pub response: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    pub processing_ms: u64,
    pub retried: bool,
}

/// Quality gate verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityVerdict {
    Pass,
    Iterate,
    /// Review itself failed; treated as iterate at score zero
    Error,
}

/// One quality review round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityReview {
    pub verdict: QualityVerdict,
    pub score: u8,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub retry_tasks: Vec<String>,
    #[serde(default)]
    pub task_issues: HashMap<String, Vec<String>>,
}

/// One parallel-agents invocation
#[derive(Debug, Clone, Default)]
pub struct OrchestratorRequest {
    pub task: String,
    pub max_parallel: Option<u32>,
    pub work_dir: Option<PathBuf>,
    /// Overrides the configured default for the quality gate
    pub iterate: Option<bool>,
}

/// Final report of a run
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorReport {
    pub work_dir: PathBuf,
    pub slots: u32,
    pub reorganized: bool,
    pub groups: Vec<PhaseGroup>,
    pub results: BTreeMap<String, TaskOutcome>,
    /// Quality-gate rounds performed (0 when iteration is disabled)
    pub iterations: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityReview>,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    /// True when the gate hit max iterations without a pass
    pub quality_gate_failed: bool,
}

/// The parallel TDD workflow driver
pub struct ParallelOrchestrator {
    subagent: Arc<SubagentExecutor>,
    config: OrchestratorConfig,
}

impl ParallelOrchestrator {
    pub fn new(subagent: Arc<SubagentExecutor>, config: OrchestratorConfig) -> Self {
        Self { subagent, config }
    }

    /// Run the full workflow
    pub async fn run(&self, request: OrchestratorRequest) -> Result<OrchestratorReport, GatewayError> {
        let work_dir = self.prepare_work_dir(request.work_dir.clone())?;

        // Stage 1: capacity discovery
        let slots = self.discover_slots(request.max_parallel).await;
        let pool = Arc::new(RequestPool::new(slots as usize));
        info!(slots, work_dir = %work_dir.display(), "Parallel agents run starting");

        // Stage 2: decomposition (failure here fails the whole run)
        let decomposition = self.decompose(&request.task, slots).await?;

        // Stage 3: phase-based regrouping
        let (groups, reorganized) = regroup_by_phase(&decomposition.parallel_groups, slots as usize);
        self.write_artifact(
            &work_dir,
            "decomposed.json",
            &json!({
                "original_groups": decomposition.parallel_groups,
                "groups": groups,
                "_reorganized": reorganized,
                "slots": slots,
            }),
        )?;

        // Stage 4: batch execution
        let results: Arc<Mutex<BTreeMap<String, TaskOutcome>>> = Arc::new(Mutex::new(BTreeMap::new()));
        for group in &groups {
            info!(group = group.index, name = %group.name, tasks = group.tasks.len(), "Executing batch");
            self.execute_batch(group, &pool, &results, None).await;
            let snapshot = results.lock().await.clone();
            self.write_artifact(&work_dir, "results.json", &json!(snapshot))?;
        }

        // Stage 5: iterative quality gate
        let iterate = request.iterate.unwrap_or(self.config.iterate);
        let mut iterations = 0u32;
        let mut quality: Option<QualityReview> = None;

        while iterate {
            iterations += 1;
            let review = self.review(&results, &pool).await;
            self.write_artifact(&work_dir, &format!("quality-{}.json", iterations), &json!(review))?;

            let done = review.verdict == QualityVerdict::Pass || iterations >= self.config.max_iterations;
            let retry_ids: Vec<String> = {
                let known = results.lock().await;
                review.retry_tasks.iter().filter(|id| known.contains_key(*id)).cloned().collect()
            };

            if !done {
                if retry_ids.is_empty() {
                    debug!("Iterate verdict without actionable retry tasks");
                } else {
                    info!(iteration = iterations, retries = retry_ids.len(), "Quality gate requested retries");
                    self.retry_tasks(&groups, &retry_ids, &review, &pool, &results).await;
                    let snapshot = results.lock().await.clone();
                    self.write_artifact(&work_dir, "results.json", &json!(snapshot))?;
                }
            }

            quality = Some(review);
            if done {
                break;
            }
        }

        // Stage 6: synthesis
        let results = results.lock().await.clone();

        let tasks_completed = results.values().filter(|r| r.success).count();
        let tasks_failed = results.len() - tasks_completed;
        let quality_gate_failed = iterate
            && quality
                .as_ref()
                .map(|q| q.verdict != QualityVerdict::Pass)
                .unwrap_or(false);

        let report = OrchestratorReport {
            work_dir: work_dir.clone(),
            slots,
            reorganized,
            groups,
            results,
            iterations,
            quality,
            tasks_completed,
            tasks_failed,
            quality_gate_failed,
        };

        self.write_artifact(&work_dir, "synthesis.json", &synthesis_doc(&report))?;
        info!(
            completed = report.tasks_completed,
            failed = report.tasks_failed,
            iterations = report.iterations,
            "Parallel agents run finished"
        );
        Ok(report)
    }

    fn prepare_work_dir(&self, requested: Option<PathBuf>) -> Result<PathBuf, GatewayError> {
        let dir = requested.unwrap_or_else(|| {
            std::env::temp_dir().join(format!("parallel-agents-{}", Utc::now().timestamp_nanos_opt().unwrap_or(0)))
        });
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Caller's value, else the local endpoint's advertised slot count;
    /// clamped to the configured cap either way.
    async fn discover_slots(&self, requested: Option<u32>) -> u32 {
        let raw = match requested {
            Some(n) => n,
            None => {
                let registry = self.subagent.router().registry();
                let mut found = None;
                for name in registry.fallback_chain().await {
                    if let Some(adapter) = registry.lookup_adapter(&name).await
                        && adapter.kind() == BackendKind::Local
                    {
                        found = adapter.discovered_slots().await;
                        break;
                    }
                }
                found.unwrap_or(DEFAULT_SLOTS)
            }
        };
        raw.clamp(1, self.config.max_parallel_cap)
    }

    async fn decompose(&self, task: &str, slots: u32) -> Result<Decomposition, GatewayError> {
        let report = self
            .subagent
            .run(SubagentRequest {
                role: "decomposer".to_string(),
                task: task.to_string(),
                max_parallel: Some(slots),
                priority: PoolPriority::High,
                ..Default::default()
            })
            .await?;

        let doc = parse_llm_json(&report.response.content)?;
        let mut decomposition: Decomposition =
            serde_json::from_value(doc).map_err(|e| GatewayError::ProtocolMismatch {
                backend: report.response.backend.clone(),
                message: format!("decomposition shape invalid: {}", e),
            })?;

        if decomposition.parallel_groups.iter().all(|g| g.tasks.is_empty()) {
            return Err(GatewayError::ProtocolMismatch {
                backend: report.response.backend,
                message: "decomposition contains no tasks".to_string(),
            });
        }

        dedupe_task_ids(&mut decomposition.parallel_groups);
        Ok(decomposition)
    }

    /// Run one batch: tasks concurrently under the run pool, results merged
    /// into the shared map. Per-task failures never abort the batch.
    async fn execute_batch(
        &self,
        group: &PhaseGroup,
        pool: &Arc<RequestPool>,
        results: &Arc<Mutex<BTreeMap<String, TaskOutcome>>>,
        feedback: Option<&QualityReview>,
    ) {
        // Prior-output previews for retry prompts, fetched in one lock pass
        let priors: HashMap<String, String> = if feedback.is_some() {
            let known = results.lock().await;
            group
                .tasks
                .iter()
                .filter_map(|t| known.get(&t.id).map(|r| (t.id.clone(), head(&r.response, REVIEW_PREVIEW_CHARS))))
                .collect()
        } else {
            HashMap::new()
        };

        let runs = group.tasks.iter().map(|task| {
            let exec_id = format!(
                "{}-{}-{}",
                group.index,
                task.id,
                Utc::now().timestamp_nanos_opt().unwrap_or(0)
            );
            let retried = feedback.is_some();
            let prompt = match feedback {
                Some(review) => retry_prompt(task, review, priors.get(&task.id).map(String::as_str)),
                None => task.task.clone(),
            };
            let role = task.agent.clone().unwrap_or_else(|| task.phase.default_role().to_string());
            let subagent = self.subagent.clone();
            let pool = pool.clone();
            let results = results.clone();
            let task = task.clone();

            async move {
                debug!(%exec_id, role = %role, "Task starting");
                let outcome = pool
                    .submit(PoolPriority::Normal, async {
                        subagent
                            .run(SubagentRequest {
                                role: role.clone(),
                                task: prompt,
                                priority: PoolPriority::Normal,
                                ..Default::default()
                            })
                            .await
                    })
                    .await;

                let outcome = match outcome {
                    Ok(report) => TaskOutcome {
                        success: true,
                        phase: task.phase,
                        role: report.role,
                        response: report.response.content,
                        backend: Some(report.response.backend),
                        processing_ms: report.processing_ms,
                        retried,
                    },
                    Err(err) => {
                        warn!(%exec_id, error = %err, "Task failed");
                        TaskOutcome {
                            success: false,
                            phase: task.phase,
                            role,
                            response: err.to_string(),
                            backend: None,
                            processing_ms: 0,
                            retried,
                        }
                    }
                };
                results.lock().await.insert(task.id.clone(), outcome);
            }
        });

        join_all(runs).await;
    }

    /// Re-execute the reviewer's retry list with injected feedback
    async fn retry_tasks(
        &self,
        groups: &[PhaseGroup],
        retry_ids: &[String],
        review: &QualityReview,
        pool: &Arc<RequestPool>,
        results: &Arc<Mutex<BTreeMap<String, TaskOutcome>>>,
    ) {
        let wanted: HashSet<&String> = retry_ids.iter().collect();
        for group in groups {
            let retry_group = PhaseGroup {
                index: group.index,
                name: format!("{}-retry", group.name),
                tasks: group.tasks.iter().filter(|t| wanted.contains(&t.id)).cloned().collect(),
            };
            if !retry_group.tasks.is_empty() {
                self.execute_batch(&retry_group, pool, results, Some(review)).await;
            }
        }
    }

    /// One quality review round; failure degrades to iterate at score zero
    async fn review(&self, results: &Arc<Mutex<BTreeMap<String, TaskOutcome>>>, pool: &Arc<RequestPool>) -> QualityReview {
        let prompt = {
            let results = results.lock().await;
            review_prompt(&results)
        };

        let reply = pool
            .submit(PoolPriority::High, async {
                self.subagent
                    .run(SubagentRequest {
                        role: "quality-reviewer".to_string(),
                        task: prompt,
                        priority: PoolPriority::High,
                        ..Default::default()
                    })
                    .await
            })
            .await;

        match reply {
            Ok(report) => match parse_review(&report.response.content) {
                Some(review) => review,
                None => {
                    warn!("Quality review output unparseable, treating as iterate");
                    QualityReview {
                        verdict: QualityVerdict::Error,
                        score: 0,
                        issues: vec!["review output unparseable".to_string()],
                        retry_tasks: vec![],
                        task_issues: HashMap::new(),
                    }
                }
            },
            Err(err) => {
                warn!(error = %err, "Quality review failed, treating as iterate");
                QualityReview {
                    verdict: QualityVerdict::Error,
                    score: 0,
                    issues: vec![err.to_string()],
                    retry_tasks: vec![],
                    task_issues: HashMap::new(),
                }
            }
        }
    }

    fn write_artifact(&self, dir: &std::path::Path, name: &str, doc: &serde_json::Value) -> Result<(), GatewayError> {
        let path = dir.join(name);
        std::fs::write(&path, serde_json::to_string_pretty(doc)?)?;
        debug!(artifact = %path.display(), "Artifact written");
        Ok(())
    }
}

/// Flatten all groups and rebuild batches phase by phase: every RED batch
/// precedes every GREEN batch, REFACTOR comes last, and no batch exceeds
/// `max_parallel` tasks.
fn regroup_by_phase(original: &[PhaseGroup], max_parallel: usize) -> (Vec<PhaseGroup>, bool) {
    let mut by_phase: BTreeMap<TaskPhase, Vec<TaskSpec>> = BTreeMap::new();
    for group in original {
        for task in &group.tasks {
            by_phase.entry(task.phase).or_default().push(task.clone());
        }
    }

    let mut groups = Vec::new();
    let mut index = 1u32;
    for (phase, tasks) in &by_phase {
        for chunk in tasks.chunks(max_parallel.max(1)) {
            groups.push(PhaseGroup {
                index,
                name: format!("{:?}-batch-{}", phase, index).to_lowercase(),
                tasks: chunk.to_vec(),
            });
            index += 1;
        }
    }

    let reorganized = groups.len() != original.len()
        || groups
            .iter()
            .zip(original)
            .any(|(new, old)| new.tasks.iter().map(|t| &t.id).ne(old.tasks.iter().map(|t| &t.id)));

    (groups, reorganized)
}

/// Make duplicated task ids unique within the run
fn dedupe_task_ids(groups: &mut [PhaseGroup]) {
    let mut seen: HashSet<String> = HashSet::new();
    for group in groups.iter_mut() {
        for task in group.tasks.iter_mut() {
            if !seen.insert(task.id.clone()) {
                let mut n = 2;
                while !seen.insert(format!("{}-{}", task.id, n)) {
                    n += 1;
                }
                let unique = format!("{}-{}", task.id, n);
                warn!(original = %task.id, renamed = %unique, "Duplicate task id renamed");
                task.id = unique;
            }
        }
    }
}

/// Aggregate task results into the reviewer's prompt, previews bounded
fn review_prompt(results: &BTreeMap<String, TaskOutcome>) -> String {
    let mut prompt = String::from("Review this batch of agent task results as the quality gate.\n\n## Task Results\n");
    for (id, outcome) in results {
        prompt.push_str(&format!(
            "### {} ({:?}, {}) - {}\n{}\n\n",
            id,
            outcome.phase,
            outcome.role,
            if outcome.success { "success" } else { "FAILED" },
            head(&outcome.response, REVIEW_PREVIEW_CHARS),
        ));
    }
    prompt
}

/// Retry prompt: task text plus the reviewer's per-task feedback and a
/// preview of the prior output
fn retry_prompt(task: &TaskSpec, review: &QualityReview, prior: Option<&str>) -> String {
    let mut prompt = format!("Your previous attempt needs rework.\n\n## Task\n{}\n", task.task);

    if let Some(issues) = review.task_issues.get(&task.id)
        && !issues.is_empty()
    {
        prompt.push_str("\n## Reviewer Feedback\n");
        for issue in issues {
            prompt.push_str(&format!("- {}\n", issue));
        }
    } else if !review.issues.is_empty() {
        prompt.push_str("\n## Reviewer Feedback\n");
        for issue in &review.issues {
            prompt.push_str(&format!("- {}\n", issue));
        }
    }

    if let Some(prior) = prior {
        prompt.push_str(&format!("\n## Previous Output (truncated)\n{}\n", prior));
    }
    prompt
}

/// Tolerant parse of the reviewer's JSON
fn parse_review(content: &str) -> Option<QualityReview> {
    let doc = parse_llm_json(content).ok()?;

    let verdict = match doc["verdict"].as_str()?.to_lowercase().as_str() {
        "pass" => QualityVerdict::Pass,
        "iterate" => QualityVerdict::Iterate,
        _ => return None,
    };

    Some(QualityReview {
        verdict,
        score: doc["score"].as_u64().unwrap_or(0).min(100) as u8,
        issues: string_list(&doc["issues"]),
        retry_tasks: string_list(&doc["retry_tasks"]),
        task_issues: doc["task_issues"]
            .as_object()
            .map(|map| map.iter().map(|(k, v)| (k.clone(), string_list(v))).collect())
            .unwrap_or_default(),
    })
}

fn string_list(value: &serde_json::Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

fn synthesis_doc(report: &OrchestratorReport) -> serde_json::Value {
    let summaries: BTreeMap<&String, serde_json::Value> = report
        .results
        .iter()
        .map(|(id, outcome)| {
            (
                id,
                json!({
                    "success": outcome.success,
                    "phase": outcome.phase,
                    "role": outcome.role,
                    "backend": outcome.backend,
                    "retried": outcome.retried,
                    "summary": head(&outcome.response, SYNTHESIS_PREVIEW_CHARS),
                }),
            )
        })
        .collect();

    json!({
        "tasks_total": report.results.len(),
        "tasks_completed": report.tasks_completed,
        "tasks_failed": report.tasks_failed,
        "iterations": report.iterations,
        "slots": report.slots,
        "quality": report.quality,
        "quality_gate_failed": report.quality_gate_failed,
        "tasks": summaries,
    })
}
