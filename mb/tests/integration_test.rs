//! End-to-end scenarios driven through the public API with mock adapters.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::json;

use modelbridge::backend::{
    AdapterState, BackendAdapter, BackendRegistry, BackendResponse, CircuitBreaker, CompletionOptions, HealthStatus,
};
use modelbridge::config::{
    BackendEntry, BackendKind, BackendSettings, BreakerConfig, Config, DiscoveryConfig, MatcherConfig, OrchestratorConfig,
    RateLimitConfig,
};
use modelbridge::error::GatewayError;
use modelbridge::guard::{RateLimiter, RequestPool};
use modelbridge::orchestrator::{OrchestratorRequest, ParallelOrchestrator};
use modelbridge::roles::RoleRegistry;
use modelbridge::router::Router;
use modelbridge::subagent::SubagentExecutor;
use modelbridge::verdict::{VerdictStatus, parse_verdict};

/// Mock adapter scripted by a reply function over the prompt.
struct MockAdapter {
    name: String,
    model: String,
    fail_first: usize,
    calls: AtomicUsize,
    reply: Box<dyn Fn(&str) -> String + Send + Sync>,
    state: AdapterState,
}

impl MockAdapter {
    fn failing(name: &str, fail_first: usize) -> Arc<Self> {
        Self::build(name, "mock-model", fail_first, |_| "4".to_string())
    }

    fn answering(name: &str, reply: impl Fn(&str) -> String + Send + Sync + 'static) -> Arc<Self> {
        Self::build(name, "qwen3-coder-mock", 0, reply)
    }

    fn build(
        name: &str,
        model: &str,
        fail_first: usize,
        reply: impl Fn(&str) -> String + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            model: model.to_string(),
            fail_first,
            calls: AtomicUsize::new(0),
            reply: Box::new(reply),
            state: AdapterState::new(CircuitBreaker::new(name, 5, Duration::from_secs(30))),
        })
    }
}

#[async_trait]
impl BackendAdapter for MockAdapter {
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
        "http://mock.invalid".to_string()
    }

    async fn execute(&self, prompt: &str, _options: &CompletionOptions) -> Result<BackendResponse, GatewayError> {
        self.state.breaker().check()?;
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let result = if call < self.fail_first {
            Err(GatewayError::UpstreamTimeout {
                backend: self.name.clone(),
                after: Duration::from_secs(60),
            })
        } else {
            Ok(BackendResponse {
                content: (self.reply)(prompt),
                tokens: 1,
                backend: self.name.clone(),
                latency_ms: 1,
                metadata: None,
            })
        };
        self.state.record(&result, 1);
        result
    }

    async fn health_probe(&self) -> HealthStatus {
        HealthStatus::healthy(1, Some(self.model.clone()))
    }

    fn state(&self) -> &AdapterState {
        &self.state
    }
}

fn entry(name: &str, priority: i32) -> BackendEntry {
    BackendEntry {
        name: name.to_string(),
        kind: BackendKind::Fast,
        enabled: true,
        priority,
        settings: BackendSettings::default(),
    }
}

fn registry() -> BackendRegistry {
    BackendRegistry::new(BreakerConfig::default(), DiscoveryConfig::default())
}

// Fallback on primary timeout, with attribution of the attempt trail.
#[tokio::test]
async fn fallback_on_primary_timeout() {
    let reg = registry();
    let a = MockAdapter::failing("A", usize::MAX);
    reg.register_adapter(entry("A", 1), a.clone()).await;
    reg.register_adapter(entry("B", 2), MockAdapter::failing("B", 0)).await;

    let outcome = reg
        .execute_with_fallback("compute 2+2", None, &CompletionOptions::default())
        .await
        .unwrap();

    assert_eq!(outcome.winner, "B");
    assert_eq!(outcome.response.content, "4");
    let attempted: Vec<&str> = outcome.attempted.iter().map(|r| r.backend.as_str()).collect();
    assert_eq!(attempted, vec!["A"]);
    assert_eq!(a.state().breaker_snapshot().consecutive_failures, 1);
}

// Breaker opens after five timeouts; the sixth call fails fast.
#[tokio::test]
async fn breaker_opens_after_five_timeouts() {
    let reg = registry();
    let a = MockAdapter::failing("A", usize::MAX);
    reg.register_adapter(entry("A", 1), a.clone()).await;

    for _ in 0..5 {
        let _ = reg.execute_with_fallback("x", None, &CompletionOptions::default()).await;
    }
    let snapshot = a.state().breaker_snapshot();
    assert_eq!(snapshot.consecutive_failures, 5);
    assert!(snapshot.open_for.is_some());

    let started = Instant::now();
    let err = reg
        .execute_with_fallback("x", None, &CompletionOptions::default())
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_millis(100));

    match err {
        GatewayError::AllBackendsFailed { attempts, last } => {
            assert_eq!(attempts.len(), 1);
            assert_eq!(attempts[0].kind, "backend-unavailable");
            assert!(matches!(*last, GatewayError::BackendUnavailable { .. }));
        }
        other => panic!("expected AllBackendsFailed, got {:?}", other),
    }
    // No sixth upstream attempt happened
    assert_eq!(a.calls.load(Ordering::SeqCst), 5);
}

// Proactive rate limiter with truncated-minute reset.
#[test]
fn rate_limiter_proactive_open_and_reset() {
    let rl = RateLimiter::new(
        "premium",
        RateLimitConfig {
            requests_per_minute: 10,
            requests_per_day: 1500,
            tokens_per_minute: 1_000_000,
            threshold: 1.0,
        },
    );
    let now = Utc.with_ymd_and_hms(2026, 8, 1, 10, 0, 30).unwrap();

    for _ in 0..9 {
        rl.record_request_at(now, 1000);
    }

    // 10th check admits (projected 10/10 is not strictly over)
    assert!(rl.check_at(now, 0).is_ok());
    rl.record_request_at(now, 1000);

    // 11th check opens with the RPM attribution
    let err = rl.check_at(now, 0).unwrap_err();
    match err {
        GatewayError::RateLimited { reason } => assert!(reason.contains("RPM threshold"), "{}", reason),
        other => panic!("expected RateLimited, got {:?}", other),
    }

    // Past the minute boundary: counters zeroed, breaker auto-closed
    let next = Utc.with_ymd_and_hms(2026, 8, 1, 10, 1, 0).unwrap();
    assert!(rl.check_at(next, 0).is_ok());
    let (req, tokens, _) = rl.window_counts();
    assert_eq!((req, tokens), (0, 0));
}

const DECOMPOSITION: &str = r#"```json
{"parallel_groups": [
  {"group": 1, "name": "add", "tasks": [
    {"id": "T1", "phase": "RED", "task": "test add"},
    {"id": "T2", "phase": "GREEN", "task": "impl add"}]},
  {"group": 2, "name": "sub", "tasks": [
    {"id": "T3", "phase": "RED", "task": "test sub"},
    {"id": "T4", "phase": "GREEN", "task": "impl sub"}]}
]}
```"#;

async fn orchestrator_on(adapter: Arc<MockAdapter>) -> ParallelOrchestrator {
    let reg = Arc::new(registry());
    reg.register_adapter(entry("worker", 1), adapter).await;
    let router = Arc::new(Router::new(reg, Arc::new(RequestPool::new(8)), MatcherConfig::default()));
    let subagent = Arc::new(SubagentExecutor::new(
        Arc::new(RoleRegistry::builtin()),
        router,
        MatcherConfig::default(),
        None,
    ));
    ParallelOrchestrator::new(subagent, OrchestratorConfig::default())
}

// Orchestrator phase ordering and on-disk artifacts.
#[tokio::test]
async fn orchestrator_phase_ordering_and_artifacts() {
    let order: Arc<std::sync::Mutex<Vec<String>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
    let order_in_reply = order.clone();
    let adapter = MockAdapter::answering("worker", move |prompt| {
        if prompt.contains("parallel workers") {
            DECOMPOSITION.to_string()
        } else if prompt.contains("quality gate") {
            r#"{"verdict": "pass", "score": 95}"#.to_string()
        } else {
            for tag in ["test add", "impl add", "test sub", "impl sub"] {
                if prompt.contains(tag) {
                    order_in_reply.lock().unwrap().push(tag.to_string());
                }
            }
            "done".to_string()
        }
    });

    let work_dir = tempfile::tempdir().unwrap();
    let orchestrator = orchestrator_on(adapter).await;
    let report = orchestrator
        .run(OrchestratorRequest {
            task: "build add and sub".to_string(),
            max_parallel: Some(2),
            work_dir: Some(work_dir.path().to_path_buf()),
            iterate: Some(true),
        })
        .await
        .unwrap();

    assert!(report.reorganized);
    assert_eq!(report.tasks_completed, 4);
    assert!(report.results.values().all(|r| r.success));

    // Every RED task ran before any GREEN task
    let order = order.lock().unwrap();
    let reds: Vec<usize> = order
        .iter()
        .enumerate()
        .filter(|(_, t)| t.starts_with("test"))
        .map(|(i, _)| i)
        .collect();
    let greens: Vec<usize> = order
        .iter()
        .enumerate()
        .filter(|(_, t)| t.starts_with("impl"))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(reds.len(), 2);
    assert_eq!(greens.len(), 2);
    assert!(reds.iter().max() < greens.iter().min());

    for artifact in ["decomposed.json", "results.json", "synthesis.json"] {
        assert!(work_dir.path().join(artifact).exists(), "missing {}", artifact);
    }
    let decomposed: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(work_dir.path().join("decomposed.json")).unwrap()).unwrap();
    assert_eq!(decomposed["_reorganized"], true);
}

// Quality retry carries feedback, and the second review passes.
#[tokio::test]
async fn orchestrator_quality_retry_with_feedback() {
    let reviews = Arc::new(AtomicUsize::new(0));
    let reviews_in_reply = reviews.clone();
    let retry_prompts: Arc<std::sync::Mutex<Vec<String>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
    let retries_in_reply = retry_prompts.clone();

    let adapter = MockAdapter::answering("worker", move |prompt| {
        if prompt.contains("parallel workers") {
            DECOMPOSITION.to_string()
        } else if prompt.contains("quality gate") {
            if reviews_in_reply.fetch_add(1, Ordering::SeqCst) == 0 {
                r#"{"verdict": "iterate", "score": 45, "retry_tasks": ["T2"],
                    "task_issues": {"T2": ["missing null check"]}}"#
                    .to_string()
            } else {
                r#"{"verdict": "pass", "score": 85}"#.to_string()
            }
        } else {
            if prompt.contains("missing null check") {
                retries_in_reply.lock().unwrap().push(prompt.to_string());
            }
            "implementation output".to_string()
        }
    });

    let work_dir = tempfile::tempdir().unwrap();
    let orchestrator = orchestrator_on(adapter).await;
    let report = orchestrator
        .run(OrchestratorRequest {
            task: "build it".to_string(),
            max_parallel: Some(2),
            work_dir: Some(work_dir.path().to_path_buf()),
            iterate: Some(true),
        })
        .await
        .unwrap();

    assert_eq!(report.iterations, 2);
    assert_eq!(report.tasks_completed, report.results.len());
    assert!(!report.quality_gate_failed);
    assert!(report.results["T2"].retried);

    // Exactly one retry, and its prompt carried feedback plus prior output
    let retries = retry_prompts.lock().unwrap();
    assert_eq!(retries.len(), 1);
    assert!(retries[0].contains("missing null check"));
    assert!(retries[0].contains("Previous Output"));

    assert!(work_dir.path().join("quality-1.json").exists());
    assert!(work_dir.path().join("quality-2.json").exists());

    let synthesis: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(work_dir.path().join("synthesis.json")).unwrap()).unwrap();
    assert_eq!(synthesis["iterations"], 2);
    assert_eq!(synthesis["tasks_completed"], 4);
}

// Verdict parser on mixed prose/YAML output.
#[test]
fn verdict_parser_mixed_output() {
    let text = "some prose ... ```yaml\nverdict:\n  status: APPROVE_WITH_CHANGES\n  score: 7\n  reasoning: fine\n``` more prose";
    let verdict = parse_verdict(text).unwrap();

    assert_eq!(verdict.status, VerdictStatus::ApproveWithChanges);
    assert_eq!(verdict.score, 7.0);
    assert_eq!(verdict.reasoning.as_deref(), Some("fine"));

    // Idempotent through the raw map
    let again = parse_verdict(&verdict.raw.to_string()).unwrap();
    assert_eq!(again.status, verdict.status);
    assert_eq!(again.score, verdict.score);
}

// The router never revisits a backend, and attribution names a
// backend whose breaker was closed at reply time.
#[tokio::test]
async fn router_attribution_and_no_revisit() {
    let reg = Arc::new(registry());
    let flaky = MockAdapter::failing("flaky", 1);
    reg.register_adapter(entry("flaky", 1), flaky.clone()).await;
    let steady = MockAdapter::failing("steady", 0);
    reg.register_adapter(entry("steady", 2), steady.clone()).await;

    let router = Router::new(reg, Arc::new(RequestPool::new(2)), MatcherConfig::default());
    let outcome = router
        .route(modelbridge::router::RouteRequest {
            prompt: "hi".to_string(),
            preferred: Some("flaky".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(outcome.winner, "steady");
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    assert!(steady.state().breaker().would_allow());
}

// Wire round-trip over an in-memory transport.
#[tokio::test]
async fn wire_server_round_trip() {
    let gateway = modelbridge::gateway::Gateway::new(Config {
        backends: vec![],
        ..Default::default()
    })
    .await
    .unwrap();
    let dispatcher = modelbridge::wire::ToolDispatcher::new(Arc::new(gateway));

    let input = b"{\"method\": \"health\"}\n{\"method\": \"nope\"}\n" as &[u8];
    let mut output = Vec::new();
    modelbridge::wire::server::serve(&dispatcher, input, &mut output).await.unwrap();

    let lines: Vec<serde_json::Value> = std::str::from_utf8(&output)
        .unwrap()
        .trim()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();

    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["success"], true);
    assert_eq!(lines[1]["success"], false);
    assert_eq!(lines[1]["error_kind"], "invalid-input");
}

// Response JSON round-trip equivalence.
#[test]
fn response_encode_decode_round_trip() {
    let response = BackendResponse {
        content: "answer".to_string(),
        tokens: 17,
        backend: "B".to_string(),
        latency_ms: 42,
        metadata: None,
    };
    let encoded = serde_json::to_string(&response).unwrap();
    let decoded: BackendResponse = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded, response);
}

// Registry register/unregister round-trip through the public API.
#[tokio::test]
async fn registry_round_trip_is_identity() {
    let reg = registry();
    reg.register_adapter(entry("stay", 1), MockAdapter::failing("stay", 0)).await;

    let chain_before = reg.fallback_chain().await;
    let config_before = reg.export_config().await;

    reg.register_adapter(entry("temp", 0), MockAdapter::failing("temp", 0)).await;
    assert_ne!(reg.fallback_chain().await, chain_before);
    assert!(reg.unregister("temp").await);

    assert_eq!(reg.fallback_chain().await, chain_before);
    assert_eq!(reg.export_config().await.len(), config_before.len());
}

// Pool bound holds under an orchestrator-sized run.
#[tokio::test]
async fn orchestrator_respects_slot_bound() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let active_in_reply = active.clone();
    let peak_in_reply = peak.clone();

    let adapter = MockAdapter::answering("worker", move |prompt| {
        if prompt.contains("parallel workers") {
            // Six RED tasks in one declared group
            let tasks: Vec<serde_json::Value> = (0..6)
                .map(|i| json!({"id": format!("R{}", i), "phase": "RED", "task": format!("red {}", i)}))
                .collect();
            json!({"parallel_groups": [{"group": 1, "name": "wide", "tasks": tasks}]}).to_string()
        } else if prompt.contains("quality gate") {
            r#"{"verdict": "pass", "score": 90}"#.to_string()
        } else {
            let now = active_in_reply.fetch_add(1, Ordering::SeqCst) + 1;
            peak_in_reply.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(5));
            active_in_reply.fetch_sub(1, Ordering::SeqCst);
            "done".to_string()
        }
    });

    let work_dir = tempfile::tempdir().unwrap();
    let orchestrator = orchestrator_on(adapter).await;
    let report = orchestrator
        .run(OrchestratorRequest {
            task: "wide batch".to_string(),
            max_parallel: Some(2),
            work_dir: Some(work_dir.path().to_path_buf()),
            iterate: Some(true),
        })
        .await
        .unwrap();

    assert_eq!(report.results.len(), 6);
    // The run pool held the batch to its slot count
    assert!(peak.load(Ordering::SeqCst) <= 2, "peak {}", peak.load(Ordering::SeqCst));
    assert!(report.groups.iter().all(|g| g.tasks.len() <= 2));

    let _: BTreeMap<String, serde_json::Value> =
        serde_json::from_str(&std::fs::read_to_string(work_dir.path().join("results.json")).unwrap()).unwrap();
}
