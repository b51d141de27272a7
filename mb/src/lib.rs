//! modelbridge - multi-backend AI inference gateway
//!
//! Sits between a client (editor assistant, IDE, automation) and a
//! heterogeneous pool of LLM endpoints, routing each request to the most
//! appropriate backend under correctness, safety, and throughput
//! constraints. Exposes a tool-style RPC surface over line-delimited JSON
//! on stdio.
//!
//! # Core Subsystems
//!
//! - [`backend`] - adapter contract, per-endpoint circuit breakers, and the
//!   named registry with its priority-ordered fallback chain
//! - [`capability`] - capability taxonomy and backend-to-requirement scoring
//! - [`guard`] - proactive rate limiter, bounded request pool, and the
//!   fuzzy-edit complexity guard
//! - [`router`] - capability-aware fallback executor
//! - [`roles`] / [`subagent`] - role templates and role-bound execution
//! - [`orchestrator`] - decompose / regroup / execute / quality-gate workflow
//! - [`repair`] / [`verdict`] - tolerant extraction of structured output
//! - [`wire`] - tool dispatcher and stdio server

pub mod backend;
pub mod capability;
pub mod cli;
pub mod config;
pub mod error;
pub mod fileops;
pub mod gateway;
pub mod guard;
pub mod orchestrator;
pub mod repair;
pub mod roles;
pub mod router;
pub mod subagent;
pub mod verdict;
pub mod wire;

// Re-export commonly used types
pub use backend::{
    BackendAdapter, BackendRegistry, BackendResponse, BreakerState, CircuitBreaker, CompletionOptions,
    FallbackOutcome, HealthStatus,
};
pub use capability::{Capability, ContextSize, estimate_context_size, find_best_backend, infer_capabilities};
pub use config::{BackendEntry, BackendKind, Config};
pub use error::{AttemptRecord, GatewayError};
pub use gateway::Gateway;
pub use guard::{FuzzyGuard, PoolPriority, RateLimiter, RequestPool};
pub use orchestrator::{OrchestratorReport, OrchestratorRequest, ParallelOrchestrator, TaskPhase};
pub use repair::parse_llm_json;
pub use roles::{RoleRegistry, RoleTemplate};
pub use router::{RouteRequest, Router};
pub use subagent::{SubagentExecutor, SubagentReport, SubagentRequest};
pub use verdict::{Verdict, VerdictStatus, parse_verdict};
