//! Capability taxonomy and backend-to-requirement matching
//!
//! The capability set is closed; the inference table is ordered with the
//! more specific patterns first, so extending it means reviewing the whole
//! table.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::MatcherConfig;
use crate::error::GatewayError;

/// What a backend/model is suited for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    DeepReasoning,
    FastGeneration,
    LargeContext,
    CodeSpecialized,
    SecurityFocus,
    Documentation,
    /// Marks an orchestrator model: routing decisions only, never worker tasks
    FastRouting,
    General,
}

/// Estimated context demand of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextSize {
    Small,
    Medium,
    Large,
}

/// Context-aware routing overrides carried by a role
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextRoutingRules {
    /// Preferred backend for small tasks
    #[serde(rename = "small-task")]
    pub small_task: Option<String>,

    /// Preferred backend when the task needs a large context window
    #[serde(rename = "large-context")]
    pub large_context: Option<String>,
}

/// Winning backend with its score and the reason it won
#[derive(Debug, Clone)]
pub struct MatchResult {
    pub backend: String,
    pub score: u32,
    pub reason: String,
}

/// Ordered pattern table: every pattern in the entry must appear in the
/// model id for the row to match. First matching row wins.
const CAPABILITY_TABLE: &[(&[&str], &[Capability])] = &[
    (&["orchestrator"], &[Capability::FastRouting]),
    (
        &["deepseek", "r1"],
        &[Capability::DeepReasoning, Capability::LargeContext],
    ),
    (
        &["deepseek", "coder"],
        &[Capability::CodeSpecialized, Capability::DeepReasoning],
    ),
    (
        &["deepseek"],
        &[Capability::CodeSpecialized, Capability::DeepReasoning],
    ),
    (
        &["qwen", "coder"],
        &[Capability::CodeSpecialized, Capability::LargeContext, Capability::FastGeneration],
    ),
    (&["qwen"], &[Capability::General, Capability::LargeContext]),
    (
        &["gemini"],
        &[Capability::LargeContext, Capability::Documentation, Capability::General],
    ),
    (
        &["codestral"],
        &[Capability::CodeSpecialized, Capability::FastGeneration],
    ),
    (&["starcoder"], &[Capability::CodeSpecialized]),
    (
        &["llama", "guard"],
        &[Capability::SecurityFocus, Capability::FastGeneration],
    ),
    (&["llama"], &[Capability::FastGeneration, Capability::General]),
    (&["mistral"], &[Capability::FastGeneration, Capability::General]),
    (&["gpt-oss"], &[Capability::DeepReasoning, Capability::General]),
];

/// Infer capabilities from a model identifier
pub fn infer_capabilities(model_id: &str) -> Vec<Capability> {
    let id = model_id.to_lowercase();
    for (patterns, caps) in CAPABILITY_TABLE {
        if patterns.iter().all(|p| id.contains(p)) {
            return caps.to_vec();
        }
    }
    vec![Capability::General]
}

/// Whether this model/endpoint pair is an orchestrator: id pattern match, or
/// the endpoint serves on one of the configured orchestrator ports.
pub fn is_orchestrator(model_id: &str, endpoint: &str, matcher: &MatcherConfig) -> bool {
    if model_id.to_lowercase().contains("orchestrator") {
        return true;
    }
    endpoint_port(endpoint)
        .map(|port| matcher.orchestrator_ports.contains(&port))
        .unwrap_or(false)
}

fn endpoint_port(endpoint: &str) -> Option<u16> {
    let rest = endpoint.split("://").nth(1).unwrap_or(endpoint);
    let authority = rest.split('/').next()?;
    let port = authority.rsplit(':').next()?;
    if port == authority {
        return None;
    }
    port.parse().ok()
}

/// Heuristic context-size estimate for a task
pub fn estimate_context_size(task: &str, file_pattern_count: usize) -> ContextSize {
    let mut score: i32 = 0;
    let lowered = task.to_lowercase();

    if task.len() > 2000 {
        score += 2;
    } else if task.len() > 500 {
        score += 1;
    }

    if file_pattern_count > 5 {
        score += 2;
    } else if file_pattern_count > 2 {
        score += 1;
    }

    for marker in ["entire codebase", "whole codebase", "comprehensive", "architecture review", "all files"] {
        if lowered.contains(marker) {
            score += 3;
        }
    }
    for marker in ["single function", "one function", "quick review", "single file", "small change"] {
        if lowered.contains(marker) {
            score -= 2;
        }
    }

    if score >= 5 {
        ContextSize::Large
    } else if score >= 2 {
        ContextSize::Medium
    } else {
        ContextSize::Small
    }
}

/// Score one backend's capabilities against the requirements.
///
/// Orchestrator-tagged backends score zero outright. With no requirements
/// every non-orchestrator backend scores the 50-point base. Otherwise the
/// score is the percent of required capabilities present, plus up to 15
/// bonus points for additional useful capabilities.
pub fn score_backend(required: &[Capability], caps: &[Capability]) -> u32 {
    if caps.contains(&Capability::FastRouting) {
        return 0;
    }
    if required.is_empty() {
        return 50;
    }

    let matched = required.iter().filter(|r| caps.contains(*r)).count();
    let base = (matched * 100 / required.len()) as u32;
    let extras = caps
        .iter()
        .filter(|&&c| !required.contains(&c) && c != Capability::General)
        .count();
    base + (extras as u32 * 5).min(15)
}

/// Choose the best backend for a set of required capabilities.
///
/// `caps_of` supplies each candidate's capability set (the local backend's
/// caps are dynamic on whichever model is loaded, so this is a callback,
/// not a table).
pub fn find_best_backend(
    required: &[Capability],
    available: &[String],
    fallback_order: &[String],
    context_size: ContextSize,
    routing_rules: Option<&ContextRoutingRules>,
    caps_of: &dyn Fn(&str) -> Vec<Capability>,
) -> Result<MatchResult, GatewayError> {
    // 1. Context routing rules short-circuit scoring entirely
    if let Some(rules) = routing_rules {
        let preference = match context_size {
            ContextSize::Small => rules.small_task.as_ref().map(|b| (b, "small-task routing rule")),
            ContextSize::Large => rules.large_context.as_ref().map(|b| (b, "large-context routing rule")),
            ContextSize::Medium => None,
        };
        if let Some((backend, reason)) = preference
            && available.iter().any(|a| a == backend)
        {
            return Ok(MatchResult {
                backend: backend.clone(),
                score: u32::MAX,
                reason: reason.to_string(),
            });
        }
    }

    // 2. Capability-scored winner
    let mut best: Option<MatchResult> = None;
    for name in available {
        let caps = caps_of(name);
        let score = score_backend(required, &caps);
        debug!(backend = %name, score, ?caps, "Capability score");
        if score > 0 && best.as_ref().map(|b| score > b.score).unwrap_or(true) {
            best = Some(MatchResult {
                backend: name.clone(),
                score,
                reason: format!("capability score {}", score),
            });
        }
    }
    if let Some(winner) = best {
        return Ok(winner);
    }

    // 3. The role's own fallback order
    for name in fallback_order {
        if available.iter().any(|a| a == name) {
            return Ok(MatchResult {
                backend: name.clone(),
                score: 0,
                reason: "role fallback order".to_string(),
            });
        }
    }

    // 4. Ultimate fallback: a local backend if one is present at all
    if available.iter().any(|a| a == "local") {
        return Ok(MatchResult {
            backend: "local".to_string(),
            score: 0,
            reason: "ultimate local fallback".to_string(),
        });
    }

    Err(GatewayError::invalid("no suitable backend for required capabilities"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_orchestrator_only() {
        assert_eq!(infer_capabilities("qwen-orchestrator-v2"), vec![Capability::FastRouting]);
    }

    #[test]
    fn test_infer_specific_before_general() {
        // "deepseek-r1" must hit the r1 row, not the bare deepseek row
        let caps = infer_capabilities("deepseek-ai/DeepSeek-R1");
        assert!(caps.contains(&Capability::DeepReasoning));
        assert!(caps.contains(&Capability::LargeContext));
        assert!(!caps.contains(&Capability::CodeSpecialized));

        let caps = infer_capabilities("qwen3-coder-30b");
        assert!(caps.contains(&Capability::CodeSpecialized));
    }

    #[test]
    fn test_infer_unmatched_is_general() {
        assert_eq!(infer_capabilities("totally-unknown-model"), vec![Capability::General]);
    }

    #[test]
    fn test_is_orchestrator_by_port() {
        let matcher = MatcherConfig::default();
        assert!(is_orchestrator("some-model", "http://127.0.0.1:8090", &matcher));
        assert!(is_orchestrator("llama-orchestrator", "http://127.0.0.1:1234", &matcher));
        assert!(!is_orchestrator("llama-3.3", "http://127.0.0.1:1234", &matcher));
        assert!(!is_orchestrator("llama-3.3", "https://api.groq.com/openai", &matcher));
    }

    #[test]
    fn test_estimate_context_size() {
        assert_eq!(estimate_context_size("fix this single function", 0), ContextSize::Small);
        assert_eq!(estimate_context_size(&"x".repeat(600), 3), ContextSize::Medium);
        assert_eq!(
            estimate_context_size("comprehensive architecture review of the entire codebase", 8),
            ContextSize::Large
        );
    }

    #[test]
    fn test_score_empty_required_is_base_50() {
        assert_eq!(score_backend(&[], &[Capability::General]), 50);
        assert_eq!(score_backend(&[], &[Capability::FastRouting]), 0);
    }

    #[test]
    fn test_score_full_match_with_bonus() {
        let required = [Capability::CodeSpecialized];
        let caps = [Capability::CodeSpecialized, Capability::DeepReasoning, Capability::LargeContext];
        // 100% match + 2 extras * 5
        assert_eq!(score_backend(&required, &caps), 110);
    }

    #[test]
    fn test_score_bonus_capped_at_15() {
        let required = [Capability::CodeSpecialized];
        let caps = [
            Capability::CodeSpecialized,
            Capability::DeepReasoning,
            Capability::LargeContext,
            Capability::FastGeneration,
            Capability::SecurityFocus,
            Capability::Documentation,
        ];
        assert_eq!(score_backend(&required, &caps), 115);
    }

    fn caps_table(name: &str) -> Vec<Capability> {
        match name {
            "local" => vec![Capability::CodeSpecialized, Capability::FastGeneration],
            "router-box" => vec![Capability::FastRouting],
            "coder" => vec![Capability::CodeSpecialized, Capability::DeepReasoning],
            "fast" => vec![Capability::FastGeneration, Capability::General],
            _ => vec![Capability::General],
        }
    }

    #[test]
    fn test_find_best_scores_and_picks_winner() {
        let available = vec!["local".to_string(), "coder".to_string(), "fast".to_string()];
        let result = find_best_backend(
            &[Capability::CodeSpecialized, Capability::DeepReasoning],
            &available,
            &[],
            ContextSize::Small,
            None,
            &caps_table,
        )
        .unwrap();
        assert_eq!(result.backend, "coder");
    }

    #[test]
    fn test_orchestrator_never_beats_worker() {
        // A fast-routing backend is not selected while any worker exists
        let available = vec!["router-box".to_string(), "fast".to_string()];
        let result = find_best_backend(
            &[Capability::DeepReasoning],
            &available,
            &[],
            ContextSize::Small,
            None,
            &caps_table,
        )
        .unwrap();
        assert_eq!(result.backend, "fast");
    }

    #[test]
    fn test_routing_rule_short_circuits() {
        let rules = ContextRoutingRules {
            small_task: Some("fast".to_string()),
            large_context: Some("coder".to_string()),
        };
        let available = vec!["local".to_string(), "coder".to_string(), "fast".to_string()];

        let small = find_best_backend(&[], &available, &[], ContextSize::Small, Some(&rules), &caps_table).unwrap();
        assert_eq!(small.backend, "fast");
        assert!(small.reason.contains("small-task"));

        let large = find_best_backend(&[], &available, &[], ContextSize::Large, Some(&rules), &caps_table).unwrap();
        assert_eq!(large.backend, "coder");
    }

    #[test]
    fn test_routing_rule_ignored_when_unavailable() {
        let rules = ContextRoutingRules {
            small_task: Some("gone".to_string()),
            large_context: None,
        };
        let available = vec!["fast".to_string()];
        let result = find_best_backend(&[], &available, &[], ContextSize::Small, Some(&rules), &caps_table).unwrap();
        assert_eq!(result.backend, "fast");
    }

    #[test]
    fn test_fallback_order_when_all_score_zero() {
        // Only an orchestrator is available: scoring yields nothing, the
        // role's fallback order applies
        let available = vec!["router-box".to_string()];
        let result = find_best_backend(
            &[Capability::DeepReasoning],
            &available,
            &["router-box".to_string()],
            ContextSize::Small,
            None,
            &caps_table,
        )
        .unwrap();
        assert_eq!(result.backend, "router-box");
        assert_eq!(result.score, 0);
    }

    #[test]
    fn test_no_suitable_backend_errors() {
        let err = find_best_backend(
            &[Capability::DeepReasoning],
            &["router-box".to_string()],
            &[],
            ContextSize::Small,
            None,
            &caps_table,
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidInput { .. }));
    }

    #[test]
    fn test_empty_required_prefers_first_listed() {
        // Equal 50-point scores: the first available backend wins
        let available = vec!["fast".to_string(), "coder".to_string()];
        let result = find_best_backend(&[], &available, &[], ContextSize::Small, None, &caps_table).unwrap();
        assert_eq!(result.backend, "fast");
        assert_eq!(result.score, 50);
    }
}
