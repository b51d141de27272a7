//! Role registry
//!
//! Read-only table of role templates: prompt, required capabilities,
//! fallback order, token budget. Roles are data, not code - the orchestrator
//! and subagent executor consume them but never mutate them. The slot-count
//! value (`{{max_parallel}}`) is the only placeholder ever substituted.

use std::collections::BTreeMap;

use handlebars::Handlebars;
use serde::{Deserialize, Serialize};

use crate::capability::{Capability, ContextRoutingRules};
use crate::error::GatewayError;

mod builtin;

/// Role category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleCategory {
    Review,
    Security,
    Planning,
    Generation,
}

impl std::fmt::Display for RoleCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Review => write!(f, "review"),
            Self::Security => write!(f, "security"),
            Self::Planning => write!(f, "planning"),
            Self::Generation => write!(f, "generation"),
        }
    }
}

/// How much surrounding context the role needs to do its job well
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextSensitivity {
    Low,
    Medium,
    High,
}

/// One role template (opaque configuration record)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleTemplate {
    pub name: String,
    pub category: RoleCategory,
    pub description: String,

    /// System prompt; may reference `{{max_parallel}}`
    pub system_prompt: String,

    pub required_capabilities: Vec<Capability>,
    pub context_sensitivity: ContextSensitivity,

    /// Ordered backend names to fall back to when scoring finds nothing
    pub fallback_order: Vec<String>,

    /// Output-token budget
    pub max_tokens: u32,

    pub requires_verdict: bool,
    pub enable_thinking: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing_rules: Option<ContextRoutingRules>,

    /// Meta roles (auto) trigger a selection step instead of running directly
    pub meta: bool,

    pub suggested_tools: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_format: Option<String>,
}

/// Read-only registry of role templates
pub struct RoleRegistry {
    roles: BTreeMap<String, RoleTemplate>,
    renderer: Handlebars<'static>,
}

impl RoleRegistry {
    /// Build the registry with the built-in role table
    pub fn builtin() -> Self {
        let mut renderer = Handlebars::new();
        renderer.register_escape_fn(handlebars::no_escape);

        let mut roles = BTreeMap::new();
        for role in builtin::builtin_roles() {
            roles.insert(role.name.clone(), role);
        }

        Self { roles, renderer }
    }

    /// Exact lookup, case-insensitive
    pub fn get(&self, name: &str) -> Option<&RoleTemplate> {
        let lowered = name.to_lowercase();
        self.roles.get(&lowered).or_else(|| {
            self.roles
                .values()
                .find(|r| r.name.eq_ignore_ascii_case(name))
        })
    }

    /// All roles in name order
    pub fn list(&self) -> Vec<&RoleTemplate> {
        self.roles.values().collect()
    }

    /// All role names in name order
    pub fn names(&self) -> Vec<&str> {
        self.roles.keys().map(String::as_str).collect()
    }

    pub fn list_by_category(&self, category: RoleCategory) -> Vec<&RoleTemplate> {
        self.roles.values().filter(|r| r.category == category).collect()
    }

    /// Nearest known role name by edit distance, for typo suggestions
    pub fn nearest(&self, name: &str) -> Option<&str> {
        let lowered = name.to_lowercase();
        self.roles
            .keys()
            .map(|candidate| (candidate, levenshtein(&lowered, candidate)))
            .min_by_key(|(_, distance)| *distance)
            .filter(|(_, distance)| *distance <= 5)
            .map(|(candidate, _)| candidate.as_str())
    }

    /// Render a role's system prompt, substituting the slot count
    pub fn render_prompt(&self, role: &RoleTemplate, max_parallel: u32) -> Result<String, GatewayError> {
        self.renderer
            .render_template(&role.system_prompt, &serde_json::json!({ "max_parallel": max_parallel }))
            .map_err(|e| GatewayError::Misconfigured(format!("role '{}' template render failed: {}", role.name, e)))
    }
}

/// Classic two-row Levenshtein distance
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            curr[j + 1] = (prev[j + 1] + 1).min(curr[j] + 1).min(prev[j] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_roles_present() {
        let registry = RoleRegistry::builtin();
        for name in [
            "code-reviewer",
            "security-auditor",
            "architect",
            "explorer",
            "documenter",
            "implementer",
            "test-writer",
            "refactorer",
            "decomposer",
            "quality-reviewer",
            "auto",
        ] {
            assert!(registry.get(name).is_some(), "missing role {}", name);
        }
    }

    #[test]
    fn test_get_case_insensitive() {
        let registry = RoleRegistry::builtin();
        assert!(registry.get("Code-Reviewer").is_some());
        assert!(registry.get("CODE-REVIEWER").is_some());
        assert!(registry.get("no-such-role").is_none());
    }

    #[test]
    fn test_list_by_category() {
        let registry = RoleRegistry::builtin();
        let security = registry.list_by_category(RoleCategory::Security);
        assert!(security.iter().any(|r| r.name == "security-auditor"));
        assert!(security.iter().all(|r| r.category == RoleCategory::Security));
    }

    #[test]
    fn test_nearest_suggestion() {
        let registry = RoleRegistry::builtin();
        assert_eq!(registry.nearest("code-reviwer"), Some("code-reviewer"));
        assert_eq!(registry.nearest("test-writter"), Some("test-writer"));
    }

    #[test]
    fn test_only_auto_is_meta() {
        let registry = RoleRegistry::builtin();
        let metas: Vec<_> = registry.list().into_iter().filter(|r| r.meta).collect();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].name, "auto");
    }

    #[test]
    fn test_decomposer_slot_placeholder_renders() {
        let registry = RoleRegistry::builtin();
        let decomposer = registry.get("decomposer").unwrap();
        assert!(decomposer.system_prompt.contains("{{max_parallel}}"));

        let rendered = registry.render_prompt(decomposer, 4).unwrap();
        assert!(rendered.contains('4'));
        assert!(!rendered.contains("{{max_parallel}}"));
    }

    #[test]
    fn test_verdict_roles() {
        let registry = RoleRegistry::builtin();
        assert!(registry.get("code-reviewer").unwrap().requires_verdict);
        assert!(registry.get("security-auditor").unwrap().requires_verdict);
        assert!(!registry.get("implementer").unwrap().requires_verdict);
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
        assert_eq!(levenshtein("reviewer", "reviwer"), 1);
    }
}
