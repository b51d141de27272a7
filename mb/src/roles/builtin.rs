//! Built-in role table
//!
//! Treated as configuration data: the gateway never branches on anything in
//! here beyond the fields of [`RoleTemplate`].

use super::{ContextSensitivity, RoleCategory, RoleTemplate};
use crate::capability::{Capability, ContextRoutingRules};

pub(super) fn builtin_roles() -> Vec<RoleTemplate> {
    vec![
        RoleTemplate {
            name: "code-reviewer".to_string(),
            category: RoleCategory::Review,
            description: "Reviews code for correctness, style, and maintainability".to_string(),
            system_prompt: "You are a rigorous code reviewer. Examine the provided code for bugs, \
                            unclear logic, missing error handling, and style issues. Be specific: \
                            cite the file and line for every finding. End with a verdict block:\n\
                            ```yaml\nverdict:\n  status: APPROVE | APPROVE_WITH_CHANGES | REJECT\n  \
                            score: <0-10>\n  reasoning: <one line>\n```"
                .to_string(),
            required_capabilities: vec![Capability::CodeSpecialized, Capability::DeepReasoning],
            context_sensitivity: ContextSensitivity::Medium,
            fallback_order: vec!["coder".to_string(), "local".to_string(), "premium".to_string()],
            max_tokens: 4096,
            requires_verdict: true,
            enable_thinking: false,
            routing_rules: Some(ContextRoutingRules {
                small_task: Some("local".to_string()),
                large_context: Some("premium".to_string()),
            }),
            meta: false,
            suggested_tools: vec!["read_file".to_string(), "grep".to_string()],
            output_format: Some("markdown findings followed by a fenced YAML verdict".to_string()),
        },
        RoleTemplate {
            name: "security-auditor".to_string(),
            category: RoleCategory::Security,
            description: "Audits code for vulnerabilities and unsafe patterns".to_string(),
            system_prompt: "You are a security auditor. Hunt for injection, unsafe deserialization, \
                            path traversal, secrets in code, and missing authentication checks. \
                            Rate severity for each finding. End with a verdict block:\n\
                            ```yaml\nverdict:\n  status: SECURE | VULNERABLE | CRITICAL_ISSUES\n  \
                            score: <0-10>\n  risk_level: low | medium | high | critical\n  \
                            reasoning: <one line>\n```"
                .to_string(),
            required_capabilities: vec![Capability::SecurityFocus, Capability::DeepReasoning],
            context_sensitivity: ContextSensitivity::High,
            fallback_order: vec!["reasoning".to_string(), "premium".to_string(), "local".to_string()],
            max_tokens: 4096,
            requires_verdict: true,
            enable_thinking: true,
            routing_rules: None,
            meta: false,
            suggested_tools: vec!["read_file".to_string(), "grep".to_string()],
            output_format: Some("markdown findings followed by a fenced YAML verdict".to_string()),
        },
        RoleTemplate {
            name: "architect".to_string(),
            category: RoleCategory::Planning,
            description: "Designs module boundaries and plans larger changes".to_string(),
            system_prompt: "You are a software architect. Produce a concrete, incremental plan: \
                            affected modules, new interfaces, migration steps, and risks. Prefer \
                            designs that can ship in small reviewable pieces."
                .to_string(),
            required_capabilities: vec![Capability::DeepReasoning, Capability::LargeContext],
            context_sensitivity: ContextSensitivity::High,
            fallback_order: vec!["reasoning".to_string(), "premium".to_string()],
            max_tokens: 8192,
            requires_verdict: false,
            enable_thinking: true,
            routing_rules: Some(ContextRoutingRules {
                small_task: None,
                large_context: Some("premium".to_string()),
            }),
            meta: false,
            suggested_tools: vec!["read_file".to_string(), "tree".to_string()],
            output_format: None,
        },
        RoleTemplate {
            name: "explorer".to_string(),
            category: RoleCategory::Planning,
            description: "Maps an unfamiliar codebase and reports structure".to_string(),
            system_prompt: "You are exploring a codebase. Identify the entry points, the core \
                            modules and their responsibilities, the dependency direction, and \
                            anything surprising. Output a structured summary a new contributor \
                            could navigate from."
                .to_string(),
            required_capabilities: vec![Capability::LargeContext],
            context_sensitivity: ContextSensitivity::High,
            fallback_order: vec!["premium".to_string(), "local".to_string()],
            max_tokens: 4096,
            requires_verdict: false,
            enable_thinking: false,
            routing_rules: None,
            meta: false,
            suggested_tools: vec!["tree".to_string(), "read_file".to_string(), "grep".to_string()],
            output_format: None,
        },
        RoleTemplate {
            name: "documenter".to_string(),
            category: RoleCategory::Review,
            description: "Writes and improves documentation".to_string(),
            system_prompt: "You write precise technical documentation. Document behavior, not \
                            implementation; include a short example where it helps. Match the \
                            project's existing voice."
                .to_string(),
            required_capabilities: vec![Capability::Documentation],
            context_sensitivity: ContextSensitivity::Low,
            fallback_order: vec!["premium".to_string(), "fast".to_string(), "local".to_string()],
            max_tokens: 4096,
            requires_verdict: false,
            enable_thinking: false,
            routing_rules: None,
            meta: false,
            suggested_tools: vec!["read_file".to_string()],
            output_format: None,
        },
        RoleTemplate {
            name: "implementer".to_string(),
            category: RoleCategory::Generation,
            description: "Implements features and fixes to make tests pass".to_string(),
            system_prompt: "You are implementing code against existing failing tests. Write the \
                            minimal clear implementation that makes the named tests pass without \
                            breaking others. Output complete file contents or precise edits."
                .to_string(),
            required_capabilities: vec![Capability::CodeSpecialized],
            context_sensitivity: ContextSensitivity::Medium,
            fallback_order: vec!["coder".to_string(), "local".to_string(), "fast".to_string()],
            max_tokens: 8192,
            requires_verdict: false,
            enable_thinking: false,
            routing_rules: Some(ContextRoutingRules {
                small_task: Some("local".to_string()),
                large_context: None,
            }),
            meta: false,
            suggested_tools: vec!["read_file".to_string(), "write_file".to_string()],
            output_format: None,
        },
        RoleTemplate {
            name: "test-writer".to_string(),
            category: RoleCategory::Generation,
            description: "Writes failing tests that pin desired behavior".to_string(),
            system_prompt: "You are writing tests first. Produce focused failing tests that pin \
                            the desired behavior described in the task, including edge cases. \
                            Tests must be runnable as written and fail for the right reason."
                .to_string(),
            required_capabilities: vec![Capability::CodeSpecialized, Capability::FastGeneration],
            context_sensitivity: ContextSensitivity::Medium,
            fallback_order: vec!["coder".to_string(), "fast".to_string(), "local".to_string()],
            max_tokens: 8192,
            requires_verdict: false,
            enable_thinking: false,
            routing_rules: None,
            meta: false,
            suggested_tools: vec!["read_file".to_string(), "write_file".to_string()],
            output_format: None,
        },
        RoleTemplate {
            name: "refactorer".to_string(),
            category: RoleCategory::Generation,
            description: "Improves structure without changing behavior".to_string(),
            system_prompt: "You are refactoring with green tests as the safety net. Improve names, \
                            remove duplication, and simplify control flow without changing observable \
                            behavior. Every test that passed before must pass after."
                .to_string(),
            required_capabilities: vec![Capability::CodeSpecialized],
            context_sensitivity: ContextSensitivity::Medium,
            fallback_order: vec!["coder".to_string(), "local".to_string()],
            max_tokens: 8192,
            requires_verdict: false,
            enable_thinking: false,
            routing_rules: None,
            meta: false,
            suggested_tools: vec!["read_file".to_string(), "write_file".to_string()],
            output_format: None,
        },
        RoleTemplate {
            name: "decomposer".to_string(),
            category: RoleCategory::Planning,
            description: "Breaks a task into parallelizable TDD units".to_string(),
            system_prompt: "You decompose a development task into test-driven units that can run \
                            on up to {{max_parallel}} parallel workers. Every unit of work gets a RED \
                            task (write failing tests) and a GREEN task (make them pass); add REFACTOR \
                            tasks only where cleanup is clearly needed.\n\n\
                            Output ONLY JSON of this exact shape:\n\
                            {\"parallel_groups\": [{\"group\": 1, \"name\": \"feature-name\", \
                            \"tasks\": [{\"id\": \"T1\", \"phase\": \"RED\", \"task\": \"...\"}, \
                            {\"id\": \"T2\", \"phase\": \"GREEN\", \"task\": \"...\"}]}]}\n\n\
                            Task ids must be unique across all groups. Keep each task small enough \
                            for one worker to finish independently."
                .to_string(),
            required_capabilities: vec![Capability::DeepReasoning],
            context_sensitivity: ContextSensitivity::Medium,
            fallback_order: vec!["reasoning".to_string(), "premium".to_string(), "local".to_string()],
            max_tokens: 8192,
            requires_verdict: false,
            enable_thinking: true,
            routing_rules: None,
            meta: false,
            suggested_tools: vec![],
            output_format: Some("bare JSON, no prose".to_string()),
        },
        RoleTemplate {
            name: "quality-reviewer".to_string(),
            category: RoleCategory::Review,
            description: "Gates parallel-agent output and names tasks to retry".to_string(),
            system_prompt: "You are the quality gate for a batch of agent task results. Judge \
                            whether the work is coherent and complete as a whole.\n\n\
                            Output ONLY JSON of this exact shape:\n\
                            {\"verdict\": \"pass\" | \"iterate\", \"score\": <0-100>, \
                            \"issues\": [\"...\"], \"retry_tasks\": [\"T2\"], \
                            \"task_issues\": {\"T2\": [\"specific problem\"]}}\n\n\
                            List a task in retry_tasks only when rerunning it with feedback could \
                            fix a concrete problem."
                .to_string(),
            required_capabilities: vec![Capability::DeepReasoning],
            context_sensitivity: ContextSensitivity::Medium,
            fallback_order: vec!["reasoning".to_string(), "premium".to_string(), "local".to_string()],
            max_tokens: 4096,
            requires_verdict: false,
            enable_thinking: false,
            routing_rules: None,
            meta: false,
            suggested_tools: vec![],
            output_format: Some("bare JSON, no prose".to_string()),
        },
        RoleTemplate {
            name: "auto".to_string(),
            category: RoleCategory::Planning,
            description: "Meta role: picks the best concrete role for the task".to_string(),
            system_prompt: "Given a task description and a list of role names, answer with the \
                            single best role name and nothing else."
                .to_string(),
            required_capabilities: vec![],
            context_sensitivity: ContextSensitivity::Low,
            fallback_order: vec![],
            max_tokens: 64,
            requires_verdict: false,
            enable_thinking: false,
            routing_rules: None,
            meta: true,
            suggested_tools: vec![],
            output_format: Some("a single role name".to_string()),
        },
    ]
}
