//! Tolerant verdict parser
//!
//! Extracts a normalized structured judgment from free-form model output.
//! Strategy order: fenced YAML/JSON block (or bare JSON), markdown "Verdict"
//! bullet section, then key-value regex scans. Returns `None` when nothing
//! identifiable is found.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Normalized verdict statuses (closed set)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerdictStatus {
    Approve,
    ApproveWithChanges,
    Reject,
    Secure,
    Vulnerable,
    CriticalIssues,
    Pass,
    Fail,
    Warning,
}

impl VerdictStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "APPROVE",
            Self::ApproveWithChanges => "APPROVE_WITH_CHANGES",
            Self::Reject => "REJECT",
            Self::Secure => "SECURE",
            Self::Vulnerable => "VULNERABLE",
            Self::CriticalIssues => "CRITICAL_ISSUES",
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Warning => "WARNING",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_uppercase().replace([' ', '-'], "_");
        match normalized.as_str() {
            "APPROVE" | "APPROVED" => Some(Self::Approve),
            "APPROVE_WITH_CHANGES" => Some(Self::ApproveWithChanges),
            "REJECT" | "REJECTED" => Some(Self::Reject),
            "SECURE" => Some(Self::Secure),
            "VULNERABLE" => Some(Self::Vulnerable),
            "CRITICAL_ISSUES" => Some(Self::CriticalIssues),
            "PASS" | "PASSED" => Some(Self::Pass),
            "FAIL" | "FAILED" => Some(Self::Fail),
            "WARNING" => Some(Self::Warning),
            _ => None,
        }
    }
}

/// Normalized structured judgment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub status: VerdictStatus,
    /// Clamped to [0, 10]
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<String>,
    /// The key-value map the verdict was normalized from
    pub raw: Value,
}

/// Parse a verdict out of free-form model output
pub fn parse_verdict(text: &str) -> Option<Verdict> {
    if let Some(verdict) = from_structured_block(text) {
        return Some(verdict);
    }
    if let Some(verdict) = from_markdown_section(text) {
        return Some(verdict);
    }
    from_keyvalue_scan(text)
}

/// Strategy (a): fenced YAML/JSON block, or the whole text as bare JSON/YAML
fn from_structured_block(text: &str) -> Option<Verdict> {
    let candidate = extract_fenced(text).unwrap_or(text.trim());

    // YAML is a superset of JSON, so one parser covers both shapes
    let doc: serde_yaml::Value = serde_yaml::from_str(candidate).ok()?;
    let doc = yaml_to_json(doc);

    // Accept either a flat map or one nested under a "verdict" key
    let map = match &doc {
        Value::Object(map) => {
            if let Some(Value::Object(inner)) = map.get("verdict") {
                inner.clone()
            } else {
                map.clone()
            }
        }
        _ => return None,
    };

    normalize(&map)
}

/// Strategy (b): a markdown "Verdict" heading followed by bullet key-values
fn from_markdown_section(text: &str) -> Option<Verdict> {
    let heading =
        regex(r"(?im)^(?:#+\s*|\*\*)verdict(?:\*\*)?\s*:?\s*$").find(text)?;

    let mut map = Map::new();
    for line in text[heading.end()..].lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            if map.is_empty() {
                continue;
            }
            break;
        }
        let Some(rest) = trimmed.strip_prefix('-').or_else(|| trimmed.strip_prefix('*')) else {
            break;
        };
        if let Some((key, value)) = rest.split_once(':') {
            map.insert(
                key.trim().trim_matches('*').to_lowercase().replace(' ', "_"),
                Value::String(value.trim().to_string()),
            );
        }
    }

    normalize(&map)
}

/// Strategy (c): bare `Status:` / `Score:` / `Risk Level:` / `Reasoning:` lines
fn from_keyvalue_scan(text: &str) -> Option<Verdict> {
    let mut map = Map::new();

    if let Some(c) = regex(r"(?im)^\s*\**status\**\s*:\s*([A-Za-z_ -]+?)\s*$").captures(text) {
        map.insert("status".to_string(), Value::String(c[1].to_string()));
    }
    if let Some(c) = regex(r"(?im)\**score\**\s*:\s*(\d+(?:\.\d+)?)").captures(text) {
        map.insert("score".to_string(), Value::String(c[1].to_string()));
    }
    if let Some(c) = regex(r"(?im)\**risk[ _]level\**\s*:\s*([A-Za-z_ -]+?)\s*$").captures(text) {
        map.insert("risk_level".to_string(), Value::String(c[1].to_string()));
    }
    if let Some(c) = regex(r"(?im)\**reasoning\**\s*:\s*(.+?)\s*$").captures(text) {
        map.insert("reasoning".to_string(), Value::String(c[1].to_string()));
    }

    normalize(&map)
}

/// Build the normalized verdict from an extracted key-value map.
/// The status is the anchor: without one there is no verdict.
fn normalize(map: &Map<String, Value>) -> Option<Verdict> {
    let status_raw = map.get("status").and_then(value_as_string)?;
    let status = VerdictStatus::parse(&status_raw)?;

    let score = map
        .get("score")
        .and_then(|v| match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().trim_end_matches("/10").trim().parse().ok(),
            _ => None,
        })
        .unwrap_or(0.0)
        .clamp(0.0, 10.0);

    let reasoning = map.get("reasoning").and_then(value_as_string);
    let risk_level = map.get("risk_level").and_then(value_as_string);

    Some(Verdict {
        status,
        score,
        reasoning,
        risk_level,
        raw: Value::Object(map.clone()),
    })
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn extract_fenced(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after_open = &text[open + 3..];
    let close = after_open.find("```")?;
    let block = &after_open[..close];
    match block.find('\n') {
        Some(newline) if block[..newline].trim().chars().all(|c| c.is_alphanumeric()) => Some(&block[newline + 1..]),
        _ => Some(block),
    }
}

fn yaml_to_json(value: serde_yaml::Value) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn regex(pattern: &str) -> Regex {
    Regex::new(pattern).expect("static regex must compile")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fenced_yaml_in_prose() {
        // Mixed prose around a fenced YAML verdict
        let text = "some prose ... ```yaml\nverdict:\n  status: APPROVE_WITH_CHANGES\n  score: 7\n  reasoning: fine\n``` more prose";
        let verdict = parse_verdict(text).unwrap();

        assert_eq!(verdict.status, VerdictStatus::ApproveWithChanges);
        assert_eq!(verdict.score, 7.0);
        assert_eq!(verdict.reasoning.as_deref(), Some("fine"));
        assert!(verdict.raw.is_object());
    }

    #[test]
    fn test_bare_json_object() {
        let text = r#"{"status": "SECURE", "score": 9, "risk_level": "low"}"#;
        let verdict = parse_verdict(text).unwrap();
        assert_eq!(verdict.status, VerdictStatus::Secure);
        assert_eq!(verdict.risk_level.as_deref(), Some("low"));
    }

    #[test]
    fn test_idempotent_through_raw() {
        // Re-parsing the serialized raw map yields the same verdict
        let text = "```yaml\nverdict:\n  status: REJECT\n  score: 2\n  reasoning: broken build\n```";
        let first = parse_verdict(text).unwrap();
        let second = parse_verdict(&first.raw.to_string()).unwrap();

        assert_eq!(first.status, second.status);
        assert_eq!(first.score, second.score);
        assert_eq!(first.reasoning, second.reasoning);
    }

    #[test]
    fn test_markdown_bullet_section() {
        let text = "Findings above.\n\n## Verdict\n- Status: PASS\n- Score: 8\n- Reasoning: all checks green\n\nFooter.";
        let verdict = parse_verdict(text).unwrap();
        assert_eq!(verdict.status, VerdictStatus::Pass);
        assert_eq!(verdict.score, 8.0);
        assert_eq!(verdict.reasoning.as_deref(), Some("all checks green"));
    }

    #[test]
    fn test_keyvalue_scan() {
        let text = "Summary of the audit.\nStatus: VULNERABLE\nScore: 3\nRisk Level: high\nReasoning: injection in query builder";
        let verdict = parse_verdict(text).unwrap();
        assert_eq!(verdict.status, VerdictStatus::Vulnerable);
        assert_eq!(verdict.score, 3.0);
        assert_eq!(verdict.risk_level.as_deref(), Some("high"));
    }

    #[test]
    fn test_score_clamped_and_slash_ten() {
        let verdict = parse_verdict("Status: PASS\nScore: 25").unwrap();
        assert_eq!(verdict.score, 10.0);

        let verdict = parse_verdict("## Verdict\n- Status: PASS\n- Score: 7/10").unwrap();
        assert_eq!(verdict.score, 7.0);
    }

    #[test]
    fn test_status_normalization() {
        assert_eq!(VerdictStatus::parse("approve with changes"), Some(VerdictStatus::ApproveWithChanges));
        assert_eq!(VerdictStatus::parse("critical-issues"), Some(VerdictStatus::CriticalIssues));
        assert_eq!(VerdictStatus::parse("passed"), Some(VerdictStatus::Pass));
        assert_eq!(VerdictStatus::parse("maybe"), None);
    }

    #[test]
    fn test_nothing_identifiable_is_none() {
        assert!(parse_verdict("just some prose about code").is_none());
        assert!(parse_verdict("").is_none());
        // A score without a status is not a verdict
        assert!(parse_verdict("Score: 9").is_none());
    }

    #[test]
    fn test_missing_score_defaults_zero() {
        let verdict = parse_verdict("Status: WARNING").unwrap();
        assert_eq!(verdict.score, 0.0);
    }
}
