//! External file-op collaborator contracts
//!
//! The concrete editor (atomic writes, fuzzy matching, backup store) lives
//! outside the gateway; these are the only interfaces through which the core
//! mutates files. The orchestrator's own work-directory artifacts are the
//! single exception.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

/// One operation in an atomic multi-write batch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum WriteOp {
    /// Create or overwrite
    Write { path: PathBuf, content: String },
    /// Append to an existing or new file
    Append { path: PathBuf, content: String },
    /// Replace full content of an existing file
    ModifyFullContent { path: PathBuf, content: String },
}

impl WriteOp {
    pub fn path(&self) -> &Path {
        match self {
            WriteOp::Write { path, .. } | WriteOp::Append { path, .. } | WriteOp::ModifyFullContent { path, .. } => path,
        }
    }
}

/// Per-op result of an atomic multi-write
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteReport {
    pub path: PathBuf,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub bytes_written: u64,
}

/// Fuzzy edit application mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FuzzyEditMode {
    /// Exact match only
    Strict,
    /// Fall back to a fuzzy match above the threshold
    Lenient,
    /// Report what would change without mutating
    DryRun,
}

/// One find/replace pair (already size-validated by the fuzzy guard)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuzzyEditRequest {
    pub find: String,
    pub replace: String,
}

/// Result of a fuzzy-edit call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuzzyEditReport {
    pub applied: usize,
    pub skipped: usize,
    pub dry_run: bool,
    /// Near-miss candidates when alternatives were requested
    pub suggestions: Vec<String>,
    /// Timestamped backup taken before any mutation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<PathBuf>,
}

/// Sidecar metadata for one backup
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupInfo {
    pub id: String,
    pub original_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
}

/// The editor collaborator surface the core consumes.
///
/// Contract notes for implementors: `atomic_multi_write` must back up
/// existing targets first when asked, restore every backup if any op fails,
/// and create missing directories along each path. `fuzzy_edit` must take a
/// timestamped backup before any mutation.
#[async_trait]
pub trait FileOps: Send + Sync {
    async fn atomic_multi_write(&self, ops: &[WriteOp], create_backup: bool) -> Result<Vec<WriteReport>, GatewayError>;

    #[allow(clippy::too_many_arguments)]
    async fn fuzzy_edit(
        &self,
        path: &Path,
        edits: &[FuzzyEditRequest],
        mode: FuzzyEditMode,
        threshold: f64,
        max_suggestions: usize,
        suggest_alternatives: bool,
    ) -> Result<FuzzyEditReport, GatewayError>;

    async fn create_backup(&self, path: &Path) -> Result<BackupInfo, GatewayError>;

    async fn restore_backup(&self, id: &str) -> Result<(), GatewayError>;

    async fn list_backups(&self) -> Result<Vec<BackupInfo>, GatewayError>;

    /// Delete old backups, returning how many were removed
    async fn cleanup_backups(&self, keep: usize) -> Result<usize, GatewayError>;

    /// Expand glob patterns into a deduplicated file list
    fn resolve_patterns(&self, patterns: &[String]) -> Result<Vec<PathBuf>, GatewayError> {
        resolve_patterns(patterns)
    }
}

/// Default glob-based pattern resolution (deduplicated, sorted)
pub fn resolve_patterns(patterns: &[String]) -> Result<Vec<PathBuf>, GatewayError> {
    let mut files = BTreeSet::new();
    for pattern in patterns {
        let matches =
            glob::glob(pattern).map_err(|e| GatewayError::invalid(format!("bad file pattern '{}': {}", pattern, e)))?;
        for path in matches.flatten() {
            if path.is_file() {
                files.insert(path);
            }
        }
    }
    Ok(files.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_op_serde_shape() {
        let op = WriteOp::Write {
            path: PathBuf::from("src/lib.rs"),
            content: "x".to_string(),
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["op"], "write");

        let back: WriteOp = serde_json::from_value(json).unwrap();
        assert_eq!(back.path(), Path::new("src/lib.rs"));
    }

    #[test]
    fn test_resolve_patterns_dedup() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.rs");
        std::fs::write(&file, "fn main() {}").unwrap();

        let pattern = format!("{}/*.rs", dir.path().display());
        // Same pattern twice must not duplicate entries
        let files = resolve_patterns(&[pattern.clone(), pattern]).unwrap();
        assert_eq!(files, vec![file]);
    }

    #[test]
    fn test_resolve_patterns_bad_glob() {
        let err = resolve_patterns(&["[".to_string()]).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidInput { .. }));
    }

    #[test]
    fn test_resolve_patterns_skips_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("keep.txt"), "x").unwrap();

        let files = resolve_patterns(&[format!("{}/*", dir.path().display())]).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("keep.txt"));
    }
}
