//! Structural edit limits and the scope check run before edit-capable stages.

use crate::errors::{ConfigError, StageError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};

/// Structural limits on the edits an execution may make.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    max_files: usize,
    max_lines_per_file: usize,
    max_hunks_per_file: usize,
    allowed_file_types: BTreeSet<String>,
    excluded_paths: BTreeSet<String>,
}

impl Default for Scope {
    fn default() -> Self {
        Self {
            max_files: 10,
            max_lines_per_file: 500,
            max_hunks_per_file: 20,
            allowed_file_types: BTreeSet::new(),
            excluded_paths: BTreeSet::new(),
        }
    }
}

fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_ascii_lowercase()
}

/// Lexically normalises a workspace-relative path.
///
/// Returns `None` for absolute paths and paths that climb above the root.
fn workspace_relative(path: &str) -> Option<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => normalized.push(part),
            Component::ParentDir => {
                if !normalized.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(normalized)
}

fn positive(field: &'static str, value: usize) -> Result<usize, ConfigError> {
    if value == 0 {
        Err(ConfigError::Zero { field })
    } else {
        Ok(value)
    }
}

impl Scope {
    /// Creates a scope with no file-type or path restrictions.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Zero` if any limit is zero.
    pub fn new(
        max_files: usize,
        max_lines_per_file: usize,
        max_hunks_per_file: usize,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            max_files: positive("max_files", max_files)?,
            max_lines_per_file: positive("max_lines_per_file", max_lines_per_file)?,
            max_hunks_per_file: positive("max_hunks_per_file", max_hunks_per_file)?,
            allowed_file_types: BTreeSet::new(),
            excluded_paths: BTreeSet::new(),
        })
    }

    /// Restricts edits to the given extensions (with or without leading dot).
    #[must_use]
    pub fn with_allowed_file_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.allowed_file_types = types
            .into_iter()
            .map(|t| normalize_extension(t.as_ref()))
            .filter(|t| !t.is_empty())
            .collect();
        self
    }

    /// Forbids edits below the given path prefixes.
    #[must_use]
    pub fn with_excluded_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    /// Maximum number of files per edit.
    #[must_use]
    pub fn max_files(&self) -> usize {
        self.max_files
    }

    /// Maximum changed lines per file.
    #[must_use]
    pub fn max_lines_per_file(&self) -> usize {
        self.max_lines_per_file
    }

    /// Maximum hunks per file.
    #[must_use]
    pub fn max_hunks_per_file(&self) -> usize {
        self.max_hunks_per_file
    }

    /// Allowed extensions; empty means any.
    #[must_use]
    pub fn allowed_file_types(&self) -> &BTreeSet<String> {
        &self.allowed_file_types
    }

    /// Excluded path prefixes.
    #[must_use]
    pub fn excluded_paths(&self) -> &BTreeSet<String> {
        &self.excluded_paths
    }

    /// Returns a copy with the numeric limits scaled by `factor`, floor 1.
    ///
    /// Limits never grow, whatever the factor.
    #[must_use]
    pub fn narrowed(&self, factor: f64) -> Self {
        let scale = |v: usize| -> usize {
            #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let scaled = (v as f64 * factor).floor() as usize;
            scaled.clamp(1, v.max(1))
        };
        Self {
            max_files: scale(self.max_files),
            max_lines_per_file: scale(self.max_lines_per_file),
            max_hunks_per_file: scale(self.max_hunks_per_file),
            allowed_file_types: self.allowed_file_types.clone(),
            excluded_paths: self.excluded_paths.clone(),
        }
    }

    /// Returns true if every numeric limit of `self` is at most `other`'s.
    #[must_use]
    pub fn fits_within(&self, other: &Self) -> bool {
        self.max_files <= other.max_files
            && self.max_lines_per_file <= other.max_lines_per_file
            && self.max_hunks_per_file <= other.max_hunks_per_file
    }

    /// Paths outside the workspace root count as excluded.
    fn is_excluded(&self, path: &str) -> bool {
        let Some(candidate) = workspace_relative(path) else {
            return true;
        };
        self.excluded_paths.iter().any(|prefix| {
            workspace_relative(prefix).is_some_and(|prefix| candidate.starts_with(prefix))
        })
    }

    fn is_allowed_type(&self, path: &str) -> bool {
        if self.allowed_file_types.is_empty() {
            return true;
        }
        Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .map(normalize_extension)
            .is_some_and(|ext| self.allowed_file_types.contains(&ext))
    }
}

/// Loosely-typed scope limits as they arrive in a request payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeLimits {
    /// Maximum files.
    #[serde(default)]
    pub max_files: Option<i64>,
    /// Maximum lines per file.
    #[serde(default)]
    pub max_lines_per_file: Option<i64>,
    /// Maximum hunks per file.
    #[serde(default)]
    pub max_hunks_per_file: Option<i64>,
    /// Allowed extensions.
    #[serde(default)]
    pub allowed_file_types: Vec<String>,
    /// Excluded path prefixes.
    #[serde(default)]
    pub excluded_paths: Vec<String>,
}

fn limit(field: &'static str, value: Option<i64>, fallback: usize) -> Result<usize, ConfigError> {
    match value {
        None => Ok(fallback),
        Some(v) if v < 0 => Err(ConfigError::Negative { field, value: v }),
        Some(v) => usize::try_from(v).map_err(|_| ConfigError::OutOfRange {
            field,
            reason: format!("{v} does not fit in usize"),
        }),
    }
}

impl ScopeLimits {
    /// Validates the limits into a scope.
    ///
    /// # Errors
    ///
    /// Returns an error for negative or zero limits.
    pub fn into_scope(self, defaults: &Scope) -> Result<Scope, ConfigError> {
        let scope = Scope::new(
            limit("max_files", self.max_files, defaults.max_files)?,
            limit("max_lines_per_file", self.max_lines_per_file, defaults.max_lines_per_file)?,
            limit("max_hunks_per_file", self.max_hunks_per_file, defaults.max_hunks_per_file)?,
        )?;
        let allowed = if self.allowed_file_types.is_empty() {
            defaults.allowed_file_types.iter().cloned().collect()
        } else {
            self.allowed_file_types
        };
        let excluded = if self.excluded_paths.is_empty() {
            defaults.excluded_paths.iter().cloned().collect()
        } else {
            self.excluded_paths
        };
        Ok(scope
            .with_allowed_file_types(allowed)
            .with_excluded_paths(excluded))
    }
}

/// A single file touched by a proposed edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEdit {
    /// Path of the file, relative to the workspace root.
    pub path: String,
    /// Number of changed lines.
    pub lines_changed: usize,
    /// Number of hunks.
    pub hunks: usize,
}

impl FileEdit {
    /// Creates a file edit.
    #[must_use]
    pub fn new(path: impl Into<String>, lines_changed: usize, hunks: usize) -> Self {
        Self {
            path: path.into(),
            lines_changed,
            hunks,
        }
    }
}

/// The set of file changes an edit-capable stage intends to make.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposedEdit {
    /// Files to be edited.
    pub files: Vec<FileEdit>,
}

impl ProposedEdit {
    /// Creates a proposed edit.
    #[must_use]
    pub fn new(files: Vec<FileEdit>) -> Self {
        Self { files }
    }
}

/// A single violated scope rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ScopeViolation {
    /// More files than allowed.
    TooManyFiles {
        /// Files in the proposal.
        proposed: usize,
        /// Scope limit.
        max: usize,
    },
    /// A file changes more lines than allowed.
    TooManyLines {
        /// The file.
        path: String,
        /// Lines in the proposal.
        proposed: usize,
        /// Scope limit.
        max: usize,
    },
    /// A file has more hunks than allowed.
    TooManyHunks {
        /// The file.
        path: String,
        /// Hunks in the proposal.
        proposed: usize,
        /// Scope limit.
        max: usize,
    },
    /// A file's extension is not in the allowed set.
    DisallowedFileType {
        /// The file.
        path: String,
    },
    /// A file lies under an excluded path.
    ExcludedPath {
        /// The file.
        path: String,
    },
}

impl fmt::Display for ScopeViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooManyFiles { proposed, max } => {
                write!(f, "{proposed} files proposed, at most {max} allowed")
            }
            Self::TooManyLines { path, proposed, max } => {
                write!(f, "{path}: {proposed} lines changed, at most {max} allowed")
            }
            Self::TooManyHunks { path, proposed, max } => {
                write!(f, "{path}: {proposed} hunks, at most {max} allowed")
            }
            Self::DisallowedFileType { path } => write!(f, "{path}: file type not allowed"),
            Self::ExcludedPath { path } => write!(f, "{path}: path is excluded"),
        }
    }
}

/// Validates a proposed edit against a scope.
///
/// Every violated rule is reported, not just the first.
pub fn check_scope(scope: &Scope, edit: &ProposedEdit) -> Result<(), StageError> {
    let mut violations = Vec::new();

    if edit.files.len() > scope.max_files {
        violations.push(ScopeViolation::TooManyFiles {
            proposed: edit.files.len(),
            max: scope.max_files,
        });
    }

    for file in &edit.files {
        if file.lines_changed > scope.max_lines_per_file {
            violations.push(ScopeViolation::TooManyLines {
                path: file.path.clone(),
                proposed: file.lines_changed,
                max: scope.max_lines_per_file,
            });
        }
        if file.hunks > scope.max_hunks_per_file {
            violations.push(ScopeViolation::TooManyHunks {
                path: file.path.clone(),
                proposed: file.hunks,
                max: scope.max_hunks_per_file,
            });
        }
        if !scope.is_allowed_type(&file.path) {
            violations.push(ScopeViolation::DisallowedFileType {
                path: file.path.clone(),
            });
        }
        if scope.is_excluded(&file.path) {
            violations.push(ScopeViolation::ExcludedPath {
                path: file.path.clone(),
            });
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(StageError::ScopeViolation { violations })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn scope() -> Scope {
        Scope::new(2, 100, 3)
            .unwrap()
            .with_allowed_file_types([".rs", "TS"])
            .with_excluded_paths(["vendor", "target/debug"])
    }

    #[test]
    fn test_zero_limits_rejected() {
        assert_eq!(Scope::new(0, 1, 1), Err(ConfigError::Zero { field: "max_files" }));
        assert!(Scope::new(1, 0, 1).is_err());
    }

    #[test]
    fn test_extensions_normalized() {
        let s = scope();
        assert!(s.allowed_file_types().contains("rs"));
        assert!(s.allowed_file_types().contains("ts"));
    }

    #[test]
    fn test_valid_edit_passes() {
        let edit = ProposedEdit::new(vec![FileEdit::new("src/lib.rs", 40, 2)]);
        assert!(check_scope(&scope(), &edit).is_ok());
    }

    #[test]
    fn test_every_violation_reported() {
        let edit = ProposedEdit::new(vec![
            FileEdit::new("src/main.rs", 150, 1),
            FileEdit::new("vendor/lib.rs", 10, 9),
            FileEdit::new("build.sh", 1, 1),
        ]);
        let Err(StageError::ScopeViolation { violations }) = check_scope(&scope(), &edit) else {
            panic!("expected scope violation");
        };
        assert_eq!(
            violations,
            vec![
                ScopeViolation::TooManyFiles { proposed: 3, max: 2 },
                ScopeViolation::TooManyLines {
                    path: "src/main.rs".into(),
                    proposed: 150,
                    max: 100,
                },
                ScopeViolation::TooManyHunks {
                    path: "vendor/lib.rs".into(),
                    proposed: 9,
                    max: 3,
                },
                ScopeViolation::ExcludedPath {
                    path: "vendor/lib.rs".into(),
                },
                ScopeViolation::DisallowedFileType {
                    path: "build.sh".into(),
                },
            ]
        );
    }

    #[test]
    fn test_excluded_prefix_matches_components_only() {
        let edit = ProposedEdit::new(vec![FileEdit::new("vendored/lib.rs", 1, 1)]);
        assert!(check_scope(&scope(), &edit).is_ok());
    }

    #[test]
    fn test_excluded_path_matched_after_normalizing() {
        for path in ["./vendor/lib.rs", "src/../vendor/lib.rs", "vendor/./lib.rs"] {
            let edit = ProposedEdit::new(vec![FileEdit::new(path, 1, 1)]);
            assert_eq!(
                check_scope(&scope(), &edit),
                Err(StageError::ScopeViolation {
                    violations: vec![ScopeViolation::ExcludedPath { path: path.into() }],
                }),
                "{path} should be excluded"
            );
        }

        let inside = ProposedEdit::new(vec![FileEdit::new("./src/../src/lib.rs", 1, 1)]);
        assert!(check_scope(&scope(), &inside).is_ok());
    }

    #[test]
    fn test_paths_outside_workspace_excluded() {
        let unrestricted = Scope::default();
        for path in ["/etc/passwd.rs", "../outside/lib.rs", "src/../../lib.rs"] {
            let edit = ProposedEdit::new(vec![FileEdit::new(path, 1, 1)]);
            assert!(check_scope(&unrestricted, &edit).is_err(), "{path} should be rejected");
        }
    }

    #[test]
    fn test_excluded_prefix_normalized_too() {
        let s = Scope::default().with_excluded_paths(["./target/"]);
        let edit = ProposedEdit::new(vec![FileEdit::new("target/debug/out.rs", 1, 1)]);
        assert!(check_scope(&s, &edit).is_err());
    }

    #[test]
    fn test_narrowing_halves_with_floor() {
        let s = Scope::new(5, 3, 1).unwrap();
        let n = s.narrowed(0.5);
        assert_eq!(n.max_files(), 2);
        assert_eq!(n.max_lines_per_file(), 1);
        assert_eq!(n.max_hunks_per_file(), 1);
        assert!(n.fits_within(&s));
        assert_eq!(n.narrowed(0.5).max_files(), 1);
    }

    #[test]
    fn test_narrowing_never_grows() {
        let s = Scope::new(4, 4, 4).unwrap();
        assert!(s.narrowed(3.0).fits_within(&s));
    }

    #[test]
    fn test_limits_into_scope() {
        let limits: ScopeLimits = serde_json::from_value(serde_json::json!({
            "max_files": 3,
            "allowed_file_types": ["py"]
        }))
        .unwrap();
        let s = limits.into_scope(&Scope::default()).unwrap();
        assert_eq!(s.max_files(), 3);
        assert_eq!(s.max_lines_per_file(), Scope::default().max_lines_per_file());
        assert!(s.allowed_file_types().contains("py"));

        let bad = ScopeLimits {
            max_files: Some(-2),
            ..Default::default()
        };
        assert!(bad.into_scope(&Scope::default()).is_err());
    }
}
