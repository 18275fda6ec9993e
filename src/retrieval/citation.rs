//! Checks that a chunk's claimed source file still exists.
//!
//! An invalid citation never removes a result: the chunk is returned with
//! `citation_valid = Some(false)` and a warning is logged.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct CitationValidator {
    project_root: Option<PathBuf>,
}

impl CitationValidator {
    pub fn new(project_root: Option<PathBuf>) -> Self {
        Self { project_root }
    }

    pub fn project_root(&self) -> Option<&Path> {
        self.project_root.as_deref()
    }

    /// Whether `source_path`, resolved against `project_root` with symlinks followed,
    /// names an existing file or directory.
    pub fn validate(source_path: &str, project_root: &Path) -> bool {
        if source_path.trim().is_empty() {
            return false;
        }
        std::fs::canonicalize(project_root.join(source_path)).is_ok_and(|p| p.exists())
    }

    /// Citation flag for a retrieved chunk. `None` when no project root is configured.
    pub fn check(&self, source_path: &str) -> Option<bool> {
        let root = self.project_root.as_deref()?;
        let valid = Self::validate(source_path, root);
        if !valid {
            tracing::warn!(
                source_path,
                project_root = %root.display(),
                "citation points at a missing source"
            );
        }
        Some(valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn existing_and_missing_sources() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("docs")).unwrap();
        std::fs::write(tmp.path().join("docs/guide.md"), "# Guide").unwrap();

        assert!(CitationValidator::validate("docs/guide.md", tmp.path()));
        assert!(!CitationValidator::validate("docs/missing.md", tmp.path()));
        assert!(!CitationValidator::validate("", tmp.path()));
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_followed() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("real.md"), "x").unwrap();
        std::os::unix::fs::symlink(tmp.path().join("real.md"), tmp.path().join("link.md")).unwrap();
        std::os::unix::fs::symlink(tmp.path().join("gone.md"), tmp.path().join("dangling.md")).unwrap();

        assert!(CitationValidator::validate("link.md", tmp.path()));
        assert!(!CitationValidator::validate("dangling.md", tmp.path()));
    }

    #[test]
    fn no_project_root_skips_the_check() {
        let validator = CitationValidator::new(None);
        assert_eq!(validator.check("anything.md"), None);
    }
}
