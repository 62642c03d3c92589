//! Literal patching of pre-built script output.
//!
//! Bundled application code is minified and shifts between releases, so it is
//! never parsed. Each patch is a declarative before/after literal pair with
//! expected match counts. A patch only applies when the counts prove the file
//! is exactly the build the patch was written for:
//!
//! 1. If the patched literal already occurs the expected number of times (and
//!    the unpatched literal is gone), the patch was applied before; no-op.
//! 2. Any other non-zero count of the patched literal is a corrupt state.
//! 3. The unpatched literal must occur exactly the expected number of times.
//! 4. After a global substitution the patched literal must occur the expected
//!    number of times and the unpatched literal zero times.
//!
//! The file is rewritten only once step 4 holds, so a rejected patch leaves the
//! content untouched.

use crate::converter::error::{Error, ErrorExt, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn one() -> usize {
    1
}

/// Declarative literal substitution rule.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PatchSpec {
    /// Short identifier used in logs and errors.
    pub name: String,
    /// Target file, relative to the unpacked application tree. May be a glob
    /// pattern, which must then match exactly one file.
    pub file: String,
    /// Unpatched literal.
    pub before: String,
    /// Patched literal.
    pub after: String,
    /// Required occurrences of `before` in an unpatched file.
    #[serde(default = "one")]
    pub expected_before: usize,
    /// Required occurrences of `after` in a patched file.
    #[serde(default = "one")]
    pub expected_after: usize,
}

/// Result of applying a patch to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchOutcome {
    /// Content was rewritten.
    Applied,
    /// Content already carried the patch.
    AlreadyApplied,
}

/// Text-level result of [`PatchSpec::patch_text`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchedText {
    /// Patch already present; content unchanged.
    AlreadyApplied,
    /// New content with the patch applied.
    Applied(String),
}

/// A count check that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountMismatch {
    /// "unpatched" or "patched"
    pub form: &'static str,
    /// Required count
    pub expected: usize,
    /// Observed count
    pub found: usize,
}

impl CountMismatch {
    fn unpatched(expected: usize, found: usize) -> Self {
        Self {
            form: "unpatched",
            expected,
            found,
        }
    }

    fn patched(expected: usize, found: usize) -> Self {
        Self {
            form: "patched",
            expected,
            found,
        }
    }
}

impl PatchSpec {
    /// Checks that the rule can ever be satisfied.
    pub fn validate(&self) -> Result<()> {
        let problem = if self.name.trim().is_empty() {
            Some("name is empty")
        } else if self.file.trim().is_empty() {
            Some("target file is empty")
        } else if self.before.is_empty() || self.after.is_empty() {
            Some("literals must not be empty")
        } else if self.before == self.after {
            Some("before and after literals are identical")
        } else if self.after.contains(&self.before) {
            Some("after literal contains the before literal")
        } else if self.expected_before == 0 || self.expected_after == 0 {
            Some("expected counts must be at least 1")
        } else {
            None
        };

        match problem {
            Some(reason) => Err(Error::InputValidation(format!(
                "patch '{}': {}",
                self.name, reason
            ))),
            None => Ok(()),
        }
    }

    /// Applies the rule to `content` without touching the filesystem.
    pub fn patch_text(&self, content: &str) -> std::result::Result<PatchedText, CountMismatch> {
        let patched = count(content, &self.after);
        if patched == self.expected_after {
            let leftover = count(content, &self.before);
            if leftover != 0 {
                return Err(CountMismatch::unpatched(0, leftover));
            }
            return Ok(PatchedText::AlreadyApplied);
        }
        if patched != 0 {
            return Err(CountMismatch::patched(self.expected_after, patched));
        }

        let unpatched = count(content, &self.before);
        if unpatched != self.expected_before {
            return Err(CountMismatch::unpatched(self.expected_before, unpatched));
        }

        let rewritten = content.replace(&self.before, &self.after);

        let patched = count(&rewritten, &self.after);
        if patched != self.expected_after {
            return Err(CountMismatch::patched(self.expected_after, patched));
        }
        let leftover = count(&rewritten, &self.before);
        if leftover != 0 {
            return Err(CountMismatch::unpatched(0, leftover));
        }

        Ok(PatchedText::Applied(rewritten))
    }
}

fn count(haystack: &str, needle: &str) -> usize {
    haystack.matches(needle).count()
}

/// Record of one applied patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchReport {
    /// Patch name
    pub name: String,
    /// File that was checked, relative to the application tree
    pub file: PathBuf,
    /// What happened
    pub outcome: PatchOutcome,
}

/// Applies patch tables to an unpacked application tree.
#[derive(Debug, Clone)]
pub struct PatchEngine {
    root: PathBuf,
}

impl PatchEngine {
    /// Engine rooted at the unpacked application tree.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolves a spec's target locator to exactly one file.
    pub fn locate(&self, spec: &PatchSpec) -> Result<PathBuf> {
        if !is_glob(&spec.file) {
            let path = self.root.join(&spec.file);
            if !path.is_file() {
                return Err(Error::InputValidation(format!(
                    "patch '{}': target file {} does not exist",
                    spec.name, spec.file
                )));
            }
            return Ok(path);
        }

        let root = self.root.to_str().ok_or_else(|| {
            Error::GenericError(format!(
                "application tree path is not UTF-8: {}",
                self.root.display()
            ))
        })?;
        let pattern = format!("{}/{}", glob::Pattern::escape(root), spec.file);

        let mut matches = Vec::new();
        for entry in glob::glob(&pattern)? {
            let path = entry.map_err(|e| Error::GenericError(e.to_string()))?;
            if path.is_file() {
                matches.push(path);
            }
        }

        match matches.len() {
            1 => Ok(matches.remove(0)),
            n => Err(Error::InputValidation(format!(
                "patch '{}': locator {} matched {} files, expected exactly 1",
                spec.name, spec.file, n
            ))),
        }
    }

    /// Applies one spec, rewriting its target file only on success.
    pub fn apply(&self, spec: &PatchSpec) -> Result<PatchReport> {
        let path = self.locate(spec)?;
        let content =
            std::fs::read_to_string(&path).fs_context("reading patch target", &path)?;

        let outcome = match spec.patch_text(&content) {
            Ok(PatchedText::AlreadyApplied) => {
                log::info!("Patch '{}' already applied to {}", spec.name, spec.file);
                PatchOutcome::AlreadyApplied
            }
            Ok(PatchedText::Applied(rewritten)) => {
                std::fs::write(&path, rewritten).fs_context("writing patched file", &path)?;
                log::info!("Applied patch '{}' to {}", spec.name, spec.file);
                PatchOutcome::Applied
            }
            Err(mismatch) => {
                return Err(Error::PatchInvariantViolation {
                    patch: spec.name.clone(),
                    file: path,
                    form: mismatch.form,
                    expected: mismatch.expected,
                    found: mismatch.found,
                });
            }
        };

        Ok(PatchReport {
            name: spec.name.clone(),
            file: path.strip_prefix(&self.root)?.to_path_buf(),
            outcome,
        })
    }

    /// Applies every spec in order, stopping at the first failure.
    pub fn apply_all(&self, specs: &[PatchSpec]) -> Result<Vec<PatchReport>> {
        specs.iter().map(|spec| self.apply(spec)).collect()
    }
}

fn is_glob(locator: &str) -> bool {
    locator.contains(['*', '?', '['])
}
