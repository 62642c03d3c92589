//! Error types for conversion operations.
//!
//! Every fatal condition of a conversion run maps onto one of a small set of
//! classes (see [`ErrorClass`]). Helper traits mirror `anyhow` ergonomics while
//! keeping the concrete [`Error`] type:
//!
//! - [`Context`] wraps a failure with a message
//! - [`ErrorExt`] attaches the operation and path to I/O failures
//! - `bail!` returns a formatted [`Error::GenericError`]
//!
//! # Example
//!
//! ```no_run
//! use kodegen_bundler_port::converter::{Context, ErrorExt, Result};
//! use std::path::Path;
//!
//! fn read_manifest(path: &Path) -> Result<serde_json::Value> {
//!     let contents = std::fs::read_to_string(path)
//!         .fs_context("reading manifest", path)?;
//!     Ok(serde_json::from_str::<serde_json::Value>(&contents)
//!         .map_err(kodegen_bundler_port::converter::Error::from)
//!         .context("parsing manifest JSON")?)
//! }
//! ```

use std::{
    fmt::Display,
    io,
    path::{self, PathBuf},
};
use thiserror::Error as DeriveError;

/// Errors returned by the converter.
#[derive(Debug, DeriveError)]
#[non_exhaustive]
pub enum Error {
    /// Error with context. Created by the [`Context`] trait.
    #[error("{0}: {1}")]
    Context(String, Box<Self>),

    /// Malformed or missing artifact, unsupported package shape, or a payload
    /// whose layout does not match expectations.
    #[error("invalid input: {0}")]
    InputValidation(String),

    /// No artifact source produced a valid disk image.
    #[error("could not resolve {what}: {reason}")]
    ResolutionExhausted {
        /// What was being resolved (e.g. "installer image")
        what: String,
        /// Why every source failed
        reason: String,
    },

    /// No classification signature matched the bundle.
    #[error("could not identify bundle '{name}': no known signature matched")]
    ClassificationAmbiguous {
        /// Display name of the bundle
        name: String,
    },

    /// A literal patch found an unexpected number of matches.
    #[error(
        "patch '{patch}' on {file}: expected {expected} occurrence(s) of the {form} form, found {found}"
    )]
    PatchInvariantViolation {
        /// Patch name
        patch: String,
        /// File the patch targets
        file: PathBuf,
        /// Which literal was counted ("unpatched" or "patched")
        form: &'static str,
        /// Expected count
        expected: usize,
        /// Actual count
        found: usize,
    },

    /// External toolchain step exited unsuccessfully.
    #[error("{step} failed ({status}): {diagnostic}")]
    BuildFailure {
        /// Toolchain step that failed
        step: String,
        /// Exit status description
        status: String,
        /// Tail of the tool's stderr
        diagnostic: String,
    },

    /// A bounded operation exceeded its time budget.
    #[error("{operation} timed out after {seconds}s")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Budget in seconds
        seconds: u64,
    },

    /// I/O failure on a known path.
    #[error("{context} {path}: {error}")]
    Fs {
        /// Operation in progress, e.g. "reading manifest"
        context: &'static str,
        /// Path involved
        path: PathBuf,
        /// Underlying failure
        error: io::Error,
    },

    /// A child process could not be started.
    #[error("cannot start {command}: {error}")]
    CommandFailed {
        /// Program name
        command: String,
        /// Spawn failure
        error: io::Error,
    },

    /// I/O failure without path information.
    #[error("{0}")]
    Io(#[from] io::Error),

    /// Directory traversal failure.
    #[error("{0}")]
    Walk(#[from] walkdir::Error),

    /// Path was not below the expected root.
    #[error("{0}")]
    StripPrefix(#[from] path::StripPrefixError),

    /// Malformed JSON (archive headers, manifests).
    #[error("{0}")]
    Json(#[from] serde_json::Error),

    /// Malformed profile.
    #[error("{0}")]
    Toml(#[from] toml::de::Error),

    /// Malformed `Info.plist`.
    #[error("{0}")]
    Plist(#[from] plist::Error),

    /// Launcher template failed to render.
    #[error("{0}")]
    Template(#[from] handlebars::RenderError),

    /// Transport-level HTTP failure.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Patch locator is not a valid glob.
    #[error("{0}")]
    GlobPattern(#[from] glob::PatternError),

    /// Anything else, described by its message.
    #[error("{0}")]
    GenericError(String),
}

/// Coarse error classes used for reporting and exit handling.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    /// Bad or unsupported input.
    InputValidation,
    /// Every artifact source failed.
    ResolutionExhausted,
    /// Bundle identity could not be established.
    ClassificationAmbiguous,
    /// Patch match counts were off.
    PatchInvariantViolation,
    /// Toolchain failure.
    BuildFailure,
    /// Time budget exceeded.
    Timeout,
    /// I/O, parsing and everything else.
    Internal,
}

impl Error {
    /// Innermost error, skipping any [`Error::Context`] wrappers.
    pub fn root(&self) -> &Error {
        let mut current = self;
        while let Error::Context(_, inner) = current {
            current = inner;
        }
        current
    }

    /// Classify this error, looking through context wrappers.
    pub fn class(&self) -> ErrorClass {
        match self.root() {
            Error::InputValidation(_) => ErrorClass::InputValidation,
            Error::ResolutionExhausted { .. } => ErrorClass::ResolutionExhausted,
            Error::ClassificationAmbiguous { .. } => ErrorClass::ClassificationAmbiguous,
            Error::PatchInvariantViolation { .. } => ErrorClass::PatchInvariantViolation,
            Error::BuildFailure { .. } => ErrorClass::BuildFailure,
            Error::Timeout { .. } => ErrorClass::Timeout,
            _ => ErrorClass::Internal,
        }
    }
}

/// Result alias for converter operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Attaches a message to a failure, in the manner of `anyhow::Context`.
///
/// On `Option`, `None` becomes an [`Error::GenericError`] carrying the message.
pub trait Context<T> {
    /// Wraps the failure with `context`.
    fn context<C: Display>(self, context: C) -> Result<T>;

    /// Wraps the failure with a message built only when needed.
    fn with_context<C: Display, F: FnOnce() -> C>(self, f: F) -> Result<T>;
}

impl<T> Context<T> for Result<T> {
    fn context<C: Display>(self, context: C) -> Result<T> {
        self.with_context(|| context)
    }

    fn with_context<C: Display, F: FnOnce() -> C>(self, f: F) -> Result<T> {
        self.map_err(|e| Error::Context(f().to_string(), Box::new(e)))
    }
}

impl<T> Context<T> for Option<T> {
    fn context<C: Display>(self, context: C) -> Result<T> {
        self.with_context(|| context)
    }

    fn with_context<C: Display, F: FnOnce() -> C>(self, f: F) -> Result<T> {
        self.ok_or_else(|| Error::GenericError(f().to_string()))
    }
}

/// Turns a bare `io::Error` into [`Error::Fs`].
pub trait ErrorExt<T> {
    /// `context` names the operation ("reading manifest"), `path` the file
    /// it touched.
    fn fs_context(self, context: &'static str, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> ErrorExt<T> for io::Result<T> {
    fn fs_context(self, context: &'static str, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|error| Error::Fs {
            context,
            path: path.into(),
            error,
        })
    }
}

/// Returns early with an [`Error::GenericError`] built from a format string.
#[macro_export]
macro_rules! bail {
    ($($arg:tt)+) => {
        return Err($crate::converter::error::Error::GenericError(format!($($arg)+)))
    };
}
