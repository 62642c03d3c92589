//! Artifact resolution.
//!
//! A disk image may come from an explicit override, from one of several
//! well-known local paths, or from the network. Precedence is strict and
//! every source is validated before it is accepted:
//!
//! 1. the override must exist and validate, or resolution fails outright;
//! 2. local candidates are probed in order, skipping invalid files;
//! 3. the network fallback reuses a cached download only while it validates.

use crate::converter::{
    dmg,
    error::{Error, Result},
    utils::{fs::expand_home, http::Downloader},
};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Where a resolved artifact came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// Explicitly given by the caller
    Override,
    /// Found at a well-known local path
    Local,
    /// Fetched from the network (or reused from the download cache)
    Downloaded,
}

/// A validated disk image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    /// Path to the image
    pub path: PathBuf,
    /// How it was obtained
    pub provenance: Provenance,
}

/// A local candidate that existed but was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedCandidate {
    /// Candidate path
    pub path: PathBuf,
    /// Why it was skipped
    pub reason: String,
}

/// Result of a successful resolution.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// The accepted artifact
    pub artifact: Artifact,
    /// Candidates passed over on the way
    pub skipped: Vec<SkippedCandidate>,
}

/// Network source used when no local candidate qualifies.
#[derive(Debug, Clone)]
pub struct NetworkFallback {
    /// Download location
    pub url: String,
    /// Fixed cache path for the download
    pub cache_path: PathBuf,
}

/// Resolves artifacts through a [`Downloader`].
#[derive(Debug)]
pub struct ArtifactResolver<'a, D> {
    downloader: &'a D,
}

impl<'a, D: Downloader> ArtifactResolver<'a, D> {
    /// Creates a resolver that fetches through `downloader`.
    pub fn new(downloader: &'a D) -> Self {
        Self { downloader }
    }

    /// Resolves `what` (used in messages, e.g. "installer image").
    pub async fn resolve(
        &self,
        what: &str,
        explicit: Option<&Path>,
        candidates: &[PathBuf],
        fallback: Option<NetworkFallback>,
    ) -> Result<Resolution> {
        if let Some(path) = explicit {
            return resolve_override(what, path).map(|artifact| Resolution {
                artifact,
                skipped: Vec::new(),
            });
        }

        let mut skipped = Vec::new();
        let mut seen = HashSet::new();

        for candidate in candidates {
            let path = expand_home(candidate);
            if !path.exists() {
                log::debug!("No {} at {}", what, path.display());
                continue;
            }
            let canonical = std::fs::canonicalize(&path).unwrap_or_else(|_| path.clone());
            if !seen.insert(canonical) {
                log::debug!("Skipping duplicate candidate {}", path.display());
                continue;
            }

            match dmg::check_trailer(&path) {
                Ok(true) => {
                    log::info!("Using local {} {}", what, path.display());
                    return Ok(Resolution {
                        artifact: Artifact {
                            path,
                            provenance: Provenance::Local,
                        },
                        skipped,
                    });
                }
                Ok(false) => {
                    let reason = "not a disk image (trailer signature missing)";
                    skip(&mut skipped, path, reason.into())
                }
                Err(e) => skip(&mut skipped, path, e.to_string()),
            }
        }

        let Some(fallback) = fallback else {
            return Err(Error::ResolutionExhausted {
                what: what.to_string(),
                reason: format!(
                    "no valid local candidate ({} skipped) and no download location configured",
                    skipped.len()
                ),
            });
        };

        let artifact = self.fetch(what, &fallback).await?;
        Ok(Resolution { artifact, skipped })
    }

    async fn fetch(&self, what: &str, fallback: &NetworkFallback) -> Result<Artifact> {
        let path = &fallback.cache_path;
        let downloaded = Artifact {
            path: path.clone(),
            provenance: Provenance::Downloaded,
        };

        if path.exists() {
            if dmg::is_disk_image(path) {
                log::info!("Reusing cached {} {}", what, path.display());
                return Ok(downloaded);
            }
            log::warn!("Cached {} {} is invalid, refetching", what, path.display());
            discard(path).await;
        }

        if let Err(e) = self.downloader.download(&fallback.url, path).await {
            discard(path).await;
            return Err(match e {
                Error::Timeout { .. } => e,
                other => Error::ResolutionExhausted {
                    what: what.to_string(),
                    reason: format!("download from {} failed: {}", fallback.url, other),
                },
            });
        }

        let len = tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);
        let reason = if len == 0 {
            Some("download was empty")
        } else if !dmg::is_disk_image(path) {
            Some("download is not a disk image")
        } else {
            None
        };
        if let Some(reason) = reason {
            discard(path).await;
            return Err(Error::ResolutionExhausted {
                what: what.to_string(),
                reason: format!("{} ({})", reason, fallback.url),
            });
        }

        log::info!("Downloaded {} to {}", what, path.display());
        Ok(downloaded)
    }
}

fn resolve_override(what: &str, path: &Path) -> Result<Artifact> {
    let path = expand_home(path);
    if !path.is_file() {
        return Err(Error::InputValidation(format!(
            "{} {} does not exist",
            what,
            path.display()
        )));
    }
    if !dmg::check_trailer(&path)? {
        return Err(Error::InputValidation(format!(
            "{} {} is not a disk image (trailer signature missing)",
            what,
            path.display()
        )));
    }
    Ok(Artifact {
        path,
        provenance: Provenance::Override,
    })
}

fn skip(skipped: &mut Vec<SkippedCandidate>, path: PathBuf, reason: String) {
    log::warn!("Skipping {}: {}", path.display(), reason);
    skipped.push(SkippedCandidate { path, reason });
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        log::warn!("Could not remove {}: {}", path.display(), e);
    }
}
