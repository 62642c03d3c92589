//! Disk image extraction.
//!
//! Extraction is delegated to 7-Zip behind the [`Extractor`] seam. Distribution
//! packages often ship a 7-Zip too old to read current images, so
//! [`SevenZip::locate`] falls back to a pinned upstream build cached next to
//! the other downloads.

use crate::bail;
use crate::converter::{
    error::{Error, ErrorExt, Result},
    settings::Timeouts,
    utils::{fs, http::Downloader, process},
};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use tokio::process::Command;

/// Oldest 7-Zip release able to read current images, as (major, minor).
pub const MIN_SEVEN_ZIP: (u32, u32) = (22, 0);

/// Pinned upstream build fetched when no compatible 7-Zip is installed.
const SEVEN_ZIP_RELEASE: &str = "2301";
const SEVEN_ZIP_BASE_URL: &str = "https://www.7-zip.org/a";

/// Bundles are searched at most this many levels below the extraction root.
pub const BUNDLE_SEARCH_DEPTH: usize = 5;

/// Unpacks an archive into a directory.
#[allow(async_fn_in_trait)]
pub trait Extractor {
    /// Extract `archive` into the existing, empty directory `dest`.
    async fn extract(&self, archive: &Path, dest: &Path) -> Result<()>;
}

/// A disk image unpacked into scratch space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedBundle {
    root: PathBuf,
    bundle: PathBuf,
}

impl ExtractedBundle {
    /// The application bundle directory (`*.app`).
    pub fn bundle(&self) -> &Path {
        &self.bundle
    }

    /// Bundle path relative to the extraction root.
    pub fn relative_bundle(&self) -> &Path {
        self.bundle.strip_prefix(&self.root).unwrap_or(&self.bundle)
    }
}

/// Extracts `archive` into a freshly emptied `dest` and locates its bundle.
pub async fn extract_bundle<X: Extractor>(
    extractor: &X,
    archive: &Path,
    dest: &Path,
) -> Result<ExtractedBundle> {
    fs::create_dir_all(dest, true).await?;
    extractor.extract(archive, dest).await?;
    let bundle = find_bundle(dest)?;
    log::info!("Found application bundle {}", bundle.display());
    Ok(ExtractedBundle {
        root: dest.to_path_buf(),
        bundle,
    })
}

/// Finds the single `*.app` directory below `root`.
///
/// Bundles nested inside another bundle (helpers, login items) are not
/// counted; symlinks are never followed.
pub fn find_bundle(root: &Path) -> Result<PathBuf> {
    let mut found = Vec::new();
    let mut walker = walkdir::WalkDir::new(root)
        .min_depth(1)
        .max_depth(BUNDLE_SEARCH_DEPTH)
        .sort_by_file_name()
        .into_iter();

    while let Some(entry) = walker.next() {
        let entry = entry?;
        if entry.file_type().is_dir() && is_bundle_dir(entry.path()) {
            found.push(entry.path().to_path_buf());
            walker.skip_current_dir();
        }
    }

    match found.len() {
        1 => Ok(found.remove(0)),
        0 => Err(Error::InputValidation(format!(
            "no application bundle found within {} levels of the disk image root",
            BUNDLE_SEARCH_DEPTH
        ))),
        n => Err(Error::InputValidation(format!(
            "disk image contains {} application bundles, expected exactly one: {}",
            n,
            found
                .iter()
                .map(|p| p.strip_prefix(root).unwrap_or(p).display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

fn is_bundle_dir(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("app")
}

/// 7-Zip command line extractor.
#[derive(Debug, Clone)]
pub struct SevenZip {
    program: PathBuf,
    version: (u32, u32),
    timeout: Duration,
}

impl SevenZip {
    /// Finds a compatible 7-Zip, fetching the pinned release into `tools_dir`
    /// when the installed one is missing or too old.
    pub async fn locate<D: Downloader>(
        tools_dir: &Path,
        downloader: &D,
        timeouts: &Timeouts,
    ) -> Result<Self> {
        let cached = tools_dir.join("7zz");
        let installed = ["7zz", "7z"]
            .iter()
            .filter_map(|name| which::which(name).ok());

        for program in installed.chain(std::iter::once(cached.clone())) {
            if !program.is_file() {
                continue;
            }
            match detect_version(&program).await {
                Some(version) if version >= MIN_SEVEN_ZIP => {
                    log::debug!("Using {} ({}.{:02})", program.display(), version.0, version.1);
                    return Ok(Self {
                        program,
                        version,
                        timeout: timeouts.extract,
                    });
                }
                Some(version) => log::warn!(
                    "{} is version {}.{:02}, need at least {}.{:02}",
                    program.display(),
                    version.0,
                    version.1,
                    MIN_SEVEN_ZIP.0,
                    MIN_SEVEN_ZIP.1
                ),
                None => log::debug!("Could not determine version of {}", program.display()),
            }
        }

        let program = fetch_seven_zip(tools_dir, downloader).await?;
        let version = detect_version(&program).await.ok_or_else(|| {
            Error::InputValidation(format!(
                "downloaded 7-Zip at {} does not report a version",
                program.display()
            ))
        })?;
        Ok(Self {
            program,
            version,
            timeout: timeouts.extract,
        })
    }
}

impl Extractor for SevenZip {
    async fn extract(&self, archive: &Path, dest: &Path) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.arg("x")
            .arg("-y")
            .arg("-aoa")
            .arg(format!("-o{}", dest.display()))
            .arg(archive);

        let label = format!("7-Zip {}.{:02} extraction", self.version.0, self.version.1);
        let output = process::run(cmd, &label, self.timeout).await?;

        // Exit code 1 is 7-Zip's "warning" status: typically the image's
        // /Applications symlink, which is not needed.
        match output.status.code() {
            Some(0) => Ok(()),
            Some(1) => {
                log::warn!(
                    "7-Zip reported warnings extracting {}: {}",
                    archive.display(),
                    process::diagnostic_tail(&output)
                );
                Ok(())
            }
            _ => Err(Error::InputValidation(format!(
                "could not extract {} ({}): {}",
                archive.display(),
                output.status,
                process::diagnostic_tail(&output)
            ))),
        }
    }
}

/// Parses the (major, minor) version from 7-Zip's banner.
pub fn parse_version(banner: &str) -> Option<(u32, u32)> {
    static VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(\d+)\.(\d{2})\b").expect("7-Zip version regex is valid")
    });

    let line = banner.lines().find(|line| line.contains("7-Zip"))?;
    let caps = VERSION_RE.captures(line)?;
    Some((caps[1].parse().ok()?, caps[2].parse().ok()?))
}

async fn detect_version(program: &Path) -> Option<(u32, u32)> {
    let output = process::run(
        Command::new(program),
        "7-Zip version check",
        Duration::from_secs(10),
    )
    .await
    .ok()?;
    parse_version(&String::from_utf8_lossy(&output.stdout))
}

fn release_arch() -> Result<&'static str> {
    match std::env::consts::ARCH {
        "x86_64" => Ok("x64"),
        "aarch64" => Ok("arm64"),
        "x86" => Ok("x86"),
        "arm" => Ok("arm"),
        other => bail!("no 7-Zip build available for architecture {}", other),
    }
}

async fn fetch_seven_zip<D: Downloader>(tools_dir: &Path, downloader: &D) -> Result<PathBuf> {
    let tarball_name = format!("7z{}-linux-{}.tar.xz", SEVEN_ZIP_RELEASE, release_arch()?);
    let tarball = tools_dir.join(&tarball_name);
    let url = format!("{}/{}", SEVEN_ZIP_BASE_URL, tarball_name);

    log::info!("Installed 7-Zip is missing or too old; fetching {}", tarball_name);
    fs::create_dir_all(tools_dir, false).await?;
    downloader.download(&url, &tarball).await?;

    let program = tools_dir.join("7zz");
    unpack_seven_zip(&tarball, &program)?;
    fs::make_executable(&program).await?;
    let _ = tokio::fs::remove_file(&tarball).await;
    Ok(program)
}

fn unpack_seven_zip(tarball: &Path, program: &Path) -> Result<()> {
    let file = std::fs::File::open(tarball).fs_context("opening 7-Zip tarball", tarball)?;
    let mut archive = tar::Archive::new(xz2::read::XzDecoder::new(file));

    for entry in archive.entries().fs_context("reading 7-Zip tarball", tarball)? {
        let mut entry = entry.fs_context("reading 7-Zip tarball", tarball)?;
        let is_binary = entry
            .path()
            .ok()
            .and_then(|p| p.file_name().map(|n| n == "7zz"))
            .unwrap_or(false);
        if is_binary {
            entry
                .unpack(program)
                .fs_context("unpacking 7-Zip binary", program)?;
            return Ok(());
        }
    }

    Err(Error::InputValidation(format!(
        "7-Zip tarball {} does not contain the 7zz binary",
        tarball.display()
    )))
}
