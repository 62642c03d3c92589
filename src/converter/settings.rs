//! Conversion configuration.
//!
//! Two layers:
//!
//! - [`Profile`]: product-specific data (signature table, patch table, native
//!   modules, artifact sources). Loaded from TOML; a default profile is
//!   embedded in the binary.
//! - [`Settings`]: per-installation settings (cache, scratch location,
//!   runtime source, time budgets), built with [`SettingsBuilder`].
//!
//! # Example
//!
//! ```no_run
//! use kodegen_bundler_port::converter::{Profile, SettingsBuilder};
//!
//! # fn example() -> kodegen_bundler_port::converter::Result<()> {
//! let settings = SettingsBuilder::new()
//!     .profile(Profile::builtin()?)
//!     .cache_dir("/var/cache/kodegen-port")
//!     .build()?;
//! assert_eq!(settings.profile().product_name, "Claude");
//! # Ok(())
//! # }
//! ```

use crate::converter::{
    error::{Context, ErrorExt, Result},
    patch::PatchSpec,
    Error,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const BUILTIN_PROFILE: &str = include_str!("default_profile.toml");

/// Default Electron release mirror.
pub const DEFAULT_RUNTIME_MIRROR: &str = "https://github.com/electron/electron/releases/download";

/// Where an artifact may come from, in precedence order after an explicit
/// override.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArtifactSources {
    /// Well-known local paths, probed in order. `~/` is expanded.
    #[serde(default)]
    pub paths: Vec<PathBuf>,
    /// Network fallback location.
    #[serde(default)]
    pub url: Option<String>,
    /// File name of the download inside the cache directory.
    pub cache_name: String,
}

/// Signature table driving bundle classification.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignatureTable {
    /// Tokens whose presence in the bundle's declared name marks the payload.
    #[serde(default)]
    pub brand_tokens: Vec<String>,
    /// Relative paths of nested bundles that only exist in the payload.
    /// `{name}` is replaced with the bundle's directory stem.
    #[serde(default)]
    pub nested_payload_paths: Vec<String>,
    /// Strings only found in the installer's main executable.
    #[serde(default)]
    pub installer_signatures: Vec<String>,
    /// Strings found in the product's main executable.
    #[serde(default)]
    pub payload_signatures: Vec<String>,
    /// Relative paths of files that mark a package shape we refuse to convert.
    #[serde(default)]
    pub unsupported_markers: Vec<String>,
}

/// Product-specific conversion data.
#[derive(Debug, Clone, Deserialize)]
pub struct Profile {
    /// Profile identifier
    pub name: String,
    /// Human-readable product name
    pub product_name: String,
    /// File name of the generated launcher
    pub launcher_name: String,
    /// Target runtime (Electron) version
    pub runtime_version: String,
    /// Native modules rebuilt against the target runtime
    #[serde(default)]
    pub native_modules: Vec<String>,
    /// Installer / top-level image sources
    pub installer: ArtifactSources,
    /// Payload image sources (used when the installer only wraps the payload)
    pub payload: ArtifactSources,
    /// Classification signatures
    pub classification: SignatureTable,
    /// Literal patches applied to the unpacked application
    #[serde(default)]
    pub patches: Vec<PatchSpec>,
}

impl Profile {
    /// The profile embedded in the binary.
    pub fn builtin() -> Result<Self> {
        Self::from_toml(BUILTIN_PROFILE).context("parsing built-in profile")
    }

    /// Loads a profile from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).fs_context("reading profile", path)?;
        Self::from_toml(&text).with_context(|| format!("loading profile {}", path.display()))
    }

    /// Parses and validates a profile.
    pub fn from_toml(text: &str) -> Result<Self> {
        let profile: Profile = toml::from_str(text)?;
        profile.validate()?;
        Ok(profile)
    }

    /// Rejects profiles that can never convert successfully.
    pub fn validate(&self) -> Result<()> {
        if self.product_name.trim().is_empty() {
            return Err(Error::InputValidation("profile product_name is empty".into()));
        }
        if self.launcher_name.trim().is_empty() || self.launcher_name.contains('/') {
            return Err(Error::InputValidation(format!(
                "profile launcher_name '{}' is not a plain file name",
                self.launcher_name
            )));
        }
        semver::Version::parse(&self.runtime_version).map_err(|e| {
            Error::InputValidation(format!(
                "profile runtime_version '{}' is not a valid version: {}",
                self.runtime_version, e
            ))
        })?;
        if let Some(name) = self.native_modules.iter().find(|n| !is_module_name(n)) {
            return Err(Error::InputValidation(format!(
                "profile native module name '{name}' is invalid"
            )));
        }
        for spec in &self.patches {
            spec.validate()?;
        }
        Ok(())
    }
}

fn is_module_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .split('/')
            .all(|part| !part.is_empty() && part != ".." && part != ".")
        && name.split('/').count() <= 2
}

/// Where the target runtime comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeSource {
    /// Download the official Linux build of the profile's runtime version.
    Download {
        /// Release mirror base URL
        mirror: String,
    },
    /// Copy an already unpacked runtime directory.
    Local(PathBuf),
}

impl Default for RuntimeSource {
    fn default() -> Self {
        Self::Download {
            mirror: DEFAULT_RUNTIME_MIRROR.to_string(),
        }
    }
}

/// Time budgets for long-running steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Total time for a single download
    pub download: Duration,
    /// Connection establishment for a download
    pub connect: Duration,
    /// Disk image extraction
    pub extract: Duration,
    /// Header and package fetches
    pub fetch: Duration,
    /// Native module compilation
    pub compile: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            download: Duration::from_secs(15 * 60),
            connect: Duration::from_secs(30),
            extract: Duration::from_secs(10 * 60),
            fetch: Duration::from_secs(10 * 60),
            compile: Duration::from_secs(30 * 60),
        }
    }
}

/// Resolved conversion settings.
#[derive(Debug, Clone)]
pub struct Settings {
    profile: Profile,
    cache_dir: PathBuf,
    scratch_root: Option<PathBuf>,
    runtime: RuntimeSource,
    timeouts: Timeouts,
}

impl Settings {
    /// Product profile.
    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Shared download cache.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Parent directory for per-run scratch workspaces (system temp if unset).
    pub fn scratch_root(&self) -> Option<&Path> {
        self.scratch_root.as_deref()
    }

    /// Runtime source.
    pub fn runtime(&self) -> &RuntimeSource {
        &self.runtime
    }

    /// Time budgets.
    pub fn timeouts(&self) -> &Timeouts {
        &self.timeouts
    }

    /// Cache path for a downloaded artifact.
    pub fn cache_path(&self, sources: &ArtifactSources) -> PathBuf {
        self.cache_dir.join(&sources.cache_name)
    }
}

/// Default cache directory: `<user cache>/kodegen-port`.
pub fn default_cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|dir| dir.join("kodegen-port"))
}

/// Builder for [`Settings`].
#[derive(Debug, Default)]
pub struct SettingsBuilder {
    profile: Option<Profile>,
    cache_dir: Option<PathBuf>,
    scratch_root: Option<PathBuf>,
    runtime: RuntimeSource,
    timeouts: Timeouts,
}

impl SettingsBuilder {
    /// Creates a new settings builder.
    pub fn new() -> Self {
        Default::default()
    }

    /// Sets the product profile.
    ///
    /// Default: [`Profile::builtin`]
    pub fn profile(mut self, profile: Profile) -> Self {
        self.profile = Some(profile);
        self
    }

    /// Sets the download cache directory.
    ///
    /// Default: [`default_cache_dir`]
    pub fn cache_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.cache_dir = Some(path.as_ref().to_path_buf());
        self
    }

    /// Sets the parent directory for scratch workspaces.
    pub fn scratch_root<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.scratch_root = Some(path.as_ref().to_path_buf());
        self
    }

    /// Sets the runtime source.
    pub fn runtime(mut self, runtime: RuntimeSource) -> Self {
        self.runtime = runtime;
        self
    }

    /// Sets the time budgets.
    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Builds the settings.
    ///
    /// # Errors
    ///
    /// Fails if no cache directory was given and none can be determined, or
    /// if the built-in profile is needed and does not parse.
    pub fn build(self) -> Result<Settings> {
        let profile = match self.profile {
            Some(profile) => profile,
            None => Profile::builtin()?,
        };
        let cache_dir = self
            .cache_dir
            .or_else(default_cache_dir)
            .context("cache directory could not be determined; pass --cache-dir")?;

        Ok(Settings {
            profile,
            cache_dir,
            scratch_root: self.scratch_root,
            runtime: self.runtime,
            timeouts: self.timeouts,
        })
    }
}
