//! End-to-end conversion.
//!
//! [`Converter::run`] drives one conversion through a fixed sequence of
//! states:
//!
//! ```text
//! Init -> ResolvedArtifact -> ExtractedBundle -> Classified
//!      -> [PayloadResolved] -> Patched -> NativeModulesRebuilt -> Complete
//! ```
//!
//! `PayloadResolved` is only visited when the input turns out to be an
//! installer. Any error moves the converter to `Failed`. All intermediate
//! files live in a scratch directory owned by the run and removed when it
//! ends, whatever the outcome. The output tree is assembled in a staging
//! directory next to the install directory and renamed into place, so the
//! install directory is only touched once the tree is complete.

use crate::converter::{
    asar::{self, PackedArchive},
    classify::{BundleClassification, BundleClassifier, ClassifiedBundle},
    error::{Error, ErrorExt, Result},
    extract::{self, ExtractedBundle, Extractor, SevenZip},
    launcher::{self, Launcher},
    native::{ModuleToolchain, NativeModuleRebuilder, NativeModuleSpec, NpmToolchain},
    patch::{PatchEngine, PatchReport},
    resolve::{ArtifactResolver, NetworkFallback, Provenance, Resolution, SkippedCandidate},
    runtime,
    settings::{ArtifactSources, Settings},
    utils::{
        fs,
        http::{Downloader, HttpDownloader},
    },
};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Prefix of the staging directory created next to the install directory.
const STAGING_PREFIX: &str = ".kodegen-port-";

/// Location of the packed application inside a bundle.
pub const PACKED_ARCHIVE: &str = "Contents/Resources/app.asar";

/// Conversion progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversionState {
    /// Nothing done yet
    Init,
    /// Input image resolved
    ResolvedArtifact,
    /// Input image extracted
    ExtractedBundle,
    /// Input bundle classified
    Classified,
    /// Payload obtained through an installer
    PayloadResolved,
    /// Literal patches applied
    Patched,
    /// Native modules rebuilt
    NativeModulesRebuilt,
    /// Output installed
    Complete,
    /// A step failed
    Failed,
}

/// Per-run inputs.
#[derive(Debug, Clone, Default)]
pub struct ConversionRequest {
    /// Input image; resolved from the profile when absent
    pub input: Option<PathBuf>,
    /// Payload image override, used when the input is an installer
    pub payload: Option<PathBuf>,
    /// Directory receiving the converted application
    pub install_dir: PathBuf,
    /// URL the application opens at startup
    pub start_url: Option<String>,
}

/// Outcome of a successful conversion.
#[derive(Debug, Clone, Serialize)]
pub struct ConversionResult {
    /// Directory holding the converted application
    pub install_dir: PathBuf,
    /// Installed packed archive
    pub packed_archive: PathBuf,
    /// Launcher script
    pub launcher: PathBuf,
    /// Freedesktop entry
    pub desktop_entry: PathBuf,
    /// Payload bundle, relative to the root of the image it was extracted from
    pub payload_bundle: PathBuf,
    /// How the payload image was obtained
    pub payload_provenance: Provenance,
    /// Classification of the payload bundle
    pub classification: BundleClassification,
    /// Classification of the installer, when one was unwrapped
    pub installer: Option<BundleClassification>,
    /// Application entry URL
    pub start_url: String,
    /// Installed icon
    pub icon_path: Option<PathBuf>,
    /// Target runtime version
    pub runtime_version: String,
    /// Patch outcomes, in profile order
    pub patches: Vec<PatchReport>,
    /// Rebuilt native modules
    pub rebuilt_modules: Vec<NativeModuleSpec>,
    /// Image candidates passed over during resolution
    pub skipped: Vec<SkippedCandidate>,
}

/// Runs conversions with pluggable external tools.
#[derive(Debug)]
pub struct Converter<X = SevenZip, D = HttpDownloader, T = NpmToolchain> {
    settings: Settings,
    extractor: X,
    downloader: D,
    toolchain: T,
    state: ConversionState,
}

impl Converter {
    /// Converter using 7-Zip, HTTP downloads and the npm toolchain.
    ///
    /// Locates (or fetches) a compatible 7-Zip up front.
    pub async fn with_defaults(settings: Settings) -> Result<Self> {
        let timeouts = *settings.timeouts();
        let downloader = HttpDownloader::new(timeouts.download, timeouts.connect)?;
        let tools = settings.cache_dir().join("tools");
        let extractor = SevenZip::locate(&tools, &downloader, &timeouts).await?;
        Ok(Self::new(
            settings,
            extractor,
            downloader,
            NpmToolchain::new(timeouts),
        ))
    }
}

/// The payload bundle a conversion works on.
struct Payload {
    extracted: ExtractedBundle,
    classified: ClassifiedBundle,
    provenance: Provenance,
    installer: Option<BundleClassification>,
}

/// Intermediate trees inside the scratch directory.
struct WorkTree {
    app: PathBuf,
    unpacked: Option<PathBuf>,
}

impl<X: Extractor, D: Downloader, T: ModuleToolchain> Converter<X, D, T> {
    /// Converter with explicit tool implementations.
    pub fn new(settings: Settings, extractor: X, downloader: D, toolchain: T) -> Self {
        Self {
            settings,
            extractor,
            downloader,
            toolchain,
            state: ConversionState::Init,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConversionState {
        self.state
    }

    /// Runs one conversion.
    pub async fn run(&mut self, request: &ConversionRequest) -> Result<ConversionResult> {
        self.state = ConversionState::Init;
        let result = self.convert(request).await;
        if let Err(e) = &result {
            log::debug!("Conversion failed in state {:?}: {}", self.state, e);
            self.state = ConversionState::Failed;
        }
        result
    }

    async fn convert(&mut self, request: &ConversionRequest) -> Result<ConversionResult> {
        validate_request(request)?;
        let launcher_name = &self.settings.profile().launcher_name;
        check_install_target(&request.install_dir, launcher_name)?;
        let workspace = self.create_scratch().await?;
        let scratch = workspace.path();
        log::debug!("Scratch workspace {}", scratch.display());

        let mut skipped = Vec::new();
        let payload = self.resolve_payload(request, scratch, &mut skipped).await?;

        let mut work = unpack_application(payload.extracted.bundle(), scratch).await?;

        let profile = self.settings.profile();
        let patches = PatchEngine::new(&work.app).apply_all(&profile.patches)?;
        advance(&mut self.state, ConversionState::Patched);

        let rebuilder =
            NativeModuleRebuilder::new(&self.toolchain, &profile.runtime_version, scratch);
        let rebuilt_modules = rebuilder.rebuild(&work.app, &profile.native_modules).await?;
        // Compiled add-ons cannot be loaded from inside the packed archive.
        if !rebuilt_modules.is_empty() && work.unpacked.is_none() {
            let dir = scratch.join("unpacked");
            fs::create_dir_all(&dir, false).await?;
            work.unpacked = Some(dir);
        }
        if let Some(unpacked) = &work.unpacked {
            for module in &rebuilt_modules {
                let rel = Path::new("node_modules").join(&module.name);
                fs::replace_dir(&work.app.join(&rel), &unpacked.join(&rel)).await?;
            }
            refresh_unpacked(&work.app, unpacked)?;
        }
        advance(&mut self.state, ConversionState::NativeModulesRebuilt);

        let install_dir = request.install_dir.clone();
        let staging = create_staging(&install_dir).await?;
        let output = staging.path().join("tree");
        runtime::install_runtime(
            self.settings.runtime(),
            &profile.runtime_version,
            self.settings.cache_dir(),
            &self.downloader,
            &output,
        )
        .await?;

        let resources = output.join("resources");
        let archive_rel = Path::new("resources").join("app.asar");
        fs::remove_dir_all(&asar::unpacked_dir_for(&output.join(&archive_rel))).await?;
        std::fs::create_dir_all(&resources)
            .fs_context("creating resources directory", &resources)?;
        asar::pack(&work.app, work.unpacked.as_deref(), &output.join(&archive_rel))?;

        let icon = match payload.classified.info.icon_path(payload.extracted.bundle()) {
            Some(icns) => {
                Some(launcher::install_icon(&icns, &output, &profile.launcher_name).await?)
            }
            None => {
                log::warn!("Payload declares no icon");
                None
            }
        };

        let entry = Launcher {
            product_name: profile.product_name.clone(),
            launcher_name: profile.launcher_name.clone(),
            start_url: request.start_url.clone(),
        };
        let files = entry.write(&output, &install_dir, icon.as_deref()).await?;

        let start_url = match &request.start_url {
            Some(url) => url.clone(),
            None => default_start_url(&work.app, &install_dir.join(&archive_rel))?,
        };

        log::info!("Installing into {}", install_dir.display());
        check_install_target(&install_dir, &profile.launcher_name)?;
        fs::swap_dir(&output, &install_dir, &staging.path().join("previous")).await?;
        advance(&mut self.state, ConversionState::Complete);

        let relocate = |path: &Path| install_dir.join(path.strip_prefix(&output).unwrap_or(path));
        Ok(ConversionResult {
            packed_archive: install_dir.join(&archive_rel),
            launcher: relocate(&files.script),
            desktop_entry: relocate(&files.desktop_entry),
            payload_bundle: payload.extracted.relative_bundle().to_path_buf(),
            payload_provenance: payload.provenance,
            classification: payload.classified.classification,
            installer: payload.installer,
            start_url,
            icon_path: icon.map(|rel| install_dir.join(rel)),
            runtime_version: profile.runtime_version.clone(),
            patches,
            rebuilt_modules,
            skipped,
            install_dir,
        })
    }

    async fn create_scratch(&self) -> Result<tempfile::TempDir> {
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix("kodegen-port-");
            b
        };
        match self.settings.scratch_root() {
            Some(root) => {
                fs::create_dir_all(root, false).await?;
                builder
                    .tempdir_in(root)
                    .fs_context("creating scratch workspace", root)
            }
            None => builder
                .tempdir()
                .fs_context("creating scratch workspace", std::env::temp_dir()),
        }
    }

    /// Resolves, extracts and classifies the input, unwrapping an installer
    /// when necessary.
    async fn resolve_payload(
        &mut self,
        request: &ConversionRequest,
        scratch: &Path,
        skipped: &mut Vec<SkippedCandidate>,
    ) -> Result<Payload> {
        let profile = self.settings.profile();
        let classifier = BundleClassifier::new(&profile.classification);

        let input = self
            .resolve_image("installer image", request.input.as_deref(), &profile.installer, None)
            .await?;
        skipped.extend(input.skipped);
        advance(&mut self.state, ConversionState::ResolvedArtifact);

        let image_dir = scratch.join("image");
        let extracted =
            extract::extract_bundle(&self.extractor, &input.artifact.path, &image_dir).await?;
        advance(&mut self.state, ConversionState::ExtractedBundle);

        let classified = classifier.classify(extracted.bundle()).await?;
        advance(&mut self.state, ConversionState::Classified);

        if matches!(classified.classification, BundleClassification::PayloadApp { .. }) {
            if let Some(payload) = &request.payload {
                log::warn!(
                    "Input is already the application; ignoring payload override {}",
                    payload.display()
                );
            }
            return Ok(Payload {
                extracted,
                classified,
                provenance: input.artifact.provenance,
                installer: None,
            });
        }
        if !matches!(classified.classification, BundleClassification::InstallerApp { .. }) {
            return Err(reject(&classified.classification));
        }

        let discovered = classified.payload_url();
        if let Some(url) = &discovered {
            log::info!("Installer references payload {}", url);
        }
        let payload = self
            .resolve_image(
                "payload image",
                request.payload.as_deref(),
                &profile.payload,
                discovered,
            )
            .await?;
        skipped.extend(payload.skipped);

        let payload_dir = scratch.join("payload");
        let payload_extracted =
            extract::extract_bundle(&self.extractor, &payload.artifact.path, &payload_dir).await?;
        let payload_classified = classifier.classify(payload_extracted.bundle()).await?;
        match &payload_classified.classification {
            BundleClassification::PayloadApp { .. } => {}
            BundleClassification::InstallerApp { name, .. } => {
                return Err(Error::InputValidation(format!(
                    "payload image contains another installer ('{name}'), expected the application"
                )));
            }
            other => return Err(reject(other)),
        }
        advance(&mut self.state, ConversionState::PayloadResolved);

        Ok(Payload {
            extracted: payload_extracted,
            classified: payload_classified,
            provenance: payload.artifact.provenance,
            installer: Some(classified.classification),
        })
    }

    async fn resolve_image(
        &self,
        what: &str,
        explicit: Option<&Path>,
        sources: &ArtifactSources,
        discovered_url: Option<String>,
    ) -> Result<Resolution> {
        let fallback = sources.url.clone().or(discovered_url).map(|url| NetworkFallback {
            url,
            cache_path: self.settings.cache_path(sources),
        });
        ArtifactResolver::new(&self.downloader)
            .resolve(what, explicit, &sources.paths, fallback)
            .await
    }
}

fn advance(state: &mut ConversionState, next: ConversionState) {
    log::debug!("{:?} -> {:?}", state, next);
    *state = next;
}

fn reject(classification: &BundleClassification) -> Error {
    match classification {
        BundleClassification::UnsupportedPackage { name, marker } => {
            Error::InputValidation(format!(
                "'{name}' is an unsupported package ({marker} present); \
                 download the standard release instead"
            ))
        }
        other => Error::ClassificationAmbiguous {
            name: other.name().to_string(),
        },
    }
}

fn validate_request(request: &ConversionRequest) -> Result<()> {
    let dir = &request.install_dir;
    if dir.as_os_str().is_empty() || dir.parent().is_none() {
        return Err(Error::InputValidation(format!(
            "install directory '{}' is not usable",
            dir.display()
        )));
    }
    if let Some(url) = &request.start_url {
        url::Url::parse(url)
            .map_err(|e| Error::InputValidation(format!("start URL '{url}' is invalid: {e}")))?;
    }
    Ok(())
}

/// Refuses an install directory that holds anything other than an earlier
/// conversion, recognised by its desktop entry.
fn check_install_target(install_dir: &Path, launcher_name: &str) -> Result<()> {
    if std::fs::symlink_metadata(install_dir).is_err() || fs::is_empty_dir(install_dir) {
        return Ok(());
    }
    if !install_dir.is_dir() {
        return Err(Error::InputValidation(format!(
            "install directory '{}' exists and is not a directory",
            install_dir.display()
        )));
    }
    let marker = format!("{launcher_name}.desktop");
    if install_dir.join(&marker).is_file() {
        return Ok(());
    }
    Err(Error::InputValidation(format!(
        "install directory '{}' is not empty and has no {marker}; \
         refusing to replace it",
        install_dir.display()
    )))
}

/// Hidden directory next to `install_dir` that the output is assembled in,
/// so it can be renamed into place.
async fn create_staging(install_dir: &Path) -> Result<tempfile::TempDir> {
    let parent = match install_dir.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent, false).await?;
    tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempdir_in(parent)
        .fs_context("creating staging directory", parent)
}

/// Extracts the bundle's packed archive into `scratch/app` and keeps a copy of
/// the unpacked set in `scratch/unpacked`.
async fn unpack_application(bundle: &Path, scratch: &Path) -> Result<WorkTree> {
    let archive_path = bundle.join(PACKED_ARCHIVE);
    if !archive_path.is_file() {
        return Err(Error::InputValidation(format!(
            "payload bundle has no {PACKED_ARCHIVE}"
        )));
    }

    let archive = PackedArchive::open(&archive_path)?;
    let app = scratch.join("app");
    archive.extract_to(&app)?;

    let source = archive.unpacked_dir();
    let unpacked = if source.is_dir() {
        let copy = scratch.join("unpacked");
        fs::copy_dir(&source, &copy).await?;
        Some(copy)
    } else {
        None
    };

    log::info!(
        "Unpacked {} ({} unpacked file(s))",
        archive_path.display(),
        archive.unpacked_paths()?.len()
    );
    Ok(WorkTree { app, unpacked })
}

/// Copies the current content of every unpacked file from the application
/// tree, so patched files are not shadowed by stale unpacked copies.
fn refresh_unpacked(app: &Path, unpacked: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(unpacked).min_depth(1) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(unpacked)?;
        let current = app.join(rel);
        if current.is_file() {
            std::fs::copy(&current, entry.path())
                .fs_context("refreshing unpacked file", entry.path())?;
        }
    }
    Ok(())
}

/// `file://` URL of the application's entry script inside the installed
/// archive.
fn default_start_url(app: &Path, installed_archive: &Path) -> Result<String> {
    let manifest = app.join("package.json");
    let main = match std::fs::read_to_string(&manifest) {
        Ok(text) => serde_json::from_str::<serde_json::Value>(&text)?
            .get("main")
            .and_then(|m| m.as_str())
            .unwrap_or("index.js")
            .to_string(),
        Err(_) => {
            log::warn!("Application has no package.json; assuming index.js");
            "index.js".to_string()
        }
    };

    let entry = installed_archive.join(main.trim_start_matches("./"));
    let absolute = if entry.is_absolute() {
        entry
    } else {
        std::env::current_dir()?.join(entry)
    };
    url::Url::from_file_path(&absolute)
        .map(|url| url.to_string())
        .map_err(|()| {
            Error::GenericError(format!("cannot express {} as a URL", absolute.display()))
        })
}
