//! macOS disk image to Linux application conversion.
//!
//! Takes a released disk image (`.dmg`) of an Electron application and
//! produces a runnable Linux tree: the target runtime, the repacked
//! application archive with platform patches applied, natively rebuilt
//! add-ons, the icon and a launcher.
//!
//! # Pipeline
//!
//! | Step | Module | Notes |
//! |------|--------|-------|
//! | Resolve | [`resolve`] | override, well-known paths, then download |
//! | Validate | [`dmg`] | `koly` trailer in the last 2 KiB |
//! | Extract | [`extract`] | 7-Zip, fetched when too old |
//! | Classify | [`classify`] | payload, installer, unsupported, unknown |
//! | Patch | [`patch`] | literal substitutions with count checks |
//! | Rebuild | [`native`] | add-ons rebuilt against the runtime ABI |
//! | Assemble | [`asar`], [`runtime`], [`launcher`] | output tree |
//!
//! [`Converter`] sequences the steps.
//!
//! ```no_run
//! use kodegen_bundler_port::converter::{ConversionRequest, Converter, SettingsBuilder};
//!
//! # async fn example() -> kodegen_bundler_port::converter::Result<()> {
//! let settings = SettingsBuilder::new().build()?;
//! let mut converter = Converter::with_defaults(settings).await?;
//! let result = converter
//!     .run(&ConversionRequest {
//!         install_dir: "/opt/claude-desktop".into(),
//!         ..Default::default()
//!     })
//!     .await?;
//! println!("{}", result.launcher.display());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod asar;
pub mod classify;
pub mod dmg;
pub mod error;
pub mod extract;
pub mod launcher;
pub mod native;
pub mod patch;
pub mod pipeline;
pub mod resolve;
pub mod runtime;
pub mod settings;
pub mod utils;

pub use classify::{BundleClassification, BundleClassifier, BundleInfo, ClassifiedBundle};
pub use error::{Context, Error, ErrorClass, ErrorExt, Result};
pub use extract::{ExtractedBundle, Extractor, SevenZip};
pub use native::{ModuleToolchain, NativeModuleRebuilder, NativeModuleSpec, NpmToolchain};
pub use patch::{PatchEngine, PatchOutcome, PatchReport, PatchSpec};
pub use pipeline::{ConversionRequest, ConversionResult, ConversionState, Converter};
pub use resolve::{Artifact, ArtifactResolver, NetworkFallback, Provenance, SkippedCandidate};
pub use settings::{
    default_cache_dir, ArtifactSources, Profile, RuntimeSource, Settings, SettingsBuilder,
    SignatureTable, Timeouts,
};
pub use utils::http::{Downloader, HttpDownloader};
