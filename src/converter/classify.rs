//! Bundle classification.
//!
//! Decides whether an extracted `*.app` is the product itself, an installer
//! that wraps it, a package shape we refuse to convert, or something unknown.
//! Every signature comes from the profile's [`SignatureTable`]; the rules and
//! their order are fixed:
//!
//! 1. reject marker present: [`BundleClassification::UnsupportedPackage`]
//! 2. nested payload bundle present: [`BundleClassification::PayloadApp`]
//! 3. declared name contains a brand token: [`BundleClassification::PayloadApp`]
//! 4. main executable strings: installer signatures, then payload signatures
//!
//! Anything else is [`BundleClassification::UnknownApp`].

use crate::converter::{
    error::{Context, Error, ErrorExt, Result},
    settings::SignatureTable,
    utils::process,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use tokio::process::Command;

/// Shortest printable run reported by the raw string scan.
pub const MIN_STRING_LEN: usize = 4;

const STRINGS_BUDGET: Duration = Duration::from_secs(120);

/// Outcome of classifying one bundle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BundleClassification {
    /// The product application.
    PayloadApp {
        /// Display name
        name: String,
        /// Rule or signature that matched
        signature: String,
    },
    /// An installer that downloads or embeds the product.
    InstallerApp {
        /// Display name
        name: String,
        /// Installer signature that matched
        signature: String,
    },
    /// A package shape that cannot be converted.
    UnsupportedPackage {
        /// Display name
        name: String,
        /// Marker file that was found
        marker: String,
    },
    /// Nothing matched.
    UnknownApp {
        /// Display name
        name: String,
    },
}

impl BundleClassification {
    /// Display name of the classified bundle.
    pub fn name(&self) -> &str {
        match self {
            Self::PayloadApp { name, .. }
            | Self::InstallerApp { name, .. }
            | Self::UnsupportedPackage { name, .. }
            | Self::UnknownApp { name } => name,
        }
    }

    /// Short label for log messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PayloadApp { .. } => "payload application",
            Self::InstallerApp { .. } => "installer",
            Self::UnsupportedPackage { .. } => "unsupported package",
            Self::UnknownApp { .. } => "unknown application",
        }
    }
}

/// The subset of `Contents/Info.plist` the converter reads.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BundleInfo {
    /// Short bundle name
    #[serde(rename = "CFBundleName")]
    pub name: Option<String>,
    /// User-visible name
    #[serde(rename = "CFBundleDisplayName")]
    pub display_name: Option<String>,
    /// Main executable file name
    #[serde(rename = "CFBundleExecutable")]
    pub executable: Option<String>,
    /// Icon file in `Contents/Resources`
    #[serde(rename = "CFBundleIconFile")]
    pub icon_file: Option<String>,
    /// Reverse-DNS bundle identifier
    #[serde(rename = "CFBundleIdentifier")]
    pub identifier: Option<String>,
    /// Marketing version
    #[serde(rename = "CFBundleShortVersionString")]
    pub version: Option<String>,
}

impl BundleInfo {
    /// Reads `Contents/Info.plist`; a bundle without one yields empty info.
    pub fn read(bundle: &Path) -> Result<Self> {
        let path = bundle.join("Contents/Info.plist");
        if !path.is_file() {
            log::debug!("{} has no Info.plist", bundle.display());
            return Ok(Self::default());
        }
        plist::from_file(&path)
            .map_err(Error::from)
            .with_context(|| format!("reading {}", path.display()))
    }

    /// Declared name, falling back to the display name and then the bundle
    /// directory stem.
    pub fn declared_name(&self, bundle: &Path) -> String {
        let name = self.name.as_deref().filter(|n| !n.trim().is_empty());
        let display = self.display_name.as_deref().filter(|n| !n.trim().is_empty());
        name.or(display)
            .map(str::to_string)
            .unwrap_or_else(|| bundle_stem(bundle))
    }

    /// Icon file inside `Contents/Resources`, with the `.icns` extension the
    /// plist is allowed to omit.
    pub fn icon_path(&self, bundle: &Path) -> Option<PathBuf> {
        let file = self.icon_file.as_deref()?;
        let mut path = bundle.join("Contents/Resources").join(file);
        if path.extension().is_none() {
            path.set_extension("icns");
        }
        path.is_file().then_some(path)
    }
}

/// A classified bundle together with what was learned while classifying it.
#[derive(Debug, Clone)]
pub struct ClassifiedBundle {
    /// The classification
    pub classification: BundleClassification,
    /// Parsed `Info.plist`
    pub info: BundleInfo,
    /// Main executable, if one was found.
    pub executable: Option<PathBuf>,
    strings: Vec<String>,
}

impl ClassifiedBundle {
    /// First `https://….dmg` URL embedded in the main executable.
    ///
    /// Only populated when classification reached the string rules, which is
    /// always the case for installers.
    pub fn payload_url(&self) -> Option<String> {
        find_payload_url(&self.strings)
    }
}

/// Classifies bundles against a signature table.
#[derive(Debug, Clone)]
pub struct BundleClassifier<'a> {
    table: &'a SignatureTable,
}

impl<'a> BundleClassifier<'a> {
    /// Creates a classifier for `table`.
    pub fn new(table: &'a SignatureTable) -> Self {
        Self { table }
    }

    /// Classifies the bundle directory `bundle`.
    pub async fn classify(&self, bundle: &Path) -> Result<ClassifiedBundle> {
        let info = BundleInfo::read(bundle)?;
        let name = info.declared_name(bundle);
        let stem = bundle_stem(bundle);
        let executable = main_executable(bundle, &info);

        let done = |classification: BundleClassification, strings: Vec<String>| {
            log::info!(
                "Classified '{}' as {}",
                classification.name(),
                classification.kind()
            );
            ClassifiedBundle {
                classification,
                info: info.clone(),
                executable: executable.clone(),
                strings,
            }
        };

        if let Some(marker) = self
            .table
            .unsupported_markers
            .iter()
            .find(|m| bundle.join(m.as_str()).exists())
        {
            return Ok(done(
                BundleClassification::UnsupportedPackage {
                    name,
                    marker: marker.clone(),
                },
                Vec::new(),
            ));
        }

        if let Some(nested) = self
            .table
            .nested_payload_paths
            .iter()
            .map(|p| p.replace("{name}", &stem))
            .find(|p| bundle.join(p).is_dir())
        {
            return Ok(done(
                BundleClassification::PayloadApp {
                    name,
                    signature: nested,
                },
                Vec::new(),
            ));
        }

        if let Some(token) = self
            .table
            .brand_tokens
            .iter()
            .find(|t| !t.is_empty() && name.contains(t.as_str()))
        {
            let signature = format!("name:{token}");
            return Ok(done(
                BundleClassification::PayloadApp { name, signature },
                Vec::new(),
            ));
        }

        let strings = match &executable {
            Some(exe) => executable_strings(exe).await?,
            None => {
                log::warn!("No main executable found in {}", bundle.display());
                Vec::new()
            }
        };

        let installer = find_signature(&strings, &self.table.installer_signatures);
        let payload = find_signature(&strings, &self.table.payload_signatures);
        let classification = if let Some(sig) = installer {
            BundleClassification::InstallerApp {
                name,
                signature: sig.to_string(),
            }
        } else if let Some(sig) = payload {
            BundleClassification::PayloadApp {
                name,
                signature: sig.to_string(),
            }
        } else {
            BundleClassification::UnknownApp { name }
        };
        Ok(done(classification, strings))
    }
}

fn bundle_stem(bundle: &Path) -> String {
    bundle
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn find_signature<'s>(strings: &[String], signatures: &'s [String]) -> Option<&'s str> {
    signatures
        .iter()
        .filter(|sig| !sig.is_empty())
        .find(|sig| strings.iter().any(|s| s.contains(sig.as_str())))
        .map(String::as_str)
}

/// Resolves the bundle's main executable: `CFBundleExecutable`, then the
/// bundle stem, then the only file in `Contents/MacOS`.
pub fn main_executable(bundle: &Path, info: &BundleInfo) -> Option<PathBuf> {
    let macos = bundle.join("Contents/MacOS");
    let declared = info.executable.as_deref().map(|e| macos.join(e));
    let by_stem = Some(macos.join(bundle_stem(bundle)));

    if let Some(path) = [declared, by_stem].into_iter().flatten().find(|p| p.is_file()) {
        return Some(path);
    }

    let files: Vec<PathBuf> = std::fs::read_dir(&macos)
        .ok()?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    match files.as_slice() {
        [only] => Some(only.clone()),
        _ => None,
    }
}

/// Printable strings of an executable, via `strings -a` when installed and a
/// raw scan otherwise.
pub async fn executable_strings(path: &Path) -> Result<Vec<String>> {
    if let Ok(tool) = which::which("strings") {
        let mut cmd = Command::new(tool);
        cmd.arg("-a").arg(path);
        match process::run_checked(cmd, "strings", STRINGS_BUDGET).await {
            Ok(output) => {
                return Ok(String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .filter(|l| l.len() >= MIN_STRING_LEN)
                    .map(str::to_string)
                    .collect());
            }
            Err(e) => log::warn!("strings failed, scanning {} directly: {}", path.display(), e),
        }
    }

    let data = tokio::fs::read(path)
        .await
        .fs_context("reading main executable", path)?;
    log::debug!("{} is {}", path.display(), describe_executable(&data));
    Ok(printable_strings(&data, MIN_STRING_LEN))
}

/// Runs of at least `min_len` printable ASCII bytes.
pub fn printable_strings(data: &[u8], min_len: usize) -> Vec<String> {
    data.split(|b| !(b.is_ascii_graphic() || *b == b' ' || *b == b'\t'))
        .filter(|run| run.len() >= min_len)
        .map(|run| String::from_utf8_lossy(run).into_owned())
        .collect()
}

/// First `https://….dmg` URL among `strings`.
pub fn find_payload_url(strings: &[String]) -> Option<String> {
    static DMG_URL: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#"https://[^\s"'<>()]+?\.dmg\b"#).expect("payload URL regex is valid")
    });
    strings
        .iter()
        .find_map(|s| DMG_URL.find(s).map(|m| m.as_str().to_string()))
}

fn describe_executable(data: &[u8]) -> &'static str {
    match goblin::Object::parse(data) {
        Ok(goblin::Object::Mach(goblin::mach::Mach::Fat(_))) => "a universal Mach-O binary",
        Ok(goblin::Object::Mach(goblin::mach::Mach::Binary(_))) => "a Mach-O binary",
        Ok(goblin::Object::Elf(_)) => "an ELF binary",
        Ok(_) => "a non-Mach-O object",
        Err(_) => "not a recognized object file",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> SignatureTable {
        SignatureTable {
            brand_tokens: vec!["Claude".into()],
            nested_payload_paths: vec!["Contents/Frameworks/{name} Helper.app".into()],
            installer_signatures: vec!["InstallerKit".into()],
            payload_signatures: vec!["com.example.product".into()],
            unsupported_markers: vec!["Contents/_MASReceipt/receipt".into()],
        }
    }

    fn bundle(root: &Path, name: &str, exe: &[u8]) -> PathBuf {
        let app = root.join(format!("{name}.app"));
        std::fs::create_dir_all(app.join("Contents/MacOS")).unwrap();
        std::fs::write(app.join("Contents/MacOS").join(name), exe).unwrap();
        app
    }

    #[tokio::test]
    async fn test_nested_bundle_wins_over_executable_contents() {
        let tmp = tempfile::tempdir().unwrap();
        let app = bundle(tmp.path(), "Product", b"\x00\x01InstallerKit\x00");
        std::fs::create_dir_all(app.join("Contents/Frameworks/Product Helper.app")).unwrap();

        let table = table();
        let result = BundleClassifier::new(&table).classify(&app).await.unwrap();
        assert_eq!(
            result.classification,
            BundleClassification::PayloadApp {
                name: "Product".into(),
                signature: "Contents/Frameworks/Product Helper.app".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_reject_marker_wins_over_payload_signatures() {
        let tmp = tempfile::tempdir().unwrap();
        let app = bundle(tmp.path(), "Claude", b"com.example.product");
        std::fs::create_dir_all(app.join("Contents/_MASReceipt")).unwrap();
        std::fs::write(app.join("Contents/_MASReceipt/receipt"), b"r").unwrap();

        let table = table();
        let result = BundleClassifier::new(&table).classify(&app).await.unwrap();
        assert!(matches!(
            result.classification,
            BundleClassification::UnsupportedPackage { .. }
        ));
    }

    #[tokio::test]
    async fn test_brand_token_in_stem() {
        let tmp = tempfile::tempdir().unwrap();
        let app = bundle(tmp.path(), "Claude", b"");

        let table = table();
        let result = BundleClassifier::new(&table).classify(&app).await.unwrap();
        assert_eq!(result.classification.name(), "Claude");
        assert!(matches!(
            result.classification,
            BundleClassification::PayloadApp { .. }
        ));
    }

    #[tokio::test]
    async fn test_installer_signature_checked_before_payload() {
        let tmp = tempfile::tempdir().unwrap();
        let exe = b"\x00\x00com.example.product\x00InstallerKit\x00\
                    https://downloads.example.com/release/Product-1.2.dmg\x00";
        let app = bundle(tmp.path(), "Setup", exe);

        let table = table();
        let result = BundleClassifier::new(&table).classify(&app).await.unwrap();
        assert_eq!(
            result.classification,
            BundleClassification::InstallerApp {
                name: "Setup".into(),
                signature: "InstallerKit".into(),
            }
        );
        assert_eq!(
            result.payload_url().as_deref(),
            Some("https://downloads.example.com/release/Product-1.2.dmg")
        );
    }

    #[tokio::test]
    async fn test_unknown_when_nothing_matches() {
        let tmp = tempfile::tempdir().unwrap();
        let app = bundle(tmp.path(), "Other", b"nothing interesting here");

        let table = table();
        let result = BundleClassifier::new(&table).classify(&app).await.unwrap();
        assert_eq!(
            result.classification,
            BundleClassification::UnknownApp {
                name: "Other".into()
            }
        );
    }

    #[tokio::test]
    async fn test_builtin_profile_keeps_branded_installer_an_installer() {
        let tmp = tempfile::tempdir().unwrap();
        let exe = b"\x00ClaudeInstaller\x00https://downloads.example.com/Claude.dmg\x00";
        let app = bundle(tmp.path(), "Claude Installer", exe);

        let profile = crate::converter::Profile::builtin().unwrap();
        let result = BundleClassifier::new(&profile.classification)
            .classify(&app)
            .await
            .unwrap();
        assert!(matches!(
            result.classification,
            BundleClassification::InstallerApp { .. }
        ));
    }

    #[test]
    fn test_declared_name_skips_blank_name() {
        let info = BundleInfo {
            name: Some("  ".into()),
            display_name: Some("Claude".into()),
            ..Default::default()
        };
        assert_eq!(info.declared_name(Path::new("/tmp/Other.app")), "Claude");

        let info = BundleInfo {
            name: Some(String::new()),
            ..Default::default()
        };
        assert_eq!(info.declared_name(Path::new("/tmp/Other.app")), "Other");
    }

    #[test]
    fn test_printable_strings_min_length() {
        let data = b"abc\x00abcd\x01\x02hello world\xff";
        assert_eq!(printable_strings(data, 4), vec!["abcd", "hello world"]);
    }

    #[test]
    fn test_main_executable_falls_back_to_only_file() {
        let tmp = tempfile::tempdir().unwrap();
        let app = tmp.path().join("Thing.app");
        std::fs::create_dir_all(app.join("Contents/MacOS")).unwrap();
        std::fs::write(app.join("Contents/MacOS/launcher"), b"x").unwrap();

        let info = BundleInfo {
            executable: Some("missing".into()),
            ..Default::default()
        };
        assert_eq!(
            main_executable(&app, &info),
            Some(app.join("Contents/MacOS/launcher"))
        );
    }
}
