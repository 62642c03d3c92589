//! End-to-end conversions against generated fixtures.
//!
//! Disk images are stand-in files whose first line names a prepared tree;
//! the fake extractor copies that tree, so the whole pipeline runs without
//! 7-Zip, network access or a Node.js toolchain.

use kodegen_bundler_port::converter::{
    asar::{self, PackedArchive},
    utils::fs::copy_dir,
    BundleClassification, ConversionRequest, ConversionState, Converter, Downloader, ErrorClass,
    Extractor, ModuleToolchain, NativeModuleSpec, PatchOutcome, Profile, Provenance, Result,
    RuntimeSource, Settings, SettingsBuilder,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const PAYLOAD_URL: &str = "https://downloads.example.com/Claude-payload.dmg";

const INDEX_JS: &str = concat!(
    "const w=new BrowserWindow({titleBarStyle:\"hiddenInset\"});\n",
    "const t=process.platform===\"darwin\"?\"TrayIconTemplate.png\":\"Tray-Win32.ico\";\n",
);

/// Copies the tree named on the image's first line.
struct TreeExtractor {
    trees: PathBuf,
}

impl Extractor for TreeExtractor {
    async fn extract(&self, archive: &Path, dest: &Path) -> Result<()> {
        let text = std::fs::read(archive)?;
        let first = String::from_utf8_lossy(&text);
        let name = first
            .lines()
            .next()
            .and_then(|l| l.strip_prefix("IMAGE:"))
            .unwrap_or_default()
            .to_string();
        copy_dir(&self.trees.join(name), dest).await
    }
}

/// Serves fixed bodies per URL and records every request.
#[derive(Default)]
struct MapDownloader {
    bodies: HashMap<String, Vec<u8>>,
    requested: Arc<Mutex<Vec<String>>>,
    /// Never finish a download
    stall: bool,
}

impl MapDownloader {
    fn log(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.requested)
    }
}

impl Downloader for MapDownloader {
    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        self.requested.lock().unwrap().push(url.to_string());
        if self.stall {
            std::future::pending::<()>().await;
        }
        let body = self.bodies.get(url).cloned().unwrap_or_default();
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(dest, body)?;
        Ok(())
    }
}

/// Produces a rebuilt module carrying a Linux marker.
struct MarkerToolchain;

impl ModuleToolchain for MarkerToolchain {
    async fn fetch_headers(&self, _runtime_version: &str, _workspace: &Path) -> Result<()> {
        Ok(())
    }

    async fn fetch_package(&self, module: &NativeModuleSpec, workspace: &Path) -> Result<()> {
        let dir = workspace.join("node_modules").join(&module.name);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(
            dir.join("package.json"),
            format!(r#"{{"name":"{}","version":"{}"}}"#, module.name, module.version),
        )?;
        Ok(())
    }

    async fn compile(&self, modules: &[NativeModuleSpec], workspace: &Path) -> Result<()> {
        for module in modules {
            let release = workspace
                .join("node_modules")
                .join(&module.name)
                .join("build/Release");
            std::fs::create_dir_all(&release)?;
            std::fs::write(release.join("pty.node"), b"linux")?;
        }
        Ok(())
    }
}

struct Fixture {
    _tmp: tempfile::TempDir,
    root: PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_path_buf();
        let runtime = root.join("runtime-dist");
        std::fs::create_dir_all(runtime.join("resources")).unwrap();
        std::fs::write(runtime.join("electron"), b"#!/bin/sh\n").unwrap();
        std::fs::write(runtime.join("resources/default_app.asar"), b"x").unwrap();
        Self { _tmp: tmp, root }
    }

    fn trees(&self) -> PathBuf {
        self.root.join("trees")
    }

    fn scratch(&self) -> PathBuf {
        self.root.join("scratch")
    }

    fn cache(&self) -> PathBuf {
        self.root.join("cache")
    }

    fn install_dir(&self) -> PathBuf {
        self.root.join("install").join("claude-desktop")
    }

    /// Writes a stand-in image for the tree `name`, ending in the disk image
    /// trailer.
    fn image_bytes(name: &str) -> Vec<u8> {
        let mut data = format!("IMAGE:{name}\n").into_bytes();
        data.extend(std::iter::repeat(0u8).take(256));
        data.extend_from_slice(b"koly");
        data.extend(std::iter::repeat(0u8).take(508));
        data
    }

    fn image(&self, name: &str) -> PathBuf {
        let path = self.root.join("images").join(format!("{name}.dmg"));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, Self::image_bytes(name)).unwrap();
        path
    }

    /// Payload application tree `name` holding `Claude.app`.
    fn payload_tree(&self, name: &str, index_js: &str) -> PathBuf {
        let bundle = self.trees().join(name).join("Claude.app");
        let contents = bundle.join("Contents");
        std::fs::create_dir_all(contents.join("MacOS")).unwrap();
        std::fs::create_dir_all(contents.join("Resources")).unwrap();
        std::fs::write(
            contents.join("Info.plist"),
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>CFBundleName</key>
    <string>Claude</string>
    <key>CFBundleExecutable</key>
    <string>Claude</string>
    <key>CFBundleIconFile</key>
    <string>electron</string>
</dict>
</plist>
"#,
        )
        .unwrap();
        let exe = b"\x00com.anthropic.claudefordesktop";
        std::fs::write(contents.join("MacOS/Claude"), exe).unwrap();
        std::fs::write(contents.join("Resources/electron.icns"), b"not really an icon").unwrap();

        let src = self.root.join("asar-src").join(name);
        std::fs::create_dir_all(src.join(".vite/build")).unwrap();
        std::fs::create_dir_all(src.join("node_modules/node-pty")).unwrap();
        std::fs::write(
            src.join("package.json"),
            r#"{"name":"claude","main":".vite/build/index.js"}"#,
        )
        .unwrap();
        std::fs::write(src.join(".vite/build/index.js"), index_js).unwrap();
        std::fs::write(
            src.join("node_modules/node-pty/package.json"),
            r#"{"name":"node-pty","version":"1.0.0"}"#,
        )
        .unwrap();

        let unpacked = self.root.join("asar-unpacked").join(name);
        std::fs::create_dir_all(unpacked.join("node_modules/node-pty/build/Release")).unwrap();
        std::fs::write(
            unpacked.join("node_modules/node-pty/build/Release/pty.node"),
            b"darwin",
        )
        .unwrap();

        asar::pack(&src, Some(&unpacked), &contents.join("Resources/app.asar")).unwrap();
        bundle
    }

    /// Installer tree `name` whose executable names the payload URL.
    fn installer_tree(&self, name: &str) -> PathBuf {
        let bundle = self.trees().join(name).join("Claude Installer.app");
        let macos = bundle.join("Contents/MacOS");
        std::fs::create_dir_all(&macos).unwrap();
        let mut exe = b"\x00\x00".to_vec();
        exe.extend_from_slice(b"ClaudeInstaller\x00\x00");
        exe.extend_from_slice(PAYLOAD_URL.as_bytes());
        exe.extend_from_slice(b"\x00\x00");
        std::fs::write(macos.join("Claude Installer"), exe).unwrap();
        bundle
    }

    fn settings(&self) -> Settings {
        let mut profile = Profile::builtin().unwrap();
        profile.installer.paths.clear();
        profile.installer.url = None;
        profile.payload.paths.clear();
        profile.payload.url = None;

        SettingsBuilder::new()
            .profile(profile)
            .cache_dir(self.cache())
            .scratch_root(self.scratch())
            .runtime(RuntimeSource::Local(self.root.join("runtime-dist")))
            .build()
            .unwrap()
    }

    fn converter(
        &self,
        downloader: MapDownloader,
    ) -> Converter<TreeExtractor, MapDownloader, MarkerToolchain> {
        Converter::new(
            self.settings(),
            TreeExtractor { trees: self.trees() },
            downloader,
            MarkerToolchain,
        )
    }

    fn request(&self, input: PathBuf) -> ConversionRequest {
        ConversionRequest {
            input: Some(input),
            install_dir: self.install_dir(),
            ..Default::default()
        }
    }

    fn scratch_is_clean(&self) -> bool {
        std::fs::read_dir(self.scratch())
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    }
}

fn serving_payload() -> MapDownloader {
    let mut downloader = MapDownloader::default();
    downloader
        .bodies
        .insert(PAYLOAD_URL.to_string(), Fixture::image_bytes("payload"));
    downloader
}

#[tokio::test]
async fn test_installer_fetches_payload_and_installs() {
    let fx = Fixture::new();
    fx.payload_tree("payload", INDEX_JS);
    fx.installer_tree("installer");
    let input = fx.image("installer");

    let downloader = serving_payload();
    let requested = downloader.log();
    let mut converter = fx.converter(downloader);
    let result = converter.run(&fx.request(input)).await.unwrap();

    assert_eq!(converter.state(), ConversionState::Complete);
    assert_eq!(result.payload_bundle, PathBuf::from("Claude.app"));
    assert_eq!(result.payload_provenance, Provenance::Downloaded);
    assert!(matches!(
        result.installer,
        Some(BundleClassification::InstallerApp { .. })
    ));
    assert!(matches!(
        result.classification,
        BundleClassification::PayloadApp { .. }
    ));
    assert_eq!(result.patches.len(), 2);
    assert!(result
        .patches
        .iter()
        .all(|p| p.outcome == PatchOutcome::Applied));
    assert_eq!(result.rebuilt_modules.len(), 1);
    assert_eq!(result.rebuilt_modules[0].version, "1.0.0");
    assert_eq!(result.rebuilt_modules[0].target_runtime_version, "37.2.6");

    let install = fx.install_dir();
    assert_eq!(result.install_dir, install);
    assert!(install.join("electron").is_file());
    assert!(result.launcher.is_file());
    assert!(result.desktop_entry.is_file());
    assert!(result.launcher.starts_with(&install));
    let addon = "resources/app.asar.unpacked/node_modules/node-pty/build/Release/pty.node";
    assert_eq!(std::fs::read(install.join(addon)).unwrap(), b"linux");

    let archive = PackedArchive::open(&result.packed_archive).unwrap();
    let index = archive.read_file(Path::new(".vite/build/index.js")).unwrap();
    let index = String::from_utf8(index).unwrap();
    assert!(index.contains(r#"titleBarStyle:process.platform==="linux"?"default":"hiddenInset""#));
    assert!(!index.contains(r#"titleBarStyle:"hiddenInset""#));

    assert!(result.start_url.starts_with("file://"));
    assert!(result.start_url.ends_with("resources/app.asar/.vite/build/index.js"));

    let entry = std::fs::read_to_string(&result.desktop_entry).unwrap();
    assert!(entry.contains("Name=Claude"));

    assert_eq!(*requested.lock().unwrap(), vec![PAYLOAD_URL.to_string()]);
    assert!(fx.scratch_is_clean());
}

#[tokio::test]
async fn test_cached_payload_is_reused() {
    let fx = Fixture::new();
    fx.payload_tree("payload", INDEX_JS);
    fx.installer_tree("installer");
    let input = fx.image("installer");

    std::fs::create_dir_all(fx.cache()).unwrap();
    std::fs::write(fx.cache().join("payload.dmg"), Fixture::image_bytes("payload")).unwrap();

    let downloader = MapDownloader::default();
    let requested = downloader.log();
    let mut converter = fx.converter(downloader);
    let result = converter.run(&fx.request(input)).await.unwrap();

    assert_eq!(result.payload_provenance, Provenance::Downloaded);
    assert!(requested.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_payload_image_used_directly() {
    let fx = Fixture::new();
    fx.payload_tree("payload", INDEX_JS);
    let input = fx.image("payload");

    let downloader = MapDownloader::default();
    let requested = downloader.log();
    let mut converter = fx.converter(downloader);
    let mut request = fx.request(input);
    request.start_url = Some("https://claude.ai/".to_string());
    let result = converter.run(&request).await.unwrap();

    assert_eq!(result.payload_provenance, Provenance::Override);
    assert!(result.installer.is_none());
    assert_eq!(result.start_url, "https://claude.ai/");
    let script = std::fs::read_to_string(&result.launcher).unwrap();
    assert!(script.contains("--start-url="));
    assert!(requested.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_store_package_rejected_before_anything_is_installed() {
    let fx = Fixture::new();
    let bundle = fx.payload_tree("store", INDEX_JS);
    std::fs::create_dir_all(bundle.join("Contents/_MASReceipt")).unwrap();
    std::fs::write(bundle.join("Contents/_MASReceipt/receipt"), b"receipt").unwrap();
    let input = fx.image("store");

    let mut converter = fx.converter(MapDownloader::default());
    let err = converter.run(&fx.request(input)).await.unwrap_err();

    assert_eq!(err.class(), ErrorClass::InputValidation);
    assert_eq!(converter.state(), ConversionState::Failed);
    assert!(!fx.install_dir().exists());
    assert!(fx.scratch_is_clean());
}

#[tokio::test]
async fn test_unrecognized_bundle_is_ambiguous() {
    let fx = Fixture::new();
    let bundle = fx.trees().join("notes").join("Notes.app");
    std::fs::create_dir_all(bundle.join("Contents/MacOS")).unwrap();
    std::fs::write(bundle.join("Contents/MacOS/Notes"), b"\x00nothing to see").unwrap();
    let input = fx.image("notes");

    let mut converter = fx.converter(MapDownloader::default());
    let err = converter.run(&fx.request(input)).await.unwrap_err();

    assert_eq!(err.class(), ErrorClass::ClassificationAmbiguous);
    assert!(!fx.install_dir().exists());
}

#[tokio::test]
async fn test_payload_that_is_another_installer_rejected() {
    let fx = Fixture::new();
    fx.installer_tree("installer");
    let input = fx.image("installer");

    let mut downloader = MapDownloader::default();
    downloader
        .bodies
        .insert(PAYLOAD_URL.to_string(), Fixture::image_bytes("installer"));
    let mut converter = fx.converter(downloader);
    let err = converter.run(&fx.request(input)).await.unwrap_err();

    assert_eq!(err.class(), ErrorClass::InputValidation);
    assert_eq!(converter.state(), ConversionState::Failed);
}

#[tokio::test]
async fn test_patch_drift_leaves_install_dir_untouched() {
    let fx = Fixture::new();
    let drifted = format!("{INDEX_JS}const again={{titleBarStyle:\"hiddenInset\"}};\n");
    fx.payload_tree("payload", &drifted);
    let input = fx.image("payload");

    std::fs::create_dir_all(fx.install_dir()).unwrap();
    std::fs::write(fx.install_dir().join("claude-desktop.desktop"), b"[Desktop Entry]").unwrap();
    std::fs::write(fx.install_dir().join("previous"), b"kept").unwrap();

    let mut converter = fx.converter(MapDownloader::default());
    let err = converter.run(&fx.request(input)).await.unwrap_err();

    assert_eq!(err.class(), ErrorClass::PatchInvariantViolation);
    assert_eq!(
        std::fs::read(fx.install_dir().join("previous")).unwrap(),
        b"kept"
    );
    assert!(fx.scratch_is_clean());
}

#[tokio::test]
async fn test_invalid_download_is_not_cached() {
    let fx = Fixture::new();
    fx.installer_tree("installer");
    let input = fx.image("installer");

    let mut downloader = MapDownloader::default();
    downloader
        .bodies
        .insert(PAYLOAD_URL.to_string(), b"<html>gone</html>".to_vec());
    let mut converter = fx.converter(downloader);
    let err = converter.run(&fx.request(input)).await.unwrap_err();

    assert_eq!(err.class(), ErrorClass::ResolutionExhausted);
    assert!(!fx.cache().join("payload.dmg").exists());
}

#[tokio::test]
async fn test_unrelated_install_dir_is_refused() {
    let fx = Fixture::new();
    fx.payload_tree("payload", INDEX_JS);
    let input = fx.image("payload");

    std::fs::create_dir_all(fx.install_dir()).unwrap();
    std::fs::write(fx.install_dir().join("thesis.tex"), b"mine").unwrap();

    let mut converter = fx.converter(MapDownloader::default());
    let err = converter.run(&fx.request(input)).await.unwrap_err();

    assert_eq!(err.class(), ErrorClass::InputValidation);
    assert_eq!(converter.state(), ConversionState::Failed);
    assert_eq!(
        std::fs::read(fx.install_dir().join("thesis.tex")).unwrap(),
        b"mine"
    );
    assert!(!fx.install_dir().join("electron").exists());
    assert!(fx.scratch_is_clean());
}

#[tokio::test]
async fn test_reinstall_replaces_earlier_conversion() {
    let fx = Fixture::new();
    fx.payload_tree("payload", INDEX_JS);
    let input = fx.image("payload");

    let mut converter = fx.converter(MapDownloader::default());
    converter.run(&fx.request(input.clone())).await.unwrap();
    std::fs::write(fx.install_dir().join("stale"), b"old").unwrap();

    let result = converter.run(&fx.request(input)).await.unwrap();

    assert!(result.desktop_entry.is_file());
    assert!(!fx.install_dir().join("stale").exists());
    let siblings: Vec<_> = std::fs::read_dir(fx.install_dir().parent().unwrap())
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(siblings, vec![std::ffi::OsString::from("claude-desktop")]);
}

#[tokio::test]
async fn test_cancelled_conversion_removes_scratch() {
    let fx = Fixture::new();
    fx.installer_tree("installer");
    let input = fx.image("installer");

    let downloader = MapDownloader {
        stall: true,
        ..Default::default()
    };
    let requested = downloader.log();
    let mut converter = fx.converter(downloader);
    let request = fx.request(input);
    let run = converter.run(&request);
    let outcome = tokio::time::timeout(std::time::Duration::from_millis(500), run).await;

    assert!(outcome.is_err());
    assert_eq!(*requested.lock().unwrap(), vec![PAYLOAD_URL.to_string()]);
    assert!(fx.scratch_is_clean());
    assert!(!fx.install_dir().exists());
}
