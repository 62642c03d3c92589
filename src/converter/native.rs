//! Native add-on rebuild.
//!
//! Compiled add-ons shipped in the payload target the source platform. Each
//! one is rebuilt from its exact published source against the target runtime
//! in a fresh workspace, then swapped into the payload. Versions are always
//! read from the payload's own manifests.

use crate::converter::{
    error::{Error, ErrorExt, Result},
    settings::Timeouts,
    utils::{fs, process},
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Header mirror for the target runtime.
pub const RUNTIME_HEADERS_URL: &str = "https://electronjs.org/headers";

/// Directory below the workspace receiving the runtime headers.
const HEADERS_DIR: &str = ".electron-gyp";

/// One add-on to rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NativeModuleSpec {
    /// Package name
    pub name: String,
    /// Version declared by the payload's manifest
    pub version: String,
    /// Runtime version compiled against
    pub target_runtime_version: String,
}

/// External build toolchain.
///
/// All three steps operate inside `workspace`, which contains a minimal
/// `package.json` when the first step runs.
#[allow(async_fn_in_trait)]
pub trait ModuleToolchain {
    /// Fetch development headers for `runtime_version`.
    async fn fetch_headers(&self, runtime_version: &str, workspace: &Path) -> Result<()>;

    /// Fetch the exact source of `module` into `workspace/node_modules`
    /// without running its install hooks.
    async fn fetch_package(&self, module: &NativeModuleSpec, workspace: &Path) -> Result<()>;

    /// Compile every module in one pass against the target runtime.
    async fn compile(&self, modules: &[NativeModuleSpec], workspace: &Path) -> Result<()>;
}

/// npm / node-gyp / @electron/rebuild toolchain.
///
/// `npm` and `npx` are looked up on `PATH` when first needed, so payloads
/// without native modules convert on hosts without Node.js.
#[derive(Debug, Clone)]
pub struct NpmToolchain {
    timeouts: Timeouts,
}

impl NpmToolchain {
    /// Toolchain bounded by `timeouts`.
    pub fn new(timeouts: Timeouts) -> Self {
        Self { timeouts }
    }

    fn npx(&self, workspace: &Path) -> Result<Command> {
        let mut cmd = Command::new(require_tool("npx")?);
        cmd.current_dir(workspace)
            .env("npm_config_devdir", workspace.join(HEADERS_DIR))
            .arg("--yes");
        Ok(cmd)
    }
}

fn require_tool(name: &str) -> Result<PathBuf> {
    which::which(name).map_err(|e| Error::BuildFailure {
        step: format!("locating {name}"),
        status: "not found".to_string(),
        diagnostic: format!("{e}; install Node.js and npm to rebuild native modules"),
    })
}

impl ModuleToolchain for NpmToolchain {
    async fn fetch_headers(&self, runtime_version: &str, workspace: &Path) -> Result<()> {
        let mut cmd = self.npx(workspace)?;
        cmd.arg("node-gyp")
            .arg("install")
            .arg(format!("--target={runtime_version}"))
            .arg(format!("--dist-url={RUNTIME_HEADERS_URL}"))
            .arg(format!("--devdir={}", workspace.join(HEADERS_DIR).display()));
        process::run_checked(cmd, "runtime header fetch", self.timeouts.fetch).await?;
        Ok(())
    }

    async fn fetch_package(&self, module: &NativeModuleSpec, workspace: &Path) -> Result<()> {
        let mut cmd = Command::new(require_tool("npm")?);
        cmd.current_dir(workspace)
            .arg("install")
            .arg("--ignore-scripts")
            .arg("--no-audit")
            .arg("--no-fund")
            .arg("--save-exact")
            .arg(format!("{}@{}", module.name, module.version));
        let label = format!("fetch of {}@{}", module.name, module.version);
        process::run_checked(cmd, &label, self.timeouts.fetch).await?;
        Ok(())
    }

    async fn compile(&self, modules: &[NativeModuleSpec], workspace: &Path) -> Result<()> {
        let Some(first) = modules.first() else {
            return Ok(());
        };
        let only = modules
            .iter()
            .map(|m| m.name.as_str())
            .collect::<Vec<_>>()
            .join(",");

        let mut cmd = self.npx(workspace)?;
        cmd.env("JOBS", num_cpus::get().to_string())
            .arg("@electron/rebuild")
            .arg("--version")
            .arg(&first.target_runtime_version)
            .arg("--force")
            .arg("--module-dir")
            .arg(workspace)
            .arg("--only")
            .arg(only);
        process::run_checked(cmd, "native module compilation", self.timeouts.compile).await?;
        Ok(())
    }
}

/// Reads the declared version of `name` from the payload's manifest.
pub fn read_module_spec(
    payload_root: &Path,
    name: &str,
    target_runtime_version: &str,
) -> Result<NativeModuleSpec> {
    let manifest = payload_root.join("node_modules").join(name).join("package.json");
    if !manifest.is_file() {
        return Err(Error::InputValidation(format!(
            "native module {name} has no manifest at node_modules/{name}/package.json"
        )));
    }

    let text = std::fs::read_to_string(&manifest).fs_context("reading module manifest", &manifest)?;
    let json: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
        Error::InputValidation(format!("native module {name} manifest is not valid JSON: {e}"))
    })?;
    let version = json
        .get("version")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            Error::InputValidation(format!("native module {name} manifest declares no version"))
        })?;
    semver::Version::parse(version).map_err(|e| {
        Error::InputValidation(format!(
            "native module {name} declares invalid version '{version}': {e}"
        ))
    })?;

    Ok(NativeModuleSpec {
        name: name.to_string(),
        version: version.to_string(),
        target_runtime_version: target_runtime_version.to_string(),
    })
}

/// Rebuilds a payload's native modules through a [`ModuleToolchain`].
#[derive(Debug)]
pub struct NativeModuleRebuilder<'a, T> {
    toolchain: &'a T,
    runtime_version: &'a str,
    scratch: &'a Path,
}

impl<'a, T: ModuleToolchain> NativeModuleRebuilder<'a, T> {
    /// Rebuilder creating its workspaces below `scratch`.
    pub fn new(toolchain: &'a T, runtime_version: &'a str, scratch: &'a Path) -> Self {
        Self {
            toolchain,
            runtime_version,
            scratch,
        }
    }

    /// Rebuilds `names` and replaces `payload_root/node_modules/<name>` with
    /// the results.
    ///
    /// Every manifest is read before the toolchain runs, and every rebuilt
    /// module is verified before the first replacement.
    pub async fn rebuild(
        &self,
        payload_root: &Path,
        names: &[String],
    ) -> Result<Vec<NativeModuleSpec>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let modules = names
            .iter()
            .map(|name| read_module_spec(payload_root, name, self.runtime_version))
            .collect::<Result<Vec<_>>>()?;

        let workspace = tempfile::Builder::new()
            .prefix("native-")
            .tempdir_in(self.scratch)
            .fs_context("creating rebuild workspace", self.scratch)?;
        let ws = workspace.path();
        let manifest = ws.join("package.json");
        std::fs::write(
            &manifest,
            r#"{"name":"native-rebuild","version":"0.0.0","private":true}"#,
        )
        .fs_context("writing workspace manifest", &manifest)?;

        log::info!(
            "Rebuilding {} native module(s) for runtime {}",
            modules.len(),
            self.runtime_version
        );
        self.toolchain.fetch_headers(self.runtime_version, ws).await?;
        for module in &modules {
            self.toolchain.fetch_package(module, ws).await?;
        }
        self.toolchain.compile(&modules, ws).await?;

        let missing: Vec<&str> = modules
            .iter()
            .filter(|m| !ws.join("node_modules").join(&m.name).join("package.json").is_file())
            .map(|m| m.name.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(Error::BuildFailure {
                step: "native module rebuild".to_string(),
                status: "incomplete".to_string(),
                diagnostic: format!("no rebuilt output for {}", missing.join(", ")),
            });
        }

        for module in &modules {
            let rebuilt = ws.join("node_modules").join(&module.name);
            let target = payload_root.join("node_modules").join(&module.name);
            fs::replace_dir(&rebuilt, &target).await?;
            log::info!("Rebuilt {}@{}", module.name, module.version);
        }

        Ok(modules)
    }
}
