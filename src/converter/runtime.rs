//! Target runtime installation.

use crate::bail;
use crate::converter::{
    error::{Error, ErrorExt, Result},
    settings::RuntimeSource,
    utils::{
        fs,
        http::{extract_zip, Downloader},
    },
};
use std::path::{Path, PathBuf};

/// Runtime executable name inside the installed tree.
pub const RUNTIME_EXECUTABLE: &str = "electron";

/// Files in the runtime package that must be executable.
const RUNTIME_EXECUTABLES: &[&str] =
    &[RUNTIME_EXECUTABLE, "chrome_crashpad_handler", "chrome-sandbox"];

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";

/// Release package name for `version` on the host architecture.
pub fn package_name(version: &str) -> Result<String> {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "x64",
        "aarch64" => "arm64",
        "arm" => "armv7l",
        other => bail!("no runtime build available for architecture {}", other),
    };
    Ok(format!("electron-v{version}-linux-{arch}.zip"))
}

/// Installs the runtime into `dest` and returns the runtime executable.
///
/// Downloaded packages are cached under `cache_dir/runtime` and reused only
/// while they still look like ZIP archives.
pub async fn install_runtime<D: Downloader>(
    source: &RuntimeSource,
    version: &str,
    cache_dir: &Path,
    downloader: &D,
    dest: &Path,
) -> Result<PathBuf> {
    fs::create_dir_all(dest, true).await?;

    match source {
        RuntimeSource::Download { mirror } => {
            let name = package_name(version)?;
            let cached = cache_dir.join("runtime").join(&name);

            if cached.exists() && !has_zip_header(&cached).await {
                log::warn!("Cached runtime {} is invalid, refetching", cached.display());
                tokio::fs::remove_file(&cached)
                    .await
                    .fs_context("removing invalid runtime package", &cached)?;
            }
            if !cached.exists() {
                let url = format!("{}/v{}/{}", mirror.trim_end_matches('/'), version, name);
                downloader.download(&url, &cached).await?;
                if !has_zip_header(&cached).await {
                    let _ = tokio::fs::remove_file(&cached).await;
                    return Err(Error::ResolutionExhausted {
                        what: format!("runtime {version}"),
                        reason: format!("{url} did not return a ZIP archive"),
                    });
                }
            } else {
                log::info!("Reusing cached runtime {}", cached.display());
            }

            let data = tokio::fs::read(&cached)
                .await
                .fs_context("reading runtime package", &cached)?;
            extract_zip(&data, dest).await?;
        }
        RuntimeSource::Local(dir) => {
            log::info!("Copying runtime from {}", dir.display());
            if !dir.is_dir() {
                return Err(Error::InputValidation(format!(
                    "runtime directory {} does not exist",
                    dir.display()
                )));
            }
            fs::copy_dir(dir, dest).await?;
        }
    }

    for name in RUNTIME_EXECUTABLES {
        let path = dest.join(name);
        if path.is_file() {
            fs::make_executable(&path).await?;
        }
    }

    let executable = dest.join(RUNTIME_EXECUTABLE);
    if !executable.is_file() {
        return Err(Error::InputValidation(format!(
            "runtime tree has no {RUNTIME_EXECUTABLE} executable"
        )));
    }
    Ok(executable)
}

async fn has_zip_header(path: &Path) -> bool {
    use tokio::io::AsyncReadExt;

    let mut header = [0u8; 4];
    match tokio::fs::File::open(path).await {
        Ok(mut file) => file.read_exact(&mut header).await.is_ok() && header == ZIP_MAGIC,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Serving(&'static [u8]);

    impl Downloader for Serving {
        async fn download(&self, _url: &str, dest: &Path) -> Result<()> {
            std::fs::create_dir_all(dest.parent().unwrap())?;
            std::fs::write(dest, self.0)?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_local_runtime_is_copied_and_executable() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("electron-dist");
        std::fs::create_dir_all(src.join("resources")).unwrap();
        std::fs::write(src.join("electron"), b"#!/bin/sh\n").unwrap();
        std::fs::write(src.join("resources/default_app.asar"), b"x").unwrap();

        let dest = tmp.path().join("out");
        let exe = install_runtime(
            &RuntimeSource::Local(src),
            "37.2.6",
            tmp.path(),
            &Serving(b""),
            &dest,
        )
        .await
        .unwrap();

        assert_eq!(exe, dest.join("electron"));
        assert!(dest.join("resources/default_app.asar").is_file());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&exe).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[tokio::test]
    async fn test_local_runtime_without_executable_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("empty");
        std::fs::create_dir_all(&src).unwrap();

        let result = install_runtime(
            &RuntimeSource::Local(src),
            "37.2.6",
            tmp.path(),
            &Serving(b""),
            &tmp.path().join("out"),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_non_zip_download_is_discarded() {
        let tmp = tempfile::tempdir().unwrap();
        let source = RuntimeSource::Download {
            mirror: "https://mirror.example.com".into(),
        };

        let result = install_runtime(
            &source,
            "37.2.6",
            tmp.path(),
            &Serving(b"<html>not found</html>"),
            &tmp.path().join("out"),
        )
        .await;
        assert!(result.is_err());
        let name = package_name("37.2.6").unwrap();
        assert!(!tmp.path().join("runtime").join(name).exists());
    }
}
