//! HTTP utilities for fetching artifacts and tools.
//!
//! Provides the [`Downloader`] seam used by artifact resolution and runtime
//! installation, a bounded [`HttpDownloader`] implementation, and ZIP
//! extraction for the runtime package.

use crate::converter::error::{Error, ErrorExt, Result};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Fetches a URL into a local file.
#[allow(async_fn_in_trait)]
pub trait Downloader {
    /// Download `url` to `dest`, replacing any existing file.
    async fn download(&self, url: &str, dest: &Path) -> Result<()>;
}

/// reqwest-backed downloader with total and connect time budgets.
#[derive(Debug, Clone)]
pub struct HttpDownloader {
    client: reqwest::Client,
    total_timeout: Duration,
}

impl HttpDownloader {
    /// Build a downloader with the given budgets.
    pub fn new(total_timeout: Duration, connect_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(total_timeout)
            .connect_timeout(connect_timeout)
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            total_timeout,
        })
    }
}

impl Downloader for HttpDownloader {
    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        log::info!("Downloading {}", url);

        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| map_timeout(e, url, self.total_timeout))?
            .error_for_status()?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .fs_context("creating download directory", parent)?;
        }

        // An interrupted download never masquerades as a complete one; the
        // partial file is removed when dropped.
        let partial = partial_file(dest)?;
        let mut file = tokio::fs::File::from_std(
            partial
                .reopen()
                .fs_context("opening download file", partial.path())?,
        );

        let mut written: u64 = 0;
        loop {
            let chunk = match response.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => return Err(map_timeout(e, url, self.total_timeout)),
            };
            file.write_all(&chunk)
                .await
                .fs_context("writing download file", partial.path())?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .fs_context("flushing download file", partial.path())?;
        drop(file);

        partial
            .persist(dest)
            .map_err(|e| e.error)
            .fs_context("moving download into place", dest)?;

        log::debug!("Downloaded {} bytes to {}", written, dest.display());
        Ok(())
    }
}

/// Uniquely named temporary file beside `dest`, so concurrent downloads of
/// the same artifact never share one.
pub fn partial_file(dest: &Path) -> Result<tempfile::NamedTempFile> {
    let dir = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    tempfile::Builder::new()
        .prefix(".download-")
        .suffix(".part")
        .tempfile_in(dir)
        .fs_context("creating download file", dir)
}

fn map_timeout(error: reqwest::Error, url: &str, budget: Duration) -> Error {
    if error.is_timeout() {
        Error::Timeout {
            operation: format!("download of {url}"),
            seconds: budget.as_secs(),
        }
    } else {
        Error::Http(error)
    }
}

/// Extracts a ZIP archive from memory into a destination directory.
///
/// Creates parent directories as needed and handles both files and directories in the archive.
///
/// **Security:** Validates paths to prevent traversal attacks. Only extracts files within the
/// destination directory, rejecting entries with `..` or absolute paths.
pub async fn extract_zip(data: &[u8], dest: &Path) -> Result<()> {
    use async_zip::base::read::mem::ZipFileReader;
    use futures_lite::io::AsyncReadExt as _;

    let reader = ZipFileReader::new(data.to_vec())
        .await
        .map_err(|e| Error::GenericError(format!("Failed to read ZIP archive: {}", e)))?;

    for i in 0..reader.file().entries().len() {
        let entry = reader
            .file()
            .entries()
            .get(i)
            .ok_or_else(|| Error::GenericError(format!("Failed to get ZIP entry {}", i)))?;

        let filename = entry
            .filename()
            .as_str()
            .map_err(|e| Error::GenericError(format!("Invalid filename in ZIP: {}", e)))?;

        if filename.split(['/', '\\']).any(|part| part == "..")
            || filename.starts_with('/')
            || filename.starts_with('\\')
        {
            return Err(Error::InputValidation(format!(
                "ZIP entry escapes the destination directory: {}",
                filename
            )));
        }

        let is_dir = entry.dir().map_err(|e| {
            Error::GenericError(format!("Failed to check if entry is directory: {}", e))
        })?;

        let path = dest.join(filename);
        if is_dir {
            tokio::fs::create_dir_all(&path)
                .await
                .fs_context("creating directory", &path)?;
            continue;
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .fs_context("creating directory", parent)?;
        }

        let mut entry_reader = reader
            .reader_with_entry(i)
            .await
            .map_err(|e| Error::GenericError(format!("Failed to read ZIP entry: {}", e)))?;
        let mut content = Vec::new();
        entry_reader.read_to_end(&mut content).await?;

        tokio::fs::write(&path, content)
            .await
            .fs_context("writing extracted file", &path)?;
    }

    Ok(())
}
