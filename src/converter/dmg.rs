//! Disk image trailer validation.
//!
//! A UDIF disk image ends with a 512-byte "koly" trailer. Only the tail of the
//! file is inspected, so validation is cheap even for multi-gigabyte images,
//! and the file extension is never trusted.

use crate::converter::error::{ErrorExt, Result};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// Magic token that must appear in the trailer.
pub const TRAILER_MAGIC: &[u8] = b"koly";

/// Number of trailing bytes searched for [`TRAILER_MAGIC`].
pub const TRAILER_WINDOW: u64 = 2048;

/// Returns true if `path` is a regular file carrying the disk image trailer.
///
/// Missing, empty and unreadable files are simply invalid.
pub fn is_disk_image(path: &Path) -> bool {
    match check_trailer(path) {
        Ok(valid) => valid,
        Err(e) => {
            log::debug!("Trailer check failed for {}: {}", path.display(), e);
            false
        }
    }
}

/// Reads the final [`TRAILER_WINDOW`] bytes of `path` and searches them for
/// [`TRAILER_MAGIC`].
pub fn check_trailer(path: &Path) -> Result<bool> {
    let mut file = std::fs::File::open(path).fs_context("opening disk image", path)?;
    let len = file
        .metadata()
        .fs_context("reading disk image metadata", path)?
        .len();
    if len == 0 {
        return Ok(false);
    }

    let window = len.min(TRAILER_WINDOW);
    file.seek(SeekFrom::Start(len - window))
        .fs_context("seeking disk image trailer", path)?;
    let mut tail = Vec::with_capacity(window as usize);
    file.take(window)
        .read_to_end(&mut tail)
        .fs_context("reading disk image trailer", path)?;

    Ok(contains(&tail, TRAILER_MAGIC))
}

fn contains(data: &[u8], pattern: &[u8]) -> bool {
    data.windows(pattern.len()).any(|window| window == pattern)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, data: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn test_accepts_token_in_trailer() {
        let tmp = tempfile::tempdir().unwrap();
        for body_len in [0usize, 10, 4096, 100_000] {
            let mut data = vec![0u8; body_len];
            data.extend_from_slice(b"koly");
            data.extend_from_slice(&[0u8; 508]);
            let path = write(tmp.path(), "ok.bin", &data);
            assert!(is_disk_image(&path), "body_len = {body_len}");
        }
    }

    #[test]
    fn test_rejects_empty_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = write(tmp.path(), "empty.dmg", b"");
        assert!(!is_disk_image(&path));
    }

    #[test]
    fn test_rejects_token_outside_window() {
        let tmp = tempfile::tempdir().unwrap();
        let mut data = b"koly".to_vec();
        data.extend_from_slice(&[0u8; 2048]);
        let path = write(tmp.path(), "early.dmg", &data);
        assert!(!is_disk_image(&path));
    }

    #[test]
    fn test_rejects_missing_file_and_plain_text() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!is_disk_image(&tmp.path().join("absent.dmg")));
        let path = write(tmp.path(), "text.dmg", b"just some text, no trailer");
        assert!(!is_disk_image(&path));
    }

    #[test]
    fn test_token_straddling_window_edge_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        // "ko" falls just outside the 2048-byte window, "ly" just inside.
        let mut data = vec![0u8; 10];
        data.extend_from_slice(b"koly");
        data.extend_from_slice(&[0u8; 2046]);
        let path = write(tmp.path(), "edge.dmg", &data);
        assert!(!is_disk_image(&path));
    }
}
