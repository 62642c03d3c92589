//! Packed application archive codec.
//!
//! Electron applications ship their script tree as a single `app.asar` file.
//! Files that must stay loose on disk (compiled add-ons, helper binaries) live
//! in a sibling `app.asar.unpacked/` directory and are only listed in the
//! archive header.
//!
//! # Layout
//!
//! ```text
//! u32 LE  4                  size of the following field
//! u32 LE  header_size        bytes of the header pickle
//! u32 LE  header_size - 4    header pickle payload size
//! u32 LE  json_len
//! [json_len bytes]           JSON header, padded to a 4-byte boundary
//! [data]                     file contents, starting at 8 + header_size
//! ```
//!
//! The JSON header is a tree of directory (`{"files": {...}}`), file
//! (`{"size", "offset", "unpacked", "executable", "integrity"}`) and link
//! (`{"link"}`) nodes. File offsets are decimal strings relative to the start
//! of the data region.

use crate::converter::error::{Error, ErrorExt, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

/// Integrity block size used when packing.
const INTEGRITY_BLOCK_SIZE: u64 = 4 * 1024 * 1024;

/// Suffix of the sibling directory holding loose files.
pub const UNPACKED_SUFFIX: &str = ".unpacked";

/// A header node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Node {
    /// Directory with named children.
    Directory {
        /// Children by name
        files: BTreeMap<String, Node>,
    },
    /// Symbolic link, target relative to the archive root.
    Link {
        /// Link target
        link: String,
    },
    /// Regular file.
    File(FileEntry),
}

/// Header record for a regular file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// File size in bytes
    pub size: u64,
    /// Offset into the data region; absent for unpacked files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<String>,
    /// Stored in the sibling unpacked directory
    #[serde(default, skip_serializing_if = "is_false")]
    pub unpacked: bool,
    /// Has the executable bit
    #[serde(default, skip_serializing_if = "is_false")]
    pub executable: bool,
    /// Content hashes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<Integrity>,
}

/// Content hashes for a file entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Integrity {
    /// Always "SHA256"
    pub algorithm: String,
    /// Hash of the whole file
    pub hash: String,
    /// Bytes per block
    #[serde(rename = "blockSize")]
    pub block_size: u64,
    /// Hash of each block
    pub blocks: Vec<String>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// An opened packed archive.
#[derive(Debug, Clone)]
pub struct PackedArchive {
    path: PathBuf,
    root: Node,
    data_offset: u64,
}

impl PackedArchive {
    /// Parses the archive header.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = File::open(path).fs_context("opening packed archive", path)?;

        let mut prefix = [0u8; 8];
        file.read_exact(&mut prefix)
            .fs_context("reading packed archive header", path)?;
        let size_field = read_u32(&prefix, 0);
        let header_size = read_u32(&prefix, 4) as usize;
        if size_field != 4 || header_size < 8 {
            return Err(malformed(path, "bad header prefix"));
        }

        let mut header = vec![0u8; header_size];
        file.read_exact(&mut header)
            .fs_context("reading packed archive header", path)?;
        let json_len = read_u32(&header, 4) as usize;
        let json = header
            .get(8..8 + json_len)
            .ok_or_else(|| malformed(path, "header length exceeds header size"))?;

        let root: Node = serde_json::from_slice(json)?;
        if !matches!(root, Node::Directory { .. }) {
            return Err(malformed(path, "header root is not a directory"));
        }

        Ok(Self {
            path: path.to_path_buf(),
            root,
            data_offset: 8 + header_size as u64,
        })
    }

    /// Path of the archive file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Root header node.
    pub fn root(&self) -> &Node {
        &self.root
    }

    /// Sibling directory holding unpacked files.
    pub fn unpacked_dir(&self) -> PathBuf {
        unpacked_dir_for(&self.path)
    }

    /// All entries with their archive-relative paths, directories before their contents.
    pub fn entries(&self) -> Result<Vec<(PathBuf, &Node)>> {
        let mut out = Vec::new();
        flatten(&self.root, PathBuf::new(), &mut out)?;
        Ok(out)
    }

    /// Paths of entries stored in the unpacked directory.
    pub fn unpacked_paths(&self) -> Result<Vec<PathBuf>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter_map(|(path, node)| match node {
                Node::File(entry) if entry.unpacked => Some(path),
                _ => None,
            })
            .collect())
    }

    /// Reads one packed file's contents.
    pub fn read_file(&self, rel: &Path) -> Result<Vec<u8>> {
        let node = lookup(&self.root, rel)
            .ok_or_else(|| Error::GenericError(format!("{} not found in archive", rel.display())))?;
        let Node::File(entry) = node else {
            return Err(Error::GenericError(format!("{} is not a file", rel.display())));
        };
        if entry.unpacked {
            let loose = self.unpacked_dir().join(rel);
            return std::fs::read(&loose).fs_context("reading unpacked file", &loose);
        }
        let mut file = File::open(&self.path).fs_context("opening packed archive", &self.path)?;
        self.read_packed(&mut file, rel, entry)
    }

    fn read_packed(&self, file: &mut File, rel: &Path, entry: &FileEntry) -> Result<Vec<u8>> {
        let offset: u64 = entry
            .offset
            .as_deref()
            .ok_or_else(|| malformed(&self.path, "packed file without offset"))?
            .parse()
            .map_err(|_| malformed(&self.path, "non-numeric file offset"))?;

        let len = file
            .metadata()
            .fs_context("reading packed archive metadata", &self.path)?
            .len();
        let start = self
            .data_offset
            .checked_add(offset)
            .filter(|start| start.checked_add(entry.size).is_some_and(|end| end <= len))
            .ok_or_else(|| {
                malformed(
                    &self.path,
                    &format!("{} lies outside the archive", rel.display()),
                )
            })?;

        file.seek(SeekFrom::Start(start))
            .fs_context("seeking packed archive", &self.path)?;
        let mut data = Vec::with_capacity(entry.size as usize);
        file.take(entry.size)
            .read_to_end(&mut data)
            .fs_context("reading packed archive", &self.path)?;
        if data.len() as u64 != entry.size {
            return Err(malformed(
                &self.path,
                &format!("{} is truncated", rel.display()),
            ));
        }
        Ok(data)
    }

    /// Writes every entry below `dest`.
    ///
    /// Unpacked entries are copied from [`unpacked_dir`](Self::unpacked_dir);
    /// ones missing there are skipped with a warning.
    pub fn extract_to(&self, dest: &Path) -> Result<()> {
        std::fs::create_dir_all(dest).fs_context("creating extraction directory", dest)?;
        let mut file = File::open(&self.path).fs_context("opening packed archive", &self.path)?;
        let unpacked_dir = self.unpacked_dir();

        for (rel, node) in self.entries()? {
            let target = dest.join(&rel);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).fs_context("creating directory", parent)?;
            }
            match node {
                Node::Directory { .. } => {
                    std::fs::create_dir_all(&target).fs_context("creating directory", &target)?;
                }
                Node::Link { link } => {
                    let link = safe_relative(link)
                        .ok_or_else(|| malformed(&self.path, "link escapes archive root"))?;
                    crate::converter::utils::fs::symlink(&dest.join(link), &target)
                        .fs_context("creating symlink", &target)?;
                }
                Node::File(entry) if entry.unpacked => {
                    let loose = unpacked_dir.join(&rel);
                    if loose.is_file() {
                        std::fs::copy(&loose, &target)
                            .fs_context("copying unpacked file", &target)?;
                    } else {
                        log::warn!("Unpacked file {} is missing", loose.display());
                    }
                }
                Node::File(entry) => {
                    let data = self.read_packed(&mut file, &rel, entry)?;
                    std::fs::write(&target, data).fs_context("writing extracted file", &target)?;
                    if entry.executable {
                        set_executable(&target)?;
                    }
                }
            }
        }

        log::debug!(
            "Extracted {} to {}",
            self.path.display(),
            dest.display()
        );
        Ok(())
    }
}

/// Sibling unpacked directory for an archive path.
pub fn unpacked_dir_for(archive: &Path) -> PathBuf {
    let mut name = archive.as_os_str().to_os_string();
    name.push(UNPACKED_SUFFIX);
    PathBuf::from(name)
}

/// Packs `packed_root` into `dest`.
///
/// Every file below `unpacked_root` is listed in the header as unpacked and
/// copied into `dest`'s sibling unpacked directory; such paths take precedence
/// over same-named files in `packed_root`.
pub fn pack(packed_root: &Path, unpacked_root: Option<&Path>, dest: &Path) -> Result<()> {
    let mut root = BTreeMap::new();
    let mut payload: Vec<(PathBuf, u64)> = Vec::new();
    let mut offset: u64 = 0;

    let unpacked_files = match unpacked_root {
        Some(dir) if dir.is_dir() => collect_files(dir)?,
        _ => Vec::new(),
    };
    let unpacked_set: std::collections::BTreeSet<&PathBuf> =
        unpacked_files.iter().map(|(rel, _)| rel).collect();

    for entry in walkdir::WalkDir::new(packed_root)
        .min_depth(1)
        .sort_by_file_name()
    {
        let entry = entry?;
        let rel = entry.path().strip_prefix(packed_root)?.to_path_buf();
        let file_type = entry.file_type();

        if file_type.is_dir() {
            insert(&mut root, &rel, Node::Directory { files: BTreeMap::new() })?;
        } else if file_type.is_symlink() {
            let link = link_target(packed_root, entry.path())?;
            insert(&mut root, &rel, Node::Link { link })?;
        } else if !unpacked_set.contains(&rel) {
            let (size, integrity) = hash_file(entry.path())?;
            insert(
                &mut root,
                &rel,
                Node::File(FileEntry {
                    size,
                    offset: Some(offset.to_string()),
                    unpacked: false,
                    executable: is_executable(entry.path()),
                    integrity: Some(integrity),
                }),
            )?;
            payload.push((entry.path().to_path_buf(), size));
            offset += size;
        }
    }

    if let Some(unpacked_root) = unpacked_root {
        let unpacked_dest = unpacked_dir_for(dest);
        for (rel, src) in &unpacked_files {
            let (size, integrity) = hash_file(src)?;
            insert(
                &mut root,
                rel,
                Node::File(FileEntry {
                    size,
                    offset: None,
                    unpacked: true,
                    executable: is_executable(src),
                    integrity: Some(integrity),
                }),
            )?;
            let target = unpacked_dest.join(rel);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).fs_context("creating directory", parent)?;
            }
            std::fs::copy(src, &target).fs_context("copying unpacked file", &target)?;
        }
        log::debug!(
            "Listed {} unpacked file(s) from {}",
            unpacked_files.len(),
            unpacked_root.display()
        );
    }

    write_archive(&Node::Directory { files: root }, &payload, dest)?;
    log::info!("Packed {} file(s) into {}", payload.len(), dest.display());
    Ok(())
}

fn write_archive(root: &Node, payload: &[(PathBuf, u64)], dest: &Path) -> Result<()> {
    let json = serde_json::to_vec(root)?;
    let json_len = json.len();
    let padded = (json_len + 3) & !3;
    let payload_size = 4 + padded;
    let header_size = 4 + payload_size;

    let header_fields = [4usize, header_size, payload_size, json_len];
    let mut fields = Vec::with_capacity(16);
    for field in header_fields {
        let field = u32::try_from(field).map_err(|_| malformed(dest, "header too large"))?;
        fields.extend_from_slice(&field.to_le_bytes());
    }

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).fs_context("creating directory", parent)?;
    }
    let file = File::create(dest).fs_context("creating packed archive", dest)?;
    let mut out = BufWriter::new(file);
    out.write_all(&fields).fs_context("writing packed archive", dest)?;
    out.write_all(&json).fs_context("writing packed archive", dest)?;
    out.write_all(&vec![0u8; padded - json_len])
        .fs_context("writing packed archive", dest)?;

    for (src, size) in payload {
        let mut input = File::open(src).fs_context("opening file to pack", src)?;
        let copied =
            std::io::copy(&mut input, &mut out).fs_context("writing packed archive", dest)?;
        if copied != *size {
            return Err(Error::GenericError(format!(
                "{} changed size while packing",
                src.display()
            )));
        }
    }
    out.flush().fs_context("flushing packed archive", dest)?;
    Ok(())
}

fn collect_files(dir: &Path) -> Result<Vec<(PathBuf, PathBuf)>> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_file() {
            let rel = entry.path().strip_prefix(dir)?.to_path_buf();
            files.push((rel, entry.path().to_path_buf()));
        }
    }
    Ok(files)
}

fn insert(root: &mut BTreeMap<String, Node>, rel: &Path, node: Node) -> Result<()> {
    let names: Vec<String> = rel
        .components()
        .map(|c| match c {
            Component::Normal(name) => name
                .to_str()
                .map(str::to_string)
                .ok_or_else(|| Error::GenericError(format!("non-UTF-8 path {}", rel.display()))),
            _ => Err(Error::GenericError(format!("invalid path {}", rel.display()))),
        })
        .collect::<Result<_>>()?;
    let Some((leaf, parents)) = names.split_last() else {
        return Err(Error::GenericError("empty archive path".into()));
    };

    let mut dir = root;
    for name in parents {
        let child = dir
            .entry(name.clone())
            .or_insert_with(|| Node::Directory { files: BTreeMap::new() });
        dir = match child {
            Node::Directory { files } => files,
            _ => {
                return Err(Error::GenericError(format!(
                    "{} is both a file and a directory",
                    rel.display()
                )));
            }
        };
    }

    let existing_dir = matches!(
        (dir.get(leaf), &node),
        (Some(Node::Directory { .. }), Node::Directory { .. })
    );
    if !existing_dir {
        dir.insert(leaf.clone(), node);
    }
    Ok(())
}

fn flatten<'a>(node: &'a Node, prefix: PathBuf, out: &mut Vec<(PathBuf, &'a Node)>) -> Result<()> {
    if let Node::Directory { files } = node {
        for (name, child) in files {
            if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
                return Err(Error::InputValidation(format!(
                    "archive entry name '{name}' is not allowed"
                )));
            }
            let path = prefix.join(name);
            if matches!(child, Node::Directory { .. }) {
                out.push((path.clone(), child));
            }
            flatten(child, path.clone(), out)?;
            if !matches!(child, Node::Directory { .. }) {
                out.push((path, child));
            }
        }
    }
    Ok(())
}

fn lookup<'a>(root: &'a Node, rel: &Path) -> Option<&'a Node> {
    let mut node = root;
    for component in rel.components() {
        let Component::Normal(name) = component else {
            return None;
        };
        let Node::Directory { files } = node else {
            return None;
        };
        node = files.get(name.to_str()?)?;
    }
    Some(node)
}

fn link_target(root: &Path, link: &Path) -> Result<String> {
    let target = std::fs::read_link(link).fs_context("reading symlink", link)?;
    let absolute = if target.is_absolute() {
        target
    } else {
        link.parent().unwrap_or(root).join(target)
    };
    let normalized = normalize(&absolute);
    let rel = normalized.strip_prefix(normalize(root)).map_err(|_| {
        Error::InputValidation(format!(
            "symlink {} points outside the application tree",
            link.display()
        ))
    })?;
    rel.to_str()
        .map(str::to_string)
        .ok_or_else(|| Error::GenericError(format!("non-UTF-8 link target {}", rel.display())))
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn safe_relative(link: &str) -> Option<PathBuf> {
    let path = Path::new(link);
    path.components()
        .all(|c| matches!(c, Component::Normal(_)))
        .then(|| path.to_path_buf())
}

fn hash_file(path: &Path) -> Result<(u64, Integrity)> {
    let mut file = File::open(path).fs_context("opening file to hash", path)?;
    let mut whole = Sha256::new();
    let mut blocks = Vec::new();
    let mut size: u64 = 0;
    let mut buffer = vec![0u8; INTEGRITY_BLOCK_SIZE as usize];

    loop {
        let mut filled = 0;
        while filled < buffer.len() {
            let n = file
                .read(&mut buffer[filled..])
                .fs_context("reading file to hash", path)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            break;
        }
        let block = &buffer[..filled];
        whole.update(block);
        blocks.push(hex::encode(Sha256::digest(block)));
        size += filled as u64;
        if filled < buffer.len() {
            break;
        }
    }
    if blocks.is_empty() {
        blocks.push(hex::encode(Sha256::digest(b"")));
    }

    Ok((
        size,
        Integrity {
            algorithm: "SHA256".to_string(),
            hash: hex::encode(whole.finalize()),
            block_size: INTEGRITY_BLOCK_SIZE,
            blocks,
        },
    ))
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut field = [0u8; 4];
    field.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(field)
}

fn malformed(path: &Path, reason: &str) -> Error {
    Error::InputValidation(format!(
        "malformed packed archive {}: {}",
        path.display(),
        reason
    ))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    false
}

fn set_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
            .fs_context("setting permissions", path)?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(root: &Path) {
        std::fs::create_dir_all(root.join(".vite/build")).unwrap();
        std::fs::write(root.join("package.json"), br#"{"main":".vite/build/index.js"}"#).unwrap();
        std::fs::write(root.join(".vite/build/index.js"), b"console.log(1)").unwrap();
    }

    #[test]
    fn test_pack_and_open_with_unpacked_files() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("app");
        tree(&src);
        let loose = tmp.path().join("loose");
        std::fs::create_dir_all(loose.join("node_modules/native/build")).unwrap();
        std::fs::write(loose.join("node_modules/native/build/addon.node"), b"ELF").unwrap();

        let dest = tmp.path().join("out/app.asar");
        pack(&src, Some(&loose), &dest).unwrap();

        let archive = PackedArchive::open(&dest).unwrap();
        assert_eq!(
            archive.read_file(Path::new(".vite/build/index.js")).unwrap(),
            b"console.log(1)"
        );
        assert_eq!(
            archive.unpacked_paths().unwrap(),
            vec![PathBuf::from("node_modules/native/build/addon.node")]
        );
        assert_eq!(
            archive
                .read_file(Path::new("node_modules/native/build/addon.node"))
                .unwrap(),
            b"ELF"
        );

        let extracted = tmp.path().join("extracted");
        archive.extract_to(&extracted).unwrap();
        assert!(extracted.join("package.json").is_file());
        assert_eq!(
            std::fs::read(extracted.join("node_modules/native/build/addon.node")).unwrap(),
            b"ELF"
        );
    }

    #[test]
    fn test_header_records_integrity() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("app");
        tree(&src);
        let dest = tmp.path().join("app.asar");
        pack(&src, None, &dest).unwrap();

        let archive = PackedArchive::open(&dest).unwrap();
        let entries = archive.entries().unwrap();
        let (_, node) = entries
            .iter()
            .find(|(p, _)| p == Path::new("package.json"))
            .unwrap();
        let Node::File(entry) = node else {
            panic!("package.json is not a file");
        };
        let integrity = entry.integrity.as_ref().unwrap();
        assert_eq!(integrity.blocks.len(), 1);
        assert_eq!(
            integrity.hash,
            hex::encode(Sha256::digest(br#"{"main":".vite/build/index.js"}"#))
        );
    }

    #[test]
    fn test_open_rejects_garbage() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.asar");
        std::fs::write(&path, b"not an archive at all").unwrap();
        assert!(PackedArchive::open(&path).is_err());
    }

    #[test]
    fn test_rejects_traversal_names() {
        let json = r#"{"files":{"..":{"size":1,"offset":"0"}}}"#;
        let root: Node = serde_json::from_str(json).unwrap();
        let mut out = Vec::new();
        assert!(flatten(&root, PathBuf::new(), &mut out).is_err());
    }

    #[test]
    fn test_entry_outside_archive_is_malformed() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("app");
        tree(&src);
        let dest = tmp.path().join("app.asar");
        pack(&src, None, &dest).unwrap();
        let archive = PackedArchive::open(&dest).unwrap();
        let mut file = File::open(&dest).unwrap();

        for (offset, size) in [(u64::MAX.to_string(), 1), ("0".to_string(), u64::MAX)] {
            let entry = FileEntry {
                size,
                offset: Some(offset),
                unpacked: false,
                executable: false,
                integrity: None,
            };
            let err = archive
                .read_packed(&mut file, Path::new("huge.bin"), &entry)
                .unwrap_err();
            assert_eq!(err.class(), crate::converter::ErrorClass::InputValidation);
            assert!(err.to_string().contains("outside the archive"));
        }
    }
}
