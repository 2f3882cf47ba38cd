use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use walkdir::WalkDir;

use super::{clean_path, is_temp_path, ContentStore, StoreError, TEMP_PREFIX};
use crate::codec::gzip::STORAGE_SUFFIX;
use crate::codec::hash;

/// How a found file's bytes relate to the object's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Representation {
    /// The bytes are the object itself.
    Raw,
    /// The bytes are a gzip of the object.
    StorageCompressed,
}

/// A stored file matching a read request.
#[derive(Debug, Clone)]
pub struct Found {
    pub disk_path: PathBuf,
    pub representation: Representation,
    /// Extension that determines the content type (without the dot).
    pub extension: Option<String>,
    pub len: u64,
    pub modified: Option<SystemTime>,
    /// Quoted entity tag, constant for the lifetime of the object.
    pub etag: String,
}

impl Found {
    fn new(disk_path: PathBuf, representation: Representation, extension: Option<String>, meta: &Metadata) -> Self {
        let etag = entity_tag(&disk_path);
        Self {
            disk_path,
            representation,
            extension,
            len: meta.len(),
            modified: meta.modified().ok(),
            etag,
        }
    }

    pub fn is_storage_compressed(&self) -> bool {
        self.representation == Representation::StorageCompressed
    }
}

impl ContentStore {
    /// Find the file serving a GET for `request_path`.
    ///
    /// Tries the exact name, then its storage-compressed variant, then (for names
    /// without an extension) any stored file sharing the name as its stem.
    pub async fn lookup(&self, request_path: &str) -> Result<Option<Found>, StoreError> {
        let path = clean_path(request_path);
        if path.len() <= 1 || is_temp_path(&path) {
            return Ok(None);
        }

        let exact = self.disk_path(&path);
        if let Some(meta) = file_metadata(&exact).await {
            let extension = last_extension(&path).map(str::to_string);
            return Ok(Some(Found::new(exact, Representation::Raw, extension, &meta)));
        }

        let compressed = self.disk_path(&format!("{path}{STORAGE_SUFFIX}"));
        if let Some(meta) = file_metadata(&compressed).await {
            let extension = last_extension(&path).map(str::to_string);
            return Ok(Some(Found::new(
                compressed,
                Representation::StorageCompressed,
                extension,
                &meta,
            )));
        }

        if last_extension(&path).is_some() {
            return Ok(None);
        }
        self.lookup_any_extension(&exact).await
    }

    async fn lookup_any_extension(&self, stem_path: &Path) -> Result<Option<Found>, StoreError> {
        let (Some(dir), Some(stem)) = (
            stem_path.parent(),
            stem_path.file_name().and_then(|n| n.to_str()),
        ) else {
            return Ok(None);
        };

        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(None),
        };

        let wanted = format!("{stem}.");
        let mut candidates = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(&wanted) {
                    candidates.push(name.to_string());
                }
            }
        }
        candidates.sort();

        for name in candidates {
            let disk_path = dir.join(&name);
            let Some(meta) = file_metadata(&disk_path).await else {
                continue;
            };
            let extensions = &name[wanted.len()..];
            let found = match extensions.strip_suffix(STORAGE_SUFFIX) {
                Some(inner) if !inner.is_empty() => Found::new(
                    disk_path,
                    Representation::StorageCompressed,
                    Some(last_segment_extension(inner).to_string()),
                    &meta,
                ),
                _ => Found::new(
                    disk_path,
                    Representation::Raw,
                    Some(last_segment_extension(extensions).to_string()),
                    &meta,
                ),
            };
            return Ok(Some(found));
        }
        Ok(None)
    }

    /// Whether the exact path, or another representation of it, is stored.
    ///
    /// A path ending in the storage suffix also matches the raw file without it.
    pub fn is_present(&self, request_path: &str) -> bool {
        let path = clean_path(request_path);
        if path.len() <= 1 || is_temp_path(&path) {
            return false;
        }
        if is_file(&self.disk_path(&path)) || is_file(&self.disk_path(&format!("{path}{STORAGE_SUFFIX}"))) {
            return true;
        }
        match path.strip_suffix(STORAGE_SUFFIX) {
            Some(raw) if raw.len() > 1 => is_file(&self.disk_path(raw)),
            _ => false,
        }
    }

    /// Filter a newline-delimited list of paths down to the lines naming objects that
    /// are not stored here. Each returned line keeps its original terminator; an
    /// empty line names nothing and is always echoed.
    pub fn missing_lines(&self, list: &[u8]) -> Vec<u8> {
        let mut missing = Vec::new();
        for line in list.split_inclusive(|&b| b == b'\n') {
            let path = trim_terminator(line);
            let present = std::str::from_utf8(path)
                .map(|p| self.is_present(p))
                .unwrap_or(false);
            if !present {
                missing.extend_from_slice(line);
            }
        }
        missing
    }

    /// Lazily walk every stored object, yielding paths relative to the data
    /// directory. Blocks; run it off the async workers.
    pub fn enumerate(&self) -> impl Iterator<Item = Result<String, StoreError>> {
        let root = self.root.clone();
        WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| !is_temp_name(entry.file_name().to_str()))
            .filter_map(move |entry| {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => return Some(Err(StoreError::Io(e.into()))),
                };
                if !entry.file_type().is_file() {
                    return None;
                }
                let relative = relative_path(&root, entry.path())?;
                hash::is_location_shaped(&relative).then_some(Ok(relative))
            })
    }

    /// Remove leftover temp files from interrupted uploads. Blocks.
    pub fn sweep_temp_files(&self) -> Result<usize, StoreError> {
        let mut removed = 0;
        for entry in WalkDir::new(&self.root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable entry while sweeping temp files");
                    continue;
                }
            };
            if entry.file_type().is_file() && is_temp_name(entry.file_name().to_str()) {
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        if removed > 0 {
            tracing::info!(removed, "Removed abandoned upload files");
        }
        Ok(removed)
    }
}

async fn file_metadata(path: &Path) -> Option<Metadata> {
    // not found, not a directory, permission problems: all mean "not here"
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Some(meta),
        _ => None,
    }
}

fn is_file(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
}

fn is_temp_name(name: Option<&str>) -> bool {
    name.is_some_and(|n| n.starts_with(TEMP_PREFIX))
}

fn trim_terminator(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Extension of the final path segment, after its last dot.
fn last_extension(path: &str) -> Option<&str> {
    let name = path.rsplit('/').next()?;
    name.rsplit_once('.').map(|(_, ext)| ext).filter(|ext| !ext.is_empty())
}

fn last_segment_extension(extensions: &str) -> &str {
    extensions.rsplit('.').next().unwrap_or(extensions)
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut out = String::new();
    for component in relative.components() {
        out.push('/');
        out.push_str(component.as_os_str().to_str()?);
    }
    Some(out)
}

/// `"{prefix}{remainder}[_N]"`, taken from the file's own name.
fn entity_tag(disk_path: &Path) -> String {
    let name = disk_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let stem = name.split('.').next().unwrap_or(name);
    let prefix = disk_path
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    format!("\"{prefix}{stem}\"")
}
