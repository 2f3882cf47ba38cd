use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use tempfile::TempPath;
use tokio::io::AsyncWriteExt;

use super::{stored_name, StoreError, Stored, UploadTarget, TEMP_PREFIX};
use crate::codec::gzip::{self, ContentEncoding};
use crate::codec::hash::{self, ContentHash};

/// An upload being received into a temp file in its destination directory.
///
/// The temp file is removed when this value (or the path it hands to
/// [`commit`]) is dropped, so an aborted request leaves nothing behind.
pub struct PendingUpload {
    file: tokio::fs::File,
    path: TempPath,
    written: u64,
    limit: Option<u64>,
}

impl PendingUpload {
    pub(super) fn create(dir: &Path, limit: Option<u64>) -> Result<Self, StoreError> {
        fs::create_dir_all(dir)?;
        let (file, path) = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(dir)?
            .into_parts();
        Ok(Self {
            file: tokio::fs::File::from_std(file),
            path,
            written: 0,
            limit,
        })
    }

    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), StoreError> {
        self.written += chunk.len() as u64;
        if let Some(limit) = self.limit {
            if self.written > limit {
                return Err(StoreError::PayloadTooLarge(limit));
            }
        }
        self.file.write_all(chunk).await?;
        Ok(())
    }

    /// Flush everything to disk and hand back the temp file's path.
    pub(super) async fn finish(mut self) -> Result<TempPath, StoreError> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(self.path)
    }
}

/// The parts of a location that depend only on the content and the target.
struct Naming<'a> {
    directory: &'a str,
    hash: &'a ContentHash,
    extension: Option<&'a str>,
}

impl Naming<'_> {
    fn subdirectory(&self) -> String {
        format!("{}/{}", self.directory, self.hash.prefix())
    }

    fn location(&self, collision: u32) -> String {
        let mut location = format!("{}/{}", self.subdirectory(), self.hash.remainder());
        if collision > 1 {
            location.push_str(&format!("_{collision}"));
        }
        if let Some(ext) = self.extension {
            location.push('.');
            location.push_str(ext);
        }
        location
    }
}

/// Decide the on-disk representation, hash the logical bytes and link the
/// temp file into its final name.
pub(super) fn commit(
    root: &Path,
    temp: TempPath,
    target: UploadTarget,
    encoding: ContentEncoding,
    extension: Option<String>,
) -> Result<Stored, StoreError> {
    let (temp, storage_compressed) = normalize(temp, encoding)?;

    let hash = if storage_compressed {
        hash::hash_reader(gzip::decoder(File::open(&temp)?)).map_err(StoreError::from_decode)?
    } else {
        hash::hash_reader(File::open(&temp)?)?
    };

    let (directory, extension, exact) = match &target {
        UploadTarget::Directory(dir) => (dir.as_str(), extension.as_deref(), None),
        UploadTarget::Exact(exact) => {
            if exact.prefix != hash.prefix() || exact.remainder != hash.remainder() {
                return Err(StoreError::WrongLocation(exact.location.clone()));
            }
            (exact.directory.as_str(), exact.extension.as_deref(), Some(exact))
        }
    };

    let naming = Naming {
        directory,
        hash: &hash,
        extension,
    };
    let subdirectory = root.join(naming.subdirectory().trim_start_matches('/'));
    fs::create_dir_all(&subdirectory)?;

    let mut collision = 1;
    let mut location = match exact {
        Some(exact) => exact.location.clone(),
        None => naming.location(collision),
    };

    let (stored_path, new_object) = loop {
        let stored_path = stored_name(&location, storage_compressed);
        let destination = root.join(stored_path.trim_start_matches('/'));

        // the same location may already be held in the other representation
        let mut occupant = None;
        if let Some((alt_path, alt_compressed)) = alternate(&location, storage_compressed) {
            let alt = root.join(alt_path.trim_start_matches('/'));
            if let Some(same) = occupied_by(&alt, alt_compressed, &temp, storage_compressed)? {
                occupant = Some((same, alt_path));
            }
        }
        let occupant = match occupant {
            Some(found) => Some(found),
            None => link_or_compare(&temp, &destination, storage_compressed)?
                .map(|same| (same, stored_path.clone())),
        };

        match occupant {
            None => break (stored_path, true),
            Some((true, existing)) => {
                // a storage name that resolved to the raw copy reports the raw location
                if location.ends_with(gzip::STORAGE_SUFFIX) && !existing.ends_with(gzip::STORAGE_SUFFIX) {
                    location = existing.clone();
                }
                break (existing, false);
            }
            Some((false, _)) if exact.is_some() => {
                return Err(StoreError::SlotConflict(location));
            }
            Some((false, _)) => {
                // a different object already has this name; probe the next slot
                collision += 1;
                location = naming.location(collision);
            }
        }
    };

    sync_directory(&subdirectory);

    Ok(Stored {
        location,
        stored_path,
        new_object,
    })
}

/// Work out whether the bytes on disk will be gzip, rewriting the temp file when
/// a gzip transfer encoding wraps content that is itself a gzip file.
fn normalize(temp: TempPath, encoding: ContentEncoding) -> Result<(TempPath, bool), StoreError> {
    match encoding {
        ContentEncoding::Identity => {
            let (compressed, _) = gzip::sniff(File::open(&temp)?)?;
            Ok((temp, compressed))
        }
        ContentEncoding::Gzip => {
            let (artifact, _) =
                gzip::sniff(gzip::decoder(File::open(&temp)?)).map_err(StoreError::from_decode)?;
            if !artifact {
                // plain content sent gzipped: keep the wire bytes as the stored form
                return Ok((temp, true));
            }

            // strip the redundant transfer encoding, keeping the inner gzip file
            let dir = temp
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            let (mut out, decoded) = tempfile::Builder::new()
                .prefix(TEMP_PREFIX)
                .tempfile_in(&dir)?
                .into_parts();
            io::copy(&mut gzip::decoder(File::open(&temp)?), &mut out)
                .map_err(StoreError::from_decode)?;
            out.sync_all()?;
            Ok((decoded, true))
        }
    }
}

/// The other on-disk representation of a location, if one can exist.
///
/// A storage-compressed location that already carries the storage suffix, as
/// replicating peers send it, is checked against its unsuffixed raw name.
fn alternate(location: &str, storage_compressed: bool) -> Option<(String, bool)> {
    match location.strip_suffix(gzip::STORAGE_SUFFIX) {
        Some(raw) if storage_compressed => Some((raw.to_string(), false)),
        Some(_) => None,
        None if storage_compressed => Some((location.to_string(), false)),
        None => Some((stored_name(location, true), true)),
    }
}

/// `None` if nothing is at `path`, otherwise whether it holds the same logical content.
fn occupied_by(
    path: &Path,
    path_compressed: bool,
    temp: &Path,
    temp_compressed: bool,
) -> Result<Option<bool>, StoreError> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => {
            Ok(Some(same_logical(path, path_compressed, temp, temp_compressed)))
        }
        Ok(_) => Ok(Some(false)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Atomically bind `destination` to the temp file's contents.
///
/// Returns `None` when the link was created, otherwise whether the existing file
/// holds the same logical content.
fn link_or_compare(temp: &Path, destination: &Path, compressed: bool) -> Result<Option<bool>, StoreError> {
    match fs::hard_link(temp, destination) {
        Ok(()) => Ok(None),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            if fs::metadata(destination).map(|m| m.is_file()).unwrap_or(false) {
                Ok(Some(same_logical(destination, compressed, temp, compressed)))
            } else {
                // can't compare against a directory or an unreadable entry
                Err(e.into())
            }
        }
        Err(e) => Err(e.into()),
    }
}

fn same_logical(a: &Path, a_compressed: bool, b: &Path, b_compressed: bool) -> bool {
    let (Ok(file_a), Ok(file_b)) = (File::open(a), File::open(b)) else {
        return false;
    };
    let reader_a = logical_reader(file_a, a_compressed);
    let reader_b = logical_reader(file_b, b_compressed);
    gzip::same_contents(reader_a, reader_b).unwrap_or(false)
}

fn logical_reader(file: File, compressed: bool) -> Box<dyn Read> {
    if compressed {
        Box::new(gzip::decoder(file))
    } else {
        Box::new(file)
    }
}

fn sync_directory(dir: &Path) {
    // not every platform lets us open a directory for syncing
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}
