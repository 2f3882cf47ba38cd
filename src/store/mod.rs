//! The on-disk object namespace.
//!
//! Every object lives at `{root}{directory}/{prefix}/{remainder}[_N][.ext][.gz]`,
//! where the trailing `.gz` is present only when the bytes on disk are gzip but the
//! object's own type is not. All writes go through [`ContentStore::store`], which
//! commits by hard-linking a fully written temp file into place so that a name is
//! bound to its content exactly once.

mod lookup;
mod upload;

pub use lookup::{Found, Representation};
pub use upload::PendingUpload;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use thiserror::Error;

use crate::codec::gzip::{self, ContentEncoding};
use crate::codec::hash::{self, ObjectName};
use crate::mime::MimeRegistry;

/// Directory used when an upload names no directory of its own.
pub const DEFAULT_DIRECTORY: &str = "/default";

/// Prefix of in-progress upload files.
pub const TEMP_PREFIX: &str = "_upload";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0} is not the correct location, is the file corrupt?")]
    WrongLocation(String),
    #[error("{0} already holds different content")]
    SlotConflict(String),
    #[error("Unsupported content encoding: {0}")]
    UnsupportedEncoding(String),
    #[error("Failed to decompress upload: {0}")]
    Decompression(String),
    #[error("Upload exceeds the maximum size of {0} bytes")]
    PayloadTooLarge(u64),
    #[error("Invalid path: {0}")]
    InvalidPath(String),
    #[error("Failed to read upload body: {0}")]
    Body(String),
}

impl StoreError {
    /// Classify an IO error raised while reading through a gzip decoder.
    pub(crate) fn from_decode(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::InvalidData
            | std::io::ErrorKind::InvalidInput
            | std::io::ErrorKind::UnexpectedEof => StoreError::Decompression(e.to_string()),
            _ => StoreError::Io(e),
        }
    }
}

/// Told about every object the store creates (not about duplicates).
pub trait ObjectListener: Send + Sync {
    /// `stored_path` is the object's on-disk path relative to the data directory,
    /// with a leading `/`.
    fn object_stored(&self, stored_path: &str);
}

/// Where an upload should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadTarget {
    /// Store under a directory; the name is derived from the content.
    Directory(String),
    /// Store at exactly this location, which must agree with the content hash.
    Exact(ExactLocation),
}

impl UploadTarget {
    /// Target for a POST to `request_path`.
    pub fn directory(request_path: &str) -> Result<Self, StoreError> {
        let path = clean_path(request_path);
        check_segments(&path)?;
        if path.len() <= 1 {
            return Ok(UploadTarget::Directory(DEFAULT_DIRECTORY.to_string()));
        }
        Ok(UploadTarget::Directory(path))
    }

    /// Target for a PUT to `request_path`.
    pub fn exact(request_path: &str) -> Result<Self, StoreError> {
        ExactLocation::parse(request_path).map(UploadTarget::Exact)
    }

    fn directory_path(&self) -> &str {
        match self {
            UploadTarget::Directory(dir) => dir,
            UploadTarget::Exact(exact) => &exact.directory,
        }
    }
}

/// A fully specified location, split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExactLocation {
    pub location: String,
    pub directory: String,
    pub prefix: String,
    pub remainder: String,
    pub extension: Option<String>,
}

impl ExactLocation {
    pub fn parse(request_path: &str) -> Result<Self, StoreError> {
        let location = clean_path(request_path);
        let wrong = || StoreError::WrongLocation(location.clone());
        check_segments(&location)?;
        if !hash::is_location_shaped(&location) {
            return Err(wrong());
        }

        let (rest, file) = location.rsplit_once('/').ok_or_else(wrong)?;
        let (directory, prefix) = rest.rsplit_once('/').ok_or_else(wrong)?;
        let name = ObjectName::parse(file).ok_or_else(wrong)?;

        Ok(Self {
            directory: directory.to_string(),
            prefix: prefix.to_string(),
            remainder: name.remainder.to_string(),
            extension: name.extension.map(str::to_string),
            location: location.clone(),
        })
    }
}

/// A canonicalised upload: the gateway decodes multipart or raw requests into this
/// before any bytes reach the store.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub target: UploadTarget,
    /// Declared media type of the content, without parameters.
    pub content_type: Option<String>,
    pub encoding: ContentEncoding,
}

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stored {
    /// The canonical address, without any storage-only suffix.
    pub location: String,
    /// Path of the committed file relative to the data directory.
    pub stored_path: String,
    /// False when byte-identical content already occupied the location.
    pub new_object: bool,
}

/// Content-addressed storage rooted at one data directory.
#[derive(Clone)]
pub struct ContentStore {
    root: PathBuf,
    mime: Arc<MimeRegistry>,
    max_upload_size: Option<u64>,
    listener: Option<Arc<dyn ObjectListener>>,
}

impl std::fmt::Debug for ContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentStore")
            .field("root", &self.root)
            .field("max_upload_size", &self.max_upload_size)
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

impl ContentStore {
    /// Open (creating if needed) the data directory.
    pub fn open<P: AsRef<Path>>(root: P, mime: Arc<MimeRegistry>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            mime,
            max_upload_size: None,
            listener: None,
        })
    }

    pub fn with_max_upload_size(mut self, limit: Option<u64>) -> Self {
        self.max_upload_size = limit;
        self
    }

    /// A copy of this store that reports new objects to `listener`.
    pub fn with_listener(&self, listener: Arc<dyn ObjectListener>) -> Self {
        Self {
            listener: Some(listener),
            ..self.clone()
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path for a path relative to the data directory.
    pub fn disk_path(&self, relative: &str) -> PathBuf {
        self.root.join(relative.trim_start_matches('/'))
    }

    /// Start receiving an upload into a temp file in `directory`.
    pub async fn begin_upload(&self, directory: &str) -> Result<PendingUpload, StoreError> {
        let dir = self.disk_path(directory);
        let limit = self.max_upload_size;
        tokio::task::spawn_blocking(move || PendingUpload::create(&dir, limit))
            .await
            .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
    }

    /// Receive a body stream and commit it.
    pub async fn store<S, E>(&self, request: UploadRequest, mut body: S) -> Result<Stored, StoreError>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: std::fmt::Display,
    {
        let mut pending = self.begin_upload(request.target.directory_path()).await?;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| StoreError::Body(e.to_string()))?;
            pending.write(&chunk).await?;
        }
        self.commit(request, pending).await
    }

    /// Store an in-memory body.
    pub async fn store_bytes(&self, request: UploadRequest, data: Bytes) -> Result<Stored, StoreError> {
        let body = futures_util::stream::iter([Ok::<_, std::convert::Infallible>(data)]);
        self.store(request, body).await
    }

    /// Hash, name and link a fully received upload into place.
    pub async fn commit(&self, request: UploadRequest, pending: PendingUpload) -> Result<Stored, StoreError> {
        let temp = pending.finish().await?;

        let extension = match &request.target {
            UploadTarget::Exact(exact) => exact.extension.clone(),
            UploadTarget::Directory(_) => request
                .content_type
                .as_deref()
                .and_then(|ty| self.mime.extension_by_type(ty))
                .map(str::to_string),
        };

        let root = self.root.clone();
        let stored = tokio::task::spawn_blocking(move || {
            upload::commit(&root, temp, request.target, request.encoding, extension)
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;

        if stored.new_object {
            tracing::debug!(location = %stored.location, "Stored new object");
            if let Some(listener) = &self.listener {
                listener.object_stored(&stored.stored_path);
            }
        }
        Ok(stored)
    }
}

/// Lexically normalise a request path: a single leading `/`, no empty, `.` or `..`
/// segments, and no trailing `/`.
pub fn clean_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    format!("/{}", segments.join("/"))
}

/// Whether any segment of a cleaned path names an in-progress upload.
pub fn is_temp_path(path: &str) -> bool {
    path.split('/').any(|segment| segment.starts_with(TEMP_PREFIX))
}

fn check_segments(path: &str) -> Result<(), StoreError> {
    if is_temp_path(path) {
        return Err(StoreError::InvalidPath(path.to_string()));
    }
    Ok(())
}

/// The on-disk name for a location.
pub(crate) fn stored_name(location: &str, storage_compressed: bool) -> String {
    if storage_compressed && !location.ends_with(gzip::STORAGE_SUFFIX) {
        format!("{location}{}", gzip::STORAGE_SUFFIX)
    } else {
        location.to_string()
    }
}
