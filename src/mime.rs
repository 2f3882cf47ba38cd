//! Bidirectional extension <-> content-type lookup.
//!
//! A small built-in table covers the common web and document types; it can be
//! supplemented (or, if the defaults are cleared, replaced) by a `mime.types`
//! style file with one `type ext1 ext2 ...` entry per line.

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MimeError {
    #[error("Failed to read MIME types file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
}

const BUILTIN_TYPES: &[(&str, &str)] = &[
    ("css", "text/css; charset=utf-8"),
    ("csv", "text/csv; charset=utf-8"),
    ("eml", "message/rfc822"),
    ("gif", "image/gif"),
    ("gz", "application/gzip"),
    ("htm", "text/html; charset=utf-8"),
    ("html", "text/html; charset=utf-8"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("js", "application/javascript"),
    ("json", "application/json"),
    ("pdf", "application/pdf"),
    ("png", "image/png"),
    ("svg", "image/svg+xml"),
    ("tar", "application/tar"),
    ("txt", "text/plain"),
    ("tsv", "text/tab-separated-values"),
    ("xhtml", "application/xhtml+xml"),
    ("xml", "text/xml; charset=utf-8"),
    ("xsl", "text/xml; charset=utf-8"),
    ("xsd", "text/xml; charset=utf-8"),
    ("zip", "application/zip"),
];

const BUILTIN_EXTENSIONS: &[(&str, &str)] = &[
    ("application/pdf", "pdf"),
    ("application/javascript", "js"),
    ("application/x-javascript", "js"),
    ("application/json", "json"),
    ("application/gzip", "gz"),
    ("application/x-gzip", "gz"),
    ("application/tar", "tar"),
    ("application/xhtml+xml", "xhtml"),
    ("application/zip", "zip"),
    ("image/gif", "gif"),
    ("image/jpeg", "jpg"),
    ("image/png", "png"),
    ("image/svg+xml", "svg"),
    ("text/comma-separated-values", "csv"),
    ("text/css", "css"),
    ("text/csv", "csv"),
    ("text/html", "html"),
    ("text/plain", "txt"),
    ("text/tab-separated-values", "tsv"),
    ("text/xml", "xml"),
    ("message/rfc822", "eml"),
];

/// Extension <-> content-type tables.
#[derive(Debug, Clone)]
pub struct MimeRegistry {
    /// extension (no dot) -> full content type
    types: HashMap<String, String>,
    /// bare media type -> extension (no dot)
    extensions: HashMap<String, String>,
    /// Fall back to `mime_guess` when serving extensions missing from the tables.
    guess_unknown: bool,
}

impl Default for MimeRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl MimeRegistry {
    /// The built-in tables.
    pub fn builtin() -> Self {
        Self {
            types: BUILTIN_TYPES
                .iter()
                .map(|(ext, ty)| (ext.to_string(), ty.to_string()))
                .collect(),
            extensions: BUILTIN_EXTENSIONS
                .iter()
                .map(|(ty, ext)| (ty.to_string(), ext.to_string()))
                .collect(),
            guess_unknown: true,
        }
    }

    /// Tables with no entries at all.
    pub fn empty() -> Self {
        Self {
            types: HashMap::new(),
            extensions: HashMap::new(),
            guess_unknown: false,
        }
    }

    /// Build the registry from configuration.
    ///
    /// A missing file is not an error; it simply contributes nothing.
    pub fn load(file: Option<&Path>, clear_defaults: bool) -> Result<Self, MimeError> {
        let mut registry = if clear_defaults {
            Self::empty()
        } else {
            Self::builtin()
        };

        if let Some(path) = file {
            match std::fs::read_to_string(path) {
                Ok(contents) => registry.merge_mime_types(&contents),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::debug!(path = %path.display(), "No MIME types file found");
                }
                Err(source) => {
                    return Err(MimeError::Io {
                        path: path.display().to_string(),
                        source,
                    })
                }
            }
        }

        Ok(registry)
    }

    /// Merge `mime.types` formatted entries. Existing entries are kept.
    pub fn merge_mime_types(&mut self, contents: &str) {
        for line in contents.lines() {
            let mut fields = line.split_whitespace();
            let Some(media_type) = fields.next() else {
                continue;
            };
            if media_type.starts_with('#') {
                continue;
            }

            let full_type = if media_type.starts_with("text/") && !media_type.contains("charset") {
                format!("{media_type}; charset=utf-8")
            } else {
                media_type.to_string()
            };
            let bare_type = media_type.to_ascii_lowercase();

            let mut first = true;
            for ext in fields {
                if ext.starts_with('#') {
                    break;
                }
                let ext = ext.trim_start_matches('.').to_string();
                if ext.is_empty() {
                    continue;
                }
                if first {
                    self.extensions
                        .entry(bare_type.clone())
                        .or_insert_with(|| ext.clone());
                    first = false;
                }
                self.types.entry(ext).or_insert_with(|| full_type.clone());
            }
        }
    }

    /// Content type to serve for an extension (without the dot).
    pub fn type_by_extension(&self, extension: &str) -> Option<String> {
        if let Some(ty) = self.types.get(extension) {
            return Some(ty.clone());
        }
        if let Some(ty) = self.types.get(&extension.to_ascii_lowercase()) {
            return Some(ty.clone());
        }
        if self.guess_unknown {
            return mime_guess::from_ext(extension)
                .first()
                .map(|m| m.to_string());
        }
        None
    }

    /// Extension (without the dot) under which content of this type is stored.
    ///
    /// Parameters such as `charset` are ignored.
    pub fn extension_by_type(&self, content_type: &str) -> Option<&str> {
        let bare = media_type(content_type)?;
        self.extensions.get(&bare).map(String::as_str)
    }
}

/// Lower-cased media type without parameters, or `None` if the value does not parse.
pub fn media_type(content_type: &str) -> Option<String> {
    content_type
        .parse::<mime_guess::mime::Mime>()
        .ok()
        .map(|m| m.essence_str().to_ascii_lowercase())
}
