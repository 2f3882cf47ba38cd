use std::path::{Path, PathBuf};

/// Health derived from two optional sentinel files.
///
/// The node is healthy if the "healthy if" file exists (when configured) and the
/// "healthy unless" file does not (when configured).
#[derive(Debug, Clone, Default)]
pub struct HealthCheck {
    healthy_if: Option<PathBuf>,
    healthy_unless: Option<PathBuf>,
}

impl HealthCheck {
    pub fn new(healthy_if: Option<PathBuf>, healthy_unless: Option<PathBuf>) -> Self {
        Self {
            healthy_if,
            healthy_unless,
        }
    }

    pub fn is_healthy(&self) -> bool {
        if let Some(path) = &self.healthy_if {
            if !exists(path) {
                return false;
            }
        }
        if let Some(path) = &self.healthy_unless {
            if exists(path) {
                return false;
            }
        }
        true
    }
}

fn exists(path: &Path) -> bool {
    // anything but a clean "not found" counts as present
    !matches!(std::fs::metadata(path), Err(e) if e.kind() == std::io::ErrorKind::NotFound)
}
