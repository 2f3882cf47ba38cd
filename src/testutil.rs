//! Shared test helpers for content-store unit tests.

use std::path::Path;
use std::sync::Arc;

use crate::config::{Config, MimeConfig, NodeConfig, ReplicationConfig};
use crate::mime::MimeRegistry;
use crate::store::ContentStore;
use crate::AppState;

/// A store with the built-in MIME tables and no listener.
pub fn test_store(root: &Path) -> ContentStore {
    ContentStore::open(root.join("data"), Arc::new(MimeRegistry::builtin()))
        .expect("Failed to open test store")
}

/// Configuration for a node with its data under `temp_dir`, replicating to `peers`.
pub fn test_config(temp_dir: &tempfile::TempDir, peers: Vec<String>) -> Config {
    Config {
        node: NodeConfig {
            bind_address: "127.0.0.1:0".to_string(),
            data_dir: temp_dir.path().join("data").to_string_lossy().to_string(),
        },
        replication: ReplicationConfig {
            peers,
            backoff_base_ms: 10,
            backoff_max_ms: 100,
            http_timeout_secs: 5,
            ..Default::default()
        },
        mime: MimeConfig {
            types_file: None,
            no_defaults: false,
        },
        quiet: true,
        ..Default::default()
    }
}

/// Create a test AppState with a temporary data directory and no peers.
pub fn test_state(temp_dir: &tempfile::TempDir) -> Arc<AppState> {
    crate::build_state(test_config(temp_dir, Vec::new())).expect("Failed to build test state")
}
