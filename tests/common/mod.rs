#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use content_store::config::{Config, MimeConfig, NodeConfig, ReplicationConfig};
use content_store::{build_state, server, AppState};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// `hello world\n`, and where it lands when POSTed as text/plain under `/foo`.
pub const HELLO: &[u8] = b"hello world\n";
pub const HELLO_LOCATION: &str = "/foo/VK/IkE8vD0ebj4GXaUswGEsNLtHBzSoewPuF0pmhkqRH.txt";

pub fn test_config(data_dir: &Path, peers: Vec<String>) -> Config {
    Config {
        node: NodeConfig {
            bind_address: "127.0.0.1:0".to_string(),
            data_dir: data_dir.to_string_lossy().to_string(),
        },
        replication: ReplicationConfig {
            peers,
            backoff_base_ms: 20,
            backoff_max_ms: 200,
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

pub fn test_state(dir: &tempfile::TempDir) -> Arc<AppState> {
    build_state(test_config(&dir.path().join("data"), Vec::new())).unwrap()
}

/// A node serving on a real socket.
pub struct Node {
    pub address: String,
    pub state: Arc<AppState>,
    pub shutdown: CancellationToken,
    pub handle: JoinHandle<std::io::Result<()>>,
}

impl Node {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.address, path)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.state.config.data_path()
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(10), self.handle).await;
    }
}

pub async fn start_node(data_dir: &Path, peers: Vec<String>) -> Node {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    start_node_on(listener, data_dir, peers).await
}

pub async fn start_node_on(listener: TcpListener, data_dir: &Path, peers: Vec<String>) -> Node {
    start_with_config(listener, test_config(data_dir, peers)).await
}

pub async fn start_with_config(listener: TcpListener, mut config: Config) -> Node {
    let address = listener.local_addr().unwrap().to_string();
    config.node.bind_address = address.clone();
    let state = build_state(config).unwrap();
    state.replication.start();

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(server::serve(listener, Arc::clone(&state), shutdown.clone()));
    Node {
        address,
        state,
        shutdown,
        handle,
    }
}

/// An address nothing is listening on, yet.
pub fn unused_address() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

/// Poll `check` until it holds, failing the test after a few seconds.
pub async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if check().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("Timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Every in-progress upload file under `dir`.
pub fn temp_files(dir: &Path) -> Vec<PathBuf> {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.file_name().to_string_lossy().starts_with("_upload"))
        .map(|e| e.into_path())
        .collect()
}
