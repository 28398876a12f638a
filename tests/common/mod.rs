//! Shared test utilities and fixtures
//!
//! Integration tests drive the real client against `typelens-mock-server`,
//! built alongside this test target.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use typelens_lsp::{AnalysisConfig, CacheConfig, LifecycleManager, ProtocolClient, ResultCache};

pub const MOCK_SERVER: &str = env!("CARGO_BIN_EXE_typelens-mock-server");
pub const TYPELENS: &str = env!("CARGO_BIN_EXE_typelens");

pub const SOURCE: &str = "count = 1\ntotal = count + 2\n";

/// Analysis config pointing at the mock server with `flags`.
pub fn mock_config(flags: &[&str]) -> AnalysisConfig {
    let mut config = AnalysisConfig::for_command(
        MOCK_SERVER,
        flags.iter().map(|f| (*f).to_string()).collect(),
    );
    config.handshake_timeout_secs = 5;
    config.shutdown_timeout_secs = 2;
    config
}

pub fn client(flags: &[&str]) -> ProtocolClient {
    ProtocolClient::new(mock_config(flags), None)
}

pub fn cached_client(flags: &[&str]) -> ProtocolClient {
    ProtocolClient::new(
        mock_config(flags),
        ResultCache::from_config(&CacheConfig::default()),
    )
}

pub fn manager(flags: &[&str]) -> LifecycleManager {
    LifecycleManager::with_client(cached_client(flags))
}

/// An absolute path for a virtual document; it need not exist on disk.
pub fn source_path(name: &str) -> PathBuf {
    std::env::temp_dir().join("typelens-tests").join(name)
}

/// Write `content` to `dir/name` and return the path.
pub fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).expect("write fixture");
    path
}

/// Poll `check` until it holds or `limit` elapses.
pub async fn wait_until<F, Fut>(limit: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check().await
}
