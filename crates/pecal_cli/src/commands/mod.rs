//! CLI command implementations.

pub mod draft;
pub mod queue;
pub mod session;

use pecal_storage::{FileStore, KeyValueStore};
use pecal_sync::{ClientConfig, ReqwestTransport, SyncClient};
use std::path::Path;
use std::sync::Arc;

/// Everything a command needs: the state directory and a client over it.
pub struct Context {
    /// Client over the state directory.
    pub client: SyncClient,
}

impl Context {
    /// Opens the state directory at `path` and connects to `server`, or to
    /// the server from the environment.
    pub fn open(path: &Path, server: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        let config = match server {
            Some(url) => {
                let env = ClientConfig::from_env();
                ClientConfig::new(url).with_request_timeout(env.request_timeout)
            }
            None => ClientConfig::from_env(),
        };
        let store = FileStore::open(path)?;
        Self::with_store(Arc::new(store), config)
    }

    fn with_store(
        store: Arc<dyn KeyValueStore>,
        config: ClientConfig,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let transport = ReqwestTransport::from_config(&config)?;
        let client = SyncClient::builder(Arc::new(transport), store)
            .config(config)
            .build();
        Ok(Self { client })
    }

    #[cfg(test)]
    pub(crate) fn for_tests(store: Arc<dyn KeyValueStore>) -> Self {
        // Nothing listens here; commands under test must stay offline.
        Self::with_store(store, ClientConfig::new("http://127.0.0.1:9"))
            .expect("Failed to build test context")
    }
}

/// Prints `value` as pretty JSON.
pub(crate) fn print_json<T: serde::Serialize>(
    value: &T,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
