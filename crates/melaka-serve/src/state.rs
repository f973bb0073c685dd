//! Application state and configuration.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use melaka_core::{DocumentStore, SqliteStore};

/// Application configuration loaded from environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server bind address (e.g., "0.0.0.0:8080").
    pub bind_addr: String,

    /// Path to the SQLite document store.
    pub store_path: PathBuf,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Optional environment variables:
    /// - `MELAKA_BIND_ADDR`: Server bind address (default: "0.0.0.0:8080")
    /// - `STORE_PATH`: Document store path (default: "./data/melaka.db")
    pub fn from_env() -> Self {
        let bind_addr =
            std::env::var("MELAKA_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let store_path = std::env::var("STORE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/melaka.db"));

        tracing::info!(
            bind_addr = %bind_addr,
            store_path = %store_path.display(),
            "configuration loaded"
        );

        Self {
            bind_addr,
            store_path,
        }
    }
}

/// Shared application state available to all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Document store holding one document per record.
    pub store: Arc<dyn DocumentStore>,
}

impl AppState {
    /// Open the store at `path` read-only and build the state.
    ///
    /// Fails if the store does not exist yet.
    pub fn open(path: &Path) -> melaka_core::Result<Self> {
        let store = SqliteStore::open_read_only(path)?;
        Ok(Self::with_store(Arc::new(store)))
    }

    /// Build the state around an already opened store.
    pub fn with_store(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }
}
