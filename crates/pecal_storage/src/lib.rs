//! # Pecal Storage
//!
//! Persistent key-value store abstraction for the Pecal sync core.
//!
//! The sync core keeps three kinds of durable state on the device: the
//! current session, the offline mutation queue, and per-workspace draft and
//! metadata slots. All of it goes through the [`KeyValueStore`] trait.
//! Stores are **opaque string stores** - they never interpret the values
//! they hold.
//!
//! ## Design Principles
//!
//! - Three operations: `get`, `set`, `remove`
//! - A `set` either fully replaces the previous value or leaves it intact
//! - Must be `Send + Sync` so one store can be shared by every component
//! - Every operation is an async suspension point
//!
//! ## Available Backends
//!
//! - [`MemoryStore`] - For testing and ephemeral sessions
//! - [`FileStore`] - Directory-backed store with atomic replacement
//!
//! ## Example
//!
//! ```rust
//! use pecal_storage::{KeyValueStore, MemoryStore};
//!
//! # tokio_test_block_on(async {
//! let store = MemoryStore::new();
//! store.set("greeting", "hello".to_string()).await.unwrap();
//! assert_eq!(store.get("greeting").await.unwrap().as_deref(), Some("hello"));
//! # });
//! # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::{KeyValueStore, KeyValueStoreExt};
pub use error::{StorageError, StorageResult};
pub use file::FileStore;
pub use memory::MemoryStore;
