//! # Pecal Testkit
//!
//! Test utilities for the Pecal sync core.
//!
//! This crate provides:
//! - [`FakeApi`], a stateful simulated backend implementing
//!   [`pecal_sync::HttpTransport`]
//! - [`FakeAuthorizer`] for sign-in flows without a browser
//! - [`TestHarness`], a client wired to both
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use pecal_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn reads_tasks() {
//!     let harness = TestHarness::signed_in(1).await;
//!     let tasks = harness.client.request(HttpRequest::get(TASKS_PATH)).await.unwrap();
//!     assert_eq!(tasks, serde_json::json!([]));
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fake_api;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fake_api::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use pecal_sync::{HttpRequest, Method, Mutation, MutationKind, RunOptions};
}

pub use fake_api::*;
pub use fixtures::*;
pub use generators::*;
