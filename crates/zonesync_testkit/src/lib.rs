//! # ZoneSync Testkit
//!
//! Test utilities for ZoneSync.
//!
//! This crate provides:
//! - `MemoryCloud`, an in-memory remote record store with fault injection
//! - Catalog translators and records for engine tests
//! - Engine construction and push report helpers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use zonesync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn pulls_a_book() {
//!     let cloud = MemoryCloud::new();
//!     cloud.server_save(book_record(&collection(), "b1", "Dune"));
//!     let engine = catalog_engine(&cloud);
//!     engine.fetch_changes().await.unwrap();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod cloud;
pub mod fixtures;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cloud::*;
    pub use crate::fixtures::*;
}

pub use cloud::{CloudOptions, MemoryCloud, Request};
pub use fixtures::*;
