//! Ring Builder Service Library
//!
//! Serves the device catalogs ("builders") of a partitioned object store for concurrent,
//! versioned editing over HTTP, and publishes the rings computed from them.
//! It serves as the foundation for the binary executable (`main.rs`).
//!
//! ## Architecture Modules
//! - **`catalog`**: The catalog data model (devices, slots, assignment) and the device search syntax.
//! - **`store`**: Files on disk. Per-category locks, content-hash version tokens,
//!   backup-before-overwrite persistence and ring publishing.
//! - **`ring`**: The `Recompute` seam and the default weighted rebalancer.
//! - **`mutation`**: The optimistic-concurrency protocol: typed requests, the batch executor,
//!   the orchestrating service and its HTTP handlers.
//! - **`server`**: Router assembly and the listener loop.
//! - **`client`**: A typed client for the HTTP API.
//! - **`config`**: Command line and environment settings.

pub mod catalog;
pub mod client;
pub mod config;
pub mod error;
pub mod mutation;
pub mod ring;
pub mod server;
pub mod store;
