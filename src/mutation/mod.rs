//! Optimistic-Concurrency Mutation Protocol
//!
//! Exposes the catalog of each category for concurrent editing over HTTP without lost
//! updates.
//!
//! ## Core Concepts
//! - **Locking**: every call, reads included, runs under its category's exclusive lock.
//! - **CAS**: writes carry the token the caller last saw; a different current token is a conflict.
//! - **Atomic batches**: a batch is validated in full before anything is applied.
//! - **Guarded rebalance**: a recomputation that moves nothing, or barely changes the
//!   balance of an unchanged device set, is refused and nothing is written.

pub mod executor;
pub mod handlers;
pub mod protocol;
pub mod service;

#[cfg(test)]
mod tests;
