//! Ring Recomputation
//!
//! The mutation protocol treats partition placement as an external algorithm behind the
//! [`Recompute`] trait. The service only needs two answers from it: how many partitions a
//! rebalance moved (and the resulting balance), and whether the resulting catalog is
//! structurally sound.
//!
//! ## Submodules
//! - **`builder`**: `WeightedRebalancer`, the default weight-proportional placement.

pub mod builder;

use crate::catalog::types::Catalog;

/// Outcome of one recomputation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RebalanceReport {
    /// Number of partitions that had at least one replica moved.
    pub reassigned: usize,
    /// Worst relative deviation (percent) of any device from its fair share.
    pub balance: f64,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum RecomputeError {
    #[error("Replica count must be at least 1")]
    NoReplicas,

    #[error("There are no devices with weight in this ring")]
    NoWeightedDevices,

    #[error("Ring validation failed: {0}")]
    Validation(String),
}

/// Placement algorithm invoked by the rebalance operation.
///
/// Implementations mutate the catalog in memory only; persisting is the caller's job and
/// happens only when the result is accepted.
pub trait Recompute: Send + Sync + 'static {
    /// Recomputes `catalog.assignment`. `now` is seconds since epoch and drives the
    /// minimum-reassignment interval.
    fn rebalance(&self, catalog: &mut Catalog, now: u64) -> Result<RebalanceReport, RecomputeError>;

    /// Structural check of a recomputed catalog.
    fn validate(&self, catalog: &Catalog) -> Result<(), RecomputeError>;
}
