//! Mutation Executor
//!
//! Applies one [`Mutation`] to an in-memory catalog. Every batch is validated in full before
//! the first field is touched, so an error leaves the catalog exactly as it was loaded.
//! Nothing here performs I/O; persisting the result is the service's job.

use std::collections::HashSet;
use std::sync::Arc;

use super::protocol::Mutation;
use crate::catalog::types::{Catalog, Device, DeviceId, DeviceSpec};
use crate::error::{Error, Result};
use crate::ring::{RebalanceReport, Recompute, RecomputeError};

/// Smallest balance change (percent) worth persisting when the device set did not change.
pub const MIN_BALANCE_CHANGE: f64 = 1.0;

/// Balance above which operators are told to push and rebalance again later.
pub const BALANCE_WARN_THRESHOLD: f64 = 5.0;

/// What a mutation did to the catalog.
#[derive(Debug, Clone, PartialEq)]
pub enum Executed {
    /// The catalog changed and must be persisted.
    Changed,
    /// Nothing to do; the catalog must not be rewritten.
    Unchanged,
    /// An accepted rebalance. The catalog must be persisted and its ring published.
    Rebalanced(RebalanceReport),
}

#[derive(Clone)]
pub struct MutationExecutor {
    recompute: Arc<dyn Recompute>,
}

impl MutationExecutor {
    pub fn new(recompute: Arc<dyn Recompute>) -> Self {
        Self { recompute }
    }

    /// `now` is seconds since epoch; only rebalance uses it.
    pub fn execute(&self, catalog: &mut Catalog, mutation: Mutation, now: u64) -> Result<Executed> {
        match mutation {
            Mutation::AddDevices(specs) => {
                for spec in &specs {
                    check_weight(spec.weight)?;
                }
                Ok(add_devices(catalog, specs))
            }
            Mutation::RemoveDevices(ids) => remove_devices(catalog, &ids).map(|_| Executed::Changed),
            Mutation::SetWeight(weights) => {
                for (&id, &weight) in &weights {
                    if live_device(catalog, id)?.removed {
                        return Err(Error::bad_request(format!(
                            "Device {} is pending removal",
                            id
                        )));
                    }
                    check_weight(weight)?;
                }
                for (id, weight) in weights {
                    if let Some(dev) = catalog.device_mut(id) {
                        dev.weight = weight;
                    }
                }
                catalog.devs_changed = true;
                Ok(Executed::Changed)
            }
            Mutation::SetMeta(metas) => {
                for &id in metas.keys() {
                    live_device(catalog, id)?;
                }
                for (id, meta) in metas {
                    if let Some(dev) = catalog.device_mut(id) {
                        dev.meta = meta;
                    }
                }
                Ok(Executed::Changed)
            }
            Mutation::Rebalance => self.rebalance(catalog, now).map(Executed::Rebalanced),
        }
    }

    /// Runs the recomputation and decides whether the result is worth keeping.
    ///
    /// On rejection `catalog` holds the discarded candidate and must not be persisted.
    pub fn rebalance(&self, catalog: &mut Catalog, now: u64) -> Result<RebalanceReport> {
        let last_balance = catalog.balance;
        let devs_changed = catalog.devs_changed;

        let report = self
            .recompute
            .rebalance(catalog, now)
            .map_err(recompute_error)?;

        if report.reassigned == 0 {
            tracing::warn!("Rebalance of {} moved nothing", catalog.category);
            return Err(Error::bad_request(format!(
                "Either none need to be assigned or none can be due to min_part_hours [{}].",
                catalog.min_part_hours
            )));
        }

        if !devs_changed && (last_balance - report.balance).abs() < MIN_BALANCE_CHANGE {
            tracing::warn!(
                "Rebalance of {} only changed balance from {:.2} to {:.2}",
                catalog.category,
                last_balance,
                report.balance
            );
            return Err(Error::bad_request(
                "Refusing to save rebalance. Did not change at least 1%.",
            ));
        }

        self.recompute.validate(catalog).map_err(recompute_error)?;

        catalog.devs_changed = false;
        catalog.balance = report.balance;

        tracing::info!(
            "Reassigned {} ({:.2}%) partitions of {}. Balance is now {:.2}.",
            report.reassigned,
            100.0 * report.reassigned as f64 / catalog.partition_count() as f64,
            catalog.category,
            report.balance
        );
        if report.balance > BALANCE_WARN_THRESHOLD {
            tracing::info!(
                "Balance of {} is above {}: push the ring, wait {} hours (min_part_hours), rebalance and push again",
                catalog.category,
                BALANCE_WARN_THRESHOLD,
                catalog.min_part_hours
            );
        }
        Ok(report)
    }
}

fn recompute_error(e: RecomputeError) -> Error {
    if matches!(e, RecomputeError::Validation(_)) {
        tracing::error!("Refusing to save rebalance: {}", e);
    }
    Error::bad_request(e.to_string())
}

/// Adds every candidate whose identity is new, including against earlier candidates of the
/// same batch. Ids are handed out in order, one past the highest live id.
fn add_devices(catalog: &mut Catalog, specs: Vec<DeviceSpec>) -> Executed {
    let mut added = 0usize;
    for spec in specs {
        let (ip, port, name) = spec.identity();
        if catalog.contains_identity(ip, port, name) {
            tracing::debug!("Skipping {}:{}/{}: already present", ip, port, name);
            continue;
        }
        let id = catalog.next_device_id();
        catalog.insert_device(spec.into_device(id));
        added += 1;
    }

    if added == 0 {
        return Executed::Unchanged;
    }
    catalog.devs_changed = true;
    Executed::Changed
}

fn remove_devices(catalog: &mut Catalog, ids: &[DeviceId]) -> Result<()> {
    let mut seen = HashSet::new();
    for &id in ids {
        let dev = live_device(catalog, id)?;
        if dev.removed {
            return Err(Error::bad_request(format!(
                "Device {} is already pending removal",
                id
            )));
        }
        if !seen.insert(id) {
            return Err(Error::bad_request(format!("Device {} listed twice", id)));
        }
    }

    for &id in ids {
        if let Some(dev) = catalog.device_mut(id) {
            dev.weight = 0.0;
            dev.removed = true;
        }
    }
    catalog.devs_changed = true;
    Ok(())
}

fn check_weight(weight: f64) -> Result<()> {
    if !weight.is_finite() || weight < 0.0 {
        return Err(Error::bad_request(format!("Invalid weight: {}", weight)));
    }
    Ok(())
}

fn live_device(catalog: &Catalog, id: DeviceId) -> Result<&Device> {
    catalog
        .device(id)
        .ok_or_else(|| Error::bad_request(format!("Invalid device id: {}", id)))
}
