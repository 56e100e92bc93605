use super::{RebalanceReport, Recompute, RecomputeError};
use crate::catalog::types::{Catalog, DeviceId};
use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};

const SECONDS_PER_HOUR: u64 = 3600;

/// Weight-proportional placement of `2^part_power * replicas` partition replicas.
///
/// Every device with weight gets an integer quota (largest remainder of its fair share).
/// Replicas on devices that are gone, removed or weightless are always reassigned;
/// replicas on overloaded devices are only moved once their partition has been still
/// for `min_part_hours`, and at most one replica of a partition moves per pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct WeightedRebalancer;

struct Share {
    id: DeviceId,
    zone: u32,
    desired: f64,
    quota: usize,
    count: usize,
}

impl Share {
    fn wanted(&self) -> i64 {
        self.quota as i64 - self.count as i64
    }
}

impl WeightedRebalancer {
    pub fn new() -> Self {
        Self
    }

    fn shares(catalog: &Catalog) -> BTreeMap<DeviceId, Share> {
        let slots = catalog.partition_count() * catalog.replicas;
        let weighted: Vec<_> = catalog
            .live_devices()
            .filter(|d| !d.removed && d.weight > 0.0)
            .collect();
        let total: f64 = weighted.iter().map(|d| d.weight).sum();

        let mut shares: BTreeMap<DeviceId, Share> = weighted
            .iter()
            .map(|d| {
                let desired = slots as f64 * d.weight / total;
                let share = Share {
                    id: d.id,
                    zone: d.zone,
                    desired,
                    quota: desired.floor() as usize,
                    count: 0,
                };
                (d.id, share)
            })
            .collect();

        let mut handed_out: usize = shares.values().map(|s| s.quota).sum();
        let mut by_remainder: Vec<(f64, DeviceId)> = shares
            .values()
            .map(|s| (s.desired - s.quota as f64, s.id))
            .collect();
        by_remainder.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        for (_, id) in by_remainder {
            if handed_out >= slots {
                break;
            }
            if let Some(share) = shares.get_mut(&id) {
                share.quota += 1;
                handed_out += 1;
            }
        }

        shares
    }

    fn balance(shares: &BTreeMap<DeviceId, Share>) -> f64 {
        shares
            .values()
            .map(|s| (s.count as f64 - s.desired).abs() / s.desired * 100.0)
            .fold(0.0, f64::max)
    }
}

impl Recompute for WeightedRebalancer {
    fn rebalance(&self, catalog: &mut Catalog, now: u64) -> Result<RebalanceReport, RecomputeError> {
        if catalog.replicas == 0 {
            return Err(RecomputeError::NoReplicas);
        }
        let mut shares = Self::shares(catalog);
        if shares.is_empty() {
            return Err(RecomputeError::NoWeightedDevices);
        }

        let parts = catalog.partition_count();
        let replicas = catalog.replicas;
        catalog.assignment.resize_with(replicas, Vec::new);
        for row in catalog.assignment.iter_mut() {
            row.resize(parts, None);
        }
        catalog.last_moved.resize(parts, 0);

        let before = catalog.assignment.clone();
        let hold = catalog.min_part_hours as u64 * SECONDS_PER_HOUR;
        let movable: Vec<bool> = catalog
            .last_moved
            .iter()
            .map(|moved| now.saturating_sub(*moved) >= hold)
            .collect();
        let spread = shares.len() >= replicas;
        let mut touched = vec![false; parts];

        // Drop replicas that cannot stay: unknown/removed/weightless device, or a second
        // replica of the same partition on one device when there are enough devices.
        for part in 0..parts {
            let mut seen: Vec<DeviceId> = Vec::with_capacity(replicas);
            for replica in 0..replicas {
                let slot = &mut catalog.assignment[replica][part];
                let Some(id) = *slot else { continue };
                match shares.get_mut(&id) {
                    Some(share) if !(spread && seen.contains(&id)) => {
                        share.count += 1;
                        seen.push(id);
                    }
                    _ => {
                        *slot = None;
                        touched[part] = true;
                    }
                }
            }
        }

        // Overloaded devices hand movable partitions straight to a device that wants more
        // and does not already hold that partition.
        for part in 0..parts {
            if touched[part] || !movable[part] {
                continue;
            }
            for replica in 0..replicas {
                let Some(id) = catalog.assignment[replica][part] else {
                    continue;
                };
                if shares.get(&id).is_none_or(|s| s.count <= s.quota) {
                    continue;
                }
                let holders: Vec<DeviceId> = (0..replicas)
                    .filter_map(|r| catalog.assignment[r][part])
                    .collect();
                let zones: Vec<u32> = holders
                    .iter()
                    .filter(|holder| **holder != id)
                    .filter_map(|holder| shares.get(holder).map(|s| s.zone))
                    .collect();
                let taker = shares
                    .values()
                    .filter(|s| !holders.contains(&s.id) && s.wanted() > 0)
                    .min_by_key(|s| {
                        (
                            zones.iter().filter(|zone| **zone == s.zone).count(),
                            Reverse(s.wanted()),
                            s.id,
                        )
                    })
                    .map(|s| s.id);
                let Some(taker) = taker else { continue };

                if let Some(giver) = shares.get_mut(&id) {
                    giver.count -= 1;
                }
                if let Some(share) = shares.get_mut(&taker) {
                    share.count += 1;
                }
                catalog.assignment[replica][part] = Some(taker);
                touched[part] = true;
                break;
            }
        }

        for part in 0..parts {
            for replica in 0..replicas {
                if catalog.assignment[replica][part].is_some() {
                    continue;
                }
                let holders: Vec<DeviceId> = (0..replicas)
                    .filter_map(|r| catalog.assignment[r][part])
                    .collect();
                let zones: Vec<u32> = holders
                    .iter()
                    .filter_map(|id| shares.get(id).map(|s| s.zone))
                    .collect();

                let chosen = shares
                    .values()
                    .min_by_key(|s| {
                        (
                            holders.contains(&s.id),
                            s.wanted() <= 0,
                            zones.iter().filter(|zone| **zone == s.zone).count(),
                            Reverse(s.wanted()),
                            s.id,
                        )
                    })
                    .map(|s| s.id);

                if let Some(id) = chosen {
                    catalog.assignment[replica][part] = Some(id);
                    if let Some(share) = shares.get_mut(&id) {
                        share.count += 1;
                    }
                }
            }
        }

        let mut reassigned = 0;
        for part in 0..parts {
            if (0..replicas).any(|r| before[r][part] != catalog.assignment[r][part]) {
                reassigned += 1;
                catalog.last_moved[part] = now;
            }
        }

        // Removed devices hold nothing any more; their slots become empty.
        for slot in catalog.devices.iter_mut() {
            if slot.as_ref().is_some_and(|d| d.removed) {
                *slot = None;
            }
        }

        Ok(RebalanceReport {
            reassigned,
            balance: Self::balance(&shares),
        })
    }

    fn validate(&self, catalog: &Catalog) -> Result<(), RecomputeError> {
        let parts = catalog.partition_count();
        if catalog.assignment.len() != catalog.replicas {
            return Err(RecomputeError::Validation(format!(
                "expected {} replica rows, found {}",
                catalog.replicas,
                catalog.assignment.len()
            )));
        }

        for (replica, row) in catalog.assignment.iter().enumerate() {
            if row.len() != parts {
                return Err(RecomputeError::Validation(format!(
                    "replica {} covers {} partitions, expected {}",
                    replica,
                    row.len(),
                    parts
                )));
            }
            for (part, slot) in row.iter().enumerate() {
                let id = slot.ok_or_else(|| {
                    RecomputeError::Validation(format!(
                        "partition {} replica {} is unassigned",
                        part, replica
                    ))
                })?;
                match catalog.device(id) {
                    Some(dev) if !dev.removed && dev.weight > 0.0 => {}
                    _ => {
                        return Err(RecomputeError::Validation(format!(
                            "partition {} replica {} is on unusable device {}",
                            part, replica, id
                        )));
                    }
                }
            }
        }

        let weighted = catalog
            .live_devices()
            .filter(|d| !d.removed && d.weight > 0.0)
            .count();
        if weighted >= catalog.replicas {
            for part in 0..parts {
                let mut seen = HashSet::new();
                for row in &catalog.assignment {
                    if let Some(id) = row[part] {
                        if !seen.insert(id) {
                            return Err(RecomputeError::Validation(format!(
                                "partition {} has more than one replica on device {}",
                                part, id
                            )));
                        }
                    }
                }
            }
        }

        Ok(())
    }
}
