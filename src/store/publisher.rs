//! Published ring artifact.
//!
//! The ring is the read-optimized projection of a catalog that storage nodes consume:
//! the device table plus `replica2part2dev`, gzip-compressed JSON. It is only ever
//! rewritten by an accepted rebalance, after the catalog itself has been persisted, or
//! republished when it no longer matches the last accepted catalog.

use anyhow::Context;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::sync::Arc;

use crate::catalog::types::{Catalog, DeviceId};
use crate::error::{Error, Result};
use crate::store::file::CatalogStore;
use crate::store::version::VersionToken;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RingDevice {
    pub id: DeviceId,
    pub zone: u32,
    pub ip: String,
    pub port: u16,
    pub device: String,
    pub weight: f64,
    pub meta: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RingArtifact {
    /// Right shift applied to a 32-bit hash to obtain the partition.
    pub part_shift: u32,
    pub replica_count: usize,
    pub devs: Vec<Option<RingDevice>>,
    pub replica2part2dev: Vec<Vec<DeviceId>>,
}

impl RingArtifact {
    pub fn from_catalog(catalog: &Catalog) -> anyhow::Result<Self> {
        let partitions = catalog.partition_count();
        if catalog.assignment.len() != catalog.replicas
            || catalog.assignment.iter().any(|row| row.len() != partitions)
        {
            anyhow::bail!(
                "assignment is not {} replicas of {} partitions",
                catalog.replicas,
                partitions
            );
        }

        let replica2part2dev = catalog
            .assignment
            .iter()
            .enumerate()
            .map(|(replica, row)| {
                row.iter()
                    .enumerate()
                    .map(|(part, slot)| {
                        slot.ok_or_else(|| {
                            anyhow::anyhow!("partition {} replica {} is unassigned", part, replica)
                        })
                    })
                    .collect::<anyhow::Result<Vec<_>>>()
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        let devs = catalog
            .devices
            .iter()
            .map(|slot| {
                slot.as_ref().map(|d| RingDevice {
                    id: d.id,
                    zone: d.zone,
                    ip: d.ip.clone(),
                    port: d.port,
                    device: d.device.clone(),
                    weight: d.weight,
                    meta: d.meta.clone(),
                })
            })
            .collect();

        Ok(Self {
            part_shift: 32 - catalog.part_power as u32,
            replica_count: catalog.replicas,
            devs,
            replica2part2dev,
        })
    }

    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&json)?;
        Ok(encoder.finish()?)
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        let mut json = Vec::new();
        GzDecoder::new(bytes)
            .read_to_end(&mut json)
            .context("ring is not valid gzip")?;
        Ok(serde_json::from_slice(&json)?)
    }
}

pub struct ArtifactPublisher {
    store: Arc<dyn CatalogStore>,
}

impl ArtifactPublisher {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self { store }
    }

    /// Renders and writes the ring of `catalog`. The store backs up the previous ring
    /// before overwriting it.
    pub async fn publish(&self, catalog: &Catalog) -> Result<VersionToken> {
        let ring = RingArtifact::from_catalog(catalog)
            .with_context(|| format!("failed to render {}", catalog.category.ring_file()))?;
        self.write(catalog, &ring).await
    }

    /// Publishes the ring of an already accepted `catalog` when the ring on disk is missing
    /// or differs from it, e.g. after a fault between persisting the catalog and publishing.
    /// Returns `None` when there is nothing to publish.
    pub async fn publish_if_stale(&self, catalog: &Catalog) -> Result<Option<VersionToken>> {
        if catalog.devs_changed {
            return Ok(None);
        }
        let Ok(expected) = RingArtifact::from_catalog(catalog) else {
            return Ok(None);
        };

        let ring_file = catalog.category.ring_file();
        let published = match self.store.read(&ring_file).await {
            Ok(bytes) => RingArtifact::decode(&bytes).ok(),
            Err(Error::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        if published.as_ref() == Some(&expected) {
            return Ok(None);
        }

        tracing::warn!(
            "{} does not match {}, republishing",
            ring_file,
            catalog.category.builder_file()
        );
        self.write(catalog, &expected).await.map(Some)
    }

    async fn write(&self, catalog: &Catalog, ring: &RingArtifact) -> Result<VersionToken> {
        let ring_file = catalog.category.ring_file();
        let bytes = ring
            .encode()
            .with_context(|| format!("failed to render {}", ring_file))?;

        let token = self.store.write(&ring_file, &bytes).await?;
        tracing::info!("Wrote new ring file {} ({})", ring_file, token);
        Ok(token)
    }
}
