//! Catalog Service
//!
//! The single entry point for every operation on a category. Each call follows the same
//! sequence under the category lock: acquire → load → (check token) → execute → persist
//! → (publish) → release. The lock guard lives for the whole call, so the release happens on
//! every exit path, including `?` returns and dropped request futures.
//!
//! A refused rebalance still republishes the ring when the last accepted catalog never made
//! it into the ring file.

use anyhow::Context;
use std::sync::Arc;

use super::executor::{Executed, MutationExecutor};
use super::protocol::Mutation;
use crate::catalog::search::{DeviceQuery, search_devices};
use crate::catalog::types::{Catalog, Category, Device};
use crate::error::{Error, Result};
use crate::ring::{RebalanceReport, Recompute};
use crate::store::file::CatalogStore;
use crate::store::lock::LockManager;
use crate::store::publisher::ArtifactPublisher;
use crate::store::version::{self, VersionToken};

/// The two files a category owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Builder,
    Ring,
}

impl FileKind {
    pub fn file_name(&self, category: Category) -> String {
        match self {
            FileKind::Builder => category.builder_file(),
            FileKind::Ring => category.ring_file(),
        }
    }
}

/// Result of a write.
#[derive(Debug, Clone, PartialEq)]
pub enum Applied {
    Written(VersionToken),
    /// Nothing was written; carries the token the catalog still has.
    Unchanged(VersionToken),
    Rebalanced {
        token: VersionToken,
        ring: VersionToken,
        report: RebalanceReport,
        partitions: usize,
    },
}

impl Applied {
    /// Token of the catalog after the call.
    pub fn token(&self) -> &VersionToken {
        match self {
            Applied::Written(token) | Applied::Unchanged(token) => token,
            Applied::Rebalanced { token, .. } => token,
        }
    }
}

pub struct CatalogService {
    store: Arc<dyn CatalogStore>,
    locks: LockManager,
    publisher: ArtifactPublisher,
    executor: MutationExecutor,
}

impl CatalogService {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        locks: LockManager,
        recompute: Arc<dyn Recompute>,
    ) -> Self {
        Self {
            publisher: ArtifactPublisher::new(store.clone()),
            executor: MutationExecutor::new(recompute),
            store,
            locks,
        }
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Raw bytes of one of the category's files with their token.
    pub async fn fetch(&self, category: Category, kind: FileKind) -> Result<(Vec<u8>, VersionToken)> {
        let _lock = self.locks.acquire(category).await?;
        let bytes = self.store.read(&kind.file_name(category)).await?;
        let token = VersionToken::of(&bytes);
        Ok((bytes, token))
    }

    pub async fn current_token(&self, category: Category, kind: FileKind) -> Result<VersionToken> {
        self.fetch(category, kind).await.map(|(_, token)| token)
    }

    /// Every device slot, empty ones included.
    pub async fn list(&self, category: Category) -> Result<(Vec<Option<Device>>, VersionToken)> {
        let _lock = self.locks.acquire(category).await?;
        let (catalog, token) = self.store.load(category).await?;
        Ok((catalog.devices, token))
    }

    pub async fn search(&self, category: Category, value: &str) -> Result<(Vec<Device>, VersionToken)> {
        let query: DeviceQuery = value.parse()?;
        let _lock = self.locks.acquire(category).await?;
        let (catalog, token) = self.store.load(category).await?;
        let found = search_devices(&catalog, &query);
        tracing::debug!("Search {:?} on {} matched {} devices", value, category, found.len());
        Ok((found, token))
    }

    /// Applies a write on behalf of a caller that last saw the catalog at `expected`.
    pub async fn apply(
        &self,
        category: Category,
        expected: &VersionToken,
        mutation: Mutation,
    ) -> Result<Applied> {
        let _lock = self.locks.acquire(category).await?;
        let (mut catalog, current) = self.store.load(category).await?;
        version::check(category, expected, &current)?;

        let name = mutation.name();
        let executed = match mutation {
            Mutation::Rebalance => {
                let loaded = catalog.clone();
                let executor = self.executor.clone();
                let now = now_secs();
                let (result, recomputed) = tokio::task::spawn_blocking(move || {
                    let result = executor.execute(&mut catalog, Mutation::Rebalance, now);
                    (result, catalog)
                })
                .await
                .context("rebalance task failed")?;
                catalog = recomputed;
                match result {
                    Err(e @ Error::BadRequest(_)) => {
                        return self.republish(&loaded, current, e).await;
                    }
                    other => other?,
                }
            }
            other => self.executor.execute(&mut catalog, other, now_secs())?,
        };

        match executed {
            Executed::Unchanged => {
                tracing::info!("{} on {}: ring remains unchanged", name, category);
                Ok(Applied::Unchanged(current))
            }
            Executed::Changed => {
                let token = self.store.persist(&catalog).await?;
                tracing::info!("{} on {}: {} -> {}", name, category, current, token);
                Ok(Applied::Written(token))
            }
            Executed::Rebalanced(report) => {
                let token = self.store.persist(&catalog).await?;
                let ring = self.publisher.publish(&catalog).await?;
                tracing::info!("{} on {}: {} -> {}", name, category, current, token);
                Ok(Applied::Rebalanced {
                    token,
                    ring,
                    report,
                    partitions: catalog.partition_count(),
                })
            }
        }
    }

    /// A refused rebalance still brings the ring in line with the catalog when an earlier
    /// rebalance persisted the catalog but never got to publish.
    async fn republish(
        &self,
        loaded: &Catalog,
        current: VersionToken,
        refusal: Error,
    ) -> Result<Applied> {
        let Some(ring) = self.publisher.publish_if_stale(loaded).await? else {
            return Err(refusal);
        };
        tracing::info!(
            "rebalance on {}: republished ring of {} ({})",
            loaded.category,
            current,
            ring
        );
        Ok(Applied::Rebalanced {
            token: current,
            ring,
            report: RebalanceReport {
                reassigned: 0,
                balance: loaded.balance,
            },
            partitions: loaded.partition_count(),
        })
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
