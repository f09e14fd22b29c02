//! Versioned, shared strategy distributions
//!
//! Readers take cheap `Arc` snapshots; writers serialize per key through an
//! async lock and publish a whole new version when they are done. Updates to
//! different keys never wait on each other.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{OwnedMutexGuard, RwLock};

use crate::locks::KeyedLocks;
use crate::types::LearningId;

use super::types::{DistributionKey, LearningStrategyOverride, PriorsConfig, StrategyDistribution};

/// A published value and its version, starting at 1
#[derive(Debug)]
pub struct Versioned<T> {
    pub version: u64,
    pub value: Arc<T>,
}

impl<T> Clone for Versioned<T> {
    fn clone(&self) -> Self {
        Self {
            version: self.version,
            value: Arc::clone(&self.value),
        }
    }
}

/// Unit of single-writer serialization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArenaKey {
    Distribution(DistributionKey),
    Learning(LearningId),
}

/// In-memory home of every distribution and override
pub struct DistributionArena {
    priors: PriorsConfig,
    distributions: RwLock<HashMap<DistributionKey, Versioned<StrategyDistribution>>>,
    overrides: RwLock<HashMap<LearningId, Versioned<LearningStrategyOverride>>>,
    writers: KeyedLocks<ArenaKey>,
}

impl DistributionArena {
    pub fn new(priors: PriorsConfig) -> Self {
        Self {
            priors,
            distributions: RwLock::new(HashMap::new()),
            overrides: RwLock::new(HashMap::new()),
            writers: KeyedLocks::new(),
        }
    }

    pub fn priors(&self) -> &PriorsConfig {
        &self.priors
    }

    /// Seed the arena from persisted state
    pub async fn hydrate(
        &self,
        distributions: Vec<StrategyDistribution>,
        overrides: Vec<LearningStrategyOverride>,
    ) {
        {
            let mut map = self.distributions.write().await;
            for dist in distributions {
                map.insert(
                    dist.key(),
                    Versioned {
                        version: 1,
                        value: Arc::new(dist),
                    },
                );
            }
        }
        let mut map = self.overrides.write().await;
        for o in overrides {
            map.insert(
                o.learning_id,
                Versioned {
                    version: 1,
                    value: Arc::new(o),
                },
            );
        }
    }

    /// Exclusive write access to one key until the guard drops
    pub async fn lock(&self, key: ArenaKey) -> OwnedMutexGuard<()> {
        self.writers.lock(key).await
    }

    /// Current snapshot; a fresh prior distribution (version 0) if none exists
    pub async fn distribution(&self, key: DistributionKey) -> Versioned<StrategyDistribution> {
        if let Some(v) = self.distributions.read().await.get(&key) {
            return v.clone();
        }
        Versioned {
            version: 0,
            value: Arc::new(StrategyDistribution::with_priors(
                key.category,
                key.context_type,
                &self.priors,
            )),
        }
    }

    pub async fn override_for(&self, id: LearningId) -> Option<Versioned<LearningStrategyOverride>> {
        self.overrides.read().await.get(&id).cloned()
    }

    /// Publish a new version; returns it
    pub async fn publish_distribution(&self, dist: StrategyDistribution) -> u64 {
        let mut map = self.distributions.write().await;
        let key = dist.key();
        let version = map.get(&key).map_or(1, |v| v.version + 1);
        map.insert(
            key,
            Versioned {
                version,
                value: Arc::new(dist),
            },
        );
        version
    }

    pub async fn publish_override(&self, o: LearningStrategyOverride) -> u64 {
        let mut map = self.overrides.write().await;
        let version = map.get(&o.learning_id).map_or(1, |v| v.version + 1);
        map.insert(
            o.learning_id,
            Versioned {
                version,
                value: Arc::new(o),
            },
        );
        version
    }

    pub async fn distribution_count(&self) -> usize {
        self.distributions.read().await.len()
    }
}

impl Default for DistributionArena {
    fn default() -> Self {
        Self::new(PriorsConfig::default())
    }
}
