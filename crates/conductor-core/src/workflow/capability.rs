//! Capability ownership policy.
//!
//! Each capability has at most one owning worker. The registry is shared by
//! every running workflow: lookups take a read lock, updates replace a single
//! entry under the write lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;

/// Case-insensitive capability → owner table.
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    owners: Arc<RwLock<HashMap<String, Owner>>>,
}

#[derive(Debug, Clone)]
struct Owner {
    /// Capability name as first registered
    capability: String,
    worker: String,
}

/// The owned capability that decided a reroute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityMatch {
    pub capability: String,
    pub owner: String,
}

fn key(capability: &str) -> String {
    capability.trim().to_lowercase()
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a `capability: worker` table.
    pub fn from_table<I, K, V>(table: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut owners = HashMap::new();
        for (capability, worker) in table {
            let capability: String = capability.into();
            let worker: String = worker.into();
            if capability.trim().is_empty() || worker.trim().is_empty() {
                continue;
            }
            owners.insert(
                key(&capability),
                Owner {
                    capability: capability.trim().to_string(),
                    worker: worker.trim().to_string(),
                },
            );
        }
        Self {
            owners: Arc::new(RwLock::new(owners)),
        }
    }

    pub async fn owner_of(&self, capability: &str) -> Option<String> {
        self.owners
            .read()
            .await
            .get(&key(capability))
            .map(|o| o.worker.clone())
    }

    /// Replace the owner of one capability. Returns the previous owner.
    pub async fn set_owner(&self, capability: &str, worker: &str) -> Option<String> {
        let previous = self.owners.write().await.insert(
            key(capability),
            Owner {
                capability: capability.trim().to_string(),
                worker: worker.trim().to_string(),
            },
        );
        tracing::info!(
            "[CapabilityRegistry] {} now owned by {}",
            capability.trim(),
            worker.trim()
        );
        previous.map(|o| o.worker)
    }

    pub async fn remove(&self, capability: &str) -> Option<String> {
        self.owners
            .write()
            .await
            .remove(&key(capability))
            .map(|o| o.worker)
    }

    /// First tool hint that names an owned capability, in hint order.
    pub async fn resolve_step(&self, tool_hints: &[String]) -> Option<CapabilityMatch> {
        let owners = self.owners.read().await;
        tool_hints.iter().find_map(|hint| {
            owners.get(&key(hint)).map(|o| CapabilityMatch {
                capability: o.capability.clone(),
                owner: o.worker.clone(),
            })
        })
    }

    /// Point-in-time copy, ordered by capability name.
    pub async fn snapshot(&self) -> BTreeMap<String, String> {
        self.owners
            .read()
            .await
            .values()
            .map(|o| (o.capability.clone(), o.worker.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.owners.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.owners.read().await.is_empty()
    }
}
