//! `InstanceStore` — the persistence boundary this crate consumes but
//! does not own. A relational store supplies `InstanceRef` on lookup in
//! production; this module defines the trait plus an in-memory default
//! so the rest of the core can be exercised without a database.

use std::sync::Arc;

use dashmap::DashMap;

use super::models::InstanceRef;

#[async_trait::async_trait]
pub trait InstanceStore: Send + Sync {
    async fn get(&self, id: u64) -> Option<InstanceRef>;
    async fn list_ids(&self) -> Vec<u64>;
}

/// In-memory instance store, keyed by numeric id. Useful for tests and
/// as a starting point before a real store is wired in.
#[derive(Default)]
pub struct InMemoryInstanceStore {
    instances: DashMap<u64, InstanceRef>,
}

impl InMemoryInstanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, instance: InstanceRef) {
        self.instances.insert(instance.id, instance);
    }
}

#[async_trait::async_trait]
impl InstanceStore for InMemoryInstanceStore {
    async fn get(&self, id: u64) -> Option<InstanceRef> {
        self.instances.get(&id).map(|e| e.value().clone())
    }

    async fn list_ids(&self) -> Vec<u64> {
        self.instances.iter().map(|e| *e.key()).collect()
    }
}

pub type SharedInstanceStore = Arc<dyn InstanceStore>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_then_get() {
        let store = InMemoryInstanceStore::new();
        store.insert(InstanceRef {
            id: 1,
            name: "agent-1".into(),
            ssh_key_path: None,
            gateway_token: None,
            custom_log_paths: None,
        });
        let got = store.get(1).await.unwrap();
        assert_eq!(got.name, "agent-1");
        assert!(store.get(2).await.is_none());
    }

    #[tokio::test]
    async fn list_ids_reflects_inserts() {
        let store = InMemoryInstanceStore::new();
        store.insert(InstanceRef {
            id: 1,
            name: "a".into(),
            ssh_key_path: None,
            gateway_token: None,
            custom_log_paths: None,
        });
        store.insert(InstanceRef {
            id: 2,
            name: "b".into(),
            ssh_key_path: None,
            gateway_token: None,
            custom_log_paths: None,
        });
        let mut ids = store.list_ids().await;
        ids.sort();
        assert_eq!(ids, vec![1, 2]);
    }
}
