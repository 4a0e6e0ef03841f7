//! Namespaced key/value state exposed to running steps, backed by [`Store`].
//!
//! Two well-known namespace roots: `global` and `workflow:<id>`; per-run
//! scoping is a further `workflow:<id>:run:<runId>` prefix. Callers pick the
//! namespace string directly (`StateKv` does not enforce the convention), but
//! the helper constructors below produce it consistently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::store::{Store, StoreError};

/// Build the well-known `global`/`workflow:<id>`/`workflow:<id>:run:<run_id>` namespace strings.
pub mod namespace {
    pub fn global() -> String {
        "global".to_string()
    }

    pub fn workflow(workflow_id: &str) -> String {
        format!("workflow:{workflow_id}")
    }

    pub fn run(workflow_id: &str, run_id: &str) -> String {
        format!("workflow:{workflow_id}:run:{run_id}")
    }
}

/// Facade over [`Store`]'s KV operations: get/set/incr/delete/exists/keys/mget/mset/clear/stats/cleanup.
pub struct StateKv {
    store: Arc<dyn Store>,
}

/// Aggregate counts returned by [`StateKv::stats`].
#[derive(Debug, Clone, Default)]
pub struct NamespaceStats {
    pub live_keys: usize,
}

impl StateKv {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>, StoreError> {
        self.store.kv_get(namespace, key).await
    }

    pub async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.store.kv_set(namespace, key, value, ttl).await
    }

    pub async fn delete(&self, namespace: &str, key: &str) -> Result<(), StoreError> {
        self.store.kv_delete(namespace, key).await
    }

    pub async fn incr(&self, namespace: &str, key: &str, delta: i64) -> Result<i64, StoreError> {
        self.store.kv_incr(namespace, key, delta).await
    }

    pub async fn exists(&self, namespace: &str, key: &str) -> Result<bool, StoreError> {
        Ok(self.store.kv_get(namespace, key).await?.is_some())
    }

    /// Eventually-consistent scan: concurrent writes during the scan may be
    /// seen or missed, but no entry is returned twice.
    pub async fn keys(&self, namespace: &str, pattern: &str) -> Result<Vec<String>, StoreError> {
        let entries = self.store.kv_scan(namespace, pattern).await?;
        Ok(entries.into_iter().map(|e| e.key).collect())
    }

    pub async fn mget(&self, namespace: &str, keys: &[String]) -> Result<HashMap<String, Value>, StoreError> {
        let mut out = HashMap::new();
        for key in keys {
            if let Some(v) = self.store.kv_get(namespace, key).await? {
                out.insert(key.clone(), v);
            }
        }
        Ok(out)
    }

    pub async fn mset(
        &self,
        namespace: &str,
        entries: Vec<(String, Value)>,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        for (key, value) in entries {
            self.store.kv_set(namespace, &key, value, ttl).await?;
        }
        Ok(())
    }

    /// Deletes every live key under `namespace`.
    pub async fn clear(&self, namespace: &str) -> Result<u64, StoreError> {
        let entries = self.store.kv_scan(namespace, "").await?;
        let count = entries.len() as u64;
        for entry in entries {
            self.store.kv_delete(namespace, &entry.key).await?;
        }
        Ok(count)
    }

    pub async fn stats(&self, namespace: &str) -> Result<NamespaceStats, StoreError> {
        let entries = self.store.kv_scan(namespace, "").await?;
        Ok(NamespaceStats {
            live_keys: entries.len(),
        })
    }

    /// Deletes all entries with `expiresAt < now` across all namespaces; returns count.
    pub async fn cleanup(&self) -> Result<u64, StoreError> {
        self.store.kv_reap_expired(chrono::Utc::now()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn set_get_delete_round_trip() {
        let kv = StateKv::new(Arc::new(InMemoryStore::new()));
        let ns = namespace::workflow("w1");
        kv.set(&ns, "k", json!(42), None).await.unwrap();
        assert_eq!(kv.get(&ns, "k").await.unwrap(), Some(json!(42)));
        kv.delete(&ns, "k").await.unwrap();
        assert_eq!(kv.get(&ns, "k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn mget_mset_scoped_per_run() {
        let kv = StateKv::new(Arc::new(InMemoryStore::new()));
        let ns = namespace::run("w1", "run-1");
        kv.mset(
            &ns,
            vec![("a".into(), json!(1)), ("b".into(), json!(2))],
            None,
        )
        .await
        .unwrap();
        let values = kv.mget(&ns, &["a".to_string(), "b".to_string(), "c".to_string()]).await.unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values["a"], json!(1));
    }

    #[tokio::test]
    async fn clear_removes_all_keys_in_namespace() {
        let kv = StateKv::new(Arc::new(InMemoryStore::new()));
        let ns = namespace::global();
        kv.set(&ns, "a", json!(1), None).await.unwrap();
        kv.set(&ns, "b", json!(2), None).await.unwrap();
        let removed = kv.clear(&ns).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(kv.keys(&ns, "").await.unwrap().len(), 0);
    }
}
