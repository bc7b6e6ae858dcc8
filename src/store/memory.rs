//! 内存文档存储（测试与无盘运行）

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{now_ms, shallow_merge, DocStore, StoreError};

#[derive(Debug, Clone)]
struct Doc {
    value: Value,
    expires_at: Option<i64>,
}

impl Doc {
    fn is_expired(&self, now: i64) -> bool {
        self.expires_at.map(|t| t <= now).unwrap_or(false)
    }
}

/// 内存实现：RwLock<HashMap>，键为 (user_id, namespace, key)
#[derive(Default)]
pub struct MemoryDocStore {
    docs: RwLock<HashMap<(String, String, String), Doc>>,
}

impl MemoryDocStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn triple(user_id: &str, namespace: &str, key: &str) -> (String, String, String) {
    (user_id.to_string(), namespace.to_string(), key.to_string())
}

#[async_trait]
impl DocStore for MemoryDocStore {
    async fn get(
        &self,
        user_id: &str,
        namespace: &str,
        key: &str,
    ) -> Result<Option<Value>, StoreError> {
        let now = now_ms();
        let docs = self.docs.read().await;
        Ok(docs
            .get(&triple(user_id, namespace, key))
            .filter(|d| !d.is_expired(now))
            .map(|d| d.value.clone()))
    }

    async fn put(
        &self,
        user_id: &str,
        namespace: &str,
        key: &str,
        value: Value,
        ttl_secs: Option<u64>,
    ) -> Result<(), StoreError> {
        let expires_at = ttl_secs.map(|t| now_ms() + (t as i64) * 1000);
        self.docs
            .write()
            .await
            .insert(triple(user_id, namespace, key), Doc { value, expires_at });
        Ok(())
    }

    async fn upsert_merge(
        &self,
        user_id: &str,
        namespace: &str,
        key: &str,
        patch: Value,
    ) -> Result<(), StoreError> {
        let now = now_ms();
        let mut docs = self.docs.write().await;
        let entry = docs
            .entry(triple(user_id, namespace, key))
            .or_insert_with(|| Doc {
                value: Value::Object(Default::default()),
                expires_at: None,
            });
        if entry.is_expired(now) {
            entry.value = Value::Object(Default::default());
            entry.expires_at = None;
        }
        shallow_merge(&mut entry.value, patch);
        Ok(())
    }

    async fn delete(&self, user_id: &str, namespace: &str, key: &str) -> Result<bool, StoreError> {
        Ok(self
            .docs
            .write()
            .await
            .remove(&triple(user_id, namespace, key))
            .is_some())
    }

    async fn list(
        &self,
        user_id: &str,
        namespace: &str,
    ) -> Result<Vec<(String, Value)>, StoreError> {
        let now = now_ms();
        let docs = self.docs.read().await;
        Ok(docs
            .iter()
            .filter(|((u, n, _), d)| u == user_id && n == namespace && !d.is_expired(now))
            .map(|((_, _, k), d)| (k.clone(), d.value.clone()))
            .collect())
    }

    async fn cleanup_expired(&self) -> Result<usize, StoreError> {
        let now = now_ms();
        let mut docs = self.docs.write().await;
        let before = docs.len();
        docs.retain(|_, d| !d.is_expired(now));
        Ok(before - docs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn merge_then_get_roundtrip() {
        let store = MemoryDocStore::new();
        store
            .upsert_merge("u1", "pipeline", "state", json!({"stage": "ready"}))
            .await
            .unwrap();
        store
            .upsert_merge("u1", "pipeline", "state", json!({"role": "SE"}))
            .await
            .unwrap();

        let doc = store.get("u1", "pipeline", "state").await.unwrap().unwrap();
        assert_eq!(doc["stage"], "ready");
        assert_eq!(doc["role"], "SE");
    }

    #[tokio::test]
    async fn expired_docs_are_invisible() {
        let store = MemoryDocStore::new();
        store
            .put("u1", "approvals", "a1", json!({"x": 1}), Some(0))
            .await
            .unwrap();

        assert!(store.get("u1", "approvals", "a1").await.unwrap().is_none());
        assert!(store.list("u1", "approvals").await.unwrap().is_empty());
        assert_eq!(store.cleanup_expired().await.unwrap(), 1);
    }
}
