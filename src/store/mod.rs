//! 持久化层：文档型键值存储
//!
//! 以 (user_id, namespace, key) 定位 JSON 文档；支持 get / put / upsert-merge / delete /
//! list 与可选 TTL 过期。除单文档原子性外不要求事务。存储是唯一权威状态源：
//! 各组件读改写合并，不得长期持有内存副本作为事实。

pub mod memory;
pub mod sqlite;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub use memory::MemoryDocStore;
pub use sqlite::SqliteDocStore;

/// 存储层错误
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// 文档存储接口
#[async_trait]
pub trait DocStore: Send + Sync {
    /// 读取文档；不存在或已过期返回 None
    async fn get(&self, user_id: &str, namespace: &str, key: &str)
        -> Result<Option<Value>, StoreError>;

    /// 整体写入（替换），可选 TTL（秒）
    async fn put(
        &self,
        user_id: &str,
        namespace: &str,
        key: &str,
        value: Value,
        ttl_secs: Option<u64>,
    ) -> Result<(), StoreError>;

    /// 合并写入：仅覆盖 patch 中出现的字段（浅合并）；文档不存在时等价于 put
    async fn upsert_merge(
        &self,
        user_id: &str,
        namespace: &str,
        key: &str,
        patch: Value,
    ) -> Result<(), StoreError>;

    /// 删除文档，返回是否存在
    async fn delete(&self, user_id: &str, namespace: &str, key: &str) -> Result<bool, StoreError>;

    /// 列出用户某命名空间下的全部未过期文档
    async fn list(&self, user_id: &str, namespace: &str)
        -> Result<Vec<(String, Value)>, StoreError>;

    /// 清理过期文档，返回清理数量
    async fn cleanup_expired(&self) -> Result<usize, StoreError>;
}

/// 浅合并：两侧均为对象时按键覆盖，否则整体替换
pub(crate) fn shallow_merge(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (k, v) in patch_map {
                base_map.insert(k, v);
            }
        }
        (base_slot, patch) => *base_slot = patch,
    }
}

/// 当前毫秒时间戳
pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 创建文档存储
///
/// 提供 db_path 时使用 SQLite 持久化；打开失败或未提供时退回内存存储
pub fn create_store(db_path: Option<&Path>) -> Arc<dyn DocStore> {
    if let Some(path) = db_path {
        match SqliteDocStore::open(path) {
            Ok(store) => {
                tracing::info!("Using sqlite document store: {:?}", path);
                return Arc::new(store);
            }
            Err(e) => {
                tracing::warn!("Failed to open sqlite store, falling back to memory: {}", e);
            }
        }
    }

    tracing::info!("Using in-memory document store");
    Arc::new(MemoryDocStore::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn shallow_merge_only_touches_named_fields() {
        let mut base = json!({"role": "engineer", "location": "Karachi", "jobs": [1, 2]});
        shallow_merge(&mut base, json!({"location": "Lahore"}));
        assert_eq!(base["role"], "engineer");
        assert_eq!(base["location"], "Lahore");
        assert_eq!(base["jobs"], json!([1, 2]));
    }

    #[test]
    fn shallow_merge_replaces_non_objects() {
        let mut base = json!([1, 2, 3]);
        shallow_merge(&mut base, json!({"a": 1}));
        assert_eq!(base, json!({"a": 1}));
    }
}
