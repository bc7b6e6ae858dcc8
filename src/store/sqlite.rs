//! SQLite 文档存储
//!
//! 单表 documents，主键 (user_id, namespace, key)，value 为 JSON 文本，expires_at 为可空毫秒时间戳。
//! 连接为同步 rusqlite，放在 Mutex 后面；合并写在持锁期间完成，满足单文档原子性。

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;

use super::{now_ms, shallow_merge, DocStore, StoreError};

/// SQLite 实现
pub struct SqliteDocStore {
    conn: Mutex<Connection>,
}

impl SqliteDocStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path).map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Self::init_schema(conn)
    }

    /// 内存模式（测试用）
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Self::init_schema(conn)
    }

    fn init_schema(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS documents (
                user_id    TEXT NOT NULL,
                namespace  TEXT NOT NULL,
                key        TEXT NOT NULL,
                value      TEXT NOT NULL,
                expires_at INTEGER,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, namespace, key)
            );",
        )
        .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn read_value(
        conn: &Connection,
        user_id: &str,
        namespace: &str,
        key: &str,
        now: i64,
    ) -> Result<Option<Value>, StoreError> {
        let row: Option<String> = conn
            .query_row(
                "SELECT value FROM documents
                 WHERE user_id = ?1 AND namespace = ?2 AND key = ?3
                   AND (expires_at IS NULL OR expires_at > ?4)",
                params![user_id, namespace, key, now],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;

        row.map(|text| {
            serde_json::from_str(&text).map_err(|e| StoreError::Serialization(e.to_string()))
        })
        .transpose()
    }

    fn write_value(
        conn: &Connection,
        user_id: &str,
        namespace: &str,
        key: &str,
        value: &Value,
        expires_at: Option<i64>,
        now: i64,
    ) -> Result<(), StoreError> {
        let text =
            serde_json::to_string(value).map_err(|e| StoreError::Serialization(e.to_string()))?;
        conn.execute(
            "INSERT INTO documents (user_id, namespace, key, value, expires_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (user_id, namespace, key)
             DO UPDATE SET value = ?4, expires_at = ?5, updated_at = ?6",
            params![user_id, namespace, key, text, expires_at, now],
        )
        .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl DocStore for SqliteDocStore {
    async fn get(
        &self,
        user_id: &str,
        namespace: &str,
        key: &str,
    ) -> Result<Option<Value>, StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::read_value(&conn, user_id, namespace, key, now_ms())
    }

    async fn put(
        &self,
        user_id: &str,
        namespace: &str,
        key: &str,
        value: Value,
        ttl_secs: Option<u64>,
    ) -> Result<(), StoreError> {
        let now = now_ms();
        let expires_at = ttl_secs.map(|t| now + (t as i64) * 1000);
        let conn = self.conn.lock().unwrap();
        Self::write_value(&conn, user_id, namespace, key, &value, expires_at, now)
    }

    async fn upsert_merge(
        &self,
        user_id: &str,
        namespace: &str,
        key: &str,
        patch: Value,
    ) -> Result<(), StoreError> {
        let now = now_ms();
        let conn = self.conn.lock().unwrap();

        let mut base = Self::read_value(&conn, user_id, namespace, key, now)?
            .unwrap_or_else(|| Value::Object(Default::default()));
        shallow_merge(&mut base, patch);

        // 合并写保留原 TTL；已过期的行视同不存在，旧 expires_at 一并清掉，
        // 否则补丁会写回一个早已过期的行而永远不可见
        let expires_at: Option<i64> = conn
            .query_row(
                "SELECT expires_at FROM documents
                 WHERE user_id = ?1 AND namespace = ?2 AND key = ?3",
                params![user_id, namespace, key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::Sqlite(e.to_string()))?
            .flatten()
            .filter(|t| *t > now);

        Self::write_value(&conn, user_id, namespace, key, &base, expires_at, now)
    }

    async fn delete(&self, user_id: &str, namespace: &str, key: &str) -> Result<bool, StoreError> {
        let conn = self.conn.lock().unwrap();
        let affected = conn
            .execute(
                "DELETE FROM documents WHERE user_id = ?1 AND namespace = ?2 AND key = ?3",
                params![user_id, namespace, key],
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(affected > 0)
    }

    async fn list(
        &self,
        user_id: &str,
        namespace: &str,
    ) -> Result<Vec<(String, Value)>, StoreError> {
        let now = now_ms();
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT key, value FROM documents
                 WHERE user_id = ?1 AND namespace = ?2
                   AND (expires_at IS NULL OR expires_at > ?3)
                 ORDER BY updated_at",
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;

        let rows = stmt
            .query_map(params![user_id, namespace, now], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;

        let mut out = Vec::new();
        for row in rows {
            let (key, text) = row.map_err(|e| StoreError::Sqlite(e.to_string()))?;
            let value =
                serde_json::from_str(&text).map_err(|e| StoreError::Serialization(e.to_string()))?;
            out.push((key, value));
        }
        Ok(out)
    }

    async fn cleanup_expired(&self) -> Result<usize, StoreError> {
        let conn = self.conn.lock().unwrap();
        let affected = conn
            .execute(
                "DELETE FROM documents WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![now_ms()],
            )
            .map_err(|e| StoreError::Sqlite(e.to_string()))?;
        Ok(affected)
    }
}
