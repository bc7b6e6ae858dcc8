//! 管线持久状态
//!
//! 每用户一条活动记录，存在文档存储 pipeline/state 下；每次阶段迁移都是
//! 读-改-写（补丁只触碰被点名的字段），任何组件拿到的都是副本而非活引用。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::orchestrator::error::CoreError;
use crate::store::DocStore;

pub const NS_PIPELINE: &str = "pipeline";
pub const STATE_KEY: &str = "state";

/// 大脑上下文保留的对话轮数上限；更早的轮次直接丢弃，不做摘要
pub const MAX_HISTORY_TURNS: usize = 10;

/// 管线阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    WaitingInput,
    Ready,
    AskingLocation,
    Searching,
    Generating,
    Review1,
    Finding,
    Review2,
    Sending,
    Done,
}

impl Stage {
    /// 异步阶段：后台工作在途，新命令一律挡回
    pub fn is_async(&self) -> bool {
        matches!(
            self,
            Stage::Searching | Stage::Generating | Stage::Finding | Stage::Sending
        )
    }

    pub fn is_review(&self) -> bool {
        matches!(self, Stage::Review1 | Stage::Review2)
    }
}

impl Default for Stage {
    fn default() -> Self {
        Stage::WaitingInput
    }
}

/// 一轮对话
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub speaker: String,
    pub content: String,
}

/// 每用户管线状态
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineState {
    #[serde(default)]
    pub stage: Stage,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub candidate_profile: Option<Value>,
    #[serde(default)]
    pub jobs: Vec<Value>,
    #[serde(default)]
    pub generated_artifacts: Vec<Value>,
    #[serde(default)]
    pub contacts: Vec<Value>,
    #[serde(default)]
    pub pending_approval_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub history: Vec<HistoryTurn>,
}

impl PipelineState {
    pub fn has_profile(&self) -> bool {
        self.candidate_profile.is_some()
    }

    /// 追加一轮对话并裁掉超出上限的旧轮次
    pub fn push_history(&mut self, speaker: &str, content: &str) {
        self.history.push(HistoryTurn {
            speaker: speaker.to_string(),
            content: content.to_string(),
        });
        if self.history.len() > MAX_HISTORY_TURNS {
            let drop = self.history.len() - MAX_HISTORY_TURNS;
            self.history.drain(..drop);
        }
    }
}

/// 状态读写：管线状态机独占所有权，其他组件只拿副本
pub struct PipelineStore {
    store: Arc<dyn DocStore>,
}

impl PipelineStore {
    pub fn new(store: Arc<dyn DocStore>) -> Self {
        Self { store }
    }

    /// 读当前状态；没有则返回初始态（首次交互即创建）
    pub async fn load(&self, user_id: &str) -> Result<PipelineState, CoreError> {
        match self.store.get(user_id, NS_PIPELINE, STATE_KEY).await? {
            Some(value) => {
                serde_json::from_value(value).map_err(|e| CoreError::Store(e.to_string()))
            }
            None => Ok(PipelineState::default()),
        }
    }

    /// 整条覆写（重置 / 首次创建时用）
    pub async fn save(&self, user_id: &str, state: &PipelineState) -> Result<(), CoreError> {
        let value = serde_json::to_value(state).map_err(|e| CoreError::Store(e.to_string()))?;
        self.store
            .put(user_id, NS_PIPELINE, STATE_KEY, value, None)
            .await?;
        Ok(())
    }

    /// 浅合并补丁：只触碰点名的字段
    pub async fn patch(&self, user_id: &str, patch: Value) -> Result<(), CoreError> {
        self.store
            .upsert_merge(user_id, NS_PIPELINE, STATE_KEY, patch)
            .await?;
        Ok(())
    }

    /// 重置回初始态；任何阶段都可调用
    pub async fn reset(&self, user_id: &str) -> Result<PipelineState, CoreError> {
        let fresh = PipelineState::default();
        self.save(user_id, &fresh).await?;
        tracing::info!(user_id, "pipeline state reset");
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::create_store;

    #[test]
    fn history_is_bounded_to_last_turns() {
        let mut state = PipelineState::default();
        for i in 0..15 {
            state.push_history("user", &format!("turn {}", i));
        }
        assert_eq!(state.history.len(), MAX_HISTORY_TURNS);
        assert_eq!(state.history[0].content, "turn 5");
        assert_eq!(state.history.last().unwrap().content, "turn 14");
    }

    #[tokio::test]
    async fn load_defaults_then_patch_merges() {
        let store = PipelineStore::new(create_store(None));
        let state = store.load("u1").await.unwrap();
        assert_eq!(state.stage, Stage::WaitingInput);

        store.save("u1", &state).await.unwrap();
        store
            .patch("u1", serde_json::json!({"stage": "ready", "role": "SE"}))
            .await
            .unwrap();

        let state = store.load("u1").await.unwrap();
        assert_eq!(state.stage, Stage::Ready);
        assert_eq!(state.role.as_deref(), Some("SE"));
        assert!(state.jobs.is_empty());
    }

    #[tokio::test]
    async fn reset_returns_to_initial_from_any_stage() {
        let store = PipelineStore::new(create_store(None));
        let mut state = PipelineState::default();
        state.stage = Stage::Sending;
        state.role = Some("SE".to_string());
        store.save("u1", &state).await.unwrap();

        let fresh = store.reset("u1").await.unwrap();
        assert_eq!(fresh.stage, Stage::WaitingInput);
        assert!(fresh.role.is_none());
    }
}
