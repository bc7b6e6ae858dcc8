//! 协调能力：空操作兜底
//!
//! 规划器编造的智能体名归一失败时落到这里，保证计划仍能走完而不是崩掉。

use async_trait::async_trait;
use serde_json::json;

use super::{AgentOutcome, AgentTask, Capability};
use crate::orchestrator::error::CoreError;

pub struct CoordinatorAgent;

#[async_trait]
impl Capability for CoordinatorAgent {
    fn name(&self) -> &'static str {
        "coordinator"
    }

    fn keywords(&self) -> &'static [&'static str] {
        &["coordinator", "coordinate", "plan", "orchestrate"]
    }

    fn actions(&self) -> &'static [&'static str] {
        &["noop"]
    }

    fn describe_action(&self, _action: &str) -> String {
        "coordinator: no-op".to_string()
    }

    async fn execute(
        &self,
        _user_id: &str,
        task: &AgentTask,
        _session_id: &str,
    ) -> Result<AgentOutcome, CoreError> {
        tracing::debug!(action = %task.action, "coordinator no-op");
        Ok(AgentOutcome::data(json!({"noop": true})))
    }
}
