//! 能力层：智能体注册表与各能力实现
//!
//! 所有能力实现 Capability trait（name / keywords / actions / execute），由 CapabilityRegistry
//! 按名注册与查找。任务计划可能由生成式规划器产出，智能体名 / 动作名会出现"近似拼写"，
//! 注册表负责把它们归一到最接近的合法值；完全对不上时退回 coordinator 空操作。

pub mod application;
pub mod coordinator;
pub mod interview;
pub mod job_search;
pub mod resume;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::orchestrator::error::CoreError;

pub use application::{
    ApplicationAgent, Contact, ContactDirectory, Mailer, OutboundEmail, RecordingMailer,
    StaticContactDirectory,
};
pub use coordinator::CoordinatorAgent;
pub use interview::InterviewAgent;
pub use job_search::{JobBoard, JobPosting, JobSearchAgent, StaticJobBoard};
pub use resume::ResumeAgent;

/// 默认兜底能力名
pub const COORDINATOR: &str = "coordinator";

/// 分派给能力的一次任务
#[derive(Debug, Clone)]
pub struct AgentTask {
    pub action: String,
    pub params: Value,
}

impl AgentTask {
    pub fn new(action: impl Into<String>, params: Value) -> Self {
        Self {
            action: action.into(),
            params,
        }
    }
}

/// 能力执行结果
///
/// 有外部不可撤销副作用的动作在未经批准时必须返回 requires_approval=true 与审批 id，
/// 而不是直接执行副作用。
#[derive(Debug, Clone, Default)]
pub struct AgentOutcome {
    pub data: Value,
    pub requires_approval: bool,
    pub approval_id: Option<String>,
}

impl AgentOutcome {
    pub fn data(data: Value) -> Self {
        Self {
            data,
            ..Self::default()
        }
    }

    pub fn needs_approval(approval_id: impl Into<String>, data: Value) -> Self {
        Self {
            data,
            requires_approval: true,
            approval_id: Some(approval_id.into()),
        }
    }
}

/// 能力 trait：名称、关键词集（用于近似名归一）、合法动作集（首项为默认动作）、执行
#[async_trait]
pub trait Capability: Send + Sync {
    fn name(&self) -> &'static str;

    /// 归一打分用的关键词集
    fn keywords(&self) -> &'static [&'static str];

    /// 合法动作列表；resolve_action 对不上时退回首项
    fn actions(&self) -> &'static [&'static str];

    /// 计划预览里的单步人类可读描述
    fn describe_action(&self, action: &str) -> String {
        format!("{}: {}", self.name(), action)
    }

    async fn execute(
        &self,
        user_id: &str,
        task: &AgentTask,
        session_id: &str,
    ) -> Result<AgentOutcome, CoreError>;
}

/// 能力注册表：启动时显式注册，运行期只读
#[derive(Default)]
pub struct CapabilityRegistry {
    capabilities: HashMap<String, Arc<dyn Capability>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, capability: impl Capability + 'static) {
        self.capabilities
            .insert(capability.name().to_string(), Arc::new(capability));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        self.capabilities.get(name).cloned()
    }

    pub fn agent_names(&self) -> Vec<String> {
        self.capabilities.keys().cloned().collect()
    }

    /// 归一智能体名：精确命中直接放行，否则按关键词子串打分取最高，零分退回 coordinator
    pub fn resolve_agent(&self, name: &str) -> String {
        if self.capabilities.contains_key(name) {
            return name.to_string();
        }

        let needle = name.trim().to_lowercase();
        let mut best: Option<(&str, usize)> = None;

        for cap in self.capabilities.values() {
            let score = cap
                .keywords()
                .iter()
                .filter(|kw| needle.contains(*kw) || kw.contains(needle.as_str()))
                .count();
            if score > 0 && best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((cap.name(), score));
            }
        }

        match best {
            Some((name, _)) => name.to_string(),
            None => {
                tracing::warn!("unknown agent name '{}', falling back to coordinator", name);
                COORDINATOR.to_string()
            }
        }
    }

    /// 归一动作名：限定在该智能体声明的动作集内，对不上时退回首个合法动作
    pub fn resolve_action(&self, agent: &str, action: &str) -> String {
        let Some(cap) = self.capabilities.get(agent) else {
            return action.to_string();
        };
        let actions = cap.actions();

        if actions.contains(&action) {
            return action.to_string();
        }

        let needle = action.trim().to_lowercase();
        let matched = actions
            .iter()
            .find(|a| needle.contains(**a) || a.contains(needle.as_str()));

        match matched {
            Some(a) => a.to_string(),
            None => {
                let fallback = actions.first().copied().unwrap_or("noop");
                tracing::warn!(
                    "unknown action '{}' for agent '{}', defaulting to '{}'",
                    action,
                    agent,
                    fallback
                );
                fallback.to_string()
            }
        }
    }

    /// 调用已注册能力；未注册的规范名属于编程类错误，不得静默吞掉
    pub async fn dispatch(
        &self,
        agent: &str,
        user_id: &str,
        task: &AgentTask,
        session_id: &str,
    ) -> Result<AgentOutcome, CoreError> {
        let cap = self
            .capabilities
            .get(agent)
            .ok_or_else(|| CoreError::UnknownAgent(agent.to_string()))?;
        cap.execute(user_id, task, session_id).await
    }
}
