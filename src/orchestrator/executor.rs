//! 任务图执行器
//!
//! 输入为带本地整数 id 与可选 depends_on 的有序任务列表。执行策略是单趟扫描而非拓扑排序：
//! 调用方必须按因果顺序给出依赖；扫描到某任务时其依赖未全部 Completed，则该任务标记
//! Cancelled（"dependencies not met"）并跳过。处理器失败只记录在任务上，不中断其余计划；
//! 返回的结果表对每个本地 id 都有条目。停在 WaitingApproval 的任务由审批门在人工放行后
//! 经 resume_approved 恢复执行。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::agents::{AgentTask, CapabilityRegistry};
use crate::orchestrator::error::CoreError;
use crate::store::DocStore;

/// 任务记录命名空间
pub const NS_TASKS: &str = "tasks";

/// 一条任务规格（计划的组成单元）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    /// 计划内的本地 id（依赖引用的目标）
    pub local_id: u32,
    pub agent: String,
    pub action: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub depends_on: Vec<u32>,
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    WaitingApproval,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

/// 持久化的任务记录；仅由执行器变更
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub local_id: u32,
    pub agent_name: String,
    pub action: String,
    pub input: Value,
    pub depends_on: Vec<u32>,
    pub status: TaskStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub approval_id: Option<String>,
    pub created_at: i64,
    pub finished_at: Option<i64>,
}

impl TaskRecord {
    fn from_spec(agent: String, action: String, spec: &TaskSpec) -> Self {
        Self {
            id: format!("task_{}", uuid::Uuid::new_v4()),
            local_id: spec.local_id,
            agent_name: agent,
            action,
            input: spec.input.clone(),
            depends_on: spec.depends_on.clone(),
            status: TaskStatus::Pending,
            output: None,
            error: None,
            approval_id: None,
            created_at: chrono::Utc::now().timestamp_millis(),
            finished_at: None,
        }
    }
}

/// 单个任务的执行结果（结果表条目）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl TaskOutcome {
    fn ok(data: Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// 智能体观测状态（从任务记录派生的非权威投影）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub agent_name: String,
    pub status: AgentState,
    pub current_task: Option<String>,
    pub last_active: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Working,
    WaitingApproval,
    Completed,
    Error,
}

/// 任务图执行器：归一 → 落库 → 单趟执行 → 合并部分结果
pub struct TaskGraphExecutor {
    registry: Arc<CapabilityRegistry>,
    store: Arc<dyn DocStore>,
}

impl TaskGraphExecutor {
    pub fn new(registry: Arc<CapabilityRegistry>, store: Arc<dyn DocStore>) -> Self {
        Self { registry, store }
    }

    async fn persist(&self, user_id: &str, record: &TaskRecord) -> Result<(), CoreError> {
        let value = serde_json::to_value(record).map_err(|e| CoreError::Store(e.to_string()))?;
        self.store
            .put(user_id, NS_TASKS, &record.id, value, None)
            .await?;
        Ok(())
    }

    /// 执行一份计划，返回本地 id → 结果的完整映射
    pub async fn execute_plan(
        &self,
        user_id: &str,
        session_id: &str,
        specs: &[TaskSpec],
    ) -> Result<HashMap<u32, TaskOutcome>, CoreError> {
        // 1. 归一智能体名 / 动作名并为每条规格落一条任务记录
        let mut records = Vec::with_capacity(specs.len());
        for spec in specs {
            let agent = self.registry.resolve_agent(&spec.agent);
            let action = self.registry.resolve_action(&agent, &spec.action);
            let record = TaskRecord::from_spec(agent, action, spec);
            self.persist(user_id, &record).await?;
            records.push(record);
        }

        let mut results: HashMap<u32, TaskOutcome> = HashMap::new();
        let mut completed: HashSet<u32> = HashSet::new();

        // 2. 按原始顺序单趟执行
        for record in &mut records {
            let deps_met = record.depends_on.iter().all(|d| completed.contains(d));
            if !deps_met {
                record.status = TaskStatus::Cancelled;
                record.error = Some("dependencies not met".to_string());
                record.finished_at = Some(chrono::Utc::now().timestamp_millis());
                self.persist(user_id, record).await?;
                results.insert(record.local_id, TaskOutcome::err("dependencies not met"));
                tracing::info!(
                    agent = %record.agent_name,
                    local_id = record.local_id,
                    "task cancelled: dependencies not met"
                );
                continue;
            }

            record.status = TaskStatus::InProgress;
            self.persist(user_id, record).await?;

            let task = AgentTask::new(record.action.clone(), record.input.clone());
            match self
                .registry
                .dispatch(&record.agent_name, user_id, &task, session_id)
                .await
            {
                Ok(outcome) if outcome.requires_approval => {
                    // 副作用被审批门拦下：任务停在 WaitingApproval，待确认后恢复
                    record.status = TaskStatus::WaitingApproval;
                    record.approval_id = outcome.approval_id.clone();
                    self.persist(user_id, record).await?;
                    results.insert(
                        record.local_id,
                        TaskOutcome::ok(json!({
                            "requires_approval": true,
                            "approval_id": outcome.approval_id,
                            "data": outcome.data,
                        })),
                    );
                }
                Ok(outcome) => {
                    record.status = TaskStatus::Completed;
                    record.output = Some(outcome.data.clone());
                    record.finished_at = Some(chrono::Utc::now().timestamp_millis());
                    self.persist(user_id, record).await?;
                    completed.insert(record.local_id);
                    results.insert(record.local_id, TaskOutcome::ok(outcome.data));
                }
                // 编程类错误向上传播，不得按业务失败吞掉
                Err(CoreError::UnknownAgent(name)) => {
                    return Err(CoreError::UnknownAgent(name));
                }
                Err(e) => {
                    record.status = TaskStatus::Failed;
                    record.error = Some(e.to_string());
                    record.finished_at = Some(chrono::Utc::now().timestamp_millis());
                    self.persist(user_id, record).await?;
                    results.insert(record.local_id, TaskOutcome::err(e.to_string()));
                    tracing::warn!(
                        agent = %record.agent_name,
                        local_id = record.local_id,
                        "task failed: {}",
                        e
                    );
                }
            }
        }

        Ok(results)
    }

    /// 恢复执行停在 WaitingApproval 的任务（按 approval_id 定位）
    ///
    /// patch 为放行时要并入任务输入的字段（approved 标记与人工改稿），只能由审批门
    /// 在确认放行后构造。返回 (本地 id, 结果)。
    pub async fn resume_approved(
        &self,
        user_id: &str,
        session_id: &str,
        approval_id: &str,
        patch: Value,
    ) -> Result<(u32, TaskOutcome), CoreError> {
        let docs = self.store.list(user_id, NS_TASKS).await?;
        let mut record = docs
            .into_iter()
            .filter_map(|(_, v)| serde_json::from_value::<TaskRecord>(v).ok())
            .find(|r| {
                r.status == TaskStatus::WaitingApproval
                    && r.approval_id.as_deref() == Some(approval_id)
            })
            .ok_or_else(|| {
                CoreError::NotFound(format!("waiting task for approval {}", approval_id))
            })?;

        match (&mut record.input, patch) {
            (Value::Object(input), Value::Object(extra)) => {
                for (k, v) in extra {
                    input.insert(k, v);
                }
            }
            (slot, patch) => *slot = patch,
        }

        record.status = TaskStatus::InProgress;
        self.persist(user_id, &record).await?;

        let task = AgentTask::new(record.action.clone(), record.input.clone());
        let outcome = match self
            .registry
            .dispatch(&record.agent_name, user_id, &task, session_id)
            .await
        {
            Ok(outcome) if outcome.requires_approval => {
                // 处理器又开了一轮审批：保持等待，换上新的审批 id
                record.status = TaskStatus::WaitingApproval;
                record.approval_id = outcome.approval_id.clone();
                self.persist(user_id, &record).await?;
                return Ok((
                    record.local_id,
                    TaskOutcome::ok(json!({
                        "requires_approval": true,
                        "approval_id": outcome.approval_id,
                        "data": outcome.data,
                    })),
                ));
            }
            Ok(outcome) => {
                record.status = TaskStatus::Completed;
                record.output = Some(outcome.data.clone());
                TaskOutcome::ok(outcome.data)
            }
            Err(CoreError::UnknownAgent(name)) => {
                return Err(CoreError::UnknownAgent(name));
            }
            Err(e) => {
                record.status = TaskStatus::Failed;
                record.error = Some(e.to_string());
                TaskOutcome::err(e.to_string())
            }
        };
        record.finished_at = Some(chrono::Utc::now().timestamp_millis());
        self.persist(user_id, &record).await?;
        Ok((record.local_id, outcome))
    }

    /// 从任务记录派生各智能体的观测状态
    pub async fn agent_statuses(&self, user_id: &str) -> Result<Vec<AgentStatus>, CoreError> {
        let docs = self.store.list(user_id, NS_TASKS).await?;
        let mut by_agent: HashMap<String, Vec<TaskRecord>> = HashMap::new();
        for (_, value) in docs {
            if let Ok(record) = serde_json::from_value::<TaskRecord>(value) {
                by_agent.entry(record.agent_name.clone()).or_default().push(record);
            }
        }

        let mut statuses = Vec::new();
        for (agent_name, mut records) in by_agent {
            records.sort_by_key(|r| r.created_at);
            let last = match records.last() {
                Some(r) => r,
                None => continue,
            };
            let status = match last.status {
                TaskStatus::InProgress => AgentState::Working,
                TaskStatus::WaitingApproval => AgentState::WaitingApproval,
                TaskStatus::Failed => AgentState::Error,
                TaskStatus::Completed => AgentState::Completed,
                TaskStatus::Pending | TaskStatus::Cancelled => AgentState::Idle,
            };
            let current_task = (!last.status.is_terminal()).then(|| last.action.clone());
            statuses.push(AgentStatus {
                agent_name,
                status,
                current_task,
                last_active: last.finished_at.unwrap_or(last.created_at),
            });
        }
        statuses.sort_by(|a, b| a.agent_name.cmp(&b.agent_name));
        Ok(statuses)
    }
}
