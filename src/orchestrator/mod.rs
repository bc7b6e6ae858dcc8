//! 编排层：任务规划 → 富化 → 审批门 → 任务图执行 → 应答合成
//!
//! Orchestrator 是组合根：含不可撤销动作的计划先挂起等人确认，其余直接执行并把
//! 部分失败合成为人类可读应答。所有对话式失败都带叙述文本，不裸抛错误。

pub mod approval;
pub mod error;
pub mod executor;
pub mod planner;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::agents::CapabilityRegistry;
use crate::llm::FailoverChain;
use crate::store::DocStore;

pub use approval::{
    has_irreversible, is_irreversible, AccessKind, Approval, ApprovalDecision, ApprovalGate,
    ApprovalMeta, ApprovalStatus, Approvals, PendingPlan, PlanPreview, StepPreview,
    IRREVERSIBLE_ACTIONS, NS_APPROVALS, NS_PENDING_PLANS,
};
pub use error::CoreError;
pub use executor::{
    AgentState, AgentStatus, TaskGraphExecutor, TaskOutcome, TaskRecord, TaskSpec, TaskStatus,
    NS_TASKS,
};
pub use planner::{PlannedTask, PlannedTasks, Planner};

/// 候选人画像命名空间（管线上传简历后写入，编排富化时读取）
pub const NS_PROFILE: &str = "profile";
/// 画像文档键
pub const PROFILE_KEY: &str = "profile";

/// 一次编排请求的应答
#[derive(Debug, Clone)]
pub struct OrchestratorResponse {
    /// 人类可读叙述（失败时也有）
    pub message: String,
    /// 计划含不可撤销动作，已挂起等确认
    pub requires_confirmation: bool,
    pub plan_id: Option<String>,
    pub preview: Option<PlanPreview>,
    pub results: Option<HashMap<u32, TaskOutcome>>,
}

impl OrchestratorResponse {
    fn message_only(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            requires_confirmation: false,
            plan_id: None,
            preview: None,
            results: None,
        }
    }
}

/// 编排器
pub struct Orchestrator {
    registry: Arc<CapabilityRegistry>,
    store: Arc<dyn DocStore>,
    executor: Arc<TaskGraphExecutor>,
    gate: Arc<ApprovalGate>,
    approvals: Arc<Approvals>,
    planner: Planner,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        store: Arc<dyn DocStore>,
        executor: Arc<TaskGraphExecutor>,
        gate: Arc<ApprovalGate>,
        approvals: Arc<Approvals>,
        llm: Arc<FailoverChain>,
    ) -> Self {
        let catalog = Self::catalog(&registry);
        Self {
            registry,
            store,
            executor,
            gate,
            approvals,
            planner: Planner::new(llm, catalog),
        }
    }

    /// 能力目录文本（嵌入规划 prompt）
    fn catalog(registry: &CapabilityRegistry) -> String {
        let mut names = registry.agent_names();
        names.sort();
        names
            .iter()
            .filter_map(|name| registry.get(name))
            .map(|cap| format!("- {}: {}", cap.name(), cap.actions().join(", ")))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// 处理一次用户请求：规划 → 富化 → 审批门 → 执行 → 合成
    pub async fn handle(
        &self,
        user_id: &str,
        session_id: &str,
        message: &str,
    ) -> Result<OrchestratorResponse, CoreError> {
        let profile = self.store.get(user_id, NS_PROFILE, PROFILE_KEY).await?;

        let (mut specs, summary) = match self.planner.plan(message, profile.is_some()).await {
            Ok(planned) => planned,
            Err(e) if e.is_provider_exhausted() => {
                tracing::warn!("planner exhausted all providers: {}", e);
                return Ok(OrchestratorResponse::message_only(
                    "All language model providers are currently unavailable. Please try again later.",
                ));
            }
            Err(e) => return Err(e),
        };

        // 先归一再分类：规划器产出的近似动作名（如 "send_application now"）必须先落回
        // 规范名，否则会漏过不可撤销集合、绕开审批门
        for spec in specs.iter_mut() {
            spec.agent = self.registry.resolve_agent(&spec.agent);
            spec.action = self.registry.resolve_action(&spec.agent, &spec.action);
        }

        self.enrich(user_id, &mut specs, profile.as_ref()).await;

        if has_irreversible(&specs) {
            let registry = self.registry.clone();
            let preview = self.gate.build_preview(&specs, |spec| {
                let agent = registry.resolve_agent(&spec.agent);
                match registry.get(&agent) {
                    Some(cap) => cap.describe_action(&registry.resolve_action(&agent, &spec.action)),
                    None => format!("{}: {}", spec.agent, spec.action),
                }
            });
            let plan_id = self
                .gate
                .pause(user_id, session_id, specs, json!({"request": message}))
                .await?;

            let mut lines = vec![
                "This plan contains irreversible steps and needs your confirmation:".to_string(),
            ];
            for (i, step) in preview.steps.iter().enumerate() {
                lines.push(format!("  {}. [{}] {}", i + 1, access_tag(step), step.description));
            }
            lines.push("Reply 'approve' to run it or 'reject' to cancel.".to_string());

            return Ok(OrchestratorResponse {
                message: lines.join("\n"),
                requires_confirmation: true,
                plan_id: Some(plan_id),
                preview: Some(preview),
                results: None,
            });
        }

        let results = self.executor.execute_plan(user_id, session_id, &specs).await?;
        let message = synthesize(summary.as_deref(), &results);
        Ok(OrchestratorResponse {
            message,
            requires_confirmation: false,
            plan_id: None,
            preview: None,
            results: Some(results),
        })
    }

    /// 富化：把已存画像与上次角色 / 地点补进缺参的任务输入
    async fn enrich(&self, user_id: &str, specs: &mut [TaskSpec], profile: Option<&Value>) {
        let pipeline_state = self
            .store
            .get(
                user_id,
                crate::pipeline::state::NS_PIPELINE,
                crate::pipeline::state::STATE_KEY,
            )
            .await
            .ok()
            .flatten();

        for spec in specs.iter_mut() {
            let Value::Object(input) = &mut spec.input else {
                continue;
            };
            if let Some(profile) = profile {
                input
                    .entry("profile".to_string())
                    .or_insert_with(|| profile.clone());
            }
            if let Some(state) = &pipeline_state {
                for field in ["role", "location"] {
                    if !input.contains_key(field) {
                        if let Some(v) = state.get(field).filter(|v| !v.is_null()) {
                            input.insert(field.to_string(), v.clone());
                        }
                    }
                }
            }
        }
    }

    /// 确认挂起的计划并执行
    pub async fn confirm_plan(
        &self,
        user_id: &str,
        plan_id: &str,
    ) -> Result<OrchestratorResponse, CoreError> {
        let results = self.gate.confirm(user_id, plan_id).await?;
        let message = synthesize(Some("Plan confirmed and executed."), &results);
        Ok(OrchestratorResponse {
            message,
            requires_confirmation: false,
            plan_id: None,
            preview: None,
            results: Some(results),
        })
    }

    /// 拒绝挂起的计划
    pub async fn reject_plan(
        &self,
        user_id: &str,
        plan_id: &str,
    ) -> Result<OrchestratorResponse, CoreError> {
        self.gate.reject(user_id, plan_id).await?;
        Ok(OrchestratorResponse::message_only(
            "Plan cancelled. Nothing was executed.",
        ))
    }

    /// 人工应答一条审批并在放行（Approve / Modify）时恢复对应的等待任务
    ///
    /// 任务级审批的闭环：执行器把任务停在 WaitingApproval，这里应答后经审批门
    /// resume 把它跑完。Reject 只落终态，什么都不执行。
    pub async fn respond_approval(
        &self,
        user_id: &str,
        session_id: &str,
        approval_id: &str,
        decision: ApprovalDecision,
        modified_content: Option<Value>,
    ) -> Result<OrchestratorResponse, CoreError> {
        let approval = self
            .approvals
            .respond(user_id, approval_id, decision, modified_content)
            .await?;

        if !matches!(
            approval.status,
            ApprovalStatus::Approved | ApprovalStatus::Modified
        ) {
            return Ok(OrchestratorResponse::message_only(
                "Approval declined. Nothing was executed.",
            ));
        }

        let (local_id, outcome) = self
            .gate
            .resume(
                &self.approvals,
                user_id,
                session_id,
                approval_id,
                approval.content.modified.clone(),
            )
            .await?;

        let message = if outcome.success {
            "Approved and executed.".to_string()
        } else {
            format!(
                "Approved, but execution failed: {}",
                outcome.error.as_deref().unwrap_or("unknown error")
            )
        };
        let mut results = HashMap::new();
        results.insert(local_id, outcome);
        Ok(OrchestratorResponse {
            message,
            requires_confirmation: false,
            plan_id: None,
            preview: None,
            results: Some(results),
        })
    }

    /// 智能体观测状态投影
    pub async fn agent_statuses(&self, user_id: &str) -> Result<Vec<AgentStatus>, CoreError> {
        self.executor.agent_statuses(user_id).await
    }
}

fn access_tag(step: &StepPreview) -> &'static str {
    match step.access {
        AccessKind::Read => "read",
        AccessKind::Write => "write",
    }
}

/// 把结果表合成人类可读叙述
fn synthesize(summary: Option<&str>, results: &HashMap<u32, TaskOutcome>) -> String {
    let total = results.len();
    let succeeded = results.values().filter(|r| r.success).count();
    let mut out = String::new();

    if let Some(summary) = summary {
        out.push_str(summary);
        out.push('\n');
    }
    out.push_str(&format!("{}/{} steps completed.", succeeded, total));

    let mut failures: Vec<(&u32, &TaskOutcome)> =
        results.iter().filter(|(_, r)| !r.success).collect();
    failures.sort_by_key(|(id, _)| **id);
    for (id, outcome) in failures {
        out.push_str(&format!(
            "\n  step {} failed: {}",
            id,
            outcome.error.as_deref().unwrap_or("unknown error")
        ));
    }
    out
}
