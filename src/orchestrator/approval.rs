//! 人工审批门
//!
//! 不可撤销动作（发送邮件 / 投递申请）属于固定封闭集合。含此类动作的计划先构建人类可读
//! 预览并按会话持久化为待确认计划；confirm 与 resume 是仅有的两条真正执行不可撤销任务的
//! 路径（都只在人已放行后打 approved 标记），reject 只删不跑。
//! 审批记录单独持久化并带过期时间：过期或已终态的审批不恢复执行。

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::orchestrator::error::CoreError;
use crate::orchestrator::executor::{TaskGraphExecutor, TaskOutcome, TaskSpec};
use crate::store::DocStore;

/// 待确认计划命名空间
pub const NS_PENDING_PLANS: &str = "pending_plans";
/// 审批记录命名空间
pub const NS_APPROVALS: &str = "approvals";

/// 不可撤销动作的固定封闭集合
pub const IRREVERSIBLE_ACTIONS: &[&str] =
    &["send_application", "send_email", "submit_application"];

/// 动作是否不可撤销（纯函数，只看动作名）
pub fn is_irreversible(action: &str) -> bool {
    IRREVERSIBLE_ACTIONS.contains(&action)
}

/// 计划中是否含不可撤销动作（纯函数）
pub fn has_irreversible(specs: &[TaskSpec]) -> bool {
    specs.iter().any(|s| is_irreversible(&s.action))
}

/// 单步访问类型标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessKind {
    Read,
    Write,
}

fn access_of(action: &str) -> AccessKind {
    if is_irreversible(action)
        || action.starts_with("tailor")
        || action.starts_with("write")
        || action.starts_with("generate")
    {
        AccessKind::Write
    } else {
        AccessKind::Read
    }
}

/// 计划预览的单步
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepPreview {
    pub description: String,
    pub access: AccessKind,
}

/// 计划预览：执行前给人看的摘要
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanPreview {
    pub steps: Vec<StepPreview>,
    /// 不可撤销步骤的动作名列表
    pub irreversible: Vec<String>,
}

/// 按会话持久化的待确认计划
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingPlan {
    pub plan_id: String,
    pub user_id: String,
    pub session_id: String,
    pub specs: Vec<TaskSpec>,
    pub context: Value,
    pub created_at: i64,
}

/// 审批状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Modified,
    Expired,
}

impl ApprovalStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalStatus::Pending)
    }
}

/// 人对审批的应答
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    Reject,
    Modify,
}

/// 审批内容：原始稿与人工改稿
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalContent {
    pub original: Value,
    pub modified: Option<Value>,
}

/// 审批记录；由人工应答恰好变更一次，超时自动视为过期
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub id: String,
    pub user_id: String,
    pub approval_type: String,
    pub status: ApprovalStatus,
    pub subject_task_id: Option<String>,
    pub title: String,
    pub content: ApprovalContent,
    pub urgency: String,
    pub created_at: i64,
    pub expires_at: i64,
}

impl Approval {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}

/// 创建审批所需的元信息
#[derive(Debug, Clone)]
pub struct ApprovalMeta {
    pub approval_type: String,
    pub title: String,
    pub content: Value,
    pub subject_task_id: Option<String>,
    pub urgency: String,
}

/// 审批应答边界：创建 / 应答 / 查询待审批
pub struct Approvals {
    store: Arc<dyn DocStore>,
    ttl_secs: u64,
}

impl Approvals {
    pub fn new(store: Arc<dyn DocStore>, ttl_secs: u64) -> Self {
        Self { store, ttl_secs }
    }

    async fn persist(&self, approval: &Approval) -> Result<(), CoreError> {
        let value = serde_json::to_value(approval).map_err(|e| CoreError::Store(e.to_string()))?;
        // 记录本身不设存储 TTL：过期审批要保留下来作为终态证据
        self.store
            .put(&approval.user_id, NS_APPROVALS, &approval.id, value, None)
            .await?;
        Ok(())
    }

    /// 创建待审批记录，返回审批 id
    pub async fn create_pending(
        &self,
        user_id: &str,
        meta: ApprovalMeta,
    ) -> Result<String, CoreError> {
        let now = chrono::Utc::now().timestamp_millis();
        let approval = Approval {
            id: format!("approval_{}", uuid::Uuid::new_v4()),
            user_id: user_id.to_string(),
            approval_type: meta.approval_type,
            status: ApprovalStatus::Pending,
            subject_task_id: meta.subject_task_id,
            title: meta.title,
            content: ApprovalContent {
                original: meta.content,
                modified: None,
            },
            urgency: meta.urgency,
            created_at: now,
            expires_at: now + (self.ttl_secs as i64) * 1000,
        };
        self.persist(&approval).await?;
        Ok(approval.id)
    }

    async fn load(&self, user_id: &str, approval_id: &str) -> Result<Approval, CoreError> {
        let value = self
            .store
            .get(user_id, NS_APPROVALS, approval_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("approval {}", approval_id)))?;
        serde_json::from_value(value).map_err(|e| CoreError::Store(e.to_string()))
    }

    /// 人工应答：恰好变更一次；终态或过期后的应答是校验错误
    pub async fn respond(
        &self,
        user_id: &str,
        approval_id: &str,
        decision: ApprovalDecision,
        modified_content: Option<Value>,
    ) -> Result<Approval, CoreError> {
        let mut approval = self.load(user_id, approval_id).await?;
        let now = chrono::Utc::now().timestamp_millis();

        if approval.is_expired(now) && approval.status == ApprovalStatus::Pending {
            approval.status = ApprovalStatus::Expired;
            self.persist(&approval).await?;
        }
        if approval.status.is_terminal() {
            return Err(CoreError::Validation(
                "approval already resolved or expired".to_string(),
            ));
        }

        approval.status = match decision {
            ApprovalDecision::Approve => ApprovalStatus::Approved,
            ApprovalDecision::Reject => ApprovalStatus::Rejected,
            ApprovalDecision::Modify => ApprovalStatus::Modified,
        };
        approval.content.modified = modified_content;
        self.persist(&approval).await?;
        Ok(approval)
    }

    /// 查询用户的待审批记录；顺带把已过期的懒标记为 Expired 并排除
    pub async fn get_pending(&self, user_id: &str) -> Result<Vec<Approval>, CoreError> {
        let now = chrono::Utc::now().timestamp_millis();
        let docs = self.store.list(user_id, NS_APPROVALS).await?;
        let mut pending = Vec::new();
        for (_, value) in docs {
            let Ok(mut approval) = serde_json::from_value::<Approval>(value) else {
                continue;
            };
            if approval.status != ApprovalStatus::Pending {
                continue;
            }
            if approval.is_expired(now) {
                approval.status = ApprovalStatus::Expired;
                self.persist(&approval).await?;
                continue;
            }
            pending.push(approval);
        }
        pending.sort_by_key(|a| a.created_at);
        Ok(pending)
    }

    /// 恢复执行前检查审批是否处于放行状态（Approved / Modified）
    pub async fn is_released(&self, user_id: &str, approval_id: &str) -> Result<bool, CoreError> {
        let approval = self.load(user_id, approval_id).await?;
        Ok(matches!(
            approval.status,
            ApprovalStatus::Approved | ApprovalStatus::Modified
        ))
    }
}

/// 审批门：分类、预览、挂起、确认 / 拒绝
pub struct ApprovalGate {
    store: Arc<dyn DocStore>,
    executor: Arc<TaskGraphExecutor>,
    plan_ttl_secs: u64,
}

impl ApprovalGate {
    pub fn new(
        store: Arc<dyn DocStore>,
        executor: Arc<TaskGraphExecutor>,
        plan_ttl_secs: u64,
    ) -> Self {
        Self {
            store,
            executor,
            plan_ttl_secs,
        }
    }

    /// 构建执行前给人看的计划预览
    pub fn build_preview(&self, specs: &[TaskSpec], describe: impl Fn(&TaskSpec) -> String) -> PlanPreview {
        let steps = specs
            .iter()
            .map(|s| StepPreview {
                description: describe(s),
                access: access_of(&s.action),
            })
            .collect();
        let irreversible = specs
            .iter()
            .filter(|s| is_irreversible(&s.action))
            .map(|s| s.action.clone())
            .collect();
        PlanPreview { steps, irreversible }
    }

    /// 挂起计划：持久化 {tasks, context} 并返回句柄，任何任务都不执行
    pub async fn pause(
        &self,
        user_id: &str,
        session_id: &str,
        specs: Vec<TaskSpec>,
        context: Value,
    ) -> Result<String, CoreError> {
        let plan = PendingPlan {
            plan_id: format!("plan_{}", uuid::Uuid::new_v4()),
            user_id: user_id.to_string(),
            session_id: session_id.to_string(),
            specs,
            context,
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        let value = serde_json::to_value(&plan).map_err(|e| CoreError::Store(e.to_string()))?;
        self.store
            .put(
                user_id,
                NS_PENDING_PLANS,
                &plan.plan_id,
                value,
                Some(self.plan_ttl_secs),
            )
            .await?;
        Ok(plan.plan_id)
    }

    async fn load_plan(&self, user_id: &str, plan_id: &str) -> Result<PendingPlan, CoreError> {
        let value = self
            .store
            .get(user_id, NS_PENDING_PLANS, plan_id)
            .await?
            .ok_or_else(|| CoreError::NotFound("plan missing or expired".to_string()))?;
        serde_json::from_value(value).map_err(|e| CoreError::Store(e.to_string()))
    }

    /// 确认：加载计划 → 标记放行 → 交给执行器 → 删除计划
    pub async fn confirm(
        &self,
        user_id: &str,
        plan_id: &str,
    ) -> Result<HashMap<u32, TaskOutcome>, CoreError> {
        let mut plan = self.load_plan(user_id, plan_id).await?;

        // 人已放行：给不可撤销任务打上 approved 标记，处理器据此真正执行副作用
        for spec in &mut plan.specs {
            if is_irreversible(&spec.action) {
                if let Value::Object(map) = &mut spec.input {
                    map.insert("approved".to_string(), json!(true));
                } else {
                    spec.input = json!({"approved": true});
                }
            }
        }

        let results = self
            .executor
            .execute_plan(user_id, &plan.session_id, &plan.specs)
            .await?;
        self.store.delete(user_id, NS_PENDING_PLANS, plan_id).await?;
        Ok(results)
    }

    /// 审批放行后恢复执行停在 WaitingApproval 的任务
    ///
    /// 与 confirm 同级的第二条放行路径：先验证审批确实处于 Approved / Modified，
    /// 再把 approved 标记（以及人工改稿字段）并入任务输入交回执行器。
    pub async fn resume(
        &self,
        approvals: &Approvals,
        user_id: &str,
        session_id: &str,
        approval_id: &str,
        modified_content: Option<Value>,
    ) -> Result<(u32, TaskOutcome), CoreError> {
        if !approvals.is_released(user_id, approval_id).await? {
            return Err(CoreError::Validation(format!(
                "approval {} is not released",
                approval_id
            )));
        }

        let mut patch = match modified_content {
            Some(Value::Object(map)) => Value::Object(map),
            _ => json!({}),
        };
        if let Value::Object(map) = &mut patch {
            map.insert("approved".to_string(), json!(true));
        }
        self.executor
            .resume_approved(user_id, session_id, approval_id, patch)
            .await
    }

    /// 拒绝：只删除计划，绝不执行
    pub async fn reject(&self, user_id: &str, plan_id: &str) -> Result<(), CoreError> {
        let existed = self.store.delete(user_id, NS_PENDING_PLANS, plan_id).await?;
        if !existed {
            return Err(CoreError::NotFound("plan missing or expired".to_string()));
        }
        tracing::info!(plan_id, "pending plan rejected by user");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentOutcome, AgentTask, Capability, CapabilityRegistry, CoordinatorAgent};
    use crate::store::MemoryDocStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn spec(id: u32, action: &str) -> TaskSpec {
        TaskSpec {
            local_id: id,
            agent: "application".to_string(),
            action: action.to_string(),
            input: json!({}),
            depends_on: vec![],
        }
    }

    #[test]
    fn classify_is_pure_over_action_names() {
        assert!(has_irreversible(&[spec(1, "send_application")]));
        assert!(has_irreversible(&[spec(1, "search_jobs"), spec(2, "send_email")]));
        assert!(!has_irreversible(&[spec(1, "search_jobs"), spec(2, "tailor_resume")]));
    }

    struct CountingSender {
        sends: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Capability for CountingSender {
        fn name(&self) -> &'static str {
            "application"
        }
        fn keywords(&self) -> &'static [&'static str] {
            &["send", "apply", "application"]
        }
        fn actions(&self) -> &'static [&'static str] {
            &["send_application"]
        }
        async fn execute(
            &self,
            _user_id: &str,
            task: &AgentTask,
            _session_id: &str,
        ) -> Result<AgentOutcome, CoreError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            Ok(AgentOutcome::data(json!({
                "sent": task.params.get("approved").is_some()
            })))
        }
    }

    fn gate_with_counter() -> (ApprovalGate, Arc<AtomicUsize>) {
        let sends = Arc::new(AtomicUsize::new(0));
        let mut registry = CapabilityRegistry::new();
        registry.register(CountingSender { sends: sends.clone() });
        registry.register(CoordinatorAgent);
        let store: Arc<dyn DocStore> = Arc::new(MemoryDocStore::new());
        let executor = Arc::new(TaskGraphExecutor::new(Arc::new(registry), store.clone()));
        (ApprovalGate::new(store, executor, 3600), sends)
    }

    #[tokio::test]
    async fn pause_then_reject_executes_nothing_and_confirm_is_not_found() {
        let (gate, sends) = gate_with_counter();
        let plan_id = gate
            .pause("u1", "s1", vec![spec(1, "send_application")], json!({}))
            .await
            .unwrap();

        gate.reject("u1", &plan_id).await.unwrap();
        assert_eq!(sends.load(Ordering::SeqCst), 0);

        let err = gate.confirm("u1", &plan_id).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn confirm_runs_plan_once_and_deletes_it() {
        let (gate, sends) = gate_with_counter();
        let plan_id = gate
            .pause("u1", "s1", vec![spec(1, "send_application")], json!({}))
            .await
            .unwrap();

        let results = gate.confirm("u1", &plan_id).await.unwrap();
        assert!(results[&1].success);
        assert_eq!(sends.load(Ordering::SeqCst), 1);

        // 计划已删除，重复确认报 NotFound
        let err = gate.confirm("u1", &plan_id).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn expired_approval_rejects_late_response() {
        let store: Arc<dyn DocStore> = Arc::new(MemoryDocStore::new());
        let approvals = Approvals::new(store, 0); // 立即过期

        let id = approvals
            .create_pending(
                "u1",
                ApprovalMeta {
                    approval_type: "email".to_string(),
                    title: "Send application".to_string(),
                    content: json!({"to": "hr@acme.dev"}),
                    subject_task_id: None,
                    urgency: "normal".to_string(),
                },
            )
            .await
            .unwrap();

        assert!(approvals.get_pending("u1").await.unwrap().is_empty());

        let err = approvals
            .respond("u1", &id, ApprovalDecision::Approve, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn respond_mutates_exactly_once() {
        let store: Arc<dyn DocStore> = Arc::new(MemoryDocStore::new());
        let approvals = Approvals::new(store, 3600);

        let id = approvals
            .create_pending(
                "u1",
                ApprovalMeta {
                    approval_type: "email".to_string(),
                    title: "Send application".to_string(),
                    content: json!({"to": "hr@acme.dev"}),
                    subject_task_id: None,
                    urgency: "high".to_string(),
                },
            )
            .await
            .unwrap();

        assert_eq!(approvals.get_pending("u1").await.unwrap().len(), 1);

        let approved = approvals
            .respond("u1", &id, ApprovalDecision::Approve, None)
            .await
            .unwrap();
        assert_eq!(approved.status, ApprovalStatus::Approved);

        // 第二次应答被拒
        let err = approvals
            .respond("u1", &id, ApprovalDecision::Reject, None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }
}
