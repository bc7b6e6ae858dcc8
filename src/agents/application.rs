//! 申请能力：联系人查找与申请外发
//!
//! send_application 是不可撤销动作：参数里没有审批放行标记时，这里不发信，
//! 只创建待审批记录并挂起；带标记重跑时先查幂等键，再真正外发。

use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{AgentOutcome, AgentTask, Capability};
use crate::orchestrator::approval::{ApprovalMeta, Approvals};
use crate::orchestrator::error::CoreError;
use crate::store::DocStore;

const NS_SENT: &str = "sent_applications";

/// 一位招聘联系人
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub title: Option<String>,
}

/// 联系人目录边界：外部实现（爬取 / 人才库），核心只消费
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    async fn find(&self, company: &str) -> Result<Vec<Contact>, CoreError>;
}

/// 静态联系人目录（演示 / 测试）：未知公司退化为 careers@ 别名
pub struct StaticContactDirectory {
    entries: Vec<(String, Contact)>,
}

impl StaticContactDirectory {
    pub fn new(entries: Vec<(String, Contact)>) -> Self {
        Self { entries }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl ContactDirectory for StaticContactDirectory {
    async fn find(&self, company: &str) -> Result<Vec<Contact>, CoreError> {
        let needle = company.to_lowercase();
        let hits: Vec<Contact> = self
            .entries
            .iter()
            .filter(|(c, _)| c.to_lowercase() == needle)
            .map(|(_, contact)| contact.clone())
            .collect();
        if !hits.is_empty() {
            return Ok(hits);
        }
        let slug: String = company
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_lowercase();
        Ok(vec![Contact {
            name: format!("{} Recruiting", company),
            email: format!("careers@{}.com", slug),
            title: None,
        }])
    }
}

/// 外发邮件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub attachment_path: Option<String>,
}

/// 发信边界：真实实现接 SMTP / 邮件 API
#[async_trait]
pub trait Mailer: Send + Sync {
    /// 返回 message id
    async fn send(&self, email: &OutboundEmail) -> Result<String, CoreError>;
}

/// 记录型 Mailer（演示 / 测试）：不真正外发，只留底
#[derive(Default)]
pub struct RecordingMailer {
    sent: Mutex<Vec<OutboundEmail>>,
}

impl RecordingMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<OutboundEmail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, email: &OutboundEmail) -> Result<String, CoreError> {
        tracing::info!(to = %email.to, subject = %email.subject, "recording outbound email");
        self.sent.lock().unwrap().push(email.clone());
        Ok(format!("msg_{}", uuid::Uuid::new_v4()))
    }
}

/// 申请能力
pub struct ApplicationAgent {
    store: Arc<dyn DocStore>,
    mailer: Arc<dyn Mailer>,
    directory: Arc<dyn ContactDirectory>,
    approvals: Arc<Approvals>,
}

impl ApplicationAgent {
    pub fn new(
        store: Arc<dyn DocStore>,
        mailer: Arc<dyn Mailer>,
        directory: Arc<dyn ContactDirectory>,
        approvals: Arc<Approvals>,
    ) -> Self {
        Self {
            store,
            mailer,
            directory,
            approvals,
        }
    }

    async fn find_contacts(&self, task: &AgentTask) -> Result<AgentOutcome, CoreError> {
        let mut companies: Vec<String> = Vec::new();
        if let Some(list) = task.params.get("companies").and_then(|v| v.as_array()) {
            companies.extend(list.iter().filter_map(|v| v.as_str().map(String::from)));
        }
        if let Some(jobs) = task.params.get("jobs").and_then(|v| v.as_array()) {
            companies.extend(
                jobs.iter()
                    .filter_map(|j| j.get("company").and_then(|v| v.as_str()).map(String::from)),
            );
        }
        companies.dedup();
        if companies.is_empty() {
            return Err(CoreError::Validation(
                "find_contacts requires 'companies' or 'jobs'".to_string(),
            ));
        }

        let mut results = Vec::with_capacity(companies.len());
        for company in &companies {
            let contacts = self.directory.find(company).await?;
            results.push(json!({"company": company, "contacts": contacts}));
        }
        tracing::info!(companies = companies.len(), "contact lookup finished");
        Ok(AgentOutcome::data(json!({"results": results})))
    }

    fn parse_email(task: &AgentTask) -> Result<OutboundEmail, CoreError> {
        let field = |name: &str| -> Result<String, CoreError> {
            task.params
                .get(name)
                .and_then(|v| v.as_str())
                .filter(|s| !s.trim().is_empty())
                .map(String::from)
                .ok_or_else(|| {
                    CoreError::Validation(format!("send_application requires '{}'", name))
                })
        };
        Ok(OutboundEmail {
            to: field("to")?,
            subject: field("subject")?,
            body: field("body")?,
            attachment_path: task
                .params
                .get("attachment_path")
                .and_then(|v| v.as_str())
                .map(String::from),
        })
    }

    async fn send_application(
        &self,
        user_id: &str,
        task: &AgentTask,
    ) -> Result<AgentOutcome, CoreError> {
        let email = Self::parse_email(task)?;

        let approved = task
            .params
            .get("approved")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !approved {
            // 未放行：只登记审批，绝不外发
            let approval_id = self
                .approvals
                .create_pending(
                    user_id,
                    ApprovalMeta {
                        approval_type: "send_application".to_string(),
                        title: format!("Send application to {}", email.to),
                        content: serde_json::to_value(&email)
                            .map_err(|e| CoreError::Store(e.to_string()))?,
                        subject_task_id: None,
                        urgency: "normal".to_string(),
                    },
                )
                .await?;
            tracing::info!(%approval_id, to = %email.to, "send paused pending approval");
            return Ok(AgentOutcome::needs_approval(
                approval_id,
                json!({"preview": email}),
            ));
        }

        // 幂等键：同收件人 + 同主题只发一次
        let idem_key = task
            .params
            .get("idempotency_key")
            .and_then(|v| v.as_str())
            .map(String::from)
            .unwrap_or_else(|| format!("{}:{}", email.to, email.subject));
        if let Some(prior) = self.store.get(user_id, NS_SENT, &idem_key).await? {
            tracing::warn!(key = %idem_key, "duplicate send suppressed");
            return Ok(AgentOutcome::data(json!({
                "message_id": prior.get("message_id").cloned().unwrap_or(Value::Null),
                "duplicate": true,
            })));
        }

        let message_id = self.mailer.send(&email).await?;
        self.store
            .put(
                user_id,
                NS_SENT,
                &idem_key,
                json!({
                    "message_id": message_id,
                    "to": email.to,
                    "subject": email.subject,
                    "sent_at": chrono::Utc::now().timestamp_millis(),
                }),
                None,
            )
            .await?;
        tracing::info!(%message_id, to = %email.to, "application sent");
        Ok(AgentOutcome::data(json!({"message_id": message_id})))
    }
}

#[async_trait]
impl Capability for ApplicationAgent {
    fn name(&self) -> &'static str {
        "application"
    }

    fn keywords(&self) -> &'static [&'static str] {
        &["apply", "application", "send", "email", "contact"]
    }

    fn actions(&self) -> &'static [&'static str] {
        &["find_contacts", "send_application"]
    }

    fn describe_action(&self, action: &str) -> String {
        match action {
            "find_contacts" => "look up recruiting contacts for target companies".to_string(),
            "send_application" => "send the application email (requires approval)".to_string(),
            other => format!("application: {}", other),
        }
    }

    async fn execute(
        &self,
        user_id: &str,
        task: &AgentTask,
        _session_id: &str,
    ) -> Result<AgentOutcome, CoreError> {
        match task.action.as_str() {
            "find_contacts" => self.find_contacts(task).await,
            "send_application" => self.send_application(user_id, task).await,
            other => Err(CoreError::Validation(format!(
                "unknown application action: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::create_store;

    fn agent_with_mailer() -> (ApplicationAgent, Arc<RecordingMailer>) {
        let store = create_store(None);
        let mailer = Arc::new(RecordingMailer::new());
        let agent = ApplicationAgent::new(
            store.clone(),
            mailer.clone(),
            Arc::new(StaticContactDirectory::empty()),
            Arc::new(Approvals::new(store, 3600)),
        );
        (agent, mailer)
    }

    fn send_task(approved: bool) -> AgentTask {
        let mut params = json!({
            "to": "hr@acme.com",
            "subject": "Application: Software Engineer",
            "body": "Dear team, ...",
        });
        if approved {
            params["approved"] = json!(true);
        }
        AgentTask::new("send_application", params)
    }

    #[tokio::test]
    async fn unapproved_send_pauses_and_sends_nothing() {
        let (agent, mailer) = agent_with_mailer();
        let outcome = agent.execute("u1", &send_task(false), "s1").await.unwrap();
        assert!(outcome.requires_approval);
        assert!(outcome.approval_id.is_some());
        assert!(mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn approved_send_goes_out_once() {
        let (agent, mailer) = agent_with_mailer();
        let outcome = agent.execute("u1", &send_task(true), "s1").await.unwrap();
        assert!(!outcome.requires_approval);
        assert!(outcome.data["message_id"].is_string());
        assert_eq!(mailer.sent().len(), 1);

        // 同收件人同主题重发被幂等键拦下
        let dup = agent.execute("u1", &send_task(true), "s1").await.unwrap();
        assert_eq!(dup.data["duplicate"], true);
        assert_eq!(mailer.sent().len(), 1);
    }

    #[tokio::test]
    async fn directory_falls_back_to_careers_alias() {
        let dir = StaticContactDirectory::empty();
        let contacts = dir.find("Foo Bar Inc").await.unwrap();
        assert_eq!(contacts[0].email, "careers@foobarinc.com");
    }
}
