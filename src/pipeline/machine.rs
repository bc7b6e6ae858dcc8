//! 管线状态机
//!
//! 对话边界的唯一入口：chat(user, message, attached_file)。每条输入按固定优先级路由：
//! 显式重置 > 异步挡板 > 文件上传 > 评审回显 > 大脑决策。异步阶段由 StageRunner
//! 以分离任务推进，这里只负责迁移状态并立即返回。

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use crate::llm::LlmError;
use crate::orchestrator::approval::ApprovalGate;
use crate::orchestrator::error::CoreError;
use crate::pipeline::brain::{Brain, BrainAction, BrainDecision};
use crate::pipeline::stages::StageRunner;
use crate::pipeline::state::{PipelineState, PipelineStore, Stage};

/// 随消息附带的上传文件
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub content: String,
}

/// 画像解析边界：从上传文件提取候选人画像
#[async_trait]
pub trait ProfileExtractor: Send + Sync {
    async fn extract(&self, file: &UploadedFile) -> Result<Value, CoreError>;
}

/// 纯文本画像解析：首个非空行当姓名，其余整体当简历正文
pub struct PlainTextProfileExtractor;

#[async_trait]
impl ProfileExtractor for PlainTextProfileExtractor {
    async fn extract(&self, file: &UploadedFile) -> Result<Value, CoreError> {
        let content = file.content.trim();
        if content.is_empty() {
            return Err(CoreError::Validation(format!(
                "uploaded file '{}' is empty",
                file.name
            )));
        }
        let name = content.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
        Ok(json!({
            "name": name.trim(),
            "source_file": file.name,
            "raw": content,
        }))
    }
}

/// 一轮对话的回复
#[derive(Debug, Clone, Serialize)]
pub struct ChatReply {
    pub message: String,
    pub stage: Stage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ChatReply {
    fn new(message: impl Into<String>, stage: Stage) -> Self {
        Self {
            message: message.into(),
            stage,
            data: None,
        }
    }

    fn with_data(message: impl Into<String>, stage: Stage, data: Value) -> Self {
        Self {
            message: message.into(),
            stage,
            data: Some(data),
        }
    }
}

const WELCOME: &str = "Welcome! Upload your CV (any text file) to get started, \
or say 'reset' at any time to start over.";

const STATIC_MENU: &str = "The assistant brain is temporarily unavailable. \
You can still use these commands:\n\
- 'search <role> <city>' to look for jobs\n\
- 'generate' to tailor your CV for found jobs\n\
- 'find emails' to look up recruiting contacts\n\
- 'reset' to start over";

fn is_reset(input: &str) -> bool {
    matches!(
        input.to_lowercase().as_str(),
        "reset" | "start over" | "restart" | "重置" | "重新开始"
    )
}

fn is_approve(input: &str) -> bool {
    matches!(
        input.to_lowercase().as_str(),
        "approve" | "approved" | "yes" | "ok" | "send" | "confirm" | "确认" | "同意" | "发送"
    )
}

fn is_reject(input: &str) -> bool {
    matches!(
        input.to_lowercase().as_str(),
        "reject" | "no" | "cancel" | "discard" | "拒绝" | "取消"
    )
}

/// 管线状态机
pub struct PipelineMachine {
    states: Arc<PipelineStore>,
    runner: Arc<StageRunner>,
    brain: Brain,
    gate: Arc<ApprovalGate>,
    extractor: Arc<dyn ProfileExtractor>,
}

impl PipelineMachine {
    pub fn new(
        states: Arc<PipelineStore>,
        runner: Arc<StageRunner>,
        brain: Brain,
        gate: Arc<ApprovalGate>,
        extractor: Arc<dyn ProfileExtractor>,
    ) -> Self {
        Self {
            states,
            runner,
            brain,
            gate,
            extractor,
        }
    }

    /// 对话入口
    pub async fn chat(
        &self,
        user_id: &str,
        message: &str,
        attached_file: Option<UploadedFile>,
    ) -> Result<ChatReply, CoreError> {
        let input = message.trim();

        // 1. 显式重置永远优先
        if is_reset(input) {
            let fresh = self.states.reset(user_id).await?;
            return Ok(ChatReply::new(WELCOME, fresh.stage));
        }

        let mut state = self.states.load(user_id).await?;

        // 2. 异步阶段在途：挡回新命令，防止后台工作被重复派发
        if state.stage.is_async() {
            return Ok(ChatReply::new(
                format!(
                    "Still working ({:?})... check back in a moment.",
                    state.stage
                ),
                state.stage,
            ));
        }

        // 3. 文件上传在任何非异步阶段都接受
        if let Some(file) = attached_file {
            let profile = self.extractor.extract(&file).await?;
            let name = profile
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("there")
                .to_string();
            state.candidate_profile = Some(profile);
            state.stage = Stage::Ready;
            state.error = None;
            state.push_history("user", &format!("(uploaded {})", file.name));
            let reply = format!(
                "Thanks {}! Your profile is on file. Tell me what role and city you're after, e.g. 'Software Engineer Karachi'.",
                name
            );
            state.push_history("assistant", &reply);
            self.states.save(user_id, &state).await?;
            return Ok(ChatReply::new(reply, Stage::Ready));
        }

        // 4. 评审阶段：批 / 驳 / 幂等回显
        if state.stage.is_review() {
            return self.handle_review(user_id, input, state).await;
        }

        // 等位置追问的答复直接当地点
        if state.stage == Stage::AskingLocation && !input.is_empty() {
            let role = state.role.clone().ok_or_else(|| {
                CoreError::Validation("asking location without a known role".to_string())
            })?;
            return self
                .launch_search(user_id, state, role, input.to_string())
                .await;
        }

        // 没有画像一律引导上传
        if !state.has_profile() {
            return Ok(ChatReply::new(WELCOME, state.stage));
        }

        // 5. 其余自由文本交给大脑
        let decision = match self.brain.decide(&state, input).await {
            Ok(decision) => decision,
            Err(LlmError::Exhausted { .. }) => {
                // 提供商全灭：回静态菜单而不是失败这一轮
                tracing::warn!(user_id, "all llm providers exhausted, serving static menu");
                return Ok(ChatReply::new(STATIC_MENU, state.stage));
            }
            Err(other) => return Err(other.into()),
        };

        state.push_history("user", input);
        self.apply_decision(user_id, state, decision).await
    }

    async fn handle_review(
        &self,
        user_id: &str,
        input: &str,
        mut state: PipelineState,
    ) -> Result<ChatReply, CoreError> {
        if is_approve(input) {
            return match state.stage {
                Stage::Review1 => {
                    state.stage = Stage::Finding;
                    state.push_history("user", input);
                    self.states.save(user_id, &state).await?;
                    self.spawn_find_emails(user_id, state.clone());
                    Ok(ChatReply::new(
                        "Looking up recruiting contacts for your applications...",
                        Stage::Finding,
                    ))
                }
                Stage::Review2 => {
                    let plan_id = state.pending_approval_id.clone().ok_or_else(|| {
                        CoreError::NotFound("plan missing or expired".to_string())
                    })?;
                    state.stage = Stage::Sending;
                    state.push_history("user", input);
                    self.states.save(user_id, &state).await?;
                    let runner = self.runner.clone();
                    let user = user_id.to_string();
                    tokio::spawn(async move {
                        runner.run_send(&user, plan_id).await;
                    });
                    Ok(ChatReply::new(
                        "Sending your applications now...",
                        Stage::Sending,
                    ))
                }
                _ => unreachable!("handle_review called outside review stages"),
            };
        }

        if is_reject(input) {
            if state.stage == Stage::Review2 {
                if let Some(plan_id) = state.pending_approval_id.take() {
                    self.gate.reject(user_id, &plan_id).await?;
                }
            } else {
                state.generated_artifacts.clear();
            }
            state.stage = Stage::Ready;
            state.push_history("user", input);
            let reply = "Discarded. Tell me what to do next, or 'reset' to start over.";
            state.push_history("assistant", reply);
            self.states.save(user_id, &state).await?;
            return Ok(ChatReply::new(reply, Stage::Ready));
        }

        // 幂等回显：重复轮询不改状态、不追加历史
        let (summary, payload) = match state.stage {
            Stage::Review1 => (
                format!(
                    "{} generated document(s) awaiting your review. Reply 'approve' or 'reject'.",
                    state.generated_artifacts.len()
                ),
                json!({"artifacts": state.generated_artifacts}),
            ),
            _ => (
                format!(
                    "{} contact(s) found; sending awaits your approval. Reply 'approve' or 'reject'.",
                    state.contacts.len()
                ),
                json!({
                    "contacts": state.contacts,
                    "pending_approval_id": state.pending_approval_id,
                }),
            ),
        };
        Ok(ChatReply::with_data(summary, state.stage, payload))
    }

    async fn apply_decision(
        &self,
        user_id: &str,
        mut state: PipelineState,
        decision: BrainDecision,
    ) -> Result<ChatReply, CoreError> {
        match decision.action {
            BrainAction::Search => {
                let role = decision.role.or_else(|| state.role.clone());
                let location = decision.location.or_else(|| state.location.clone());
                let Some(role) = role.filter(|r| !r.is_empty()) else {
                    let reply = "What role should I search for? e.g. 'Software Engineer'.";
                    state.push_history("assistant", reply);
                    self.states.save(user_id, &state).await?;
                    return Ok(ChatReply::new(reply, state.stage));
                };
                match location.filter(|l| !l.is_empty()) {
                    Some(location) => self.launch_search(user_id, state, role, location).await,
                    None => {
                        state.role = Some(role);
                        state.stage = Stage::AskingLocation;
                        let reply = "Which city or region should I search in?";
                        state.push_history("assistant", reply);
                        self.states.save(user_id, &state).await?;
                        Ok(ChatReply::new(reply, Stage::AskingLocation))
                    }
                }
            }
            BrainAction::Generate => {
                if state.jobs.is_empty() {
                    let reply = "No jobs on file yet. Run a search first, e.g. 'search Software Engineer Karachi'.";
                    state.push_history("assistant", reply);
                    self.states.save(user_id, &state).await?;
                    return Ok(ChatReply::new(reply, state.stage));
                }
                state.stage = Stage::Generating;
                self.states.save(user_id, &state).await?;
                let runner = self.runner.clone();
                let user = user_id.to_string();
                let snapshot = state.clone();
                tokio::spawn(async move {
                    runner.run_generate(&user, "pipeline", snapshot).await;
                });
                Ok(ChatReply::new(
                    non_empty(decision.message, "Tailoring your CV and cover letters..."),
                    Stage::Generating,
                ))
            }
            BrainAction::FindEmails => {
                if state.generated_artifacts.is_empty() {
                    let reply =
                        "Nothing to send yet. Say 'generate' first to tailor your documents.";
                    state.push_history("assistant", reply);
                    self.states.save(user_id, &state).await?;
                    return Ok(ChatReply::new(reply, state.stage));
                }
                state.stage = Stage::Finding;
                self.states.save(user_id, &state).await?;
                self.spawn_find_emails(user_id, state.clone());
                Ok(ChatReply::new(
                    non_empty(decision.message, "Looking up recruiting contacts..."),
                    Stage::Finding,
                ))
            }
            BrainAction::None => {
                let reply = non_empty(
                    decision.message,
                    "I can search jobs, tailor your CV, and send applications. What next?",
                );
                state.push_history("assistant", &reply);
                self.states.save(user_id, &state).await?;
                Ok(ChatReply::new(reply, state.stage))
            }
        }
    }

    async fn launch_search(
        &self,
        user_id: &str,
        mut state: PipelineState,
        role: String,
        location: String,
    ) -> Result<ChatReply, CoreError> {
        state.role = Some(role.clone());
        state.location = Some(location.clone());
        state.stage = Stage::Searching;
        let narration = format!("Searching for '{}' jobs in {}...", role, location);
        state.push_history("assistant", &narration);
        self.states.save(user_id, &state).await?;

        let runner = self.runner.clone();
        let user = user_id.to_string();
        tokio::spawn(async move {
            runner.run_search(&user, "pipeline", role, location).await;
        });
        Ok(ChatReply::new(narration, Stage::Searching))
    }

    fn spawn_find_emails(&self, user_id: &str, state: PipelineState) {
        let runner = self.runner.clone();
        let user = user_id.to_string();
        tokio::spawn(async move {
            runner.run_find_emails(&user, "pipeline", state).await;
        });
    }
}

fn non_empty(preferred: String, fallback: &str) -> String {
    if preferred.trim().is_empty() {
        fallback.to_string()
    } else {
        preferred
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_and_review_keywords_match_expected_phrases() {
        assert!(is_reset("reset"));
        assert!(is_reset("Start Over"));
        assert!(!is_reset("research"));
        assert!(is_approve("APPROVE"));
        assert!(is_approve("确认"));
        assert!(is_reject("cancel"));
        assert!(!is_reject("cancellation policy?"));
    }

    #[tokio::test]
    async fn plain_text_extractor_takes_first_line_as_name() {
        let extractor = PlainTextProfileExtractor;
        let file = UploadedFile {
            name: "cv.txt".to_string(),
            content: "\nAda Lovelace\nSkills: Rust, distributed systems\n".to_string(),
        };
        let profile = extractor.extract(&file).await.unwrap();
        assert_eq!(profile["name"], "Ada Lovelace");

        let empty = UploadedFile {
            name: "cv.txt".to_string(),
            content: "   ".to_string(),
        };
        assert!(extractor.extract(&empty).await.is_err());
    }
}
