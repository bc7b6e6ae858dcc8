//! 后台阶段执行
//!
//! 四个异步阶段（搜索 / 生成 / 找邮箱 / 发送）都以分离任务方式运行：触发请求立即返回,
//! 进度靠调用方轮询持久状态。每个阶段无论成败都恰好写一次终态补丁——后台工作
//! 绝不能不更新持久状态就退出，否则用户会永远轮询一个不会到达的阶段。

use std::sync::Arc;

use serde_json::{json, Value};

use crate::agents::{AgentTask, CapabilityRegistry};
use crate::orchestrator::approval::{AccessKind, ApprovalGate, PlanPreview};
use crate::orchestrator::error::CoreError;
use crate::orchestrator::executor::TaskSpec;
use crate::pipeline::state::{PipelineState, PipelineStore};

/// 阶段执行器：被状态机 spawn，自带终态写保证
pub struct StageRunner {
    registry: Arc<CapabilityRegistry>,
    states: Arc<PipelineStore>,
    gate: Arc<ApprovalGate>,
}

impl StageRunner {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        states: Arc<PipelineStore>,
        gate: Arc<ApprovalGate>,
    ) -> Self {
        Self {
            registry,
            states,
            gate,
        }
    }

    /// 把阶段结果落成恰好一次的终态补丁；失败也回 READY 并带错误字段
    async fn finish(
        &self,
        user_id: &str,
        stage: &str,
        result: Result<(Value, String), CoreError>,
    ) {
        let (mut patch, narration) = match result {
            Ok(done) => done,
            Err(err) => {
                tracing::warn!(user_id, stage, error = %err, "background stage failed");
                (
                    json!({"stage": "ready", "error": err.to_string()}),
                    format!("The {} step hit a problem: {}. You can retry or 'reset'.", stage, err),
                )
            }
        };

        // 浅合并会整体替换 history 字段，所以先读当前轮次再带上叙述一起写回
        match self.states.load(user_id).await {
            Ok(mut state) => {
                state.push_history("assistant", &narration);
                patch["history"] = serde_json::to_value(&state.history).unwrap_or(json!([]));
            }
            Err(err) => {
                tracing::warn!(user_id, stage, error = %err, "history reload failed, patching without it");
            }
        }

        if let Err(err) = self.states.patch(user_id, patch).await {
            tracing::error!(user_id, stage, error = %err, "terminal state write failed");
        }
    }

    /// SEARCHING：搜职位，完成后回 READY 并带上结果
    pub async fn run_search(
        &self,
        user_id: &str,
        session_id: &str,
        role: String,
        location: String,
    ) {
        let result = async {
            let task = AgentTask::new("search_jobs", json!({"role": role, "location": location}));
            let outcome = self
                .registry
                .dispatch("job_search", user_id, &task, session_id)
                .await?;
            let jobs = outcome
                .data
                .get("jobs")
                .cloned()
                .unwrap_or_else(|| json!([]));
            let count = jobs.as_array().map(|a| a.len()).unwrap_or(0);
            let patch = json!({
                "stage": "ready",
                "jobs": jobs,
                "error": null,
            });
            let narration = format!(
                "Found {} matching jobs for '{}' in {}. Say 'generate' to tailor your CV.",
                count, role, location
            );
            Ok((patch, narration))
        }
        .await;
        self.finish(user_id, "search", result).await;
    }

    /// GENERATING：为找到的职位定制简历与求职信，完成后进 REVIEW_1
    pub async fn run_generate(&self, user_id: &str, session_id: &str, state: PipelineState) {
        let result = async {
            let profile = state
                .candidate_profile
                .clone()
                .ok_or_else(|| CoreError::Validation("no candidate profile on file".to_string()))?;

            let mut artifacts = Vec::new();
            for job in &state.jobs {
                for action in ["tailor_resume", "write_cover_letter"] {
                    let outcome = self
                        .registry
                        .dispatch(
                            "resume",
                            user_id,
                            &AgentTask::new(action, json!({"profile": profile, "job": job})),
                            session_id,
                        )
                        .await?;
                    artifacts.push(outcome.data);
                }
            }

            let narration = format!(
                "Generated {} tailored documents. Reply 'approve' to find recruiting contacts, or 'reject' to discard.",
                artifacts.len()
            );
            let patch = json!({
                "stage": "review1",
                "generated_artifacts": artifacts,
                "error": null,
            });
            Ok((patch, narration))
        }
        .await;
        self.finish(user_id, "generate", result).await;
    }

    /// FINDING：查联系人并挂起发送计划，完成后进 REVIEW_2
    pub async fn run_find_emails(&self, user_id: &str, session_id: &str, state: PipelineState) {
        let result = async {
            let task = AgentTask::new("find_contacts", json!({"jobs": state.jobs}));
            let outcome = self
                .registry
                .dispatch("application", user_id, &task, session_id)
                .await?;
            let results = outcome
                .data
                .get("results")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default();

            // 每个联系人一条发送任务；真正执行要等 REVIEW_2 的人工确认
            let mut specs = Vec::new();
            let mut contacts = Vec::new();
            for entry in &results {
                let company = entry.get("company").and_then(|v| v.as_str()).unwrap_or("");
                let body = best_artifact_for(&state.generated_artifacts, company);
                for contact in entry
                    .get("contacts")
                    .and_then(|v| v.as_array())
                    .into_iter()
                    .flatten()
                {
                    let Some(email) = contact.get("email").and_then(|v| v.as_str()) else {
                        continue;
                    };
                    contacts.push(contact.clone());
                    specs.push(TaskSpec {
                        local_id: specs.len() as u32 + 1,
                        agent: "application".to_string(),
                        action: "send_application".to_string(),
                        input: json!({
                            "to": email,
                            "subject": format!(
                                "Application: {}",
                                state.role.as_deref().unwrap_or("open position")
                            ),
                            "body": body,
                        }),
                        depends_on: vec![],
                    });
                }
            }
            if specs.is_empty() {
                return Err(CoreError::Validation(
                    "no contacts with email addresses found".to_string(),
                ));
            }

            let preview = self.gate.build_preview(&specs, |s| {
                format!(
                    "send application to {}",
                    s.input.get("to").and_then(|v| v.as_str()).unwrap_or("?")
                )
            });
            let plan_id = self
                .gate
                .pause(user_id, session_id, specs, json!({"origin": "pipeline"}))
                .await?;

            let narration = format!(
                "Found {} contacts. Sending is irreversible: reply 'approve' to send, 'reject' to cancel.\n{}",
                contacts.len(),
                render_preview(&preview)
            );
            let patch = json!({
                "stage": "review2",
                "contacts": contacts,
                "pending_approval_id": plan_id,
                "error": null,
            });
            Ok((patch, narration))
        }
        .await;
        self.finish(user_id, "find_emails", result).await;
    }

    /// SENDING：确认挂起计划（唯一真正外发的路径），完成后进 DONE
    pub async fn run_send(&self, user_id: &str, plan_id: String) {
        let result = async {
            let results = self.gate.confirm(user_id, &plan_id).await?;
            let sent = results.values().filter(|r| r.success).count();
            let failed = results.len() - sent;
            let narration = format!(
                "Done: {} application(s) sent, {} failed. Say 'reset' to start over.",
                sent, failed
            );
            let patch = json!({
                "stage": "done",
                "pending_approval_id": null,
                "error": null,
            });
            Ok((patch, narration))
        }
        .await;
        self.finish(user_id, "send", result).await;
    }
}

/// 给公司挑最匹配的生成稿；没有就取第一份，再没有就用占位正文
fn best_artifact_for(artifacts: &[Value], company: &str) -> String {
    artifacts
        .iter()
        .find(|a| {
            a.get("company").and_then(|v| v.as_str()) == Some(company)
                && a.get("artifact_type").and_then(|v| v.as_str()) == Some("cover_letter")
        })
        .or_else(|| artifacts.first())
        .and_then(|a| a.get("content").and_then(|v| v.as_str()))
        .unwrap_or("Please find my application attached.")
        .to_string()
}

pub(crate) fn render_preview(preview: &PlanPreview) -> String {
    preview
        .steps
        .iter()
        .enumerate()
        .map(|(i, step)| {
            let tag = match step.access {
                AccessKind::Read => "read",
                AccessKind::Write => "write",
            };
            format!("{}. [{}] {}", i + 1, tag, step.description)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{
        ApplicationAgent, CapabilityRegistry, JobSearchAgent, RecordingMailer,
        StaticContactDirectory, StaticJobBoard,
    };
    use crate::llm::{Candidate, FailoverChain, MockLlmClient};
    use crate::orchestrator::approval::Approvals;
    use crate::orchestrator::executor::TaskGraphExecutor;
    use crate::pipeline::state::Stage;
    use crate::store::create_store;

    fn runner() -> (StageRunner, Arc<PipelineStore>) {
        let store = create_store(None);
        let llm = Arc::new(FailoverChain::new(vec![Candidate {
            backend: "mock".to_string(),
            model: "mock".to_string(),
            client: Arc::new(MockLlmClient::always_reply("generated text")),
        }]));
        let mut registry = CapabilityRegistry::new();
        registry.register(JobSearchAgent::new(
            Arc::new(StaticJobBoard::with_samples()),
            llm,
        ));
        registry.register(ApplicationAgent::new(
            store.clone(),
            Arc::new(RecordingMailer::new()),
            Arc::new(StaticContactDirectory::empty()),
            Arc::new(Approvals::new(store.clone(), 3600)),
        ));
        let registry = Arc::new(registry);
        let executor = Arc::new(TaskGraphExecutor::new(registry.clone(), store.clone()));
        let gate = Arc::new(ApprovalGate::new(store.clone(), executor, 3600));
        let states = Arc::new(PipelineStore::new(store));
        (
            StageRunner::new(registry, states.clone(), gate),
            states,
        )
    }

    #[tokio::test]
    async fn search_stage_lands_back_in_ready_with_jobs() {
        let (runner, states) = runner();
        let mut state = PipelineState::default();
        state.stage = Stage::Searching;
        states.save("u1", &state).await.unwrap();

        runner
            .run_search("u1", "s1", "software engineer".to_string(), "karachi".to_string())
            .await;

        let state = states.load("u1").await.unwrap();
        assert_eq!(state.stage, Stage::Ready);
        assert_eq!(state.jobs.len(), 2);
        assert!(state.error.is_none());
        assert!(!state.history.is_empty());
    }

    #[tokio::test]
    async fn failed_stage_still_writes_terminal_state() {
        let (runner, states) = runner();
        let mut state = PipelineState::default();
        state.stage = Stage::Generating;
        // 没有画像，生成阶段注定失败
        states.save("u1", &state).await.unwrap();

        runner.run_generate("u1", "s1", state).await;

        let state = states.load("u1").await.unwrap();
        assert_eq!(state.stage, Stage::Ready);
        assert!(state.error.is_some());
    }
}
