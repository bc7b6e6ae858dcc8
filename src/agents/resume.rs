//! 简历能力：简历定制与求职信生成
//!
//! 纯生成类动作，读写候选人资料但不触发外发，不需要审批。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{AgentOutcome, AgentTask, Capability};
use crate::llm::{FailoverChain, Message};
use crate::orchestrator::error::CoreError;

pub struct ResumeAgent {
    llm: Arc<FailoverChain>,
}

impl ResumeAgent {
    pub fn new(llm: Arc<FailoverChain>) -> Self {
        Self { llm }
    }

    fn job_field(job: &Value, field: &str) -> String {
        job.get(field)
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string()
    }

    async fn generate(
        &self,
        task: &AgentTask,
        artifact_type: &str,
        instruction: &str,
    ) -> Result<AgentOutcome, CoreError> {
        let profile = task
            .params
            .get("profile")
            .cloned()
            .ok_or_else(|| CoreError::Validation(format!("{} requires 'profile'", task.action)))?;
        let job = task
            .params
            .get("job")
            .cloned()
            .ok_or_else(|| CoreError::Validation(format!("{} requires 'job'", task.action)))?;

        let prompt = format!(
            "{}\n\nCandidate profile:\n{}\n\nTarget job:\n{}",
            instruction,
            serde_json::to_string_pretty(&profile).unwrap_or_default(),
            serde_json::to_string_pretty(&job).unwrap_or_default()
        );
        let content = self.llm.complete(&[Message::user(prompt)]).await?;

        let company = Self::job_field(&job, "company");
        let title = Self::job_field(&job, "title");
        tracing::info!(artifact_type, company = %company, title = %title, "artifact generated");

        Ok(AgentOutcome::data(json!({
            "artifact_type": artifact_type,
            "company": company,
            "title": title,
            "job_id": job.get("id").cloned().unwrap_or(Value::Null),
            "content": content,
        })))
    }
}

#[async_trait]
impl Capability for ResumeAgent {
    fn name(&self) -> &'static str {
        "resume"
    }

    fn keywords(&self) -> &'static [&'static str] {
        &["resume", "cv", "cover", "letter", "tailor"]
    }

    fn actions(&self) -> &'static [&'static str] {
        &["tailor_resume", "write_cover_letter"]
    }

    fn describe_action(&self, action: &str) -> String {
        match action {
            "tailor_resume" => "tailor the candidate's CV to a specific job".to_string(),
            "write_cover_letter" => "draft a cover letter for a specific job".to_string(),
            other => format!("resume: {}", other),
        }
    }

    async fn execute(
        &self,
        _user_id: &str,
        task: &AgentTask,
        _session_id: &str,
    ) -> Result<AgentOutcome, CoreError> {
        match task.action.as_str() {
            "tailor_resume" => {
                self.generate(
                    task,
                    "cv",
                    "Rewrite the candidate's CV so it highlights the experience most relevant to the target job. Keep it truthful and concise.",
                )
                .await
            }
            "write_cover_letter" => {
                self.generate(
                    task,
                    "cover_letter",
                    "Write a short, specific cover letter for the target job based on the candidate's profile. No generic filler.",
                )
                .await
            }
            other => Err(CoreError::Validation(format!(
                "unknown resume action: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Candidate, LlmClient, MockLlmClient};

    fn chain(client: impl LlmClient + 'static) -> Arc<FailoverChain> {
        Arc::new(FailoverChain::new(vec![Candidate {
            backend: "mock".to_string(),
            model: "mock".to_string(),
            client: Arc::new(client),
        }]))
    }

    #[tokio::test]
    async fn tailor_resume_returns_artifact_with_job_fields() {
        let agent = ResumeAgent::new(chain(MockLlmClient::always_reply("tailored cv text")));
        let task = AgentTask::new(
            "tailor_resume",
            json!({
                "profile": {"name": "Ada", "skills": ["rust"]},
                "job": {"id": "j1", "title": "Software Engineer", "company": "Acme"},
            }),
        );
        let outcome = agent.execute("u1", &task, "s1").await.unwrap();
        assert_eq!(outcome.data["artifact_type"], "cv");
        assert_eq!(outcome.data["company"], "Acme");
        assert_eq!(outcome.data["content"], "tailored cv text");
    }

    #[tokio::test]
    async fn missing_profile_is_a_validation_error() {
        let agent = ResumeAgent::new(chain(MockLlmClient::new()));
        let task = AgentTask::new("write_cover_letter", json!({"job": {"title": "SE"}}));
        let err = agent.execute("u1", &task, "s1").await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }
}
