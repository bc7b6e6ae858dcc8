//! 面试能力：备考问题与模拟面试

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use super::{AgentOutcome, AgentTask, Capability};
use crate::llm::{FailoverChain, Message};
use crate::orchestrator::error::CoreError;

pub struct InterviewAgent {
    llm: Arc<FailoverChain>,
}

impl InterviewAgent {
    pub fn new(llm: Arc<FailoverChain>) -> Self {
        Self { llm }
    }

    async fn prep_questions(&self, task: &AgentTask) -> Result<AgentOutcome, CoreError> {
        let role = task
            .params
            .get("role")
            .and_then(|v| v.as_str())
            .or_else(|| {
                task.params
                    .get("job")
                    .and_then(|j| j.get("title"))
                    .and_then(|v| v.as_str())
            })
            .ok_or_else(|| {
                CoreError::Validation("prep_questions requires 'role' or 'job.title'".to_string())
            })?;

        let prompt = format!(
            "List 8 likely interview questions for a '{}' position, mixing technical and behavioral. One per line.",
            role
        );
        let questions = self.llm.complete(&[Message::user(prompt)]).await?;
        Ok(AgentOutcome::data(json!({
            "role": role,
            "questions": questions,
        })))
    }

    async fn mock_interview(&self, task: &AgentTask) -> Result<AgentOutcome, CoreError> {
        let question = task
            .params
            .get("question")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                CoreError::Validation("mock_interview requires 'question'".to_string())
            })?;
        let answer = task
            .params
            .get("answer")
            .and_then(|v| v.as_str())
            .unwrap_or("");

        let prompt = if answer.is_empty() {
            format!(
                "You are a mock interviewer. Ask this question and explain what a strong answer covers: {}",
                question
            )
        } else {
            format!(
                "You are a mock interviewer. Question: {}\nCandidate's answer: {}\nGive concrete feedback and a stronger sample answer.",
                question, answer
            )
        };
        let feedback = self.llm.complete(&[Message::user(prompt)]).await?;
        Ok(AgentOutcome::data(json!({
            "question": question,
            "feedback": feedback,
        })))
    }
}

#[async_trait]
impl Capability for InterviewAgent {
    fn name(&self) -> &'static str {
        "interview"
    }

    fn keywords(&self) -> &'static [&'static str] {
        &["interview", "prep", "question", "mock"]
    }

    fn actions(&self) -> &'static [&'static str] {
        &["prep_questions", "mock_interview"]
    }

    fn describe_action(&self, action: &str) -> String {
        match action {
            "prep_questions" => "prepare likely interview questions".to_string(),
            "mock_interview" => "run a mock interview round with feedback".to_string(),
            other => format!("interview: {}", other),
        }
    }

    async fn execute(
        &self,
        _user_id: &str,
        task: &AgentTask,
        _session_id: &str,
    ) -> Result<AgentOutcome, CoreError> {
        match task.action.as_str() {
            "prep_questions" => self.prep_questions(task).await,
            "mock_interview" => self.mock_interview(task).await,
            other => Err(CoreError::Validation(format!(
                "unknown interview action: {}",
                other
            ))),
        }
    }
}
