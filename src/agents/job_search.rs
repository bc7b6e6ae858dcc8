//! 职位搜索能力
//!
//! 职位板抓取属于外部协作者：这里只消费 JobBoard 边界 trait。
//! rank_jobs 用故障转移链按候选人角色重排职位。

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{AgentOutcome, AgentTask, Capability};
use crate::llm::{FailoverChain, Message};
use crate::orchestrator::error::CoreError;

/// 一条职位
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobPosting {
    pub id: String,
    pub title: String,
    pub company: String,
    pub location: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// 职位板边界：外部实现（API / 抓取），核心不关心细节
#[async_trait]
pub trait JobBoard: Send + Sync {
    async fn search(&self, role: &str, location: &str) -> Result<Vec<JobPosting>, CoreError>;
}

/// 静态职位板（演示 / 测试）：按角色与地点子串过滤内置职位
pub struct StaticJobBoard {
    postings: Vec<JobPosting>,
}

impl StaticJobBoard {
    pub fn new(postings: Vec<JobPosting>) -> Self {
        Self { postings }
    }

    pub fn with_samples() -> Self {
        let sample = |id: &str, title: &str, company: &str, location: &str| JobPosting {
            id: id.to_string(),
            title: title.to_string(),
            company: company.to_string(),
            location: location.to_string(),
            url: None,
            description: None,
        };
        Self::new(vec![
            sample("j1", "Software Engineer", "Acme", "Karachi"),
            sample("j2", "Senior Software Engineer", "Globex", "Karachi"),
            sample("j3", "Data Engineer", "Initech", "Lahore"),
        ])
    }
}

#[async_trait]
impl JobBoard for StaticJobBoard {
    async fn search(&self, role: &str, location: &str) -> Result<Vec<JobPosting>, CoreError> {
        let role = role.to_lowercase();
        let location = location.to_lowercase();
        Ok(self
            .postings
            .iter()
            .filter(|p| {
                p.title.to_lowercase().contains(&role)
                    && (location.is_empty() || p.location.to_lowercase().contains(&location))
            })
            .cloned()
            .collect())
    }
}

/// rank_jobs 的 LLM 结构化输出
#[derive(Debug, Deserialize, JsonSchema)]
struct RankedIds {
    /// 按匹配度从高到低排列的职位 id
    ordered_ids: Vec<String>,
}

/// 职位搜索能力
pub struct JobSearchAgent {
    board: Arc<dyn JobBoard>,
    llm: Arc<FailoverChain>,
}

impl JobSearchAgent {
    pub fn new(board: Arc<dyn JobBoard>, llm: Arc<FailoverChain>) -> Self {
        Self { board, llm }
    }

    async fn search_jobs(&self, task: &AgentTask) -> Result<AgentOutcome, CoreError> {
        let role = task
            .params
            .get("role")
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| CoreError::Validation("search_jobs requires 'role'".to_string()))?;
        let location = task
            .params
            .get("location")
            .and_then(|v| v.as_str())
            .unwrap_or("");

        let jobs = self.board.search(role, location).await?;
        tracing::info!(role, location, count = jobs.len(), "job search finished");
        Ok(AgentOutcome::data(json!({
            "jobs": jobs,
            "count": jobs.len(),
        })))
    }

    async fn rank_jobs(&self, task: &AgentTask) -> Result<AgentOutcome, CoreError> {
        let jobs: Vec<JobPosting> = serde_json::from_value(
            task.params.get("jobs").cloned().unwrap_or(json!([])),
        )
        .map_err(|e| CoreError::Validation(format!("rank_jobs 'jobs' malformed: {}", e)))?;
        if jobs.is_empty() {
            return Err(CoreError::Validation(
                "rank_jobs requires a non-empty 'jobs' list".to_string(),
            ));
        }
        let role = task
            .params
            .get("role")
            .and_then(|v| v.as_str())
            .unwrap_or("the candidate's role");

        let prompt = format!(
            "Rank these job postings by fit for the role '{}'. Postings:\n{}",
            role,
            serde_json::to_string_pretty(&jobs).unwrap_or_default()
        );
        let ranked: RankedIds = self
            .llm
            .complete_structured(&[Message::user(prompt)])
            .await?;

        // 按 LLM 给出的顺序重排；它漏掉的职位保持原顺序缀在末尾
        let mut ordered: Vec<JobPosting> = Vec::with_capacity(jobs.len());
        for id in &ranked.ordered_ids {
            if let Some(job) = jobs.iter().find(|j| &j.id == id) {
                ordered.push(job.clone());
            }
        }
        for job in &jobs {
            if !ordered.iter().any(|j| j.id == job.id) {
                ordered.push(job.clone());
            }
        }

        Ok(AgentOutcome::data(json!({ "jobs": ordered })))
    }
}

#[async_trait]
impl Capability for JobSearchAgent {
    fn name(&self) -> &'static str {
        "job_search"
    }

    fn keywords(&self) -> &'static [&'static str] {
        &["job", "search", "find", "vacancy", "posting"]
    }

    fn actions(&self) -> &'static [&'static str] {
        &["search_jobs", "rank_jobs"]
    }

    fn describe_action(&self, action: &str) -> String {
        match action {
            "search_jobs" => "search job boards for matching postings".to_string(),
            "rank_jobs" => "rank found postings by fit".to_string(),
            other => format!("job_search: {}", other),
        }
    }

    async fn execute(
        &self,
        _user_id: &str,
        task: &AgentTask,
        _session_id: &str,
    ) -> Result<AgentOutcome, CoreError> {
        match task.action.as_str() {
            "search_jobs" => self.search_jobs(task).await,
            "rank_jobs" => self.rank_jobs(task).await,
            other => Err(CoreError::Validation(format!(
                "unknown job_search action: {}",
                other
            ))),
        }
    }
}
