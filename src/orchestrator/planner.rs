//! 生成式任务规划
//!
//! 把用户的自由文本请求交给 LLM，产出带依赖引用的有序任务规格列表。
//! 规划器可能编造近似的智能体名 / 动作名，这里不做归一（注册表在执行前统一处理）；
//! 空计划或无法解析的计划退化为一条 coordinator/noop。

use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::llm::{FailoverChain, Message};
use crate::orchestrator::error::CoreError;
use crate::orchestrator::executor::TaskSpec;

/// LLM 输出的单条计划任务
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PlannedTask {
    /// 计划内本地 id，依赖用它引用
    pub id: u32,
    pub agent: String,
    pub action: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub depends_on: Vec<u32>,
}

/// LLM 输出的完整计划
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PlannedTasks {
    pub tasks: Vec<PlannedTask>,
    /// 给用户的一句话计划说明
    #[serde(default)]
    pub summary: Option<String>,
}

/// 规划器：持有故障转移链与能力目录文本
pub struct Planner {
    llm: Arc<FailoverChain>,
    catalog: String,
}

impl Planner {
    /// catalog 为「智能体名: 动作列表」的目录文本，嵌入 system prompt
    pub fn new(llm: Arc<FailoverChain>, catalog: String) -> Self {
        Self { llm, catalog }
    }

    /// 规划：返回 (任务规格, 计划说明)
    pub async fn plan(
        &self,
        message: &str,
        profile_present: bool,
    ) -> Result<(Vec<TaskSpec>, Option<String>), CoreError> {
        let system = format!(
            "You are a task planner for a job application assistant. \
             Break the user's request into an ordered list of tasks. \
             List dependencies before dependents. Available agents and actions:\n{}\n\
             The user {} a candidate profile on file. \
             Use only the listed agents and actions.",
            self.catalog,
            if profile_present { "has" } else { "does NOT have" },
        );

        let planned: PlannedTasks = self
            .llm
            .complete_structured(&[Message::system(system), Message::user(message.to_string())])
            .await?;

        let mut specs: Vec<TaskSpec> = planned
            .tasks
            .into_iter()
            .map(|t| TaskSpec {
                local_id: t.id,
                agent: t.agent,
                action: t.action,
                input: t.input,
                depends_on: t.depends_on,
            })
            .collect();

        if specs.is_empty() {
            specs.push(TaskSpec {
                local_id: 1,
                agent: crate::agents::COORDINATOR.to_string(),
                action: "noop".to_string(),
                input: Value::Object(Default::default()),
                depends_on: vec![],
            });
        }

        Ok((specs, planned.summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Candidate, MockLlmClient};

    fn planner_with_reply(reply: &str) -> Planner {
        let chain = FailoverChain::new(vec![Candidate::new(
            "mock",
            "m",
            Arc::new(MockLlmClient::always_reply(reply)),
        )]);
        Planner::new(Arc::new(chain), "job_search: search_jobs".to_string())
    }

    #[tokio::test]
    async fn plan_parses_wrapped_json() {
        let planner = planner_with_reply(
            "Plan:\n```json\n{\"tasks\": [{\"id\": 1, \"agent\": \"job_search\", \
             \"action\": \"search_jobs\", \"input\": {\"role\": \"SE\"}}], \
             \"summary\": \"search first\"}\n```",
        );
        let (specs, summary) = planner.plan("find me jobs", true).await.unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].agent, "job_search");
        assert_eq!(summary.as_deref(), Some("search first"));
    }

    #[tokio::test]
    async fn empty_plan_degrades_to_noop() {
        let planner = planner_with_reply("{\"tasks\": []}");
        let (specs, _) = planner.plan("hello", false).await.unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].agent, "coordinator");
        assert_eq!(specs[0].action, "noop");
    }
}
