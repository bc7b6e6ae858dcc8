//! 管线大脑：把自由文本变成下一步动作
//!
//! 先走不调 LLM 的关键词快速匹配；匹配不上才把紧凑上下文交给故障转移链做
//! 结构化决策。提供商全部耗尽时由状态机回退到静态命令菜单。

use std::sync::Arc;
use std::sync::OnceLock;

use regex::Regex;
use schemars::JsonSchema;
use serde::Deserialize;

use crate::llm::{FailoverChain, LlmError, Message};
use crate::pipeline::state::PipelineState;

/// 大脑可选动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BrainAction {
    Search,
    Generate,
    FindEmails,
    None,
}

/// 大脑决策：给用户的叙述 + 选定动作 + 动作参数
#[derive(Debug, Clone, Deserialize, JsonSchema)]
pub struct BrainDecision {
    /// 回复给用户的一句话
    pub message: String,
    pub action: BrainAction,
    /// search 动作的目标角色
    #[serde(default)]
    pub role: Option<String>,
    /// search 动作的目标地点
    #[serde(default)]
    pub location: Option<String>,
}

impl BrainDecision {
    fn chat(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            action: BrainAction::None,
            role: None,
            location: None,
        }
    }
}

static SEARCH_RE: OnceLock<Regex> = OnceLock::new();

/// 角色捕获里要剔除的填充词（"search for jobs" 不是一个叫 "for jobs" 的角色）
const ROLE_FILLERS: &[&str] = &[
    "job", "jobs", "a", "an", "the", "for", "some", "me", "position", "positions", "工作", "职位",
];

fn clean_role(raw: &str) -> Option<String> {
    let cleaned = raw
        .split_whitespace()
        .filter(|t| !ROLE_FILLERS.contains(t))
        .collect::<Vec<_>>()
        .join(" ");
    (!cleaned.is_empty()).then_some(cleaned)
}

/// 关键词快速匹配（纯函数，不调 LLM）：显式命令直接落动作
pub fn fast_match(input: &str) -> Option<BrainDecision> {
    let lower = input.trim().to_lowercase();
    if lower.is_empty() {
        return None;
    }

    if lower.starts_with("search")
        || lower.starts_with("find jobs")
        || lower.starts_with("搜索")
        || lower.starts_with("找工作")
    {
        // "search <role> in <location>" 直接把参数也带出来；剔除填充词后
        // 捕获为空则留给状态机去追问角色
        let re = SEARCH_RE.get_or_init(|| {
            Regex::new(r"^(?:search|find jobs|搜索|找工作)\s+(?P<role>.+?)(?:\s+in\s+(?P<loc>.+))?$")
                .unwrap()
        });
        let (role, location) = match re.captures(&lower) {
            Some(caps) => (
                caps.name("role").and_then(|m| clean_role(m.as_str())),
                caps.name("loc").map(|m| m.as_str().trim().to_string()),
            ),
            None => (None, None),
        };
        return Some(BrainDecision {
            message: String::new(),
            action: BrainAction::Search,
            role,
            location,
        });
    }
    if lower.starts_with("generate")
        || lower.starts_with("tailor")
        || lower.starts_with("write cv")
        || lower.starts_with("生成")
        || lower.starts_with("定制简历")
    {
        return Some(BrainDecision {
            message: String::new(),
            action: BrainAction::Generate,
            role: None,
            location: None,
        });
    }
    if lower.starts_with("find emails")
        || lower.starts_with("find contacts")
        || lower.starts_with("找邮箱")
        || lower.starts_with("找联系人")
    {
        return Some(BrainDecision {
            message: String::new(),
            action: BrainAction::FindEmails,
            role: None,
            location: None,
        });
    }
    None
}

const BRAIN_SYSTEM_PROMPT: &str = "You are the decision brain of a job-application assistant. \
Given the pipeline context and the user's message, pick exactly one action: \
'search' (look for job postings; needs role and location), \
'generate' (tailor CV / cover letter for found jobs), \
'find_emails' (look up recruiting contacts for generated applications), \
or 'none' (just reply conversationally). \
Extract role/location from the message when present. Keep 'message' to one or two sentences.";

/// 大脑：构造紧凑上下文并向故障转移链要一个结构化决策
pub struct Brain {
    llm: Arc<FailoverChain>,
}

impl Brain {
    pub fn new(llm: Arc<FailoverChain>) -> Self {
        Self { llm }
    }

    fn context_of(state: &PipelineState, message: &str) -> String {
        let mut lines = vec![
            format!("profile_on_file: {}", state.has_profile()),
            format!("jobs_found: {}", state.jobs.len()),
            format!("artifacts_generated: {}", state.generated_artifacts.len()),
            format!("contacts_found: {}", state.contacts.len()),
            format!("known_role: {}", state.role.as_deref().unwrap_or("-")),
            format!(
                "known_location: {}",
                state.location.as_deref().unwrap_or("-")
            ),
        ];
        if !state.history.is_empty() {
            lines.push("recent_turns:".to_string());
            for turn in &state.history {
                lines.push(format!("  {}: {}", turn.speaker, turn.content));
            }
        }
        lines.push(format!("new_message: {}", message));
        lines.join("\n")
    }

    pub async fn decide(
        &self,
        state: &PipelineState,
        message: &str,
    ) -> Result<BrainDecision, LlmError> {
        if let Some(decision) = fast_match(message) {
            tracing::debug!(action = ?decision.action, "brain fast-match hit, skipping llm");
            return Ok(decision);
        }

        let messages = [
            Message::system(BRAIN_SYSTEM_PROMPT),
            Message::user(Self::context_of(state, message)),
        ];
        match self.llm.complete_structured::<BrainDecision>(&messages).await {
            Ok(decision) => Ok(decision),
            Err(err @ LlmError::Exhausted { .. }) => Err(err),
            Err(LlmError::Parse(reason)) => {
                // 解析不出结构时退化为闲聊，不让一次坏输出毁掉整轮
                tracing::warn!(%reason, "brain output unparseable, degrading to chat");
                Ok(BrainDecision::chat(
                    "Sorry, I didn't quite get that. Could you rephrase?",
                ))
            }
            Err(other) => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Candidate, MockLlmClient};

    #[test]
    fn fast_match_is_pure_and_keyword_driven() {
        let hit = fast_match("search software engineer in karachi").unwrap();
        assert_eq!(hit.action, BrainAction::Search);
        assert_eq!(hit.role.as_deref(), Some("software engineer"));
        assert_eq!(hit.location.as_deref(), Some("karachi"));

        let bare = fast_match("search software engineer").unwrap();
        assert_eq!(bare.action, BrainAction::Search);
        assert_eq!(bare.role.as_deref(), Some("software engineer"));
        assert!(bare.location.is_none());

        assert_eq!(fast_match("  Generate my CV").unwrap().action, BrainAction::Generate);
        assert_eq!(fast_match("find emails please").unwrap().action, BrainAction::FindEmails);
        assert_eq!(fast_match("搜索 后端工程师").unwrap().action, BrainAction::Search);
        assert!(fast_match("hello there").is_none());
        assert!(fast_match("").is_none());
    }

    #[test]
    fn fast_match_strips_fillers_from_role() {
        // "jobs" 是填充词，不是角色
        let bare = fast_match("search jobs").unwrap();
        assert_eq!(bare.action, BrainAction::Search);
        assert!(bare.role.is_none());

        let filled = fast_match("search for data engineer jobs in lahore").unwrap();
        assert_eq!(filled.role.as_deref(), Some("data engineer"));
        assert_eq!(filled.location.as_deref(), Some("lahore"));
    }

    #[tokio::test]
    async fn decide_parses_structured_reply() {
        let chain = Arc::new(FailoverChain::new(vec![Candidate {
            backend: "mock".to_string(),
            model: "mock".to_string(),
            client: Arc::new(MockLlmClient::always_reply(
                r#"{"message": "Searching now.", "action": "search", "role": "SE", "location": "Karachi"}"#,
            )),
        }]));
        let brain = Brain::new(chain);
        let decision = brain
            .decide(&PipelineState::default(), "I want an SE job in Karachi")
            .await
            .unwrap();
        assert_eq!(decision.action, BrainAction::Search);
        assert_eq!(decision.role.as_deref(), Some("SE"));
    }

    #[tokio::test]
    async fn decide_skips_llm_on_fast_match() {
        let mock = Arc::new(MockLlmClient::always_fail(LlmError::Api("down".to_string())));
        let chain = Arc::new(FailoverChain::new(vec![Candidate {
            backend: "mock".to_string(),
            model: "mock".to_string(),
            client: mock.clone(),
        }]));
        let brain = Brain::new(chain);
        let decision = brain
            .decide(&PipelineState::default(), "search jobs")
            .await
            .unwrap();
        assert_eq!(decision.action, BrainAction::Search);
        assert_eq!(mock.call_count(), 0);
    }
}
