//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock）实现 LlmClient：complete 返回完整回复。
//! 错误按「是否可转移」分类（限流 / 容量 / 模型下线），供故障转移链决定是否换下一候选。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 消息角色（与 LLM API 一致）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    User,
    Assistant,
    System,
}

/// 单条消息
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// LLM 调用错误
///
/// RateLimited / Overloaded / ModelUnavailable / Timeout 为可转移错误：故障转移链换下一候选；
/// 其余错误（鉴权、参数等编程类问题）必须原样上抛，不得掩盖为可转移。
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    /// 限流（HTTP 429 等）
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// 后端容量不足 / 过载
    #[error("provider overloaded: {0}")]
    Overloaded(String),

    /// 模型已下线或端点不支持
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// 单次请求超时（卡死或过慢的后端，换下一候选）
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// 其它 API 错误（不可转移）
    #[error("api error: {0}")]
    Api(String),

    /// 结构化输出解析失败（回复中找不到有效 JSON）
    #[error("structured output parse error: {0}")]
    Parse(String),

    /// 所有候选均已尝试并失败
    #[error("all providers exhausted after {attempts} attempts, last error: {last}")]
    Exhausted { attempts: usize, last: String },
}

impl LlmError {
    /// 是否可转移到下一个候选（后端 + 模型）
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited(_)
                | LlmError::Overloaded(_)
                | LlmError::ModelUnavailable(_)
                | LlmError::Timeout(_)
        )
    }
}

/// LLM 客户端 trait：非流式完成
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
