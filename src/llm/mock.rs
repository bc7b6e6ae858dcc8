//! Mock LLM 客户端（用于测试，无需 API）
//!
//! 支持脚本化回复 / 脚本化失败：按顺序弹出预置结果，脚本耗尽后回显最后一条 User 消息，
//! 便于确定性地测试故障转移链与管线大脑。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm::{LlmClient, LlmError, Message, Role};

/// Mock 客户端：按脚本返回，或固定失败，或回显
#[derive(Debug, Default)]
pub struct MockLlmClient {
    script: Mutex<VecDeque<Result<String, LlmError>>>,
    /// 设置后每次调用都返回该错误（模拟一直不可用的后端）
    repeat_error: Option<LlmError>,
    /// 设置后脚本耗尽时固定返回该文本（而非回显）
    repeat_reply: Option<String>,
    calls: AtomicUsize,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// 按顺序返回给定结果，耗尽后回显
    pub fn scripted(items: Vec<Result<String, LlmError>>) -> Self {
        Self {
            script: Mutex::new(items.into()),
            ..Self::default()
        }
    }

    /// 每次调用都返回同一错误
    pub fn always_fail(err: LlmError) -> Self {
        Self {
            repeat_error: Some(err),
            ..Self::default()
        }
    }

    /// 固定回复同一文本
    pub fn always_reply(text: impl Into<String>) -> Self {
        Self {
            repeat_reply: Some(text.into()),
            ..Self::default()
        }
    }

    /// 已收到的调用次数
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if let Some(err) = &self.repeat_error {
            return Err(err.clone());
        }

        if let Some(next) = self.script.lock().unwrap().pop_front() {
            return next;
        }

        if let Some(text) = &self.repeat_reply {
            return Ok(text.clone());
        }

        let last_user = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        Ok(format!("Echo from Mock: {}", last_user))
    }
}
