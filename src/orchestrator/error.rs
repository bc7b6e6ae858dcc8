//! 核心错误类型
//!
//! 传播策略：执行器内部的业务失败（依赖不满足、处理器出错）逐任务记录、互不传染；
//! 只有编程类错误（未注册的规范智能体名）才向上抛出。

use thiserror::Error;

use crate::llm::LlmError;
use crate::store::StoreError;

/// 核心错误分类
#[derive(Error, Debug)]
pub enum CoreError {
    /// 参数缺失 / 非法，直接面向用户，不重试
    #[error("validation error: {0}")]
    Validation(String),

    /// 任务图策略：依赖未满足，任务取消，同级不受影响
    #[error("dependencies not met: {0}")]
    DependencyUnmet(String),

    /// 能力处理器失败，记录在任务上，独立任务继续执行
    #[error("handler error: {0}")]
    Handler(String),

    /// 审批 / 计划 / 会话缺失，面向用户的 404 类错误
    #[error("not found: {0}")]
    NotFound(String),

    /// 未注册的规范智能体名（编程类错误，向上传播）
    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    /// LLM 层错误（含 Exhausted）
    #[error("llm error: {0}")]
    Llm(#[from] LlmError),

    /// 存储层错误
    #[error("store error: {0}")]
    Store(String),
}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        CoreError::Store(e.to_string())
    }
}

impl CoreError {
    /// 是否为所有提供商耗尽（上层转成"稍后再试"的人类可读提示）
    pub fn is_provider_exhausted(&self) -> bool {
        matches!(self, CoreError::Llm(LlmError::Exhausted { .. }))
    }
}
