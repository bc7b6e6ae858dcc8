//! Jobmate - Rust 求职智能体系统
//!
//! 模块划分：
//! - **agents**: 能力层（职位搜索、简历定制、申请外发、面试准备）与注册表
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **llm**: LLM 客户端抽象、后端实现与提供商故障转移链
//! - **orchestrator**: 任务图执行器、审批门、规划器与编排入口
//! - **pipeline**: 对话驱动的求职管线状态机（上传 → 搜索 → 定制 → 评审 → 发送）
//! - **store**: 按 (user, namespace, key) 索引的文档存储（SQLite / 内存）

pub mod agents;
pub mod config;
pub mod llm;
pub mod observability;
pub mod orchestrator;
pub mod pipeline;
pub mod store;

pub use config::{load_config, reload_config, AppConfig};
