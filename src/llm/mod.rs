//! LLM 层：客户端抽象、各后端实现与提供商故障转移链

pub mod deepseek;
pub mod failover;
pub mod mock;
pub mod openai;
pub mod traits;

pub use deepseek::{create_deepseek_client, DEEPSEEK_CHAT, DEEPSEEK_REASONER};
pub use failover::{extract_json, parse_structured, Candidate, FailoverChain};
pub use mock::MockLlmClient;
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{LlmClient, LlmError, Message, Role};
