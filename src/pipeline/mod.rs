//! 管线层：长周期可恢复的求职工作流
//!
//! 上传 → 角色采集 → 搜索 → 定制 → 评审 → 找邮箱 → 评审 → 发送，
//! 全程由自由文本驱动，状态持久化在文档存储里，靠轮询观察后台进度。

pub mod brain;
pub mod machine;
pub mod stages;
pub mod state;

pub use brain::{fast_match, Brain, BrainAction, BrainDecision};
pub use machine::{
    ChatReply, PipelineMachine, PlainTextProfileExtractor, ProfileExtractor, UploadedFile,
};
pub use stages::StageRunner;
pub use state::{HistoryTurn, PipelineState, PipelineStore, Stage, MAX_HISTORY_TURNS};
