//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `JOBMATE__*` 覆盖（双下划线表示嵌套，
//! 如 `JOBMATE__LLM__FALLBACKS__0__MODEL=gpt-4o-mini`）。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub approval: ApprovalSection,
}

/// [app] 段：应用名与数据库路径
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// SQLite 文件路径，未设置时退回内存存储
    pub db_path: Option<PathBuf>,
}

/// [llm] 段：故障转移候选列表与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 按优先级排列的 (backend, model) 候选；游标记住上次成功的位置
    #[serde(default = "default_fallbacks")]
    pub fallbacks: Vec<FallbackEntry>,
    /// 单次候选请求的超时（秒）；超时按可转移错误处理，换下一候选
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            fallbacks: default_fallbacks(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// 一个故障转移候选
#[derive(Debug, Clone, Deserialize)]
pub struct FallbackEntry {
    /// 后端：deepseek / openai
    pub backend: String,
    pub model: String,
}

fn default_fallbacks() -> Vec<FallbackEntry> {
    vec![
        FallbackEntry {
            backend: "deepseek".to_string(),
            model: "deepseek-chat".to_string(),
        },
        FallbackEntry {
            backend: "deepseek".to_string(),
            model: "deepseek-reasoner".to_string(),
        },
    ]
}

fn default_request_timeout() -> u64 {
    60
}

/// [approval] 段：审批与挂起计划的存活时长
#[derive(Debug, Clone, Deserialize)]
pub struct ApprovalSection {
    /// 审批记录过期时间（秒），过期后应答视为校验错误
    #[serde(default = "default_approval_ttl")]
    pub ttl_secs: u64,
    /// 挂起计划的存储 TTL（秒），过期后确认报「计划缺失或已过期」
    #[serde(default = "default_plan_ttl")]
    pub plan_ttl_secs: u64,
}

impl Default for ApprovalSection {
    fn default() -> Self {
        Self {
            ttl_secs: default_approval_ttl(),
            plan_ttl_secs: default_plan_ttl(),
        }
    }
}

fn default_approval_ttl() -> u64 {
    3600
}

fn default_plan_ttl() -> u64 {
    3600
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app: AppSection::default(),
            llm: LlmSection::default(),
            approval: ApprovalSection::default(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 JOBMATE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 JOBMATE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("JOBMATE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置（配置热更新：调用方决定是否用新配置重建组件）
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_provide_a_usable_fallback_chain() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.llm.fallbacks.len(), 2);
        assert_eq!(cfg.llm.fallbacks[0].backend, "deepseek");
        assert_eq!(cfg.approval.ttl_secs, 3600);
        assert!(cfg.app.db_path.is_none());
    }
}
