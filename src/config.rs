//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `CONFIDANT__*` 覆盖（双下划线表示嵌套，如 `CONFIDANT__MEMORY__MAX_ACTIVE=30`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::memory::MemoryLimits;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub tools: ToolsSection,
    pub memory: MemorySection,
    pub prompts: PromptsSection,
}

/// [app] 段：应用名、数据目录、默认用户
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 对话记忆与用户档案的根目录
    pub data_dir: PathBuf,
    /// REPL 启动时的用户 id
    pub default_user: String,
    /// 单次交换事件通道容量
    pub event_buffer: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            data_dir: PathBuf::from("data"),
            default_user: "guest".to_string(),
            event_buffer: 64,
        }
    }
}

/// [llm] 段：按偏好顺序排列的模型池、手动切换重试预算、超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 为空时按 API Key 自动组装（DeepSeek / OpenAI），都没有则使用 Mock
    pub models: Vec<ModelEntry>,
    /// 手动切换时允许的配额失败次数上限
    pub switch_retry_budget: u32,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            models: Vec::new(),
            switch_retry_budget: default_switch_retry_budget(),
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

fn default_switch_retry_budget() -> u32 {
    3
}

/// [[llm.models]] 项
#[derive(Debug, Clone, Deserialize)]
pub struct ModelEntry {
    /// 池内唯一名称（切换命令使用）
    pub name: String,
    /// deepseek / openai / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    /// 实际请求的模型 id，缺省同 name
    pub model: Option<String>,
    pub base_url: Option<String>,
    /// 读取 API Key 的环境变量名，缺省按 provider 取 DEEPSEEK_API_KEY / OPENAI_API_KEY
    pub api_key_env: Option<String>,
    pub daily_quota: Option<u32>,
    #[serde(default = "default_true")]
    pub supports_tools: bool,
    #[serde(default)]
    pub supports_vision: bool,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_true() -> bool {
    true
}

/// [llm.timeouts] 段（秒）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// THINKING 阶段整次调用
    pub request: u64,
    /// RESPONDING 阶段建立流
    pub stream: u64,
    /// 流中两个分片之间的最长间隔
    pub chunk_idle: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self {
            request: 60,
            stream: 120,
            chunk_idle: 30,
        }
    }
}

/// [tools] 段：内置工具开关、文件系统根、超时、并行
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub enabled: bool,
    /// 沙箱根目录，未设置时用 ./workspace
    pub filesystem_root: Option<PathBuf>,
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    pub parallel: bool,
    pub max_parallel: usize,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            enabled: true,
            filesystem_root: None,
            tool_timeout_secs: 30,
            parallel: false,
            max_parallel: 4,
        }
    }
}

/// [memory] 段：活跃历史与归档阈值
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    pub max_active: usize,
    pub keep_recent: usize,
    pub max_archives: usize,
    /// prompt 中附带的最近归档摘要条数
    pub archive_digest_count: usize,
    /// prompt 中附带的最近对话条数
    pub context_recent: usize,
    /// 每条归档提取的主题数
    pub max_topics: usize,
    /// false 时只保存在内存中
    pub persist: bool,
}

impl Default for MemorySection {
    fn default() -> Self {
        let limits = MemoryLimits::default();
        Self {
            max_active: limits.max_active,
            keep_recent: limits.keep_recent,
            max_archives: limits.max_archives,
            archive_digest_count: limits.archive_digest_count,
            context_recent: 10,
            max_topics: 5,
            persist: true,
        }
    }
}

impl MemorySection {
    pub fn limits(&self) -> MemoryLimits {
        MemoryLimits {
            max_active: self.max_active,
            keep_recent: self.keep_recent,
            max_archives: self.max_archives,
            archive_digest_count: self.archive_digest_count,
        }
        .normalized()
    }
}

/// [prompts] 段：提示词模板目录（thinking.txt / responding.txt），缺失时用内置模板
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PromptsSection {
    pub dir: PathBuf,
}

impl Default for PromptsSection {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("config/prompts"),
        }
    }
}

/// 从 config 目录加载配置，环境变量 CONFIDANT__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 CONFIDANT__*（双下划线表示嵌套键）
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
        } else {
            tracing::warn!(path = %path.display(), "config file not found, ignoring");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("CONFIDANT")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
