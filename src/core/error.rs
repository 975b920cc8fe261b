//! 错误类型与恢复动作
//!
//! AgentError 为编排层对外暴露的错误；MemoryError 为记忆与持久化错误。
//! 与 RecoveryEngine 配合：根据 LlmError 决定 RotateModel / TryNextModelOnce / Abort。

use thiserror::Error;

use crate::llm::LlmError;
use crate::tools::ToolParseError;

/// 一次对话交换中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    /// 超时、网络、响应格式错误；轮换一次后仍失败即为终止错误
    #[error("Backend unavailable ({model}): {source}")]
    BackendUnavailable {
        model: String,
        #[source]
        source: LlmError,
    },

    #[error("Tool parse failure: {0}")]
    ToolParseFailure(#[from] ToolParseError),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecutionFailed { tool: String, message: String },

    /// 模型池中所有满足要求的候选均不可用
    #[error("No available model (tried: {})", tried.join(", "))]
    NoAvailableModel { tried: Vec<String> },

    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Model {name} exceeded its retry budget ({failures} quota failures)")]
    RetryBudgetExceeded { name: String, failures: u32 },

    #[error("Cancelled")]
    Cancelled,

    /// 交换任务 panic 或被中止
    #[error("Exchange task failed: {0}")]
    TaskFailed(String),

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),
}

/// 对话记忆与持久化错误
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Archive entry not found: {0}")]
    ArchiveNotFound(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage format error: {0}")]
    Format(#[from] serde_json::Error),

    /// 存储文件中记录的 user_id 与请求的不一致
    #[error("Stored data for {requested} belongs to {stored}")]
    OwnerMismatch { requested: String, stored: String },
}

/// 恢复引擎根据后端错误给出的建议动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 标记当前模型配额耗尽并轮换到下一个候选
    RotateModel,
    /// 后端故障：不标记，改用下一个候选重试一次
    TryNextModelOnce,
    /// 终止本次尝试
    Abort,
}
