//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock）实现 LlmClient：complete（思考阶段，非流式）、
//! complete_stream（回复阶段，返回分块文本流）。错误统一为 LlmError，区分配额耗尽与其它后端故障。

use std::pin::Pin;

use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;

use crate::llm::Message;

/// 回复阶段的分块文本流
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>;

/// 后端调用错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LlmError {
    /// 当前周期内该模型的请求额度已用完（可通过轮换模型恢复）
    #[error("Quota exceeded for model {model}")]
    QuotaExceeded { model: String },

    #[error("Request timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("API error: {0}")]
    Api(String),
}

impl LlmError {
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, LlmError::QuotaExceeded { .. })
    }
}

/// 判断后端返回的错误码 / 类型 / 文本是否表示配额或限流
pub fn is_quota_signal(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("quota")
        || lower.contains("resource_exhausted")
        || lower.contains("rate_limit")
        || lower.contains("rate limit")
        || lower.contains("429")
}

/// LLM 客户端 trait：非流式完成与流式完成
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 流式完成，返回文本分块流；丢弃流即停止向后端请求后续分块
    async fn complete_stream(&self, messages: &[Message]) -> Result<ChunkStream, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}
