//! 错误恢复引擎
//!
//! 根据 LlmError 类型返回 RecoveryAction，供推理编排器决定是轮换模型、换模型重试一次还是终止。

use crate::core::RecoveryAction;
use crate::llm::LlmError;

/// 语义化错误恢复：将后端错误映射为可执行动作
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// backend_retry_used：本次逻辑调用是否已经因后端故障换过一次模型
    pub fn handle(&self, err: &LlmError, backend_retry_used: bool) -> RecoveryAction {
        match err {
            LlmError::QuotaExceeded { .. } => RecoveryAction::RotateModel,
            LlmError::Timeout { .. }
            | LlmError::Network(_)
            | LlmError::MalformedResponse(_)
            | LlmError::Api(_) => {
                if backend_retry_used {
                    RecoveryAction::Abort
                } else {
                    RecoveryAction::TryNextModelOnce
                }
            }
        }
    }
}
