//! 工具执行器
//!
//! 持有 ToolRegistry（允许列表）与超时，execute(&ToolCall) 在独立任务中运行工具：
//! 超时、返回 Err、panic、未知工具都转为 failed 的 ToolResult，不会中断推理周期；
//! 每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::core::AgentError;
use crate::tools::grammar::ToolCall;
use crate::tools::ToolRegistry;

/// 一次工具调用的结果
#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    pub call: ToolCall,
    pub output_text: String,
    pub failed: bool,
    pub error_message: Option<String>,
}

impl ToolResult {
    fn ok(call: &ToolCall, output: String) -> Self {
        Self {
            call: call.clone(),
            output_text: output,
            failed: false,
            error_message: None,
        }
    }

    fn failed(call: &ToolCall, error: String) -> Self {
        Self {
            call: call.clone(),
            output_text: String::new(),
            failed: true,
            error_message: Some(error),
        }
    }

    pub fn tool_name(&self) -> &str {
        &self.call.function_name
    }

    /// 失败结果对应的 AgentError::ToolExecutionFailed
    pub fn as_error(&self) -> Option<AgentError> {
        self.failed.then(|| AgentError::ToolExecutionFailed {
            tool: self.call.function_name.clone(),
            message: self.error_message.clone().unwrap_or_default(),
        })
    }

    /// 折入回复 prompt 的一行
    pub fn prompt_line(&self) -> String {
        if self.failed {
            format!(
                "Tool {} failed: {}",
                self.call.function_name,
                self.error_message.as_deref().unwrap_or("unknown error")
            )
        } else {
            format!("Tool {} returned: {}", self.call.function_name, self.output_text)
        }
    }
}

/// 工具执行器：对每次调用施加超时，可选并行（信号量限流，结果保持源顺序）
pub struct ToolExecutor {
    registry: ToolRegistry,
    timeout: Duration,
    parallelism: Option<Arc<Semaphore>>,
}

impl ToolExecutor {
    pub fn new(registry: ToolRegistry, timeout_secs: u64) -> Self {
        Self {
            registry,
            timeout: Duration::from_secs(timeout_secs.max(1)),
            parallelism: None,
        }
    }

    /// 启用并行执行，最多 max 个工具同时运行
    pub fn with_parallelism(mut self, max: usize) -> Self {
        self.parallelism = Some(Arc::new(Semaphore::new(max.max(1))));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn has_tools(&self) -> bool {
        !self.registry.is_empty()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.registry.tool_names()
    }

    pub fn prompt_section(&self) -> String {
        self.registry.prompt_section()
    }

    /// 执行单个调用；任何失败都体现在返回的 ToolResult 中
    pub async fn execute(&self, call: &ToolCall) -> ToolResult {
        let start = Instant::now();
        let (result, outcome) = match self.registry.get(&call.function_name) {
            None => {
                let err = format!(
                    "Unknown tool: {} (allowed: {})",
                    call.function_name,
                    self.registry.tool_names().join(", ")
                );
                (ToolResult::failed(call, err), "rejected")
            }
            Some(tool) => {
                let args = call.arguments.clone();
                let mut handle = tokio::spawn(async move { tool.execute(&args).await });
                match timeout(self.timeout, &mut handle).await {
                    Ok(Ok(Ok(output))) => (ToolResult::ok(call, output), "ok"),
                    Ok(Ok(Err(e))) => (ToolResult::failed(call, e), "error"),
                    Ok(Err(join_err)) => {
                        let msg = if join_err.is_panic() {
                            "tool panicked".to_string()
                        } else {
                            format!("tool task aborted: {}", join_err)
                        };
                        (ToolResult::failed(call, msg), "panic")
                    }
                    Err(_) => {
                        handle.abort();
                        let msg = format!("timed out after {}s", self.timeout.as_secs_f64());
                        (ToolResult::failed(call, msg), "timeout")
                    }
                }
            }
        };

        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": call.function_name,
            "ok": !result.failed,
            "outcome": outcome,
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview(call),
        });
        tracing::info!(audit = %audit.to_string(), "tool");
        result
    }

    /// 执行全部调用，结果与输入顺序一致
    pub async fn execute_all(&self, calls: &[ToolCall]) -> Vec<ToolResult> {
        match &self.parallelism {
            None => {
                let mut results = Vec::with_capacity(calls.len());
                for call in calls {
                    results.push(self.execute(call).await);
                }
                results
            }
            Some(semaphore) => {
                let futures = calls.iter().map(|call| {
                    let semaphore = Arc::clone(semaphore);
                    async move {
                        let _permit = semaphore.acquire_owned().await.ok();
                        self.execute(call).await
                    }
                });
                join_all(futures).await
            }
        }
    }
}

fn args_preview(call: &ToolCall) -> String {
    let s = call.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
