//! 诊断工具：echo 与 system_status

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::llm::ModelPool;
use crate::tools::grammar::Literal;
use crate::tools::Tool;

/// Echo 工具：回显参数
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo text back (diagnostics)"
    }

    fn signature(&self) -> String {
        "echo(text)".to_string()
    }

    async fn execute(&self, args: &[Literal]) -> Result<String, String> {
        if args.is_empty() {
            return Ok("(empty)".to_string());
        }
        Ok(args
            .iter()
            .map(Literal::to_plain)
            .collect::<Vec<_>>()
            .join(" "))
    }
}

/// 模型池状态与运行时长
pub struct SystemStatusTool {
    pool: Arc<ModelPool>,
    started: Instant,
}

impl SystemStatusTool {
    pub fn new(pool: Arc<ModelPool>) -> Self {
        Self {
            pool,
            started: Instant::now(),
        }
    }
}

#[async_trait]
impl Tool for SystemStatusTool {
    fn name(&self) -> &str {
        "system_status"
    }

    fn description(&self) -> &str {
        "Report which models are available and how long the service has been up"
    }

    async fn execute(&self, args: &[Literal]) -> Result<String, String> {
        if !args.is_empty() {
            return Err("system_status takes no arguments".to_string());
        }
        let uptime = self.started.elapsed().as_secs();
        let mut lines = vec![format!(
            "uptime: {}h {}m {}s",
            uptime / 3600,
            (uptime % 3600) / 60,
            uptime % 60
        )];
        for status in self.pool.status() {
            let c = &status.candidate;
            lines.push(format!(
                "{}{}: {}{}{}",
                if status.is_current { "* " } else { "  " },
                c.name,
                if c.error_flag { "quota exhausted" } else { "available" },
                c.daily_quota
                    .map(|q| format!(" (daily quota {})", q))
                    .unwrap_or_default(),
                if status.total_tokens > 0 {
                    format!(", {} tokens used", status.total_tokens)
                } else {
                    String::new()
                }
            ));
        }
        Ok(lines.join("\n"))
    }
}
