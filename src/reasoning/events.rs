//! 交换过程事件：流式推送给调用方（REPL / 前端），序列化为带 "type" 标签的 JSON

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// 回复的一小段（到达即转发）
    Chunk { content: String },
    /// 工具成功返回
    ToolResult { name: String, result: String },
    /// 工具失败
    ToolError { name: String, error: String },
    /// 完整回复
    FinalResponse { content: String },
    /// 终止错误；之后不再有其它事件
    Error { message: String },
    /// 交换结束且已写入对话记忆
    MessageComplete {},
}

impl StreamEvent {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{\"type\":\"error\"}".to_string())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Error { .. } | StreamEvent::MessageComplete {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        assert_eq!(
            StreamEvent::Chunk { content: "hi".into() }.to_json(),
            r#"{"type":"chunk","content":"hi"}"#
        );
        assert_eq!(
            StreamEvent::ToolError { name: "x".into(), error: "e".into() }.to_json(),
            r#"{"type":"tool_error","name":"x","error":"e"}"#
        );
        assert_eq!(
            StreamEvent::MessageComplete {}.to_json(),
            r#"{"type":"message_complete"}"#
        );
        assert!(StreamEvent::Error { message: "m".into() }.is_terminal());
    }
}
