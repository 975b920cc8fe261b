//! 两阶段提示词
//!
//! THINKING：system（人设 + 工具列表与调用语法 + 会话上下文）+ 用户消息；
//! RESPONDING：system（人设 + 会话上下文 + 思考笔记）+ 用户消息 + 工具结果行 + 只输出自然语言的要求。
//! 模板可由 `<dir>/thinking.txt`、`<dir>/responding.txt` 覆盖，占位符见 DEFAULT_* 常量。
//! 占位符一次性替换，填入的内容不会再被当作占位符。

use std::path::Path;

use crate::llm::Message;
use crate::memory::SessionContext;

const DEFAULT_THINKING: &str = "\
You are Confidant, a warm and attentive companion who remembers what the user shares.
Before replying, think about what the user needs and whether any tool should be used.

{tools}
{context}
Write your reasoning as short notes. Do not write the final reply yet.";

const DEFAULT_RESPONDING: &str = "\
You are Confidant, a warm and attentive companion who remembers what the user shares.

{context}
{notes}
{tool_results}
Reply to the user in natural language only. Do not write code blocks, tool calls or notes about tools.";

const NO_TOOLS: &str = "No tools are available in this conversation.";

#[derive(Debug, Clone)]
pub struct PromptBuilder {
    thinking_template: String,
    responding_template: String,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self {
            thinking_template: DEFAULT_THINKING.to_string(),
            responding_template: DEFAULT_RESPONDING.to_string(),
        }
    }
}

impl PromptBuilder {
    pub fn new(thinking_template: impl Into<String>, responding_template: impl Into<String>) -> Self {
        Self {
            thinking_template: thinking_template.into(),
            responding_template: responding_template.into(),
        }
    }

    /// 从目录加载模板，缺失的文件使用内置模板
    pub fn from_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        let load = |name: &str, fallback: &str| match std::fs::read_to_string(dir.join(name)) {
            Ok(text) if !text.trim().is_empty() => {
                tracing::info!(template = %name, dir = %dir.display(), "prompt template loaded");
                text
            }
            _ => fallback.to_string(),
        };
        Self {
            thinking_template: load("thinking.txt", DEFAULT_THINKING),
            responding_template: load("responding.txt", DEFAULT_RESPONDING),
        }
    }

    pub fn thinking_messages(
        &self,
        tools_section: &str,
        context: &SessionContext,
        user_message: &str,
    ) -> Vec<Message> {
        let tools = if tools_section.trim().is_empty() {
            NO_TOOLS
        } else {
            tools_section
        };
        let system = fill(
            &self.thinking_template,
            &[("tools", tools), ("context", context.render().as_str())],
        );
        vec![Message::system(system), Message::user(user_message)]
    }

    pub fn responding_messages(
        &self,
        context: &SessionContext,
        user_message: &str,
        notes: &str,
        tool_lines: &[String],
    ) -> Vec<Message> {
        let notes = if notes.trim().is_empty() {
            String::new()
        } else {
            format!("Your notes from thinking about this message:\n{}\n", notes.trim())
        };
        let tool_results = if tool_lines.is_empty() {
            String::new()
        } else {
            format!(
                "Results of the tools you used (already done, do not call them again):\n{}\n",
                tool_lines.join("\n")
            )
        };
        let system = fill(
            &self.responding_template,
            &[
                ("context", context.render().as_str()),
                ("notes", notes.as_str()),
                ("tool_results", tool_results.as_str()),
            ],
        );
        vec![Message::system(system), Message::user(user_message)]
    }
}

/// 单遍替换模板中的 `{name}`；未知占位符原样保留
fn fill(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start + 1..];
        let hit = vars
            .iter()
            .find(|(name, _)| tail.starts_with(name) && tail[name.len()..].starts_with('}'));
        match hit {
            Some((name, value)) => {
                out.push_str(value);
                rest = &tail[name.len() + 1..];
            }
            None => {
                out.push('{');
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Role;

    #[test]
    fn test_thinking_prompt_includes_tools_and_context() {
        let ctx = SessionContext::empty("alice");
        let msgs = PromptBuilder::default().thinking_messages("- echo(text): Echo", &ctx, "hello");
        assert_eq!(msgs.len(), 2);
        assert!(msgs[0].content.contains("- echo(text): Echo"));
        assert!(msgs[0].content.contains("Current user id: \"alice\""));
        assert_eq!(msgs[1].role, Role::User);
        assert_eq!(msgs[1].content, "hello");

        let msgs = PromptBuilder::default().thinking_messages("", &ctx, "hello");
        assert!(msgs[0].content.contains(NO_TOOLS));
    }

    #[test]
    fn test_responding_prompt_folds_tool_lines() {
        let ctx = SessionContext::empty("alice");
        let lines = vec![
            "Tool update_feeling returned: ok".to_string(),
            "Tool delete_everything failed: Unknown tool".to_string(),
        ];
        let msgs = PromptBuilder::default().responding_messages(&ctx, "I feel great", "", &lines);
        assert!(msgs[0].content.contains("Tool update_feeling returned: ok"));
        assert!(msgs[0].content.contains("Tool delete_everything failed"));
        assert!(msgs[0].content.contains("natural language only"));
    }

    #[test]
    fn test_from_dir_overrides_present_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("thinking.txt"), "THINK {tools}").unwrap();
        let builder = PromptBuilder::from_dir(dir.path());
        let ctx = SessionContext::empty("bob");
        let msgs = builder.thinking_messages("T", &ctx, "hi");
        assert_eq!(msgs[0].content, "THINK T");
        let msgs = builder.responding_messages(&ctx, "hi", "", &[]);
        assert!(msgs[0].content.contains("natural language only"));
    }

    #[test]
    fn test_history_text_is_not_treated_as_placeholder() {
        let mut ctx = SessionContext::empty("alice");
        ctx.history = "User: what does {tool_results} mean?\n".to_string();
        let lines = vec!["Tool echo returned: SECRET".to_string()];
        let msgs = PromptBuilder::default().responding_messages(&ctx, "hi", "", &lines);
        let system = &msgs[0].content;
        assert!(system.contains("what does {tool_results} mean?"));
        assert_eq!(system.matches("Tool echo returned: SECRET").count(), 1);
    }

    #[test]
    fn test_thinking_notes_folded_into_response_prompt() {
        let ctx = SessionContext::empty("alice");
        let msgs = PromptBuilder::default().responding_messages(&ctx, "hi", "User seems tired.", &[]);
        assert!(msgs[0].content.contains("Your notes from thinking about this message:\nUser seems tired."));
        let msgs = PromptBuilder::default().responding_messages(&ctx, "hi", "  ", &[]);
        assert!(!msgs[0].content.contains("Your notes"));
    }

    #[test]
    fn test_fill_keeps_unknown_braces() {
        assert_eq!(fill("{a} {b} {", &[("a", "{b}")]), "{b} {b} {");
    }
}
