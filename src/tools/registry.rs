//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / signature / execute），由 ToolRegistry 按名注册与查找。
//! 注册表在构建 ToolExecutor 时被移入执行器，此后允许列表固定。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::tools::grammar::{Literal, TOOL_FENCE};

/// 工具 trait：名称、描述（供 LLM 理解）、调用签名、异步执行（参数均为字面量）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（调用行中的函数名）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 调用签名，如 `read_file(path)`；默认无参数
    fn signature(&self) -> String {
        format!("{}()", self.name())
    }

    /// 执行工具
    async fn execute(&self, args: &[Literal]) -> Result<String, String>;
}

/// 工具注册表：按名称有序存储 Arc<dyn Tool>
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册工具；同名工具后注册者覆盖
    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), Arc::new(tool)).is_some() {
            tracing::warn!(tool = %name, "tool registered twice, replacing");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// 生成 prompt 中的 Available tools 段落（含调用语法说明）
    pub fn prompt_section(&self) -> String {
        if self.tools.is_empty() {
            return String::new();
        }
        let mut out = String::from("Available tools:\n");
        for tool in self.tools.values() {
            out.push_str(&format!("- {}: {}\n", tool.signature(), tool.description()));
        }
        out.push_str(&format!(
            "\nTo call tools, write a fenced block that starts with ```{} and ends with ```.\n\
             Put exactly one call per line, e.g. update_feeling(\"alice\", \"happy\").\n\
             Arguments must be literal values: double-quoted strings, numbers, true or false.\n\
             Never use variables, placeholders, keyword arguments or nested calls.\n",
            TOOL_FENCE
        ));
        out
    }
}

/// 校验参数个数
pub fn expect_arity(tool: &str, args: &[Literal], expected: usize) -> Result<(), String> {
    if args.len() == expected {
        Ok(())
    } else {
        Err(format!(
            "{} expects {} argument(s), got {}",
            tool,
            expected,
            args.len()
        ))
    }
}

/// 取第 index 个字符串参数
pub fn string_arg<'a>(tool: &str, args: &'a [Literal], index: usize) -> Result<&'a str, String> {
    match args.get(index) {
        Some(Literal::Str(s)) => Ok(s),
        Some(other) => Err(format!(
            "{} argument {} must be a string, got {}",
            tool,
            index + 1,
            other
        )),
        None => Err(format!("{} missing argument {}", tool, index + 1)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl Tool for Noop {
        fn name(&self) -> &str {
            "noop"
        }
        fn description(&self) -> &str {
            "Does nothing"
        }
        async fn execute(&self, _args: &[Literal]) -> Result<String, String> {
            Ok(String::new())
        }
    }

    #[test]
    fn test_register_and_prompt_section() {
        let mut registry = ToolRegistry::new();
        assert!(registry.prompt_section().is_empty());
        registry.register(Noop);
        assert!(registry.contains("noop"));
        assert_eq!(registry.tool_names(), vec!["noop".to_string()]);
        let section = registry.prompt_section();
        assert!(section.contains("- noop(): Does nothing"));
        assert!(section.contains("```tool_code"));
    }

    #[test]
    fn test_arg_helpers() {
        let args = vec![Literal::Str("a".into()), Literal::Int(1)];
        assert!(expect_arity("t", &args, 2).is_ok());
        assert!(expect_arity("t", &args, 1).is_err());
        assert_eq!(string_arg("t", &args, 0).unwrap(), "a");
        assert!(string_arg("t", &args, 1).unwrap_err().contains("must be a string"));
        assert!(string_arg("t", &args, 2).unwrap_err().contains("missing"));
    }
}
