//! Confidant - 陪伴型聊天助手核心
//!
//! 模块划分：
//! - **agent**: 无头 Agent 运行时（组件装配、单轮处理、模型切换）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型、恢复策略、会话监管（交换级取消）
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）与模型池
//! - **memory**: 按用户的对话记忆、归档摘要与 JSON 持久化
//! - **observability**: tracing 初始化
//! - **reasoning**: 两阶段推理编排、阶段状态机、流式事件
//! - **tools**: 工具调用语法、允许列表、执行器与内置工具

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod reasoning;
pub mod tools;
