//! Headless Agent 运行时
//!
//! 供 REPL 或其它前端调用的无界面逻辑：
//! create_agent_components 按配置构建模型池、工具执行器、对话记忆与推理编排器；
//! process_message / process_message_stream 对单条用户消息运行一次交换；
//! switch_model / list_models / reset_model_errors 为模型切换控制面。

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::{AppConfig, ModelEntry};
use crate::core::AgentError;
use crate::llm::{
    create_deepseek_client, LlmClient, MockLlmClient, ModelCandidate, ModelPool, ModelStatus,
    OpenAiClient, DEEPSEEK_CHAT, DEEPSEEK_REASONER,
};
use crate::memory::{InMemoryStore, JsonFileStore, KeywordSummarizer, MemoryRegistry, MemoryStore};
use crate::reasoning::{
    CallTimeouts, ExchangeOutcome, ExchangeRequest, ExchangeStream, PromptBuilder,
    ReasoningOrchestrator,
};
use crate::tools::{
    EchoTool, GetProfileTool, ListFilesTool, ProfileStore, ReadFileTool, SafeFs, SystemStatusTool,
    ToolExecutor, ToolRegistry, UpdateFeelingTool, UpdateProfileTool, WriteFileTool,
};

/// 预构建的 Agent 组件，可被多个会话共享
pub struct AgentComponents {
    pub config: AppConfig,
    pub pool: Arc<ModelPool>,
    pub memory: Arc<MemoryRegistry>,
    pub profiles: Arc<ProfileStore>,
    pub orchestrator: Arc<ReasoningOrchestrator>,
}

fn build_client(entry: &ModelEntry) -> Result<Arc<dyn LlmClient>, AgentError> {
    let model = entry.model.as_deref().unwrap_or(&entry.name);
    let api_key = entry
        .api_key_env
        .as_deref()
        .and_then(|var| std::env::var(var).ok());
    let client: Arc<dyn LlmClient> = match entry.provider.as_str() {
        "deepseek" => Arc::new(create_deepseek_client(Some(model), api_key.as_deref())),
        "openai" => Arc::new(OpenAiClient::new(
            entry.base_url.as_deref(),
            model,
            api_key.as_deref(),
        )),
        "mock" => Arc::new(MockLlmClient::new()),
        other => {
            return Err(AgentError::ConfigError(format!(
                "unknown provider '{}' for model {}",
                other, entry.name
            )))
        }
    };
    Ok(client)
}

fn candidate_for(entry: &ModelEntry) -> ModelCandidate {
    let mut candidate = ModelCandidate::new(entry.name.clone())
        .with_tools(entry.supports_tools)
        .with_vision(entry.supports_vision);
    if let Some(quota) = entry.daily_quota {
        candidate = candidate.with_daily_quota(quota);
    }
    candidate
}

/// 按环境中的 API Key 组装默认模型列表；都没有时使用 Mock
fn default_model_entries() -> Vec<ModelEntry> {
    let entry = |name: &str, provider: &str| ModelEntry {
        name: name.to_string(),
        provider: provider.to_string(),
        model: None,
        base_url: None,
        api_key_env: None,
        daily_quota: None,
        supports_tools: true,
        supports_vision: false,
    };
    let mut entries = Vec::new();
    if std::env::var("DEEPSEEK_API_KEY").is_ok() {
        entries.push(entry(DEEPSEEK_CHAT, "deepseek"));
        entries.push(entry(DEEPSEEK_REASONER, "deepseek"));
    }
    if std::env::var("OPENAI_API_KEY").is_ok() {
        let mut openai = entry("gpt-4o-mini", "openai");
        openai.supports_vision = true;
        entries.push(openai);
    }
    if entries.is_empty() {
        tracing::warn!("no API key found (DEEPSEEK_API_KEY / OPENAI_API_KEY), using mock model");
        entries.push(entry("mock", "mock"));
    }
    entries
}

/// 从配置创建模型池（顺序即偏好顺序）
pub fn create_pool_from_config(cfg: &AppConfig) -> Result<ModelPool, AgentError> {
    let entries = if cfg.llm.models.is_empty() {
        default_model_entries()
    } else {
        cfg.llm.models.clone()
    };
    let mut pool_entries = Vec::with_capacity(entries.len());
    for entry in &entries {
        pool_entries.push((candidate_for(entry), build_client(entry)?));
    }
    tracing::info!(
        models = %entries.iter().map(|e| e.name.as_str()).collect::<Vec<_>>().join(", "),
        "model pool created"
    );
    ModelPool::new(pool_entries, cfg.llm.switch_retry_budget)
}

/// 内置工具注册表（允许列表）
pub fn build_tool_registry(
    cfg: &AppConfig,
    pool: &Arc<ModelPool>,
    profiles: &Arc<ProfileStore>,
) -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    if !cfg.tools.enabled {
        return tools;
    }
    let root = cfg
        .tools
        .filesystem_root
        .clone()
        .unwrap_or_else(|| PathBuf::from("workspace"));
    if let Err(e) = std::fs::create_dir_all(&root) {
        tracing::warn!(root = %root.display(), error = %e, "failed to create workspace root");
    }
    let fs = SafeFs::new(&root);
    tools.register(ReadFileTool::new(fs.clone()));
    tools.register(WriteFileTool::new(fs.clone()));
    tools.register(ListFilesTool::new(fs));
    tools.register(UpdateFeelingTool::new(Arc::clone(profiles)));
    tools.register(UpdateProfileTool::new(Arc::clone(profiles)));
    tools.register(GetProfileTool::new(Arc::clone(profiles)));
    tools.register(SystemStatusTool::new(Arc::clone(pool)));
    tools.register(EchoTool);
    tools
}

/// 创建 Agent 组件
pub fn create_agent_components(cfg: AppConfig) -> Result<AgentComponents, AgentError> {
    let pool = Arc::new(create_pool_from_config(&cfg)?);
    let profiles = Arc::new(ProfileStore::new(cfg.app.data_dir.join("profiles")));

    let mut executor = ToolExecutor::new(
        build_tool_registry(&cfg, &pool, &profiles),
        cfg.tools.tool_timeout_secs,
    );
    if cfg.tools.parallel {
        executor = executor.with_parallelism(cfg.tools.max_parallel);
    }

    let store: Arc<dyn MemoryStore> = if cfg.memory.persist {
        Arc::new(JsonFileStore::new(cfg.app.data_dir.join("memory")))
    } else {
        Arc::new(InMemoryStore::new())
    };
    let memory = Arc::new(MemoryRegistry::new(
        cfg.memory.limits(),
        Arc::new(KeywordSummarizer::new(cfg.memory.max_topics)),
        store,
    ));

    let timeouts = CallTimeouts::from_secs(
        cfg.llm.timeouts.request,
        cfg.llm.timeouts.stream,
        cfg.llm.timeouts.chunk_idle,
    );
    let orchestrator = ReasoningOrchestrator::new(Arc::clone(&pool), Arc::new(executor), Arc::clone(&memory))
        .with_profiles(Arc::clone(&profiles))
        .with_prompts(PromptBuilder::from_dir(&cfg.prompts.dir))
        .with_timeouts(timeouts)
        .with_context_recent(cfg.memory.context_recent)
        .with_event_buffer(cfg.app.event_buffer);

    Ok(AgentComponents {
        config: cfg,
        pool,
        memory,
        profiles,
        orchestrator: Arc::new(orchestrator),
    })
}

/// 处理单条用户消息（不关心流式事件），返回完整结果
pub async fn process_message(
    components: &AgentComponents,
    user_id: &str,
    message: &str,
) -> Result<ExchangeOutcome, AgentError> {
    components
        .orchestrator
        .start(ExchangeRequest::new(user_id, message))
        .finish()
        .await
}

/// 流式处理单条用户消息：事件经返回的 ExchangeStream 推送，cancel 取消时不写入记忆
pub fn process_message_stream(
    components: &AgentComponents,
    request: ExchangeRequest,
    cancel: CancellationToken,
) -> ExchangeStream {
    components.orchestrator.start_with_token(request, cancel)
}

/// 模型切换结果
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwitchOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 手动切换当前模型
pub fn switch_model(components: &AgentComponents, name: &str) -> SwitchOutcome {
    match components.pool.switch_to(name) {
        Ok(_) => SwitchOutcome {
            success: true,
            error: None,
        },
        Err(e) => {
            tracing::warn!(model = %name, error = %e, "model switch rejected");
            SwitchOutcome {
                success: false,
                error: Some(e.to_string()),
            }
        }
    }
}

pub fn list_models(components: &AgentComponents) -> Vec<ModelStatus> {
    components.pool.status()
}

/// 清除全部配额标记（如每日额度刷新后）
pub fn reset_model_errors(components: &AgentComponents) {
    components.pool.reset_errors();
}
