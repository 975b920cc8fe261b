//! 推理编排器：一次用户消息的完整交换
//!
//! THINKING（非流式调用当前模型，配额耗尽则轮换）-> EXTRACTING（解析 tool_code 块）->
//! EXECUTING（按允许列表执行，结果按源顺序折叠为文本行）-> RESPONDING（流式调用，分块到达即转发）->
//! DONE（final_response、写入对话记忆、message_complete）。任一阶段失败进入 ERROR：
//! 发送一个 error 事件且不写入记忆；被取消时既不发事件也不写入记忆。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::core::{AgentError, RecoveryAction, RecoveryEngine};
use crate::llm::{ActiveModel, LlmError, Message, ModelPool, ModelRequirements};
use crate::memory::{ArchiveEntry, ConversationEntry, MemoryRegistry, SessionContext};
use crate::reasoning::{Phase, PhaseTrace, PromptBuilder, StreamEvent};
use crate::tools::{extract_tool_calls, ProfileStore, ToolExecutor, ToolParseError, ToolResult, TOOL_FENCE};

/// 各阶段模型调用的超时
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallTimeouts {
    /// THINKING 整次调用
    pub request: Duration,
    /// RESPONDING 建立流
    pub stream: Duration,
    /// 相邻两个分片的最长间隔
    pub chunk_idle: Duration,
}

impl CallTimeouts {
    pub fn from_secs(request: u64, stream: u64, chunk_idle: u64) -> Self {
        Self {
            request: Duration::from_secs(request),
            stream: Duration::from_secs(stream),
            chunk_idle: Duration::from_secs(chunk_idle),
        }
    }
}

impl Default for CallTimeouts {
    fn default() -> Self {
        Self::from_secs(60, 120, 30)
    }
}

/// 一次交换的输入
#[derive(Debug, Clone)]
pub struct ExchangeRequest {
    pub user_id: String,
    pub message: String,
    pub needs_vision: bool,
}

impl ExchangeRequest {
    pub fn new(user_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            message: message.into(),
            needs_vision: false,
        }
    }

    pub fn with_vision(mut self, needs_vision: bool) -> Self {
        self.needs_vision = needs_vision;
        self
    }
}

/// 成功交换的结果
#[derive(Debug, Clone)]
pub struct ExchangeOutcome {
    pub response: String,
    pub tool_results: Vec<ToolResult>,
    pub parse_failures: Vec<ToolParseError>,
    pub phases: Vec<Phase>,
    /// 生成回复的模型
    pub model_used: String,
    /// 本次写入触发的归档（若有）
    pub archived: Option<ArchiveEntry>,
}

/// 后台运行的交换：事件接收端、取消令牌、任务句柄
pub struct ExchangeStream {
    pub events: mpsc::Receiver<StreamEvent>,
    pub cancel: CancellationToken,
    pub handle: JoinHandle<Result<ExchangeOutcome, AgentError>>,
}

impl ExchangeStream {
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// 收集全部事件并等待交换结束
    pub async fn collect(mut self) -> (Vec<StreamEvent>, Result<ExchangeOutcome, AgentError>) {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        (events, join_exchange(self.handle).await)
    }

    /// 丢弃剩余事件并等待交换结束
    pub async fn finish(mut self) -> Result<ExchangeOutcome, AgentError> {
        while self.events.recv().await.is_some() {}
        join_exchange(self.handle).await
    }
}

async fn join_exchange(
    handle: JoinHandle<Result<ExchangeOutcome, AgentError>>,
) -> Result<ExchangeOutcome, AgentError> {
    match handle.await {
        Ok(result) => result,
        Err(e) => Err(AgentError::TaskFailed(e.to_string())),
    }
}

/// 单次模型调用尝试的失败：可交给恢复引擎的后端错误，或必须立即终止的错误
enum AttemptError {
    Llm(LlmError),
    Fatal(AgentError),
}

impl From<LlmError> for AttemptError {
    fn from(e: LlmError) -> Self {
        AttemptError::Llm(e)
    }
}

fn check_cancel(cancel: &CancellationToken) -> Result<(), AgentError> {
    if cancel.is_cancelled() {
        Err(AgentError::Cancelled)
    } else {
        Ok(())
    }
}

pub struct ReasoningOrchestrator {
    pool: Arc<ModelPool>,
    executor: Arc<ToolExecutor>,
    memory: Arc<MemoryRegistry>,
    profiles: Option<Arc<ProfileStore>>,
    prompts: PromptBuilder,
    recovery: RecoveryEngine,
    timeouts: CallTimeouts,
    context_recent: usize,
    event_buffer: usize,
}

impl ReasoningOrchestrator {
    pub fn new(pool: Arc<ModelPool>, executor: Arc<ToolExecutor>, memory: Arc<MemoryRegistry>) -> Self {
        Self {
            pool,
            executor,
            memory,
            profiles: None,
            prompts: PromptBuilder::default(),
            recovery: RecoveryEngine::new(),
            timeouts: CallTimeouts::default(),
            context_recent: 10,
            event_buffer: 64,
        }
    }

    pub fn with_profiles(mut self, profiles: Arc<ProfileStore>) -> Self {
        self.profiles = Some(profiles);
        self
    }

    pub fn with_prompts(mut self, prompts: PromptBuilder) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_timeouts(mut self, timeouts: CallTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_context_recent(mut self, n: usize) -> Self {
        self.context_recent = n;
        self
    }

    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }

    pub fn pool(&self) -> &Arc<ModelPool> {
        &self.pool
    }

    pub fn memory(&self) -> &Arc<MemoryRegistry> {
        &self.memory
    }

    /// 在后台任务中运行交换，返回事件流
    pub fn start(self: &Arc<Self>, request: ExchangeRequest) -> ExchangeStream {
        self.start_with_token(request, CancellationToken::new())
    }

    /// 同 start，使用调用方提供的取消令牌（如 SessionSupervisor 的子令牌）
    pub fn start_with_token(
        self: &Arc<Self>,
        request: ExchangeRequest,
        cancel: CancellationToken,
    ) -> ExchangeStream {
        let (tx, rx) = mpsc::channel(self.event_buffer);
        let this = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move { this.run_exchange(&request, &tx, &token).await });
        ExchangeStream {
            events: rx,
            cancel,
            handle,
        }
    }

    /// 运行一次交换，事件写入 tx。失败时（取消除外）先发送一个 error 事件再返回错误
    pub async fn run_exchange(
        &self,
        request: &ExchangeRequest,
        tx: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Result<ExchangeOutcome, AgentError> {
        let span = tracing::info_span!(
            "exchange",
            exchange_id = %uuid::Uuid::new_v4(),
            user_id = %request.user_id,
        );
        async move {
            let mut trace = PhaseTrace::new();
            let result = self.drive(request, tx, cancel, &mut trace).await;
            match &result {
                Ok(outcome) => {
                    tracing::info!(
                        model = %outcome.model_used,
                        tools = outcome.tool_results.len(),
                        response_chars = outcome.response.chars().count(),
                        "exchange complete"
                    );
                }
                Err(AgentError::Cancelled) => {
                    tracing::info!(phase = %trace.current(), "exchange cancelled, nothing recorded");
                }
                Err(e) => {
                    let failed_in = trace.current();
                    trace.advance(Phase::Error);
                    tracing::warn!(phase = %failed_in, error = %e, "exchange failed");
                    let _ = tx
                        .send(StreamEvent::Error {
                            message: e.to_string(),
                        })
                        .await;
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn drive(
        &self,
        request: &ExchangeRequest,
        tx: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
        trace: &mut PhaseTrace,
    ) -> Result<ExchangeOutcome, AgentError> {
        let context = SessionContext::assemble(
            &self.memory,
            self.profiles.as_deref(),
            &request.user_id,
            &request.message,
            self.context_recent,
        )
        .await?;
        check_cancel(cancel)?;

        // THINKING
        let thinking_requirements = ModelRequirements {
            tools: self.executor.has_tools(),
            vision: request.needs_vision,
        };
        let thinking_messages =
            self.prompts
                .thinking_messages(&self.executor.prompt_section(), &context, &request.message);
        let request_timeout = self.timeouts.request;
        let messages = &thinking_messages;
        let (thinking, thinking_model) = self
            .call_with_rotation(Phase::Thinking, thinking_requirements, cancel, move |model| {
                async move {
                    match timeout(request_timeout, model.client.complete(messages)).await {
                        Ok(result) => result.map_err(AttemptError::from),
                        Err(_) => Err(AttemptError::Llm(LlmError::Timeout {
                            secs: request_timeout.as_secs(),
                        })),
                    }
                }
            })
            .await?;
        tracing::debug!(model = %thinking_model, chars = thinking.chars().count(), "thinking done");

        // EXTRACTING
        trace.advance(Phase::Extracting);
        let extraction = extract_tool_calls(&thinking);
        if !extraction.failures.is_empty() {
            let first = AgentError::from(extraction.failures[0].clone());
            tracing::info!(dropped = extraction.failures.len(), first = %first, "tool calls dropped");
        }
        check_cancel(cancel)?;

        // EXECUTING
        let mut tool_results = Vec::new();
        if extraction.calls.is_empty() {
            trace.advance(Phase::Responding);
        } else {
            trace.advance(Phase::Executing);
            tool_results = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                results = self.executor.execute_all(&extraction.calls) => results,
            };
            for result in &tool_results {
                if let Some(err) = result.as_error() {
                    tracing::warn!(error = %err, "tool call failed");
                }
                let event = if result.failed {
                    StreamEvent::ToolError {
                        name: result.tool_name().to_string(),
                        error: result.error_message.clone().unwrap_or_default(),
                    }
                } else {
                    StreamEvent::ToolResult {
                        name: result.tool_name().to_string(),
                        result: result.output_text.clone(),
                    }
                };
                self.emit(tx, cancel, event).await?;
            }
            trace.advance(Phase::Responding);
        }

        // RESPONDING
        let tool_lines: Vec<String> = tool_results.iter().map(ToolResult::prompt_line).collect();
        let responding_messages =
            self.prompts
                .responding_messages(&context, &request.message, &extraction.prose, &tool_lines);
        let responding_requirements = ModelRequirements {
            tools: false,
            vision: request.needs_vision,
        };
        let messages = &responding_messages;
        let (response, model_used) = self
            .call_with_rotation(Phase::Responding, responding_requirements, cancel, move |model| {
                async move {
                    self.stream_response(&model, messages, responding_requirements, tx, cancel)
                        .await
                }
            })
            .await?;
        if response.contains(&format!("```{}", TOOL_FENCE)) {
            tracing::warn!(model = %model_used, "response contains a tool block, not executed");
        }

        // DONE
        check_cancel(cancel)?;
        self.emit(
            tx,
            cancel,
            StreamEvent::FinalResponse {
                content: response.clone(),
            },
        )
        .await?;
        let tool_summary = (!tool_lines.is_empty()).then(|| tool_lines.join("\n"));
        let archived = self
            .memory
            .record(ConversationEntry::new(
                request.user_id.clone(),
                request.message.clone(),
                response.clone(),
                tool_summary,
            ))
            .await?;
        trace.advance(Phase::Done);
        // 记录已写入；接收端此时离开不影响结果
        let _ = self.emit(tx, cancel, StreamEvent::MessageComplete {}).await;

        Ok(ExchangeOutcome {
            response,
            tool_results,
            parse_failures: extraction.failures,
            phases: trace.phases().to_vec(),
            model_used,
            archived,
        })
    }

    /// 发送事件；接收端已丢弃或交换被取消时返回 Cancelled
    async fn emit(
        &self,
        tx: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
        event: StreamEvent,
    ) -> Result<(), AgentError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            sent = tx.send(event) => sent.map_err(|_| {
                tracing::info!("event receiver dropped");
                AgentError::Cancelled
            }),
        }
    }

    /// 以当前模型执行一次调用；配额耗尽时标记并轮换（每个候选至多一次），
    /// 其它后端故障时不标记、换下一个候选重试一次
    async fn call_with_rotation<T, F, Fut>(
        &self,
        phase: Phase,
        requirements: ModelRequirements,
        cancel: &CancellationToken,
        mut attempt: F,
    ) -> Result<(T, String), AgentError>
    where
        F: FnMut(ActiveModel) -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        let mut model = self.pool.select(requirements)?;
        let mut tried: Vec<String> = Vec::new();
        let mut backend_retry_used = false;
        loop {
            check_cancel(cancel)?;
            let name = model.candidate.name.clone();
            if !tried.contains(&name) {
                tried.push(name.clone());
            }
            tracing::debug!(phase = %phase, model = %name, "calling model");
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                outcome = attempt(model.clone()) => outcome,
            };
            let err = match outcome {
                Ok(value) => {
                    self.pool.report_success(&name);
                    return Ok((value, name));
                }
                Err(AttemptError::Fatal(e)) => return Err(e),
                Err(AttemptError::Llm(e)) => e,
            };

            match self.recovery.handle(&err, backend_retry_used) {
                RecoveryAction::RotateModel => {
                    // 池指针可能停在本次已试过的候选上（如后端故障后的备选），此时继续向后找未试过的
                    let next = match self.pool.report_quota_exceeded(&name, requirements) {
                        Ok(next) if !tried.contains(&next.candidate.name) => Some(next),
                        Ok(_) | Err(AgentError::NoAvailableModel { .. }) => {
                            self.pool.fallback_for(&name, requirements, &tried)
                        }
                        Err(e) => return Err(e),
                    };
                    let Some(next) = next else {
                        return Err(AgentError::NoAvailableModel { tried });
                    };
                    tracing::warn!(phase = %phase, from = %name, to = %next.candidate.name, "quota exceeded, rotating model");
                    model = next;
                }
                RecoveryAction::TryNextModelOnce => {
                    backend_retry_used = true;
                    match self.pool.fallback_for(&name, requirements, &tried) {
                        Some(next) => {
                            tracing::warn!(
                                phase = %phase,
                                from = %name,
                                to = %next.candidate.name,
                                error = %err,
                                "backend unavailable, trying next model once"
                            );
                            model = next;
                        }
                        None => {
                            return Err(AgentError::BackendUnavailable {
                                model: name,
                                source: err,
                            })
                        }
                    }
                }
                RecoveryAction::Abort => {
                    return Err(AgentError::BackendUnavailable {
                        model: name,
                        source: err,
                    })
                }
            }
        }
    }

    /// 打开回复流并逐块转发。首个分块之前的错误交给轮换策略；
    /// 已有分块转发后的错误终止本次交换（配额错误仍会标记该模型）
    async fn stream_response(
        &self,
        model: &ActiveModel,
        messages: &[Message],
        requirements: ModelRequirements,
        tx: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Result<String, AttemptError> {
        let name = &model.candidate.name;
        let mut stream = match timeout(self.timeouts.stream, model.client.complete_stream(messages)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(LlmError::Timeout {
                    secs: self.timeouts.stream.as_secs(),
                }
                .into())
            }
        };

        let mut response = String::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AttemptError::Fatal(AgentError::Cancelled)),
                next = timeout(self.timeouts.chunk_idle, stream.next()) => next,
            };
            let err = match next {
                Ok(None) => break,
                Ok(Some(Ok(chunk))) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    response.push_str(&chunk);
                    self.emit(tx, cancel, StreamEvent::Chunk { content: chunk })
                        .await
                        .map_err(AttemptError::Fatal)?;
                    continue;
                }
                Ok(Some(Err(e))) => e,
                Err(_) => LlmError::Timeout {
                    secs: self.timeouts.chunk_idle.as_secs(),
                },
            };
            if response.is_empty() {
                return Err(err.into());
            }
            if err.is_quota_exceeded() {
                let _ = self.pool.report_quota_exceeded(name, requirements);
            }
            tracing::warn!(model = %name, error = %err, "stream failed after partial output");
            return Err(AttemptError::Fatal(AgentError::BackendUnavailable {
                model: name.clone(),
                source: err,
            }));
        }

        if response.trim().is_empty() {
            return Err(LlmError::MalformedResponse("empty response".to_string()).into());
        }
        Ok(response)
    }
}
