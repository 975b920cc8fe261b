//! 推理编排集成测试：模型轮换、工具调用、记忆归档、取消与超时

use std::sync::Arc;
use std::time::Duration;

use confidant::agent::{create_agent_components, process_message, switch_model};
use confidant::config::{AppConfig, ModelEntry};
use confidant::core::{AgentError, SessionSupervisor};
use confidant::llm::{LlmClient, LlmError, MockLlmClient, MockReply, ModelCandidate, ModelPool};
use confidant::memory::{InMemoryStore, KeywordSummarizer, MemoryLimits, MemoryRegistry};
use confidant::reasoning::{CallTimeouts, ExchangeRequest, ReasoningOrchestrator, StreamEvent};
use confidant::tools::{
    EchoTool, GetProfileTool, Literal, ProfileStore, Tool, ToolExecutor, ToolRegistry,
    UpdateFeelingTool,
};

struct Harness {
    orchestrator: Arc<ReasoningOrchestrator>,
    profiles: Arc<ProfileStore>,
    _dir: tempfile::TempDir,
}

/// 休眠指定毫秒后返回参数，用于观察并发执行的完成顺序
struct NapTool;

#[async_trait::async_trait]
impl Tool for NapTool {
    fn name(&self) -> &str {
        "nap"
    }

    fn description(&self) -> &str {
        "Sleep for the given milliseconds"
    }

    fn signature(&self) -> String {
        "nap(ms)".to_string()
    }

    async fn execute(&self, args: &[Literal]) -> Result<String, String> {
        let Some(Literal::Int(ms)) = args.first() else {
            return Err("nap expects milliseconds".to_string());
        };
        tokio::time::sleep(Duration::from_millis(*ms as u64)).await;
        Ok(format!("slept {}", ms))
    }
}

fn harness(models: Vec<(&str, MockLlmClient)>, limits: MemoryLimits) -> Harness {
    harness_with(models, limits, None)
}

fn harness_with(
    models: Vec<(&str, MockLlmClient)>,
    limits: MemoryLimits,
    parallelism: Option<usize>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let entries = models
        .into_iter()
        .map(|(name, client)| {
            (
                ModelCandidate::new(name),
                Arc::new(client) as Arc<dyn LlmClient>,
            )
        })
        .collect();
    let pool = Arc::new(ModelPool::new(entries, 3).unwrap());
    let profiles = Arc::new(ProfileStore::new(dir.path().join("profiles")));

    let mut registry = ToolRegistry::new();
    registry.register(UpdateFeelingTool::new(Arc::clone(&profiles)));
    registry.register(GetProfileTool::new(Arc::clone(&profiles)));
    registry.register(EchoTool);
    registry.register(NapTool);
    let mut executor = ToolExecutor::new(registry, 5);
    if let Some(n) = parallelism {
        executor = executor.with_parallelism(n);
    }
    let executor = Arc::new(executor);

    let memory = Arc::new(MemoryRegistry::new(
        limits,
        Arc::new(KeywordSummarizer::default()),
        Arc::new(InMemoryStore::new()),
    ));
    let orchestrator = ReasoningOrchestrator::new(pool, executor, memory)
        .with_profiles(Arc::clone(&profiles))
        .with_timeouts(CallTimeouts {
            request: Duration::from_millis(200),
            stream: Duration::from_millis(200),
            chunk_idle: Duration::from_millis(200),
        });
    Harness {
        orchestrator: Arc::new(orchestrator),
        profiles,
        _dir: dir,
    }
}

fn chunks(events: &[StreamEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::Chunk { content } => Some(content.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_quota_exceeded_rotates_to_next_model() {
    let a = MockLlmClient::scripted([MockReply::Fail(LlmError::QuotaExceeded {
        model: "a".into(),
    })]);
    let b = MockLlmClient::scripted([
        MockReply::Text("Just say hello.".into()),
        MockReply::Text("Hello from b".into()),
    ]);
    let h = harness(vec![("a", a), ("b", b)], MemoryLimits::default());

    let (events, outcome) = h
        .orchestrator
        .start(ExchangeRequest::new("alice", "hi"))
        .collect()
        .await;
    let outcome = outcome.unwrap();
    assert_eq!(outcome.response, "Hello from b");
    assert_eq!(outcome.model_used, "b");
    assert_eq!(chunks(&events), "Hello from b");

    let pool = h.orchestrator.pool();
    assert_eq!(pool.current().name, "b");
    let status = pool.status();
    assert!(status[0].candidate.error_flag);
    assert!(!status[1].candidate.error_flag);
}

#[tokio::test]
async fn test_quota_before_first_chunk_streams_from_next_model() {
    let a = MockLlmClient::scripted([
        MockReply::Text("thinking".into()),
        MockReply::Fail(LlmError::QuotaExceeded { model: "a".into() }),
    ]);
    let b = MockLlmClient::scripted([MockReply::Text("reply from b".into())]);
    let h = harness(vec![("a", a), ("b", b)], MemoryLimits::default());

    let (events, outcome) = h
        .orchestrator
        .start(ExchangeRequest::new("alice", "hi"))
        .collect()
        .await;
    let outcome = outcome.unwrap();
    assert_eq!(outcome.model_used, "b");
    assert_eq!(outcome.response, "reply from b");
    assert_eq!(chunks(&events), "reply from b");
    assert!(!events.iter().any(|e| matches!(e, StreamEvent::Error { .. })));

    let pool = h.orchestrator.pool();
    assert_eq!(pool.current().name, "b");
    assert!(pool.status()[0].candidate.error_flag);
}

#[tokio::test]
async fn test_all_models_exhausted_emits_single_error() {
    let quota = |m: &str| MockReply::Fail(LlmError::QuotaExceeded { model: m.into() });
    let a = MockLlmClient::scripted([quota("a")]);
    let b = MockLlmClient::scripted([quota("b")]);
    let h = harness(vec![("a", a), ("b", b)], MemoryLimits::default());

    let (events, outcome) = h
        .orchestrator
        .start(ExchangeRequest::new("alice", "hi"))
        .collect()
        .await;
    match outcome {
        Err(AgentError::NoAvailableModel { tried }) => assert_eq!(tried, vec!["a", "b"]),
        other => panic!("unexpected outcome: {:?}", other.map(|o| o.response)),
    }
    assert_eq!(events.len(), 1);
    match &events[0] {
        StreamEvent::Error { message } => assert!(message.contains("No available model")),
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_tool_calls_run_in_order_and_unknown_tool_fails() {
    let thinking = "The user is happy, record it.\n\
```tool_code\n\
update_feeling(\"alice\", \"happy\")\n\
delete_everything()\n\
```\n";
    let a = MockLlmClient::scripted([
        MockReply::Text(thinking.into()),
        MockReply::Text("I'm so glad you feel happy today!".into()),
    ]);
    let h = harness(vec![("a", a)], MemoryLimits::default());

    let (events, outcome) = h
        .orchestrator
        .start(ExchangeRequest::new("alice", "I feel happy"))
        .collect()
        .await;
    let outcome = outcome.unwrap();

    assert_eq!(outcome.tool_results.len(), 2);
    assert_eq!(outcome.tool_results[0].tool_name(), "update_feeling");
    assert!(!outcome.tool_results[0].failed);
    assert_eq!(outcome.tool_results[1].tool_name(), "delete_everything");
    assert!(outcome.tool_results[1].failed);
    assert!(outcome.tool_results[1]
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("Unknown tool"));
    assert_eq!(outcome.response, "I'm so glad you feel happy today!");

    // 工具事件先于回复分块，并按调用顺序发送
    assert!(matches!(&events[0], StreamEvent::ToolResult { name, .. } if name == "update_feeling"));
    assert!(matches!(&events[1], StreamEvent::ToolError { name, .. } if name == "delete_everything"));
    assert!(matches!(events[2], StreamEvent::Chunk { .. }));

    let profile = h.profiles.load("alice").await.unwrap();
    assert_eq!(profile.feeling.as_deref(), Some("happy"));

    let memory = h.orchestrator.memory().get_or_load("alice").await.unwrap();
    let memory = memory.lock().await;
    assert_eq!(memory.len(), 1);
    let summary = memory.active()[0].tool_results_summary.clone().unwrap_or_default();
    assert!(summary.contains("Tool update_feeling returned"));
    assert!(summary.contains("Tool delete_everything failed"));
}

#[tokio::test]
async fn test_parallel_tools_report_in_call_order() {
    // 先调用的睡得更久，完成顺序与调用顺序相反
    let thinking = "```tool_code\n\
nap(120)\n\
nap(60)\n\
nap(5)\n\
```\n";
    let a = MockLlmClient::scripted([
        MockReply::Text(thinking.into()),
        MockReply::Text("All rested.".into()),
    ]);
    let h = harness_with(vec![("a", a)], MemoryLimits::default(), Some(4));

    let (events, outcome) = h
        .orchestrator
        .start(ExchangeRequest::new("alice", "take a nap"))
        .collect()
        .await;
    let outcome = outcome.unwrap();

    let outputs: Vec<_> = outcome
        .tool_results
        .iter()
        .map(|r| r.output_text.as_str())
        .collect();
    assert_eq!(outputs, vec!["slept 120", "slept 60", "slept 5"]);

    let reported: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            StreamEvent::ToolResult { result, .. } => Some(result.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(reported, vec!["slept 120", "slept 60", "slept 5"]);
    assert!(matches!(events[3], StreamEvent::Chunk { .. }));
    assert_eq!(outcome.response, "All rested.");
}

#[tokio::test]
async fn test_exchanges_archive_when_history_exceeds_limit() {
    let h = harness(vec![("a", MockLlmClient::new())], MemoryLimits::new(5, 2));

    for i in 0..5 {
        let outcome = process(&h, &format!("message {}", i)).await;
        assert!(outcome.archived.is_none());
    }
    let outcome = process(&h, "message 5").await;
    let archive = outcome.archived.expect("sixth exchange archives");
    assert_eq!(archive.original_entry_count, 4);
    assert_eq!((archive.first_seq, archive.last_seq), (0, 3));

    let memory = h.orchestrator.memory().get_or_load("alice").await.unwrap();
    let memory = memory.lock().await;
    assert_eq!(memory.len(), 2);
    assert_eq!(memory.active()[0].seq, 4);
    assert_eq!(memory.archives().len(), 1);
}

async fn process(h: &Harness, message: &str) -> confidant::reasoning::ExchangeOutcome {
    h.orchestrator
        .start(ExchangeRequest::new("alice", message))
        .finish()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_cancel_mid_response_records_nothing() {
    let a = MockLlmClient::scripted([
        MockReply::Text("thinking".into()),
        MockReply::Text("one two three four five six seven".into()),
    ])
    .with_chunk_delay(Duration::from_millis(30));
    let h = harness(vec![("a", a)], MemoryLimits::default());
    let supervisor = SessionSupervisor::new();

    let mut exchange = h
        .orchestrator
        .start_with_token(ExchangeRequest::new("alice", "hi"), supervisor.begin_exchange());
    let first = exchange.next_event().await;
    assert!(matches!(first, Some(StreamEvent::Chunk { .. })));
    assert!(supervisor.cancel_current());

    let (events, outcome) = exchange.collect().await;
    assert!(matches!(outcome, Err(AgentError::Cancelled)));
    assert!(!events
        .iter()
        .any(|e| matches!(e, StreamEvent::FinalResponse { .. } | StreamEvent::Error { .. })));

    let memory = h.orchestrator.memory().get_or_load("alice").await.unwrap();
    assert!(memory.lock().await.is_empty());
}

#[tokio::test]
async fn test_hanging_model_times_out_as_backend_unavailable() {
    let h = harness(
        vec![("a", MockLlmClient::scripted([MockReply::Hang]))],
        MemoryLimits::default(),
    );
    let (events, outcome) = h
        .orchestrator
        .start(ExchangeRequest::new("alice", "hi"))
        .collect()
        .await;
    match outcome {
        Err(AgentError::BackendUnavailable { model, source }) => {
            assert_eq!(model, "a");
            assert!(matches!(source, LlmError::Timeout { .. }));
        }
        other => panic!("unexpected outcome: {:?}", other.map(|o| o.response)),
    }
    assert!(matches!(events.as_slice(), [StreamEvent::Error { .. }]));
    // 超时不标记配额
    assert!(!h.orchestrator.pool().status()[0].candidate.error_flag);
}

fn mock_entry(name: &str) -> ModelEntry {
    ModelEntry {
        name: name.to_string(),
        provider: "mock".to_string(),
        model: None,
        base_url: None,
        api_key_env: None,
        daily_quota: None,
        supports_tools: true,
        supports_vision: false,
    }
}

#[tokio::test]
async fn test_components_persist_history_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let config = || {
        let mut cfg = AppConfig::default();
        cfg.app.data_dir = dir.path().join("data");
        cfg.tools.filesystem_root = Some(dir.path().join("workspace"));
        cfg.prompts.dir = dir.path().join("prompts");
        cfg.llm.models = vec![mock_entry("m1"), mock_entry("m2")];
        cfg
    };

    let components = create_agent_components(config()).unwrap();
    assert!(switch_model(&components, "m2").success);
    let outcome = process_message(&components, "bob", "remember the garden")
        .await
        .unwrap();
    assert_eq!(outcome.model_used, "m2");
    drop(components);

    let restarted = create_agent_components(config()).unwrap();
    let context = restarted.memory.context("bob", 10).await.unwrap();
    assert!(context.contains("remember the garden"));
}
