//! End-to-end engine scenarios driven by a scripted LLM and tool registry

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};

use agentloop::config::EngineConfig;
use agentloop::events::{AgentEventKind, CollectingAnalytics, CollectingTracer, TraceKind};
use agentloop::llm::client::mock::MockLlmClient;
use agentloop::llm::{ChatResponse, ToolChoice, ToolDefinition};
use agentloop::r#loop::AgentEngine;
use agentloop::tools::{ToolContext, ToolRegistry, ToolResult};
use agentloop::{RunSpec, TaskResult};
use sessionstore::{KpiSample, MemorySessionStore, SessionStore};

type Handler = Box<dyn Fn(&str, &Value) -> ToolResult + Send + Sync>;

/// Registry that answers every call through one scripted handler.
struct ScriptedRegistry {
    defs: Vec<ToolDefinition>,
    handler: Handler,
    calls: Mutex<Vec<(String, Value)>>,
}

impl ScriptedRegistry {
    fn new(tool_names: &[&str], handler: Handler) -> Self {
        let defs = tool_names
            .iter()
            .map(|name| {
                ToolDefinition::new(
                    *name,
                    format!("{name} tool"),
                    json!({"type": "object", "properties": {}}),
                )
            })
            .collect();
        Self {
            defs,
            handler,
            calls: Mutex::new(Vec::new()),
        }
    }

    fn standard(handler: Handler) -> Self {
        Self::new(
            &["fs_read", "fs_write", "fs_list", "grep_search", "glob_search", "find_definition", "code_stats"],
            handler,
        )
    }

    fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolRegistry for ScriptedRegistry {
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.defs.clone()
    }

    async fn execute(&self, name: &str, input: Value, _ctx: &ToolContext) -> ToolResult {
        self.calls.lock().unwrap().push((name.to_string(), input.clone()));
        (self.handler)(name, &input)
    }
}

fn classify(intent: &str, budget: u32) -> ChatResponse {
    ChatResponse::tool_use(
        "classify-1",
        "set_classification",
        json!({"intent": intent, "budget": budget}),
    )
}

fn quiet_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.summarization_interval = 0;
    config
}

struct Harness {
    engine: AgentEngine,
    tracer: Arc<CollectingTracer>,
    analytics: Arc<CollectingAnalytics>,
    llm: Arc<MockLlmClient>,
    registry: Arc<ScriptedRegistry>,
    store: Arc<MemorySessionStore>,
    _workdir: tempfile::TempDir,
    spec: RunSpec,
}

fn harness(config: EngineConfig, llm: MockLlmClient, registry: ScriptedRegistry, task: &str) -> Harness {
    let tracer = Arc::new(CollectingTracer::new());
    let analytics = Arc::new(CollectingAnalytics::new());
    let llm = Arc::new(llm);
    let registry = Arc::new(registry);
    let store = Arc::new(MemorySessionStore::new());
    let workdir = tempfile::tempdir().unwrap();
    let spec = RunSpec::new("session-1", workdir.path(), task);

    let engine = AgentEngine::new(
        config,
        Arc::clone(&llm) as Arc<dyn agentloop::LlmClient>,
        Arc::clone(&registry) as Arc<dyn ToolRegistry>,
        Arc::clone(&store) as Arc<dyn SessionStore>,
    )
    .with_tracer(Arc::clone(&tracer) as Arc<dyn agentloop::Tracer>)
    .with_analytics(Arc::clone(&analytics) as Arc<dyn agentloop::Analytics>);

    Harness {
        engine,
        tracer,
        analytics,
        llm,
        registry,
        store,
        _workdir: workdir,
        spec,
    }
}

async fn run(h: &Harness) -> TaskResult {
    h.engine.execute(h.spec.clone()).await
}

// --- Scenario: discovery task converges on no result -----------------------

#[tokio::test]
async fn test_discovery_converges_on_no_result() {
    let llm = MockLlmClient::new(vec![
        ChatResponse::tool_use("c1", "grep_search", json!({"pattern": "Foo"})),
        ChatResponse::tool_use("c2", "glob_search", json!({"pattern": "Foo*"})),
        ChatResponse::tool_use("c3", "find_definition", json!({"symbol": "Foo"})),
    ])
    .on_forced_tool("set_classification", classify("discovery", 6));
    let registry = ScriptedRegistry::standard(Box::new(|_, _| ToolResult::success("No matches found")));

    let h = harness(quiet_config(), llm, registry, "Where is class Foo defined?");
    let result = run(&h).await;

    assert!(result.success, "no-result convergence is a successful conclusion");
    assert_eq!(result.iterations, 3);
    assert!(
        result.summary.starts_with("Insufficient evidence found after repeated search attempts"),
        "summary was: {}",
        result.summary
    );
    assert!(result.summary.contains("grep_search (1)"));
    assert!(result.summary.contains("glob_search (1)"));
    assert!(result.summary.contains("find_definition (1)"));
    assert!(result.files_read.is_empty());

    assert!(
        h.tracer
            .events()
            .iter()
            .any(|e| e.kind == TraceKind::StoppingAnalysis && e.data["decision"] == "no_result_conclusion")
    );
}

// --- Scenario: action task completes with a file write ----------------------

#[tokio::test]
async fn test_action_task_creates_file() {
    let llm = MockLlmClient::new(vec![
        ChatResponse::tool_use("c1", "fs_write", json!({"path": "hello.txt", "content": "Hi"})),
        ChatResponse::text("Created hello.txt with the text Hi as requested."),
    ])
    .on_forced_tool("set_classification", classify("action", 10));
    let registry = ScriptedRegistry::standard(Box::new(|name, _| match name {
        "fs_write" => ToolResult::success("Wrote 2 bytes"),
        _ => ToolResult::error("unexpected tool"),
    }));

    let h = harness(quiet_config(), llm, registry, "Create file hello.txt with text Hi");
    let mut rx = h.engine.bus().subscribe();
    let result = run(&h).await;

    assert!(result.success);
    assert_eq!(result.files_created, vec!["hello.txt".to_string()]);
    assert!(result.summary.contains("hello.txt"));
    assert!(result.error.is_none(), "quality gate should pass: {:?}", result.error);
    assert_eq!(h.registry.calls().len(), 1);

    // Event pairing: every tool:end follows a tool:start with the same id,
    // and sequence numbers are strictly monotonic.
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    let mut last_seq = None;
    let mut open_tools: Vec<String> = Vec::new();
    for event in &events {
        if let Some(last) = last_seq {
            assert!(event.seq > last, "seq not monotonic");
        }
        last_seq = Some(event.seq);
        match &event.kind {
            AgentEventKind::ToolStart { tool_call_id, .. } => open_tools.push(tool_call_id.clone()),
            AgentEventKind::ToolEnd { tool_call_id, .. } | AgentEventKind::ToolError { tool_call_id, .. } => {
                assert!(open_tools.contains(tool_call_id), "tool:end without tool:start");
            }
            _ => {}
        }
    }
    assert!(
        events
            .iter()
            .any(|e| matches!(e.kind, AgentEventKind::AgentEnd { success: true, .. }))
    );
}

// --- Scenario: loop detection ------------------------------------------------

#[tokio::test]
async fn test_loop_detection_fails_run() {
    let repeated = || ChatResponse::tool_use("c", "grep_search", json!({"pattern": "FOO"}));
    let llm = MockLlmClient::new(vec![repeated(), repeated(), repeated()])
        .on_forced_tool("set_classification", classify("action", 10));
    let registry = ScriptedRegistry::standard(Box::new(|_, _| ToolResult::success("No matches found")));

    let h = harness(quiet_config(), llm, registry, "grind the same search");
    let result = run(&h).await;

    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("loop_detected"));
    assert_eq!(result.iterations, 3);
    assert!(result.summary.to_lowercase().contains("repeating"));
}

// --- Scenario: forced synthesis at budget end --------------------------------

#[tokio::test]
async fn test_forced_synthesis_at_budget_end() {
    let mut responses: Vec<ChatResponse> = (0..6)
        .map(|i| ChatResponse::tool_use("c", "grep_search", json!({"pattern": format!("stage-{i}")})))
        .collect();
    responses.push(ChatResponse::text("The pipeline builds in three stages: compile, link, package."));

    let llm = MockLlmClient::new(responses).on_forced_tool("set_classification", classify("analysis", 6));
    let registry = ScriptedRegistry::standard(Box::new(|_, _| ToolResult::success("No matches found")));

    let mut config = quiet_config();
    config.escalation_enabled = false;

    let h = harness(config, llm, registry, "Summarize the build pipeline layout");
    let result = run(&h).await;

    assert!(result.success);
    assert_eq!(result.iterations, 6);
    assert!(result.summary.contains("three stages"));

    // The synthesis call carried no tools and tool use disabled
    let synthesis_requests: Vec<_> = h
        .llm
        .requests()
        .into_iter()
        .filter(|r| r.tool_choice == ToolChoice::None)
        .collect();
    assert_eq!(synthesis_requests.len(), 1);
    assert!(synthesis_requests[0].tools.is_empty());

    let forced: Vec<_> = h
        .tracer
        .events()
        .into_iter()
        .filter(|e| e.kind == TraceKind::SynthesisForced)
        .collect();
    assert_eq!(forced.len(), 1);
    assert_eq!(forced[0].data["reason"], "max_iterations");
}

// --- Scenario: tier escalation on stall --------------------------------------

#[tokio::test]
async fn test_tier_escalation_on_stall() {
    let llm = MockLlmClient::new(vec![
        // Small tier: the same search tool over and over, no signal
        ChatResponse::tool_use("c", "grep_search", json!({"pattern": "auth-a"})),
        ChatResponse::tool_use("c", "grep_search", json!({"pattern": "auth-b"})),
        ChatResponse::tool_use("c", "grep_search", json!({"pattern": "auth-c"})),
        // Medium tier retry gets somewhere
        ChatResponse::tool_use("c", "fs_write", json!({"path": "summary.md", "content": "auth layout"})),
        ChatResponse::text("Wrote summary.md describing the auth module layout."),
    ])
    .on_forced_tool("set_classification", classify("analysis", 12));
    let registry = ScriptedRegistry::standard(Box::new(|name, _| match name {
        "fs_write" => ToolResult::success("written"),
        _ => ToolResult::success("No matches found"),
    }));

    let h = harness(quiet_config(), llm, registry, "Summarize the auth module layout");
    let result = run(&h).await;

    assert!(result.success, "medium retry should complete: {:?}", result.error);
    assert_eq!(result.files_created, vec!["summary.md".to_string()]);

    let escalations: Vec<_> = h
        .analytics
        .tracked()
        .into_iter()
        .filter(|(name, _)| name == "tier_escalated")
        .collect();
    assert_eq!(escalations.len(), 1);
    let payload = &escalations[0].1;
    assert_eq!(payload["from_tier"], "small");
    assert_eq!(payload["to_tier"], "medium");
    assert!(
        payload["reason"].as_str().unwrap().contains("repeating same tool calls"),
        "reason was {}",
        payload["reason"]
    );

    let run_completed: Vec<_> = h
        .analytics
        .tracked()
        .into_iter()
        .filter(|(name, _)| name == "run_completed")
        .collect();
    assert_eq!(run_completed[0].1["tier_final"], "medium");
    assert_eq!(run_completed[0].1["escalations"], 1);
}

// --- Scenario: cost-aware tool restriction -----------------------------------

#[tokio::test]
async fn test_cost_aware_restriction() {
    let long_answer = format!(
        "The config loader lives in src/a.rs:12 and is re-exported from src/b.rs:3. {}",
        "It resolves profiles, merges environment overrides and validates the result. ".repeat(4)
    );
    let llm = MockLlmClient::new(vec![
        ChatResponse::tool_use("c", "fs_read", json!({"path": "src/a.rs"})).with_usage(2000, 1500),
        ChatResponse::tool_use("c", "fs_read", json!({"path": "src/b.rs"})).with_usage(2000, 1500),
        ChatResponse::tool_use("c", "fs_read", json!({"path": "src/c.rs"})).with_usage(2000, 1500),
        ChatResponse::text(long_answer.clone()),
    ])
    .on_forced_tool("set_classification", classify("discovery", 12));
    let registry = ScriptedRegistry::standard(Box::new(|_, _| {
        ToolResult::success("fn load() {}\nfn merge() {}\nfn validate() {}")
    }));

    let h = harness(quiet_config(), llm, registry, "Where is the config loader implemented?");
    // Seed a baseline so the token budget is enabled: 5 runs at 10k tokens
    h.store
        .update_kpi_baseline("session-1", &mut |baseline| {
            for _ in 0..5 {
                baseline.observe(&KpiSample {
                    drift_rate: 0.0,
                    evidence_density: 0.8,
                    tool_error_rate: 0.0,
                    tokens_used: 10_000,
                    iteration_utilization: 0.5,
                    quality_score: 0.9,
                });
            }
        })
        .unwrap();

    let result = run(&h).await;
    assert!(result.success);
    assert_eq!(result.summary, long_answer);

    let main_requests: Vec<_> = h
        .llm
        .requests()
        .into_iter()
        .filter(|r| r.tool_choice == ToolChoice::Auto)
        .collect();
    assert_eq!(main_requests.len(), 4);

    let names = |idx: usize| -> Vec<String> { main_requests[idx].tools.iter().map(|t| t.name.clone()).collect() };
    assert!(names(0).contains(&"grep_search".to_string()));
    let restricted = names(3);
    for banned in ["glob_search", "grep_search", "fs_list", "find_definition", "code_stats"] {
        assert!(!restricted.contains(&banned.to_string()), "{banned} should be filtered");
    }
    assert!(restricted.contains(&"fs_read".to_string()));

    let filters: Vec<_> = h
        .tracer
        .events()
        .into_iter()
        .filter(|e| e.kind == TraceKind::ToolFilter)
        .collect();
    assert!(!filters.is_empty());
    assert_eq!(filters[0].data["reason"], "custom");
}

// --- Stop and sub-agent surface ----------------------------------------------

#[tokio::test]
async fn test_stop_before_loop_makes_no_llm_calls() {
    let llm = MockLlmClient::new(vec![ChatResponse::text("should never be used")]);
    let registry = ScriptedRegistry::standard(Box::new(|_, _| ToolResult::success("")));

    let h = harness(quiet_config(), llm, registry, "anything");
    h.engine.request_stop();
    let result = run(&h).await;

    assert!(!result.success);
    assert_eq!(result.summary, "Stopped by user after 0 iteration(s)");
    assert_eq!(h.llm.call_count(), 0);
    assert!(h.registry.calls().is_empty());
}

#[tokio::test]
async fn test_child_run_never_sees_spawn_agent() {
    let llm = MockLlmClient::new(vec![ChatResponse::text("child done")]);
    let registry = ScriptedRegistry::new(&["fs_read", "spawn_agent"], Box::new(|_, _| ToolResult::success("")));

    let mut h = harness(quiet_config(), llm, registry, "parent task");
    h.spec = h.spec.child("child task", h.spec.working_dir.clone());
    let _ = run(&h).await;

    let main_requests: Vec<_> = h
        .llm
        .requests()
        .into_iter()
        .filter(|r| r.tool_choice == ToolChoice::Auto)
        .collect();
    assert!(!main_requests.is_empty());
    let names: Vec<String> = main_requests[0].tools.iter().map(|t| t.name.clone()).collect();
    assert!(!names.contains(&"spawn_agent".to_string()));
    assert!(names.contains(&"report".to_string()));
    assert!(names.contains(&"fs_read".to_string()));
}

#[tokio::test]
async fn test_budget_clamps_oversized_classifier_budget() {
    // Classifier asks for 999 iterations; the model answers immediately, so
    // only the clamp is observable through the run_completed KPI payload.
    let llm = MockLlmClient::new(vec![ChatResponse::text(
        "Nothing to do here; the workspace already matches the request.",
    )])
    .on_forced_tool("set_classification", classify("analysis", 999));
    let registry = ScriptedRegistry::standard(Box::new(|_, _| ToolResult::success("")));

    let h = harness(quiet_config(), llm, registry, "confirm the workspace state");
    let _ = run(&h).await;

    let run_completed: Vec<_> = h
        .analytics
        .tracked()
        .into_iter()
        .filter(|(name, _)| name == "run_completed")
        .collect();
    assert_eq!(run_completed[0].1["iteration_budget"], 20);
}
