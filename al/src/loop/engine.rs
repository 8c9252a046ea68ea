//! AgentEngine - the iteration loop orchestrator
//!
//! Owns every piece of per-run state and composes the collaborators:
//! classifier, budget controller, progress and search trackers, two-tier
//! memory, context builder, reflection engine, quality gate, validator and
//! KPI emitter. Control flow per iteration: build lean context -> LLM with
//! tools -> (terminate or) execute tool calls -> update trackers and memory
//! -> check convergence and escalation -> loop.

use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use sessionstore::{ConversationRecord, SessionEvent, SessionStore};

use crate::config::EngineConfig;
use crate::domain::{self, ExecutionPhase, Intent, PhaseTracker, RunSpec, TaskLedger, TaskResult};
use crate::events::{
    AgentEventKind, Analytics, EventBus, EventEmitter, NullAnalytics, NullTracer, TraceKind, TraceLog, Tracer,
};
use crate::llm::{
    ChatRequest, ChatResponse, ContentBlock, LlmClient, Message, Role, Tier, ToolChoice, ToolDefinition,
};
use crate::memory::{Archive, FactSheet, LongTermMemory, extract_facts, spawn_summarization};
use crate::progress::{
    ProgressInputs, ProgressTracker, SearchSignalTracker, assess_with_llm, heuristic_classify, looks_like_discovery,
};
use crate::prompts;
use crate::tools::{
    AgentSpawner, BROAD_DISCOVERY_TOOLS, FileChange, FileChangeTracker, ReadWindowPlanner, SEARCH_TOOLS, ToolContext,
    ToolGuard, ToolRegistry, normalize_input,
};

use super::budget::BudgetController;
use super::classify::{Classification, classify_task};
use super::context::{ContextBuilder, ContextInputs};
use super::escalate::{AuxContext, AuxNode, EscalationInputs, EscalationSignal, choose_smart_tier, evaluate_escalation_need};
use super::metrics::RunKpis;
use super::quality::{self, QualityInputs, QualityStatus};
use super::reflect::{ReflectionEngine, ReflectionTrigger};
use super::todo::TodoCoordinator;
use super::validate::{self, ValidationInputs};

/// Loop-detector ring length; a loop needs the last three signatures equal.
const SIGNATURE_RING: usize = 6;
const LOOP_RUN: usize = 3;

/// Callback seam to a parent agent, present on sub-agents only.
#[async_trait]
pub trait ParentLink: Send + Sync {
    /// Relay a question from the child; the answer goes back as a tool result.
    async fn ask(&self, agent_id: &str, question: &str) -> eyre::Result<String>;

    /// Notify the parent that the child has stopped making progress.
    async fn notify_stuck(&self, agent_id: &str, reason: &str);
}

/// How one tier attempt ended.
enum TierOutcome {
    Done(TaskResult),
    /// Retry at the next tier; token usage carries over.
    Escalate { signal: EscalationSignal, tokens_used: u64 },
}

/// Everything the finalizer needs from a run attempt.
struct RunStats {
    iterations_used: u32,
    iteration_budget: u32,
    token_budget: u64,
    tokens_used: u64,
    tool_calls_total: u32,
    tool_error_count: u32,
    touched_domains: BTreeSet<String>,
    files_read: BTreeSet<String>,
    files_modified: BTreeSet<String>,
    files_created: BTreeSet<String>,
    search_signal_hits: u32,
    todo_calls: u32,
    failed_steps: usize,
    pending_steps: usize,
    hypothesis_switches: u32,
    budget_extensions: u32,
    no_result_concluded: bool,
}

impl RunStats {
    fn quality_inputs(&self, task: &str) -> QualityInputs {
        QualityInputs {
            iterations_used: self.iterations_used,
            tool_calls_total: self.tool_calls_total,
            tool_error_count: self.tool_error_count,
            touched_domains: self.touched_domains.len(),
            files_read: self.files_read.len(),
            files_modified: self.files_modified.len(),
            files_created: self.files_created.len(),
            search_signal_hits: self.search_signal_hits,
            task_multi_step: quality::looks_multi_step(task),
            todo_calls: self.todo_calls,
            failed_ledger_steps: self.failed_steps,
            pending_ledger_steps: self.pending_steps,
        }
    }
}

/// The execution engine. One instance drives one run at a time; `execute`
/// owns all run state.
pub struct AgentEngine {
    config: EngineConfig,
    llm: Arc<dyn LlmClient>,
    registry: Arc<dyn ToolRegistry>,
    store: Arc<dyn SessionStore>,
    bus: Arc<EventBus>,
    tracer: Arc<dyn Tracer>,
    analytics: Arc<dyn Analytics>,
    spawner: Option<Arc<dyn AgentSpawner>>,
    parent: Option<Arc<dyn ParentLink>>,
    file_changes: Option<Arc<dyn FileChangeTracker>>,
    long_term: Option<Arc<dyn LongTermMemory>>,
    stop: Arc<AtomicBool>,
    feedback: Arc<std::sync::Mutex<Vec<String>>>,
}

impl AgentEngine {
    pub fn new(
        config: EngineConfig,
        llm: Arc<dyn LlmClient>,
        registry: Arc<dyn ToolRegistry>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            config,
            llm,
            registry,
            store,
            bus: Arc::new(EventBus::with_default_capacity()),
            tracer: Arc::new(NullTracer),
            analytics: Arc::new(NullAnalytics),
            spawner: None,
            parent: None,
            file_changes: None,
            long_term: None,
            stop: Arc::new(AtomicBool::new(false)),
            feedback: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = bus;
        self
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn with_analytics(mut self, analytics: Arc<dyn Analytics>) -> Self {
        self.analytics = analytics;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn AgentSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    pub fn with_parent(mut self, parent: Arc<dyn ParentLink>) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_file_changes(mut self, tracker: Arc<dyn FileChangeTracker>) -> Self {
        self.file_changes = Some(tracker);
        self
    }

    pub fn with_long_term_memory(mut self, memory: Arc<dyn LongTermMemory>) -> Self {
        self.long_term = Some(memory);
        self
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Cooperative stop: idempotent, checked between iterations. A running
    /// tool call is never interrupted.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// Queue user feedback; it lands in the next context build as a
    /// prominent user message.
    pub fn inject_feedback(&self, text: impl Into<String>) {
        self.feedback.lock().expect("feedback queue poisoned").push(text.into());
    }

    /// Run one task to completion.
    pub async fn execute(&self, mut spec: RunSpec) -> TaskResult {
        let seq = Arc::new(AtomicU64::new(0));
        let trace = Arc::new(TraceLog::new(Arc::clone(&seq), Arc::clone(&self.tracer)));
        let emitter = self
            .bus
            .emitter_for(spec.agent_id.clone(), spec.parent_agent_id.clone(), seq);
        let run_started = Utc::now();

        emitter.emit(AgentEventKind::AgentStart {
            task: spec.task.clone(),
            tier: spec.tier,
            started_at: run_started,
        });
        trace.record(
            TraceKind::TaskStart,
            json!({"agent_id": spec.agent_id, "task": spec.task, "tier": spec.tier.as_str()}),
        );

        // A stop that lands before the loop still means no further LLM call
        if self.stop.load(Ordering::SeqCst) {
            emitter.emit(AgentEventKind::AgentEnd {
                stopped: true,
                success: false,
                iterations: 0,
                started_at: run_started,
            });
            let mut result = TaskResult::failure("stopped", "Stopped by user after 0 iteration(s)", 0);
            result.trace = trace.collected();
            return result;
        }

        // 1. Classify on the small tier
        emitter.status(ExecutionPhase::Scoping.as_str(), "classifying task");
        let aux_ctx = AuxContext {
            task: &spec.task,
            ..Default::default()
        };
        let classify_model = self
            .config
            .tiers
            .model_for(choose_smart_tier(AuxNode::IntentInference, &aux_ctx))
            .to_string();
        let classification = classify_task(self.llm.as_ref(), &classify_model, &spec.task).await;
        info!(intent = classification.intent.as_str(), budget = ?classification.budget, "task classified");

        // 2. Workspace discovery
        let workspace_map = discover_workspace(&spec.working_dir);

        // 3. Scope narrowing: main agent only, applied exactly once, before
        //    the system prompt is built and before the loop.
        if spec.is_main()
            && let Some(narrowed) = self.narrow_scope(&spec).await
        {
            emitter.status("scope_narrowed", narrowed.display().to_string());
            spec.working_dir = narrowed;
        }

        let mut tier = spec.tier;
        let mut escalations: Vec<(Tier, Tier)> = Vec::new();
        let mut tokens_before = 0u64;

        loop {
            let attempt = self
                .run_at_tier(
                    &spec,
                    tier,
                    classification,
                    &workspace_map,
                    &emitter,
                    &trace,
                    &escalations,
                    tokens_before,
                    run_started,
                )
                .await;

            match attempt {
                TierOutcome::Done(result) => return result,
                TierOutcome::Escalate { signal, tokens_used } => {
                    let Some(next) = tier.next_up() else {
                        // evaluate_escalation_need never fires at the top tier;
                        // this arm only covers transient errors on large.
                        let result = TaskResult::failure(
                            "llm_error",
                            format!("Provider error at the top tier: {}", signal.reason),
                            signal.iteration,
                        );
                        emitter.emit(AgentEventKind::AgentError {
                            message: signal.reason.clone(),
                        });
                        emitter.emit(AgentEventKind::AgentEnd {
                            stopped: false,
                            success: false,
                            iterations: signal.iteration,
                            started_at: run_started,
                        });
                        return result;
                    };

                    tokens_before = tokens_used;
                    warn!(from = %tier, to = %next, reason = %signal.reason, "escalating tier");
                    self.analytics.track(
                        "tier_escalated",
                        json!({
                            "agent_id": spec.agent_id,
                            "from_tier": tier.as_str(),
                            "to_tier": next.as_str(),
                            "reason": signal.reason,
                            "iteration": signal.iteration,
                        }),
                    );
                    trace.record(
                        TraceKind::StoppingAnalysis,
                        json!({"decision": "escalate", "reason": signal.reason, "iteration": signal.iteration}),
                    );
                    emitter.status("tier_escalated", format!("{} -> {}", tier.as_str(), next.as_str()));
                    escalations.push((tier, next));
                    tier = next;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_at_tier(
        &self,
        spec: &RunSpec,
        tier: Tier,
        classification: Classification,
        workspace_map: &str,
        emitter: &EventEmitter,
        trace: &Arc<TraceLog>,
        escalations: &[(Tier, Tier)],
        tokens_before: u64,
        run_started: chrono::DateTime<Utc>,
    ) -> TierOutcome {
        let config = &self.config;
        let intent = classification.intent;
        let informational = intent != Intent::Action;

        // Budgets
        let mut budget_ctl = BudgetController::new(
            config.max_iterations,
            config.fallback_budget,
            config.budget_extension_step,
            config.extension_warn_after,
        );
        let mut budget = budget_ctl.initial_iteration_budget(classification.budget);
        let token_budget = {
            let tokens = self
                .store
                .kpi_baseline(&spec.session_id)
                .ok()
                .flatten()
                .map(|b| b.quality_filtered_tokens(config.token_budget_min_quality))
                .unwrap_or_default();
            budget_ctl.token_budget(&tokens, config.token_budget_min_samples)
        };
        info!(budget, token_budget, tier = %tier, "starting iteration loop");

        // Two-tier memory and collaborators
        let fact_sheet = Arc::new(Mutex::new(FactSheet::new(&config.fact_sheet)));
        let archive = Arc::new(Mutex::new(Archive::new(&config.archive)));
        let summary_blocks = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
        let mut tracker = ProgressTracker::new(config.stuck_threshold);
        let mut search = SearchSignalTracker::new();
        let mut ledger = TaskLedger::new();
        let mut todo = TodoCoordinator::new();
        let mut reflection = ReflectionEngine::new();
        let mut planner = ReadWindowPlanner::new();
        let guard = ToolGuard::new(config.guard.clone());
        let mut context_builder = ContextBuilder::new(config.sliding_window_size);
        let mut phase = PhaseTracker::new();

        let mut tool_ctx = ToolContext::new(
            spec.working_dir.clone(),
            spec.session_id.clone(),
            spec.agent_id.clone(),
            Arc::clone(&archive),
        );
        if spec.is_main()
            && let Some(spawner) = &self.spawner
        {
            tool_ctx = tool_ctx.with_spawner(Arc::clone(spawner));
        }
        if let Some(file_changes) = &self.file_changes {
            tool_ctx = tool_ctx.with_file_changes(Arc::clone(file_changes));
        }

        // Seed messages: system prompt, progressively summarized prior
        // history, current task (the context builder re-adds the task on
        // every build).
        let artifacts = self.store.trace_artifacts_context(&spec.session_id).unwrap_or_default();
        let mut base_system = prompts::render_system_prompt(&spec.working_dir, &artifacts);
        if let Some(memory) = &self.long_term {
            match memory.context(&spec.session_id, &spec.task).await {
                Ok(context) if !context.trim().is_empty() => {
                    base_system.push_str("\n\n## Long-term memory\n");
                    base_system.push_str(&context);
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "long-term memory lookup failed"),
            }
        }
        let mut full_history: Vec<Message> = Vec::new();
        if let Ok(history) = self.store.conversation_history(&spec.session_id) {
            if !history.mid_term.is_empty() || !history.old.is_empty() {
                let mut brief = String::from("Context from earlier in this session:\n");
                for line in history.old.iter().chain(history.mid_term.iter()) {
                    brief.push_str(&format!("- {line}\n"));
                }
                full_history.push(Message::user(brief));
            }
            for record in history.recent {
                full_history.push(match record.role.as_str() {
                    "assistant" => Message::assistant(record.content),
                    _ => Message::user(record.content),
                });
            }
        }

        // Run counters
        let mut files_read: BTreeSet<String> = BTreeSet::new();
        let mut files_modified: BTreeSet<String> = BTreeSet::new();
        let mut files_created: BTreeSet<String> = BTreeSet::new();
        let mut touched_domains: BTreeSet<String> = BTreeSet::new();
        let mut tool_calls_total = 0u32;
        let mut tool_error_count = 0u32;
        let mut tokens_used = tokens_before;
        let mut signatures: VecDeque<String> = VecDeque::with_capacity(SIGNATURE_RING);
        let mut summarizer: Option<JoinHandle<()>> = None;
        let no_result_concluded = false;

        phase.transition(ExecutionPhase::Executing);
        emitter.status(ExecutionPhase::Executing.as_str(), format!("budget {budget}"));

        let mut i = 0u32;
        loop {
            i += 1;
            if i > budget {
                break;
            }

            // Cooperative stop, checked between iterations only
            if self.stop.load(Ordering::SeqCst) {
                let completed = i - 1;
                let stats = RunStats {
                    iterations_used: completed,
                    iteration_budget: budget,
                    token_budget,
                    tokens_used,
                    tool_calls_total,
                    tool_error_count,
                    touched_domains,
                    files_read,
                    files_modified,
                    files_created,
                    search_signal_hits: search.hits(),
                    todo_calls: todo.calls(),
                    failed_steps: ledger.failed_count(),
                    pending_steps: ledger.pending_count(),
                    hypothesis_switches: reflection.hypothesis_switches(),
                    budget_extensions: budget_ctl.extensions_granted(),
                    no_result_concluded,
                };
                return TierOutcome::Done(
                    self.finalize(
                        spec,
                        tier,
                        classification,
                        stats,
                        FinalKind::Stopped,
                        format!("Stopped by user after {completed} iteration(s)"),
                        emitter,
                        trace,
                        &archive,
                        &fact_sheet,
                        escalations,
                        run_started,
                    )
                    .await,
                );
            }

            let iter_started = Utc::now();
            let iter_timer = Instant::now();
            emitter.emit(AgentEventKind::IterationStart {
                iteration: i,
                started_at: iter_started,
            });

            // Lean context
            let fact_render = fact_sheet.lock().await.render();
            let archive_hint = archive.lock().await.summary();
            let feedback: Vec<String> = self.feedback.lock().expect("feedback queue poisoned").drain(..).collect();
            let blocks_snapshot = summary_blocks.lock().expect("summary sink poisoned").clone();
            let built = context_builder.build(
                ContextInputs {
                    base_system: &base_system,
                    workspace_map,
                    fact_sheet: &fact_render,
                    archive_hint: &archive_hint,
                    task: &spec.task,
                    full_history: &full_history,
                    summary_blocks: &blocks_snapshot,
                    feedback,
                    iteration: i,
                },
                trace,
            );

            // Advertised tool set, with cost-aware restriction
            let mut tools = self.advertised_tools(spec);
            let stats_now = QualityInputs {
                iterations_used: i,
                tool_calls_total,
                tool_error_count,
                touched_domains: touched_domains.len(),
                files_read: files_read.len(),
                files_modified: files_modified.len(),
                files_created: files_created.len(),
                search_signal_hits: search.hits(),
                ..Default::default()
            };
            if token_budget > 0
                && tokens_used as f64 >= config.cost_aware_token_threshold * token_budget as f64
                && i >= 4u32.max((0.4 * budget as f64) as u32)
                && informational
                && quality::has_strong_evidence_signal(&stats_now)
            {
                let before: Vec<String> = tools.iter().map(|t| t.name.clone()).collect();
                tools.retain(|t| !BROAD_DISCOVERY_TOOLS.contains(&t.name.as_str()));
                let filtered: Vec<String> = before
                    .into_iter()
                    .filter(|n| BROAD_DISCOVERY_TOOLS.contains(&n.as_str()))
                    .collect();
                if !filtered.is_empty() {
                    trace.record(
                        TraceKind::ToolFilter,
                        json!({"iteration": i, "filtered": filtered, "reason": "custom"}),
                    );
                }
            }

            // LLM call
            let model = config.tiers.model_for(tier).to_string();
            emitter.emit(AgentEventKind::LlmStart {
                iteration: i,
                model: model.clone(),
                started_at: iter_started,
            });
            trace.record(
                TraceKind::LlmCall,
                json!({"iteration": i, "model": model, "messages": built.messages.len(), "tools": tools.len()}),
            );
            let request = ChatRequest {
                model: model.clone(),
                system_prompt: built.system_prompt,
                messages: built.messages,
                tools,
                tool_choice: ToolChoice::Auto,
                max_tokens: config.llm_max_tokens,
                temperature: None,
            };
            let response = match self.llm.chat(request).await {
                Ok(response) => response,
                Err(e) => {
                    if e.is_retryable() && tier != Tier::Large {
                        return TierOutcome::Escalate {
                            signal: EscalationSignal {
                                reason: format!("transient provider error: {e}"),
                                iteration: i,
                            },
                            tokens_used,
                        };
                    }
                    trace.record(TraceKind::ErrorCaptured, json!({"iteration": i, "error": e.to_string()}));
                    emitter.emit(AgentEventKind::AgentError { message: e.to_string() });
                    let stats = RunStats {
                        iterations_used: i,
                        iteration_budget: budget,
                        token_budget,
                        tokens_used,
                        tool_calls_total,
                        tool_error_count,
                        touched_domains,
                        files_read,
                        files_modified,
                        files_created,
                        search_signal_hits: search.hits(),
                        todo_calls: todo.calls(),
                        failed_steps: ledger.failed_count(),
                        pending_steps: ledger.pending_count(),
                        hypothesis_switches: reflection.hypothesis_switches(),
                        budget_extensions: budget_ctl.extensions_granted(),
                        no_result_concluded,
                    };
                    return TierOutcome::Done(
                        self.finalize(
                            spec,
                            tier,
                            classification,
                            stats,
                            FinalKind::Fatal("llm_error".to_string()),
                            format!("Provider error: {e}"),
                            emitter,
                            trace,
                            &archive,
                            &fact_sheet,
                            escalations,
                            run_started,
                        )
                        .await,
                    );
                }
            };
            tokens_used += response.usage.total();
            emitter.emit(AgentEventKind::LlmEnd {
                iteration: i,
                model,
                started_at: iter_started,
                duration_ms: iter_timer.elapsed().as_millis() as u64,
                input_tokens: response.usage.input_tokens,
                output_tokens: response.usage.output_tokens,
            });

            // Natural stop: no tool calls means the model is answering
            if response.tool_calls.is_empty() {
                let content = response.content.clone().unwrap_or_default();
                full_history.push(Message::assistant(content.clone()));
                emitter.emit(AgentEventKind::IterationEnd {
                    iteration: i,
                    started_at: iter_started,
                    duration_ms: iter_timer.elapsed().as_millis() as u64,
                    tool_calls: 0,
                });

                phase.transition(ExecutionPhase::Verifying);
                emitter.status(ExecutionPhase::Verifying.as_str(), "validating final answer");
                let outcome = self
                    .validate_completion(
                        spec,
                        intent,
                        &content,
                        i,
                        budget,
                        &search,
                        no_result_concluded,
                        &files_read,
                        &files_modified,
                        &files_created,
                        &archive,
                        trace,
                    )
                    .await;

                let stats = RunStats {
                    iterations_used: i,
                    iteration_budget: budget,
                    token_budget,
                    tokens_used,
                    tool_calls_total,
                    tool_error_count,
                    touched_domains,
                    files_read,
                    files_modified,
                    files_created,
                    search_signal_hits: search.hits(),
                    todo_calls: todo.calls(),
                    failed_steps: ledger.failed_count(),
                    pending_steps: ledger.pending_count(),
                    hypothesis_switches: reflection.hypothesis_switches(),
                    budget_extensions: budget_ctl.extensions_granted(),
                    no_result_concluded,
                };
                let kind = if outcome.success {
                    FinalKind::Success
                } else {
                    FinalKind::Unvalidated
                };
                return TierOutcome::Done(
                    self.finalize(
                        spec,
                        tier,
                        classification,
                        stats,
                        kind,
                        outcome.summary,
                        emitter,
                        trace,
                        &archive,
                        &fact_sheet,
                        escalations,
                        run_started,
                    )
                    .await,
                );
            }

            // Tool execution, strictly in emission order
            full_history.push(assistant_message(&response));
            let evidence_before = files_read.len() + files_modified.len() + files_created.len();
            let mut result_blocks: Vec<ContentBlock> = Vec::new();
            let mut failed_this_iteration = 0u32;
            let mut iteration_output_size = 0usize;
            let mut last_tool_name = String::new();
            let mut search_previews: Vec<String> = Vec::new();
            let mut search_tools_used: Vec<&'static str> = Vec::new();
            let mut terminal_report: Option<String> = None;
            let mut force_reflection = false;

            for call in &response.tool_calls {
                tool_calls_total += 1;
                last_tool_name = call.name.clone();
                todo.record_call(&call.name);

                // Engine-intercepted tools
                match call.name.as_str() {
                    "report" => {
                        let step = ledger.open("final report", "report");
                        ledger.complete(step, None);
                        terminal_report = Some(
                            call.input
                                .get("summary")
                                .and_then(Value::as_str)
                                .unwrap_or("")
                                .to_string(),
                        );
                        result_blocks.push(ContentBlock::tool_result(&call.id, "Report received.", false));
                        continue;
                    }
                    "reflect_on_progress" => {
                        let step = ledger.open("requested reflection", "reflect_on_progress");
                        ledger.complete(step, None);
                        force_reflection = true;
                        result_blocks.push(ContentBlock::tool_result(&call.id, "Reflection scheduled.", false));
                        continue;
                    }
                    "ask_parent" => {
                        let step = ledger.open("question to parent", "ask_parent");
                        let question = call.input.get("question").and_then(Value::as_str).unwrap_or("");
                        match &self.parent {
                            Some(parent) => match parent.ask(&spec.agent_id, question).await {
                                Ok(answer) => {
                                    ledger.complete(step, None);
                                    result_blocks.push(ContentBlock::tool_result(&call.id, answer, false));
                                }
                                Err(e) => {
                                    ledger.fail(step, e.to_string());
                                    tool_error_count += 1;
                                    failed_this_iteration += 1;
                                    result_blocks.push(ContentBlock::tool_result(
                                        &call.id,
                                        format!("Parent unavailable: {e}"),
                                        true,
                                    ));
                                }
                            },
                            None => {
                                ledger.complete(step, Some("no parent".to_string()));
                                result_blocks.push(ContentBlock::tool_result(
                                    &call.id,
                                    "This agent has no parent to ask.",
                                    true,
                                ));
                            }
                        }
                        continue;
                    }
                    "spawn_agent" => {
                        let outcome = self
                            .spawn_subagent(spec, call, &tool_ctx, &mut ledger, emitter)
                            .await;
                        if let Some((content, is_error)) = outcome {
                            if is_error {
                                tool_error_count += 1;
                                failed_this_iteration += 1;
                            }
                            result_blocks.push(ContentBlock::tool_result(&call.id, content, is_error));
                        }
                        continue;
                    }
                    _ => {}
                }

                // Normalize, then guard
                let normalized = normalize_input(&call.name, call.input.clone(), &tool_ctx.working_dir, tier, &planner);
                if let Err(guard_err) = guard.check(&call.name, &normalized.input, &spec.task, &planner) {
                    let step = ledger.open(goal_of(&call.name, &normalized.input), &call.name);
                    ledger.complete(step, Some(format!("guard: {guard_err}")));
                    trace.record(
                        TraceKind::ToolExecution,
                        json!({"iteration": i, "tool": call.name, "guarded": true, "hint": guard_err.hint()}),
                    );
                    result_blocks.push(ContentBlock::tool_result(
                        &call.id,
                        format!("Not executed. {}", guard_err.hint()),
                        false,
                    ));
                    continue;
                }

                if call.name == "fs_read"
                    && let Some(path) = normalized.input.get("path").and_then(Value::as_str)
                {
                    planner.record_attempt(path);
                    if guard.is_small_window(&normalized.input) {
                        planner.record_small_window(path);
                    }
                }

                // fs_write created-vs-modified is decided before dispatch
                let write_creates = call.name == "fs_write"
                    && normalized
                        .input
                        .get("path")
                        .and_then(Value::as_str)
                        .map(|p| !resolve_path(&tool_ctx.working_dir, p).exists())
                        .unwrap_or(false);

                let step = ledger.open(goal_of(&call.name, &normalized.input), &call.name);
                let tool_started = Utc::now();
                let tool_timer = Instant::now();
                emitter.emit(AgentEventKind::ToolStart {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    iteration: i,
                    started_at: tool_started,
                });

                let result = self.registry.execute(&call.name, normalized.input.clone(), &tool_ctx).await;
                let duration_ms = tool_timer.elapsed().as_millis() as u64;

                if result.success {
                    ledger.complete(step, None);
                    emitter.emit(AgentEventKind::ToolEnd {
                        tool_call_id: call.id.clone(),
                        tool_name: call.name.clone(),
                        iteration: i,
                        started_at: tool_started,
                        duration_ms,
                        success: true,
                    });
                } else {
                    tool_error_count += 1;
                    failed_this_iteration += 1;
                    ledger.fail(step, result.error.clone().unwrap_or_default());
                    emitter.emit(AgentEventKind::ToolError {
                        tool_call_id: call.id.clone(),
                        tool_name: call.name.clone(),
                        iteration: i,
                        started_at: tool_started,
                        duration_ms,
                        error: result.error.clone().unwrap_or_default(),
                    });
                }
                trace.record(
                    TraceKind::ToolExecution,
                    json!({
                        "iteration": i,
                        "tool": call.name,
                        "success": result.success,
                        "duration_ms": duration_ms,
                        "output_chars": result.content().len(),
                    }),
                );

                // File and domain tracking
                let path_arg = primary_path(&normalized.input);
                if let Some(path) = &path_arg {
                    if let Some(domain) = top_level_domain(path) {
                        touched_domains.insert(domain);
                    }
                    if result.success {
                        let change = match call.name.as_str() {
                            "fs_read" => {
                                files_read.insert(path.clone());
                                Some(FileChange::Read)
                            }
                            "fs_write" if write_creates => {
                                files_created.insert(path.clone());
                                Some(FileChange::Created)
                            }
                            "fs_write" | "fs_edit" => {
                                files_modified.insert(path.clone());
                                Some(FileChange::Modified)
                            }
                            _ => None,
                        };
                        if let (Some(change), Some(tracker_ref)) = (change, &self.file_changes) {
                            tracker_ref.on_file_event(&spec.agent_id, &spec.session_id, path, change);
                        }
                    }
                    // Learn file sizes when the tool reports them
                    if let Some(total) = result
                        .metadata
                        .as_ref()
                        .and_then(|m| m.get("total_lines"))
                        .and_then(Value::as_u64)
                    {
                        planner.learn_total_lines(path, total as u32);
                    }
                }

                // Cold memory gets the full output, the conversation a
                // truncated view
                let output_text = result.content().to_string();
                iteration_output_size += output_text.len();
                let store_outcome = archive.lock().await.store(
                    i,
                    call.name.clone(),
                    normalized.input.clone(),
                    output_text.clone(),
                    path_arg.clone(),
                    Vec::new(),
                );
                trace.record(
                    TraceKind::ArchiveStore,
                    json!({"iteration": i, "id": store_outcome.id, "evicted": store_outcome.evicted}),
                );

                if result.success {
                    for fact in extract_facts(&call.name, &normalized.input, &output_text, i) {
                        if fact.confidence < config.auto_fact_min_confidence {
                            continue;
                        }
                        let outcome = fact_sheet.lock().await.add_fact(fact.clone());
                        trace.record(
                            TraceKind::FactAdded,
                            json!({
                                "id": outcome.id,
                                "merged": outcome.merged,
                                "category": fact.category,
                                "source": "heuristic",
                            }),
                        );
                    }
                }

                if let Some(tool) = SEARCH_TOOLS.iter().find(|t| **t == call.name) {
                    search_tools_used.push(tool);
                    search_previews.push(output_text.chars().take(crate::progress::PREVIEW_CHARS).collect());
                }

                let mut content_for_model = truncate_for_model(&output_text, config.max_tool_output_chars);
                for note in &normalized.notes {
                    content_for_model = format!("{note}\n{content_for_model}");
                }
                result_blocks.push(ContentBlock::tool_result(&call.id, content_for_model, !result.success));
            }

            full_history.push(Message::blocks(Role::User, result_blocks));
            emitter.emit(AgentEventKind::IterationEnd {
                iteration: i,
                started_at: iter_started,
                duration_ms: iter_timer.elapsed().as_millis() as u64,
                tool_calls: response.tool_calls.len(),
            });

            // Explicit report ends the run
            if let Some(summary) = terminal_report {
                phase.transition(ExecutionPhase::Reporting);
                emitter.status(ExecutionPhase::Reporting.as_str(), "model reported completion");
                let stats = RunStats {
                    iterations_used: i,
                    iteration_budget: budget,
                    token_budget,
                    tokens_used,
                    tool_calls_total,
                    tool_error_count,
                    touched_domains,
                    files_read,
                    files_modified,
                    files_created,
                    search_signal_hits: search.hits(),
                    todo_calls: todo.calls(),
                    failed_steps: ledger.failed_count(),
                    pending_steps: ledger.pending_count(),
                    hypothesis_switches: reflection.hypothesis_switches(),
                    budget_extensions: budget_ctl.extensions_granted(),
                    no_result_concluded,
                };
                return TierOutcome::Done(
                    self.finalize(
                        spec,
                        tier,
                        classification,
                        stats,
                        FinalKind::Success,
                        summary,
                        emitter,
                        trace,
                        &archive,
                        &fact_sheet,
                        escalations,
                        run_started,
                    )
                    .await,
                );
            }

            // Search signal assessment
            if !search_previews.is_empty() {
                search.record_attempts(&search_tools_used);
                let aux = AuxContext {
                    task: &spec.task,
                    iteration: i,
                    budget,
                    iterations_since_progress: tracker.iterations_since_progress(),
                    artifact_count: files_read.len() + files_modified.len() + files_created.len(),
                    evidence_density: stats_now.evidence_density(),
                    informational,
                };
                let assess_model = config
                    .tiers
                    .model_for(choose_smart_tier(AuxNode::SearchAssessment, &aux))
                    .to_string();
                let assessment =
                    match assess_with_llm(self.llm.as_ref(), &assess_model, &spec.task, &search_previews).await {
                        Ok(assessment) => assessment,
                        Err(e) => {
                            debug!(error = %e, "search assessment fell back to heuristic");
                            heuristic_classify(&search_previews)
                        }
                    };
                search.apply(&assessment, i);
            }

            // Progress update
            let evidence_after = files_read.len() + files_modified.len() + files_created.len();
            tracker.update(
                &last_tool_name,
                iteration_output_size,
                &ProgressInputs {
                    iteration: i,
                    evidence_delta: (evidence_after - evidence_before) as u32,
                    failed_tools_this_iteration: failed_this_iteration,
                    search_signal_hits: search.hits(),
                },
            );
            trace.record(
                TraceKind::IterationDetail,
                json!({
                    "iteration": i,
                    "tool_calls": response.tool_calls.len(),
                    "failed": failed_this_iteration,
                    "output_chars": iteration_output_size,
                    "since_progress": tracker.iterations_since_progress(),
                    "tokens_used": tokens_used,
                }),
            );

            // Loop detection: three identical signatures in a row
            push_signature(&mut signatures, loop_signature(&response.tool_calls));
            if detect_loop(&signatures) {
                trace.record(
                    TraceKind::StoppingAnalysis,
                    json!({"decision": "loop_detected", "iteration": i}),
                );
                let stats = RunStats {
                    iterations_used: i,
                    iteration_budget: budget,
                    token_budget,
                    tokens_used,
                    tool_calls_total,
                    tool_error_count,
                    touched_domains,
                    files_read,
                    files_modified,
                    files_created,
                    search_signal_hits: search.hits(),
                    todo_calls: todo.calls(),
                    failed_steps: ledger.failed_count(),
                    pending_steps: ledger.pending_count(),
                    hypothesis_switches: reflection.hypothesis_switches(),
                    budget_extensions: budget_ctl.extensions_granted(),
                    no_result_concluded,
                };
                return TierOutcome::Done(
                    self.finalize(
                        spec,
                        tier,
                        classification,
                        stats,
                        FinalKind::Fatal("loop_detected".to_string()),
                        "Stopped: the run kept repeating the same actions without producing new results.".to_string(),
                        emitter,
                        trace,
                        &archive,
                        &fact_sheet,
                        escalations,
                        run_started,
                    )
                    .await,
                );
            }

            // No-result convergence
            let evidence_count = files_read.len() + files_modified.len() + files_created.len();
            if search.should_conclude_no_result(
                intent,
                &spec.task,
                i,
                tier,
                evidence_count,
                config.min_iterations_before_conclusion,
                &config.no_signal_limits,
            ) {
                if reflection.should_reflect(true, i, failed_this_iteration, tracker.repeated_single_tool(), true) {
                    let situation = format!(
                        "Task: {}\nEvery search so far returned nothing; about to conclude no-result.",
                        spec.task
                    );
                    let reflect_model = config.tiers.model_for(Tier::Small).to_string();
                    if let Some(r) = reflection
                        .reflect(self.llm.as_ref(), &reflect_model, ReflectionTrigger::BeforeNoResult, i, &situation)
                        .await
                    {
                        full_history.push(Message::assistant(r.summary_message()));
                    }
                }
                trace.record(
                    TraceKind::StoppingAnalysis,
                    json!({"decision": "no_result_conclusion", "iteration": i}),
                );
                phase.transition(ExecutionPhase::Converging);
                emitter.status(ExecutionPhase::Converging.as_str(), "repeated searches produced no signal");
                let summary = search.no_result_summary(&spec.task);
                let stats = RunStats {
                    iterations_used: i,
                    iteration_budget: budget,
                    token_budget,
                    tokens_used,
                    tool_calls_total,
                    tool_error_count,
                    touched_domains,
                    files_read,
                    files_modified,
                    files_created,
                    search_signal_hits: search.hits(),
                    todo_calls: todo.calls(),
                    failed_steps: ledger.failed_count(),
                    pending_steps: ledger.pending_count(),
                    hypothesis_switches: reflection.hypothesis_switches(),
                    budget_extensions: budget_ctl.extensions_granted(),
                    no_result_concluded: true,
                };
                return TierOutcome::Done(
                    self.finalize(
                        spec,
                        tier,
                        classification,
                        stats,
                        FinalKind::Success,
                        summary,
                        emitter,
                        trace,
                        &archive,
                        &fact_sheet,
                        escalations,
                        run_started,
                    )
                    .await,
                );
            }

            // Budget extension
            if let Some(extended) = budget_ctl.maybe_extend(budget, i, &tracker, &search) {
                emitter.status("budget_extended", format!("{budget} -> {extended}"));
                budget = extended;
            }

            // Tier escalation
            if let Some(signal) = evaluate_escalation_need(&EscalationInputs {
                enabled: config.escalation_enabled,
                has_parent: self.parent.is_some(),
                tier,
                iteration: i,
                budget,
                evidence_count,
                tracker: &tracker,
                search: &search,
            }) {
                if reflection.should_reflect(true, i, failed_this_iteration, tracker.repeated_single_tool(), true) {
                    let situation = format!("Task: {}\nAbout to escalate: {}", spec.task, signal.reason);
                    let reflect_model = config.tiers.model_for(Tier::Small).to_string();
                    let _ = reflection
                        .reflect(self.llm.as_ref(), &reflect_model, ReflectionTrigger::BeforeEscalation, i, &situation)
                        .await;
                }
                return TierOutcome::Escalate { signal, tokens_used };
            }

            // Background summarization
            if config.summarization_interval > 0 && i % config.summarization_interval == 0 {
                let running = summarizer.as_ref().map(|h| !h.is_finished()).unwrap_or(false);
                if !running {
                    summarizer = Some(spawn_summarization(
                        Arc::clone(&self.llm),
                        config.tiers.model_for(Tier::Small).to_string(),
                        full_history.clone(),
                        Arc::clone(&fact_sheet),
                        Arc::clone(trace),
                        i,
                        config.auto_fact_min_confidence,
                        Arc::clone(&summary_blocks),
                    ));
                }
            }

            // Post-tools reflection
            if reflection.should_reflect(
                force_reflection,
                i,
                failed_this_iteration,
                tracker.repeated_single_tool(),
                tracker.near_stuck(),
            ) {
                let situation = format!(
                    "Task: {}\nFailures this iteration: {}\nIterations since progress: {}",
                    spec.task,
                    failed_this_iteration,
                    tracker.iterations_since_progress()
                );
                let reflect_model = config.tiers.model_for(Tier::Small).to_string();
                if let Some(r) = reflection
                    .reflect(self.llm.as_ref(), &reflect_model, ReflectionTrigger::PostTools, i, &situation)
                    .await
                {
                    full_history.push(Message::assistant(r.summary_message()));
                }
            }

            // Checklist nudge
            if let Some(nudge) = todo.maybe_nudge(i, quality::looks_multi_step(&spec.task)) {
                full_history.push(Message::user(nudge));
            }

            // A stuck child reports to its parent instead of escalating
            if tracker.is_stuck()
                && let Some(parent) = &self.parent
            {
                parent.notify_stuck(&spec.agent_id, prompts::STUCK_NOTE).await;
            }
        }

        // Budget exhausted with the model still requesting tools
        let iterations_used = budget;
        phase.transition(ExecutionPhase::Converging);
        emitter.status(ExecutionPhase::Converging.as_str(), "iteration budget exhausted");
        trace.record(TraceKind::SynthesisForced, json!({"reason": "max_iterations", "iteration": iterations_used}));
        emitter.emit(AgentEventKind::SynthesisForced {
            reason: "max_iterations".to_string(),
        });
        emitter.emit(AgentEventKind::SynthesisStart {
            iteration: iterations_used,
        });

        let fact_render = fact_sheet.lock().await.render();
        let archive_hint = archive.lock().await.summary();
        let blocks_snapshot = summary_blocks.lock().expect("summary sink poisoned").clone();
        let mut built = context_builder.build(
            ContextInputs {
                base_system: &base_system,
                workspace_map,
                fact_sheet: &fact_render,
                archive_hint: &archive_hint,
                task: &spec.task,
                full_history: &full_history,
                summary_blocks: &blocks_snapshot,
                feedback: Vec::new(),
                iteration: iterations_used,
            },
            trace,
        );
        built.messages.push(Message::user(prompts::SYNTHESIS_INSTRUCTION));

        let request = ChatRequest {
            model: config.tiers.model_for(tier).to_string(),
            system_prompt: built.system_prompt,
            messages: built.messages,
            tools: Vec::new(),
            tool_choice: ToolChoice::None,
            max_tokens: config.llm_max_tokens,
            temperature: None,
        };
        let (summary, synth_kind) = match self.llm.chat(request).await {
            Ok(response) => {
                tokens_used += response.usage.total();
                let content = response.content.unwrap_or_default();
                emitter.emit(AgentEventKind::SynthesisComplete {
                    iteration: iterations_used,
                    chars: content.len(),
                });
                (content, FinalKind::Success)
            }
            Err(e) => {
                if e.is_retryable() && tier != Tier::Large {
                    return TierOutcome::Escalate {
                        signal: EscalationSignal {
                            reason: format!("transient provider error during synthesis: {e}"),
                            iteration: iterations_used,
                        },
                        tokens_used,
                    };
                }
                trace.record(TraceKind::ErrorCaptured, json!({"error": e.to_string(), "site": "synthesis"}));
                (
                    format!("The run ended at its iteration budget and synthesis failed: {e}"),
                    FinalKind::Fatal("synthesis_failed".to_string()),
                )
            }
        };

        let stats = RunStats {
            iterations_used,
            iteration_budget: budget,
            token_budget,
            tokens_used,
            tool_calls_total,
            tool_error_count,
            touched_domains,
            files_read,
            files_modified,
            files_created,
            search_signal_hits: search.hits(),
            todo_calls: todo.calls(),
            failed_steps: ledger.failed_count(),
            pending_steps: ledger.pending_count(),
            hypothesis_switches: reflection.hypothesis_switches(),
            budget_extensions: budget_ctl.extensions_granted(),
            no_result_concluded,
        };
        TierOutcome::Done(
            self.finalize(
                spec,
                tier,
                classification,
                stats,
                synth_kind,
                summary,
                emitter,
                trace,
                &archive,
                &fact_sheet,
                escalations,
                run_started,
            )
            .await,
        )
    }

    /// Registry definitions plus engine tools; children never see
    /// `spawn_agent`.
    fn advertised_tools(&self, spec: &RunSpec) -> Vec<ToolDefinition> {
        let mut tools: Vec<ToolDefinition> = self
            .registry
            .definitions()
            .into_iter()
            .filter(|d| spec.is_main() || d.name != "spawn_agent")
            .collect();

        let mut add = |def: ToolDefinition| {
            if !tools.iter().any(|t| t.name == def.name) {
                tools.push(def);
            }
        };

        add(ToolDefinition::new(
            "report",
            "Finish the task with a final summary of what was accomplished",
            json!({
                "type": "object",
                "properties": {"summary": {"type": "string"}},
                "required": ["summary"]
            }),
        ));
        add(ToolDefinition::new(
            "reflect_on_progress",
            "Pause and record a structured reflection on the current approach",
            json!({"type": "object", "properties": {}}),
        ));
        if self.parent.is_some() {
            add(ToolDefinition::new(
                "ask_parent",
                "Ask the parent agent a clarifying question",
                json!({
                    "type": "object",
                    "properties": {"question": {"type": "string"}},
                    "required": ["question"]
                }),
            ));
        }
        if spec.is_main() && self.spawner.is_some() {
            add(ToolDefinition::new(
                "spawn_agent",
                "Delegate a focused subtask to a fresh sub-agent",
                json!({
                    "type": "object",
                    "properties": {
                        "task": {"type": "string"},
                        "working_dir": {"type": "string"}
                    },
                    "required": ["task"]
                }),
            ));
        }
        tools
    }

    async fn spawn_subagent(
        &self,
        spec: &RunSpec,
        call: &crate::llm::ToolCall,
        tool_ctx: &ToolContext,
        ledger: &mut TaskLedger,
        emitter: &EventEmitter,
    ) -> Option<(String, bool)> {
        let step = ledger.open("delegate subtask", "spawn_agent");
        let task_text = call.input.get("task").and_then(Value::as_str).unwrap_or("").to_string();

        let Some(spawner) = &tool_ctx.spawner else {
            ledger.complete(step, Some("spawning unavailable".to_string()));
            return Some(("Sub-agent spawning is not available to this agent.".to_string(), true));
        };

        let working_dir = call
            .input
            .get("working_dir")
            .and_then(Value::as_str)
            .map(|d| resolve_path(&tool_ctx.working_dir, d))
            .unwrap_or_else(|| tool_ctx.working_dir.clone());

        let subtask_id = domain::id::subtask_id(&task_text);
        emitter.emit(AgentEventKind::SubtaskStart {
            subtask_id: subtask_id.clone(),
            task: task_text.clone(),
        });

        match spawner.spawn(&task_text, working_dir).await {
            Ok(result) => {
                emitter.emit(AgentEventKind::SubtaskEnd {
                    subtask_id,
                    success: result.success,
                });
                if result.success {
                    ledger.complete(step, None);
                } else {
                    ledger.fail(step, result.error.clone().unwrap_or_default());
                }
                let content = format!(
                    "Sub-agent finished (success: {}, iterations: {}).\n{}",
                    result.success, result.iterations, result.summary
                );
                Some((content, !result.success))
            }
            Err(e) => {
                emitter.emit(AgentEventKind::SubtaskEnd {
                    subtask_id,
                    success: false,
                });
                ledger.fail(step, e.to_string());
                Some((format!("Sub-agent failed to start: {e}"), true))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn validate_completion(
        &self,
        spec: &RunSpec,
        intent: Intent,
        response_text: &str,
        iteration: u32,
        budget: u32,
        search: &SearchSignalTracker,
        no_result_concluded: bool,
        files_read: &BTreeSet<String>,
        files_modified: &BTreeSet<String>,
        files_created: &BTreeSet<String>,
        archive: &Arc<Mutex<Archive>>,
        trace: &Arc<TraceLog>,
    ) -> validate::ValidationOutcome {
        let evidence_count = files_read.len() + files_modified.len() + files_created.len();
        let evidence_density = if iteration > 0 {
            evidence_count as f64 / iteration as f64
        } else {
            0.0
        };
        let informational = intent != Intent::Action || looks_like_discovery(&spec.task);

        // Excerpts of the most relevant touched files, from cold memory
        let mut excerpts: Vec<(String, String)> = Vec::new();
        {
            let archive = archive.lock().await;
            for path in files_modified.iter().chain(files_created.iter()).chain(files_read.iter()) {
                if excerpts.len() == 3 {
                    break;
                }
                if let Some(entry) = archive.recall_by_file_path(path) {
                    excerpts.push((path.clone(), entry.full_output.chars().take(1000).collect()));
                }
            }
        }

        let prior_runs_changed_files = self.prior_runs_changed_files(spec);

        let inputs = ValidationInputs {
            task: &spec.task,
            response_text,
            informational,
            min_response_chars: self.config.min_informational_response_chars,
            files_read: files_read.len(),
            files_modified: files_modified.len(),
            files_created: files_created.len(),
            evidence_density,
            search_signal_hits: search.hits(),
            no_result_concluded,
            prior_runs_changed_files,
            file_excerpts: &excerpts,
        };

        if let Some(outcome) = validate::informational_fast_path(&inputs) {
            trace.record(
                TraceKind::LlmValidation,
                json!({"iteration": iteration, "mode": "fast_path", "success": true}),
            );
            return outcome;
        }

        let aux = AuxContext {
            task: &spec.task,
            iteration,
            budget,
            iterations_since_progress: 0,
            artifact_count: evidence_count,
            evidence_density,
            informational,
        };
        let model = self
            .config
            .tiers
            .model_for(choose_smart_tier(AuxNode::TaskValidation, &aux))
            .to_string();

        match validate::validate_with_llm(self.llm.as_ref(), &model, &inputs).await {
            Ok(outcome) => {
                trace.record(
                    TraceKind::LlmValidation,
                    json!({"iteration": iteration, "mode": "llm", "success": outcome.success}),
                );
                outcome
            }
            Err(e) => {
                trace.record(
                    TraceKind::LlmValidation,
                    json!({"iteration": iteration, "mode": "fallback", "error": e.to_string()}),
                );
                validate::fallback(&inputs)
            }
        }
    }

    /// Did earlier runs of this same (normalized) task change files?
    fn prior_runs_changed_files(&self, spec: &RunSpec) -> bool {
        let normalized = normalize_task(&spec.task);
        self.store
            .session_events(&spec.session_id, &sessionstore::EventFilter {
                kind: Some("run_completed".to_string()),
                limit: Some(50),
            })
            .map(|events| {
                events.iter().any(|e| {
                    e.payload.get("task_norm").and_then(Value::as_str) == Some(normalized.as_str())
                        && e.payload.get("files_changed").and_then(Value::as_u64).unwrap_or(0) > 0
                })
            })
            .unwrap_or(false)
    }

    async fn narrow_scope(&self, spec: &RunSpec) -> Option<PathBuf> {
        let mut subdirs: Vec<String> = std::fs::read_dir(&spec.working_dir)
            .ok()?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .filter(|name| !name.starts_with('.'))
            .collect();
        subdirs.sort();
        if subdirs.len() < 2 {
            return None;
        }
        subdirs.truncate(20);

        let prompt = format!("Task: {}\n\nTop-level directories:\n{}", spec.task, subdirs.join("\n"));
        let request = ChatRequest {
            model: self.config.tiers.model_for(Tier::Small).to_string(),
            system_prompt: prompts::SCOPE_SYSTEM.to_string(),
            messages: vec![Message::user(prompt)],
            tools: vec![ToolDefinition::new(
                "set_scope",
                "Record the chosen directory",
                json!({
                    "type": "object",
                    "properties": {"directory": {"type": "string"}},
                    "required": ["directory"]
                }),
            )],
            tool_choice: ToolChoice::Tool("set_scope".to_string()),
            max_tokens: 128,
            temperature: None,
        };

        let response = self.llm.chat(request).await.ok()?;
        let choice = response
            .tool_calls
            .iter()
            .find(|c| c.name == "set_scope")?
            .input
            .get("directory")?
            .as_str()?
            .trim()
            .to_string();
        if choice.is_empty() || choice == "none" || !subdirs.contains(&choice) {
            return None;
        }
        let narrowed = spec.working_dir.join(&choice);
        if narrowed.is_dir() {
            info!(directory = %choice, "scope narrowed");
            Some(narrowed)
        } else {
            None
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn finalize(
        &self,
        spec: &RunSpec,
        tier: Tier,
        classification: Classification,
        stats: RunStats,
        kind: FinalKind,
        mut summary: String,
        emitter: &EventEmitter,
        trace: &Arc<TraceLog>,
        archive: &Arc<Mutex<Archive>>,
        fact_sheet: &Arc<Mutex<FactSheet>>,
        escalations: &[(Tier, Tier)],
        run_started: chrono::DateTime<Utc>,
    ) -> TaskResult {
        let quality_gated = matches!(kind, FinalKind::Success | FinalKind::Unvalidated);
        let mut quality_score = 0.0;
        let mut quality_passed = false;

        if quality_gated {
            let report = quality::evaluate(&stats.quality_inputs(&spec.task));
            quality_score = report.score;
            quality_passed = report.status == QualityStatus::Pass;
            if let Some(suffix) = report.clarification_suffix() {
                summary.push_str(&suffix);
            }
        }

        {
            let fact_sheet = fact_sheet.lock().await;
            let archive = archive.lock().await;
            trace.record(
                TraceKind::MemorySnapshot,
                json!({
                    "facts": fact_sheet.len(),
                    "fact_tokens": fact_sheet.est_tokens(),
                    "archive_entries": archive.len(),
                    "archive_chars": archive.total_chars(),
                }),
            );

            // Best-effort memory persistence
            let memory_dir = sessionstore::default_memory_dir(&spec.working_dir).join(&spec.session_id);
            if let Err(e) = archive.persist(memory_dir.join("archive.json")) {
                warn!(error = %e, "archive persistence failed");
            }
        }

        let success = matches!(kind, FinalKind::Success);
        let kpis = RunKpis {
            agent_id: spec.agent_id.clone(),
            intent: classification.intent,
            tier_started: spec.tier,
            tier_final: tier,
            iterations_used: stats.iterations_used,
            iteration_budget: stats.iteration_budget,
            tokens_used: stats.tokens_used,
            token_budget: stats.token_budget,
            tool_calls: stats.tool_calls_total,
            tool_errors: stats.tool_error_count,
            touched_domains: stats.touched_domains.len(),
            files_read: stats.files_read.len(),
            files_modified: stats.files_modified.len(),
            files_created: stats.files_created.len(),
            search_signal_hits: stats.search_signal_hits,
            quality_score,
            quality_passed,
            escalations: escalations.to_vec(),
            hypothesis_switches: stats.hypothesis_switches,
            budget_extensions: stats.budget_extensions,
        };

        self.analytics.track("run_completed", kpis.payload());
        if quality_gated {
            if let Ok(Some(baseline)) = self.store.kpi_baseline(&spec.session_id) {
                for regression in kpis.detect_regressions(&baseline) {
                    self.analytics
                        .track("kpi_regression", json!({"agent_id": spec.agent_id, "detail": regression}));
                }
            }
            let sample = kpis.to_sample();
            if let Err(e) = self
                .store
                .update_kpi_baseline(&spec.session_id, &mut |baseline| baseline.observe(&sample))
            {
                warn!(error = %e, "baseline update failed");
            }
        }
        let files_changed = stats.files_modified.len() + stats.files_created.len();
        let _ = self.store.append_event(
            &spec.session_id,
            SessionEvent::new(
                "run_completed",
                json!({
                    "agent_id": spec.agent_id,
                    "task_norm": normalize_task(&spec.task),
                    "files_changed": files_changed,
                    "success": success,
                }),
            ),
        );
        let _ = self.store.append_conversation(&spec.session_id, &[
            ConversationRecord::new("user", spec.task.clone()),
            ConversationRecord::new("assistant", summary.clone()),
        ]);
        if success
            && let Some(memory) = &self.long_term
        {
            let entry = format!(
                "Completed: {} ({} iterations, {} file(s) changed)",
                spec.task, stats.iterations_used, files_changed
            );
            if let Err(e) = memory.add(&spec.session_id, &entry).await {
                warn!(error = %e, "long-term memory write failed");
            }
        }

        trace.record(
            TraceKind::TaskEnd,
            json!({
                "agent_id": spec.agent_id,
                "success": success,
                "iterations": stats.iterations_used,
                "tokens_used": stats.tokens_used,
            }),
        );
        emitter.emit(AgentEventKind::AgentEnd {
            stopped: matches!(kind, FinalKind::Stopped),
            success,
            iterations: stats.iterations_used,
            started_at: run_started,
        });

        let error = match kind {
            FinalKind::Success => None,
            FinalKind::Unvalidated => Some("validation_failed".to_string()),
            FinalKind::Stopped => Some("stopped".to_string()),
            FinalKind::Fatal(code) => Some(code),
        };

        TaskResult {
            success,
            summary,
            files_created: stats.files_created.iter().cloned().collect(),
            files_modified: stats.files_modified.iter().cloned().collect(),
            files_read: stats.files_read.iter().cloned().collect(),
            iterations: stats.iterations_used,
            tokens_used: stats.tokens_used,
            trace: trace.collected(),
            error,
        }
    }
}

/// How a run attempt terminated, for the finalizer.
enum FinalKind {
    Success,
    /// The validator judged the final answer insufficient.
    Unvalidated,
    Stopped,
    Fatal(String),
}

fn assistant_message(response: &ChatResponse) -> Message {
    let mut blocks = Vec::new();
    if let Some(text) = &response.content
        && !text.is_empty()
    {
        blocks.push(ContentBlock::text(text));
    }
    for call in &response.tool_calls {
        blocks.push(ContentBlock::ToolUse {
            id: call.id.clone(),
            name: call.name.clone(),
            input: call.input.clone(),
        });
    }
    Message::blocks(Role::Assistant, blocks)
}

fn truncate_for_model(output: &str, max_chars: usize) -> String {
    if output.len() <= max_chars {
        return output.to_string();
    }
    let mut cut = max_chars;
    while cut > 0 && !output.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}\n[output truncated at {} chars; full output in archive]",
        &output[..cut],
        max_chars
    )
}

fn goal_of(tool_name: &str, input: &Value) -> String {
    match primary_path(input) {
        Some(path) => format!("{tool_name} {path}"),
        None => tool_name.to_string(),
    }
}

fn primary_path(input: &Value) -> Option<String> {
    for key in ["path", "directory", "file"] {
        if let Some(path) = input.get(key).and_then(Value::as_str)
            && !path.is_empty()
        {
            return Some(path.to_string());
        }
    }
    None
}

/// Top-level directory segment of a path, the drift-measurement unit.
fn top_level_domain(path: &str) -> Option<String> {
    let trimmed = path.trim_start_matches("./");
    let mut components = Path::new(trimmed).components().filter_map(|c| match c {
        std::path::Component::Normal(os) => os.to_str(),
        _ => None,
    });
    let first = components.next()?;
    match components.next() {
        Some(_) => Some(first.to_string()),
        // A bare filename belongs to the scope root
        None => Some(".".to_string()),
    }
}

fn resolve_path(working_dir: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() { p.to_path_buf() } else { working_dir.join(p) }
}

fn normalize_task(task: &str) -> String {
    task.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Sorted `name:input` signature of one iteration's tool calls.
fn loop_signature(calls: &[crate::llm::ToolCall]) -> String {
    let mut parts: Vec<String> = calls.iter().map(|c| format!("{}:{}", c.name, c.input)).collect();
    parts.sort();
    parts.join("|")
}

fn push_signature(ring: &mut VecDeque<String>, signature: String) {
    if ring.len() == SIGNATURE_RING {
        ring.pop_front();
    }
    ring.push_back(signature);
}

/// The last three signatures are byte-equal.
fn detect_loop(ring: &VecDeque<String>) -> bool {
    if ring.len() < LOOP_RUN {
        return false;
    }
    let last = &ring[ring.len() - 1];
    (1..LOOP_RUN).all(|k| &ring[ring.len() - 1 - k] == last)
}

/// Scan for sibling project roots, rendered as a short map for the system
/// prompt.
fn discover_workspace(working_dir: &Path) -> String {
    const MARKERS: &[&str] = &["Cargo.toml", "package.json", "pyproject.toml", "go.mod"];
    let mut roots: BTreeSet<String> = BTreeSet::new();

    for entry in WalkDir::new(working_dir)
        .min_depth(1)
        .max_depth(2)
        .into_iter()
        .filter_map(Result::ok)
    {
        let name = entry.file_name().to_str().unwrap_or_default();
        let is_marker = MARKERS.contains(&name) || name == ".git";
        if !is_marker {
            continue;
        }
        if let Some(parent) = entry.path().parent()
            && let Ok(relative) = parent.strip_prefix(working_dir)
        {
            let label = if relative.as_os_str().is_empty() {
                ".".to_string()
            } else {
                relative.display().to_string()
            };
            roots.insert(format!("- {label} ({name})"));
        }
        if roots.len() >= 12 {
            break;
        }
    }
    roots.into_iter().collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(name: &str, input: Value) -> crate::llm::ToolCall {
        crate::llm::ToolCall {
            id: "c1".to_string(),
            name: name.to_string(),
            input,
        }
    }

    #[test]
    fn test_loop_signature_is_order_insensitive() {
        let a = loop_signature(&[
            call("grep_search", json!({"pattern": "FOO"})),
            call("fs_read", json!({"path": "a.rs"})),
        ]);
        let b = loop_signature(&[
            call("fs_read", json!({"path": "a.rs"})),
            call("grep_search", json!({"pattern": "FOO"})),
        ]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_detect_loop_needs_three_equal() {
        let mut ring = VecDeque::new();
        push_signature(&mut ring, "a".to_string());
        push_signature(&mut ring, "a".to_string());
        assert!(!detect_loop(&ring));
        push_signature(&mut ring, "a".to_string());
        assert!(detect_loop(&ring));

        push_signature(&mut ring, "b".to_string());
        assert!(!detect_loop(&ring));
    }

    #[test]
    fn test_signature_ring_bounded() {
        let mut ring = VecDeque::new();
        for n in 0..10 {
            push_signature(&mut ring, n.to_string());
        }
        assert_eq!(ring.len(), SIGNATURE_RING);
        assert_eq!(ring[0], "4");
    }

    #[test]
    fn test_top_level_domain() {
        assert_eq!(top_level_domain("src/lib.rs").as_deref(), Some("src"));
        assert_eq!(top_level_domain("./src/loop/engine.rs").as_deref(), Some("src"));
        assert_eq!(top_level_domain("hello.txt").as_deref(), Some("."));
    }

    #[test]
    fn test_truncate_for_model() {
        let text = "x".repeat(100);
        let truncated = truncate_for_model(&text, 40);
        assert!(truncated.contains("[output truncated at 40 chars"));
        assert!(truncate_for_model("short", 40).eq("short"));
    }

    #[test]
    fn test_discover_workspace_finds_roots() {
        let temp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(temp.path().join("api")).unwrap();
        std::fs::write(temp.path().join("api/Cargo.toml"), "[package]").unwrap();
        std::fs::create_dir_all(temp.path().join("web")).unwrap();
        std::fs::write(temp.path().join("web/package.json"), "{}").unwrap();

        let map = discover_workspace(temp.path());
        assert!(map.contains("- api (Cargo.toml)"));
        assert!(map.contains("- web (package.json)"));
    }

    #[test]
    fn test_normalize_task() {
        assert_eq!(normalize_task("  Create   FILE hello.txt "), "create file hello.txt");
    }
}
