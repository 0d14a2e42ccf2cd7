//! Top-level dispatch routing: the one entry point that picks a mode, runs
//! it, and settles the token economy (§4.9).
//!
//! Grounded in `original_source/llmos/kernel/dispatcher.py`'s
//! `Dispatcher.dispatch` method, which fans out to
//! `_dispatch_crystallized`/`_dispatch_follower`/`_dispatch_mixed`/
//! `_dispatch_learner`/`_dispatch_orchestrator` and settles
//! `token_economy` exactly once per call.

use crate::agent::AgentRegistry;
use crate::cognitive::{CognitiveAdapter, CognitiveBackend};
use crate::config::Config;
use crate::economy::TokenEconomy;
use crate::error::Result;
use crate::event::{DispatchEvent, EventBus, EventKind};
use crate::memory_query::MemoryQuery;
use crate::mode::DispatchMode;
use crate::mode_strategy::{strategy_for_name, ModeContext, ModeStrategy};
use crate::orchestrator::Orchestrator;
use crate::project::Project;
use crate::trace::ExecutionTrace;
use crate::trace_matcher::TraceMatcher;
use crate::trace_store::TraceStore;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::warn;

/// A native tool a crystallized trace can be bound to, invoked with no LLM
/// call and zero cost.
pub trait CrystallizedTool: Send + Sync {
    fn invoke(&self, goal: &str) -> Result<Value>;
}

/// The outcome of one [`Dispatcher::dispatch`] call (§6). `tool_name` is
/// populated only on a CRYSTALLIZED dispatch.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub success: bool,
    pub mode: DispatchMode,
    pub cost_usd: f64,
    pub trace: Option<ExecutionTrace>,
    pub steps_completed: Option<usize>,
    pub total_steps: Option<usize>,
    pub execution_time_secs: f64,
    pub error: Option<String>,
    pub output: Option<Value>,
    pub tool_name: Option<String>,
}

impl DispatchOutcome {
    fn failed(mode: DispatchMode, started: Instant, error: impl Into<String>) -> Self {
        Self {
            success: false,
            mode,
            cost_usd: 0.0,
            trace: None,
            steps_completed: None,
            total_steps: None,
            execution_time_secs: started.elapsed().as_secs_f64(),
            error: Some(error.into()),
            output: None,
            tool_name: None,
        }
    }
}

/// Routes a goal to the cheapest mode that can answer it, enforcing the
/// token economy around every paid path.
pub struct Dispatcher<B: CognitiveBackend> {
    event_bus: Arc<EventBus>,
    economy: Arc<TokenEconomy>,
    trace_store: Arc<TraceStore>,
    trace_matcher: Arc<TraceMatcher>,
    memory_query: Arc<MemoryQuery>,
    project_manager: Arc<crate::project::ProjectManager>,
    agent_registry: Arc<AgentRegistry>,
    cognitive: Arc<CognitiveAdapter<B>>,
    orchestrator: Orchestrator<B>,
    config: Config,
    strategy: Box<dyn ModeStrategy>,
    tools: RwLock<HashMap<String, Arc<dyn CrystallizedTool>>>,
}

impl<B: CognitiveBackend> Dispatcher<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        event_bus: Arc<EventBus>,
        economy: Arc<TokenEconomy>,
        trace_store: Arc<TraceStore>,
        trace_matcher: Arc<TraceMatcher>,
        memory_query: Arc<MemoryQuery>,
        project_manager: Arc<crate::project::ProjectManager>,
        agent_registry: Arc<AgentRegistry>,
        cognitive: Arc<CognitiveAdapter<B>>,
        config: Config,
    ) -> Self {
        let strategy = strategy_for_name(&config.dispatcher.mode_strategy);
        let orchestrator = Orchestrator::new(
            event_bus.clone(),
            project_manager.clone(),
            agent_registry.clone(),
            memory_query.clone(),
            cognitive.clone(),
        );

        Self {
            event_bus,
            economy,
            trace_store,
            trace_matcher,
            memory_query,
            project_manager,
            agent_registry,
            cognitive,
            orchestrator,
            config,
            strategy,
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Register a native tool that crystallized traces may be bound to.
    pub fn register_tool(&self, name: impl Into<String>, tool: Arc<dyn CrystallizedTool>) {
        self.tools.write().expect("tools lock poisoned").insert(name.into(), tool);
    }

    /// Dispatch `goal`. `mode` of `DispatchMode::Auto` delegates the choice
    /// to the configured [`ModeStrategy`]; any other mode is used directly,
    /// subject to the downgrade rules each mode handler documents.
    pub async fn dispatch(
        &self,
        goal: &str,
        mode: DispatchMode,
        project: Option<Project>,
        max_cost_usd: f64,
    ) -> DispatchOutcome {
        let started = Instant::now();

        self.event_bus.publish(DispatchEvent::new(
            EventKind::TaskStarted,
            json!({"goal": goal, "mode": mode.to_string()}),
        ));

        let (resolved_mode, trace_hint) = if mode == DispatchMode::Auto {
            let context = ModeContext { goal, trace_matcher: &self.trace_matcher, config: &self.config };
            let decision = self.strategy.decide(&context).await;
            (decision.mode, decision.trace)
        } else {
            (mode, None)
        };

        let mut outcome = match resolved_mode {
            DispatchMode::Crystallized => self.dispatch_crystallized(goal, trace_hint, started).await,
            DispatchMode::Follower => self.dispatch_follower(goal, trace_hint, max_cost_usd, started).await,
            DispatchMode::Mixed => self.dispatch_mixed(goal, trace_hint, max_cost_usd, started).await,
            DispatchMode::Learner => self.dispatch_learner(goal, max_cost_usd, started).await,
            DispatchMode::Orchestrator => self.dispatch_orchestrator(goal, project, max_cost_usd, started).await,
            DispatchMode::Auto => unreachable!("auto is resolved to a concrete mode above"),
        };
        outcome.execution_time_secs = started.elapsed().as_secs_f64();

        self.event_bus.publish(DispatchEvent::new(
            EventKind::TaskCompleted,
            json!({"goal": goal, "mode": outcome.mode.to_string(), "success": outcome.success}),
        ));

        outcome
    }

    async fn dispatch_crystallized(&self, goal: &str, hint: Option<ExecutionTrace>, started: Instant) -> DispatchOutcome {
        let trace = match hint.or(self.trace_matcher.exact(goal).await) {
            Some(trace) if trace.crystallized_into_tool.is_some() => trace,
            _ => match self.trace_matcher.semantic(goal, self.config.memory.follower_mode_threshold).await {
                Some((trace, _)) if trace.crystallized_into_tool.is_some() => trace,
                _ => return DispatchOutcome::failed(DispatchMode::Crystallized, started, "no crystallized tool bound to this goal"),
            },
        };

        let tool_name = trace.crystallized_into_tool.clone().expect("checked above");
        let tool = {
            let tools = self.tools.read().expect("tools lock poisoned");
            tools.get(&tool_name).cloned()
        };
        let Some(tool) = tool else {
            return DispatchOutcome::failed(
                DispatchMode::Crystallized,
                started,
                format!("trace references unregistered tool {tool_name:?}"),
            );
        };

        match tool.invoke(goal) {
            Ok(output) => {
                let updated = self.trace_store.update_usage(&trace.goal_signature, true).await.ok().flatten();
                DispatchOutcome {
                    success: true,
                    mode: DispatchMode::Crystallized,
                    cost_usd: 0.0,
                    trace: updated.or(Some(trace)),
                    steps_completed: None,
                    total_steps: None,
                    execution_time_secs: started.elapsed().as_secs_f64(),
                    error: None,
                    output: Some(output),
                    tool_name: Some(tool_name),
                }
            }
            Err(err) => {
                let _ = self.trace_store.update_usage(&trace.goal_signature, false).await;
                DispatchOutcome::failed(DispatchMode::Crystallized, started, err.to_string())
            }
        }
    }

    /// Requires a trace at or above the FOLLOWER confidence threshold;
    /// falls back to MIXED on any miss or replay failure (§7 NO_TRACE).
    async fn dispatch_follower(
        &self,
        goal: &str,
        hint: Option<ExecutionTrace>,
        max_cost_usd: f64,
        started: Instant,
    ) -> DispatchOutcome {
        let resolved = match hint {
            Some(trace) => Some((trace, 1.0)),
            None => match self.trace_matcher.exact(goal).await {
                Some(trace) => Some((trace, 1.0)),
                None => self.trace_matcher.semantic(goal, self.config.memory.follower_mode_threshold).await,
            },
        };

        let Some((trace, _confidence)) = resolved else {
            return self.dispatch_mixed(goal, None, max_cost_usd, started).await;
        };

        match self.cognitive.replay(&trace).await {
            Ok(outcome) if outcome.success => {
                let updated = self.trace_store.update_usage(&trace.goal_signature, true).await.ok().flatten();
                DispatchOutcome {
                    success: true,
                    mode: DispatchMode::Follower,
                    cost_usd: outcome.cost_usd,
                    trace: updated.or(Some(trace)),
                    steps_completed: None,
                    total_steps: None,
                    execution_time_secs: started.elapsed().as_secs_f64(),
                    error: None,
                    output: Some(json!(outcome.output)),
                    tool_name: None,
                }
            }
            _ => {
                warn!(goal, "follower replay failed, downgrading to mixed");
                let _ = self.trace_store.update_usage(&trace.goal_signature, false).await;
                self.dispatch_mixed(goal, None, max_cost_usd, started).await
            }
        }
    }

    /// Requires a trace at or above the MIXED confidence threshold; falls
    /// back to LEARNER on a miss (§7 NO_TRACE).
    async fn dispatch_mixed(
        &self,
        goal: &str,
        hint: Option<ExecutionTrace>,
        max_cost_usd: f64,
        started: Instant,
    ) -> DispatchOutcome {
        let resolved = match hint {
            Some(trace) => Some(trace),
            None => self
                .trace_matcher
                .semantic(goal, self.config.memory.mixed_mode_threshold)
                .await
                .map(|(trace, _)| trace),
        };

        let Some(trace) = resolved else {
            return self.dispatch_learner(goal, max_cost_usd, started).await;
        };

        let estimate = self.config.dispatcher.mixed_estimated_cost_usd.min(max_cost_usd);
        if let Err(err) = self.economy.check(estimate).await {
            return DispatchOutcome::failed(DispatchMode::Mixed, started, err.to_string());
        }

        let guided_prompt = format!(
            "{goal}\n\nA similar task was executed before with {:.0}% success:\nGoal: {}\nTools used: {:?}\nOutcome: {}",
            trace.success_rating * 100.0,
            trace.goal_text,
            trace.tools_used.clone().unwrap_or_default(),
            trace.output_summary,
        );

        match self.cognitive.one_shot(&guided_prompt, None, DispatchMode::Mixed, max_cost_usd).await {
            Ok(outcome) => {
                if let Err(err) = self.economy.deduct(outcome.cost_usd, "mixed").await {
                    return DispatchOutcome::failed(DispatchMode::Mixed, started, err.to_string());
                }
                let _ = self.trace_store.save(&outcome.trace).await;
                let _ = self.trace_store.update_usage(&trace.goal_signature, outcome.success).await;
                DispatchOutcome {
                    success: outcome.success,
                    mode: DispatchMode::Mixed,
                    cost_usd: outcome.cost_usd,
                    trace: Some(outcome.trace),
                    steps_completed: None,
                    total_steps: None,
                    execution_time_secs: started.elapsed().as_secs_f64(),
                    error: None,
                    output: Some(json!(outcome.output)),
                    tool_name: None,
                }
            }
            Err(err) => DispatchOutcome::failed(DispatchMode::Mixed, started, err.to_string()),
        }
    }

    /// Free-form reasoning from scratch; no trace requirement.
    async fn dispatch_learner(&self, goal: &str, max_cost_usd: f64, started: Instant) -> DispatchOutcome {
        let estimate = self.config.dispatcher.learner_estimated_cost_usd.min(max_cost_usd);
        if let Err(err) = self.economy.check(estimate).await {
            return DispatchOutcome::failed(DispatchMode::Learner, started, err.to_string());
        }

        match self.cognitive.one_shot(goal, None, DispatchMode::Learner, max_cost_usd).await {
            Ok(outcome) => {
                if let Err(err) = self.economy.deduct(outcome.cost_usd, "learner").await {
                    return DispatchOutcome::failed(DispatchMode::Learner, started, err.to_string());
                }
                let _ = self.trace_store.save(&outcome.trace).await;
                DispatchOutcome {
                    success: outcome.success,
                    mode: DispatchMode::Learner,
                    cost_usd: outcome.cost_usd,
                    trace: Some(outcome.trace),
                    steps_completed: None,
                    total_steps: None,
                    execution_time_secs: started.elapsed().as_secs_f64(),
                    error: None,
                    output: Some(json!(outcome.output)),
                    tool_name: None,
                }
            }
            Err(err) => DispatchOutcome::failed(DispatchMode::Learner, started, err.to_string()),
        }
    }

    async fn dispatch_orchestrator(
        &self,
        goal: &str,
        project: Option<Project>,
        max_cost_usd: f64,
        started: Instant,
    ) -> DispatchOutcome {
        if let Err(err) = self.economy.check(max_cost_usd).await {
            return DispatchOutcome::failed(DispatchMode::Orchestrator, started, err.to_string());
        }

        match self.orchestrator.orchestrate(goal, project, max_cost_usd).await {
            Ok(result) => {
                if let Err(err) = self.economy.deduct(result.cost_usd, "orchestrator").await {
                    return DispatchOutcome::failed(DispatchMode::Orchestrator, started, err.to_string());
                }
                DispatchOutcome {
                    success: result.success,
                    mode: DispatchMode::Orchestrator,
                    cost_usd: result.cost_usd,
                    trace: None,
                    steps_completed: Some(result.steps_completed),
                    total_steps: Some(result.total_steps),
                    execution_time_secs: started.elapsed().as_secs_f64(),
                    error: None,
                    output: Some(result.output),
                    tool_name: None,
                }
            }
            Err(err) => DispatchOutcome::failed(DispatchMode::Orchestrator, started, err.to_string()),
        }
    }

    /// Read-only aggregate over stored traces, exposed for CLI/REPL clients.
    pub fn memory(&self) -> &MemoryQuery {
        &self.memory_query
    }

    pub fn economy(&self) -> &TokenEconomy {
        &self.economy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cognitive::MockBackend;
    use crate::project::ProjectManager;
    use crate::trace_matcher::MatcherThresholds;

    struct EchoTool;
    impl CrystallizedTool for EchoTool {
        fn invoke(&self, goal: &str) -> Result<Value> {
            Ok(json!({"echo": goal}))
        }
    }

    async fn harness(backend: MockBackend) -> (Dispatcher<MockBackend>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let event_bus = Arc::new(EventBus::new());
        let economy = Arc::new(TokenEconomy::new(10.0));
        let store = Arc::new(TraceStore::new(dir.path()));
        let matcher = Arc::new(TraceMatcher::new(store.clone(), MatcherThresholds::default()));
        let memory_query = Arc::new(MemoryQuery::new(store.clone(), matcher.clone()));
        let project_manager = Arc::new(ProjectManager::new(dir.path()));
        let agent_registry = Arc::new(AgentRegistry::new());
        let cognitive = Arc::new(CognitiveAdapter::new(Arc::new(backend)));
        let config = Config::default();

        let dispatcher = Dispatcher::new(
            event_bus, economy, store, matcher, memory_query, project_manager, agent_registry, cognitive, config,
        );
        (dispatcher, dir)
    }

    #[tokio::test]
    async fn crystallized_dispatch_invokes_registered_tool_at_zero_cost() {
        let (dispatcher, _dir) = harness(MockBackend::default()).await;
        dispatcher.register_tool("is_prime", Arc::new(EchoTool));

        let mut trace = ExecutionTrace::new("check prime", DispatchMode::Learner, 0.97, 0.1, 0.1);
        trace.usage_count = 6;
        trace.crystallized_into_tool = Some("is_prime".to_string());
        dispatcher.trace_store.save(&trace).await.unwrap();

        let outcome = dispatcher.dispatch("check prime", DispatchMode::Crystallized, None, 1.0).await;
        assert!(outcome.success);
        assert_eq!(outcome.cost_usd, 0.0);
        assert_eq!(outcome.tool_name.as_deref(), Some("is_prime"));
    }

    #[tokio::test]
    async fn learner_dispatch_deducts_actual_cost_from_economy() {
        let (dispatcher, _dir) = harness(MockBackend { cost_usd: 0.3, ..Default::default() }).await;
        let outcome = dispatcher.dispatch("write a haiku", DispatchMode::Learner, None, 5.0).await;
        assert!(outcome.success);
        assert_eq!(outcome.cost_usd, 0.3);
        assert_eq!(dispatcher.economy().balance_usd().await, 9.7);
    }

    #[tokio::test]
    async fn follower_downgrades_to_mixed_without_a_trace() {
        let (dispatcher, _dir) = harness(MockBackend { cost_usd: 0.2, ..Default::default() }).await;
        let outcome = dispatcher.dispatch("never executed before", DispatchMode::Follower, None, 5.0).await;
        assert_eq!(outcome.mode, DispatchMode::Learner);
    }

    #[tokio::test]
    async fn mixed_downgrades_to_learner_without_a_trace() {
        let (dispatcher, _dir) = harness(MockBackend { cost_usd: 0.2, ..Default::default() }).await;
        let outcome = dispatcher.dispatch("a brand new goal nobody has seen", DispatchMode::Mixed, None, 5.0).await;
        assert_eq!(outcome.mode, DispatchMode::Learner);
    }

    #[tokio::test]
    async fn low_battery_fails_the_dispatch_without_a_panic() {
        let (dispatcher, _dir) = harness(MockBackend { cost_usd: 50.0, ..Default::default() }).await;
        let outcome = dispatcher.dispatch("expensive goal", DispatchMode::Learner, None, 0.01).await;
        assert!(!outcome.success);
        assert!(outcome.error.is_some());
    }

    #[tokio::test]
    async fn failed_orchestration_still_deducts_its_actual_cost() {
        let plan = r#"{"steps": [
            {"number": 1, "description": "step one", "agent": "system-agent"},
            {"number": 2, "description": "step two", "agent": "system-agent"},
            {"number": 3, "description": "step three", "agent": "system-agent"}
        ]}"#;
        let (dispatcher, _dir) =
            harness(MockBackend { cost_usd: 0.2, output: plan.to_string(), ..Default::default() }).await;

        let outcome = dispatcher.dispatch("do three things", DispatchMode::Orchestrator, None, 0.40).await;

        assert!(!outcome.success);
        assert!((outcome.cost_usd - 0.40).abs() < 1e-9);
        assert!((dispatcher.economy().balance_usd().await - 9.60).abs() < 1e-9);
    }
}
