//! Goal decomposition and per-step agent delegation (§4.10).
//!
//! Grounded in `original_source/llmos/interfaces/orchestrator.py`'s
//! `SystemAgent.orchestrate`: consult memory, decompose into a JSON plan via
//! a single planning call, execute steps in order with a budget-halting
//! loop. The halting loop itself generalizes
//! `rlm-core::orchestrator::FallbackLoop`'s iterate-then-check-limits
//! pattern to dollar cost rather than iteration/LLM-call counts.

use crate::agent::AgentRegistry;
use crate::cognitive::{AdapterOutcome, CognitiveAdapter, CognitiveBackend, StreamEvent};
use crate::error::{Error, Result};
use crate::event::{DispatchEvent, EventBus, EventKind};
use crate::memory_query::MemoryQuery;
use crate::mode::DispatchMode;
use crate::project::{ExecutionStep, Project, ProjectManager, StateManager, StateSummary, StepStatus};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// The result of one `orchestrate` call (§3, §6). `output` mirrors
/// `state_summary` as a `Value` for callers that want a free-form field;
/// `state_summary` is the typed version of the same data.
#[derive(Debug, Clone)]
pub struct OrchestrationResult {
    pub success: bool,
    pub output: Value,
    pub steps_completed: usize,
    pub total_steps: usize,
    pub cost_usd: f64,
    pub execution_time_secs: f64,
    pub state_summary: StateSummary,
}

#[derive(Debug, Deserialize)]
struct PlannedStep {
    number: u32,
    description: String,
    #[serde(default)]
    agent: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    expected_output: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Plan {
    steps: Vec<PlannedStep>,
}

/// Extract the first `{ ... }` block from `text` and parse it as a [`Plan`].
/// Returns `None` on malformed JSON or a plan with zero steps, either of
/// which sends the caller to the single-step fallback.
fn parse_plan(text: &str) -> Option<Vec<ExecutionStep>> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    let plan: Plan = serde_json::from_str(&text[start..=end]).ok()?;
    if plan.steps.is_empty() {
        return None;
    }
    Some(
        plan.steps
            .into_iter()
            .map(|s| {
                ExecutionStep::new(
                    s.number,
                    s.description,
                    s.agent.unwrap_or_else(|| "system-agent".to_string()),
                )
            })
            .collect(),
    )
}

/// Decomposes a goal into a plan and delegates each step to a named agent.
///
/// Holds no reference to a `TokenEconomy`: budget halting during a run is a
/// local running-total check against `max_cost_usd`, and the actual wallet
/// deduction happens once, externally, after `orchestrate` returns.
pub struct Orchestrator<B: CognitiveBackend> {
    event_bus: Arc<EventBus>,
    project_manager: Arc<ProjectManager>,
    agent_registry: Arc<AgentRegistry>,
    memory_query: Arc<MemoryQuery>,
    cognitive: Arc<CognitiveAdapter<B>>,
}

impl<B: CognitiveBackend> Orchestrator<B> {
    pub fn new(
        event_bus: Arc<EventBus>,
        project_manager: Arc<ProjectManager>,
        agent_registry: Arc<AgentRegistry>,
        memory_query: Arc<MemoryQuery>,
        cognitive: Arc<CognitiveAdapter<B>>,
    ) -> Self {
        Self {
            event_bus,
            project_manager,
            agent_registry,
            memory_query,
            cognitive,
        }
    }

    /// Plan and execute `goal`, halting further steps once accumulated cost
    /// reaches `max_cost_usd`. Only infrastructure errors (project creation,
    /// state persistence) propagate as `Err`; a per-step failure is recorded
    /// on the step and execution continues.
    pub async fn orchestrate(
        &self,
        goal: &str,
        project: Option<Project>,
        max_cost_usd: f64,
    ) -> Result<OrchestrationResult> {
        let started = Instant::now();

        let project = match project {
            Some(project) => project,
            None => {
                let name = ProjectManager::auto_name(goal);
                self.project_manager.create(&name, None).await?
            }
        };

        let mut state = StateManager::initialize(project, goal);
        state.set_constraint("max_cost_usd", json!(max_cost_usd)).await?;

        self.event_bus.publish(DispatchEvent::new(
            EventKind::TaskStarted,
            json!({"goal": goal, "mode": "ORCHESTRATOR"}),
        ));
        state.log_event("ORCHESTRATION_STARTED", json!({"goal": goal})).await?;

        let memory_insights = self.consult_memory(goal).await;
        state.set_variable("memory_insights", memory_insights.clone()).await?;

        let mut total_cost = 0.0;
        let plan = match self.decompose_goal(goal, &memory_insights, max_cost_usd).await {
            Ok((steps, cost)) => {
                total_cost += cost;
                steps
            }
            Err(err) => {
                warn!(goal, error = %err, "plan decomposition failed, falling back to single-step plan");
                vec![ExecutionStep::new(1, goal, "system-agent")]
            }
        };

        let total_steps = plan.len();
        state.set_plan(plan).await?;

        let mut steps_completed = 0usize;
        let mut budget_exhausted = false;

        for number in 1..=total_steps as u32 {
            if !budget_exhausted && total_cost >= max_cost_usd {
                budget_exhausted = true;
                self.event_bus.publish(DispatchEvent::new(
                    EventKind::BudgetExceeded,
                    json!({"goal": goal, "at_step": number, "cost_usd": total_cost}),
                ));
            }

            if budget_exhausted {
                state
                    .update_step(number, StepStatus::Failed, None, Some("BUDGET_EXCEEDED".to_string()))
                    .await?;
                continue;
            }

            let (description, agent_name) = {
                let step = state
                    .state()
                    .plan
                    .iter()
                    .find(|s| s.number == number)
                    .expect("plan was just set with this step number");
                (step.description.clone(), step.agent_name.clone())
            };

            state.update_step(number, StepStatus::InProgress, None, None).await?;
            self.event_bus.publish(DispatchEvent::new(
                EventKind::StepStarted,
                json!({"step": number, "description": description}),
            ));
            state.log_event("STEP_EXECUTION_STARTED", json!({"step": number})).await?;

            match self.execute_step(&description, &agent_name, max_cost_usd).await {
                Ok(outcome) => {
                    total_cost += outcome.cost_usd;
                    if outcome.success {
                        state
                            .update_step(number, StepStatus::Completed, Some(json!(outcome.output)), None)
                            .await?;
                        steps_completed += 1;
                    } else {
                        let message = outcome
                            .trace
                            .error_notes
                            .clone()
                            .unwrap_or_else(|| "step execution failed".to_string());
                        state.update_step(number, StepStatus::Failed, None, Some(message)).await?;
                    }
                    self.event_bus.publish(DispatchEvent::new(
                        EventKind::StepDone,
                        json!({"step": number, "success": outcome.success}),
                    ));
                    state.log_event("STEP_EXECUTION_COMPLETED", json!({"step": number})).await?;
                }
                Err(err) => {
                    state.update_step(number, StepStatus::Failed, None, Some(err.to_string())).await?;
                    self.event_bus.publish(DispatchEvent::new(
                        EventKind::StepDone,
                        json!({"step": number, "success": false}),
                    ));
                }
            }
        }

        let success = steps_completed == total_steps;
        state.mark_complete(success).await?;
        let summary = state.summary();

        self.event_bus.publish(DispatchEvent::new(
            EventKind::TaskCompleted,
            json!({"goal": goal, "success": success}),
        ));

        Ok(OrchestrationResult {
            success,
            output: serde_json::to_value(summary).unwrap_or(Value::Null),
            steps_completed,
            total_steps,
            cost_usd: total_cost,
            execution_time_secs: started.elapsed().as_secs_f64(),
            state_summary: summary,
        })
    }

    async fn consult_memory(&self, goal: &str) -> Value {
        let recommendations = self.memory_query.recommendations(goal).await;
        let similar = self
            .memory_query
            .find_similar(goal, 1, 0.5)
            .await
            .ok()
            .and_then(|traces| traces.into_iter().next());

        json!({
            "similar_trace_found": similar.is_some(),
            "similar_trace_goal": similar.map(|t| t.goal_text),
            "recommendations": recommendations,
        })
    }

    async fn decompose_goal(
        &self,
        goal: &str,
        memory_insights: &Value,
        max_cost_usd: f64,
    ) -> Result<(Vec<ExecutionStep>, f64)> {
        let prompt = format!(
            "Decompose this goal into an ordered plan.\n\nGoal: {goal}\n\nMemory insights: {memory_insights}\n\nAvailable agents:\n{}\n\nRespond with a JSON object: \
             {{\"steps\": [{{\"number\": 1, \"description\": \"...\", \"agent\": \"...\", \"expected_output\": \"...\"}}]}}",
            self.available_agents_summary(),
        );

        let outcome = self.cognitive.one_shot(&prompt, None, DispatchMode::Orchestrator, max_cost_usd).await?;
        let steps = parse_plan(&outcome.output)
            .ok_or_else(|| Error::plan_parse_fail("no valid JSON plan found in planning response"))?;
        Ok((steps, outcome.cost_usd))
    }

    fn available_agents_summary(&self) -> String {
        self.agent_registry
            .list()
            .into_iter()
            .map(|spec| format!("- {} ({}): {}", spec.name, spec.category, spec.description))
            .collect::<Vec<_>>()
            .join("\n")
    }

    async fn execute_step(&self, description: &str, agent_name: &str, max_cost_usd: f64) -> Result<AdapterOutcome> {
        let spec = self.agent_registry.get_or_system_agent(agent_name);
        let event_bus = self.event_bus.clone();
        self.cognitive
            .stream(description, Some(&spec), DispatchMode::Orchestrator, max_cost_usd, |event| {
                if let StreamEvent::ToolUse { name, .. } = event {
                    event_bus.publish(DispatchEvent::new(
                        EventKind::AgentActivity,
                        json!({"activity": format!("Using: {name}()")}),
                    ));
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cognitive::MockBackend;
    use crate::trace_matcher::{MatcherThresholds, TraceMatcher};
    use crate::trace_store::TraceStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A backend that answers the first `query` (the planning call) with a
    /// fixed JSON plan, and every subsequent call (step delegation) with a
    /// fixed-cost success.
    struct PlannedBackend {
        call: AtomicUsize,
        plan_response: String,
        step_cost_usd: f64,
    }

    #[async_trait]
    impl CognitiveBackend for PlannedBackend {
        async fn query(&self, prompt: &str, _system_prompt: Option<&str>) -> Result<Vec<StreamEvent>> {
            let call = self.call.fetch_add(1, Ordering::SeqCst);
            if call == 0 {
                Ok(vec![StreamEvent::Result {
                    success: true,
                    total_cost_usd: 0.0,
                    output: self.plan_response.clone(),
                }])
            } else {
                Ok(vec![StreamEvent::Result {
                    success: true,
                    total_cost_usd: self.step_cost_usd,
                    output: format!("ran: {prompt}"),
                }])
            }
        }
    }

    struct Harness {
        orchestrator: Orchestrator<PlannedBackend>,
        workspace: tempfile::TempDir,
    }

    async fn harness(backend: PlannedBackend) -> Harness {
        let workspace = tempfile::tempdir().unwrap();
        let event_bus = Arc::new(EventBus::new());
        let project_manager = Arc::new(ProjectManager::new(workspace.path()));
        let agent_registry = Arc::new(AgentRegistry::new());
        let store = Arc::new(TraceStore::new(workspace.path()));
        let matcher = Arc::new(TraceMatcher::new(store.clone(), MatcherThresholds::default()));
        let memory_query = Arc::new(MemoryQuery::new(store, matcher));
        let cognitive = Arc::new(CognitiveAdapter::new(Arc::new(backend)));

        let orchestrator = Orchestrator::new(event_bus, project_manager, agent_registry, memory_query, cognitive);
        Harness { orchestrator, workspace }
    }

    #[test]
    fn parse_plan_extracts_steps_from_surrounding_prose() {
        let text = r#"Sure, here is the plan:
            {"steps": [{"number": 1, "description": "gather data", "agent": "researcher"},
                       {"number": 2, "description": "write report", "agent": "writer"}]}
            Let me know if you need changes."#;
        let steps = parse_plan(text).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].agent_name, "researcher");
    }

    #[test]
    fn parse_plan_rejects_zero_step_plans() {
        let text = r#"{"steps": []}"#;
        assert!(parse_plan(text).is_none());
    }

    #[test]
    fn parse_plan_defaults_missing_agent_to_system_agent() {
        let text = r#"{"steps": [{"number": 1, "description": "do it"}]}"#;
        let steps = parse_plan(text).unwrap();
        assert_eq!(steps[0].agent_name, "system-agent");
    }

    #[tokio::test]
    async fn multi_step_plan_completes_fully_within_budget() {
        let backend = PlannedBackend {
            call: AtomicUsize::new(0),
            plan_response: r#"{"steps": [
                {"number": 1, "description": "research the topic", "agent": "system-agent"},
                {"number": 2, "description": "write the summary", "agent": "system-agent"}
            ]}"#
                .to_string(),
            step_cost_usd: 0.1,
        };
        let harness = harness(backend).await;

        let result = harness
            .orchestrator
            .orchestrate("Research quantum computing trends and create a summary report", None, 5.0)
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.total_steps, 2);
        assert_eq!(result.steps_completed, 2);
        drop(harness.workspace);
    }

    #[tokio::test]
    async fn budget_exhaustion_halts_remaining_steps() {
        let backend = PlannedBackend {
            call: AtomicUsize::new(0),
            plan_response: r#"{"steps": [
                {"number": 1, "description": "step one", "agent": "system-agent"},
                {"number": 2, "description": "step two", "agent": "system-agent"},
                {"number": 3, "description": "step three", "agent": "system-agent"}
            ]}"#
                .to_string(),
            step_cost_usd: 0.20,
        };
        let harness = harness(backend).await;

        let result = harness.orchestrator.orchestrate("do three things", None, 0.40).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.total_steps, 3);
        assert_eq!(result.steps_completed, 2);
        assert!((result.cost_usd - 0.40).abs() < 1e-9);
        drop(harness.workspace);
    }

    #[tokio::test]
    async fn unparseable_plan_falls_back_to_single_step() {
        let backend = PlannedBackend {
            call: AtomicUsize::new(0),
            plan_response: "I cannot produce a plan right now.".to_string(),
            step_cost_usd: 0.1,
        };
        let harness = harness(backend).await;

        let result = harness.orchestrator.orchestrate("do something simple", None, 5.0).await.unwrap();

        assert_eq!(result.total_steps, 1);
        assert!(result.success);
        drop(harness.workspace);
    }

    #[tokio::test]
    async fn auto_creates_project_when_none_given() {
        let backend = MockBackend {
            output: r#"{"steps": [{"number": 1, "description": "d", "agent": "system-agent"}]}"#.into(),
            ..Default::default()
        };
        let workspace = tempfile::tempdir().unwrap();
        let event_bus = Arc::new(EventBus::new());
        let project_manager = Arc::new(ProjectManager::new(workspace.path()));
        let agent_registry = Arc::new(AgentRegistry::new());
        let store = Arc::new(TraceStore::new(workspace.path()));
        let matcher = Arc::new(TraceMatcher::new(store.clone(), MatcherThresholds::default()));
        let memory_query = Arc::new(MemoryQuery::new(store, matcher));
        let cognitive = Arc::new(CognitiveAdapter::new(Arc::new(backend)));
        let orchestrator = Orchestrator::new(event_bus, project_manager, agent_registry, memory_query, cognitive);

        let result = orchestrator.orchestrate("build the widget", None, 5.0).await.unwrap();
        assert_eq!(result.total_steps, 1);

        let projects = ProjectManager::new(workspace.path()).list().await.unwrap();
        assert_eq!(projects, vec!["build_the_widget".to_string()]);
    }
}
