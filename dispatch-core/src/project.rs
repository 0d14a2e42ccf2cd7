//! Per-project directories and per-run execution state (§3, §4.6).
//!
//! `run-id` follows `rlm_core::reasoning::types::TraceId`'s typed-UUID-wrapper
//! idiom. Persistence is write-to-temp-then-rename, the same pattern used by
//! [`crate::trace_store::TraceStore`].

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// A project's four standard subpaths, created eagerly on `create()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub description: Option<String>,
    pub root: PathBuf,
}

impl Project {
    pub fn components_dir(&self) -> PathBuf {
        self.root.join("components")
    }
    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output")
    }
    pub fn memory_dir(&self) -> PathBuf {
        self.root.join("memory")
    }
    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }
}

/// Creates and looks up [`Project`] directories under `<workspace>/projects/`.
/// Never deletes a project; `create` is idempotent by name.
pub struct ProjectManager {
    projects_root: PathBuf,
}

impl ProjectManager {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            projects_root: workspace.into().join("projects"),
        }
    }

    /// Derive a project name from the first three tokens of a goal, matching
    /// `SystemAgent.orchestrate`'s `"_".join(goal.split()[:3])` heuristic.
    pub fn auto_name(goal: &str) -> String {
        let name: String = goal
            .split_whitespace()
            .take(3)
            .collect::<Vec<_>>()
            .join("_")
            .to_lowercase();
        if name.is_empty() {
            "untitled_project".to_string()
        } else {
            name
        }
    }

    /// Idempotent: returns the existing project directory on a name
    /// collision rather than erroring or overwriting.
    pub async fn create(&self, name: &str, description: Option<String>) -> Result<Project> {
        let root = self.projects_root.join(name);
        let project = Project {
            name: name.to_string(),
            description,
            root: root.clone(),
        };

        for dir in [
            project.components_dir(),
            project.output_dir(),
            project.memory_dir(),
            project.state_dir(),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
        }

        Ok(project)
    }

    pub async fn get(&self, name: &str) -> Option<Project> {
        let root = self.projects_root.join(name);
        if tokio::fs::metadata(&root).await.is_ok() {
            Some(Project {
                name: name.to_string(),
                description: None,
                root,
            })
        } else {
            None
        }
    }

    pub async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.projects_root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(err) => return Err(err.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Status of a single [`ExecutionStep`]. Transitions only move forward:
/// `pending -> in_progress -> {completed, failed}`, with the one exception
/// of `pending -> failed` for a step that never got to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub number: u32,
    pub description: String,
    pub agent_name: String,
    pub status: StepStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Reserved for a future run-abort-on-failure extension; the halting
    /// logic in `orchestrator` does not read this yet (§9 open question).
    #[serde(default)]
    pub critical: bool,
}

impl ExecutionStep {
    pub fn new(number: u32, description: impl Into<String>, agent_name: impl Into<String>) -> Self {
        Self {
            number,
            description: description.into(),
            agent_name: agent_name.into(),
            status: StepStatus::Pending,
            result: None,
            error: None,
            critical: false,
        }
    }

    /// Enforces the monotonic transition rule described on [`StepStatus`].
    fn validate_transition(&self, next: StepStatus) -> Result<()> {
        use StepStatus::*;
        let allowed = matches!(
            (self.status, next),
            (Pending, InProgress)
                | (Pending, Failed)
                | (InProgress, Completed)
                | (InProgress, Failed)
        );
        if allowed {
            Ok(())
        } else {
            Err(Error::internal(format!(
                "invalid step transition {:?} -> {:?} for step {}",
                self.status, next, self.number
            )))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub ts: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
}

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// Per-run state: the goal, its plan, variables, an append-only event log,
/// and constraints. Exclusive to one orchestrator run; read-only to
/// external observers while the run is live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub run_id: Uuid,
    pub goal: String,
    pub plan: Vec<ExecutionStep>,
    pub variables: HashMap<String, Value>,
    pub events: Vec<ExecutionEvent>,
    pub constraints: HashMap<String, Value>,
    pub final_status: FinalStatus,
}

impl ExecutionState {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            goal: goal.into(),
            plan: Vec::new(),
            variables: HashMap::new(),
            events: Vec::new(),
            constraints: HashMap::new(),
            final_status: FinalStatus::Running,
        }
    }

    pub fn summary(&self) -> StateSummary {
        let total = self.plan.len();
        let completed = self.plan.iter().filter(|s| s.status == StepStatus::Completed).count();
        let failed = self.plan.iter().filter(|s| s.status == StepStatus::Failed).count();
        StateSummary { total, completed, failed }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Owns one [`ExecutionState`] per active run and persists it to
/// `<project>/state/<run-id>.json` atomically on every mutation.
pub struct StateManager {
    project: Project,
    state: ExecutionState,
    plan_set: bool,
}

impl StateManager {
    pub fn initialize(project: Project, goal: impl Into<String>) -> Self {
        Self {
            project,
            state: ExecutionState::new(goal),
            plan_set: false,
        }
    }

    pub fn state(&self) -> &ExecutionState {
        &self.state
    }

    pub fn run_id(&self) -> Uuid {
        self.state.run_id
    }

    fn state_path(&self) -> PathBuf {
        self.project.state_dir().join(format!("{}.json", self.state.run_id))
    }

    async fn persist(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.project.state_dir()).await?;
        let path = self.state_path();
        let text = serde_json::to_string_pretty(&self.state)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, text.as_bytes()).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// May be called exactly once per run; a second call is an internal
    /// error since the plan is the run's contract (§3).
    pub async fn set_plan(&mut self, steps: Vec<ExecutionStep>) -> Result<()> {
        if self.plan_set {
            return Err(Error::internal("plan already set for this run"));
        }
        self.state.plan = steps;
        self.plan_set = true;
        self.persist().await
    }

    pub async fn update_step(
        &mut self,
        number: u32,
        status: StepStatus,
        result: Option<Value>,
        error: Option<String>,
    ) -> Result<()> {
        let step = self
            .state
            .plan
            .iter_mut()
            .find(|s| s.number == number)
            .ok_or_else(|| Error::internal(format!("no such step {number}")))?;
        step.validate_transition(status)?;
        step.status = status;
        if result.is_some() {
            step.result = result;
        }
        if error.is_some() {
            step.error = error;
        }
        self.persist().await
    }

    pub async fn log_event(&mut self, event_type: impl Into<String>, data: Value) -> Result<()> {
        self.state.events.push(ExecutionEvent {
            ts: Utc::now(),
            event_type: event_type.into(),
            data,
        });
        self.persist().await
    }

    pub async fn set_constraint(&mut self, key: impl Into<String>, value: Value) -> Result<()> {
        self.state.constraints.insert(key.into(), value);
        self.persist().await
    }

    pub async fn set_variable(&mut self, key: impl Into<String>, value: Value) -> Result<()> {
        self.state.variables.insert(key.into(), value);
        self.persist().await
    }

    pub async fn mark_complete(&mut self, success: bool) -> Result<()> {
        self.state.final_status = if success { FinalStatus::Succeeded } else { FinalStatus::Failed };
        self.persist().await
    }

    pub async fn mark_cancelled(&mut self) -> Result<()> {
        self.state.final_status = FinalStatus::Cancelled;
        self.persist().await
    }

    pub fn summary(&self) -> StateSummary {
        self.state.summary()
    }

    pub fn project_root(&self) -> &Path {
        &self.project.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn create_is_idempotent_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProjectManager::new(dir.path());
        let first = manager.create("my_project", None).await.unwrap();
        let second = manager.create("my_project", Some("desc".into())).await.unwrap();
        assert_eq!(first.root, second.root);
    }

    #[tokio::test]
    async fn create_eagerly_makes_all_four_subpaths() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProjectManager::new(dir.path());
        let project = manager.create("proj", None).await.unwrap();
        for path in [
            project.components_dir(),
            project.output_dir(),
            project.memory_dir(),
            project.state_dir(),
        ] {
            assert!(tokio::fs::metadata(&path).await.is_ok());
        }
    }

    #[test]
    fn auto_name_takes_first_three_tokens() {
        assert_eq!(
            ProjectManager::auto_name("Research quantum computing trends and summarize"),
            "research_quantum_computing"
        );
    }

    #[tokio::test]
    async fn step_transitions_reject_backward_moves() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProjectManager::new(dir.path());
        let project = manager.create("proj", None).await.unwrap();
        let mut state = StateManager::initialize(project, "goal");
        state
            .set_plan(vec![ExecutionStep::new(1, "step one", "system-agent")])
            .await
            .unwrap();

        state.update_step(1, StepStatus::InProgress, None, None).await.unwrap();
        state.update_step(1, StepStatus::Completed, Some(json!("ok")), None).await.unwrap();

        let err = state.update_step(1, StepStatus::InProgress, None, None).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn pending_to_failed_is_allowed_for_prestart_failures() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProjectManager::new(dir.path());
        let project = manager.create("proj", None).await.unwrap();
        let mut state = StateManager::initialize(project, "goal");
        state
            .set_plan(vec![ExecutionStep::new(1, "step one", "system-agent")])
            .await
            .unwrap();

        state
            .update_step(1, StepStatus::Failed, None, Some("BUDGET_EXCEEDED".into()))
            .await
            .unwrap();
        assert_eq!(state.state().plan[0].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn set_plan_twice_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProjectManager::new(dir.path());
        let project = manager.create("proj", None).await.unwrap();
        let mut state = StateManager::initialize(project, "goal");
        state.set_plan(vec![]).await.unwrap();
        assert!(state.set_plan(vec![]).await.is_err());
    }

    #[tokio::test]
    async fn state_persists_to_disk_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let manager = ProjectManager::new(dir.path());
        let project = manager.create("proj", None).await.unwrap();
        let run_id;
        {
            let mut state = StateManager::initialize(project.clone(), "goal");
            run_id = state.run_id();
            state.log_event("STARTED", json!({})).await.unwrap();
        }
        let path = project.state_dir().join(format!("{run_id}.json"));
        assert!(tokio::fs::metadata(&path).await.is_ok());
    }

    #[test]
    fn summary_counts_completed_and_failed() {
        let mut state = ExecutionState::new("goal");
        state.plan = vec![
            ExecutionStep {
                status: StepStatus::Completed,
                ..ExecutionStep::new(1, "a", "system-agent")
            },
            ExecutionStep {
                status: StepStatus::Failed,
                ..ExecutionStep::new(2, "b", "system-agent")
            },
            ExecutionStep::new(3, "c", "system-agent"),
        ];
        let summary = state.summary();
        assert_eq!(summary, StateSummary { total: 3, completed: 1, failed: 1 });
    }
}
