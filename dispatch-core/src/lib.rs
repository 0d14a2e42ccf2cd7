//! # dispatch-core
//!
//! A cost-aware execution dispatcher and learning memory for interactive
//! LLM-driven task execution. Given a natural-language goal, the
//! [`Dispatcher`] selects among several execution strategies — replay a
//! previously recorded trace, use a trace as few-shot guidance, reason from
//! scratch, or orchestrate a multi-agent plan — so repeated or
//! near-repeated goals are served at a fraction of the cost of fresh LLM
//! reasoning, under a strict token budget.
//!
//! ## Core Components
//!
//! - **[`event`]**: in-process pub/sub for lifecycle events.
//! - **[`economy`]**: the running budget, checked before every paid path.
//! - **[`trace`] / [`trace_store`] / [`trace_matcher`]**: a content-addressed
//!   store of past executions with hash-exact and similarity-scored lookup.
//! - **[`memory_query`]**: read-only aggregation over the trace store.
//! - **[`project`]**: per-run directories, plans, and persisted state.
//! - **[`agent`]**: named agent specs (prompt + tool whitelist).
//! - **[`mode`] / [`mode_strategy`]**: the mode taxonomy and the pluggable
//!   policy that picks one.
//! - **[`dispatcher`]**: the top-level entry point tying all of the above
//!   together.
//! - **[`orchestrator`]**: goal decomposition and per-step delegation.
//! - **[`cognitive`]**: the adapter around an opaque LLM backend, with trace
//!   capture and hooks.
//!
//! ## Example
//!
//! ```rust,ignore
//! use dispatch_core::{Config, Dispatcher, DispatchMode};
//!
//! let config = Config::development();
//! // ... construct a Dispatcher from config, a CognitiveBackend, and a
//! // workspace path (see the `dispatch` binary's bootstrap routine) ...
//! let outcome = dispatcher.dispatch("check prime", DispatchMode::Auto, None, 1.0).await;
//! println!("mode={} cost={:.4}", outcome.mode, outcome.cost_usd);
//! ```

pub mod agent;
pub mod cognitive;
pub mod config;
pub mod dispatcher;
pub mod economy;
pub mod error;
pub mod event;
pub mod memory_query;
pub mod mode;
pub mod mode_strategy;
pub mod orchestrator;
pub mod project;
pub mod trace;
pub mod trace_matcher;
pub mod trace_store;

pub use agent::{AgentFactory, AgentRegistry, AgentSpec, AgentType, ALLOWED_TOOLS};
pub use cognitive::{
    AdapterOutcome, CognitiveAdapter, CognitiveBackend, HookContext, HookHandler, HookRegistry,
    HookResult, HookTrigger, MockBackend, StreamEvent, TraceBuilder,
};
pub use config::{Config, DispatcherConfig, KernelConfig, MemoryConfig, SdkConfig};
pub use dispatcher::{CrystallizedTool, DispatchOutcome, Dispatcher};
pub use economy::{SpendLogEntry, TokenEconomy};
pub use error::{Error, Result};
pub use event::{DispatchEvent, EventBus, EventKind};
pub use memory_query::{MemoryQuery, MemoryStatistics};
pub use mode::DispatchMode;
pub use mode_strategy::{strategy_for_name, ModeContext, ModeDecision, ModeStrategy};
pub use orchestrator::{OrchestrationResult, Orchestrator};
pub use project::{
    ExecutionEvent, ExecutionState, ExecutionStep, FinalStatus, Project, ProjectManager,
    StateManager, StateSummary, StepStatus,
};
pub use trace::{ExecutionTrace, GoalSignature};
pub use trace_matcher::{JaccardSimilarity, MatcherThresholds, SimilarityStrategy, TraceMatcher};
pub use trace_store::TraceStore;
