//! Pluggable policy for picking a [`DispatchMode`] (§4.8).
//!
//! The multi-step-complexity signal regexes follow
//! `rlm_core::complexity::PatternClassifier`'s `LazyLock<Regex>` static idiom.

use crate::config::Config;
use crate::mode::DispatchMode;
use crate::trace::ExecutionTrace;
use crate::trace_matcher::TraceMatcher;
use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;
use tracing::warn;

static CONJUNCTION_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)( and |\bthen\b|;)").unwrap());

static IMPERATIVE_START_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(^|[.!?]\s+)(create|build|write|run|fix|add|remove|update|deploy|test|refactor|generate|install|configure)\b")
        .unwrap()
});

/// Goal-level signal that a goal likely needs multi-step decomposition:
/// a conjunction/semicolon, or more than one imperative verb at a sentence
/// start.
fn signals_multi_step(goal: &str) -> bool {
    if CONJUNCTION_PATTERN.is_match(goal) {
        return true;
    }
    IMPERATIVE_START_PATTERN.find_iter(goal).count() > 1
}

/// Inputs available to a [`ModeStrategy::decide`] call.
pub struct ModeContext<'a> {
    pub goal: &'a str,
    pub trace_matcher: &'a TraceMatcher,
    pub config: &'a Config,
}

/// The outcome of a mode decision: which mode, how confident, the matched
/// trace (if any), and a human-readable reason for diagnostics/logging.
#[derive(Debug, Clone)]
pub struct ModeDecision {
    pub mode: DispatchMode,
    pub confidence: f64,
    pub trace: Option<ExecutionTrace>,
    pub reasoning: String,
}

/// A stateless, pure function from [`ModeContext`] to [`ModeDecision`].
#[async_trait]
pub trait ModeStrategy: Send + Sync {
    async fn decide(&self, context: &ModeContext<'_>) -> ModeDecision;
}

/// Default strategy: delegate to `TraceMatcher::find_smart`, then fall
/// through to ORCHESTRATOR/LEARNER when nothing was found.
pub struct AutoStrategy;

#[async_trait]
impl ModeStrategy for AutoStrategy {
    async fn decide(&self, context: &ModeContext<'_>) -> ModeDecision {
        let (trace, confidence, hint) = context.trace_matcher.find_smart(context.goal).await;

        if trace.is_some() {
            let reasoning = format!("matched trace at confidence {confidence:.2}, mode {hint}");
            return ModeDecision { mode: hint, confidence, trace, reasoning };
        }

        if signals_multi_step(context.goal) {
            ModeDecision {
                mode: DispatchMode::Orchestrator,
                confidence: 0.0,
                trace: None,
                reasoning: "no trace found; goal signals multi-step complexity".to_string(),
            }
        } else {
            ModeDecision {
                mode: DispatchMode::Learner,
                confidence: 0.0,
                trace: None,
                reasoning: "no trace found; goal appears single-step".to_string(),
            }
        }
    }
}

/// Lowers the FOLLOWER/MIXED thresholds to favor reuse over fresh
/// exploration; never escalates to ORCHESTRATOR on its own.
pub struct CostOptimizedStrategy;

#[async_trait]
impl ModeStrategy for CostOptimizedStrategy {
    async fn decide(&self, context: &ModeContext<'_>) -> ModeDecision {
        if let Some(trace) = context.trace_matcher.exact(context.goal).await {
            return ModeDecision {
                mode: DispatchMode::Follower,
                confidence: 1.0,
                trace: Some(trace),
                reasoning: "exact match, cost-optimized prefers reuse".to_string(),
            };
        }

        match context.trace_matcher.semantic(context.goal, 0.5).await {
            Some((trace, confidence)) if confidence >= 0.75 => ModeDecision {
                mode: DispatchMode::Follower,
                confidence,
                trace: Some(trace),
                reasoning: "cost-optimized follower threshold (0.75) met".to_string(),
            },
            Some((trace, confidence)) => ModeDecision {
                mode: DispatchMode::Mixed,
                confidence,
                trace: Some(trace),
                reasoning: "cost-optimized mixed threshold (0.5) met".to_string(),
            },
            None => ModeDecision {
                mode: DispatchMode::Learner,
                confidence: 0.0,
                trace: None,
                reasoning: "no trace met cost-optimized thresholds".to_string(),
            },
        }
    }
}

/// Prefers the cheapest available mode; never returns MIXED since the
/// guidance-assisted call it implies is expensive.
pub struct SpeedOptimizedStrategy;

#[async_trait]
impl ModeStrategy for SpeedOptimizedStrategy {
    async fn decide(&self, context: &ModeContext<'_>) -> ModeDecision {
        let (trace, confidence, hint) = context.trace_matcher.find_smart(context.goal).await;
        match (trace, hint) {
            (Some(trace), DispatchMode::Crystallized) => ModeDecision {
                mode: DispatchMode::Crystallized,
                confidence,
                trace: Some(trace),
                reasoning: "speed-optimized prefers crystallized replay".to_string(),
            },
            (Some(trace), _) if confidence >= 0.92 => ModeDecision {
                mode: DispatchMode::Follower,
                confidence,
                trace: Some(trace),
                reasoning: "speed-optimized follower threshold met".to_string(),
            },
            _ => ModeDecision {
                mode: DispatchMode::Learner,
                confidence: 0.0,
                trace: None,
                reasoning: "speed-optimized skips mixed; falling through to learner".to_string(),
            },
        }
    }
}

/// Always LEARNER, regardless of what memory holds.
pub struct ForcedLearnerStrategy;

#[async_trait]
impl ModeStrategy for ForcedLearnerStrategy {
    async fn decide(&self, _context: &ModeContext<'_>) -> ModeDecision {
        ModeDecision {
            mode: DispatchMode::Learner,
            confidence: 0.0,
            trace: None,
            reasoning: "forced-learner strategy".to_string(),
        }
    }
}

/// Always FOLLOWER when a trace exists; downgrades to LEARNER with a
/// diagnostic warning when no trace is available to follow.
pub struct ForcedFollowerStrategy;

#[async_trait]
impl ModeStrategy for ForcedFollowerStrategy {
    async fn decide(&self, context: &ModeContext<'_>) -> ModeDecision {
        match context.trace_matcher.exact(context.goal).await {
            Some(trace) => ModeDecision {
                mode: DispatchMode::Follower,
                confidence: 1.0,
                trace: Some(trace),
                reasoning: "forced-follower strategy".to_string(),
            },
            None => {
                warn!(goal = %context.goal, "forced-follower requested with no matching trace, downgrading to learner");
                ModeDecision {
                    mode: DispatchMode::Learner,
                    confidence: 0.0,
                    trace: None,
                    reasoning: "forced-follower infeasible, no trace found; downgraded to learner".to_string(),
                }
            }
        }
    }
}

/// Resolve a strategy by name, as configured in `dispatcher.mode_strategy`.
/// Unknown names fall back to `auto` (the config layer validates the value
/// at load time; this is the runtime default-of-last-resort).
pub fn strategy_for_name(name: &str) -> Box<dyn ModeStrategy> {
    match name {
        "cost-optimized" => Box::new(CostOptimizedStrategy),
        "speed-optimized" => Box::new(SpeedOptimizedStrategy),
        "forced-learner" => Box::new(ForcedLearnerStrategy),
        "forced-follower" => Box::new(ForcedFollowerStrategy),
        _ => Box::new(AutoStrategy),
    }
}
