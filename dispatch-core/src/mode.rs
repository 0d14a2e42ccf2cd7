//! The execution-mode taxonomy shared by the matcher, strategy, and dispatcher.

use serde::{Deserialize, Serialize};

/// An execution path the dispatcher can take for a given goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchMode {
    /// Auto-detect: let `ModeStrategy` pick one of the modes below.
    Auto,
    /// Invoke a registered native tool directly; no LLM call.
    Crystallized,
    /// Replay a recorded trace's tool sequence deterministically.
    Follower,
    /// One LLM call seeded with a prior trace as few-shot guidance.
    Mixed,
    /// Full LLM reasoning from scratch.
    Learner,
    /// Decompose into steps and delegate to named agents.
    Orchestrator,
}

impl DispatchMode {
    /// Whether this mode, once decided, never incurs a paid LLM call by itself.
    pub fn is_free(&self) -> bool {
        matches!(self, Self::Crystallized | Self::Follower)
    }
}

impl std::fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Auto => "AUTO",
            Self::Crystallized => "CRYSTALLIZED",
            Self::Follower => "FOLLOWER",
            Self::Mixed => "MIXED",
            Self::Learner => "LEARNER",
            Self::Orchestrator => "ORCHESTRATOR",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_modes_are_follower_and_crystallized() {
        assert!(DispatchMode::Follower.is_free());
        assert!(DispatchMode::Crystallized.is_free());
        assert!(!DispatchMode::Mixed.is_free());
        assert!(!DispatchMode::Learner.is_free());
        assert!(!DispatchMode::Orchestrator.is_free());
    }

    #[test]
    fn display_matches_wire_taxonomy() {
        assert_eq!(DispatchMode::Orchestrator.to_string(), "ORCHESTRATOR");
        assert_eq!(DispatchMode::Mixed.to_string(), "MIXED");
    }
}
