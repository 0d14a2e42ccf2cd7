//! The persisted unit of memory: an [`ExecutionTrace`] keyed by a
//! content-derived [`GoalSignature`].
//!
//! Signature derivation mirrors `rlm_core::llm::cache::CacheKey::from_content`'s
//! SHA-256-then-truncate idiom, applied to a normalized goal string so two
//! goals with identical normalized text collide on purpose.

use crate::mode::DispatchMode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A stable short identifier for a goal's normalized text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GoalSignature(pub String);

impl GoalSignature {
    /// Normalize (trim, collapse internal whitespace, lowercase) and hash.
    pub fn of(goal_text: &str) -> Self {
        let normalized = normalize(goal_text);
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        let digest = hasher.finalize();
        Self(format!("{digest:x}")[..16].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for GoalSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// A recorded execution worth remembering, keyed by [`GoalSignature`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub goal_signature: GoalSignature,
    pub goal_text: String,
    pub success_rating: f64,
    pub usage_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub estimated_cost_usd: f64,
    pub estimated_time_secs: f64,
    pub mode: DispatchMode,
    pub tools_used: Option<Vec<String>>,
    pub output_summary: String,
    pub error_notes: Option<String>,
    pub crystallized_into_tool: Option<String>,
}

impl ExecutionTrace {
    /// Build a fresh trace for a goal that has just executed for the first
    /// time. `usage_count` starts at 1 per the invariant in §3.
    pub fn new(
        goal_text: impl Into<String>,
        mode: DispatchMode,
        success_rating: f64,
        estimated_cost_usd: f64,
        estimated_time_secs: f64,
    ) -> Self {
        let goal_text = goal_text.into();
        Self {
            goal_signature: GoalSignature::of(&goal_text),
            goal_text,
            success_rating: success_rating.clamp(0.0, 1.0),
            usage_count: 1,
            created_at: Utc::now(),
            last_used_at: None,
            estimated_cost_usd,
            estimated_time_secs,
            mode,
            tools_used: None,
            output_summary: String::new(),
            error_notes: None,
            crystallized_into_tool: None,
        }
    }

    pub fn with_tools_used(mut self, tools: Vec<String>) -> Self {
        self.tools_used = if tools.is_empty() { None } else { Some(dedupe_ordered(tools)) };
        self
    }

    pub fn with_output_summary(mut self, summary: impl Into<String>) -> Self {
        self.output_summary = summary.into();
        self
    }

    pub fn with_error_notes(mut self, notes: impl Into<String>) -> Self {
        self.error_notes = Some(notes.into());
        self
    }

    /// Whether this trace is eligible for crystallization under the given
    /// thresholds (§4.4); does not itself perform the promotion.
    pub fn is_crystallization_eligible(&self, min_usage: u32, min_success: f64) -> bool {
        self.usage_count >= min_usage && self.success_rating >= min_success
    }

    /// Apply an exponential-moving-average update to `success_rating` with
    /// weight 0.2 for the new observation, and bump usage/last_used_at.
    pub fn record_usage(&mut self, success: bool) {
        const EMA_WEIGHT: f64 = 0.2;
        let observation = if success { 1.0 } else { 0.0 };
        self.success_rating =
            (EMA_WEIGHT * observation + (1.0 - EMA_WEIGHT) * self.success_rating).clamp(0.0, 1.0);
        self.usage_count += 1;
        self.last_used_at = Some(Utc::now());
    }
}

fn dedupe_ordered(items: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    items.into_iter().filter(|item| seen.insert(item.clone())).collect()
}
