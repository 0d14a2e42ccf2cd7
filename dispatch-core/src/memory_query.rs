//! Read-only aggregation over [`TraceStore`] contents (§4.5).
//!
//! A pure function of whatever is currently on disk: no caching, no
//! mutation. Grounded in `original_source/llmos/interfaces/orchestrator.py`'s
//! `_consult_memory`, which builds the same shape of `recommendations` list
//! from a matched trace.

use crate::trace::ExecutionTrace;
use crate::trace_matcher::TraceMatcher;
use crate::trace_store::TraceStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Aggregate counters over the trace store, for dashboards/diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryStatistics {
    pub total: usize,
    pub high_confidence_count: usize,
    pub avg_success: f64,
    pub facts_count: usize,
    pub insights_count: usize,
}

/// Read-only aggregator over a [`TraceStore`].
pub struct MemoryQuery {
    store: Arc<TraceStore>,
    matcher: Arc<TraceMatcher>,
}

impl MemoryQuery {
    pub fn new(store: Arc<TraceStore>, matcher: Arc<TraceMatcher>) -> Self {
        Self { store, matcher }
    }

    /// `high_confidence_count` counts traces with `success_rating >= 0.9`.
    /// `facts_count`/`insights_count` are derived counters this
    /// implementation defines in the absence of a separate facts/insights
    /// store (see DESIGN.md): crystallized traces are "facts", traces reused
    /// more than once are "insights".
    pub async fn statistics(&self) -> crate::error::Result<MemoryStatistics> {
        let traces = self.store.all().await?;
        if traces.is_empty() {
            return Ok(MemoryStatistics::default());
        }

        let total = traces.len();
        let high_confidence_count = traces.iter().filter(|t| t.success_rating >= 0.9).count();
        let avg_success = traces.iter().map(|t| t.success_rating).sum::<f64>() / total as f64;
        let facts_count = traces.iter().filter(|t| t.crystallized_into_tool.is_some()).count();
        let insights_count = traces.iter().filter(|t| t.usage_count > 1).count();

        Ok(MemoryStatistics {
            total,
            high_confidence_count,
            avg_success,
            facts_count,
            insights_count,
        })
    }

    /// Human-readable hints derived from the best semantic match, e.g.
    /// `"similar task executed 5 times with 95% success rate"`.
    pub async fn recommendations(&self, goal: &str) -> Vec<String> {
        let Some((trace, _confidence)) = self.matcher.semantic(goal, 0.5).await else {
            return Vec::new();
        };

        vec![format!(
            "similar task executed {} time{} with {:.0}% success rate",
            trace.usage_count,
            if trace.usage_count == 1 { "" } else { "s" },
            trace.success_rating * 100.0
        )]
    }

    /// Up to `limit` traces scoring at or above `min_confidence`, most
    /// similar first.
    pub async fn find_similar(
        &self,
        goal: &str,
        limit: usize,
        min_confidence: f64,
    ) -> crate::error::Result<Vec<ExecutionTrace>> {
        let mut scored = Vec::new();
        for trace in self.store.all().await? {
            let score = self.matcher.score_against(goal, &trace).await;
            if score >= min_confidence {
                scored.push((score, trace));
            }
        }
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored.into_iter().take(limit).map(|(_, trace)| trace).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::DispatchMode;
    use crate::trace_matcher::MatcherThresholds;

    async fn setup() -> (Arc<TraceStore>, Arc<TraceMatcher>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TraceStore::new(dir.path()));
        let matcher = Arc::new(TraceMatcher::new(store.clone(), MatcherThresholds::default()));
        (store, matcher, dir)
    }

    #[tokio::test]
    async fn statistics_on_empty_store_is_all_zero() {
        let (store, matcher, _dir) = setup().await;
        let query = MemoryQuery::new(store, matcher);
        let stats = query.statistics().await.unwrap();
        assert_eq!(stats, MemoryStatistics::default());
    }

    #[tokio::test]
    async fn statistics_count_facts_and_insights() {
        let (store, matcher, _dir) = setup().await;

        let mut crystallized = ExecutionTrace::new("check prime", DispatchMode::Learner, 0.97, 0.1, 0.1);
        crystallized.usage_count = 6;
        crystallized.crystallized_into_tool = Some("is_prime".into());
        store.save(&crystallized).await.unwrap();

        let mut reused = ExecutionTrace::new("create a file", DispatchMode::Mixed, 0.8, 0.2, 0.3);
        reused.usage_count = 3;
        store.save(&reused).await.unwrap();

        let fresh = ExecutionTrace::new("one off task", DispatchMode::Learner, 0.6, 0.5, 1.0);
        store.save(&fresh).await.unwrap();

        let query = MemoryQuery::new(store, matcher);
        let stats = query.statistics().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.facts_count, 1);
        assert_eq!(stats.insights_count, 2);
    }

    #[tokio::test]
    async fn recommendations_mention_usage_and_success() {
        let (store, matcher, _dir) = setup().await;
        let mut trace = ExecutionTrace::new("create a python file", DispatchMode::Mixed, 0.95, 0.2, 1.0);
        trace.usage_count = 5;
        store.save(&trace).await.unwrap();

        let query = MemoryQuery::new(store, matcher);
        let recs = query.recommendations("create a python file named helpers.py").await;
        assert_eq!(recs.len(), 1);
        assert!(recs[0].contains("5 times"));
        assert!(recs[0].contains("95%"));
    }

    #[tokio::test]
    async fn find_similar_respects_limit_and_confidence_floor() {
        let (store, matcher, _dir) = setup().await;
        for i in 0..5 {
            let trace = ExecutionTrace::new(
                format!("create a python file variant {i}"),
                DispatchMode::Learner,
                0.9,
                0.1,
                0.1,
            );
            store.save(&trace).await.unwrap();
        }

        let query = MemoryQuery::new(store, matcher);
        let similar = query.find_similar("create a python file variant 2", 2, 0.3).await.unwrap();
        assert!(similar.len() <= 2);
    }
}
