//! Hash-exact and similarity-scored trace lookup (§4.4).
//!
//! The similarity function is a pluggable [`SimilarityStrategy`]; the
//! always-available reference implementation is [`JaccardSimilarity`]
//! (token-set Jaccard blended with a containment term, plus a usage/success
//! bonus). An optional, `llm-similarity`-feature-gated [`CognitiveSimilarity`]
//! delegates to a backend for one paid classification call per dispatch.

use crate::mode::DispatchMode;
use crate::trace::{ExecutionTrace, GoalSignature};
use crate::trace_store::TraceStore;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

/// A pluggable goal-to-trace similarity function, scored in `[0, 1]`.
#[async_trait]
pub trait SimilarityStrategy: Send + Sync {
    async fn score(&self, goal: &str, trace: &ExecutionTrace) -> f64;
}

/// Token-set Jaccard overlap blended with a containment (overlap
/// coefficient) term, with a small bonus proportional to
/// `log(usage_count + 1) * success_rating` for traces that have proven
/// themselves repeatedly.
///
/// Jaccard alone penalizes a goal that simply adds detail to a known one
/// (e.g. `"Create a Python file"` vs `"Create a Python file named
/// helpers.py"`) almost as much as an unrelated goal of the same size,
/// since the union grows while the intersection doesn't. Averaging in the
/// overlap coefficient (`intersection / min(|a|, |b|)`) rewards strict or
/// near-strict containment, so a more specific restatement of a known goal
/// still lands as a credible partial match instead of falling all the way
/// to LEARNER.
pub struct JaccardSimilarity {
    bonus_weight: f64,
}

impl Default for JaccardSimilarity {
    fn default() -> Self {
        Self { bonus_weight: 0.05 }
    }
}

impl JaccardSimilarity {
    pub fn with_bonus_weight(bonus_weight: f64) -> Self {
        Self { bonus_weight }
    }
}

fn token_set(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Fraction of the smaller token set contained in the larger one; 1.0 when
/// one set is a subset of the other.
fn overlap_coefficient(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let min_len = a.len().min(b.len()) as f64;
    if min_len == 0.0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / min_len
}

#[async_trait]
impl SimilarityStrategy for JaccardSimilarity {
    async fn score(&self, goal: &str, trace: &ExecutionTrace) -> f64 {
        let goal_tokens = token_set(goal);
        let trace_tokens = token_set(&trace.goal_text);
        let combined = (jaccard(&goal_tokens, &trace_tokens) + overlap_coefficient(&goal_tokens, &trace_tokens)) / 2.0;
        let bonus =
            ((trace.usage_count as f64) + 1.0).ln() * trace.success_rating * self.bonus_weight;
        (combined + bonus).min(1.0)
    }
}

/// Backend able to classify goal/trace similarity via a single paid call.
#[cfg(feature = "llm-similarity")]
#[async_trait]
pub trait SimilarityBackend: Send + Sync {
    async fn classify_similarity(&self, goal: &str, trace_goal: &str) -> crate::error::Result<f64>;
}

/// Delegates to a [`SimilarityBackend`], bounded to one paid call per
/// dispatch via [`CognitiveSimilarity::reset_call_budget`]; subsequent
/// scoring within the same dispatch falls back to [`JaccardSimilarity`].
#[cfg(feature = "llm-similarity")]
pub struct CognitiveSimilarity<B> {
    backend: Arc<B>,
    fallback: JaccardSimilarity,
    used: std::sync::atomic::AtomicBool,
}

#[cfg(feature = "llm-similarity")]
impl<B: SimilarityBackend> CognitiveSimilarity<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            fallback: JaccardSimilarity::default(),
            used: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Call at the start of each dispatch to re-arm the one-call budget.
    pub fn reset_call_budget(&self) {
        self.used.store(false, std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(feature = "llm-similarity")]
#[async_trait]
impl<B: SimilarityBackend> SimilarityStrategy for CognitiveSimilarity<B> {
    async fn score(&self, goal: &str, trace: &ExecutionTrace) -> f64 {
        if self.used.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return self.fallback.score(goal, trace).await;
        }
        match self.backend.classify_similarity(goal, &trace.goal_text).await {
            Ok(score) => score.clamp(0.0, 1.0),
            Err(_) => self.fallback.score(goal, trace).await,
        }
    }
}

/// Confidence thresholds and crystallization gating for [`TraceMatcher`].
#[derive(Debug, Clone, Copy)]
pub struct MatcherThresholds {
    pub follower: f64,
    pub mixed: f64,
    pub auto_crystallization: bool,
}

impl Default for MatcherThresholds {
    fn default() -> Self {
        Self {
            follower: 0.92,
            mixed: 0.75,
            auto_crystallization: false,
        }
    }
}

/// Hash-exact plus similarity-scored trace lookup with confidence-band mode
/// hints (§4.4).
pub struct TraceMatcher {
    store: Arc<TraceStore>,
    strategy: Arc<dyn SimilarityStrategy>,
    thresholds: MatcherThresholds,
}

impl TraceMatcher {
    pub fn new(store: Arc<TraceStore>, thresholds: MatcherThresholds) -> Self {
        Self {
            store,
            strategy: Arc::new(JaccardSimilarity::default()),
            thresholds,
        }
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn SimilarityStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    /// Score a single goal/trace pair through the configured strategy,
    /// exposed for read-only aggregators like `MemoryQuery` that need a
    /// score without the exact/semantic trace-selection logic.
    pub async fn score_against(&self, goal: &str, trace: &ExecutionTrace) -> f64 {
        self.strategy.score(goal, trace).await
    }

    /// Exact match by goal signature; confidence is always 1.0 when found.
    pub async fn exact(&self, goal: &str) -> Option<ExecutionTrace> {
        let signature = GoalSignature::of(goal);
        self.store.load(&signature).await
    }

    /// Highest-scoring trace at or above `min_confidence`, ties broken by
    /// higher `usage_count`, then higher `success_rating`, then most recent
    /// `last_used_at` (the dispatcher's tie-break policy, §4.9).
    pub async fn semantic(&self, goal: &str, min_confidence: f64) -> Option<(ExecutionTrace, f64)> {
        let traces = self.store.all().await.ok()?;
        let mut best: Option<(ExecutionTrace, f64)> = None;

        for trace in traces {
            let score = self.strategy.score(goal, &trace).await;
            if score < min_confidence {
                continue;
            }
            best = Some(match best {
                None => (trace, score),
                Some((best_trace, best_score)) => {
                    if prefer(&trace, score, &best_trace, best_score) {
                        (trace, score)
                    } else {
                        (best_trace, best_score)
                    }
                }
            });
        }

        best
    }

    /// The matcher's top-level API: exact match first, then semantic,
    /// mapped onto a mode hint by confidence band (§4.4).
    pub async fn find_smart(&self, goal: &str) -> (Option<ExecutionTrace>, f64, DispatchMode) {
        if let Some(trace) = self.exact(goal).await {
            let hint = self.mode_hint_for(&trace, 1.0);
            return (Some(trace), 1.0, hint);
        }

        match self.semantic(goal, self.thresholds.mixed).await {
            Some((trace, confidence)) => {
                let hint = self.mode_hint_for(&trace, confidence);
                (Some(trace), confidence, hint)
            }
            None => (None, 0.0, DispatchMode::Learner),
        }
    }

    fn mode_hint_for(&self, trace: &ExecutionTrace, confidence: f64) -> DispatchMode {
        if trace.crystallized_into_tool.is_some() && self.thresholds.auto_crystallization {
            return DispatchMode::Crystallized;
        }
        if confidence >= self.thresholds.follower {
            DispatchMode::Follower
        } else if confidence >= self.thresholds.mixed {
            DispatchMode::Mixed
        } else {
            DispatchMode::Learner
        }
    }
}

/// True if `candidate` should replace `incumbent` as the best match.
fn prefer(
    candidate: &ExecutionTrace,
    candidate_score: f64,
    incumbent: &ExecutionTrace,
    incumbent_score: f64,
) -> bool {
    if candidate_score != incumbent_score {
        return candidate_score > incumbent_score;
    }
    if candidate.usage_count != incumbent.usage_count {
        return candidate.usage_count > incumbent.usage_count;
    }
    if candidate.success_rating != incumbent.success_rating {
        return candidate.success_rating > incumbent.success_rating;
    }
    candidate.last_used_at > incumbent.last_used_at
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::DispatchMode;

    fn trace_with(goal: &str, usage_count: u32, success_rating: f64) -> ExecutionTrace {
        let mut t = ExecutionTrace::new(goal, DispatchMode::Learner, success_rating, 0.5, 1.0);
        t.usage_count = usage_count;
        t.success_rating = success_rating;
        t
    }

    #[tokio::test]
    async fn jaccard_identical_text_scores_near_one() {
        let strategy = JaccardSimilarity::default();
        let trace = trace_with("create a python file", 1, 0.5);
        let score = strategy.score("create a python file", &trace).await;
        assert!(score >= 0.99, "expected near-1.0, got {score}");
    }

    #[tokio::test]
    async fn jaccard_superset_goal_scores_in_the_mixed_band() {
        let strategy = JaccardSimilarity::default();
        let trace = trace_with("Create a Python file", 5, 0.95);
        let score = strategy.score("Create a Python file named helpers.py", &trace).await;
        assert!((0.75..0.92).contains(&score), "expected a MIXED-band score, got {score}");
    }

    #[tokio::test]
    async fn jaccard_disjoint_text_scores_near_zero() {
        let strategy = JaccardSimilarity::default();
        let trace = trace_with("completely unrelated subject matter", 1, 0.5);
        let score = strategy.score("write a haiku about the ocean", &trace).await;
        assert!(score < 0.2, "expected low score, got {score}");
    }

    #[tokio::test]
    async fn exact_match_returns_confidence_one_and_follower_hint() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TraceStore::new(dir.path()));
        let trace = ExecutionTrace::new("factorial function", DispatchMode::Learner, 1.0, 0.5, 1.0);
        store.save(&trace).await.unwrap();

        let matcher = TraceMatcher::new(store, MatcherThresholds::default());
        let (found, confidence, hint) = matcher.find_smart("factorial function").await;
        assert!(found.is_some());
        assert_eq!(confidence, 1.0);
        assert_eq!(hint, DispatchMode::Follower);
    }

    #[tokio::test]
    async fn confidence_exactly_at_follower_threshold_classifies_follower() {
        let matcher_thresholds = MatcherThresholds::default();
        assert!(0.92 >= matcher_thresholds.follower);
    }

    #[tokio::test]
    async fn no_trace_yields_learner_hint() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TraceStore::new(dir.path()));
        let matcher = TraceMatcher::new(store, MatcherThresholds::default());
        let (found, confidence, hint) = matcher.find_smart("never seen before").await;
        assert!(found.is_none());
        assert_eq!(confidence, 0.0);
        assert_eq!(hint, DispatchMode::Learner);
    }

    #[tokio::test]
    async fn crystallized_tool_upgrades_hint_when_enabled() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TraceStore::new(dir.path()));
        let mut trace = ExecutionTrace::new("check prime", DispatchMode::Learner, 0.97, 0.1, 0.1);
        trace.usage_count = 6;
        trace.crystallized_into_tool = Some("is_prime".to_string());
        store.save(&trace).await.unwrap();

        let thresholds = MatcherThresholds {
            auto_crystallization: true,
            ..MatcherThresholds::default()
        };
        let matcher = TraceMatcher::new(store, thresholds);
        let (_, _, hint) = matcher.find_smart("check prime").await;
        assert_eq!(hint, DispatchMode::Crystallized);
    }

    #[test]
    fn tie_break_prefers_higher_usage_then_success_then_recency() {
        let a = trace_with("a", 5, 0.9);
        let b = trace_with("b", 10, 0.5);
        assert!(prefer(&b, 0.8, &a, 0.8));

        let c = trace_with("c", 5, 0.95);
        assert!(prefer(&c, 0.8, &a, 0.8));
    }
}
