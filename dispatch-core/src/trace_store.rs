//! On-disk, content-addressed persistence for [`ExecutionTrace`]s.
//!
//! One file per `goal_signature` under `<workspace>/memories/traces/`,
//! written write-to-temp-then-rename for atomicity, matching the pattern
//! `StateManager` persistence implies in §4.6. A corrupt or unparseable file
//! is skipped with a `tracing::warn!`, never surfaced as a hard error —
//! satisfying invariant §8.3.

use crate::error::Result;
use crate::trace::{ExecutionTrace, GoalSignature};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Persists execution traces as one JSON file per goal signature.
pub struct TraceStore {
    root: PathBuf,
}

impl TraceStore {
    /// `workspace` is the top-level directory; traces live under
    /// `<workspace>/memories/traces/`, created lazily on first save.
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            root: workspace.into().join("memories").join("traces"),
        }
    }

    fn path_for(&self, signature: &GoalSignature) -> PathBuf {
        self.root.join(format!("{}.json", signature.as_str()))
    }

    /// Overwrites any existing file for the trace's signature.
    pub async fn save(&self, trace: &ExecutionTrace) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let path = self.path_for(&trace.goal_signature);
        let text = serde_json::to_string_pretty(trace)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, text.as_bytes()).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Returns `None` if no file exists or it failed to parse (logged, not
    /// returned as an error — a single corrupt trace never aborts a caller
    /// that only needs one signature).
    pub async fn load(&self, signature: &GoalSignature) -> Option<ExecutionTrace> {
        let path = self.path_for(signature);
        let text = tokio::fs::read_to_string(&path).await.ok()?;
        match serde_json::from_str(&text) {
            Ok(trace) => Some(trace),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "corrupt trace file, skipping");
                None
            }
        }
    }

    /// Load every parseable trace in the store. Unparseable files are
    /// skipped with a warning rather than aborting the iteration.
    pub async fn all(&self) -> Result<Vec<ExecutionTrace>> {
        let mut traces = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(traces),
            Err(err) => return Err(err.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match tokio::fs::read_to_string(&path).await {
                Ok(text) => match serde_json::from_str::<ExecutionTrace>(&text) {
                    Ok(trace) => traces.push(trace),
                    Err(err) => warn!(path = %path.display(), error = %err, "corrupt trace file, skipping"),
                },
                Err(err) => warn!(path = %path.display(), error = %err, "failed to read trace file, skipping"),
            }
        }

        Ok(traces)
    }

    /// Increment `usage_count`, stamp `last_used_at`, and EMA-update
    /// `success_rating`, then persist. No-op (returns `None`) if the
    /// signature is unknown.
    pub async fn update_usage(
        &self,
        signature: &GoalSignature,
        success: bool,
    ) -> Result<Option<ExecutionTrace>> {
        let Some(mut trace) = self.load(signature).await else {
            return Ok(None);
        };
        trace.record_usage(success);
        self.save(&trace).await?;
        Ok(Some(trace))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::DispatchMode;

    fn sample_trace(goal: &str) -> ExecutionTrace {
        ExecutionTrace::new(goal, DispatchMode::Learner, 1.0, 0.5, 1.2)
    }

    #[tokio::test]
    async fn save_then_load_round_trips_under_json_equality() {
        let dir = tempfile::tempdir().unwrap();
        let store = TraceStore::new(dir.path());
        let trace = sample_trace("factorial function");

        store.save(&trace).await.unwrap();
        let loaded = store.load(&trace.goal_signature).await.unwrap();
        assert_eq!(trace, loaded);
    }

    #[tokio::test]
    async fn save_overwrites_existing_file_for_same_signature() {
        let dir = tempfile::tempdir().unwrap();
        let store = TraceStore::new(dir.path());
        let mut trace = sample_trace("factorial function");
        store.save(&trace).await.unwrap();

        trace.usage_count = 5;
        store.save(&trace).await.unwrap();

        let loaded = store.load(&trace.goal_signature).await.unwrap();
        assert_eq!(loaded.usage_count, 5);
    }

    #[tokio::test]
    async fn all_skips_corrupt_files_without_raising() {
        let dir = tempfile::tempdir().unwrap();
        let store = TraceStore::new(dir.path());
        let trace = sample_trace("ok trace");
        store.save(&trace).await.unwrap();

        tokio::fs::write(store.root().join("garbage.json"), b"not json")
            .await
            .unwrap();

        let traces = store.all().await.unwrap();
        assert_eq!(traces.len(), 1);
    }

    #[tokio::test]
    async fn all_on_missing_directory_returns_empty_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = TraceStore::new(dir.path().join("never-created"));
        let traces = store.all().await.unwrap();
        assert!(traces.is_empty());
    }

    #[tokio::test]
    async fn update_usage_increments_count_and_ema() {
        let dir = tempfile::tempdir().unwrap();
        let store = TraceStore::new(dir.path());
        let trace = sample_trace("factorial function");
        store.save(&trace).await.unwrap();

        let updated = store.update_usage(&trace.goal_signature, true).await.unwrap().unwrap();
        assert_eq!(updated.usage_count, 2);
    }

    #[tokio::test]
    async fn update_usage_on_unknown_signature_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = TraceStore::new(dir.path());
        let sig = GoalSignature::of("never saved");
        assert!(store.update_usage(&sig, true).await.unwrap().is_none());
    }
}
