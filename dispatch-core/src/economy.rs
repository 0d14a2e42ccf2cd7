//! Process-wide budget gate enforced before every paid dispatch path.
//!
//! Grounded in `original_source/llmos/kernel/token_economy.py`'s
//! check-then-deduct split (`LowBatteryError` there becomes
//! [`Error::LowBattery`] here), generalized with `tokio::sync::Mutex` so
//! `check` and `deduct` compose into one atomic unit for concurrent callers.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;

/// One append-only record of a deduction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendLogEntry {
    pub ts: DateTime<Utc>,
    pub amount_usd: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EconomyState {
    balance_usd: f64,
    spend_log: Vec<SpendLogEntry>,
}

/// The token economy: a running balance plus an append-only spend log.
///
/// `check` and `deduct` are exposed separately per the spec, but the
/// dispatcher should prefer [`TokenEconomy::check_and_deduct`] to close the
/// TOCTOU window between the two; both still serialize on the same mutex so
/// calling them back to back from a single task is equally safe.
pub struct TokenEconomy {
    initial_balance_usd: f64,
    state: Arc<Mutex<EconomyState>>,
    log_path: Option<PathBuf>,
}

impl TokenEconomy {
    pub fn new(initial_balance_usd: f64) -> Self {
        Self {
            initial_balance_usd,
            state: Arc::new(Mutex::new(EconomyState {
                balance_usd: initial_balance_usd,
                spend_log: Vec::new(),
            })),
            log_path: None,
        }
    }

    /// Persist every successful deduction as one JSON object per line under
    /// `<workspace>/spend_log.json`.
    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    pub async fn balance_usd(&self) -> f64 {
        self.state.lock().await.balance_usd
    }

    pub fn initial_balance_usd(&self) -> f64 {
        self.initial_balance_usd
    }

    pub async fn spend_log(&self) -> Vec<SpendLogEntry> {
        self.state.lock().await.spend_log.clone()
    }

    /// Fails with [`Error::LowBattery`] when `balance < amount_usd`. Does not
    /// mutate state; a subsequent `deduct` can still race with a concurrent
    /// caller unless [`Self::check_and_deduct`] is used instead.
    pub async fn check(&self, amount_usd: f64) -> Result<()> {
        let state = self.state.lock().await;
        if state.balance_usd < amount_usd {
            return Err(Error::low_battery(amount_usd, state.balance_usd));
        }
        Ok(())
    }

    /// Fails with [`Error::LowBattery`] when the post-deduction balance would
    /// go negative; otherwise appends to the spend log and lowers balance.
    pub async fn deduct(&self, amount_usd: f64, reason: impl Into<String>) -> Result<f64> {
        let reason = reason.into();
        let mut state = self.state.lock().await;
        let next_balance = state.balance_usd - amount_usd;
        if next_balance < 0.0 {
            return Err(Error::low_battery(amount_usd, state.balance_usd));
        }
        state.balance_usd = next_balance;
        state.spend_log.push(SpendLogEntry {
            ts: Utc::now(),
            amount_usd,
            reason,
        });
        drop(state);
        self.persist_log().await?;
        Ok(next_balance)
    }

    /// Atomic `check` + `deduct` under a single lock acquisition; preferred
    /// by the dispatcher over calling the two separately.
    pub async fn check_and_deduct(&self, amount_usd: f64, reason: impl Into<String>) -> Result<f64> {
        let reason = reason.into();
        let mut state = self.state.lock().await;
        if state.balance_usd < amount_usd {
            return Err(Error::low_battery(amount_usd, state.balance_usd));
        }
        let next_balance = state.balance_usd - amount_usd;
        state.balance_usd = next_balance;
        state.spend_log.push(SpendLogEntry {
            ts: Utc::now(),
            amount_usd,
            reason,
        });
        drop(state);
        self.persist_log().await?;
        Ok(next_balance)
    }

    async fn persist_log(&self) -> Result<()> {
        let Some(path) = &self.log_path else {
            return Ok(());
        };
        let state = self.state.lock().await;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let text = serde_json::to_string_pretty(&*state)?;
        write_atomic(path, text.as_bytes()).await
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn check_passes_when_balance_equals_amount() {
        let economy = TokenEconomy::new(1.0);
        economy.check(1.0).await.unwrap();
    }

    #[tokio::test]
    async fn deduct_to_exactly_zero_is_allowed() {
        let economy = TokenEconomy::new(0.5);
        let balance = economy.deduct(0.5, "learner").await.unwrap();
        assert_eq!(balance, 0.0);
    }

    #[tokio::test]
    async fn deduct_below_zero_is_rejected_and_balance_unchanged() {
        let economy = TokenEconomy::new(0.1);
        let err = economy.deduct(0.5, "learner").await.unwrap_err();
        assert!(err.is_low_battery());
        assert_eq!(economy.balance_usd().await, 0.1);
    }

    #[tokio::test]
    async fn spend_log_sum_plus_balance_equals_initial_budget() {
        let economy = TokenEconomy::new(1.0);
        economy.deduct(0.3, "a").await.unwrap();
        economy.deduct(0.2, "b").await.unwrap();

        let spent: f64 = economy.spend_log().await.iter().map(|e| e.amount_usd).sum();
        let balance = economy.balance_usd().await;
        assert!((spent + balance - economy.initial_balance_usd()).abs() < 1e-9);
    }

    #[tokio::test]
    async fn check_and_deduct_has_no_toctou_window() {
        let economy = TokenEconomy::new(0.4);
        economy.check_and_deduct(0.25, "mixed").await.unwrap();
        let err = economy.check_and_deduct(0.25, "mixed-2").await.unwrap_err();
        assert!(err.is_low_battery());
    }

    #[tokio::test]
    async fn persists_spend_log_to_disk_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spend_log.json");
        let economy = TokenEconomy::new(1.0).with_log_path(&path);
        economy.deduct(0.1, "learner").await.unwrap();

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(text.contains("learner"));
    }
}
