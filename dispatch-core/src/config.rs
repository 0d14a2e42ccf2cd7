//! Layered configuration for the dispatcher, memory, and cognitive adapter.
//!
//! Mirrors the kernel/memory/sdk/dispatcher split of the system this crate
//! generalizes from: each concern owns a small struct with sane defaults,
//! and `Config` aggregates them. Precedence when loading is CLI flag > env
//! var > config file > built-in default; `from_env` and `from_file` are
//! meant to be composed by the caller in that order.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Budget, scheduling, and watchdog settings for a boot session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub budget_usd: f64,
    pub enable_scheduling: bool,
    pub enable_watchdog: bool,
    pub watchdog_timeout_secs: f64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            budget_usd: 10.0,
            enable_scheduling: true,
            enable_watchdog: true,
            watchdog_timeout_secs: 60.0,
        }
    }
}

impl KernelConfig {
    fn validate(&self) -> Result<()> {
        if self.budget_usd < 0.0 {
            return Err(Error::config("kernel.budget_usd must be >= 0"));
        }
        if self.watchdog_timeout_secs <= 0.0 {
            return Err(Error::config("kernel.watchdog_timeout_secs must be > 0"));
        }
        Ok(())
    }
}

/// Trace matching and crystallization thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub enable_llm_matching: bool,
    pub trace_confidence_threshold: f64,
    pub mixed_mode_threshold: f64,
    pub follower_mode_threshold: f64,
    pub enable_cross_project_learning: bool,
    pub cache_size: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enable_llm_matching: false,
            trace_confidence_threshold: 0.9,
            mixed_mode_threshold: 0.75,
            follower_mode_threshold: 0.92,
            enable_cross_project_learning: true,
            cache_size: 256,
        }
    }
}

impl MemoryConfig {
    fn validate(&self) -> Result<()> {
        for (name, v) in [
            ("trace_confidence_threshold", self.trace_confidence_threshold),
            ("mixed_mode_threshold", self.mixed_mode_threshold),
            ("follower_mode_threshold", self.follower_mode_threshold),
        ] {
            if !(0.0..=1.0).contains(&v) {
                return Err(Error::config(format!("memory.{name} must be in [0,1]")));
            }
        }
        if self.mixed_mode_threshold > self.follower_mode_threshold {
            return Err(Error::config(
                "memory.mixed_mode_threshold must be <= memory.follower_mode_threshold",
            ));
        }
        Ok(())
    }
}

/// Settings that govern calls through the cognitive backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SdkConfig {
    pub model: String,
    pub permission_mode: String,
    pub max_turns: u32,
    pub timeout_seconds: f64,
    pub enable_streaming: bool,
    pub enable_hooks: bool,
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            model: "claude-sonnet".to_string(),
            permission_mode: "default".to_string(),
            max_turns: 20,
            timeout_seconds: 300.0,
            enable_streaming: true,
            enable_hooks: true,
        }
    }
}

impl SdkConfig {
    fn validate(&self) -> Result<()> {
        if self.timeout_seconds <= 0.0 {
            return Err(Error::config("sdk.timeout_seconds must be > 0"));
        }
        Ok(())
    }
}

/// Dispatcher-specific knobs: complexity routing and auto-crystallization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub complexity_threshold: i32,
    pub auto_crystallization: bool,
    pub crystallization_min_usage: u32,
    pub crystallization_min_success: f64,
    /// Estimated cost of a MIXED-mode call, charged against `max_cost_usd`
    /// before the CognitiveAdapter reports an actual figure.
    pub mixed_estimated_cost_usd: f64,
    /// Estimated cost of a LEARNER-mode call, same role as above.
    pub learner_estimated_cost_usd: f64,
    /// Name of the [`crate::mode_strategy::ModeStrategy`] to resolve via
    /// `strategy_for_name` when a dispatch is requested in AUTO mode.
    pub mode_strategy: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            complexity_threshold: 2,
            auto_crystallization: false,
            crystallization_min_usage: 5,
            crystallization_min_success: 0.95,
            mixed_estimated_cost_usd: 0.25,
            learner_estimated_cost_usd: 0.50,
            mode_strategy: "auto".to_string(),
        }
    }
}

impl DispatcherConfig {
    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.crystallization_min_success) {
            return Err(Error::config(
                "dispatcher.crystallization_min_success must be in [0,1]",
            ));
        }
        if self.mixed_estimated_cost_usd < 0.0 || self.learner_estimated_cost_usd < 0.0 {
            return Err(Error::config(
                "dispatcher.{mixed,learner}_estimated_cost_usd must be >= 0",
            ));
        }
        const KNOWN_STRATEGIES: &[&str] =
            &["auto", "cost-optimized", "speed-optimized", "forced-learner", "forced-follower"];
        if !KNOWN_STRATEGIES.contains(&self.mode_strategy.as_str()) {
            return Err(Error::config(format!(
                "dispatcher.mode_strategy {:?} is not one of {KNOWN_STRATEGIES:?}",
                self.mode_strategy
            )));
        }
        Ok(())
    }
}

/// Top-level configuration tree for a boot session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub workspace: PathBuf,
    pub project_name: Option<String>,
    pub kernel: KernelConfig,
    pub memory: MemoryConfig,
    pub sdk: SdkConfig,
    pub dispatcher: DispatcherConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from(".dispatch"),
            project_name: None,
            kernel: KernelConfig::default(),
            memory: MemoryConfig::default(),
            sdk: SdkConfig::default(),
            dispatcher: DispatcherConfig::default(),
        }
    }
}

impl Config {
    /// Validate cross-field invariants; called after any construction path.
    pub fn validate(&self) -> Result<()> {
        self.kernel.validate()?;
        self.memory.validate()?;
        self.sdk.validate()?;
        self.dispatcher.validate()?;
        Ok(())
    }

    /// A low-budget, feature-light preset for local iteration.
    pub fn development() -> Self {
        let mut cfg = Self::default();
        cfg.kernel.budget_usd = 1.0;
        cfg.kernel.enable_watchdog = false;
        cfg.memory.enable_llm_matching = false;
        cfg.sdk.enable_streaming = true;
        cfg
    }

    /// A generous preset with every optional feature enabled.
    pub fn production() -> Self {
        let mut cfg = Self::default();
        cfg.kernel.budget_usd = 100.0;
        cfg.kernel.enable_scheduling = true;
        cfg.kernel.enable_watchdog = true;
        cfg.memory.enable_llm_matching = true;
        cfg.memory.enable_cross_project_learning = true;
        cfg.dispatcher.auto_crystallization = true;
        cfg
    }

    /// A deterministic, nearly-zero-budget preset for automated tests.
    pub fn testing() -> Self {
        let mut cfg = Self::default();
        cfg.kernel.budget_usd = 0.1;
        cfg.kernel.enable_scheduling = false;
        cfg.kernel.enable_watchdog = false;
        cfg.memory.enable_llm_matching = false;
        cfg.sdk.enable_streaming = false;
        cfg.sdk.enable_hooks = false;
        cfg.dispatcher.auto_crystallization = false;
        cfg
    }

    /// Overlay recognized `LLMOS_*` environment variables onto `self`.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("LLMOS_WORKSPACE") {
            self.workspace = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("LLMOS_BUDGET") {
            self.kernel.budget_usd = v
                .parse()
                .map_err(|_| Error::config("LLMOS_BUDGET must be a number"))?;
        }
        if let Ok(v) = std::env::var("LLMOS_MODEL") {
            self.sdk.model = v;
        }
        if let Ok(v) = std::env::var("LLMOS_ENABLE_LLM_MATCHING") {
            self.memory.enable_llm_matching = matches!(v.as_str(), "1" | "true" | "yes");
        }
        Ok(())
    }

    /// Build a config from recognized environment variables over defaults.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load a TOML config file, then overlay environment variables on top.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let mut cfg: Self = toml::from_str(&text).map_err(|e| Error::config(e.to_string()))?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }
}
