//! Named agent specs and the registry/factory that mint them (§4.7).
//!
//! Grounded in `original_source/llmos/interfaces/orchestrator.py`'s use of a
//! `component_registry.get_agent("system-agent")` fallback and its
//! `allowed_tools=["Read", "Write", "Grep", "Glob"]` style whitelist.

use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{LazyLock, RwLock};

static NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-z][a-z0-9-]*$").unwrap());

/// The tool names an [`AgentFactory`] will accept in a spec's `tools` list.
/// Mirrors the core tool surface `Claude Code`-style adapters expose.
pub const ALLOWED_TOOLS: &[&str] = &[
    "Read", "Write", "Edit", "Grep", "Glob", "Bash", "WebSearch", "WebFetch",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Specialized,
    Orchestration,
}

/// An immutable, named agent configuration: prompt, tool whitelist,
/// capabilities, and constraints. Owned by the [`AgentRegistry`] once
/// registered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    pub category: String,
    pub agent_type: AgentType,
    pub description: String,
    pub system_prompt: String,
    pub tools: Vec<String>,
    pub capabilities: Vec<String>,
    pub constraints: Vec<String>,
    pub metadata: HashMap<String, Value>,
}

/// Validates and constructs [`AgentSpec`]s.
pub struct AgentFactory;

impl AgentFactory {
    /// Validates `name` (`[a-z][a-z0-9-]*`), a non-empty `system_prompt`,
    /// and that every entry in `tools` is in [`ALLOWED_TOOLS`].
    pub fn create(
        name: impl Into<String>,
        category: impl Into<String>,
        agent_type: AgentType,
        description: impl Into<String>,
        system_prompt: impl Into<String>,
        tools: Vec<String>,
        capabilities: Vec<String>,
        constraints: Vec<String>,
    ) -> Result<AgentSpec> {
        let name = name.into();
        let system_prompt = system_prompt.into();

        if !NAME_PATTERN.is_match(&name) {
            return Err(Error::invalid_agent_spec(format!(
                "agent name {name:?} must match [a-z][a-z0-9-]*"
            )));
        }
        if system_prompt.trim().is_empty() {
            return Err(Error::invalid_agent_spec("agent system_prompt must not be empty"));
        }
        let allowed: HashSet<&str> = ALLOWED_TOOLS.iter().copied().collect();
        for tool in &tools {
            if !allowed.contains(tool.as_str()) {
                return Err(Error::invalid_agent_spec(format!("unknown tool {tool:?}")));
            }
        }

        Ok(AgentSpec {
            name,
            category: category.into(),
            agent_type,
            description: description.into(),
            system_prompt,
            tools,
            capabilities,
            constraints,
            metadata: HashMap::new(),
        })
    }

    /// The one mandatory built-in: a general-purpose orchestration agent
    /// with the full tool whitelist, used as the fallback delegate whenever
    /// a plan names an unknown agent.
    pub fn system_agent() -> AgentSpec {
        AgentFactory::create(
            "system-agent",
            "core",
            AgentType::Orchestration,
            "General-purpose agent used as the default delegate for plan steps",
            "You are a careful, general-purpose execution agent. Complete the \
             assigned step directly and report concrete results.",
            vec!["Read".into(), "Write".into(), "Grep".into(), "Glob".into(), "Bash".into()],
            vec!["general-execution".into()],
            Vec::new(),
        )
        .expect("built-in system-agent spec is always valid")
    }
}

/// In-memory, name-keyed table of [`AgentSpec`]s. `system-agent` is present
/// from construction; registration is idempotent, re-registering by name
/// replaces the prior spec.
pub struct AgentRegistry {
    specs: RwLock<HashMap<String, AgentSpec>>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        let mut specs = HashMap::new();
        let system_agent = AgentFactory::system_agent();
        specs.insert(system_agent.name.clone(), system_agent);
        Self { specs: RwLock::new(specs) }
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, spec: AgentSpec) {
        self.specs.write().unwrap().insert(spec.name.clone(), spec);
    }

    pub fn get(&self, name: &str) -> Option<AgentSpec> {
        self.specs.read().unwrap().get(name).cloned()
    }

    /// `get`, falling back to `system-agent` when `name` is unknown.
    pub fn get_or_system_agent(&self, name: &str) -> AgentSpec {
        self.get(name).unwrap_or_else(|| {
            self.get("system-agent")
                .expect("system-agent is always registered")
        })
    }

    pub fn list(&self) -> Vec<AgentSpec> {
        let mut specs: Vec<_> = self.specs.read().unwrap().values().cloned().collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs
    }

    pub fn list_by_category(&self, category: &str) -> Vec<AgentSpec> {
        self.list().into_iter().filter(|s| s.category == category).collect()
    }
}
