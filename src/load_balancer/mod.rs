//! Engine selection.
//!
//! Picks one configured LLM engine per task:
//! 1. Only engines that are toggled on and not locked are candidates.
//! 2. Rules are evaluated in order; the first rule whose condition holds and
//!    whose target engine is a candidate wins. A matching rule with an
//!    unavailable target does not stop the scan.
//! 3. The default engine, if it is a candidate.
//! 4. The first candidate in configuration order.

mod condition;

pub use condition::{Condition, Predicate};

use crate::config::{ConfigError, EngineConfig, EngineTable};

/// What the selector knows about a task.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskMetadata<'a> {
    pub prompt: &'a str,
    pub agent: Option<&'a str>,
}

impl<'a> TaskMetadata<'a> {
    pub fn new(prompt: &'a str, agent: Option<&'a str>) -> Self {
        Self { prompt, agent }
    }
}

/// A parsed routing rule.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub condition: Condition,
    pub engine: String,
}

pub struct LoadBalancer {
    engines: Vec<EngineConfig>,
    rules: Vec<Rule>,
    default_engine: Option<String>,
}

impl LoadBalancer {
    pub fn new(engines: Vec<EngineConfig>, rules: Vec<Rule>, default_engine: Option<String>) -> Self {
        Self {
            engines,
            rules,
            default_engine,
        }
    }

    /// Build from the loaded engine table. Malformed rule conditions are rejected here.
    pub fn from_table(table: &EngineTable) -> Result<Self, ConfigError> {
        let mut rules = Vec::with_capacity(table.load_balancer_rules.rules.len());
        for (index, raw) in table.load_balancer_rules.rules.iter().enumerate() {
            let condition =
                Condition::parse(&raw.condition).map_err(|message| ConfigError::InvalidRule {
                    index,
                    condition: raw.condition.clone(),
                    message,
                })?;
            if table.engine(&raw.engine).is_none() {
                tracing::warn!(
                    "Load balancer rule #{} targets unknown engine '{}'; it will never match",
                    index,
                    raw.engine
                );
            }
            rules.push(Rule {
                condition,
                engine: raw.engine.clone(),
            });
        }

        let default_engine = table.load_balancer_rules.default_engine.clone();
        if let Some(ref name) = default_engine {
            if table.engine(name).is_none() {
                tracing::warn!("Default engine '{}' is not configured", name);
            }
        }

        tracing::info!(
            engines = table.llm_engines.len(),
            rules = rules.len(),
            default_engine = default_engine.as_deref().unwrap_or("(none)"),
            "Load balancer initialized"
        );

        Ok(Self::new(table.llm_engines.clone(), rules, default_engine))
    }

    pub fn engines(&self) -> &[EngineConfig] {
        &self.engines
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn default_engine(&self) -> Option<&str> {
        self.default_engine.as_deref()
    }

    /// Enabled, unlocked engines in configuration order.
    pub fn available_engines(&self) -> impl Iterator<Item = &EngineConfig> {
        self.engines.iter().filter(|e| e.is_available())
    }

    fn is_available(&self, name: &str) -> bool {
        self.available_engines().any(|e| e.name == name)
    }

    /// Select an engine for `task`. `None` means no engine is usable at all.
    pub fn select_engine(&self, task: &TaskMetadata<'_>) -> Option<String> {
        let first_available = match self.available_engines().next() {
            Some(engine) => engine.name.clone(),
            None => {
                tracing::warn!("No available (toggled on, not locked) LLM engines");
                return None;
            }
        };

        let prompt = task.prompt.to_lowercase();
        for rule in &self.rules {
            if !rule.condition.evaluate(&prompt, task.agent) {
                continue;
            }
            if self.is_available(&rule.engine) {
                tracing::debug!(
                    "Rule matched: {}. Selected engine: {}",
                    rule.condition,
                    rule.engine
                );
                return Some(rule.engine.clone());
            }
            tracing::debug!(
                "Rule matched: {}, but target engine '{}' is not available",
                rule.condition,
                rule.engine
            );
        }

        if let Some(ref default) = self.default_engine {
            if self.is_available(default) {
                tracing::debug!("No rule matched. Using default engine: {}", default);
                return Some(default.clone());
            }
        }

        tracing::debug!(
            "Default engine not available. Falling back to first available engine: {}",
            first_available
        );
        Some(first_available)
    }
}
