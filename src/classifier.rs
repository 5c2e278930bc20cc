//! Request classifier.
//!
//! Decides the operating mode and target agent for a prompt with a fixed,
//! ordered keyword table. The first matching row wins, so the table order
//! is the tie-break when a prompt contains keywords of several rows.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How a request is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    /// Direct conversational reply
    Chat,
    /// Single specialized LLM-backed agent
    Agent,
    /// Multi-step breakdown via the planner
    Plan,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Chat => "Chat",
            Mode::Agent => "Agent",
            Mode::Plan => "Plan",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "chat" => Ok(Mode::Chat),
            "agent" => Ok(Mode::Agent),
            "plan" => Ok(Mode::Plan),
            _ => Err(s.to_string()),
        }
    }
}

/// Outcome of classifying one prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub nature: String,
    pub mode: Mode,
    pub profile: String,
    pub role: String,
    /// In [0, 1]
    pub confidence: f64,
}

/// One row of the routing table.
#[derive(Debug, Clone, Copy)]
pub struct Route {
    pub nature: &'static str,
    pub keywords: &'static [&'static str],
    pub mode: Mode,
    pub profile: &'static str,
    pub role: &'static str,
    pub confidence: f64,
}

impl Route {
    fn matches(&self, lowered: &str) -> bool {
        self.keywords.iter().any(|k| lowered.contains(k))
    }

    fn to_result(self) -> ClassificationResult {
        ClassificationResult {
            nature: self.nature.to_string(),
            mode: self.mode,
            profile: self.profile.to_string(),
            role: self.role.to_string(),
            confidence: self.confidence,
        }
    }
}

pub const CHAT_ROLE: &str = "Chat-Agent";

const ROUTES: &[Route] = &[
    Route {
        nature: "greeting",
        keywords: &["hello"],
        mode: Mode::Chat,
        profile: "General",
        role: CHAT_ROLE,
        confidence: 0.95,
    },
    Route {
        nature: "information_request",
        keywords: &["summarize", "explain"],
        mode: Mode::Agent,
        profile: "Productivity",
        role: "Writing-Agent",
        confidence: 0.85,
    },
    Route {
        nature: "development_task",
        keywords: &["develop", "create code", "plan"],
        mode: Mode::Plan,
        profile: "Developer",
        role: "Architect-Agent",
        confidence: 0.95,
    },
    Route {
        nature: "debugging_task",
        keywords: &["debug", "fix error"],
        mode: Mode::Plan,
        profile: "Developer",
        role: "Debug-Agent",
        confidence: 0.9,
    },
    Route {
        nature: "research_task",
        keywords: &["research", "investigate"],
        mode: Mode::Agent,
        profile: "Developer",
        role: "Research-Agent",
        confidence: 0.85,
    },
];

const FALLBACK: Route = Route {
    nature: "general_query",
    keywords: &[],
    mode: Mode::Chat,
    profile: "General",
    role: CHAT_ROLE,
    confidence: 0.75,
};

/// Deterministic rule-table classifier.
#[derive(Debug, Clone)]
pub struct Classifier {
    routes: &'static [Route],
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier {
    pub fn new() -> Self {
        Self { routes: ROUTES }
    }

    /// Classify a prompt. Never fails: anything unrecognised is a `general_query`.
    pub fn analyze(&self, prompt: &str) -> ClassificationResult {
        let lowered = prompt.to_lowercase();
        let route = self
            .routes
            .iter()
            .find(|r| r.matches(&lowered))
            .copied()
            .unwrap_or(FALLBACK);
        let result = route.to_result();

        tracing::info!(
            nature = %result.nature,
            mode = %result.mode,
            role = %result.role,
            confidence = result.confidence,
            "Classified request"
        );
        result
    }

    /// Every role the table can route to (fallback included).
    pub fn roles(&self) -> Vec<&'static str> {
        let mut roles: Vec<&'static str> = self.routes.iter().map(|r| r.role).collect();
        roles.push(FALLBACK.role);
        roles.sort_unstable();
        roles.dedup();
        roles
    }
}
