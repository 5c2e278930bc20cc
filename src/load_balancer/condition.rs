//! Rule condition grammar.
//!
//! ```text
//! condition := clause ( ("and" | "&&") clause )*
//! clause    := prompt.contains('kw')
//!            | agent.is('Name')
//!            | agent.is_one_of(['A', 'B'])
//! ```
//!
//! Separators inside a quoted argument are part of it:
//! `prompt.contains('pros and cons')` is a single clause.
//!
//! `agent.is_one_of(['A, B'])` (a single quoted, comma-separated list) is
//! accepted as well, since older configuration files were written that way.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// Case-insensitive substring test on the prompt; keyword stored lower-cased.
    PromptContains(String),
    AgentIs(String),
    AgentIsOneOf(Vec<String>),
}

impl Predicate {
    fn evaluate(&self, prompt_lower: &str, agent: Option<&str>) -> bool {
        match self {
            Predicate::PromptContains(keyword) => prompt_lower.contains(keyword.as_str()),
            Predicate::AgentIs(name) => agent == Some(name.as_str()),
            Predicate::AgentIsOneOf(names) => {
                agent.map_or(false, |a| names.iter().any(|n| n == a))
            }
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::PromptContains(k) => write!(f, "prompt.contains('{}')", k),
            Predicate::AgentIs(a) => write!(f, "agent.is('{}')", a),
            Predicate::AgentIsOneOf(list) => {
                let quoted: Vec<String> = list.iter().map(|a| format!("'{}'", a)).collect();
                write!(f, "agent.is_one_of([{}])", quoted.join(", "))
            }
        }
    }
}

/// Conjunction of predicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    clauses: Vec<Predicate>,
}

fn conjunction_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+and\s+|\s*&&\s*").expect("static regex"))
}

fn prompt_contains_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^prompt\.contains\(\s*['"]([^'"]*)['"]\s*\)$"#).expect("static regex")
    })
}

fn agent_is_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^agent\.is\(\s*['"]([^'"]*)['"]\s*\)$"#).expect("static regex")
    })
}

fn agent_is_one_of_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^agent\.is_one_of\(\s*\[(.*)\]\s*\)$").expect("static regex"))
}

impl Condition {
    pub fn new(clauses: Vec<Predicate>) -> Self {
        Self { clauses }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err("empty condition".to_string());
        }

        let clauses = split_conjunctions(raw)
            .into_iter()
            .map(|clause| parse_clause(clause.trim()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { clauses })
    }

    /// `prompt_lower` must already be lower-cased.
    pub fn evaluate(&self, prompt_lower: &str, agent: Option<&str>) -> bool {
        self.clauses.iter().all(|c| c.evaluate(prompt_lower, agent))
    }

    pub fn clauses(&self) -> &[Predicate] {
        &self.clauses
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.clauses.iter().map(|c| c.to_string()).collect();
        f.write_str(&parts.join(" and "))
    }
}

/// Split on `and` / `&&`, ignoring separators inside quoted arguments.
fn split_conjunctions(raw: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    for separator in conjunction_re().find_iter(raw) {
        if inside_quotes(&raw[..separator.start()]) {
            continue;
        }
        parts.push(&raw[start..separator.start()]);
        start = separator.end();
    }
    parts.push(&raw[start..]);
    parts
}

/// Whether `prefix` ends inside an open quote.
fn inside_quotes(prefix: &str) -> bool {
    let mut open: Option<char> = None;
    for c in prefix.chars() {
        match open {
            Some(quote) if c == quote => open = None,
            None if c == '\'' || c == '"' => open = Some(c),
            _ => {}
        }
    }
    open.is_some()
}

fn parse_clause(clause: &str) -> Result<Predicate, String> {
    if let Some(caps) = prompt_contains_re().captures(clause) {
        let keyword = caps[1].trim().to_lowercase();
        if keyword.is_empty() {
            return Err("prompt.contains needs a non-empty keyword".to_string());
        }
        return Ok(Predicate::PromptContains(keyword));
    }

    if let Some(caps) = agent_is_re().captures(clause) {
        let name = caps[1].trim().to_string();
        if name.is_empty() {
            return Err("agent.is needs a non-empty agent name".to_string());
        }
        return Ok(Predicate::AgentIs(name));
    }

    if let Some(caps) = agent_is_one_of_re().captures(clause) {
        let names: Vec<String> = caps[1]
            .split(',')
            .map(|n| n.trim().trim_matches(|c| c == '\'' || c == '"').trim().to_string())
            .filter(|n| !n.is_empty())
            .collect();
        if names.is_empty() {
            return Err("agent.is_one_of needs at least one agent name".to_string());
        }
        return Ok(Predicate::AgentIsOneOf(names));
    }

    Err(format!("unrecognised clause '{}'", clause))
}
