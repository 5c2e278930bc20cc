//! Breaks a request into ordered checkpoints.

use serde::{Deserialize, Serialize};

/// Design hint used when the caller has none.
pub const DEFAULT_DESIGN_HINT: &str = "Based on the guide and user prompt.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    /// 1-based, contiguous
    pub step: usize,
    pub description: String,
}

#[derive(Debug, Default)]
pub struct PlannerAgent;

impl PlannerAgent {
    pub fn new() -> Self {
        Self
    }

    /// One step for the design, one per sentence of `request`, then a review step.
    pub fn create_plan(&self, design_hint: &str, request: &str) -> Vec<PlanStep> {
        let mut plan = vec![PlanStep {
            step: 1,
            description: format!("Understand high-level design: {}", design_hint.trim()),
        }];

        for sentence in request.split('.').map(str::trim).filter(|s| !s.is_empty()) {
            plan.push(PlanStep {
                step: plan.len() + 1,
                description: format!("Execute sub-task: {}", sentence),
            });
        }

        plan.push(PlanStep {
            step: plan.len() + 1,
            description: "Review and integrate all sub-tasks".to_string(),
        });

        tracing::debug!("Created plan with {} steps", plan.len());
        plan
    }

    /// Append a checkpoint numbered after the current last step.
    pub fn add_checkpoint(&self, plan: &mut Vec<PlanStep>, description: &str) {
        let step = plan.last().map_or(1, |last| last.step + 1);
        plan.push(PlanStep {
            step,
            description: description.to_string(),
        });
    }
}
