//! Context projection: a bounded, priority-ordered context block for a turn.
//!
//! Sections, highest priority first: active intents, failed items, open work,
//! selected artifacts. Each section is filled up to its own sub-budget, then
//! the lowest-priority fragments are dropped until the whole block fits the
//! projection budget. The output shape never changes with content.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::artifacts::Artifact;
use crate::core::budget::{estimate_tokens, truncate_to_budget};
use crate::core::liveness::{ActiveIntent, Escalation, FailedItem, LivenessState, OpenWorkOrder};
use crate::core::types::Classification;

/// Per-section token ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SectionBudgets {
    pub intent: usize,
    pub failed: usize,
    pub open_work: usize,
    pub artifacts: usize,
}

impl Default for SectionBudgets {
    fn default() -> Self {
        Self {
            intent: 256,
            failed: 256,
            open_work: 256,
            artifacts: 512,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectionBudget {
    pub total: usize,
    pub sections: SectionBudgets,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssembledContext {
    pub text: String,
    /// SHA-256 of `text`, lowercase hex.
    pub hash: String,
    pub fragment_count: usize,
    pub tokens_used: usize,
}

/// Fixed-shape input for prompt assembly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Projection {
    pub user_input: String,
    pub classification: Classification,
    pub assembled_context: AssembledContext,
}

/// Per-turn record of what the projection saw. Written to a derived stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectionSnapshot {
    pub session_id: String,
    pub turn_id: String,
    pub token_budget: usize,
    pub active_intents: Vec<ActiveIntent>,
    pub open_work_orders: Vec<OpenWorkOrder>,
    pub failed_items: Vec<FailedItem>,
    pub escalations: Vec<Escalation>,
    pub context_hash: String,
    pub computed_at: DateTime<Utc>,
}

impl ProjectionSnapshot {
    pub fn capture(
        session_id: &str,
        turn_id: &str,
        liveness: &LivenessState,
        projection: &Projection,
        token_budget: usize,
        computed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            turn_id: turn_id.to_string(),
            token_budget,
            active_intents: liveness.active_intents.clone(),
            open_work_orders: liveness.open_work_orders.clone(),
            failed_items: liveness.failed_items.clone(),
            escalations: liveness.escalations.clone(),
            context_hash: projection.assembled_context.hash.clone(),
            computed_at,
        }
    }
}

struct Section {
    title: &'static str,
    fragments: Vec<String>,
}

impl Section {
    fn render(&self) -> String {
        let mut out = format!("## {}", self.title);
        for fragment in &self.fragments {
            out.push_str("\n- ");
            out.push_str(fragment);
        }
        out
    }
}

/// Build the projection for one turn.
///
/// With no liveness state the projection degrades to the user input and
/// classification with an empty context block.
pub fn project(
    liveness: Option<&LivenessState>,
    artifacts: &[Artifact],
    user_message: &str,
    classification: &Classification,
    budget: &ProjectionBudget,
) -> Projection {
    let sections = match liveness {
        Some(state) => build_sections(state, artifacts, &budget.sections),
        None => Vec::new(),
    };
    let sections = fit_total(sections, budget.total);

    let text = render(&sections);
    let fragment_count = sections.iter().map(|s| s.fragments.len()).sum();
    Projection {
        user_input: user_message.to_string(),
        classification: classification.clone(),
        assembled_context: AssembledContext {
            hash: context_hash(&text),
            tokens_used: estimate_tokens(&text),
            fragment_count,
            text,
        },
    }
}

pub fn context_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

fn build_sections(
    state: &LivenessState,
    artifacts: &[Artifact],
    budgets: &SectionBudgets,
) -> Vec<Section> {
    // Most recent intent leads; it is the one the turn works under.
    let intents = state.active_intents.iter().rev().map(|intent| {
        format!(
            "{} [{}]: {}",
            intent.intent_id, intent.scope, intent.objective
        )
    });
    let failed = state.failed_items.iter().map(|item| match &item.work_type {
        Some(kind) => format!("{} ({kind}): {}", item.work_order_id, item.reason),
        None => format!("{}: {}", item.work_order_id, item.reason),
    });
    let open = state.open_work_orders.iter().map(|wo| {
        let state = if wo.dispatched {
            "dispatched"
        } else {
            "planned"
        };
        match &wo.work_type {
            Some(kind) => format!("{} ({kind}, {state})", wo.work_order_id),
            None => format!("{} ({state})", wo.work_order_id),
        }
    });
    let learned = artifacts.iter().map(|a| a.context_line.clone());

    [
        fill("Active intent", intents, budgets.intent),
        fill("Failed items", failed, budgets.failed),
        fill("Open work", open, budgets.open_work),
        fill("Learned context", learned, budgets.artifacts),
    ]
    .into_iter()
    .flatten()
    .collect()
}

/// Take fragments in order while the rendered section fits `budget`. The
/// first fragment is truncated rather than dropped so a tight budget still
/// shows something.
fn fill(
    title: &'static str,
    fragments: impl Iterator<Item = String>,
    budget: usize,
) -> Option<Section> {
    let mut section = Section {
        title,
        fragments: Vec::new(),
    };
    let header = estimate_tokens(&section.render());
    for fragment in fragments {
        section.fragments.push(fragment);
        if estimate_tokens(&section.render()) <= budget {
            continue;
        }
        let Some(last) = section.fragments.pop() else {
            break;
        };
        if section.fragments.is_empty() && budget > header + 1 {
            // Leave room for the "\n- " separator.
            let cut = truncate_to_budget(&last, budget - header - 1).to_string();
            if !cut.is_empty() {
                section.fragments.push(cut);
            }
        }
        break;
    }
    (!section.fragments.is_empty()).then_some(section)
}

/// Drop lowest-priority fragments until the whole block fits `total`.
fn fit_total(mut sections: Vec<Section>, total: usize) -> Vec<Section> {
    while estimate_tokens(&render(&sections)) > total {
        let Some(last) = sections.last_mut() else {
            break;
        };
        last.fragments.pop();
        if last.fragments.is_empty() {
            sections.pop();
        }
    }
    sections
}

fn render(sections: &[Section]) -> String {
    sections
        .iter()
        .map(Section::render)
        .collect::<Vec<_>>()
        .join("\n\n")
}
