//! Shared deterministic types for the turn pipeline.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O and must remain deterministic across runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of bounded work handed to the executor boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkType {
    Classify,
    Synthesize,
    Consolidate,
}

impl WorkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkType::Classify => "classify",
            WorkType::Synthesize => "synthesize",
            WorkType::Consolidate => "consolidate",
        }
    }
}

/// Lifecycle of a unit of work. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkState {
    Planned,
    Dispatched,
    Completed,
    Failed,
}

impl WorkState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkState::Completed | WorkState::Failed)
    }
}

/// Budget and contract limits attached to a unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraints {
    pub token_budget: u32,
    /// Executor-side ceiling on model round-trips for this unit. The
    /// supervisor bounds its own attempts with `gate.max_retries` instead.
    pub turn_limit: u32,
    pub contract_id: String,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Set on retries after a grounding rejection.
    #[serde(default)]
    pub strict_grounding: bool,
    /// Rejection notes carried into the next attempt's prompt.
    #[serde(default)]
    pub notes: Vec<String>,
}

impl Constraints {
    /// Tighten constraints for a retry after the gate rejected an attempt.
    pub fn tightened(&self, reasons: &[String]) -> Self {
        let mut next = self.clone();
        next.temperature = 0.0;
        next.strict_grounding = true;
        for reason in reasons {
            if !next.notes.contains(reason) {
                next.notes.push(reason.clone());
            }
        }
        next
    }
}

/// Token and tool accounting reported by the executor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Cost {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub tool_calls: u32,
    pub tool_ids_used: Vec<String>,
}

/// One bounded, budgeted request dispatched to the executor boundary.
///
/// Never mutated in place in the ledger: every state change is a new record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitOfWork {
    pub id: String,
    #[serde(rename = "type")]
    pub work_type: WorkType,
    pub input: String,
    pub constraints: Constraints,
    pub state: WorkState,
    pub result: Option<String>,
    pub cost: Cost,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl UnitOfWork {
    pub fn planned(
        id: String,
        work_type: WorkType,
        input: String,
        constraints: Constraints,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            work_type,
            input,
            constraints,
            state: WorkState::Planned,
            result: None,
            cost: Cost::default(),
            created_at,
            completed_at: None,
        }
    }
}

/// Classifier's stated lifecycle action for the current message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassifierAction {
    New,
    Continue,
    Close,
    #[serde(other)]
    Unclear,
}

/// Output of the classify unit. Every field is optional so a partial result
/// still flows through the pipeline in bridge mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Classification {
    pub action: Option<ClassifierAction>,
    pub objective: Option<String>,
    pub domain: Option<String>,
    pub task: Option<String>,
    pub scope: Option<String>,
}

impl Classification {
    pub fn labels(&self) -> TurnLabels {
        TurnLabels {
            domain: non_empty(self.domain.as_deref()),
            task: non_empty(self.task.as_deref()),
        }
    }
}

/// Label set used to scope artifacts to a turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnLabels {
    pub domain: Option<String>,
    pub task: Option<String>,
}

impl TurnLabels {
    pub fn is_empty(&self) -> bool {
        self.domain.is_none() && self.task.is_none()
    }
}

/// A declared intent. Lifecycle lives only in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub intent_id: String,
    pub scope: String,
    pub objective: String,
    pub parent_intent_id: Option<String>,
}

/// Final user-visible classification of a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnOutcome {
    Success,
    Degraded,
    Error,
}

impl TurnOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnOutcome::Success => "success",
            TurnOutcome::Degraded => "degraded",
            TurnOutcome::Error => "error",
        }
    }
}

/// What `process_turn` hands back to the session boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnResult {
    pub response: String,
    pub outcome: TurnOutcome,
    pub tool_calls: Vec<String>,
}

/// Short, filesystem-safe fragment of a session id used in identifiers.
pub fn session_fragment(session_id: &str) -> String {
    let fragment: String = session_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(8)
        .collect();
    if fragment.is_empty() {
        "anon".to_string()
    } else {
        fragment
    }
}

/// `PREFIX-<fragment>-<nnnn>`, unique per session for a monotonic `seq`.
pub fn scoped_id(prefix: &str, session_id: &str, seq: u64) -> String {
    format!("{prefix}-{}-{seq:04}", session_fragment(session_id))
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
