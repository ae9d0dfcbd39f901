//! Turn controller state machine.
//!
//! `CLASSIFY → INTENT_RESOLVE → LIVENESS_REDUCE → CONTEXT_PROJECT → EXECUTE →
//! GATE → {RETURN, RETRY → EXECUTE, ESCALATE → RETURN}`

use serde::{Deserialize, Serialize};

use crate::core::gate::GateDecision;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnStage {
    Classify,
    IntentResolve,
    LivenessReduce,
    ContextProject,
    Execute,
    Gate,
    Retry,
    Escalate,
    Return,
}

impl TurnStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnStage::Classify => "CLASSIFY",
            TurnStage::IntentResolve => "INTENT_RESOLVE",
            TurnStage::LivenessReduce => "LIVENESS_REDUCE",
            TurnStage::ContextProject => "CONTEXT_PROJECT",
            TurnStage::Execute => "EXECUTE",
            TurnStage::Gate => "GATE",
            TurnStage::Retry => "RETRY",
            TurnStage::Escalate => "ESCALATE",
            TurnStage::Return => "RETURN",
        }
    }

    /// Whether `next` is a legal successor of `self`.
    ///
    /// `EXECUTE → ESCALATE` covers an executor failure, which has no result
    /// for the gate to judge.
    pub fn can_advance_to(&self, next: TurnStage) -> bool {
        use TurnStage as S;
        matches!(
            (self, next),
            (S::Classify, S::IntentResolve)
                | (S::IntentResolve, S::LivenessReduce)
                | (S::LivenessReduce, S::ContextProject)
                | (S::ContextProject, S::Execute)
                | (S::Execute, S::Gate)
                | (S::Execute, S::Escalate)
                | (S::Gate, S::Return)
                | (S::Gate, S::Retry)
                | (S::Gate, S::Escalate)
                | (S::Retry, S::Execute)
                | (S::Escalate, S::Return)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnStage::Return)
    }
}

/// Where the controller goes after a gate decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateNext {
    Return,
    Retry,
    Escalate,
}

impl GateNext {
    pub fn stage(&self) -> TurnStage {
        match self {
            GateNext::Return => TurnStage::Return,
            GateNext::Retry => TurnStage::Retry,
            GateNext::Escalate => TurnStage::Escalate,
        }
    }
}

/// `retries_used` counts retries already issued for this turn.
///
/// Accepted results return; structural rejections escalate at once; other
/// rejections retry while `retries_used < max_retries`, then escalate.
pub fn next_after_gate(decision: &GateDecision, retries_used: u32, max_retries: u32) -> GateNext {
    if decision.is_accepted() {
        GateNext::Return
    } else if decision.is_structural() || retries_used >= max_retries {
        GateNext::Escalate
    } else {
        GateNext::Retry
    }
}
