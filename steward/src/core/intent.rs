//! Intent lifecycle resolution.
//!
//! Maps the classifier's stated action and the set of live intents onto one
//! lifecycle transition. Missing or unclear signals fall back to "bridge"
//! behavior: keep or create exactly one identifiable active intent and flag a
//! conflict instead of failing.

use serde::{Deserialize, Serialize};

use crate::core::liveness::ActiveIntent;
use crate::core::types::{Classification, ClassifierAction, Intent, scoped_id};

const DEFAULT_SCOPE: &str = "session";
const BRIDGE_OBJECTIVE: &str = "(unstated objective)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentAction {
    Declare,
    Continue,
    Supersede,
    Close,
    Noop,
}

/// Result of [`resolve`]. Carries everything the caller must append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub action: IntentAction,
    /// Intent to declare (`Declare`, `Supersede`).
    pub new_intent: Option<Intent>,
    /// Intent that stops being live (`Supersede`, `Close`).
    pub closed_intent_id: Option<String>,
    /// Intent that stays live (`Continue`).
    pub continued_intent_id: Option<String>,
    /// True when the single-active-intent invariant is violated or the
    /// classifier explicitly could not decide.
    pub conflict: bool,
    /// Classifier signal was missing or unclear and a fallback was applied.
    pub bridged: bool,
}

impl Resolution {
    fn new(action: IntentAction) -> Self {
        Self {
            action,
            new_intent: None,
            closed_intent_id: None,
            continued_intent_id: None,
            conflict: false,
            bridged: false,
        }
    }

    /// Intent the current turn works under, if any.
    pub fn current_intent_id(&self) -> Option<&str> {
        self.new_intent
            .as_ref()
            .map(|i| i.intent_id.as_str())
            .or(self.continued_intent_id.as_deref())
    }
}

/// Resolve the lifecycle transition for this turn.
///
/// `active` must be ordered oldest first (as produced by the liveness reducer);
/// "most recent" is the last element. `next_sequence` numbers a declared intent.
pub fn resolve(
    active: &[ActiveIntent],
    classification: &Classification,
    session_id: &str,
    next_sequence: u64,
) -> Resolution {
    let stated = classification.action;

    match active {
        [] => match stated {
            Some(ClassifierAction::Close) => Resolution::new(IntentAction::Noop),
            Some(ClassifierAction::New) => {
                declare(classification, session_id, next_sequence, None, false)
            }
            _ => declare(classification, session_id, next_sequence, None, true),
        },
        [only] => match stated {
            Some(ClassifierAction::New) => {
                let mut resolution = declare(
                    classification,
                    session_id,
                    next_sequence,
                    Some(only.intent_id.clone()),
                    false,
                );
                resolution.action = IntentAction::Supersede;
                resolution.closed_intent_id = Some(only.intent_id.clone());
                resolution
            }
            Some(ClassifierAction::Continue) => continue_with(only, false, false),
            Some(ClassifierAction::Close) => {
                let mut resolution = Resolution::new(IntentAction::Close);
                resolution.closed_intent_id = Some(only.intent_id.clone());
                resolution
            }
            Some(ClassifierAction::Unclear) => continue_with(only, true, true),
            None => continue_with(only, false, true),
        },
        [.., most_recent] => continue_with(most_recent, true, stated.is_none()),
    }
}

fn declare(
    classification: &Classification,
    session_id: &str,
    next_sequence: u64,
    parent_intent_id: Option<String>,
    bridged: bool,
) -> Resolution {
    let objective = classification
        .objective
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(BRIDGE_OBJECTIVE)
        .to_string();
    let scope = classification
        .scope
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_SCOPE)
        .to_string();

    let mut resolution = Resolution::new(IntentAction::Declare);
    resolution.bridged = bridged;
    resolution.new_intent = Some(Intent {
        intent_id: scoped_id("INT", session_id, next_sequence),
        scope,
        objective,
        parent_intent_id,
    });
    resolution
}

fn continue_with(intent: &ActiveIntent, conflict: bool, bridged: bool) -> Resolution {
    let mut resolution = Resolution::new(IntentAction::Continue);
    resolution.continued_intent_id = Some(intent.intent_id.clone());
    resolution.conflict = conflict;
    resolution.bridged = bridged;
    resolution
}
