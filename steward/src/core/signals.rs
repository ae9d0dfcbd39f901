//! Post-turn signals and the consolidation trigger rule.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::artifacts::ArtifactScope;
use crate::core::types::{Classification, TurnLabels, TurnOutcome};

/// What the Supervisor learned from one finished turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnSignal {
    pub turn_id: String,
    pub intent_id: Option<String>,
    pub domain: Option<String>,
    pub task: Option<String>,
    pub tools: Vec<String>,
    pub outcome: TurnOutcome,
}

impl TurnSignal {
    pub fn extract(
        turn_id: &str,
        intent_id: Option<&str>,
        classification: &Classification,
        tools: &[String],
        outcome: TurnOutcome,
    ) -> Self {
        let labels = classification.labels();
        let mut tools: Vec<String> = tools
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        tools.sort();
        tools.dedup();
        Self {
            turn_id: turn_id.to_string(),
            intent_id: intent_id.map(str::to_string),
            domain: labels.domain,
            task: labels.task,
            tools,
            outcome,
        }
    }

    /// Keys this signal counts toward, deduplicated and sorted.
    pub fn keys(&self) -> Vec<SignalKey> {
        let mut keys = BTreeSet::new();
        if let Some(domain) = &self.domain {
            keys.insert(SignalKey::new(SignalKind::Domain, domain));
        }
        if let Some(task) = &self.task {
            keys.insert(SignalKey::new(SignalKind::Task, task));
        }
        for tool in &self.tools {
            keys.insert(SignalKey::new(SignalKind::Tool, tool));
        }
        keys.into_iter().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SignalKind {
    Domain,
    Task,
    Tool,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::Domain => "domain",
            SignalKind::Task => "task",
            SignalKind::Tool => "tool",
        }
    }
}

/// `kind:value`, the unit consolidation counts.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SignalKey {
    pub kind: SignalKind,
    pub value: String,
}

impl SignalKey {
    pub fn new(kind: SignalKind, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }

    /// Labels an artifact learned from this key is scoped by. Tool keys carry
    /// no label dimension.
    pub fn labels(&self) -> TurnLabels {
        match self.kind {
            SignalKind::Domain => TurnLabels {
                domain: Some(self.value.clone()),
                task: None,
            },
            SignalKind::Task => TurnLabels {
                domain: None,
                task: Some(self.value.clone()),
            },
            SignalKind::Tool => TurnLabels::default(),
        }
    }
}

impl fmt::Display for SignalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.value)
    }
}

impl FromStr for SignalKey {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        let (kind, value) = raw
            .split_once(':')
            .ok_or_else(|| anyhow!("signal key missing ':' separator: {raw}"))?;
        let kind = match kind {
            "domain" => SignalKind::Domain,
            "task" => SignalKind::Task,
            "tool" => SignalKind::Tool,
            other => return Err(anyhow!("unknown signal kind: {other}")),
        };
        if value.is_empty() {
            return Err(anyhow!("signal key has empty value: {raw}"));
        }
        Ok(SignalKey::new(kind, value))
    }
}

/// A signal as read back from a session's governance stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalObservation {
    pub session_id: String,
    pub recorded_at: DateTime<Utc>,
    pub keys: Vec<SignalKey>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerPolicy {
    pub trigger_count: usize,
    pub session_window: usize,
    pub global_min_sessions: usize,
}

/// A key that crossed the trigger threshold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsolidationCandidate {
    pub key: SignalKey,
    pub occurrences: usize,
    /// Sessions the counted signals came from, sorted.
    pub sessions: Vec<String>,
    pub scope: ArtifactScope,
}

/// Keys among `turn_keys` whose fresh signal count has reached the trigger.
///
/// Only the `session_window` most recently active sessions are counted, and
/// only signals recorded strictly after the last dispatch for that key. A key
/// that was just dispatched therefore needs a full new set of occurrences
/// before it can trigger again.
pub fn due_consolidations(
    observations: &[SignalObservation],
    last_dispatch: &BTreeMap<SignalKey, DateTime<Utc>>,
    turn_keys: &[SignalKey],
    policy: &TriggerPolicy,
) -> Vec<ConsolidationCandidate> {
    let window = recent_sessions(observations, policy.session_window);

    let mut candidates = Vec::new();
    let mut seen = BTreeSet::new();
    for key in turn_keys {
        if !seen.insert(key) {
            continue;
        }
        let since = last_dispatch.get(key);
        let mut occurrences = 0usize;
        let mut sessions = BTreeSet::new();
        for obs in observations {
            if !window.contains(obs.session_id.as_str()) {
                continue;
            }
            if since.is_some_and(|since| obs.recorded_at <= *since) {
                continue;
            }
            if obs.keys.contains(key) {
                occurrences += 1;
                sessions.insert(obs.session_id.clone());
            }
        }
        if occurrences < policy.trigger_count {
            continue;
        }
        let global = key.kind == SignalKind::Tool || sessions.len() >= policy.global_min_sessions;
        let scope = if global {
            ArtifactScope::Global
        } else {
            ArtifactScope::Session
        };
        candidates.push(ConsolidationCandidate {
            key: key.clone(),
            occurrences,
            sessions: sessions.into_iter().collect(),
            scope,
        });
    }
    candidates
}

/// Session ids ordered by latest activity, most recent first, capped at `limit`.
fn recent_sessions(observations: &[SignalObservation], limit: usize) -> BTreeSet<&str> {
    let mut latest: BTreeMap<&str, DateTime<Utc>> = BTreeMap::new();
    for obs in observations {
        let entry = latest
            .entry(obs.session_id.as_str())
            .or_insert(obs.recorded_at);
        if obs.recorded_at > *entry {
            *entry = obs.recorded_at;
        }
    }
    let mut ordered: Vec<(&str, DateTime<Utc>)> = latest.into_iter().collect();
    ordered.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    ordered.into_iter().take(limit).map(|(id, _)| id).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::at;

    fn key(raw: &str) -> SignalKey {
        raw.parse().expect("key")
    }

    fn obs(session: &str, secs: i64, keys: &[&str]) -> SignalObservation {
        SignalObservation {
            session_id: session.to_string(),
            recorded_at: at(secs),
            keys: keys.iter().map(|k| key(k)).collect(),
        }
    }

    fn policy() -> TriggerPolicy {
        TriggerPolicy {
            trigger_count: 5,
            session_window: 3,
            global_min_sessions: 2,
        }
    }

    #[test]
    fn extract_normalizes_labels_and_tools() {
        let classification = Classification {
            domain: Some(" billing ".to_string()),
            task: Some("".to_string()),
            ..Classification::default()
        };
        let tools = vec![
            "ledger.read".to_string(),
            " ".to_string(),
            "ledger.read".to_string(),
        ];
        let signal = TurnSignal::extract(
            "TURN-1",
            Some("INT-1"),
            &classification,
            &tools,
            TurnOutcome::Success,
        );
        assert_eq!(signal.domain.as_deref(), Some("billing"));
        assert_eq!(signal.task, None);
        assert_eq!(signal.tools, vec!["ledger.read".to_string()]);
        assert_eq!(
            signal.keys(),
            vec![key("domain:billing"), key("tool:ledger.read")]
        );
    }

    #[test]
    fn key_round_trips_through_display() {
        let parsed = key("task:refund:partial");
        assert_eq!(parsed.kind, SignalKind::Task);
        assert_eq!(parsed.value, "refund:partial");
        assert_eq!(parsed.to_string(), "task:refund:partial");
        assert!("nope".parse::<SignalKey>().is_err());
        assert!("color:red".parse::<SignalKey>().is_err());
    }

    #[test]
    fn five_occurrences_across_three_sessions_trigger_once() {
        let observations = vec![
            obs("s1", 1, &["domain:billing"]),
            obs("s1", 2, &["domain:billing"]),
            obs("s2", 3, &["domain:billing"]),
            obs("s3", 4, &["domain:billing"]),
            obs("s3", 5, &["domain:billing", "task:refund"]),
        ];
        let due = due_consolidations(
            &observations,
            &BTreeMap::new(),
            &[key("domain:billing"), key("task:refund")],
            &policy(),
        );
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].key, key("domain:billing"));
        assert_eq!(due[0].occurrences, 5);
        assert_eq!(due[0].sessions, vec!["s1", "s2", "s3"]);
        assert_eq!(due[0].scope, ArtifactScope::Global);
    }

    #[test]
    fn occurrences_before_last_dispatch_do_not_count() {
        let mut observations: Vec<SignalObservation> =
            (1..=5).map(|i| obs("s1", i, &["domain:billing"])).collect();
        observations.push(obs("s1", 7, &["domain:billing"]));
        let dispatched = BTreeMap::from([(key("domain:billing"), at(6))]);

        let due = due_consolidations(
            &observations,
            &dispatched,
            &[key("domain:billing")],
            &policy(),
        );
        assert!(due.is_empty());
    }

    #[test]
    fn single_session_yields_session_scope() {
        let observations: Vec<SignalObservation> =
            (1..=5).map(|i| obs("s1", i, &["task:refund"])).collect();
        let due = due_consolidations(
            &observations,
            &BTreeMap::new(),
            &[key("task:refund")],
            &policy(),
        );
        assert_eq!(due[0].scope, ArtifactScope::Session);
    }

    #[test]
    fn only_recent_sessions_are_counted() {
        let mut observations = vec![
            obs("old", 1, &["domain:billing"]),
            obs("old", 2, &["domain:billing"]),
        ];
        observations.push(obs("a", 10, &["domain:billing"]));
        observations.push(obs("b", 11, &["domain:billing"]));
        observations.push(obs("c", 12, &["domain:billing"]));
        let policy = TriggerPolicy {
            session_window: 3,
            ..policy()
        };
        let due = due_consolidations(
            &observations,
            &BTreeMap::new(),
            &[key("domain:billing")],
            &policy,
        );
        assert!(due.is_empty());
    }

    #[test]
    fn tool_keys_always_yield_global_scope() {
        let observations: Vec<SignalObservation> =
            (1..=5).map(|i| obs("s1", i, &["tool:ledger.read"])).collect();
        let due = due_consolidations(
            &observations,
            &BTreeMap::new(),
            &[key("tool:ledger.read")],
            &policy(),
        );
        assert_eq!(due[0].scope, ArtifactScope::Global);
        assert!(due[0].key.labels().is_empty());
    }
}
