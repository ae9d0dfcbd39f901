//! Ledger record model and hash-chain sealing.
//!
//! Sealing is a pure function of the previous record's hash and the draft's
//! canonical content, so two ledgers holding the same ordered content always
//! compute the same chain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

/// `prev_hash` of the first record in every stream.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Closed set of ledger event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    TurnStarted,
    TurnCompleted,
    IntentDeclared,
    IntentContinued,
    IntentSuperseded,
    IntentClosed,
    IntentConflict,
    WorkOrderPlanned,
    WorkOrderDispatched,
    WorkOrderCompleted,
    WorkOrderFailed,
    GateDecision,
    EscalationRaised,
    TurnSignal,
    ConsolidationDispatched,
    ConsolidationFailed,
    ArtifactCreated,
    LivenessSnapshot,
    ProjectionSnapshot,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TurnStarted => "TURN_STARTED",
            EventType::TurnCompleted => "TURN_COMPLETED",
            EventType::IntentDeclared => "INTENT_DECLARED",
            EventType::IntentContinued => "INTENT_CONTINUED",
            EventType::IntentSuperseded => "INTENT_SUPERSEDED",
            EventType::IntentClosed => "INTENT_CLOSED",
            EventType::IntentConflict => "INTENT_CONFLICT",
            EventType::WorkOrderPlanned => "WORK_ORDER_PLANNED",
            EventType::WorkOrderDispatched => "WORK_ORDER_DISPATCHED",
            EventType::WorkOrderCompleted => "WORK_ORDER_COMPLETED",
            EventType::WorkOrderFailed => "WORK_ORDER_FAILED",
            EventType::GateDecision => "GATE_DECISION",
            EventType::EscalationRaised => "ESCALATION_RAISED",
            EventType::TurnSignal => "TURN_SIGNAL",
            EventType::ConsolidationDispatched => "CONSOLIDATION_DISPATCHED",
            EventType::ConsolidationFailed => "CONSOLIDATION_FAILED",
            EventType::ArtifactCreated => "ARTIFACT_CREATED",
            EventType::LivenessSnapshot => "LIVENESS_SNAPSHOT",
            EventType::ProjectionSnapshot => "PROJECTION_SNAPSHOT",
        }
    }
}

/// A record before it has been placed in a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordDraft {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub entity_id: String,
    pub metadata: Value,
}

/// An immutable, hash-chained ledger record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventType,
    pub entity_id: String,
    pub metadata: Value,
    pub prev_hash: String,
    pub hash: String,
}

impl LedgerRecord {
    /// String metadata field, if present.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    pub fn content(&self) -> RecordDraft {
        RecordDraft {
            sequence: self.sequence,
            timestamp: self.timestamp,
            event_type: self.event_type,
            entity_id: self.entity_id.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// Chain tip: what the next record must link to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTip {
    pub next_sequence: u64,
    pub hash: String,
}

impl ChainTip {
    pub fn genesis() -> Self {
        Self {
            next_sequence: 0,
            hash: GENESIS_HASH.to_string(),
        }
    }

    pub fn after(record: &LedgerRecord) -> Self {
        Self {
            next_sequence: record.sequence + 1,
            hash: record.hash.clone(),
        }
    }
}

/// Canonical content bytes: JSON with object keys sorted.
pub fn canonical_content(draft: &RecordDraft) -> String {
    let value = json!({
        "sequence": draft.sequence,
        "timestamp": draft.timestamp,
        "event_type": draft.event_type,
        "entity_id": draft.entity_id,
        "metadata": draft.metadata,
    });
    sort_keys(value).to_string()
}

/// Rebuild every object with keys inserted in sorted order. Holds whether or
/// not serde_json preserves insertion order.
fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, inner)| (key, sort_keys(inner)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// `sha256(prev_hash ‖ canonical(content))` as lowercase hex.
pub fn compute_hash(prev_hash: &str, draft: &RecordDraft) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(canonical_content(draft).as_bytes());
    hex::encode(hasher.finalize())
}

/// Seal a draft onto the chain at `tip`.
///
/// Fails when the draft's sequence is not the next position in the stream.
pub fn seal(tip: &ChainTip, draft: RecordDraft) -> Result<LedgerRecord, (u64, u64)> {
    if draft.sequence != tip.next_sequence {
        return Err((tip.next_sequence, draft.sequence));
    }
    let hash = compute_hash(&tip.hash, &draft);
    Ok(LedgerRecord {
        sequence: draft.sequence,
        timestamp: draft.timestamp,
        event_type: draft.event_type,
        entity_id: draft.entity_id,
        metadata: draft.metadata,
        prev_hash: tip.hash.clone(),
        hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn draft(sequence: u64, entity: &str, metadata: Value) -> RecordDraft {
        RecordDraft {
            sequence,
            timestamp: Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap(),
            event_type: EventType::IntentDeclared,
            entity_id: entity.to_string(),
            metadata,
        }
    }

    #[test]
    fn seal_links_to_previous_hash() {
        let first = seal(&ChainTip::genesis(), draft(0, "a", json!({}))).expect("seal");
        assert_eq!(first.prev_hash, GENESIS_HASH);
        let second = seal(&ChainTip::after(&first), draft(1, "b", json!({}))).expect("seal");
        assert_eq!(second.prev_hash, first.hash);
        assert_ne!(second.hash, first.hash);
    }

    #[test]
    fn seal_rejects_out_of_position_sequence() {
        let err = seal(&ChainTip::genesis(), draft(3, "a", json!({}))).unwrap_err();
        assert_eq!(err, (0, 3));
    }

    #[test]
    fn hash_ignores_metadata_key_order() {
        let left: Value = serde_json::from_str(r#"{"b":1,"a":2}"#).unwrap();
        let right: Value = serde_json::from_str(r#"{"a":2,"b":1}"#).unwrap();
        assert_eq!(
            compute_hash(GENESIS_HASH, &draft(0, "x", left)),
            compute_hash(GENESIS_HASH, &draft(0, "x", right))
        );
    }

    #[test]
    fn event_type_serializes_as_screaming_snake() {
        let encoded = serde_json::to_string(&EventType::WorkOrderCompleted).unwrap();
        assert_eq!(encoded, "\"WORK_ORDER_COMPLETED\"");
        assert_eq!(
            EventType::WorkOrderCompleted.as_str(),
            "WORK_ORDER_COMPLETED"
        );
    }
}
