//! Liveness reduction: fold source records into "what is currently alive".
//!
//! Records from both source streams are grouped by the entity they describe,
//! ordered by `(timestamp, log-append order)`, and the last lifecycle record in
//! each group decides the entity's status. Log-append order means every record
//! of stream A in stored order, then every record of stream B; it only matters
//! when timestamps tie. On a tie an `ESCALATION_RAISED` always sorts last, so an
//! escalation is never hidden by a completion stamped in the same instant.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::record::{EventType, LedgerRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentStatus {
    Live,
    Superseded,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkOrderStatus {
    Open,
    Closed,
    Failed,
}

/// Status plus the metadata of the record that decided it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityView<S> {
    pub status: S,
    pub last_event: EventType,
    pub updated_at: DateTime<Utc>,
    pub meta: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveIntent {
    pub intent_id: String,
    pub scope: String,
    pub objective: String,
    pub parent_intent_id: Option<String>,
    pub declared_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenWorkOrder {
    pub work_order_id: String,
    pub work_type: Option<String>,
    pub dispatched: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedItem {
    pub work_order_id: String,
    pub work_type: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Escalation {
    pub work_order_id: String,
    pub reason: String,
    pub raised_at: DateTime<Utc>,
}

/// Derived view of live intents and units of work. A cache, never a source of
/// truth: it must always be reproducible from the source streams.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LivenessState {
    pub intents: BTreeMap<String, EntityView<IntentStatus>>,
    pub work_orders: BTreeMap<String, EntityView<WorkOrderStatus>>,
    /// Live intents, oldest declaration first.
    pub active_intents: Vec<ActiveIntent>,
    pub open_work_orders: Vec<OpenWorkOrder>,
    pub failed_items: Vec<FailedItem>,
    pub escalations: Vec<Escalation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum EntityKind {
    Intent,
    WorkOrder,
}

/// Position of a record in the merged input: timestamp, tie rank, stream, append position.
type Order = (DateTime<Utc>, u8, usize, usize);

fn tie_rank(event_type: EventType) -> u8 {
    match event_type {
        EventType::EscalationRaised => 1,
        _ => 0,
    }
}

struct Tagged<'a> {
    order: Order,
    record: &'a LedgerRecord,
}

/// Reduce two source streams into a [`LivenessState`]. Pure and deterministic.
///
/// An empty `stream_b` is the same as a missing one.
pub fn reduce(stream_a: &[LedgerRecord], stream_b: &[LedgerRecord]) -> LivenessState {
    let mut groups: BTreeMap<(EntityKind, String), Vec<Tagged<'_>>> = BTreeMap::new();

    for (stream_idx, stream) in [stream_a, stream_b].into_iter().enumerate() {
        for (position, record) in stream.iter().enumerate() {
            let Some(key) = join_key(record) else {
                continue;
            };
            groups.entry(key).or_default().push(Tagged {
                order: (
                    record.timestamp,
                    tie_rank(record.event_type),
                    stream_idx,
                    position,
                ),
                record,
            });
        }
    }

    let mut state = LivenessState::default();
    let mut active: Vec<(Order, ActiveIntent)> = Vec::new();
    let mut open: Vec<(Order, OpenWorkOrder)> = Vec::new();
    let mut failed: Vec<(Order, FailedItem)> = Vec::new();
    let mut escalations: Vec<(Order, Escalation)> = Vec::new();

    for ((kind, id), mut group) in groups {
        group.sort_by(|a, b| a.order.cmp(&b.order));
        let Some(last) = group.last() else {
            continue;
        };
        match kind {
            EntityKind::Intent => {
                let status = intent_status(last.record.event_type);
                state.intents.insert(id.clone(), view(status, last.record));
                if status == IntentStatus::Live {
                    let declared = group
                        .iter()
                        .find(|t| t.record.event_type == EventType::IntentDeclared);
                    active.push(active_intent(&id, declared, &group[0]));
                }
            }
            EntityKind::WorkOrder => {
                let status = work_order_status(last.record.event_type);
                state
                    .work_orders
                    .insert(id.clone(), view(status, last.record));
                let work_type = group
                    .iter()
                    .find_map(|t| t.record.meta_str("work_type"))
                    .map(str::to_string);
                match status {
                    WorkOrderStatus::Open => open.push((
                        group[0].order,
                        OpenWorkOrder {
                            work_order_id: id.clone(),
                            work_type,
                            dispatched: last.record.event_type == EventType::WorkOrderDispatched,
                        },
                    )),
                    WorkOrderStatus::Failed => {
                        let reason = last
                            .record
                            .meta_str("reason")
                            .unwrap_or("unspecified")
                            .to_string();
                        if last.record.event_type == EventType::EscalationRaised {
                            escalations.push((
                                last.order,
                                Escalation {
                                    work_order_id: id.clone(),
                                    reason: reason.clone(),
                                    raised_at: last.record.timestamp,
                                },
                            ));
                        }
                        failed.push((
                            last.order,
                            FailedItem {
                                work_order_id: id.clone(),
                                work_type,
                                reason,
                            },
                        ));
                    }
                    WorkOrderStatus::Closed => {}
                }
            }
        }
    }

    active.sort_by(|a, b| a.0.cmp(&b.0));
    open.sort_by(|a, b| a.0.cmp(&b.0));
    failed.sort_by(|a, b| a.0.cmp(&b.0));
    escalations.sort_by(|a, b| a.0.cmp(&b.0));

    state.active_intents = active.into_iter().map(|(_, v)| v).collect();
    state.open_work_orders = open.into_iter().map(|(_, v)| v).collect();
    state.failed_items = failed.into_iter().map(|(_, v)| v).collect();
    state.escalations = escalations.into_iter().map(|(_, v)| v).collect();
    state
}

/// Entity a lifecycle record belongs to. Non-lifecycle records return `None`.
///
/// The join key is the `intent_id` / `work_order_id` metadata field when
/// present, falling back to `entity_id`, so both streams can refer to the
/// same entity.
fn join_key(record: &LedgerRecord) -> Option<(EntityKind, String)> {
    let (kind, field) = match record.event_type {
        EventType::IntentDeclared
        | EventType::IntentContinued
        | EventType::IntentSuperseded
        | EventType::IntentClosed => (EntityKind::Intent, "intent_id"),
        EventType::WorkOrderPlanned
        | EventType::WorkOrderDispatched
        | EventType::WorkOrderCompleted
        | EventType::WorkOrderFailed
        | EventType::EscalationRaised => (EntityKind::WorkOrder, "work_order_id"),
        _ => return None,
    };
    let id = record.meta_str(field).unwrap_or(&record.entity_id);
    Some((kind, id.to_string()))
}

fn intent_status(event: EventType) -> IntentStatus {
    match event {
        EventType::IntentSuperseded => IntentStatus::Superseded,
        EventType::IntentClosed => IntentStatus::Closed,
        _ => IntentStatus::Live,
    }
}

fn work_order_status(event: EventType) -> WorkOrderStatus {
    match event {
        EventType::WorkOrderCompleted => WorkOrderStatus::Closed,
        EventType::WorkOrderFailed | EventType::EscalationRaised => WorkOrderStatus::Failed,
        _ => WorkOrderStatus::Open,
    }
}

fn view<S>(status: S, record: &LedgerRecord) -> EntityView<S> {
    EntityView {
        status,
        last_event: record.event_type,
        updated_at: record.timestamp,
        meta: record.metadata.clone(),
    }
}

fn active_intent(
    id: &str,
    declared: Option<&Tagged<'_>>,
    first: &Tagged<'_>,
) -> (Order, ActiveIntent) {
    let source = declared.unwrap_or(first);
    let record = source.record;
    (
        source.order,
        ActiveIntent {
            intent_id: id.to_string(),
            scope: record.meta_str("scope").unwrap_or("session").to_string(),
            objective: record.meta_str("objective").unwrap_or_default().to_string(),
            parent_intent_id: record.meta_str("parent_intent_id").map(str::to_string),
            declared_at: record.timestamp,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordBuilder, at};
    use serde_json::json;

    #[test]
    fn reduce_is_deterministic_across_calls() {
        let mut a = RecordBuilder::new();
        a.push(
            1,
            EventType::IntentDeclared,
            "INT-1",
            json!({"objective": "plan"}),
        );
        a.push(
            2,
            EventType::WorkOrderPlanned,
            "WO-1",
            json!({"work_type": "synthesize"}),
        );
        let mut b = RecordBuilder::new();
        b.push(3, EventType::WorkOrderCompleted, "WO-1", json!({}));

        let first = reduce(a.records(), b.records());
        let second = reduce(a.records(), b.records());
        assert_eq!(first, second);
    }

    #[test]
    fn latest_event_wins_for_superseded_intent() {
        let mut a = RecordBuilder::new();
        a.push(1, EventType::IntentDeclared, "INT-1", json!({}));
        a.push(2, EventType::IntentSuperseded, "INT-1", json!({}));

        let state = reduce(a.records(), &[]);
        assert!(state.active_intents.is_empty());
        assert_eq!(state.intents["INT-1"].status, IntentStatus::Superseded);
    }

    #[test]
    fn timestamp_order_beats_append_order() {
        let mut a = RecordBuilder::new();
        a.push(5, EventType::IntentClosed, "INT-1", json!({}));
        a.push(1, EventType::IntentDeclared, "INT-1", json!({}));

        let state = reduce(a.records(), &[]);
        assert_eq!(state.intents["INT-1"].status, IntentStatus::Closed);
    }

    #[test]
    fn cross_stream_completion_closes_work_order() {
        let mut a = RecordBuilder::new();
        a.push(1, EventType::WorkOrderPlanned, "WO-1", json!({}));
        let mut b = RecordBuilder::new();
        b.push(
            2,
            EventType::WorkOrderCompleted,
            "completion-7",
            json!({"work_order_id": "WO-1"}),
        );

        let state = reduce(a.records(), b.records());
        assert_eq!(state.work_orders["WO-1"].status, WorkOrderStatus::Closed);
        assert!(state.open_work_orders.is_empty());
    }

    #[test]
    fn planned_only_work_order_is_open() {
        let mut a = RecordBuilder::new();
        a.push(
            1,
            EventType::WorkOrderPlanned,
            "WO-1",
            json!({"work_type": "classify"}),
        );

        let state = reduce(a.records(), &[]);
        assert_eq!(
            state.open_work_orders,
            vec![OpenWorkOrder {
                work_order_id: "WO-1".to_string(),
                work_type: Some("classify".to_string()),
                dispatched: false,
            }]
        );
    }

    #[test]
    fn escalation_marks_work_order_failed() {
        let mut a = RecordBuilder::new();
        a.push(
            1,
            EventType::WorkOrderPlanned,
            "WO-1",
            json!({"work_type": "synthesize"}),
        );
        a.push(
            3,
            EventType::EscalationRaised,
            "WO-1",
            json!({"reason": "ungrounded_source_claim"}),
        );
        let mut b = RecordBuilder::new();
        b.push(2, EventType::WorkOrderCompleted, "WO-1", json!({}));

        let state = reduce(a.records(), b.records());
        assert_eq!(state.work_orders["WO-1"].status, WorkOrderStatus::Failed);
        assert_eq!(state.failed_items.len(), 1);
        assert_eq!(state.failed_items[0].reason, "ungrounded_source_claim");
        assert_eq!(state.escalations.len(), 1);
        assert_eq!(state.escalations[0].raised_at, at(3));
    }

    #[test]
    fn executor_failure_is_failed_without_escalation() {
        let mut a = RecordBuilder::new();
        a.push(1, EventType::WorkOrderDispatched, "WO-1", json!({}));
        let mut b = RecordBuilder::new();
        b.push(
            2,
            EventType::WorkOrderFailed,
            "WO-1",
            json!({"reason": "timeout"}),
        );

        let state = reduce(a.records(), b.records());
        assert_eq!(state.failed_items[0].reason, "timeout");
        assert!(state.escalations.is_empty());
    }

    #[test]
    fn timestamp_tie_breaks_by_append_order_stream_a_first() {
        let mut a = RecordBuilder::new();
        a.push(4, EventType::WorkOrderDispatched, "WO-1", json!({}));
        let mut b = RecordBuilder::new();
        b.push(4, EventType::WorkOrderCompleted, "WO-1", json!({}));

        let state = reduce(a.records(), b.records());
        assert_eq!(state.work_orders["WO-1"].status, WorkOrderStatus::Closed);
    }

    #[test]
    fn escalation_outranks_completion_at_same_timestamp() {
        let mut a = RecordBuilder::new();
        a.push(
            1,
            EventType::WorkOrderDispatched,
            "WO-1",
            json!({"work_type": "synthesize"}),
        );
        a.push(
            4,
            EventType::EscalationRaised,
            "WO-1",
            json!({"reason": "shape_mismatch"}),
        );
        let mut b = RecordBuilder::new();
        b.push(4, EventType::WorkOrderCompleted, "WO-1", json!({}));

        let state = reduce(a.records(), b.records());
        assert_eq!(state.work_orders["WO-1"].status, WorkOrderStatus::Failed);
        assert_eq!(
            state.work_orders["WO-1"].last_event,
            EventType::EscalationRaised
        );
        assert_eq!(state.escalations.len(), 1);
        assert_eq!(state.escalations[0].reason, "shape_mismatch");
        assert_eq!(state.failed_items.len(), 1);
    }

    #[test]
    fn active_intents_are_oldest_first_and_carry_declaration() {
        let mut a = RecordBuilder::new();
        a.push(
            2,
            EventType::IntentDeclared,
            "INT-2",
            json!({"objective": "second", "scope": "session"}),
        );
        a.push(
            1,
            EventType::IntentDeclared,
            "INT-1",
            json!({"objective": "first", "scope": "session"}),
        );
        a.push(3, EventType::IntentContinued, "INT-1", json!({}));

        let state = reduce(a.records(), &[]);
        let ids: Vec<&str> = state
            .active_intents
            .iter()
            .map(|i| i.intent_id.as_str())
            .collect();
        assert_eq!(ids, vec!["INT-1", "INT-2"]);
        assert_eq!(state.active_intents[0].objective, "first");
    }

    #[test]
    fn non_lifecycle_records_are_ignored() {
        let mut a = RecordBuilder::new();
        a.push(1, EventType::TurnStarted, "TURN-1", json!({}));
        a.push(2, EventType::TurnSignal, "TURN-1", json!({}));

        let state = reduce(a.records(), &[]);
        assert_eq!(state, LivenessState::default());
    }
}
