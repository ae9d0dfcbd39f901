//! Rebuild liveness from source streams alone and check cached snapshots
//! against it.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::core::liveness::{LivenessState, reduce};
use crate::core::record::{EventType, LedgerRecord};
use crate::io::ledger::{Ledger, StreamId, validate_session_id};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionReplay {
    pub session_id: String,
    pub liveness: LivenessState,
    pub snapshots_checked: usize,
    /// Turn ids whose cached liveness snapshot differs from replay.
    pub snapshot_mismatches: Vec<String>,
}

/// Liveness for `session_id` from its governance and execution streams.
/// Both chains must verify first.
pub fn replay_session(ledger: &Ledger, session_id: &str) -> Result<LivenessState> {
    let (governance, execution) = source_records(ledger, session_id)?;
    Ok(reduce(&governance, &execution))
}

/// Liveness as it stood at `as_of`: only records stamped at or before it.
pub fn replay_until(
    ledger: &Ledger,
    session_id: &str,
    as_of: DateTime<Utc>,
) -> Result<LivenessState> {
    let (governance, execution) = source_records(ledger, session_id)?;
    let upto = |records: Vec<LedgerRecord>| -> Vec<LedgerRecord> {
        records
            .into_iter()
            .filter(|r| r.timestamp <= as_of)
            .collect()
    };
    Ok(reduce(&upto(governance), &upto(execution)))
}

/// Replay the session and compare every cached `LIVENESS_SNAPSHOT` with a
/// replay up to the snapshot's timestamp.
pub fn audit_session(ledger: &Ledger, session_id: &str) -> Result<SessionReplay> {
    let liveness = replay_session(ledger, session_id)?;
    let snapshots = ledger.read_filtered(&StreamId::Liveness(session_id.to_string()), |r| {
        r.event_type == EventType::LivenessSnapshot
    })?;

    let mut mismatches = Vec::new();
    for record in &snapshots {
        let cached: LivenessState = serde_json::from_value(record.metadata["state"].clone())
            .with_context(|| format!("liveness snapshot {}", record.sequence))?;
        let replayed = replay_until(ledger, session_id, record.timestamp)?;
        if cached != replayed {
            warn!(
                session = session_id,
                turn = %record.entity_id,
                "cached liveness differs from replay"
            );
            mismatches.push(record.entity_id.clone());
        }
    }
    debug!(
        session = session_id,
        snapshots = snapshots.len(),
        mismatches = mismatches.len(),
        "session audited"
    );

    Ok(SessionReplay {
        session_id: session_id.to_string(),
        liveness,
        snapshots_checked: snapshots.len(),
        snapshot_mismatches: mismatches,
    })
}

fn source_records(
    ledger: &Ledger,
    session_id: &str,
) -> Result<(Vec<LedgerRecord>, Vec<LedgerRecord>)> {
    validate_session_id(session_id)?;
    let governance = StreamId::Governance(session_id.to_string());
    let execution = StreamId::Execution(session_id.to_string());
    ledger.ensure_intact(&governance)?;
    ledger.ensure_intact(&execution)?;
    Ok((ledger.read_all(&governance)?, ledger.read_all(&execution)?))
}
