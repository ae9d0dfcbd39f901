//! Hash-chain invariants checked on replay.

use crate::core::record::{GENESIS_HASH, LedgerRecord, compute_hash};

/// Check chain invariants for one stream, in stored order:
/// - sequences are `0..n` with no gaps or repeats
/// - each `prev_hash` equals the previous record's `hash` (genesis for the first)
/// - each `hash` recomputes from `prev_hash` and the record content
///
/// Returns stable error messages in stream order; empty means intact.
pub fn verify_chain(records: &[LedgerRecord]) -> Vec<String> {
    let mut errors = Vec::new();
    let mut expected_prev = GENESIS_HASH.to_string();

    for (position, record) in records.iter().enumerate() {
        let position = position as u64;
        if record.sequence != position {
            errors.push(format!(
                "record at position {position} has sequence {}",
                record.sequence
            ));
        }
        if record.prev_hash != expected_prev {
            errors.push(format!(
                "record {}: prev_hash does not match previous record",
                record.sequence
            ));
        }
        let recomputed = compute_hash(&record.prev_hash, &record.content());
        if recomputed != record.hash {
            errors.push(format!("record {}: hash mismatch", record.sequence));
        }
        expected_prev = record.hash.clone();
    }

    errors
}
