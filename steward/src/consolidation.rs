//! Out-of-band consolidation: turns accumulated turn signals into artifacts.
//!
//! Runs after a turn's result is fixed. Nothing here can fail the turn:
//! [`Consolidator::after_turn`] logs and records its own failures and returns
//! whatever artifacts it managed to create.

use std::collections::BTreeMap;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::core::artifacts::Artifact;
use crate::core::gate::{Criteria, QualityGate, parse_json_result};
use crate::core::record::{EventType, LedgerRecord};
use crate::core::signals::{
    ConsolidationCandidate, SignalKey, SignalObservation, TurnSignal, due_consolidations,
};
use crate::core::types::{UnitOfWork, WorkType};
use crate::io::clock::Clock;
use crate::io::config::SupervisorConfig;
use crate::io::contracts::Contracts;
use crate::io::executor::{Executor, ExecutorBoundary, RetryPolicy};
use crate::io::ledger::{Ledger, StreamId};
use crate::io::prompt::PromptEngine;

const MAX_SAMPLES: usize = 5;

/// What the consolidate contract yields.
#[derive(Debug, Deserialize)]
struct ConsolidationOutput {
    context_line: String,
    #[serde(default = "default_weight")]
    weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

pub struct Consolidator<'a> {
    pub ledger: &'a Ledger,
    pub executor: &'a dyn Executor,
    pub clock: &'a dyn Clock,
    pub config: &'a SupervisorConfig,
    pub prompts: &'a PromptEngine,
    pub contracts: &'a Contracts,
    pub gate: &'a QualityGate,
}

impl Consolidator<'_> {
    /// Dispatch a consolidation unit for every key of this turn that crossed
    /// the trigger. Never fails.
    #[instrument(skip_all, fields(session = session_id))]
    pub fn after_turn(&self, session_id: &str, turn_keys: &[SignalKey]) -> Vec<Artifact> {
        let candidates = match self.due(turn_keys) {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "consolidation check failed");
                return Vec::new();
            }
        };

        let mut created = Vec::new();
        for candidate in candidates {
            match self.consolidate(session_id, &candidate) {
                Ok(artifact) => {
                    info!(
                        key = %candidate.key,
                        artifact = %artifact.artifact_id,
                        "artifact created"
                    );
                    created.push(artifact);
                }
                Err(err) => {
                    warn!(
                        key = %candidate.key,
                        error = %format!("{err:#}"),
                        "consolidation failed"
                    );
                    self.record_failure(&candidate, &err);
                }
            }
        }
        created
    }

    fn due(&self, turn_keys: &[SignalKey]) -> Result<Vec<ConsolidationCandidate>> {
        if turn_keys.is_empty() {
            return Ok(Vec::new());
        }
        let observations = signal_observations(self.ledger)?;
        let last_dispatch = last_dispatch(self.ledger)?;
        let due = due_consolidations(
            &observations,
            &last_dispatch,
            turn_keys,
            &self.config.trigger_policy(),
        );
        debug!(observations = observations.len(), due = due.len(), "consolidation check");
        Ok(due)
    }

    fn consolidate(
        &self,
        session_id: &str,
        candidate: &ConsolidationCandidate,
    ) -> Result<Artifact> {
        let seq = self
            .ledger
            .read_filtered(&StreamId::Consolidation, |r| {
                r.event_type == EventType::ConsolidationDispatched
            })?
            .len() as u64
            + 1;
        let work_order_id = format!("CWO-{seq:04}");
        let key = candidate.key.to_string();

        let samples = self.samples(candidate)?;
        let input = self.prompts.consolidate(
            candidate,
            &samples,
            self.config.budgets.token_budget as usize,
        )?;
        let now = self.clock.now();
        let unit = UnitOfWork::planned(
            work_order_id.clone(),
            WorkType::Consolidate,
            input,
            self.config.constraints(WorkType::Consolidate),
            now,
        );
        self.ledger.append_event(
            &StreamId::Consolidation,
            now,
            EventType::ConsolidationDispatched,
            &work_order_id,
            json!({
                "work_order_id": work_order_id,
                "key": key,
                "occurrences": candidate.occurrences,
                "sessions": candidate.sessions,
                "scope": candidate.scope,
                "triggered_by": session_id,
            }),
        )?;

        let boundary = ExecutorBoundary::new(
            self.executor,
            self.ledger,
            self.clock,
            StreamId::ConsolidationExecution,
            RetryPolicy::from(&self.config.executor),
        );
        let settled = boundary.dispatch(unit)?;
        if let Some(err) = settled.error {
            return Err(anyhow::Error::new(err).context(format!("{work_order_id} executor")));
        }

        let result = settled.unit.result.unwrap_or_default();
        let decision = self.gate.verify(
            &result,
            &Criteria::shape_only(self.contracts.for_work(WorkType::Consolidate)),
        );
        if !decision.is_accepted() {
            bail!(
                "{work_order_id} rejected by gate: {}",
                decision.reason_strings().join(", ")
            );
        }
        let value = parse_json_result(&result)
            .ok_or_else(|| anyhow!("{work_order_id} result is not JSON"))?;
        let output: ConsolidationOutput =
            serde_json::from_value(value).with_context(|| format!("{work_order_id} output"))?;

        let created_at = self.clock.now();
        let artifact = Artifact {
            artifact_id: format!("ART-{seq:04}"),
            enabled: true,
            labels: candidate.key.labels(),
            scope: candidate.scope,
            weight: output.weight,
            created_at,
            expires_at: self
                .config
                .consolidation
                .artifact_ttl_days
                .map(|days| created_at + chrono::Duration::days(i64::from(days))),
            context_line: output.context_line.trim().to_string(),
        };
        self.ledger.append_derived(
            &StreamId::Artifacts,
            created_at,
            EventType::ArtifactCreated,
            &artifact.artifact_id,
            json!({
                "artifact": artifact,
                "work_order_id": work_order_id,
                "key": key,
            }),
        )?;
        Ok(artifact)
    }

    /// Objectives of the intents whose turns produced `candidate.key`,
    /// most recent last.
    fn samples(&self, candidate: &ConsolidationCandidate) -> Result<Vec<String>> {
        let mut samples: Vec<String> = Vec::new();
        for session in &candidate.sessions {
            let records = self.ledger.read_all(&StreamId::Governance(session.clone()))?;
            let objectives: BTreeMap<&str, &str> = records
                .iter()
                .filter(|r| r.event_type == EventType::IntentDeclared)
                .filter_map(|r| Some((r.meta_str("intent_id")?, r.meta_str("objective")?)))
                .collect();
            for record in records
                .iter()
                .filter(|r| r.event_type == EventType::TurnSignal)
            {
                let Some(signal) = parse_signal(record) else {
                    continue;
                };
                if !signal.keys().contains(&candidate.key) {
                    continue;
                }
                let objective = signal
                    .intent_id
                    .as_deref()
                    .and_then(|id| objectives.get(id));
                if let Some(objective) = objective {
                    if !samples.iter().any(|s| s == objective) {
                        samples.push((*objective).to_string());
                    }
                }
            }
        }
        let skip = samples.len().saturating_sub(MAX_SAMPLES);
        Ok(samples.split_off(skip))
    }

    fn record_failure(&self, candidate: &ConsolidationCandidate, err: &anyhow::Error) {
        let key = candidate.key.to_string();
        let recorded = self.ledger.append_event(
            &StreamId::Consolidation,
            self.clock.now(),
            EventType::ConsolidationFailed,
            &key,
            json!({ "key": key, "error": format!("{err:#}") }),
        );
        if let Err(record_err) = recorded {
            warn!(key = %key, error = %record_err, "could not record consolidation failure");
        }
    }
}

/// Every artifact consolidation has created, in creation order.
pub fn load_artifacts(ledger: &Ledger) -> Result<Vec<Artifact>> {
    ledger
        .read_filtered(&StreamId::Artifacts, |r| {
            r.event_type == EventType::ArtifactCreated
        })?
        .into_iter()
        .map(|record| {
            serde_json::from_value(record.metadata["artifact"].clone())
                .with_context(|| format!("artifact record {}", record.sequence))
        })
        .collect()
}

/// Turn signals across every session's governance stream.
pub fn signal_observations(ledger: &Ledger) -> Result<Vec<SignalObservation>> {
    let mut observations = Vec::new();
    for session in ledger.sessions()? {
        let stream = StreamId::Governance(session.clone());
        for record in ledger.read_filtered(&stream, |r| r.event_type == EventType::TurnSignal)? {
            match parse_signal(&record) {
                Some(signal) => observations.push(SignalObservation {
                    session_id: session.clone(),
                    recorded_at: record.timestamp,
                    keys: signal.keys(),
                }),
                None => {
                    warn!(
                        stream = %stream,
                        sequence = record.sequence,
                        "unreadable turn signal"
                    );
                }
            }
        }
    }
    Ok(observations)
}

/// Latest `CONSOLIDATION_DISPATCHED` time per key.
fn last_dispatch(ledger: &Ledger) -> Result<BTreeMap<SignalKey, DateTime<Utc>>> {
    let mut latest = BTreeMap::new();
    for record in ledger.read_filtered(&StreamId::Consolidation, |r| {
        r.event_type == EventType::ConsolidationDispatched
    })? {
        let Some(key) = record
            .meta_str("key")
            .and_then(|k| k.parse::<SignalKey>().ok())
        else {
            continue;
        };
        let entry = latest.entry(key).or_insert(record.timestamp);
        if record.timestamp > *entry {
            *entry = record.timestamp;
        }
    }
    Ok(latest)
}

fn parse_signal(record: &LedgerRecord) -> Option<TurnSignal> {
    serde_json::from_value(record.metadata.get("signal")?.clone()).ok()
}
