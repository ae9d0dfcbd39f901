//! Test-only fixtures: deterministic records, clocks, and a scripted executor.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Value, json};

use crate::core::artifacts::{Artifact, ArtifactScope};
use crate::core::liveness::ActiveIntent;
use crate::core::record::{ChainTip, EventType, LedgerRecord, RecordDraft, seal};
use crate::core::types::{Classification, ClassifierAction, Constraints, Cost, TurnLabels, WorkType};
use crate::io::clock::Clock;
use crate::io::executor::{ExecError, ExecRequest, ExecResponse, Executor};
use crate::io::ledger::Ledger;

/// Fixed base instant plus `secs` seconds.
pub fn at(secs: i64) -> DateTime<Utc> {
    let base = Utc
        .with_ymd_and_hms(2026, 3, 1, 9, 0, 0)
        .single()
        .unwrap_or_default();
    base + chrono::Duration::seconds(secs)
}

/// Fresh ledger in a temp dir. Keep the guard alive for the test's duration.
pub fn temp_ledger() -> (tempfile::TempDir, Ledger) {
    let temp = tempfile::tempdir().expect("tempdir");
    let ledger = Ledger::open(temp.path()).expect("open ledger");
    (temp, ledger)
}

/// Builds one sealed stream in memory.
#[derive(Debug)]
pub struct RecordBuilder {
    tip: ChainTip,
    records: Vec<LedgerRecord>,
}

impl Default for RecordBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordBuilder {
    pub fn new() -> Self {
        Self {
            tip: ChainTip::genesis(),
            records: Vec::new(),
        }
    }

    /// Append a record stamped `at(secs)`.
    pub fn push(
        &mut self,
        secs: i64,
        event_type: EventType,
        entity_id: &str,
        metadata: Value,
    ) -> &LedgerRecord {
        let draft = RecordDraft {
            sequence: self.tip.next_sequence,
            timestamp: at(secs),
            event_type,
            entity_id: entity_id.to_string(),
            metadata,
        };
        let record = seal(&self.tip, draft).expect("builder keeps sequences in order");
        self.tip = ChainTip::after(&record);
        self.records.push(record);
        self.records.last().expect("just pushed")
    }

    pub fn records(&self) -> &[LedgerRecord] {
        &self.records
    }
}

pub fn active_intent(intent_id: &str, secs: i64) -> ActiveIntent {
    ActiveIntent {
        intent_id: intent_id.to_string(),
        scope: "session".to_string(),
        objective: format!("objective of {intent_id}"),
        parent_intent_id: None,
        declared_at: at(secs),
    }
}

pub fn classification(action: ClassifierAction, objective: &str) -> Classification {
    Classification {
        action: Some(action),
        objective: Some(objective.to_string()),
        ..Classification::default()
    }
}

/// Enabled artifact created at `at(0)` with no labels and no expiry.
pub fn artifact(artifact_id: &str, scope: ArtifactScope, weight: f64) -> Artifact {
    Artifact {
        artifact_id: artifact_id.to_string(),
        enabled: true,
        labels: TurnLabels::default(),
        scope,
        weight,
        created_at: at(0),
        expires_at: None,
        context_line: format!("{artifact_id} guidance"),
    }
}

pub fn constraints(contract_id: &str) -> Constraints {
    Constraints {
        token_budget: 8_000,
        turn_limit: 1,
        contract_id: contract_id.to_string(),
        max_tokens: 1_024,
        temperature: 0.7,
        strict_grounding: false,
        notes: Vec::new(),
    }
}

pub fn response(result: &str) -> ExecResponse {
    ExecResponse {
        result: result.to_string(),
        cost: Cost {
            input_tokens: 10,
            output_tokens: 5,
            ..Cost::default()
        },
    }
}

/// Successful response that reports using `tools`.
pub fn response_with_tools(result: &str, tools: &[&str]) -> ExecResponse {
    let mut reply = response(result);
    reply.cost.tool_calls = tools.len() as u32;
    reply.cost.tool_ids_used = tools.iter().map(|t| t.to_string()).collect();
    reply
}

/// Classifier reply as the classify contract expects it.
pub fn classify_reply(
    action: &str,
    objective: &str,
    domain: Option<&str>,
    task: Option<&str>,
) -> ExecResponse {
    let mut body = json!({ "action": action, "objective": objective });
    if let Some(domain) = domain {
        body["domain"] = json!(domain);
    }
    if let Some(task) = task {
        body["task"] = json!(task);
    }
    response(&body.to_string())
}

type Scripted = Result<ExecResponse, ExecError>;

/// Executor that replays scripted results and records every request.
///
/// Typed queues (see [`ScriptedExecutor::with`]) are consulted before the
/// shared queue. An exhausted script fails the unit non-transiently.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    shared: RefCell<VecDeque<Scripted>>,
    typed: RefCell<BTreeMap<WorkType, VecDeque<Scripted>>>,
    requests: RefCell<Vec<ExecRequest>>,
}

impl ScriptedExecutor {
    pub fn new(script: Vec<Scripted>) -> Self {
        Self {
            shared: RefCell::new(script.into()),
            ..Self::default()
        }
    }

    pub fn with(self, work_type: WorkType, script: Vec<Scripted>) -> Self {
        self.typed
            .borrow_mut()
            .entry(work_type)
            .or_default()
            .extend(script);
        self
    }

    /// Queue more results for `work_type` after construction.
    pub fn push(&self, work_type: WorkType, result: Scripted) {
        self.typed
            .borrow_mut()
            .entry(work_type)
            .or_default()
            .push_back(result);
    }

    pub fn requests(&self) -> Vec<ExecRequest> {
        self.requests.borrow().clone()
    }

    pub fn requests_of(&self, work_type: WorkType) -> Vec<ExecRequest> {
        self.requests
            .borrow()
            .iter()
            .filter(|r| r.work_type == work_type)
            .cloned()
            .collect()
    }
}

impl Executor for ScriptedExecutor {
    fn execute(
        &self,
        request: &ExecRequest,
        _timeout: Duration,
    ) -> Result<ExecResponse, ExecError> {
        self.requests.borrow_mut().push(request.clone());
        let typed = self
            .typed
            .borrow_mut()
            .get_mut(&request.work_type)
            .and_then(VecDeque::pop_front);
        typed
            .or_else(|| self.shared.borrow_mut().pop_front())
            .unwrap_or_else(|| Err(ExecError::Failed("script exhausted".to_string())))
    }
}

/// Clock that starts at `at(0)` and advances one second per reading.
#[derive(Debug, Default)]
pub struct StepClock {
    next: Cell<i64>,
}

impl StepClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(secs: i64) -> Self {
        Self {
            next: Cell::new(secs),
        }
    }
}

impl Clock for StepClock {
    fn now(&self) -> DateTime<Utc> {
        let secs = self.next.get();
        self.next.set(secs + 1);
        at(secs)
    }
}
