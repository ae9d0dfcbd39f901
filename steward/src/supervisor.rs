//! Orchestration for one governed turn: `Supervisor::process_turn`.
//!
//! Every lifecycle change is appended to the session's governance stream
//! before the controller moves on; the executor boundary records terminal
//! work-order states on the session's execution stream. Liveness is always
//! re-derived from those two streams, never kept in memory between turns.

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing::{debug, error, info, instrument, warn};

use crate::consolidation::{Consolidator, load_artifacts};
use crate::core::artifacts::select;
use crate::core::budget::estimate_tokens;
use crate::core::gate::{Criteria, Evidence, GateDecision, QualityGate, parse_json_result};
use crate::core::intent::{IntentAction, Resolution, resolve};
use crate::core::liveness::{ActiveIntent, LivenessState, reduce};
use crate::core::projection::{Projection, ProjectionSnapshot, project};
use crate::core::record::EventType;
use crate::core::signals::TurnSignal;
use crate::core::turn::{GateNext, TurnStage, next_after_gate};
use crate::core::types::{
    Classification, Constraints, Intent, TurnOutcome, TurnResult, UnitOfWork, WorkType, scoped_id,
};
use crate::io::clock::Clock;
use crate::io::config::SupervisorConfig;
use crate::io::contracts::Contracts;
use crate::io::executor::{Executor, ExecutorBoundary, RetryPolicy, Settled};
use crate::io::ledger::{Ledger, LedgerError, StreamId, validate_session_id};
use crate::io::prompt::PromptEngine;

/// Per-turn bookkeeping. Lives only for the duration of `process_turn`.
#[derive(Debug)]
struct Turn {
    session_id: String,
    turn_id: String,
    governance: StreamId,
    execution: StreamId,
    stage: TurnStage,
    next_intent: u64,
    next_work_order: u64,
}

impl Turn {
    fn advance(&mut self, next: TurnStage) {
        if !self.stage.can_advance_to(next) {
            warn!(
                turn = %self.turn_id,
                from = self.stage.as_str(),
                to = next.as_str(),
                "unexpected stage transition"
            );
        }
        debug!(turn = %self.turn_id, from = self.stage.as_str(), to = next.as_str(), "turn stage");
        self.stage = next;
    }
}

/// What the EXECUTE/GATE loop settled on.
#[derive(Debug)]
struct Executed {
    response: String,
    outcome: TurnOutcome,
    tools: Vec<String>,
    retries: u32,
    work_order_id: Option<String>,
}

#[derive(Debug)]
struct Finished {
    result: TurnResult,
    signal: TurnSignal,
}

/// The turn controller for all sessions sharing one ledger.
pub struct Supervisor<'a> {
    ledger: &'a Ledger,
    executor: &'a dyn Executor,
    clock: &'a dyn Clock,
    config: SupervisorConfig,
    prompts: PromptEngine,
    contracts: Contracts,
    gate: QualityGate,
}

impl<'a> Supervisor<'a> {
    pub fn new(
        ledger: &'a Ledger,
        executor: &'a dyn Executor,
        clock: &'a dyn Clock,
        config: SupervisorConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            ledger,
            executor,
            clock,
            config,
            prompts: PromptEngine::new()?,
            contracts: Contracts::load()?,
            gate: QualityGate::new()?,
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Run one governed turn. Never fails: internal errors become
    /// `outcome = error` with the configured generic message.
    #[instrument(skip(self, message), fields(session = session_id))]
    pub fn process_turn(&self, session_id: &str, message: &str) -> TurnResult {
        let mut turn = match self.begin(session_id, message) {
            Ok(turn) => turn,
            Err(err) => return self.fail(session_id, None, &err),
        };
        let finished = match self.run(&mut turn, message) {
            Ok(finished) => finished,
            Err(err) => return self.fail(session_id, Some(&turn.turn_id), &err),
        };
        self.post_turn(&turn, &finished.signal);
        finished.result
    }

    fn begin(&self, session_id: &str, message: &str) -> Result<Turn> {
        validate_session_id(session_id)?;
        let governance = StreamId::Governance(session_id.to_string());
        let execution = StreamId::Execution(session_id.to_string());
        self.ledger.ensure_intact(&governance)?;
        self.ledger.ensure_intact(&execution)?;

        let records = self.ledger.read_all(&governance)?;
        let count = |event: EventType| {
            records.iter().filter(|r| r.event_type == event).count() as u64
        };
        let turn_id = scoped_id("TURN", session_id, count(EventType::TurnStarted) + 1);

        self.ledger.append_event(
            &governance,
            self.clock.now(),
            EventType::TurnStarted,
            &turn_id,
            json!({
                "turn_id": turn_id,
                "session_id": session_id,
                "message_tokens": estimate_tokens(message),
            }),
        )?;
        info!(turn = %turn_id, "turn started");

        Ok(Turn {
            session_id: session_id.to_string(),
            turn_id,
            governance,
            execution,
            stage: TurnStage::Classify,
            next_intent: count(EventType::IntentDeclared) + 1,
            next_work_order: count(EventType::WorkOrderPlanned) + 1,
        })
    }

    fn run(&self, turn: &mut Turn, message: &str) -> Result<Finished> {
        let before = self.reduce(turn)?;
        let classification = self.classify(turn, message, &before.active_intents)?;

        turn.advance(TurnStage::IntentResolve);
        let resolution = resolve(
            &before.active_intents,
            &classification,
            &turn.session_id,
            turn.next_intent,
        );
        self.record_resolution(turn, &resolution, &classification, &before.active_intents)?;

        turn.advance(TurnStage::LivenessReduce);
        let liveness = self.reduce(turn)?;
        self.ledger.append_derived(
            &StreamId::Liveness(turn.session_id.clone()),
            self.clock.now(),
            EventType::LivenessSnapshot,
            &turn.turn_id,
            json!({ "turn_id": turn.turn_id, "state": liveness }),
        )?;

        turn.advance(TurnStage::ContextProject);
        let projection = self.project(turn, &liveness, message, &classification)?;

        turn.advance(TurnStage::Execute);
        let executed = self.execute(turn, &projection)?;

        if turn.stage != TurnStage::Return {
            turn.advance(TurnStage::Return);
        }
        let intent_id = resolution.current_intent_id();
        self.ledger.append_event(
            &turn.governance,
            self.clock.now(),
            EventType::TurnCompleted,
            &turn.turn_id,
            json!({
                "turn_id": turn.turn_id,
                "outcome": executed.outcome.as_str(),
                "retries": executed.retries,
                "intent_id": intent_id,
                "work_order_id": executed.work_order_id,
            }),
        )?;
        info!(
            turn = %turn.turn_id,
            outcome = executed.outcome.as_str(),
            retries = executed.retries,
            "turn completed"
        );

        let signal = TurnSignal::extract(
            &turn.turn_id,
            intent_id,
            &classification,
            &executed.tools,
            executed.outcome,
        );
        Ok(Finished {
            result: TurnResult {
                response: executed.response,
                outcome: executed.outcome,
                tool_calls: executed.tools,
            },
            signal,
        })
    }

    fn reduce(&self, turn: &Turn) -> Result<LivenessState> {
        let governance = self.ledger.read_all(&turn.governance)?;
        let execution = self.ledger.read_all(&turn.execution)?;
        Ok(reduce(&governance, &execution))
    }

    /// CLASSIFY. A failed or rejected classification falls back to an empty
    /// one so intent resolution runs in bridge mode.
    fn classify(
        &self,
        turn: &mut Turn,
        message: &str,
        active: &[ActiveIntent],
    ) -> Result<Classification> {
        let input = self
            .prompts
            .classify(message, active, self.config.budgets.token_budget as usize)?;
        let constraints = self.config.constraints(WorkType::Classify);
        let settled = self.run_unit(turn, WorkType::Classify, input, constraints)?;
        if let Some(err) = &settled.error {
            warn!(
                turn = %turn.turn_id,
                reason = err.reason(),
                "classification failed, using bridge mode"
            );
            return Ok(Classification::default());
        }

        let result = settled.unit.result.as_deref().unwrap_or_default();
        let decision = self.gate.verify(
            result,
            &Criteria::shape_only(self.contracts.for_work(WorkType::Classify)),
        );
        self.record_gate(turn, &settled.unit, &decision, 0)?;
        if !decision.is_accepted() {
            warn!(
                turn = %turn.turn_id,
                reasons = ?decision.reason_strings(),
                "classification rejected, using bridge mode"
            );
            return Ok(Classification::default());
        }
        let classification = parse_json_result(result)
            .and_then(|value| serde_json::from_value::<Classification>(value).ok())
            .unwrap_or_default();
        debug!(turn = %turn.turn_id, action = ?classification.action, "classified");
        Ok(classification)
    }

    fn record_resolution(
        &self,
        turn: &mut Turn,
        resolution: &Resolution,
        classification: &Classification,
        active: &[ActiveIntent],
    ) -> Result<()> {
        let now = self.clock.now();
        match resolution.action {
            IntentAction::Declare => {
                self.declare(turn, resolution)?;
            }
            IntentAction::Supersede => {
                if let Some(closed) = &resolution.closed_intent_id {
                    self.ledger.append_event(
                        &turn.governance,
                        now,
                        EventType::IntentSuperseded,
                        closed,
                        json!({
                            "intent_id": closed,
                            "turn_id": turn.turn_id,
                            "superseded_by": resolution
                                .new_intent
                                .as_ref()
                                .map(|i| i.intent_id.as_str()),
                        }),
                    )?;
                }
                self.declare(turn, resolution)?;
            }
            IntentAction::Continue => {
                if let Some(continued) = &resolution.continued_intent_id {
                    self.ledger.append_event(
                        &turn.governance,
                        now,
                        EventType::IntentContinued,
                        continued,
                        json!({
                            "intent_id": continued,
                            "turn_id": turn.turn_id,
                            "bridged": resolution.bridged,
                        }),
                    )?;
                }
            }
            IntentAction::Close => {
                if let Some(closed) = &resolution.closed_intent_id {
                    self.ledger.append_event(
                        &turn.governance,
                        now,
                        EventType::IntentClosed,
                        closed,
                        json!({ "intent_id": closed, "turn_id": turn.turn_id }),
                    )?;
                }
            }
            IntentAction::Noop => debug!(turn = %turn.turn_id, "no intent transition"),
        }

        if resolution.conflict {
            let active_ids: Vec<&str> = active.iter().map(|i| i.intent_id.as_str()).collect();
            warn!(turn = %turn.turn_id, active = active_ids.len(), "intent conflict");
            self.ledger.append_event(
                &turn.governance,
                self.clock.now(),
                EventType::IntentConflict,
                &turn.turn_id,
                json!({
                    "turn_id": turn.turn_id,
                    "active_intent_ids": active_ids,
                    "stated_action": classification.action,
                    "chosen_intent_id": resolution.current_intent_id(),
                }),
            )?;
        }
        Ok(())
    }

    fn declare(&self, turn: &mut Turn, resolution: &Resolution) -> Result<()> {
        let Some(Intent {
            intent_id,
            scope,
            objective,
            parent_intent_id,
        }) = &resolution.new_intent
        else {
            return Ok(());
        };
        self.ledger.append_event(
            &turn.governance,
            self.clock.now(),
            EventType::IntentDeclared,
            intent_id,
            json!({
                "intent_id": intent_id,
                "turn_id": turn.turn_id,
                "scope": scope,
                "objective": objective,
                "parent_intent_id": parent_intent_id,
                "bridged": resolution.bridged,
            }),
        )?;
        turn.next_intent += 1;
        Ok(())
    }

    /// CONTEXT_PROJECT: select artifacts, assemble the bounded context, and
    /// cache a projection snapshot in the derived stream.
    fn project(
        &self,
        turn: &Turn,
        liveness: &LivenessState,
        message: &str,
        classification: &Classification,
    ) -> Result<Projection> {
        let now = self.clock.now();
        let artifacts = load_artifacts(self.ledger).context("load artifacts")?;
        let selected = select(
            &artifacts,
            &classification.labels(),
            self.config.budgets.artifact_budget,
            now,
        );
        let budget = self.config.projection_budget();
        let projection = project(Some(liveness), &selected, message, classification, &budget);
        debug!(
            turn = %turn.turn_id,
            artifacts = selected.len(),
            fragments = projection.assembled_context.fragment_count,
            tokens = projection.assembled_context.tokens_used,
            "context projected"
        );

        let snapshot = ProjectionSnapshot::capture(
            &turn.session_id,
            &turn.turn_id,
            liveness,
            &projection,
            budget.total,
            now,
        );
        self.ledger.append_derived(
            &StreamId::Projection(turn.session_id.clone()),
            now,
            EventType::ProjectionSnapshot,
            &turn.turn_id,
            serde_json::to_value(&snapshot).context("serialize projection snapshot")?,
        )?;
        Ok(projection)
    }

    /// EXECUTE → GATE → {RETURN, RETRY → EXECUTE, ESCALATE}.
    fn execute(&self, turn: &mut Turn, projection: &Projection) -> Result<Executed> {
        let mut constraints: Constraints = self.config.constraints(WorkType::Synthesize);
        let mut retries = 0u32;
        let mut tools: Vec<String> = Vec::new();

        loop {
            let input = self.prompts.synthesize(
                projection,
                &constraints,
                self.config.budgets.token_budget as usize,
            )?;
            let settled = self.run_unit(turn, WorkType::Synthesize, input, constraints.clone())?;
            for tool in &settled.unit.cost.tool_ids_used {
                if !tools.contains(tool) {
                    tools.push(tool.clone());
                }
            }
            let work_order_id = Some(settled.unit.id.clone());

            if let Some(err) = &settled.error {
                turn.advance(TurnStage::Escalate);
                self.escalate(turn, &settled.unit.id, err.reason(), retries)?;
                return Ok(Executed {
                    response: self.config.error_message.clone(),
                    outcome: TurnOutcome::Error,
                    tools,
                    retries,
                    work_order_id,
                });
            }

            turn.advance(TurnStage::Gate);
            let result = settled.unit.result.clone().unwrap_or_default();
            let evidence = Evidence::from_tool_ids(&tools);
            let decision = self.gate.verify(
                &result,
                &Criteria::grounded(self.contracts.for_work(WorkType::Synthesize), &evidence),
            );
            self.record_gate(turn, &settled.unit, &decision, retries)?;

            let next = next_after_gate(&decision, retries, self.config.gate.max_retries);
            turn.advance(next.stage());
            match next {
                GateNext::Return => {
                    return Ok(Executed {
                        response: result,
                        outcome: TurnOutcome::Success,
                        tools,
                        retries,
                        work_order_id,
                    });
                }
                GateNext::Retry => {
                    retries += 1;
                    constraints = constraints.tightened(&decision.reason_strings());
                    info!(
                        turn = %turn.turn_id,
                        retry = retries,
                        reasons = ?decision.reason_strings(),
                        "gate rejected, retrying"
                    );
                    turn.advance(TurnStage::Execute);
                }
                GateNext::Escalate => {
                    let reason = decision.reason_strings().join(",");
                    self.escalate(turn, &settled.unit.id, &reason, retries)?;
                    return Ok(Executed {
                        response: self.config.degraded_message.clone(),
                        outcome: TurnOutcome::Degraded,
                        tools,
                        retries,
                        work_order_id,
                    });
                }
            }
        }
    }

    /// Plan, dispatch and settle one unit of work.
    fn run_unit(
        &self,
        turn: &mut Turn,
        work_type: WorkType,
        input: String,
        constraints: Constraints,
    ) -> Result<Settled> {
        let id = scoped_id("WO", &turn.session_id, turn.next_work_order);
        turn.next_work_order += 1;

        let now = self.clock.now();
        let unit = UnitOfWork::planned(id.clone(), work_type, input, constraints, now);
        self.ledger.append_event(
            &turn.governance,
            now,
            EventType::WorkOrderPlanned,
            &id,
            json!({
                "work_order_id": id,
                "work_type": work_type.as_str(),
                "turn_id": turn.turn_id,
                "contract_id": unit.constraints.contract_id,
                "token_budget": unit.constraints.token_budget,
                "strict_grounding": unit.constraints.strict_grounding,
                "input_tokens": estimate_tokens(&unit.input),
            }),
        )?;
        self.ledger.append_event(
            &turn.governance,
            self.clock.now(),
            EventType::WorkOrderDispatched,
            &id,
            json!({
                "work_order_id": id,
                "work_type": work_type.as_str(),
                "turn_id": turn.turn_id,
            }),
        )?;

        let boundary = ExecutorBoundary::new(
            self.executor,
            self.ledger,
            self.clock,
            turn.execution.clone(),
            RetryPolicy::from(&self.config.executor),
        );
        Ok(boundary.dispatch(unit)?)
    }

    fn record_gate(
        &self,
        turn: &Turn,
        unit: &UnitOfWork,
        decision: &GateDecision,
        retries: u32,
    ) -> Result<()> {
        self.ledger.append_event(
            &turn.governance,
            self.clock.now(),
            EventType::GateDecision,
            &unit.id,
            json!({
                "work_order_id": unit.id,
                "work_type": unit.work_type.as_str(),
                "turn_id": turn.turn_id,
                "decision": decision,
                "retries": retries,
            }),
        )?;
        Ok(())
    }

    fn escalate(&self, turn: &Turn, work_order_id: &str, reason: &str, retries: u32) -> Result<()> {
        warn!(turn = %turn.turn_id, work_order = work_order_id, reason, "escalation raised");
        self.ledger.append_event(
            &turn.governance,
            self.clock.now(),
            EventType::EscalationRaised,
            work_order_id,
            json!({
                "work_order_id": work_order_id,
                "turn_id": turn.turn_id,
                "reason": reason,
                "retries": retries,
            }),
        )?;
        Ok(())
    }

    /// Append the turn signal, then let consolidation look at it. Runs after
    /// the result is fixed; failures are logged and dropped.
    fn post_turn(&self, turn: &Turn, signal: &TurnSignal) {
        let recorded = self.ledger.append_event(
            &turn.governance,
            self.clock.now(),
            EventType::TurnSignal,
            &turn.turn_id,
            json!({ "signal": signal }),
        );
        if let Err(err) = recorded {
            warn!(turn = %turn.turn_id, error = %err, "could not record turn signal");
            return;
        }

        let keys = signal.keys();
        if keys.is_empty() {
            return;
        }
        let consolidator = Consolidator {
            ledger: self.ledger,
            executor: self.executor,
            clock: self.clock,
            config: &self.config,
            prompts: &self.prompts,
            contracts: &self.contracts,
            gate: &self.gate,
        };
        consolidator.after_turn(&turn.session_id, &keys);
    }

    /// Record the failure (best effort) and hand back the generic error result.
    fn fail(&self, session_id: &str, turn_id: Option<&str>, err: &anyhow::Error) -> TurnResult {
        error!(session = session_id, turn = turn_id, error = %format!("{err:#}"), "turn failed");
        let writable = validate_session_id(session_id).is_ok()
            && !matches!(
                err.downcast_ref::<LedgerError>(),
                Some(LedgerError::BrokenChain { .. } | LedgerError::IneligiblePath(_))
            );
        if writable {
            let recorded = self.ledger.append_event(
                &StreamId::Governance(session_id.to_string()),
                self.clock.now(),
                EventType::TurnCompleted,
                turn_id.unwrap_or(session_id),
                json!({
                    "turn_id": turn_id.map_or(Value::Null, |id| json!(id)),
                    "outcome": TurnOutcome::Error.as_str(),
                    "error": format!("{err:#}"),
                }),
            );
            if let Err(record_err) = recorded {
                warn!(session = session_id, error = %record_err, "could not record turn failure");
            }
        }
        TurnResult {
            response: self.config.error_message.clone(),
            outcome: TurnOutcome::Error,
            tool_calls: Vec::new(),
        }
    }
}
