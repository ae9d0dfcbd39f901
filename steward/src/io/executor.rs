//! Executor boundary: hands a unit of work to a stateless executor and
//! records its terminal state.
//!
//! The [`Executor`] trait decouples the Supervisor from how work is actually
//! fulfilled. [`CommandExecutor`] spawns a configured program; tests use the
//! scripted executor from `test_support`.

use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::core::budget::{remaining_budget, timeout_for};
use crate::core::record::EventType;
use crate::core::types::{Constraints, Cost, UnitOfWork, WorkState, WorkType};
use crate::io::clock::Clock;
use crate::io::config::ExecutorConfig;
use crate::io::ledger::{Ledger, LedgerError, StreamId};
use crate::io::process::run_with_input;

/// Exit code a command executor uses to signal rate limiting (EX_TEMPFAIL).
pub const EXIT_RATE_LIMITED: i32 = 75;
/// Exit code a command executor uses to signal an upstream outage (EX_UNAVAILABLE).
pub const EXIT_UNAVAILABLE: i32 = 69;

const OUTPUT_LIMIT_BYTES: usize = 1_000_000;

/// What an executor receives. Stateless: everything it needs is here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecRequest {
    pub work_order_id: String,
    #[serde(rename = "type")]
    pub work_type: WorkType,
    pub input: String,
    pub constraints: Constraints,
}

impl ExecRequest {
    pub fn for_unit(unit: &UnitOfWork) -> Self {
        Self {
            work_order_id: unit.id.clone(),
            work_type: unit.work_type,
            input: unit.input.clone(),
            constraints: unit.constraints.clone(),
        }
    }
}

/// Successful executor output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResponse {
    pub result: String,
    pub cost: Cost,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("executor timed out after {0:?}")]
    Timeout(Duration),
    #[error("executor rate limited: {0}")]
    RateLimited(String),
    #[error("executor server error: {0}")]
    ServerError(String),
    #[error("executor returned malformed output: {0}")]
    Structural(String),
    #[error("executor failed: {0}")]
    Failed(String),
}

impl ExecError {
    /// Transient failures are retried by the boundary; the rest fail the
    /// unit immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExecError::Timeout(_) | ExecError::RateLimited(_) | ExecError::ServerError(_)
        )
    }

    pub fn reason(&self) -> &'static str {
        match self {
            ExecError::Timeout(_) => "timeout",
            ExecError::RateLimited(_) => "rate_limited",
            ExecError::ServerError(_) => "server_error",
            ExecError::Structural(_) => "structural",
            ExecError::Failed(_) => "failed",
        }
    }
}

/// Abstraction over execution backends.
pub trait Executor {
    /// Fulfil one request within `timeout`.
    fn execute(&self, request: &ExecRequest, timeout: Duration) -> Result<ExecResponse, ExecError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first.
    pub max_attempts: u32,
    pub backoff: Duration,
    pub timeout_base: Duration,
    pub timeout_per_1k_tokens: Duration,
}

impl From<&ExecutorConfig> for RetryPolicy {
    fn from(cfg: &ExecutorConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            backoff: Duration::from_millis(cfg.backoff_ms),
            timeout_base: cfg.timeout_base(),
            timeout_per_1k_tokens: cfg.timeout_per_1k_tokens(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): `backoff × 2^(attempt-1)`.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.backoff.saturating_mul(1 << exponent)
    }
}

/// A unit of work in a terminal state.
#[derive(Debug, Clone, PartialEq)]
pub struct Settled {
    pub unit: UnitOfWork,
    pub error: Option<ExecError>,
    pub attempts: u32,
}

impl Settled {
    pub fn succeeded(&self) -> bool {
        self.unit.state == WorkState::Completed
    }
}

/// Wraps an executor with timeout, bounded retry, and terminal-state
/// recording on its own execution stream.
pub struct ExecutorBoundary<'a> {
    executor: &'a dyn Executor,
    ledger: &'a Ledger,
    clock: &'a dyn Clock,
    stream: StreamId,
    policy: RetryPolicy,
}

impl<'a> ExecutorBoundary<'a> {
    pub fn new(
        executor: &'a dyn Executor,
        ledger: &'a Ledger,
        clock: &'a dyn Clock,
        stream: StreamId,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            executor,
            ledger,
            clock,
            stream,
            policy,
        }
    }

    /// Run `unit` to a terminal state and append `WORK_ORDER_COMPLETED` or
    /// `WORK_ORDER_FAILED`. Only ledger failures surface as errors.
    #[instrument(skip_all, fields(work_order = %unit.id, work_type = unit.work_type.as_str()))]
    pub fn dispatch(&self, mut unit: UnitOfWork) -> Result<Settled, LedgerError> {
        let request = ExecRequest::for_unit(&unit);
        let budget_timeout = timeout_for(
            unit.constraints.token_budget,
            self.policy.timeout_base,
            self.policy.timeout_per_1k_tokens,
        );
        let deadline = Instant::now() + budget_timeout;
        unit.state = WorkState::Dispatched;

        let mut attempts = 0u32;
        let outcome = loop {
            attempts += 1;
            let timeout = match remaining_budget(deadline) {
                Ok(remaining) => remaining,
                Err(_) => break Err(ExecError::Timeout(budget_timeout)),
            };
            debug!(attempt = attempts, timeout_ms = timeout.as_millis() as u64, "executing");
            match self.executor.execute(&request, timeout) {
                Ok(response) => break Ok(response),
                Err(err) if err.is_transient() && attempts < self.policy.max_attempts => {
                    let delay = self.policy.delay_before(attempts);
                    warn!(
                        attempt = attempts,
                        reason = err.reason(),
                        delay_ms = delay.as_millis() as u64,
                        "transient executor failure, retrying"
                    );
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                }
                Err(err) => break Err(err),
            }
        };

        let now = self.clock.now();
        unit.completed_at = Some(now);
        match outcome {
            Ok(response) => {
                unit.state = WorkState::Completed;
                unit.result = Some(response.result);
                unit.cost = response.cost;
                self.ledger.append_event(
                    &self.stream,
                    now,
                    EventType::WorkOrderCompleted,
                    &unit.id,
                    json!({
                        "work_order_id": unit.id,
                        "work_type": unit.work_type.as_str(),
                        "attempts": attempts,
                        "cost": unit.cost,
                    }),
                )?;
                info!(attempts, output_tokens = unit.cost.output_tokens, "work order completed");
                Ok(Settled {
                    unit,
                    error: None,
                    attempts,
                })
            }
            Err(err) => {
                unit.state = WorkState::Failed;
                self.ledger.append_event(
                    &self.stream,
                    now,
                    EventType::WorkOrderFailed,
                    &unit.id,
                    json!({
                        "work_order_id": unit.id,
                        "work_type": unit.work_type.as_str(),
                        "attempts": attempts,
                        "reason": err.reason(),
                        "detail": err.to_string(),
                    }),
                )?;
                warn!(attempts, reason = err.reason(), "work order failed");
                Ok(Settled {
                    unit,
                    error: Some(err),
                    attempts,
                })
            }
        }
    }
}

/// Reply a command executor prints on stdout.
#[derive(Debug, Deserialize)]
struct CommandReply {
    result: Option<String>,
    #[serde(default)]
    cost: Cost,
    #[serde(default = "default_outcome")]
    outcome: String,
    #[serde(default)]
    error: Option<String>,
}

fn default_outcome() -> String {
    "success".to_string()
}

/// Executor that spawns a configured command per unit of work.
///
/// Protocol: the [`ExecRequest`] is written as JSON to stdin; the command
/// prints `{"result": .., "cost": {..}, "outcome": "success"}` on stdout.
/// Exit 75 means rate limited, exit 69 means the upstream is unavailable.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    command: Vec<String>,
}

impl CommandExecutor {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl Executor for CommandExecutor {
    fn execute(&self, request: &ExecRequest, timeout: Duration) -> Result<ExecResponse, ExecError> {
        if self.command.is_empty() {
            return Err(ExecError::Failed("no executor command configured".to_string()));
        }
        let payload = serde_json::to_vec(request)
            .map_err(|err| ExecError::Failed(format!("serialize request: {err}")))?;
        let output = run_with_input(&self.command, &payload, timeout, OUTPUT_LIMIT_BYTES)
            .map_err(|err| ExecError::Failed(format!("{err:#}")))?;

        if output.timed_out {
            return Err(ExecError::Timeout(timeout));
        }
        match output.status.code() {
            Some(0) => {}
            Some(EXIT_RATE_LIMITED) => return Err(ExecError::RateLimited(output.stderr_lossy())),
            Some(EXIT_UNAVAILABLE) => return Err(ExecError::ServerError(output.stderr_lossy())),
            code => {
                return Err(ExecError::Failed(format!(
                    "exit {code:?}: {}",
                    output.stderr_lossy()
                )));
            }
        }
        if output.truncated > 0 {
            return Err(ExecError::Structural(format!(
                "output exceeded {OUTPUT_LIMIT_BYTES} bytes"
            )));
        }

        let reply: CommandReply = serde_json::from_slice(&output.stdout)
            .map_err(|err| ExecError::Structural(format!("parse reply: {err}")))?;
        if reply.outcome != "success" {
            let detail = reply.error.unwrap_or_else(|| reply.outcome.clone());
            return Err(ExecError::Failed(detail));
        }
        let result = reply
            .result
            .ok_or_else(|| ExecError::Structural("reply missing result".to_string()))?;
        Ok(ExecResponse {
            result,
            cost: reply.cost,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedExecutor, StepClock, constraints, response};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Duration::ZERO,
            timeout_base: Duration::from_secs(5),
            timeout_per_1k_tokens: Duration::ZERO,
        }
    }

    fn unit(id: &str) -> UnitOfWork {
        UnitOfWork::planned(
            id.to_string(),
            WorkType::Synthesize,
            "question".to_string(),
            constraints("synthesize.v1"),
            StepClock::new().now(),
        )
    }

    struct Fixture {
        _temp: tempfile::TempDir,
        ledger: Ledger,
        clock: StepClock,
    }

    fn fixture() -> Fixture {
        let temp = tempfile::tempdir().expect("tempdir");
        let ledger = Ledger::open(temp.path()).expect("ledger");
        Fixture {
            _temp: temp,
            ledger,
            clock: StepClock::new(),
        }
    }

    fn stream() -> StreamId {
        StreamId::Execution("s1".to_string())
    }

    #[test]
    fn success_records_completion() {
        let fx = fixture();
        let executor = ScriptedExecutor::new(vec![Ok(response("answer"))]);
        let boundary = ExecutorBoundary::new(&executor, &fx.ledger, &fx.clock, stream(), policy(3));

        let settled = boundary.dispatch(unit("WO-s1-0001")).expect("dispatch");
        assert!(settled.succeeded());
        assert_eq!(settled.unit.result.as_deref(), Some("answer"));
        assert_eq!(settled.attempts, 1);

        let records = fx.ledger.read_all(&stream()).expect("read");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event_type, EventType::WorkOrderCompleted);
        assert_eq!(records[0].meta_str("work_order_id"), Some("WO-s1-0001"));
    }

    #[test]
    fn transient_errors_retry_until_success() {
        let fx = fixture();
        let executor = ScriptedExecutor::new(vec![
            Err(ExecError::RateLimited("slow down".to_string())),
            Err(ExecError::ServerError("503".to_string())),
            Ok(response("answer")),
        ]);
        let boundary = ExecutorBoundary::new(&executor, &fx.ledger, &fx.clock, stream(), policy(3));

        let settled = boundary.dispatch(unit("WO-s1-0001")).expect("dispatch");
        assert!(settled.succeeded());
        assert_eq!(settled.attempts, 3);
        assert_eq!(executor.requests().len(), 3);
    }

    #[test]
    fn transient_errors_exhaust_attempts_and_fail() {
        let fx = fixture();
        let executor = ScriptedExecutor::new(vec![
            Err(ExecError::Timeout(Duration::from_secs(1))),
            Err(ExecError::Timeout(Duration::from_secs(1))),
        ]);
        let boundary = ExecutorBoundary::new(&executor, &fx.ledger, &fx.clock, stream(), policy(2));

        let settled = boundary.dispatch(unit("WO-s1-0001")).expect("dispatch");
        assert_eq!(settled.unit.state, WorkState::Failed);
        assert_eq!(settled.attempts, 2);
        let records = fx.ledger.read_all(&stream()).expect("read");
        assert_eq!(records[0].event_type, EventType::WorkOrderFailed);
        assert_eq!(records[0].meta_str("reason"), Some("timeout"));
    }

    #[test]
    fn non_transient_errors_fail_without_retry() {
        let fx = fixture();
        let executor = ScriptedExecutor::new(vec![
            Err(ExecError::Structural("missing result".to_string())),
            Ok(response("never reached")),
        ]);
        let boundary = ExecutorBoundary::new(&executor, &fx.ledger, &fx.clock, stream(), policy(3));

        let settled = boundary.dispatch(unit("WO-s1-0001")).expect("dispatch");
        assert_eq!(settled.attempts, 1);
        assert_eq!(
            settled.error.as_ref().map(ExecError::reason),
            Some("structural")
        );
        assert_eq!(executor.requests().len(), 1);
    }

    #[test]
    fn backoff_doubles_per_retry() {
        let policy = RetryPolicy {
            backoff: Duration::from_millis(100),
            ..policy(5)
        };
        assert_eq!(policy.delay_before(1), Duration::from_millis(100));
        assert_eq!(policy.delay_before(2), Duration::from_millis(200));
        assert_eq!(policy.delay_before(3), Duration::from_millis(400));
    }

    #[cfg(unix)]
    mod command {
        use super::*;

        fn sh(script: &str) -> CommandExecutor {
            let argv = vec!["sh".to_string(), "-c".to_string(), script.to_string()];
            CommandExecutor::new(argv)
        }

        fn request() -> ExecRequest {
            ExecRequest::for_unit(&unit("WO-s1-0001"))
        }

        #[test]
        fn parses_successful_reply() {
            let body = json!({
                "result": "hi",
                "cost": {
                    "input_tokens": 3,
                    "output_tokens": 1,
                    "tool_calls": 0,
                    "tool_ids_used": [],
                },
                "outcome": "success",
            });
            let executor = sh(&format!("cat >/dev/null; echo '{body}'"));
            let reply = executor
                .execute(&request(), Duration::from_secs(5))
                .expect("execute");
            assert_eq!(reply.result, "hi");
            assert_eq!(reply.cost.input_tokens, 3);
        }

        #[test]
        fn maps_exit_codes_and_bad_output() {
            let timeout = Duration::from_secs(5);
            let limited = sh("cat >/dev/null; exit 75")
                .execute(&request(), timeout)
                .unwrap_err();
            assert!(matches!(limited, ExecError::RateLimited(_)));

            let unavailable = sh("cat >/dev/null; exit 69")
                .execute(&request(), timeout)
                .unwrap_err();
            assert!(unavailable.is_transient());

            let failed = sh("cat >/dev/null; exit 2")
                .execute(&request(), timeout)
                .unwrap_err();
            assert!(matches!(failed, ExecError::Failed(_)));

            let garbage = sh("cat >/dev/null; echo not-json")
                .execute(&request(), timeout)
                .unwrap_err();
            assert!(matches!(garbage, ExecError::Structural(_)));

            let refused = sh(r#"cat >/dev/null; echo '{"result":"x","outcome":"refused"}'"#)
                .execute(&request(), timeout)
                .unwrap_err();
            assert!(matches!(refused, ExecError::Failed(_)));
        }

        #[test]
        fn request_is_written_to_stdin() {
            let executor =
                sh(r#"grep -q '"work_order_id":"WO-s1-0001"' && echo '{"result":"seen"}'"#);
            let reply = executor
                .execute(&request(), Duration::from_secs(5))
                .expect("execute");
            assert_eq!(reply.result, "seen");
        }

        #[test]
        fn request_carries_turn_limit() {
            let mut request = request();
            request.constraints.turn_limit = 4;
            let executor = sh(r#"grep -q '"turn_limit":4' && echo '{"result":"bounded"}'"#);
            let reply = executor
                .execute(&request, Duration::from_secs(5))
                .expect("execute");
            assert_eq!(reply.result, "bounded");
        }

        #[test]
        fn empty_command_fails() {
            let err = CommandExecutor::new(Vec::new())
                .execute(&request(), Duration::from_secs(1))
                .unwrap_err();
            assert!(!err.is_transient());
        }
    }
}
