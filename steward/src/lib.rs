//! Governed turn pipeline for LLM-backed agents.
//!
//! Each user message runs through a fixed controller: classify, resolve the
//! intent lifecycle, reduce liveness from the ledger, project a bounded
//! context, execute, and gate the result. Every transition is appended to a
//! hash-chained ledger so current state is always rebuilt by replay.
//!
//! - **[`core`]**: Pure, deterministic logic (reducers, selection, projection,
//!   gate, turn state machine). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (ledger files, config, prompts,
//!   executor processes). Isolated to enable mocking in tests.
//!
//! Orchestration modules ([`supervisor`], [`consolidation`], [`replay`])
//! coordinate core logic with I/O to implement CLI commands.

pub mod consolidation;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod replay;
pub mod supervisor;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
