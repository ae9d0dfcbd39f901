//! Side-effecting operations: ledger files, config, prompts, and executor processes.

pub mod clock;
pub mod config;
pub mod contracts;
pub mod executor;
pub mod init;
pub mod ledger;
pub mod process;
pub mod prompt;
