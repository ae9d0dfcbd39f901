//! Supervisor configuration stored at `<root>/steward.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::projection::{ProjectionBudget, SectionBudgets};
use crate::core::signals::TriggerPolicy;
use crate::core::types::{Constraints, WorkType};
use crate::io::contracts::contract_id;

pub const CONFIG_FILE: &str = "steward.toml";

const DEGRADED_MESSAGE: &str =
    "I could not produce a verified answer for this request. Please rephrase or try again.";

/// Supervisor configuration (TOML).
///
/// Edited by humans; every table is optional and missing fields default to
/// MVP values. Nothing in the reducers or the controller hardcodes these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Returned to the user when the gate escalates.
    pub degraded_message: String,
    /// Returned to the user when the turn fails outright.
    pub error_message: String,

    pub budgets: BudgetConfig,
    pub gate: GateConfig,
    pub consolidation: ConsolidationConfig,
    pub executor: ExecutorConfig,
    pub classify: ModelConfig,
    pub synthesize: ModelConfig,
    pub consolidate: ModelConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BudgetConfig {
    /// Token budget handed to each unit of work.
    pub token_budget: u32,
    /// Model round-trips an executor may spend inside one unit of work.
    /// Forwarded in every request; the executor enforces it.
    pub turn_limit: u32,
    /// Ceiling for the assembled context block.
    pub projection_budget: usize,
    /// Ceiling for selected artifacts before projection.
    pub artifact_budget: usize,
    pub sections: SectionBudgets,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GateConfig {
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ConsolidationConfig {
    pub trigger_count: usize,
    pub session_window: usize,
    pub global_min_sessions: usize,
    /// Artifacts expire this many days after creation. Unset means never.
    pub artifact_ttl_days: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Command fulfilling units of work (e.g. `["steward-llm"]`). Empty means
    /// no executor is configured and turns fail with `outcome = error`.
    pub command: Vec<String>,
    /// Attempts per unit for transient failures, including the first.
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub timeout_base_secs: u64,
    pub timeout_per_1k_tokens_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            degraded_message: DEGRADED_MESSAGE.to_string(),
            error_message: "Something went wrong while handling this request.".to_string(),
            budgets: BudgetConfig::default(),
            gate: GateConfig::default(),
            consolidation: ConsolidationConfig::default(),
            executor: ExecutorConfig::default(),
            classify: ModelConfig {
                max_tokens: 256,
                temperature: 0.0,
            },
            synthesize: ModelConfig::default(),
            consolidate: ModelConfig {
                max_tokens: 256,
                temperature: 0.2,
            },
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            token_budget: 8_000,
            turn_limit: 1,
            projection_budget: 1_024,
            artifact_budget: 512,
            sections: SectionBudgets::default(),
        }
    }
}

impl Default for GateConfig {
    fn default() -> Self {
        Self { max_retries: 2 }
    }
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            trigger_count: 5,
            session_window: 3,
            global_min_sessions: 2,
            artifact_ttl_days: None,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            max_attempts: 3,
            backoff_ms: 250,
            timeout_base_secs: 30,
            timeout_per_1k_tokens_ms: 2_000,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            max_tokens: 1_024,
            temperature: 0.7,
        }
    }
}

impl SupervisorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.budgets.token_budget == 0 {
            return Err(anyhow!("budgets.token_budget must be > 0"));
        }
        if self.budgets.turn_limit == 0 {
            return Err(anyhow!("budgets.turn_limit must be > 0"));
        }
        if self.budgets.projection_budget == 0 {
            return Err(anyhow!("budgets.projection_budget must be > 0"));
        }
        if self.consolidation.trigger_count == 0 {
            return Err(anyhow!("consolidation.trigger_count must be > 0"));
        }
        if self.consolidation.session_window == 0 {
            return Err(anyhow!("consolidation.session_window must be > 0"));
        }
        if self.executor.max_attempts == 0 {
            return Err(anyhow!("executor.max_attempts must be > 0"));
        }
        if self.executor.timeout_base_secs == 0 {
            return Err(anyhow!("executor.timeout_base_secs must be > 0"));
        }
        if self
            .executor
            .command
            .first()
            .is_some_and(|program| program.trim().is_empty())
        {
            return Err(anyhow!("executor.command must start with a program name"));
        }
        for (name, model) in [
            ("classify", &self.classify),
            ("synthesize", &self.synthesize),
            ("consolidate", &self.consolidate),
        ] {
            if model.max_tokens == 0 {
                return Err(anyhow!("{name}.max_tokens must be > 0"));
            }
            if !(0.0..=2.0).contains(&model.temperature) {
                return Err(anyhow!("{name}.temperature must be within 0.0..=2.0"));
            }
        }
        Ok(())
    }

    pub fn projection_budget(&self) -> ProjectionBudget {
        ProjectionBudget {
            total: self.budgets.projection_budget,
            sections: self.budgets.sections,
        }
    }

    /// First-attempt constraints for a unit of `work_type`.
    pub fn constraints(&self, work_type: WorkType) -> Constraints {
        let model = match work_type {
            WorkType::Classify => &self.classify,
            WorkType::Synthesize => &self.synthesize,
            WorkType::Consolidate => &self.consolidate,
        };
        Constraints {
            token_budget: self.budgets.token_budget,
            turn_limit: self.budgets.turn_limit,
            contract_id: contract_id(work_type).to_string(),
            max_tokens: model.max_tokens,
            temperature: model.temperature,
            strict_grounding: false,
            notes: Vec::new(),
        }
    }

    pub fn trigger_policy(&self) -> TriggerPolicy {
        TriggerPolicy {
            trigger_count: self.consolidation.trigger_count,
            session_window: self.consolidation.session_window,
            global_min_sessions: self.consolidation.global_min_sessions,
        }
    }
}

impl ExecutorConfig {
    pub fn timeout_base(&self) -> Duration {
        Duration::from_secs(self.timeout_base_secs)
    }

    pub fn timeout_per_1k_tokens(&self) -> Duration {
        Duration::from_millis(self.timeout_per_1k_tokens_ms)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `SupervisorConfig::default()`.
pub fn load_config(path: &Path) -> Result<SupervisorConfig> {
    if !path.exists() {
        let cfg = SupervisorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: SupervisorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &SupervisorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
