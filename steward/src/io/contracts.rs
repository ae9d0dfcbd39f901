//! Result contracts per work type, compiled from the bundled schemas.

use anyhow::{Context, Result};
use serde_json::Value;

use crate::core::gate::Contract;
use crate::core::types::WorkType;

pub const CLASSIFY_V1: &str = "classify.v1";
pub const SYNTHESIZE_V1: &str = "synthesize.v1";
pub const CONSOLIDATE_V1: &str = "consolidate.v1";

const CLASSIFY_SCHEMA: &str = include_str!("../../schemas/classify.v1.schema.json");
const CONSOLIDATE_SCHEMA: &str = include_str!("../../schemas/consolidate.v1.schema.json");

/// Bundled schema sources, for `steward init` to write next to the config.
pub const BUNDLED_SCHEMAS: [(&str, &str); 2] = [
    ("classify.v1.schema.json", CLASSIFY_SCHEMA),
    ("consolidate.v1.schema.json", CONSOLIDATE_SCHEMA),
];

#[derive(Debug)]
pub struct Contracts {
    classify: Contract,
    synthesize: Contract,
    consolidate: Contract,
}

impl Contracts {
    pub fn load() -> Result<Self> {
        Ok(Self {
            classify: json_contract(CLASSIFY_V1, CLASSIFY_SCHEMA)?,
            synthesize: Contract::text(SYNTHESIZE_V1),
            consolidate: json_contract(CONSOLIDATE_V1, CONSOLIDATE_SCHEMA)?,
        })
    }

    pub fn for_work(&self, work_type: WorkType) -> &Contract {
        match work_type {
            WorkType::Classify => &self.classify,
            WorkType::Synthesize => &self.synthesize,
            WorkType::Consolidate => &self.consolidate,
        }
    }
}

pub fn contract_id(work_type: WorkType) -> &'static str {
    match work_type {
        WorkType::Classify => CLASSIFY_V1,
        WorkType::Synthesize => SYNTHESIZE_V1,
        WorkType::Consolidate => CONSOLIDATE_V1,
    }
}

fn json_contract(id: &str, raw: &str) -> Result<Contract> {
    let schema: Value =
        serde_json::from_str(raw).with_context(|| format!("parse {id} schema"))?;
    Contract::json(id, &schema)
}
