//! Artifact selection: filter, scope, rank and budget-trim learned context.
//!
//! The selector reads metadata only. `context_line` is opaque display text
//! whose length is the only thing that matters here.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::core::budget::estimate_tokens;
use crate::core::types::TurnLabels;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactScope {
    Session,
    Global,
}

/// Durable learned context produced by consolidation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_id: String,
    pub enabled: bool,
    #[serde(default)]
    pub labels: TurnLabels,
    pub scope: ArtifactScope,
    pub weight: f64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    pub context_line: String,
}

impl Artifact {
    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(&self.context_line)
    }
}

/// Select artifacts for a turn.
///
/// 1. drop disabled and expired (`expires_at < as_of`)
/// 2. keep global, or label overlap on domain or task
/// 3. rank by `weight × recency` descending, stable on ties
/// 4. take the longest prefix whose estimated size fits `budget`
///
/// Empty `labels` keep only global artifacts.
pub fn select(
    artifacts: &[Artifact],
    labels: &TurnLabels,
    budget: usize,
    as_of: DateTime<Utc>,
) -> Vec<Artifact> {
    let mut ranked: Vec<(f64, &Artifact)> = artifacts
        .iter()
        .filter(|a| a.enabled)
        .filter(|a| a.expires_at.is_none_or(|expires| expires >= as_of))
        .filter(|a| in_scope(a, labels))
        .map(|a| (a.weight * recency_factor(a.created_at, as_of), a))
        .collect();

    // `sort_by` is stable, so equal scores keep input order.
    ranked.sort_by(|a, b| b.0.total_cmp(&a.0));

    let mut used = 0usize;
    let mut selected = Vec::new();
    for (_, artifact) in ranked {
        let cost = artifact.estimated_tokens();
        if used + cost > budget {
            break;
        }
        used += cost;
        selected.push(artifact.clone());
    }
    selected
}

fn in_scope(artifact: &Artifact, labels: &TurnLabels) -> bool {
    if artifact.scope == ArtifactScope::Global {
        return true;
    }
    let domain_match = matches!(
        (&artifact.labels.domain, &labels.domain),
        (Some(a), Some(b)) if a == b
    );
    let task_match = matches!(
        (&artifact.labels.task, &labels.task),
        (Some(a), Some(b)) if a == b
    );
    domain_match || task_match
}

/// 1.0 under one day old, linear down to 0.5 at seven days, flat after.
pub fn recency_factor(created_at: DateTime<Utc>, as_of: DateTime<Utc>) -> f64 {
    let age = as_of.signed_duration_since(created_at);
    if age < Duration::days(1) {
        return 1.0;
    }
    if age >= Duration::days(7) {
        return 0.5;
    }
    let age_days = age.num_seconds() as f64 / 86_400.0;
    1.0 - 0.5 * (age_days - 1.0) / 6.0
}
