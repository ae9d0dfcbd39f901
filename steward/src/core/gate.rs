//! Quality gate: accept or reject a unit of work's result.
//!
//! Checks, in order: the result is non-empty, it has the contract's shape, and
//! every claim of having consulted a source is backed by evidence gathered in
//! the current turn.

use std::collections::BTreeSet;
use std::fmt;

use anyhow::{Result, anyhow};
use jsonschema::{Validator, validator_for};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    EmptyResult,
    ShapeMismatch,
    UngroundedSourceClaim,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::EmptyResult => "empty_result",
            RejectReason::ShapeMismatch => "shape_mismatch",
            RejectReason::UngroundedSourceClaim => "ungrounded_source_claim",
        }
    }

    /// Structural rejections are never fixed by retrying.
    pub fn is_structural(&self) -> bool {
        matches!(self, RejectReason::ShapeMismatch)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum GateDecision {
    Accepted,
    Rejected { reasons: Vec<RejectReason> },
}

impl GateDecision {
    pub fn is_accepted(&self) -> bool {
        matches!(self, GateDecision::Accepted)
    }

    pub fn reasons(&self) -> &[RejectReason] {
        match self {
            GateDecision::Accepted => &[],
            GateDecision::Rejected { reasons } => reasons,
        }
    }

    pub fn is_structural(&self) -> bool {
        self.reasons().iter().any(RejectReason::is_structural)
    }

    pub fn reason_strings(&self) -> Vec<String> {
        self.reasons()
            .iter()
            .map(|r| r.as_str().to_string())
            .collect()
    }
}

/// Shape a result must have to satisfy a contract.
pub enum ContractShape {
    /// Any non-empty text.
    Text,
    /// A JSON document valid against a compiled schema.
    Json(Box<Validator>),
}

pub struct Contract {
    pub id: String,
    shape: ContractShape,
}

impl fmt::Debug for Contract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shape = match self.shape {
            ContractShape::Text => "text",
            ContractShape::Json(_) => "json",
        };
        f.debug_struct("Contract")
            .field("id", &self.id)
            .field("shape", &shape)
            .finish()
    }
}

impl Contract {
    pub fn text(id: &str) -> Self {
        Self {
            id: id.to_string(),
            shape: ContractShape::Text,
        }
    }

    pub fn json(id: &str, schema: &Value) -> Result<Self> {
        let validator =
            validator_for(schema).map_err(|err| anyhow!("invalid schema for {id}: {err}"))?;
        Ok(Self {
            id: id.to_string(),
            shape: ContractShape::Json(Box::new(validator)),
        })
    }

    fn matches(&self, result: &str) -> bool {
        match &self.shape {
            ContractShape::Text => true,
            ContractShape::Json(validator) => {
                parse_json_result(result).is_some_and(|value| validator.is_valid(&value))
            }
        }
    }
}

/// Parse a JSON result, tolerating a surrounding markdown code fence.
pub fn parse_json_result(result: &str) -> Option<Value> {
    let trimmed = result.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed);
    serde_json::from_str(body.trim()).ok()
}

/// Kind of source a result may claim to have consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Ledger,
    File,
    Tool,
}

/// Evidence actually available to the current turn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Evidence {
    kinds: BTreeSet<SourceKind>,
}

impl Evidence {
    pub fn none() -> Self {
        Self::default()
    }

    /// Derive evidence from the tool ids an executor reported using.
    pub fn from_tool_ids<S: AsRef<str>>(tool_ids: &[S]) -> Self {
        let mut kinds = BTreeSet::new();
        for id in tool_ids {
            let id = id.as_ref().to_ascii_lowercase();
            if id.trim().is_empty() {
                continue;
            }
            kinds.insert(SourceKind::Tool);
            if id.contains("ledger") || id.contains("log") {
                kinds.insert(SourceKind::Ledger);
            }
            if id.contains("file") || id.contains("fs") {
                kinds.insert(SourceKind::File);
            }
        }
        Self { kinds }
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    fn supports(&self, claim: Claim) -> bool {
        match claim {
            Claim::Source(kind) => self.kinds.contains(&kind),
            Claim::Unspecified => !self.kinds.is_empty(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Claim {
    Source(SourceKind),
    /// "I checked my sources" with no specific kind.
    Unspecified,
}

/// First person, optionally perfect, optionally one plain adverb. Modals and
/// negations ("I'll", "I can't", "I didn't") never fit between subject and verb.
const FIRST_PERSON: &str = concat!(
    r"\b(?:i|we)(?:'ve|'d|\s+have|\s+had)?",
    r"(?:\s+(?:just|already|also|now|then|first|quickly|carefully|thoroughly|briefly|actually))?",
);
const PAST_VERBS: &str = concat!(
    r"(?:checked|consulted|reviewed|looked\s+(?:at|in|into|through|up|over)|searched|read|",
    r"scanned|queried|verified|inspected|examined|audited|skimmed|cross-referenced|",
    r"went\s+through|gone\s+through|pulled\s+up|opened|ran|run|called|invoked)",
);
const GERUNDS: &str = concat!(
    r"(?:checking|consulting|reviewing|looking\s+(?:at|in|into|through|over)|searching|",
    r"reading|scanning|querying|verifying|inspecting|examining|auditing|cross-referencing|",
    r"going\s+through|pulling\s+up|opening|running|calling)",
);
const REVIEW_NOUNS: &str =
    r"(?:review|check|inspection|search|reading|examination|analysis|audit|look)";
const ATTRIBUTIONS: &str =
    r"\b(?:according\s+to|based\s+on|as\s+(?:shown|recorded|noted|listed)\s+in)";
const REPORT_VERBS: &str = r"(?:shows|showed|says|said|indicates|indicated|confirms|confirmed)";
/// Subjects that open a statement of findings after a participle clause.
const FINDING_SUBJECTS: &str =
    r"(?:i|we|it|there|the|your|this|that|you|everything|nothing|no|all)";
/// Gap between verb and noun, within one sentence.
const SPAN: &str = r"[^.!?\n]{0,32}";
/// Gap that also stops at a comma, for participle clauses.
const CLAUSE: &str = r"[^.!?\n,]{0,32}";
const TAIL: &str = r"[^.!?\n,]{0,16}";
const AFTER: &str = r"\b(?:after|upon)\s+";
const REVIEW_OF: &str = r"(?:of|at|through|in|into)";

/// Regex detector for claims of having consulted a source.
///
/// Only assertions count: past or perfect first-person statements,
/// participle clauses ("having checked the logs, ..."), noun forms ("my review
/// of the ledger"), attributions and reported content. Advice, plans and
/// refusals ("check the logs", "I'll read the file", "I can't open files")
/// are not claims.
pub struct ClaimDetector {
    patterns: Vec<(Claim, Regex)>,
}

impl ClaimDetector {
    pub fn new() -> Result<Self> {
        let nouns = [
            (
                Claim::Source(SourceKind::Ledger),
                concat!(
                    r"(?:ledger|logs?|audit\s+(?:trail|log)|",
                    r"(?:event|transaction|payment|account|order|billing)\s+history)",
                ),
            ),
            (
                Claim::Source(SourceKind::File),
                r"(?:files?|documents?|docs|repository|repo|codebase|directory)",
            ),
            (
                Claim::Source(SourceKind::Tool),
                r"(?:tools?|database|db|api|search\s+index)",
            ),
            (Claim::Unspecified, r"(?:sources?|references?|records)"),
        ];

        let mut patterns = Vec::new();
        for (claim, noun) in nouns {
            let templates = [
                format!(r"(?i){FIRST_PERSON}\s+{PAST_VERBS}\b{SPAN}\b{noun}\b"),
                format!(r"(?i)\bhaving\s+{PAST_VERBS}\b{SPAN}\b{noun}\b"),
                format!(r"(?i){AFTER}{GERUNDS}\b{CLAUSE}\b{noun}\b{TAIL},\s*{FINDING_SUBJECTS}\b"),
                format!(r"(?i)(?:^|[.!?]\s+){GERUNDS}\b{CLAUSE}\b{noun}\b{TAIL},\s*(?:i|we)\b"),
                format!(
                    r"(?i)\b(?:my|our)\s+(?:\w+\s+)?{REVIEW_NOUNS}\s+{REVIEW_OF}\b{SPAN}\b{noun}\b"
                ),
                format!(r"(?i){ATTRIBUTIONS}\s+(?:the|my|your|our)\s+(?:\w+\s+)?{noun}\b"),
                format!(r"(?i)\b(?:the|my|your|our)\s+(?:\w+\s+)?{noun}\s+{REPORT_VERBS}\b"),
            ];
            for template in templates {
                patterns.push((claim, Regex::new(&template)?));
            }
        }
        Ok(Self { patterns })
    }

    fn claims(&self, text: &str) -> BTreeSet<Claim> {
        self.patterns
            .iter()
            .filter(|(_, re)| re.is_match(text))
            .map(|(claim, _)| *claim)
            .collect()
    }

    /// True when `text` claims a source the evidence does not back.
    pub fn is_ungrounded(&self, text: &str, evidence: &Evidence) -> bool {
        self.claims(text)
            .into_iter()
            .any(|claim| !evidence.supports(claim))
    }
}

/// What a result is checked against.
pub struct Criteria<'a> {
    pub contract: &'a Contract,
    /// Evidence for source claims. `None` checks shape only, for structured
    /// internal output (classification, consolidation) that merely echoes the
    /// user's wording.
    pub evidence: Option<&'a Evidence>,
}

impl<'a> Criteria<'a> {
    pub fn shape_only(contract: &'a Contract) -> Self {
        Self {
            contract,
            evidence: None,
        }
    }

    pub fn grounded(contract: &'a Contract, evidence: &'a Evidence) -> Self {
        Self {
            contract,
            evidence: Some(evidence),
        }
    }
}

pub struct QualityGate {
    detector: ClaimDetector,
}

impl QualityGate {
    pub fn new() -> Result<Self> {
        Ok(Self {
            detector: ClaimDetector::new()?,
        })
    }

    /// Decide on one result. Pure: same input, same decision.
    pub fn verify(&self, result: &str, criteria: &Criteria<'_>) -> GateDecision {
        if result.trim().is_empty() {
            return GateDecision::Rejected {
                reasons: vec![RejectReason::EmptyResult],
            };
        }
        let mut reasons = Vec::new();
        if !criteria.contract.matches(result) {
            reasons.push(RejectReason::ShapeMismatch);
        }
        let ungrounded = criteria
            .evidence
            .is_some_and(|evidence| self.detector.is_ungrounded(result, evidence));
        if ungrounded {
            reasons.push(RejectReason::UngroundedSourceClaim);
        }
        if reasons.is_empty() {
            GateDecision::Accepted
        } else {
            GateDecision::Rejected { reasons }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gate() -> QualityGate {
        QualityGate::new().expect("patterns compile")
    }

    fn check(result: &str, evidence: &Evidence) -> GateDecision {
        let contract = Contract::text("synthesize.v1");
        gate().verify(result, &Criteria::grounded(&contract, evidence))
    }

    fn assert_claim(phrasing: &str) {
        let decision = check(phrasing, &Evidence::none());
        assert_eq!(
            decision.reasons(),
            &[RejectReason::UngroundedSourceClaim],
            "{phrasing}"
        );
    }

    #[test]
    fn empty_result_is_rejected() {
        let decision = check("   \n", &Evidence::none());
        assert_eq!(decision.reasons(), &[RejectReason::EmptyResult]);
        assert!(!decision.is_structural());
    }

    #[test]
    fn plain_answer_is_accepted() {
        let decision = check("Your refund was approved on Monday.", &Evidence::none());
        assert!(decision.is_accepted());
    }

    #[test]
    fn ledger_claims_without_evidence_are_rejected_in_any_phrasing() {
        let phrasings = [
            "I checked the ledger and everything is fine.",
            "I've consulted the logs: no errors.",
            "After reviewing the audit trail, the order shipped.",
            "According to the ledger, you paid twice.",
            "Based on your logs the job failed at noon.",
            "The ledger shows two payments.",
            "We looked through the event history and found it.",
            "i CHECKED THE LEDGER.",
            "Sure. Checking the logs, I see the deploy.",
            "I have just checked the logs and the deploy finished.",
        ];
        for phrasing in phrasings {
            assert_claim(phrasing);
        }
    }

    #[test]
    fn participle_and_noun_claims_are_rejected() {
        let phrasings = [
            "Having reviewed the ledger, your balance is 40.",
            "My review of the transaction history found two payments.",
            "Having checked your files, the bug is in main.rs.",
            "Our search of the database returned nothing.",
            "Upon inspecting the logs, we found a timeout.",
        ];
        for phrasing in phrasings {
            assert_claim(phrasing);
        }
    }

    #[test]
    fn advice_plans_and_refusals_are_not_claims() {
        let phrasings = [
            "Check the logs for errors before restarting the service.",
            "I'll check the logs once you share access.",
            "I can't read files on your machine.",
            "Open the file config.yaml and set debug to true.",
            "I would look at the database indexes first.",
            "I didn't check the ledger, so I can't confirm the balance.",
            "After checking the logs, restart the service.",
            "Remove the stale entry from the file and save it.",
            "Your log records every request with a timestamp.",
            "You can search the docs for the timeout setting.",
        ];
        for phrasing in phrasings {
            assert!(
                check(phrasing, &Evidence::none()).is_accepted(),
                "{phrasing}"
            );
        }
    }

    #[test]
    fn shape_only_criteria_ignore_source_wording() {
        let contract = Contract::text("classify.v1");
        let decision = gate().verify(
            "I checked the ledger and the logs show two payments.",
            &Criteria::shape_only(&contract),
        );
        assert!(decision.is_accepted());
    }

    #[test]
    fn ledger_claim_with_matching_tool_evidence_is_accepted() {
        let evidence = Evidence::from_tool_ids(&["ledger.read"]);
        assert!(check("I checked the ledger: two payments.", &evidence).is_accepted());
    }

    #[test]
    fn evidence_must_match_the_claimed_source() {
        let evidence = Evidence::from_tool_ids(&["web.search"]);
        let decision = check("I read the file you mentioned.", &evidence);
        assert_eq!(decision.reasons(), &[RejectReason::UngroundedSourceClaim]);
        assert!(check("I ran the tool and it returned 3.", &evidence).is_accepted());
    }

    #[test]
    fn generic_source_claim_needs_any_evidence() {
        let claim = "I verified this against my sources.";
        assert!(!check(claim, &Evidence::none()).is_accepted());
        assert!(check(claim, &Evidence::from_tool_ids(&["calculator"])).is_accepted());
    }

    #[test]
    fn evidence_kinds_come_from_tool_ids() {
        let evidence = Evidence::from_tool_ids(&["fs.read", "", "audit_log"]);
        assert!(evidence.supports(Claim::Source(SourceKind::File)));
        assert!(evidence.supports(Claim::Source(SourceKind::Ledger)));
        assert!(evidence.supports(Claim::Source(SourceKind::Tool)));
        assert!(Evidence::from_tool_ids::<&str>(&[]).is_empty());
    }

    #[test]
    fn json_contract_rejects_wrong_shape_as_structural() {
        let schema = json!({
            "type": "object",
            "required": ["action"],
            "properties": { "action": { "type": "string" } }
        });
        let contract = Contract::json("classify.v1", &schema).expect("schema");
        let criteria = Criteria::shape_only(&contract);
        let gate = gate();

        let bad = gate.verify("not json at all", &criteria);
        assert_eq!(bad.reasons(), &[RejectReason::ShapeMismatch]);
        assert!(bad.is_structural());

        let missing = gate.verify(r#"{"objective": "x"}"#, &criteria);
        assert!(missing.is_structural());

        let fenced = gate.verify("```json\n{\"action\": \"new\"}\n```", &criteria);
        assert!(fenced.is_accepted());
    }

    #[test]
    fn decision_serializes_with_state_tag() {
        let decision = GateDecision::Rejected {
            reasons: vec![RejectReason::UngroundedSourceClaim],
        };
        let value = serde_json::to_value(&decision).expect("serialize");
        assert_eq!(
            value,
            json!({"state": "rejected", "reasons": ["ungrounded_source_claim"]})
        );
    }
}
