//! Append-only, hash-chained JSONL streams under the ledger root.
//!
//! Layout:
//! - `source/governance/<session>.jsonl`: Supervisor lifecycle events
//! - `source/execution/<session>.jsonl`: executor boundary completions
//! - `source/consolidation.jsonl`: consolidation dispatch lifecycle
//! - `source/consolidation-execution.jsonl`: executor boundary for consolidation
//! - `derived/liveness/<session>.jsonl`: cached liveness snapshots
//! - `derived/projection/<session>.jsonl`: per-turn projection snapshots
//! - `derived/artifacts.jsonl`: artifacts created by consolidation
//!
//! Only these paths are append-only eligible. Each stream has one writer.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::invariants::verify_chain;
use crate::core::record::{ChainTip, EventType, LedgerRecord, RecordDraft, seal};

const SOURCE_DIR: &str = "source";
const DERIVED_DIR: &str = "derived";
const MAX_SESSION_ID_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("{stream}: expected sequence {expected}, got {got}")]
    SequenceMismatch {
        stream: StreamId,
        expected: u64,
        got: u64,
    },
    #[error("path is not append-only eligible: {0}")]
    IneligiblePath(String),
    #[error("{stream}: broken chain: {detail}")]
    BrokenChain { stream: StreamId, detail: String },
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} line {line}: {source}", path.display())]
    Malformed {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

impl LedgerError {
    /// Configuration errors that must never be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LedgerError::IneligiblePath(_))
    }

    fn io(path: &Path, source: std::io::Error) -> Self {
        LedgerError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A logical append-only stream.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StreamId {
    Governance(String),
    Execution(String),
    Consolidation,
    ConsolidationExecution,
    Liveness(String),
    Projection(String),
    Artifacts,
}

impl StreamId {
    pub fn is_derived(&self) -> bool {
        matches!(
            self,
            StreamId::Liveness(_) | StreamId::Projection(_) | StreamId::Artifacts
        )
    }

    pub fn session(&self) -> Option<&str> {
        match self {
            StreamId::Governance(s)
            | StreamId::Execution(s)
            | StreamId::Liveness(s)
            | StreamId::Projection(s) => Some(s),
            StreamId::Consolidation | StreamId::ConsolidationExecution | StreamId::Artifacts => {
                None
            }
        }
    }

    /// Path relative to the ledger root. Fails for ids that would escape
    /// the eligible trees.
    pub fn relative_path(&self) -> Result<PathBuf, LedgerError> {
        if let Some(session) = self.session() {
            validate_session_id(session)?;
        }
        let path = match self {
            StreamId::Governance(s) => Path::new(SOURCE_DIR)
                .join("governance")
                .join(format!("{s}.jsonl")),
            StreamId::Execution(s) => Path::new(SOURCE_DIR)
                .join("execution")
                .join(format!("{s}.jsonl")),
            StreamId::Consolidation => Path::new(SOURCE_DIR).join("consolidation.jsonl"),
            StreamId::ConsolidationExecution => {
                Path::new(SOURCE_DIR).join("consolidation-execution.jsonl")
            }
            StreamId::Liveness(s) => Path::new(DERIVED_DIR)
                .join("liveness")
                .join(format!("{s}.jsonl")),
            StreamId::Projection(s) => Path::new(DERIVED_DIR)
                .join("projection")
                .join(format!("{s}.jsonl")),
            StreamId::Artifacts => Path::new(DERIVED_DIR).join("artifacts.jsonl"),
        };
        Ok(path)
    }

    /// Map a root-relative path (forward slashes) back onto a stream.
    pub fn parse(relative: &str) -> Result<Self, LedgerError> {
        let ineligible = || LedgerError::IneligiblePath(relative.to_string());
        let parts: Vec<&str> = relative.split('/').collect();
        let stream = match parts.as_slice() {
            [SOURCE_DIR, "consolidation.jsonl"] => StreamId::Consolidation,
            [SOURCE_DIR, "consolidation-execution.jsonl"] => StreamId::ConsolidationExecution,
            [DERIVED_DIR, "artifacts.jsonl"] => StreamId::Artifacts,
            [tree, kind, file] => {
                let session = file
                    .strip_suffix(".jsonl")
                    .ok_or_else(ineligible)?
                    .to_string();
                match (*tree, *kind) {
                    (SOURCE_DIR, "governance") => StreamId::Governance(session),
                    (SOURCE_DIR, "execution") => StreamId::Execution(session),
                    (DERIVED_DIR, "liveness") => StreamId::Liveness(session),
                    (DERIVED_DIR, "projection") => StreamId::Projection(session),
                    _ => return Err(ineligible()),
                }
            }
            _ => return Err(ineligible()),
        };
        stream.relative_path()?;
        Ok(stream)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.relative_path() {
            Ok(path) => {
                let parts: Vec<String> = path
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                write!(f, "{}", parts.join("/"))
            }
            Err(_) => write!(f, "{self:?}"),
        }
    }
}

/// Session ids are `[A-Za-z0-9_-]{1,64}`.
pub fn validate_session_id(session_id: &str) -> Result<(), LedgerError> {
    let valid = !session_id.is_empty()
        && session_id.len() <= MAX_SESSION_ID_LEN
        && session_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(LedgerError::IneligiblePath(format!(
            "invalid session id {session_id:?}"
        )))
    }
}

/// Handle to a ledger root. Appends are serialized per process through the
/// tip cache; each stream still has exactly one logical writer.
#[derive(Debug)]
pub struct Ledger {
    root: PathBuf,
    tips: Mutex<BTreeMap<StreamId, ChainTip>>,
}

impl Ledger {
    /// Open a ledger root, creating the eligible directory trees.
    pub fn open(root: &Path) -> Result<Self, LedgerError> {
        for dir in [
            Path::new(SOURCE_DIR).join("governance"),
            Path::new(SOURCE_DIR).join("execution"),
            Path::new(DERIVED_DIR).join("liveness"),
            Path::new(DERIVED_DIR).join("projection"),
        ] {
            let path = root.join(dir);
            fs::create_dir_all(&path).map_err(|err| LedgerError::io(&path, err))?;
        }
        Ok(Self {
            root: root.to_path_buf(),
            tips: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, stream: &StreamId) -> Result<PathBuf, LedgerError> {
        Ok(self.root.join(stream.relative_path()?))
    }

    /// Append a draft whose sequence must equal the stream's length.
    pub fn append(
        &self,
        stream: &StreamId,
        draft: RecordDraft,
    ) -> Result<LedgerRecord, LedgerError> {
        let path = self.path_of(stream)?;
        let mut tips = self.tips.lock().unwrap_or_else(PoisonError::into_inner);
        let tip = match tips.get(stream) {
            Some(tip) => tip.clone(),
            None => load_tip(&path)?,
        };
        let record = seal(&tip, draft).map_err(|(expected, got)| LedgerError::SequenceMismatch {
            stream: stream.clone(),
            expected,
            got,
        })?;

        let mut line = serde_json::to_string(&record).map_err(|source| LedgerError::Malformed {
            path: path.clone(),
            line: (record.sequence + 1) as usize,
            source,
        })?;
        line.push('\n');
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| LedgerError::io(parent, err))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| LedgerError::io(&path, err))?;
        file.write_all(line.as_bytes())
            .map_err(|err| LedgerError::io(&path, err))?;

        tips.insert(stream.clone(), ChainTip::after(&record));
        debug!(
            stream = %stream,
            sequence = record.sequence,
            event = record.event_type.as_str(),
            entity = %record.entity_id,
            "ledger append"
        );
        Ok(record)
    }

    /// Append at the next sequence position of `stream`.
    pub fn append_event(
        &self,
        stream: &StreamId,
        timestamp: DateTime<Utc>,
        event_type: EventType,
        entity_id: &str,
        metadata: Value,
    ) -> Result<LedgerRecord, LedgerError> {
        let next_sequence = self.tip(stream)?.next_sequence;
        self.append(
            stream,
            RecordDraft {
                sequence: next_sequence,
                timestamp,
                event_type,
                entity_id: entity_id.to_string(),
                metadata,
            },
        )
    }

    /// Append to a derived stream. Source streams are rejected so snapshot
    /// writers can never feed back into the records they were reduced from.
    pub fn append_derived(
        &self,
        stream: &StreamId,
        timestamp: DateTime<Utc>,
        event_type: EventType,
        entity_id: &str,
        metadata: Value,
    ) -> Result<LedgerRecord, LedgerError> {
        if !stream.is_derived() {
            return Err(LedgerError::IneligiblePath(format!(
                "{stream} is a source stream"
            )));
        }
        self.append_event(stream, timestamp, event_type, entity_id, metadata)
    }

    pub fn tip(&self, stream: &StreamId) -> Result<ChainTip, LedgerError> {
        let path = self.path_of(stream)?;
        let mut tips = self.tips.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tip) = tips.get(stream) {
            return Ok(tip.clone());
        }
        let tip = load_tip(&path)?;
        tips.insert(stream.clone(), tip.clone());
        Ok(tip)
    }

    /// All records of `stream` in stored order. Missing stream ⇒ empty.
    pub fn read_all(&self, stream: &StreamId) -> Result<Vec<LedgerRecord>, LedgerError> {
        read_records(&self.path_of(stream)?)
    }

    pub fn read_filtered<F>(
        &self,
        stream: &StreamId,
        predicate: F,
    ) -> Result<Vec<LedgerRecord>, LedgerError>
    where
        F: Fn(&LedgerRecord) -> bool,
    {
        Ok(self
            .read_all(stream)?
            .into_iter()
            .filter(|record| predicate(record))
            .collect())
    }

    /// Sessions with a governance stream, sorted.
    pub fn sessions(&self) -> Result<Vec<String>, LedgerError> {
        let mut sessions: Vec<String> = self
            .streams()?
            .into_iter()
            .filter_map(|stream| match stream {
                StreamId::Governance(session) => Some(session),
                _ => None,
            })
            .collect();
        sessions.sort();
        Ok(sessions)
    }

    /// Every eligible stream present on disk, sorted.
    pub fn streams(&self) -> Result<Vec<StreamId>, LedgerError> {
        let mut streams = Vec::new();
        for tree in [SOURCE_DIR, DERIVED_DIR] {
            let dir = self.root.join(tree);
            if !dir.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&dir).map_err(|err| LedgerError::io(&dir, err))? {
                let entry = entry.map_err(|err| LedgerError::io(&dir, err))?;
                let name = entry.file_name().to_string_lossy().into_owned();
                let path = entry.path();
                if path.is_dir() {
                    for inner in fs::read_dir(&path).map_err(|err| LedgerError::io(&path, err))? {
                        let inner = inner.map_err(|err| LedgerError::io(&path, err))?;
                        let file = inner.file_name().to_string_lossy().into_owned();
                        push_stream(&mut streams, &format!("{tree}/{name}/{file}"));
                    }
                } else {
                    push_stream(&mut streams, &format!("{tree}/{name}"));
                }
            }
        }
        streams.sort();
        Ok(streams)
    }

    /// Chain violations for one stream; empty means intact.
    pub fn verify_stream(&self, stream: &StreamId) -> Result<Vec<String>, LedgerError> {
        Ok(verify_chain(&self.read_all(stream)?))
    }

    /// Verify every stream. Returns only streams with violations.
    pub fn verify_all(&self) -> Result<Vec<(StreamId, Vec<String>)>, LedgerError> {
        let mut broken = Vec::new();
        for stream in self.streams()? {
            let errors = self.verify_stream(&stream)?;
            if !errors.is_empty() {
                warn!(stream = %stream, violations = errors.len(), "hash chain broken");
                broken.push((stream, errors));
            }
        }
        Ok(broken)
    }

    /// Fail with `BrokenChain` if `stream` does not verify.
    pub fn ensure_intact(&self, stream: &StreamId) -> Result<(), LedgerError> {
        let errors = self.verify_stream(stream)?;
        match errors.into_iter().next() {
            None => Ok(()),
            Some(detail) => Err(LedgerError::BrokenChain {
                stream: stream.clone(),
                detail,
            }),
        }
    }
}

fn push_stream(streams: &mut Vec<StreamId>, relative: &str) {
    match StreamId::parse(relative) {
        Ok(stream) => streams.push(stream),
        Err(_) => debug!(path = relative, "skipping non-ledger file"),
    }
}

fn load_tip(path: &Path) -> Result<ChainTip, LedgerError> {
    Ok(read_records(path)?
        .last()
        .map(ChainTip::after)
        .unwrap_or_else(ChainTip::genesis))
}

fn read_records(path: &Path) -> Result<Vec<LedgerRecord>, LedgerError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(LedgerError::io(path, err)),
    };
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line).map_err(|source| LedgerError::Malformed {
                path: path.to_path_buf(),
                line: idx + 1,
                source,
            })
        })
        .collect()
}
