//! Initialization helpers for a steward root.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use super::config::{CONFIG_FILE, SupervisorConfig, write_config};
use super::contracts::BUNDLED_SCHEMAS;
use super::ledger::Ledger;

/// Canonical paths under a steward root.
#[derive(Debug, Clone)]
pub struct StewardPaths {
    pub root: PathBuf,
    pub config_path: PathBuf,
    pub ledger_dir: PathBuf,
    pub schemas_dir: PathBuf,
}

impl StewardPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            config_path: root.join(CONFIG_FILE),
            ledger_dir: root.join("ledger"),
            schemas_dir: root.join("schemas"),
            root,
        }
    }
}

/// Options for `init_root`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite an existing config and schema copies.
    pub force: bool,
}

/// Create the ledger trees, a default `steward.toml`, and copies of the
/// bundled contract schemas.
///
/// Fails if the config already exists unless `options.force` is set. Ledger
/// streams are never touched: they are append-only even under `--force`.
pub fn init_root(root: &Path, options: &InitOptions) -> Result<StewardPaths> {
    let paths = StewardPaths::new(root);
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "steward init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }

    Ledger::open(&paths.ledger_dir)
        .with_context(|| format!("create ledger at {}", paths.ledger_dir.display()))?;
    write_config(&paths.config_path, &SupervisorConfig::default())?;

    fs::create_dir_all(&paths.schemas_dir)
        .with_context(|| format!("create directory {}", paths.schemas_dir.display()))?;
    for (name, contents) in BUNDLED_SCHEMAS {
        let path = paths.schemas_dir.join(name);
        fs::write(&path, contents).with_context(|| format!("write file {}", path.display()))?;
    }

    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::record::EventType;
    use crate::io::config::load_config;
    use crate::io::ledger::StreamId;
    use crate::test_support::at;
    use serde_json::json;

    #[test]
    fn init_creates_expected_layout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_root(temp.path(), &InitOptions { force: false }).expect("init");

        assert!(paths.config_path.is_file());
        assert!(paths.ledger_dir.join("source").join("governance").is_dir());
        assert!(paths.ledger_dir.join("derived").join("liveness").is_dir());
        for (name, _) in BUNDLED_SCHEMAS {
            assert!(paths.schemas_dir.join(name).is_file());
        }
        assert_eq!(
            load_config(&paths.config_path).expect("load"),
            SupervisorConfig::default()
        );
    }

    #[test]
    fn init_without_force_refuses_existing_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_root(temp.path(), &InitOptions { force: false }).expect("init");
        let err = init_root(temp.path(), &InitOptions { force: false }).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn init_with_force_keeps_ledger_streams() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_root(temp.path(), &InitOptions { force: false }).expect("init");
        let stream = StreamId::Governance("s1".to_string());
        {
            let ledger = Ledger::open(&paths.ledger_dir).expect("ledger");
            ledger
                .append_event(
                    &stream,
                    at(1),
                    EventType::TurnStarted,
                    "TURN-s1-0001",
                    json!({}),
                )
                .expect("append");
        }

        init_root(temp.path(), &InitOptions { force: true }).expect("re-init");

        let ledger = Ledger::open(&paths.ledger_dir).expect("ledger");
        assert_eq!(ledger.read_all(&stream).expect("read").len(), 1);
    }
}
