//! Workspace layout and `.swarm/` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;

use super::adapter::{GENERIC_ADAPTER_ID, generic_adapter_file};
use super::atomic::write_json_atomic;
use super::config::{SwarmConfig, write_config};
use super::session::{SessionState, write_session};
use crate::core::ledger_state::LedgerState;

/// All canonical paths within `.swarm/` for a project root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwarmPaths {
    pub root: PathBuf,
    pub swarm_dir: PathBuf,
    pub state_dir: PathBuf,
    pub adapters_dir: PathBuf,
    pub outputs_dir: PathBuf,
    pub org_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub config_path: PathBuf,
    pub ledger_path: PathBuf,
    pub session_path: PathBuf,
    pub overview_path: PathBuf,
}

impl SwarmPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let swarm_dir = root.join(".swarm");
        let state_dir = swarm_dir.join("state");
        let reports_dir = swarm_dir.join("reports");
        Self {
            root: root.clone(),
            swarm_dir: swarm_dir.clone(),
            state_dir: state_dir.clone(),
            adapters_dir: swarm_dir.join("adapters"),
            outputs_dir: swarm_dir.join("outputs"),
            org_dir: swarm_dir.join("org"),
            reports_dir: reports_dir.clone(),
            config_path: state_dir.join("config.toml"),
            ledger_path: state_dir.join("ledger.json"),
            session_path: state_dir.join("session.json"),
            overview_path: reports_dir.join("overview.json"),
        }
    }

    pub fn adapter_path(&self, id: &str) -> PathBuf {
        self.adapters_dir.join(format!("{id}.json"))
    }

    /// Fail unless `init` has been run for this root.
    pub fn ensure_initialized(&self) -> Result<()> {
        if !self.state_dir.is_dir() {
            return Err(anyhow!(
                "{} is not initialized (run `swarm init`)",
                self.root.display()
            ));
        }
        Ok(())
    }
}

/// Options for `init_workspace`.
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// If true, overwrite existing swarm-owned files.
    pub force: bool,
}

/// Create `.swarm/` scaffolding in `root`.
///
/// Fails if `.swarm/` already exists unless `options.force` is set.
pub fn init_workspace(root: &Path, options: &InitOptions) -> Result<SwarmPaths> {
    let paths = SwarmPaths::new(root);
    if paths.swarm_dir.exists() && !options.force {
        return Err(anyhow!(
            "swarm init: .swarm already exists (use --force to overwrite)"
        ));
    }
    if paths.swarm_dir.exists() && !paths.swarm_dir.is_dir() {
        return Err(anyhow!("swarm init: .swarm exists but is not a directory"));
    }

    for dir in [
        &paths.state_dir,
        &paths.adapters_dir,
        &paths.outputs_dir,
        &paths.org_dir,
        &paths.reports_dir,
    ] {
        create_dir(dir)?;
    }

    write_config(&paths.config_path, &SwarmConfig::default())?;
    write_json_atomic(&paths.ledger_path, &LedgerState::default())?;
    write_session(&paths.session_path, &SessionState::start(Utc::now()))?;
    write_json_atomic(
        &paths.adapter_path(GENERIC_ADAPTER_ID),
        &generic_adapter_file(),
    )?;

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::adapter::AdapterLoader;
    use crate::io::config::load_config;
    use crate::io::session::load_session;

    #[test]
    fn init_creates_a_loadable_workspace() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_workspace(temp.path(), &InitOptions::default()).expect("init");

        paths.ensure_initialized().expect("initialized");
        assert_eq!(load_config(&paths.config_path).expect("config"), SwarmConfig::default());
        assert_eq!(load_session(&paths.session_path).expect("session").next_uid, 1);
        AdapterLoader::new(&paths.adapters_dir)
            .load(GENERIC_ADAPTER_ID)
            .expect("generic adapter");
        let ledger = fs::read_to_string(&paths.ledger_path).expect("ledger");
        assert!(ledger.contains("\"next_id\": 1"));
    }

    #[test]
    fn init_refuses_to_overwrite_without_force() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_workspace(temp.path(), &InitOptions::default()).expect("first");
        assert!(init_workspace(temp.path(), &InitOptions::default()).is_err());
        init_workspace(temp.path(), &InitOptions { force: true }).expect("forced");
    }

    #[test]
    fn uninitialized_root_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(SwarmPaths::new(temp.path()).ensure_initialized().is_err());
    }
}
