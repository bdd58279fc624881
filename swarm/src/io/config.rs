//! Swarm configuration stored under `.swarm/state/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::criteria::DEFAULT_COMPLETION_MARKERS;
use crate::core::org::{OrgNode, default_org};
use crate::io::atomic::write_atomic;

/// Swarm configuration (TOML).
///
/// Edited by humans; every field has a default so a partial file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SwarmConfig {
    /// Pause between loop iterations of one worker.
    pub loop_pause_ms: u64,

    /// Wall-clock budget for a single dispatch.
    pub dispatch_timeout_secs: u64,

    /// Provider context window used for the fit check.
    pub context_window_tokens: usize,

    /// Provider stdout beyond this many bytes is dropped and the reply marked truncated.
    pub output_limit_bytes: usize,

    /// Soft completion misses tolerated before a task is failed.
    pub max_continuations: u32,

    /// Claims older than this are reclaimed through the retry policy. Must be
    /// longer than `dispatch_timeout_secs`.
    pub lease_secs: u64,

    /// A ledger lock file older than this is considered abandoned.
    pub lock_stale_secs: u64,

    /// Case-insensitive substrings that signal a finished reply.
    pub completion_markers: Vec<String>,

    pub provider: ProviderConfig,

    pub hierarchy: OrgNode,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProviderConfig {
    /// Command line for the model CLI; the instruction is written to stdin.
    /// A `{model}` argument is replaced with `model`.
    pub command: Vec<String>,
    pub model: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            command: vec!["llm".to_string(), "-m".to_string(), "{model}".to_string()],
            model: "gpt-4o-mini".to_string(),
        }
    }
}

impl Default for OrgNode {
    fn default() -> Self {
        default_org()
    }
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            loop_pause_ms: 500,
            dispatch_timeout_secs: 10 * 60,
            context_window_tokens: 128_000,
            output_limit_bytes: 1_000_000,
            max_continuations: 3,
            lease_secs: 60 * 60,
            lock_stale_secs: 30,
            completion_markers: DEFAULT_COMPLETION_MARKERS
                .iter()
                .map(|marker| marker.to_string())
                .collect(),
            provider: ProviderConfig::default(),
            hierarchy: OrgNode::default(),
        }
    }
}

impl SwarmConfig {
    pub fn validate(&self) -> Result<()> {
        if self.dispatch_timeout_secs == 0 {
            return Err(anyhow!("dispatch_timeout_secs must be > 0"));
        }
        if self.context_window_tokens == 0 {
            return Err(anyhow!("context_window_tokens must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.max_continuations == 0 {
            return Err(anyhow!("max_continuations must be > 0"));
        }
        if self.lease_secs <= self.dispatch_timeout_secs {
            return Err(anyhow!(
                "lease_secs ({}) must exceed dispatch_timeout_secs ({})",
                self.lease_secs,
                self.dispatch_timeout_secs
            ));
        }
        if self.lock_stale_secs == 0 {
            return Err(anyhow!("lock_stale_secs must be > 0"));
        }
        if self.completion_markers.iter().all(|m| m.trim().is_empty()) {
            return Err(anyhow!("completion_markers must contain a non-empty marker"));
        }
        if self.provider.command.is_empty() || self.provider.command[0].trim().is_empty() {
            return Err(anyhow!("provider.command must be a non-empty array"));
        }
        Ok(())
    }

    pub fn loop_pause(&self) -> Duration {
        Duration::from_millis(self.loop_pause_ms)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn lock_stale(&self) -> Duration {
        Duration::from_secs(self.lock_stale_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `SwarmConfig::default()`.
pub fn load_config(path: &Path) -> Result<SwarmConfig> {
    if !path.exists() {
        let cfg = SwarmConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: SwarmConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk.
pub fn write_config(path: &Path, cfg: &SwarmConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::identity::Role;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, SwarmConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = SwarmConfig::default();
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "max_continuations = 5\n\n[hierarchy]\nrole = \"CEO\"\n",
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_continuations, 5);
        assert_eq!(cfg.hierarchy.role, Role::Ceo);
        assert!(cfg.hierarchy.children.is_empty());
        assert_eq!(cfg.provider, ProviderConfig::default());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "max_continuations = 0\n").expect("write");
        assert!(load_config(&path).is_err());

        fs::write(&path, "completion_markers = [\"  \"]\n").expect("write");
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn lease_must_outlast_a_dispatch() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "dispatch_timeout_secs = 600\nlease_secs = 600\n").expect("write");
        let err = load_config(&path).expect_err("lease too short");
        assert!(format!("{err:#}").contains("must exceed dispatch_timeout_secs"));

        fs::write(&path, "dispatch_timeout_secs = 60\nlease_secs = 61\n").expect("write");
        assert_eq!(load_config(&path).expect("load").lease_secs, 61);
    }
}
