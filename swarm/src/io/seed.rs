//! Seeding the ledger from a JSON file of task specs.
//!
//! The file holds an array of `{"type", "title", "description", "params"}`
//! objects; only `title` is required. Each task takes its policy from the
//! adapter its type resolves to.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{info, instrument};

use crate::core::task::{NewTask, Task};
use crate::io::adapter::{AdapterLoader, GENERIC_ADAPTER_ID};
use crate::io::ledger::Ledger;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SeedTask {
    #[serde(rename = "type", default = "default_type")]
    pub task_type: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub params: Map<String, Value>,
}

fn default_type() -> String {
    GENERIC_ADAPTER_ID.to_string()
}

pub fn load_seed_file(path: &Path) -> Result<Vec<SeedTask>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read seed file {}", path.display()))?;
    let seeds: Vec<SeedTask> = serde_json::from_str(&contents)
        .with_context(|| format!("parse seed file {}", path.display()))?;
    for (idx, seed) in seeds.iter().enumerate() {
        if seed.title.trim().is_empty() {
            bail!("seed task #{} in {} has an empty title", idx + 1, path.display());
        }
        if seed.task_type.trim().is_empty() {
            bail!("seed task #{} in {} has an empty type", idx + 1, path.display());
        }
    }
    Ok(seeds)
}

/// Add `seeds` to the ledger as root tasks.
#[instrument(skip_all, fields(count = seeds.len()))]
pub fn seed_tasks(
    ledger: &Ledger,
    adapters: &AdapterLoader,
    seeds: Vec<SeedTask>,
) -> Result<Vec<Task>> {
    let specs = seeds
        .into_iter()
        .map(|seed| {
            let resolved = adapters.resolve(&seed.task_type);
            info!(
                task_type = %seed.task_type,
                adapter = %resolved.adapter.id,
                strategy = resolved.strategy.as_str(),
                "seeding task"
            );
            NewTask {
                policy: resolved.adapter.policy(),
                task_type: seed.task_type,
                title: seed.title,
                description: seed.description,
                params: seed.params,
                parent_task_id: None,
            }
        })
        .collect();
    ledger.add_tasks(specs).context("add seeded tasks")
}
