//! Behavior definitions ("adapters") loaded from `.swarm/adapters/<id>.json`.
//!
//! A file is accepted whole or rejected whole: JSON Schema validation first,
//! then semantic checks the schema cannot express (reserved statuses, regex
//! compilation, prompt files). Loaded adapters are immutable and cached per
//! (directory, id) until explicitly invalidated.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

use jsonschema::{Validator, validator_for};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::criteria::{CompletionCriteria, compile_pattern};
use crate::core::render_context::AdapterContext;
use crate::core::task::{RESERVED_STATUSES, TaskPolicy};
use crate::error::AdapterError;

/// Adapter file consulted when no file matches the task type.
pub const GENERIC_ADAPTER_ID: &str = "generic";
pub const BUILTIN_ADAPTER_ID: &str = "builtin-default";

const ADAPTER_SCHEMA: &str = include_str!("../../schemas/adapter.schema.json");
const TASK_START_TEMPLATE: &str = include_str!("prompts/task_start.md");
const TASK_CONTINUE_TEMPLATE: &str = include_str!("prompts/task_continue.md");
const DEFAULT_SAVE_AS: &str = "{{ task.type }}/{{ task.id }}-{{ task.slug }}.md";
const DEFAULT_MAX_RETRIES: u32 = 3;

static SCHEMA_VALIDATOR: LazyLock<Validator> = LazyLock::new(|| {
    let schema: Value =
        serde_json::from_str(ADAPTER_SCHEMA).expect("embedded adapter schema is valid JSON");
    validator_for(&schema).expect("embedded adapter schema compiles")
});

static ADAPTER_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9_-]*$").expect("adapter id regex is valid"));

static BUILTIN_DEFAULT: LazyLock<Arc<TaskAdapter>> =
    LazyLock::new(|| Arc::new(TaskAdapter::builtin_default()));

/// On-disk adapter document (camelCase JSON).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AdapterFile {
    pub id: String,
    pub version: String,
    pub prompts: PromptsFile,
    pub output_processing: OutputProcessingFile,
    pub status_flow: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable_statuses: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub completion_criteria: CriteriaFile,
    #[serde(default)]
    pub is_meta: bool,
    #[serde(default)]
    pub creates_subtasks: bool,
    #[serde(default)]
    pub requires_manager_role: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PromptsFile {
    pub task_start: String,
    pub task_continue: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutputProcessingFile {
    pub save_as: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtask_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CriteriaFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_output_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_pattern: Option<String>,
}

/// Where a loaded adapter came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterSource {
    File(PathBuf),
    Builtin,
}

/// A validated, immutable behavior definition.
#[derive(Debug, Clone)]
pub struct TaskAdapter {
    pub id: String,
    pub version: String,
    /// Template text (file contents already inlined).
    pub task_start: String,
    pub task_continue: String,
    pub save_as: String,
    pub subtask_type: Option<String>,
    pub status_flow: Vec<String>,
    pub retryable_statuses: Vec<String>,
    pub max_retries: u32,
    pub criteria: CompletionCriteria,
    pub is_meta: bool,
    pub creates_subtasks: bool,
    pub requires_manager_role: bool,
    pub source: AdapterSource,
}

impl TaskAdapter {
    pub fn initial_status(&self) -> &str {
        self.status_flow.first().map(String::as_str).unwrap_or_default()
    }

    pub fn success_status(&self) -> &str {
        self.status_flow.last().map(String::as_str).unwrap_or_default()
    }

    /// Whether completed output is mined for subtasks.
    pub fn decomposes(&self) -> bool {
        self.is_meta || self.creates_subtasks
    }

    pub fn policy(&self) -> TaskPolicy {
        TaskPolicy {
            initial_status: self.initial_status().to_string(),
            success_status: self.success_status().to_string(),
            retryable_statuses: self.retryable_statuses.clone(),
            max_retries: self.max_retries,
            requires_manager: self.requires_manager_role,
        }
    }

    pub fn context(&self) -> AdapterContext {
        AdapterContext {
            id: self.id.clone(),
            version: self.version.clone(),
        }
    }

    /// The compiled-in adapter at the end of every resolution chain.
    pub fn builtin_default() -> Self {
        Self {
            id: BUILTIN_ADAPTER_ID.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            task_start: TASK_START_TEMPLATE.to_string(),
            task_continue: TASK_CONTINUE_TEMPLATE.to_string(),
            save_as: DEFAULT_SAVE_AS.to_string(),
            subtask_type: None,
            status_flow: vec!["pending".to_string(), "completed".to_string()],
            retryable_statuses: vec!["pending".to_string()],
            max_retries: DEFAULT_MAX_RETRIES,
            criteria: CompletionCriteria::default(),
            is_meta: false,
            creates_subtasks: false,
            requires_manager_role: false,
            source: AdapterSource::Builtin,
        }
    }
}

/// The `generic` adapter document written by `swarm init`.
pub fn generic_adapter_file() -> AdapterFile {
    AdapterFile {
        id: GENERIC_ADAPTER_ID.to_string(),
        version: "1.0.0".to_string(),
        prompts: PromptsFile {
            task_start: TASK_START_TEMPLATE.to_string(),
            task_continue: TASK_CONTINUE_TEMPLATE.to_string(),
        },
        output_processing: OutputProcessingFile {
            save_as: DEFAULT_SAVE_AS.to_string(),
            subtask_type: None,
        },
        status_flow: vec!["pending".to_string(), "completed".to_string()],
        retryable_statuses: None,
        max_retries: Some(DEFAULT_MAX_RETRIES),
        completion_criteria: CriteriaFile::default(),
        is_meta: false,
        creates_subtasks: false,
        requires_manager_role: false,
    }
}

/// Validate a raw document against the embedded schema.
pub fn validate_schema(path: &Path, document: &Value) -> Result<(), AdapterError> {
    if SCHEMA_VALIDATOR.is_valid(document) {
        return Ok(());
    }
    let messages = SCHEMA_VALIDATOR
        .iter_errors(document)
        .map(|err| err.to_string())
        .collect();
    Err(AdapterError::Schema {
        path: path.to_path_buf(),
        messages,
    })
}

/// Read, schema-check and semantically check one adapter file.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn load_adapter_file(path: &Path) -> Result<TaskAdapter, AdapterError> {
    let contents = fs::read_to_string(path).map_err(|source| AdapterError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let document: Value = serde_json::from_str(&contents).map_err(|source| AdapterError::Parse {
        path: path.to_path_buf(),
        source,
    })?;
    validate_schema(path, &document)?;
    let file: AdapterFile =
        serde_json::from_value(document).map_err(|source| AdapterError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    if let Some(stem) = path.file_stem().and_then(|s| s.to_str())
        && stem != file.id
    {
        return Err(invalid(&file.id, format!("id does not match file name '{stem}'")));
    }

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    build_adapter(file, dir, AdapterSource::File(path.to_path_buf()))
}

fn build_adapter(
    file: AdapterFile,
    dir: &Path,
    source: AdapterSource,
) -> Result<TaskAdapter, AdapterError> {
    let id = file.id.clone();
    let flow = &file.status_flow;
    let (Some(initial), Some(success)) = (flow.first(), flow.last()) else {
        return Err(invalid(&id, "statusFlow is empty"));
    };
    if initial == success {
        return Err(invalid(&id, "statusFlow needs distinct initial and success statuses"));
    }
    for status in [initial, success] {
        if RESERVED_STATUSES.contains(&status.as_str()) {
            return Err(invalid(&id, format!("status '{status}' is reserved by the ledger")));
        }
    }

    let retryable_statuses = file
        .retryable_statuses
        .unwrap_or_else(|| vec![initial.clone()]);
    for status in &retryable_statuses {
        if !flow.contains(status) {
            return Err(invalid(&id, format!("retryable status '{status}' is not in statusFlow")));
        }
        if status == success || RESERVED_STATUSES.contains(&status.as_str()) {
            return Err(invalid(&id, format!("status '{status}' cannot be retryable")));
        }
    }

    let validation_pattern = file
        .completion_criteria
        .validation_pattern
        .as_deref()
        .map(compile_pattern)
        .transpose()
        .map_err(|err| invalid(&id, format!("validationPattern does not compile: {err}")))?;

    Ok(TaskAdapter {
        task_start: resolve_prompt(dir, &file.prompts.task_start)?,
        task_continue: resolve_prompt(dir, &file.prompts.task_continue)?,
        save_as: file.output_processing.save_as,
        subtask_type: file.output_processing.subtask_type,
        status_flow: file.status_flow,
        retryable_statuses,
        max_retries: file.max_retries.unwrap_or(DEFAULT_MAX_RETRIES),
        criteria: CompletionCriteria {
            min_output_length: file.completion_criteria.min_output_length,
            validation_pattern,
        },
        is_meta: file.is_meta,
        creates_subtasks: file.creates_subtasks,
        requires_manager_role: file.requires_manager_role,
        id: file.id,
        version: file.version,
        source,
    })
}

/// A prompt value naming a file next to the adapter is replaced by that
/// file's contents; anything else is inline template text.
fn resolve_prompt(dir: &Path, value: &str) -> Result<String, AdapterError> {
    let candidate = Path::new(value);
    if value.contains('\n') || !candidate.is_relative() {
        return Ok(value.to_string());
    }
    let path = dir.join(candidate);
    if !path.is_file() {
        return Ok(value.to_string());
    }
    fs::read_to_string(&path).map_err(|source| AdapterError::Read { path, source })
}

fn invalid(id: &str, reason: impl Into<String>) -> AdapterError {
    AdapterError::Invalid {
        id: id.to_string(),
        reason: reason.into(),
    }
}

/// Loaded adapters keyed by (directory, id).
#[derive(Debug, Default)]
pub struct AdapterCache {
    entries: Mutex<HashMap<(PathBuf, String), Arc<TaskAdapter>>>,
}

impl AdapterCache {
    pub fn get(&self, dir: &Path, id: &str) -> Option<Arc<TaskAdapter>> {
        self.lock()
            .get(&(dir.to_path_buf(), id.to_string()))
            .cloned()
    }

    pub fn insert(&self, dir: &Path, adapter: Arc<TaskAdapter>) {
        self.lock()
            .insert((dir.to_path_buf(), adapter.id.clone()), adapter);
    }

    /// Drop one entry so the next load re-reads the file.
    pub fn invalidate(&self, dir: &Path, id: &str) -> bool {
        self.lock()
            .remove(&(dir.to_path_buf(), id.to_string()))
            .is_some()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(PathBuf, String), Arc<TaskAdapter>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// One step of the adapter resolution chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStrategy {
    /// File named after the task type.
    ExactMatch,
    /// The `generic` adapter file.
    Generic,
    /// Compiled-in default; always succeeds.
    BuiltinDefault,
}

impl ResolutionStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            ResolutionStrategy::ExactMatch => "exact",
            ResolutionStrategy::Generic => "generic",
            ResolutionStrategy::BuiltinDefault => "builtin",
        }
    }
}

pub const DEFAULT_CHAIN: [ResolutionStrategy; 3] = [
    ResolutionStrategy::ExactMatch,
    ResolutionStrategy::Generic,
    ResolutionStrategy::BuiltinDefault,
];

#[derive(Debug, Clone)]
pub struct Resolved {
    pub adapter: Arc<TaskAdapter>,
    pub strategy: ResolutionStrategy,
}

/// Loads adapters from one directory through a shared cache.
#[derive(Debug)]
pub struct AdapterLoader {
    dir: PathBuf,
    cache: AdapterCache,
    chain: Vec<ResolutionStrategy>,
}

impl AdapterLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_chain(dir, DEFAULT_CHAIN.to_vec())
    }

    pub fn with_chain(dir: impl Into<PathBuf>, chain: Vec<ResolutionStrategy>) -> Self {
        Self {
            dir: dir.into(),
            cache: AdapterCache::default(),
            chain,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn cache(&self) -> &AdapterCache {
        &self.cache
    }

    /// Load adapter `id`, consulting the cache first.
    pub fn load(&self, id: &str) -> Result<Arc<TaskAdapter>, AdapterError> {
        if let Some(adapter) = self.cache.get(&self.dir, id) {
            return Ok(adapter);
        }
        let not_found = || AdapterError::NotFound {
            id: id.to_string(),
            dir: self.dir.clone(),
        };
        // Task types become file names; anything outside the id grammar cannot exist.
        if !ADAPTER_ID_RE.is_match(id) {
            return Err(not_found());
        }
        let path = self.dir.join(format!("{id}.json"));
        if !path.is_file() {
            return Err(not_found());
        }

        let adapter = Arc::new(load_adapter_file(&path)?);
        debug!(adapter = id, version = %adapter.version, "adapter loaded");
        self.cache.insert(&self.dir, adapter.clone());
        Ok(adapter)
    }

    /// Walk the chain for `task_type`. Never fails: load errors are logged
    /// and the next strategy is tried.
    pub fn resolve(&self, task_type: &str) -> Resolved {
        for strategy in &self.chain {
            let attempt = match strategy {
                ResolutionStrategy::ExactMatch => self.load(task_type),
                ResolutionStrategy::Generic => self.load(GENERIC_ADAPTER_ID),
                ResolutionStrategy::BuiltinDefault => Ok(BUILTIN_DEFAULT.clone()),
            };
            match attempt {
                Ok(adapter) => {
                    return Resolved {
                        adapter,
                        strategy: *strategy,
                    };
                }
                Err(AdapterError::NotFound { .. }) => {
                    debug!(task_type, strategy = strategy.as_str(), "no adapter file");
                }
                Err(err) => {
                    warn!(task_type, strategy = strategy.as_str(), err = %err, "adapter rejected");
                }
            }
        }
        Resolved {
            adapter: BUILTIN_DEFAULT.clone(),
            strategy: ResolutionStrategy::BuiltinDefault,
        }
    }
}
