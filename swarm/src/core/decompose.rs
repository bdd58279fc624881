//! Turn a structured list from model output into subtask specs.

use serde_json::{Map, Value};

use crate::core::extract::extract_structured_list;

/// A subtask proposed by a decomposing task; the ledger policy is attached
/// later from the adapter resolved for `task_type`.
#[derive(Debug, Clone, PartialEq)]
pub struct SubtaskSpec {
    pub task_type: String,
    pub title: String,
    pub description: String,
    pub params: Map<String, Value>,
}

/// Every object item with a non-empty `title` becomes one spec; other items
/// are skipped. The type comes from the item, then `default_type`.
pub fn subtask_specs(items: Vec<Value>, default_type: &str) -> Vec<SubtaskSpec> {
    items
        .into_iter()
        .filter_map(|item| {
            let Value::Object(mut obj) = item else {
                return None;
            };
            let title = non_empty_str(&obj, "title")?;
            let task_type = non_empty_str(&obj, "type").unwrap_or_else(|| default_type.to_string());
            let description = non_empty_str(&obj, "description").unwrap_or_default();
            let params = match obj.remove("params") {
                Some(Value::Object(params)) => params,
                _ => Map::new(),
            };
            Some(SubtaskSpec {
                task_type,
                title,
                description,
                params,
            })
        })
        .collect()
}

/// Extract and convert in one step; `None` when the output holds no list.
pub fn subtasks_from_output(output: &str, default_type: &str) -> Option<Vec<SubtaskSpec>> {
    extract_structured_list(output).map(|items| subtask_specs(items, default_type))
}

fn non_empty_str(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
