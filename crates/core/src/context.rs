use crate::error::ContextError;
use crate::types::Outputs;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Logical roots a context path may start with
pub const ROOTS: [&str; 3] = ["inputs", "steps", "ctx"];

/// Immutable view of the context at one point in time
#[derive(Debug, Clone)]
pub struct ContextSnapshot(Arc<Value>);

impl ContextSnapshot {
    pub fn from_value(value: Value) -> Self {
        Self(Arc::new(value))
    }

    /// Look up a dotted path; missing segments resolve to `None`
    pub fn get(&self, path: &str) -> Option<&Value> {
        lookup(&self.0, path)
    }
}

/// Shared key/value store for one run. Cloning shares the same underlying store.
///
/// Values live in one JSON tree with three roots: `inputs`, `steps` and `ctx`.
/// Writers take the write lock and swap in a new tree (copy-on-write through
/// `Arc::make_mut`), so a snapshot handed to a reader is never modified
/// underneath it.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    root: Arc<RwLock<Arc<Value>>>,
}

impl ExecutionContext {
    /// Create a context seeded with workflow inputs
    pub fn new(inputs: Map<String, Value>) -> Self {
        let mut root = Map::new();
        root.insert("inputs".to_string(), Value::Object(inputs));
        root.insert("steps".to_string(), Value::Object(Map::new()));
        root.insert("ctx".to_string(), Value::Object(Map::new()));

        Self {
            root: Arc::new(RwLock::new(Arc::new(Value::Object(root)))),
        }
    }

    pub async fn snapshot(&self) -> ContextSnapshot {
        ContextSnapshot(self.root.read().await.clone())
    }

    pub async fn get(&self, path: &str) -> Option<Value> {
        self.snapshot().await.get(path).cloned()
    }

    pub async fn set(&self, path: &str, value: Value) -> Result<(), ContextError> {
        let segments = split_path(path)?;
        let mut guard = self.root.write().await;
        write_path(Arc::make_mut(&mut guard), &segments, value);
        Ok(())
    }

    /// Merge a step's result into the context in a single write.
    ///
    /// The full result lands at `steps.<step>.output`; each entry of the
    /// mapping copies `result[key]` to its context path. Paths without a known
    /// root are placed under `ctx`.
    pub async fn merge(
        &self,
        step_name: &str,
        output_mapping: &BTreeMap<String, String>,
        result: &Outputs,
    ) -> Result<(), ContextError> {
        let mut writes = vec![(
            vec!["steps".to_string(), step_name.to_string(), "output".to_string()],
            Value::Object(result.clone()),
        )];

        let result_value = Value::Object(result.clone());
        for (result_key, context_path) in output_mapping {
            let Some(value) = lookup(&result_value, result_key) else {
                tracing::debug!(
                    step = step_name,
                    key = %result_key,
                    "declared output missing from step result"
                );
                continue;
            };
            writes.push((normalize_path(context_path)?, value.clone()));
        }

        let mut guard = self.root.write().await;
        let root = Arc::make_mut(&mut guard);
        for (segments, value) in writes {
            write_path(root, &segments, value);
        }

        Ok(())
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new(Map::new())
    }
}

fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.trim();
    if path.is_empty() {
        return None;
    }

    let mut current = root;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    match current {
        Value::Null => None,
        value => Some(value),
    }
}

fn split_path(path: &str) -> Result<Vec<String>, ContextError> {
    let segments: Vec<String> = path
        .trim()
        .split('.')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    match segments.first() {
        None => Err(ContextError::EmptyPath),
        Some(root) if !ROOTS.contains(&root.as_str()) => Err(ContextError::UnknownRoot {
            path: path.to_string(),
        }),
        Some(_) => Ok(segments),
    }
}

fn normalize_path(path: &str) -> Result<Vec<String>, ContextError> {
    let trimmed = path.trim();
    let has_root = trimmed
        .split('.')
        .next()
        .is_some_and(|root| ROOTS.contains(&root));

    if has_root {
        split_path(trimmed)
    } else {
        split_path(&format!("ctx.{trimmed}"))
    }
}

fn write_path(root: &mut Value, segments: &[String], value: Value) {
    let Some((last, parents)) = segments.split_last() else {
        return;
    };

    let mut current = root;
    for segment in parents {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        current = map
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    if let Value::Object(map) = current {
        map.insert(last.clone(), value);
    }
}
