#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::Deserialize;

use crate::error::DuebellError;
use crate::task::model::{Task, TaskRecord};

/// A task list file supplied by the host (JSON array, `{ "items": [...] }`,
/// or YAML).
#[derive(Debug, Clone)]
pub struct TaskSource {
    path: PathBuf,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TaskDocument {
    List(Vec<TaskRecord>),
    Wrapped { items: Vec<TaskRecord> },
}

impl TaskDocument {
    fn into_tasks(self) -> Vec<Task> {
        let records = match self {
            Self::List(v) | Self::Wrapped { items: v } => v,
        };
        records.into_iter().map(Task::from).collect()
    }
}

impl TaskSource {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> anyhow::Result<Vec<Task>> {
        let data = std::fs::read_to_string(&self.path).map_err(|source| DuebellError::IoPath {
            path: self.path.clone(),
            source,
        })?;
        let tasks = parse_tasks(&self.path, &data)?;
        validate_unique_ids(&tasks)
            .with_context(|| format!("invalid task list in {}", self.path.display()))?;
        Ok(tasks)
    }
}

fn parse_tasks(path: &Path, data: &str) -> Result<Vec<Task>, DuebellError> {
    let is_yaml = matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yaml" | "yml")
    );
    let doc: TaskDocument = if is_yaml {
        serde_yaml::from_str(data).map_err(|e| DuebellError::TaskFile {
            path: path.to_path_buf(),
            msg: e.to_string(),
        })?
    } else {
        serde_json::from_str(data).map_err(|e| DuebellError::TaskFile {
            path: path.to_path_buf(),
            msg: e.to_string(),
        })?
    };
    Ok(doc.into_tasks())
}

fn validate_unique_ids(tasks: &[Task]) -> anyhow::Result<()> {
    let mut seen = std::collections::BTreeSet::new();
    for t in tasks {
        if t.id.trim().is_empty() {
            anyhow::bail!("task ID is required");
        }
        if !seen.insert(t.id.as_str()) {
            anyhow::bail!("duplicate task ID '{}'", t.id);
        }
    }
    Ok(())
}
