//! File stager: builds a task's private directory tree.
//!
//! A staged task directory contains:
//! - `files/`: each upload stored under a generated identifier, with an
//!   `<id>.name` sidecar holding the original filename
//! - `metadata/`: empty, writable by the running script
//! - `output/`: empty, for final artifacts
//! - a copy of the script, named after the script
//! - `arg_file.json`: the argument document with placeholders resolved
//!
//! The tree is assembled under a hidden staging directory and published
//! with a single rename, so a task directory is either absent or complete.

use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;
use tokio::fs;
use uuid::Uuid;

use crate::error::{ConfigError, Error, ValidationError};
use crate::registry::Script;

/// Name of the resolved argument file inside a task directory.
pub const ARG_FILE: &str = "arg_file.json";
/// Name of the combined stdout+stderr log inside a task directory.
pub const LOG_FILE: &str = "log.txt";
/// Subdirectory holding staged uploads.
pub const FILES_DIR: &str = "files";
/// Subdirectory for intermediate artifacts written by the script.
pub const METADATA_DIR: &str = "metadata";
/// Subdirectory for final artifacts written by the script.
pub const OUTPUT_DIR: &str = "output";

/// Placeholder tokens: the entire string value must be `<fileN>`.
static FILE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^<file([0-9]+)>$").expect("valid placeholder regex"));

/// An uploaded file blob, as received at submission.
#[derive(Debug, Clone)]
pub struct Upload {
    /// Original filename, kept as a sidecar mapping only.
    pub filename: String,
    pub content: Vec<u8>,
}

impl Upload {
    pub fn new(filename: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            content: content.into(),
        }
    }
}

/// A fully built, published task directory.
#[derive(Debug)]
pub struct StagedTask {
    pub task_dir: PathBuf,
    /// Generated upload identifiers, in submission order.
    pub file_ids: Vec<Uuid>,
    /// The resolved argument document as written to `arg_file.json`.
    pub resolved_args: Value,
}

/// Builds task directories under a common `tasks/` root.
pub struct FileStager {
    tasks_dir: PathBuf,
}

impl FileStager {
    /// Open (creating if needed) a stager rooted at `tasks_dir`.
    pub async fn open(tasks_dir: PathBuf) -> Result<Self, ConfigError> {
        fs::create_dir_all(&tasks_dir).await?;
        Ok(Self { tasks_dir })
    }

    /// Final directory for a task, published or not.
    pub fn task_dir(&self, task_id: Uuid) -> PathBuf {
        self.tasks_dir.join(task_id.to_string())
    }

    /// Stage a task: validate and resolve the argument document, build the
    /// directory tree, and atomically publish it.
    ///
    /// Any failure leaves no trace under `tasks/` apart from a best-effort
    /// removed staging directory; callers create the task record only after
    /// this returns.
    pub async fn stage(
        &self,
        task_id: Uuid,
        script: &Script,
        raw_args: &str,
        uploads: &[Upload],
    ) -> Result<StagedTask, Error> {
        let args: Value = serde_json::from_str(raw_args)
            .map_err(|e| ValidationError::MalformedArgDocument(e.to_string()))?;

        let file_ids: Vec<Uuid> = uploads.iter().map(|_| Uuid::new_v4()).collect();
        let resolved_args = resolve_placeholders(&args, &file_ids)?;

        let staging_dir = self.tasks_dir.join(format!(".staging-{task_id}"));
        let result = self
            .build_tree(&staging_dir, script, &resolved_args, uploads, &file_ids)
            .await;

        if let Err(e) = result {
            let _ = fs::remove_dir_all(&staging_dir).await;
            return Err(Error::Io(e));
        }

        let task_dir = self.task_dir(task_id);
        if let Err(e) = fs::rename(&staging_dir, &task_dir).await {
            let _ = fs::remove_dir_all(&staging_dir).await;
            return Err(Error::Io(e));
        }

        tracing::debug!(
            task_id = %task_id,
            script = %script.name,
            uploads = uploads.len(),
            "Staged task directory"
        );

        Ok(StagedTask {
            task_dir,
            file_ids,
            resolved_args,
        })
    }

    async fn build_tree(
        &self,
        staging_dir: &PathBuf,
        script: &Script,
        resolved_args: &Value,
        uploads: &[Upload],
        file_ids: &[Uuid],
    ) -> std::io::Result<()> {
        let files_dir = staging_dir.join(FILES_DIR);
        fs::create_dir_all(&files_dir).await?;
        fs::create_dir_all(staging_dir.join(METADATA_DIR)).await?;
        fs::create_dir_all(staging_dir.join(OUTPUT_DIR)).await?;

        for (upload, id) in uploads.iter().zip(file_ids) {
            fs::write(files_dir.join(id.to_string()), &upload.content).await?;
            fs::write(files_dir.join(format!("{id}.name")), &upload.filename).await?;
        }

        fs::copy(&script.source_path, staging_dir.join(&script.name)).await?;

        let doc = serde_json::to_string_pretty(resolved_args).expect("serializable JSON value");
        fs::write(staging_dir.join(ARG_FILE), doc).await?;

        Ok(())
    }
}

/// Recursively rewrite string leaves of exact form `<fileN>` (1-indexed)
/// to `files/<id of the N-th upload>`. Everything else is left untouched.
fn resolve_placeholders(value: &Value, file_ids: &[Uuid]) -> Result<Value, ValidationError> {
    match value {
        Value::String(s) => {
            let Some(caps) = FILE_PATTERN.captures(s) else {
                return Ok(value.clone());
            };
            let index: usize = caps[1].parse().unwrap_or(usize::MAX);
            if index == 0 || index > file_ids.len() {
                return Err(ValidationError::PlaceholderOutOfRange {
                    index,
                    uploaded: file_ids.len(),
                });
            }
            Ok(Value::String(format!(
                "{FILES_DIR}/{}",
                file_ids[index - 1]
            )))
        }
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|item| resolve_placeholders(item, file_ids))
                .collect::<Result<_, _>>()?,
        )),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), resolve_placeholders(item, file_ids)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}
