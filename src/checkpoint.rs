use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::{GraphError, Parameter, Radam, RadamSnapshot};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("cannot write {path}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot read {path}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed checkpoint {path}")]
    Format {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("checkpoint has no tensor for parameter {0:?}")]
    MissingParameter(String),
    #[error("checkpoint tensor {name:?} is {found:?}, model expects {expected:?}")]
    ShapeMismatch {
        name: String,
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error(transparent)]
    Graph(#[from] GraphError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SavedTensor {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f64>,
}

/// Everything needed to resume a run: parameter values plus both
/// optimizers' slots and step counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub epoch: usize,
    pub params: BTreeMap<String, SavedTensor>,
    pub optimizer: RadamSnapshot,
    pub pretrain_optimizer: RadamSnapshot,
}

impl Checkpoint {
    pub fn capture(
        epoch: usize,
        params: &[Parameter],
        optimizer: &Radam,
        pretrain_optimizer: &Radam,
    ) -> Self {
        let saved = params
            .iter()
            .map(|p| {
                let (rows, cols) = p.tensor.shape();
                (
                    p.name.clone(),
                    SavedTensor {
                        rows,
                        cols,
                        data: p.tensor.data(),
                    },
                )
            })
            .collect();
        Self {
            epoch,
            params: saved,
            optimizer: optimizer.snapshot(params),
            pretrain_optimizer: pretrain_optimizer.snapshot(params),
        }
    }

    /// Writes the saved values into `params` and restores both optimizers.
    /// Every parameter must be present with a matching shape.
    pub fn apply(
        &self,
        params: &[Parameter],
        optimizer: &mut Radam,
        pretrain_optimizer: &mut Radam,
    ) -> Result<(), CheckpointError> {
        for param in params {
            let saved = self
                .params
                .get(&param.name)
                .ok_or_else(|| CheckpointError::MissingParameter(param.name.clone()))?;
            let expected = param.tensor.shape();
            if (saved.rows, saved.cols) != expected {
                return Err(CheckpointError::ShapeMismatch {
                    name: param.name.clone(),
                    expected,
                    found: (saved.rows, saved.cols),
                });
            }
            param.tensor.set_data(saved.data.clone())?;
        }
        optimizer.restore(params, &self.optimizer)?;
        pretrain_optimizer.restore(params, &self.pretrain_optimizer)?;
        Ok(())
    }
}

pub fn persist_checkpoint(path: &Path, payload: &[u8]) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = temporary_checkpoint_path(path);
    fs::write(&tmp_path, payload)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Writes `<stem>[-<step>].json` under `dir` and points the `pointer`
/// file at it. Only the newest checkpoint behind a pointer is kept.
pub fn save(
    dir: &Path,
    pointer: &str,
    stem: &str,
    step: Option<u64>,
    checkpoint: &Checkpoint,
) -> Result<PathBuf, CheckpointError> {
    let file_name = match step {
        Some(step) => format!("{stem}-{step}.json"),
        None => format!("{stem}.json"),
    };
    let path = dir.join(&file_name);
    let payload = serde_json::to_vec(checkpoint).map_err(|source| CheckpointError::Format {
        path: path.clone(),
        source,
    })?;
    persist_checkpoint(&path, &payload).map_err(|source| CheckpointError::Write {
        path: path.clone(),
        source,
    })?;

    let pointer = dir.join(pointer);
    let previous = fs::read_to_string(&pointer)
        .ok()
        .map(|line| line.trim().to_string())
        .filter(|prev| !prev.is_empty() && *prev != file_name);
    persist_checkpoint(&pointer, format!("{file_name}\n").as_bytes()).map_err(|source| {
        CheckpointError::Write {
            path: pointer.clone(),
            source,
        }
    })?;
    if let Some(previous) = previous {
        let stale = dir.join(previous);
        if let Err(err) = fs::remove_file(&stale) {
            tracing::warn!(path = %stale.display(), error = %err, "could not remove old checkpoint");
        }
    }

    tracing::info!(path = %path.display(), "saved checkpoint");
    Ok(path)
}

/// Path of the checkpoint the `pointer` file refers to.
pub fn latest(dir: &Path, pointer: &str) -> Result<PathBuf, CheckpointError> {
    let pointer = dir.join(pointer);
    let file_name = fs::read_to_string(&pointer).map_err(|source| CheckpointError::Read {
        path: pointer.clone(),
        source,
    })?;
    Ok(dir.join(file_name.trim()))
}

pub fn load(path: &Path) -> Result<Checkpoint, CheckpointError> {
    let bytes = fs::read(path).map_err(|source| CheckpointError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|source| CheckpointError::Format {
        path: path.to_path_buf(),
        source,
    })
}

fn temporary_checkpoint_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .unwrap_or("checkpoint.json");
    path.with_file_name(format!("{file_name}.tmp"))
}
