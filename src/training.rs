use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::checkpoint::persist_checkpoint;

pub const HISTORY_FILE: &str = "history.json";

#[derive(Debug, Error)]
pub enum HistoryError {
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
    #[error("malformed history {path}")]
    Format {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Per-iteration training curve and per-validation summaries of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct History {
    pub train_loss: Vec<f64>,
    pub train_accuracy: Vec<f64>,
    pub valid_loss: Vec<f64>,
    pub valid_accuracy: Vec<f64>,
    pub test_accuracy: Vec<f64>,
}

impl History {
    pub fn save(&self, dir: &Path) -> Result<PathBuf, HistoryError> {
        let path = dir.join(HISTORY_FILE);
        let payload = serde_json::to_vec_pretty(self).map_err(|source| HistoryError::Format {
            path: path.clone(),
            source,
        })?;
        persist_checkpoint(&path, &payload).map_err(|source| HistoryError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    /// `Ok(None)` when the run has no saved history yet.
    pub fn load(dir: &Path) -> Result<Option<Self>, HistoryError> {
        let path = dir.join(HISTORY_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).map_err(|source| HistoryError::Read {
            path: path.clone(),
            source,
        })?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| HistoryError::Format { path, source })
    }
}

/// Validation runs on the first iteration and then every `validate_every`.
pub fn should_validate(iteration: usize, validate_every: usize) -> bool {
    iteration == 1 || (validate_every > 0 && iteration.is_multiple_of(validate_every))
}

pub fn should_print(iteration: usize, print_every: usize) -> bool {
    print_every > 0 && iteration.is_multiple_of(print_every)
}

/// Checkpoints are written after an epoch when `save_every` divides the
/// number of iterations run so far.
pub fn should_save(total_iterations: usize, save_every: usize) -> bool {
    save_every > 0 && total_iterations.is_multiple_of(save_every)
}

/// Accumulates loss, accuracy and throughput between progress reports.
#[derive(Debug, Clone, Default)]
pub struct RunningStats {
    loss: f64,
    n_correct: usize,
    n_tokens: usize,
    sentences: usize,
    elapsed: Duration,
    batches: usize,
}

impl RunningStats {
    pub fn observe(&mut self, loss: f64, n_correct: usize, n_tokens: usize, sentences: usize, started: Instant) {
        self.loss += loss;
        self.n_correct += n_correct;
        self.n_tokens += n_tokens;
        self.sentences += sentences;
        self.elapsed += started.elapsed();
        self.batches += 1;
    }

    pub fn mean_loss(&self) -> f64 {
        self.loss / self.batches.max(1) as f64
    }

    /// Token accuracy in percent.
    pub fn accuracy(&self) -> f64 {
        100.0 * self.n_correct as f64 / self.n_tokens.max(1) as f64
    }

    pub fn rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 { self.sentences as f64 / secs } else { 0.0 }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Mean pretraining loss split into the objective and its regularisers.
#[derive(Debug, Clone, Default)]
pub struct PretrainStats {
    pub stats: RunningStats,
    recur: f64,
    covar: f64,
    ortho: f64,
}

impl PretrainStats {
    pub fn observe_regularizers(&mut self, recur: f64, covar: f64, ortho: f64) {
        self.recur += recur;
        self.covar += covar;
        self.ortho += ortho;
    }

    pub fn report(&self, iteration: usize) -> String {
        let n = self.stats.batches.max(1) as f64;
        format!(
            "{iteration:6}) Pretrain loss: {} ({} + {} + {})    Pretrain rate: {:6.1} sents/sec",
            format_sci(self.stats.mean_loss(), 2),
            format_sci(self.recur / n, 2),
            format_sci(self.covar / n, 2),
            format_sci(self.ortho / n, 2),
            self.stats.rate(),
        )
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

pub fn train_report(iteration: usize, train: &RunningStats, valid: &RunningStats) -> String {
    format!(
        "{iteration:6}) Train loss: {:.4}    Train acc: {:5.2}%    Train rate: {:6.1} sents/sec\n\tValid loss: {:.4}    Valid acc: {:5.2}%    Valid rate: {:6.1} sents/sec",
        train.mean_loss(),
        train.accuracy(),
        train.rate(),
        valid.mean_loss(),
        valid.accuracy(),
        valid.rate(),
    )
}

/// C-style `%.Ne`: two-digit signed exponent (`1.50e-03`).
pub fn format_sci(value: f64, precision: usize) -> String {
    let formatted = format!("{value:.precision$e}");
    let Some((mantissa, exponent)) = formatted.split_once('e') else {
        return formatted;
    };
    let (sign, digits) = match exponent.strip_prefix('-') {
        Some(digits) => ('-', digits),
        None => ('+', exponent),
    };
    format!("{mantissa}e{sign}{digits:0>2}")
}
