use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelKind {
    Tagger,
    Parser,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tagger => write!(f, "Tagger"),
            Self::Parser => write!(f, "Parser"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot write config {path}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed config")]
    Parse(#[from] toml::de::Error),
    #[error("cannot serialize config")]
    Serialize(#[from] toml::ser::Error),
    #[error("bad override {0:?}: expected section.key=value")]
    Override(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OsConfig {
    pub save_dir: PathBuf,
    pub train_file: PathBuf,
    pub valid_file: PathBuf,
    pub test_file: PathBuf,
}

impl Default for OsConfig {
    fn default() -> Self {
        Self {
            save_dir: PathBuf::from("saves/default"),
            train_file: PathBuf::from("data/train.conllu"),
            valid_file: PathBuf::from("data/dev.conllu"),
            test_file: PathBuf::from("data/test.conllu"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub n_bkts: usize,
    pub min_occur_count: usize,
    pub cased: bool,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            n_bkts: 10,
            min_occur_count: 2,
            cased: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayersConfig {
    pub word_embed_size: usize,
    pub tag_embed_size: usize,
    pub recur_size: usize,
    pub n_recur: usize,
    pub mlp_size: usize,
    pub rel_mlp_size: usize,
    pub init_scale: f64,
}

impl Default for LayersConfig {
    fn default() -> Self {
        Self {
            word_embed_size: 100,
            tag_embed_size: 100,
            recur_size: 200,
            n_recur: 1,
            mlp_size: 200,
            rel_mlp_size: 100,
            init_scale: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegularizationConfig {
    pub l2_reg: f64,
    pub recur_reg: f64,
    pub covar_reg: f64,
    pub ortho_reg: f64,
    pub embed_keep_prob: f64,
    pub mlp_keep_prob: f64,
}

impl Default for RegularizationConfig {
    fn default() -> Self {
        Self {
            l2_reg: 0.0,
            recur_reg: 0.0,
            covar_reg: 0.0,
            ortho_reg: 0.0,
            embed_keep_prob: 0.67,
            mlp_keep_prob: 0.67,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadamConfig {
    pub learning_rate: f64,
    pub decay: f64,
    pub decay_steps: f64,
    pub mu: f64,
    pub nu: f64,
    pub gamma: f64,
    pub epsilon: f64,
    pub chi: f64,
    pub clip: f64,
}

impl Default for RadamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 2e-3,
            decay: 0.75,
            decay_steps: 5000.0,
            mu: 0.9,
            nu: 0.9,
            gamma: 0.0,
            epsilon: 1e-12,
            chi: 0.999,
            clip: 5.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub pretrain_iters: usize,
    pub train_iters: usize,
    /// Tokens per training minibatch.
    pub train_batch_size: usize,
    /// Tokens per validation/test minibatch.
    pub test_batch_size: usize,
    pub print_every: usize,
    pub validate_every: usize,
    pub save_every: usize,
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            pretrain_iters: 1000,
            train_iters: 50000,
            train_batch_size: 5000,
            test_batch_size: 5000,
            print_every: 100,
            validate_every: 100,
            save_every: 1,
            seed: 1337,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub os: OsConfig,
    pub dataset: DatasetConfig,
    pub layers: LayersConfig,
    pub regularization: RegularizationConfig,
    pub radam: RadamConfig,
    pub training: TrainingConfig,
}

impl Config {
    /// Defaults overlaid with the TOML file at `path`, if any.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }

    /// Applies `section.key=value`; the value is read as a TOML literal and
    /// falls back to a bare string.
    pub fn apply_override(&mut self, assignment: &str) -> Result<(), ConfigError> {
        let bad = || ConfigError::Override(assignment.to_string());
        let (key, raw) = assignment.split_once('=').ok_or_else(bad)?;
        let (section, field) = key.trim().split_once('.').ok_or_else(bad)?;

        let literal = toml::from_str::<toml::Table>(&format!("v = {}", raw.trim()))
            .ok()
            .and_then(|mut table| table.remove("v"))
            .unwrap_or_else(|| toml::Value::String(raw.trim().to_string()));

        let mut root = toml::Value::try_from(&*self)?;
        let table = root
            .get_mut(section)
            .and_then(toml::Value::as_table_mut)
            .ok_or_else(bad)?;
        if !table.contains_key(field) {
            return Err(bad());
        }
        table.insert(field.to_string(), literal);
        *self = root.try_into()?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        let training = &self.training;
        if training.train_batch_size == 0 || training.test_batch_size == 0 {
            return invalid("batch sizes must be > 0");
        }
        if self.dataset.n_bkts == 0 {
            return invalid("n_bkts must be >= 1");
        }
        let radam = &self.radam;
        for (name, rate) in [("mu", radam.mu), ("nu", radam.nu), ("chi", radam.chi)] {
            if !(0.0..1.0).contains(&rate) {
                return Err(ConfigError::Invalid(format!("{name} must be in [0, 1)")));
            }
        }
        if radam.epsilon <= 0.0 {
            return invalid("epsilon must be > 0");
        }
        let reg = &self.regularization;
        for (name, keep) in [
            ("embed_keep_prob", reg.embed_keep_prob),
            ("mlp_keep_prob", reg.mlp_keep_prob),
        ] {
            if !(keep > 0.0 && keep <= 1.0) {
                return Err(ConfigError::Invalid(format!("{name} must be in (0, 1]")));
            }
        }
        let layers = &self.layers;
        if layers.recur_size == 0 || layers.mlp_size == 0 || layers.rel_mlp_size == 0 {
            return invalid("layer sizes must be > 0");
        }
        Ok(())
    }

    pub fn write_to(&self, dir: &Path) -> Result<PathBuf, ConfigError> {
        let path = dir.join(CONFIG_FILE_NAME);
        let text = toml::to_string_pretty(self)?;
        fs::write(&path, text).map_err(|source| ConfigError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

/// What a single invocation of the binary should do.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub model_kind: ModelKind,
    pub pretrain: bool,
    pub test: bool,
    pub load: bool,
    pub force: bool,
    pub config_file: Option<PathBuf>,
    pub save_dir: Option<PathBuf>,
    pub overrides: Vec<String>,
}

impl RunConfig {
    /// Resolves the effective config: with `--test`/`--load` and a save
    /// directory, the config saved alongside the run takes precedence.
    pub fn resolve(&self) -> Result<Config, ConfigError> {
        let saved_config = match (&self.save_dir, self.test || self.load) {
            (Some(save_dir), true) => Some(save_dir.join(CONFIG_FILE_NAME)),
            _ => None,
        };
        let path = saved_config.or_else(|| self.config_file.clone());
        let mut config = Config::load(path.as_deref())?;
        if let Some(save_dir) = &self.save_dir {
            config.os.save_dir = save_dir.clone();
        }
        for assignment in &self.overrides {
            config.apply_override(assignment)?;
        }
        config.validate()?;
        Ok(config)
    }
}
