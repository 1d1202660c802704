//! Training driver: owns the datasets, the model and its two optimizers, and
//! runs the pretrain/train/validate/test loops that produce a run's
//! artifacts under `save_dir`.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use rand::SeedableRng;
use rand::rngs::StdRng;
use thiserror::Error;

use crate::checkpoint::{self, Checkpoint, CheckpointError};
use crate::config::{Config, ConfigError, ModelKind, RegularizationConfig};
use crate::data::conll::format_predictions;
use crate::data::{Dataset, DatasetError, TokenPrediction, Vocabs, read_conll};
use crate::eval::{EvalError, Scores, score};
use crate::graph::{Radam, Tensor, add_n};
use crate::models::{Model, Pass, Regularizers, build_model, sanity_check};
use crate::training::{
    History, HistoryError, PretrainStats, RunningStats, should_print, should_save,
    should_validate, train_report,
};

pub const HEAD_FILE: &str = "HEAD";
pub const SANITY_CHECK_FILE: &str = "sanitycheck.txt";
pub const SCORES_FILE: &str = "scores.txt";

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("cannot write {path}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
    #[error(transparent)]
    History(#[from] HistoryError),
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error("run aborted by the operator")]
    Aborted,
}

#[derive(Debug, Default)]
struct InterruptState {
    raised: AtomicBool,
    polled: AtomicBool,
}

/// Shared flag raised from a signal listener and polled between minibatches
/// of the pretrain and train loops.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<InterruptState>);

/// What a signal listener should do with an incoming interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    /// A training loop will pick the interrupt up at the next minibatch.
    Deferred,
    /// Nothing is polling, or an interrupt is already pending.
    Exit,
}

impl Interrupt {
    pub fn trigger(&self) {
        self.0.raised.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.raised.load(Ordering::SeqCst)
    }

    pub fn is_polled(&self) -> bool {
        self.0.polled.load(Ordering::SeqCst)
    }

    /// Raises the flag when a loop is polling it and none is pending yet.
    pub fn signal(&self) -> SignalOutcome {
        if self.is_polled() && !self.0.raised.swap(true, Ordering::SeqCst) {
            SignalOutcome::Deferred
        } else {
            SignalOutcome::Exit
        }
    }

    fn take(&self) -> bool {
        self.0.raised.swap(false, Ordering::SeqCst)
    }

    fn polling(&self) -> PollGuard {
        self.0.polled.store(true, Ordering::SeqCst);
        PollGuard(self.clone())
    }

    /// Runs the handler with polling off, so a signal during the prompt exits.
    fn ask(&self, handler: &mut dyn InterruptHandler) -> InterruptChoice {
        self.0.polled.store(false, Ordering::SeqCst);
        let choice = handler.on_interrupt();
        self.0.polled.store(true, Ordering::SeqCst);
        choice
    }
}

struct PollGuard(Interrupt);

impl Drop for PollGuard {
    fn drop(&mut self) {
        (self.0).0.polled.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptChoice {
    /// Stop the loop and go through the normal save path.
    Save,
    Abort,
}

pub trait InterruptHandler {
    fn on_interrupt(&mut self) -> InterruptChoice;
}

impl<F: FnMut() -> InterruptChoice> InterruptHandler for F {
    fn on_interrupt(&mut self) -> InterruptChoice {
        self()
    }
}

/// Run marker written to the `HEAD` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Training,
    Loading,
    Testing,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Training => write!(f, "Training:"),
            Self::Loading => write!(f, "Loading:"),
            Self::Testing => write!(f, "Testing:"),
        }
    }
}

pub struct Network {
    config: Config,
    vocabs: Vocabs,
    trainset: Dataset,
    validset: Dataset,
    testset: Dataset,
    model: Box<dyn Model>,
    optimizer: Radam,
    pretrain_optimizer: Radam,
    history: History,
    epoch: usize,
    rng: StdRng,
    interrupt: Interrupt,
}

impl Network {
    /// Creates `save_dir`, writes the effective config into it, and builds
    /// vocabularies from the training file plus the three datasets.
    pub fn new(kind: ModelKind, config: Config, interrupt: Interrupt) -> Result<Self, NetworkError> {
        let save_dir = config.os.save_dir.clone();
        fs::create_dir_all(&save_dir).map_err(|source| NetworkError::Io {
            path: save_dir.clone(),
            source,
        })?;
        config.write_to(&save_dir)?;

        let train_sentences = read_conll(&config.os.train_file).map_err(DatasetError::from)?;
        let vocabs = Vocabs::from_training(
            &train_sentences,
            config.dataset.min_occur_count,
            config.dataset.cased,
        );
        let n_bkts = config.dataset.n_bkts;
        let trainset = Dataset::new("Trainset", train_sentences, &vocabs, n_bkts)?;
        let validset = Dataset::from_file("Validset", &config.os.valid_file, &vocabs, n_bkts)?;
        let testset = Dataset::from_file("Testset", &config.os.test_file, &vocabs, n_bkts)?;

        let mut rng = StdRng::seed_from_u64(config.training.seed);
        let model = build_model(kind, &config, &vocabs, &mut rng);
        tracing::info!(
            model = %kind,
            words = vocabs.words.len(),
            tags = vocabs.tags.len(),
            rels = vocabs.rels.len(),
            train = trainset.len(),
            valid = validset.len(),
            test = testset.len(),
            "built network"
        );

        Ok(Self {
            optimizer: Radam::new(config.radam),
            pretrain_optimizer: Radam::new(config.radam),
            config,
            vocabs,
            trainset,
            validset,
            testset,
            model,
            history: History::default(),
            epoch: 0,
            rng,
            interrupt,
        })
    }

    /// Lowercase model name; prefixes checkpoint files and names the
    /// trained-checkpoint pointer.
    pub fn name(&self) -> String {
        self.model.kind().to_string().to_lowercase()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn save_dir(&self) -> &Path {
        &self.config.os.save_dir
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn global_step(&self) -> u64 {
        self.optimizer.global_step()
    }

    fn pretrain_pointer(&self) -> String {
        format!("{}-checkpoint", self.name())
    }

    /// Records the run phase and crate version in `HEAD`. `Training`
    /// starts the file afresh; the other phases append.
    pub fn mark_head(&self, phase: Phase) -> Result<(), NetworkError> {
        let path = self.save_dir().join(HEAD_FILE);
        let mut options = OpenOptions::new();
        options.create(true);
        if phase == Phase::Training {
            options.write(true).truncate(true);
        } else {
            options.append(true);
        }
        let io_err = |source| NetworkError::Io {
            path: path.clone(),
            source,
        };
        let mut file = options.open(&path).map_err(io_err)?;
        writeln!(
            file,
            "{phase}\n{} {}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION")
        )
        .map_err(io_err)
    }

    /// Trains the encoder on the next-word objective plus regularisers
    /// with a separate optimizer, then saves the pretrained checkpoint.
    pub fn pretrain(&mut self, handler: &mut dyn InterruptHandler) -> Result<(), NetworkError> {
        let pretrain_iters = self.config.training.pretrain_iters;
        if pretrain_iters == 0 {
            tracing::info!("no pretraining iterations configured");
            return Ok(());
        }
        let params = self.model.parameters();
        let print_every = self.config.training.print_every;
        let batch_size = self.config.training.train_batch_size;

        let mut stats = PretrainStats::default();
        let mut total = 0;
        let polling = self.interrupt.polling();
        'pretrain: while total < pretrain_iters {
            for batch in self.trainset.minibatches(batch_size, Some(&mut self.rng)) {
                if self.interrupt.take() {
                    match self.interrupt.ask(handler) {
                        InterruptChoice::Save => break 'pretrain,
                        InterruptChoice::Abort => return Err(NetworkError::Aborted),
                    }
                }
                let started = Instant::now();
                for param in &params {
                    param.tensor.zero_grad();
                }
                let output = self.model.forward(&batch, Pass::Pretrain(&mut self.rng));
                let [recur, covar, ortho] =
                    regularization(&self.config.regularization, &output.regularizers);
                let objective = add_n(&[output.loss.clone(), recur.clone(), covar.clone(), ortho.clone()]);
                objective.backward();
                self.pretrain_optimizer.step(&params);
                total += 1;

                stats.stats.observe(
                    output.loss.item(),
                    output.n_correct,
                    output.n_tokens,
                    batch.len(),
                    started,
                );
                stats.observe_regularizers(recur.item(), covar.item(), ortho.item());
                if should_print(total, print_every) {
                    tracing::info!("{}", stats.report(total));
                    stats.reset();
                }
                if total >= pretrain_iters {
                    break;
                }
            }
        }
        drop(polling);

        let checkpoint = self.capture();
        let stem = format!("{}-pretrained", self.name());
        checkpoint::save(self.save_dir(), &self.pretrain_pointer(), &stem, None, &checkpoint)?;
        Ok(())
    }

    /// Main training loop. Resumes from the optimizer's global step, so a
    /// loaded run continues where it stopped.
    pub fn train(&mut self, handler: &mut dyn InterruptHandler) -> Result<(), NetworkError> {
        let params = self.model.parameters();
        let weights = self.model.weights();
        let training = self.config.training.clone();

        let mut total = self.optimizer.global_step() as usize;
        let mut train_stats = RunningStats::default();
        let mut valid_stats = RunningStats::default();
        let polling = self.interrupt.polling();
        'training: while total < training.train_iters {
            for batch in self.trainset.minibatches(training.train_batch_size, Some(&mut self.rng)) {
                if self.interrupt.take() {
                    match self.interrupt.ask(handler) {
                        InterruptChoice::Save => break 'training,
                        InterruptChoice::Abort => return Err(NetworkError::Aborted),
                    }
                }
                let started = Instant::now();
                for param in &params {
                    param.tensor.zero_grad();
                }
                let output = self.model.forward(&batch, Pass::Train(&mut self.rng));
                let reg = &self.config.regularization;
                let l2 = if reg.l2_reg != 0.0 {
                    let terms: Vec<Tensor> = weights.iter().map(Tensor::l2_loss).collect();
                    add_n(&terms).scale(reg.l2_reg)
                } else {
                    Tensor::scalar(0.0)
                };
                let [recur, covar, ortho] = regularization(reg, &output.regularizers);
                let objective = add_n(&[output.loss.clone(), l2, recur, covar, ortho]);
                objective.backward();
                self.optimizer.step(&params);
                total += 1;

                let loss = objective.item();
                self.history.train_loss.push(loss);
                self.history
                    .train_accuracy
                    .push(100.0 * output.n_correct as f64 / output.n_tokens.max(1) as f64);
                train_stats.observe(loss, output.n_correct, output.n_tokens, batch.len(), started);

                if should_validate(total, training.validate_every) {
                    valid_stats = self.validate()?;
                    self.history.valid_loss.push(valid_stats.mean_loss());
                    self.history.valid_accuracy.push(valid_stats.accuracy());
                }
                if should_print(total, training.print_every) {
                    tracing::info!("{}", train_report(total, &train_stats, &valid_stats));
                    train_stats.reset();
                }
                if total >= training.train_iters {
                    break;
                }
            }
            self.epoch += 1;
            if should_save(total, training.save_every) {
                self.save_trained()?;
                self.test(true)?;
            }
        }

        drop(polling);
        self.save_trained()?;
        let scores_path = self.save_dir().join(SCORES_FILE);
        fs::write(&scores_path, "").map_err(|source| NetworkError::Io {
            path: scores_path.clone(),
            source,
        })?;
        self.test(true)?;
        Ok(())
    }

    /// Loss and accuracy over the validation set with moving parameters;
    /// rewrites `sanitycheck.txt`.
    fn validate(&self) -> Result<RunningStats, NetworkError> {
        let params = self.model.parameters();
        let _moving = self.optimizer.swap_in_moving(&params);
        let mut stats = RunningStats::default();
        let mut sanity = String::new();
        for batch in self
            .validset
            .minibatches::<StdRng>(self.config.training.test_batch_size, None)
        {
            let started = Instant::now();
            let output = self.model.forward(&batch, Pass::Eval);
            stats.observe(
                output.loss.item(),
                output.n_correct,
                output.n_tokens,
                batch.len(),
                started,
            );
            sanity.push_str(&sanity_check(&batch, &output.predictions, &self.vocabs));
        }
        let path = self.save_dir().join(SANITY_CHECK_FILE);
        fs::write(&path, sanity).map_err(|source| NetworkError::Io { path, source })?;
        Ok(stats)
    }

    /// Decodes the validation (`validate`) or test set with moving
    /// parameters, writes predictions next to the run in file order and
    /// appends the scores to `scores.txt`.
    pub fn test(&mut self, validate: bool) -> Result<Scores, NetworkError> {
        let (dataset, data_file) = if validate {
            (&self.validset, &self.config.os.valid_file)
        } else {
            (&self.testset, &self.config.os.test_file)
        };
        let params = self.model.parameters();
        let moving = self.optimizer.swap_in_moving(&params);

        let mut by_origin: HashMap<(usize, usize), Vec<TokenPrediction>> = HashMap::new();
        for batch in dataset.minibatches::<StdRng>(self.config.training.test_batch_size, None) {
            let output = self.model.forward(&batch, Pass::Eval);
            by_origin.extend(batch.origins.iter().copied().zip(output.predictions));
        }
        drop(moving);
        let predictions: Vec<Vec<TokenPrediction>> = dataset
            .metabucket()
            .iter()
            .map(|origin| by_origin.remove(origin).unwrap_or_default())
            .collect();

        let file_name = data_file
            .file_name()
            .map_or_else(|| PathBuf::from("predictions.conllu"), PathBuf::from);
        let out_path = self.config.os.save_dir.join(file_name);
        let text = format_predictions(
            dataset.sentences(),
            &predictions,
            &self.vocabs.tags,
            &self.vocabs.rels,
        );
        fs::write(&out_path, text).map_err(|source| NetworkError::Io {
            path: out_path.clone(),
            source,
        })?;

        let scores = score(
            dataset.sentences(),
            &predictions,
            &self.vocabs.tags,
            &self.vocabs.rels,
        )?;
        let dataset_name = dataset.name().to_string();
        let scores_path = self.config.os.save_dir.join(SCORES_FILE);
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&scores_path)
            .and_then(|mut file| write!(file, "{scores}"))
            .map_err(|source| NetworkError::Io {
                path: scores_path.clone(),
                source,
            })?;

        let headline = scores.las.or(scores.xpos).or(scores.upos).unwrap_or(0.0);
        self.history.test_accuracy.push(headline);
        tracing::info!(
            dataset = %dataset_name,
            output = %out_path.display(),
            tokens = scores.tokens,
            uas = ?scores.uas,
            las = ?scores.las,
            xpos = ?scores.xpos,
            "scored predictions"
        );
        Ok(scores)
    }

    /// Restores the newest trained checkpoint and, if present, the saved
    /// history.
    pub fn load(&mut self) -> Result<(), NetworkError> {
        let path = checkpoint::latest(self.save_dir(), &self.name())?;
        let saved = checkpoint::load(&path)?;
        let params = self.model.parameters();
        saved.apply(&params, &mut self.optimizer, &mut self.pretrain_optimizer)?;
        self.epoch = saved.epoch;
        if let Some(history) = History::load(self.save_dir())? {
            self.history = history;
        }
        tracing::info!(
            path = %path.display(),
            epoch = self.epoch,
            step = self.optimizer.global_step(),
            "restored checkpoint"
        );
        Ok(())
    }

    fn capture(&self) -> Checkpoint {
        Checkpoint::capture(
            self.epoch,
            &self.model.parameters(),
            &self.optimizer,
            &self.pretrain_optimizer,
        )
    }

    fn save_trained(&self) -> Result<PathBuf, NetworkError> {
        let stem = format!("{}-trained", self.name());
        let path = checkpoint::save(
            self.save_dir(),
            &self.name(),
            &stem,
            Some(self.epoch as u64),
            &self.capture(),
        )?;
        self.history.save(self.save_dir())?;
        Ok(path)
    }
}

/// Weighted recur, covar and ortho terms; a zero weight contributes a
/// constant zero.
fn regularization(config: &RegularizationConfig, regularizers: &Regularizers) -> [Tensor; 3] {
    [
        (config.recur_reg, &regularizers.recur),
        (config.covar_reg, &regularizers.covar),
        (config.ortho_reg, &regularizers.ortho),
    ]
    .map(|(weight, terms)| {
        if weight != 0.0 {
            add_n(terms).scale(weight)
        } else {
            Tensor::scalar(0.0)
        }
    })
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use rand::rngs::StdRng;

    use super::{
        HEAD_FILE, Interrupt, InterruptChoice, Network, NetworkError, Phase, SANITY_CHECK_FILE,
        SCORES_FILE, SignalOutcome,
    };
    use crate::config::{Config, ModelKind};
    use crate::models::Pass;
    use crate::data::conll::tests::TREEBANK;
    use crate::training::HISTORY_FILE;

    fn small_config(dir: &Path) -> Config {
        for name in ["train.conllu", "dev.conllu", "test.conllu"] {
            fs::write(dir.join(name), TREEBANK).expect("write treebank");
        }
        let mut config = crate::models::tests::tiny_config();
        config.os.save_dir = dir.join("run");
        config.os.train_file = dir.join("train.conllu");
        config.os.valid_file = dir.join("dev.conllu");
        config.os.test_file = dir.join("test.conllu");
        config.dataset.n_bkts = 2;
        config.dataset.min_occur_count = 1;
        config.training.pretrain_iters = 3;
        config.training.train_iters = 6;
        config.training.train_batch_size = 20;
        config.training.print_every = 2;
        config.training.validate_every = 3;
        config.training.save_every = 100;
        config.regularization.recur_reg = 0.1;
        config.regularization.covar_reg = 0.1;
        config.regularization.ortho_reg = 0.1;
        config.regularization.l2_reg = 1e-4;
        config
    }

    fn never() -> InterruptChoice {
        panic!("no interrupt expected")
    }

    #[test]
    fn training_writes_run_artifacts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = small_config(dir.path());
        let mut network = Network::new(ModelKind::Parser, config, Interrupt::default())
            .expect("network");
        network.mark_head(Phase::Training).expect("head");
        network.pretrain(&mut never).expect("pretrain");
        network.train(&mut never).expect("train");

        let save_dir = network.save_dir().to_path_buf();
        assert_eq!(network.global_step(), 6);
        assert_eq!(network.history().train_loss.len(), 6);
        // iterations 1, 3 and 6
        assert_eq!(network.history().valid_loss.len(), 3);
        assert_eq!(network.history().test_accuracy.len(), 1);

        for artifact in [
            HEAD_FILE,
            SANITY_CHECK_FILE,
            SCORES_FILE,
            HISTORY_FILE,
            "config.toml",
            "dev.conllu",
            "parser",
            "parser-checkpoint",
            "parser-pretrained.json",
        ] {
            assert!(save_dir.join(artifact).exists(), "{artifact} missing");
        }
        let head = fs::read_to_string(save_dir.join(HEAD_FILE)).expect("HEAD");
        assert!(head.starts_with("Training:\ndepnet "));
        let scores = fs::read_to_string(save_dir.join(SCORES_FILE)).expect("scores");
        assert!(scores.starts_with("Tokens: 10\nUAS: "));
        let predictions = fs::read_to_string(save_dir.join("dev.conllu")).expect("predictions");
        assert_eq!(predictions.lines().filter(|l| l.is_empty()).count(), 3);
        assert!(predictions.starts_with("1\tThe\t_\tDET\tDT\t_\t"));
    }

    #[test]
    fn load_restores_the_trained_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = small_config(dir.path());
        config.training.pretrain_iters = 0;
        config.training.train_iters = 2;
        let mut network = Network::new(ModelKind::Tagger, config.clone(), Interrupt::default())
            .expect("network");
        network.train(&mut never).expect("train");
        let trained_epoch = network.epoch();
        assert!(network.save_dir().join("tagger").exists());

        let mut reloaded =
            Network::new(ModelKind::Tagger, config, Interrupt::default()).expect("network");
        reloaded.load().expect("load");
        assert_eq!(reloaded.global_step(), 2);
        assert_eq!(reloaded.epoch(), trained_epoch);
        assert_eq!(reloaded.history().train_loss.len(), 2);

        reloaded.mark_head(Phase::Testing).expect("head");
        let scores = reloaded.test(false).expect("test");
        assert!(scores.xpos.is_some());
        assert!(scores.uas.is_none());
        assert!(reloaded.save_dir().join("test.conllu").exists());
        let head = fs::read_to_string(reloaded.save_dir().join(HEAD_FILE)).expect("HEAD");
        assert!(head.contains("Testing:"));
    }

    #[test]
    fn interrupt_can_save_or_abort() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = small_config(dir.path());

        let interrupt = Interrupt::default();
        let mut network =
            Network::new(ModelKind::Tagger, config.clone(), interrupt.clone()).expect("network");
        interrupt.trigger();
        let mut abort = || InterruptChoice::Abort;
        let err = network.train(&mut abort).expect_err("aborted");
        assert!(matches!(err, NetworkError::Aborted));
        assert_eq!(network.global_step(), 0);

        interrupt.trigger();
        let mut calls = 0;
        let mut save = || {
            calls += 1;
            InterruptChoice::Save
        };
        network.train(&mut save).expect("saved after interrupt");
        assert_eq!(calls, 1);
        assert!(!interrupt.is_triggered());
        assert_eq!(network.global_step(), 0);
        // interrupted before the first epoch finished
        assert!(network.save_dir().join("tagger-trained-0.json").exists());
    }

    #[test]
    fn signals_exit_unless_a_loop_is_polling() {
        let interrupt = Interrupt::default();
        assert_eq!(interrupt.signal(), SignalOutcome::Exit);

        let polling = interrupt.polling();
        assert!(interrupt.is_polled());
        assert_eq!(interrupt.signal(), SignalOutcome::Deferred);
        assert!(interrupt.is_triggered());
        // a second Ctrl-C before the loop reacts
        assert_eq!(interrupt.signal(), SignalOutcome::Exit);
        drop(polling);
        assert!(!interrupt.is_polled());
    }

    #[test]
    fn signal_during_the_prompt_exits_and_polling_ends_with_the_loop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let interrupt = Interrupt::default();
        let mut network = Network::new(ModelKind::Tagger, small_config(dir.path()), interrupt.clone())
            .expect("network");

        interrupt.trigger();
        let listener = interrupt.clone();
        let mut outcomes = Vec::new();
        let mut save = || {
            outcomes.push(listener.signal());
            InterruptChoice::Save
        };
        network.train(&mut save).expect("saved");
        assert_eq!(outcomes, vec![SignalOutcome::Exit]);
        assert!(!interrupt.is_polled());
        assert_eq!(interrupt.signal(), SignalOutcome::Exit);
    }

    #[test]
    fn pretrain_interrupt_can_save_or_abort() {
        let dir = tempfile::tempdir().expect("tempdir");
        let interrupt = Interrupt::default();
        let mut network = Network::new(ModelKind::Parser, small_config(dir.path()), interrupt.clone())
            .expect("network");
        let pretrained = network.save_dir().join("parser-pretrained.json");

        interrupt.trigger();
        let err = network
            .pretrain(&mut || InterruptChoice::Abort)
            .expect_err("aborted");
        assert!(matches!(err, NetworkError::Aborted));
        assert!(!pretrained.exists());

        interrupt.trigger();
        network
            .pretrain(&mut || InterruptChoice::Save)
            .expect("saved after interrupt");
        assert!(pretrained.exists());
        assert!(network.save_dir().join("parser-checkpoint").exists());
        assert_eq!(network.pretrain_optimizer.global_step(), 0);
    }

    #[test]
    fn zero_pretrain_iterations_change_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = small_config(dir.path());
        config.training.pretrain_iters = 0;
        let mut network =
            Network::new(ModelKind::Parser, config, Interrupt::default()).expect("network");
        let before: Vec<Vec<f64>> = network
            .model
            .parameters()
            .iter()
            .map(|p| p.tensor.data())
            .collect();

        network.pretrain(&mut never).expect("no-op");

        let after: Vec<Vec<f64>> = network
            .model
            .parameters()
            .iter()
            .map(|p| p.tensor.data())
            .collect();
        assert_eq!(before, after);
        assert_eq!(network.pretrain_optimizer.global_step(), 0);
        assert!(!network.save_dir().join("parser-pretrained.json").exists());
        assert!(!network.save_dir().join("parser-checkpoint").exists());
    }

    #[test]
    fn evaluation_uses_moving_values_and_restores_live_ones() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = small_config(dir.path());
        config.training.pretrain_iters = 0;
        config.training.train_iters = 3;
        config.radam.chi = 0.9;
        let mut network =
            Network::new(ModelKind::Tagger, config, Interrupt::default()).expect("network");
        network.train(&mut never).expect("train");
        // two minibatches per epoch: the run stops inside the second one
        assert_eq!(network.global_step(), 3);
        assert_eq!(network.epoch(), 2);

        let params = network.model.parameters();
        let live: Vec<Vec<f64>> = params.iter().map(|p| p.tensor.data()).collect();
        let batches = network
            .validset
            .minibatches::<StdRng>(network.config.training.test_batch_size, None);
        let mean_loss = |network: &Network| {
            batches
                .iter()
                .map(|batch| network.model.forward(batch, Pass::Eval).loss.item())
                .sum::<f64>()
                / batches.len() as f64
        };
        let live_loss = mean_loss(&network);
        let moving_loss = {
            let _moving = network.optimizer.swap_in_moving(&params);
            mean_loss(&network)
        };
        assert!((live_loss - moving_loss).abs() > 1e-9);

        let stats = network.validate().expect("validate");
        assert!((stats.mean_loss() - moving_loss).abs() < 1e-9);
        network.test(true).expect("test");

        let restored: Vec<Vec<f64>> = params.iter().map(|p| p.tensor.data()).collect();
        assert_eq!(restored, live);
    }
}
