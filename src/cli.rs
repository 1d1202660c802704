use std::ffi::OsString;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};

use crate::config::{ModelKind, RunConfig};
use crate::network::InterruptChoice;

#[derive(Debug, Parser)]
#[command(
    name = "depnet",
    version,
    about = "Train and evaluate a neural dependency parser or tagger"
)]
struct Cli {
    /// Run the pretraining objective before training.
    #[arg(long)]
    pretrain: bool,
    /// Evaluate a saved run on the test file instead of training.
    #[arg(long)]
    test: bool,
    /// Resume training from the latest checkpoint in the save directory.
    #[arg(long)]
    load: bool,
    #[arg(long, value_enum, default_value_t = CliModelKind::Parser)]
    model: CliModelKind,
    #[arg(long)]
    config_file: Option<PathBuf>,
    #[arg(long)]
    save_dir: Option<PathBuf>,
    /// Config override such as `training.train_iters=500`; repeatable.
    #[arg(long = "set", value_name = "SECTION.KEY=VALUE")]
    overrides: Vec<String>,
    /// Overwrite an existing save directory without asking.
    #[arg(long)]
    force: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliModelKind {
    Tagger,
    Parser,
}

impl From<CliModelKind> for ModelKind {
    fn from(model_kind: CliModelKind) -> Self {
        match model_kind {
            CliModelKind::Tagger => Self::Tagger,
            CliModelKind::Parser => Self::Parser,
        }
    }
}

pub fn parse_command() -> RunConfig {
    from_cli(Cli::parse())
}

pub fn try_command_from_iter<I, T>(iter: I) -> Result<RunConfig, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::try_parse_from(iter)?;
    Ok(from_cli(cli))
}

fn from_cli(cli: Cli) -> RunConfig {
    RunConfig {
        model_kind: cli.model.into(),
        pretrain: cli.pretrain,
        test: cli.test,
        load: cli.load,
        force: cli.force,
        config_file: cli.config_file,
        save_dir: cli.save_dir,
        overrides: cli.overrides,
    }
}

/// Asks before a training run reuses `save_dir`. The run rewrites its own
/// artifacts in place and leaves every other file alone. `false` on EOF.
pub fn confirm_overwrite(
    save_dir: &Path,
    input: &mut impl BufRead,
    output: &mut impl Write,
) -> io::Result<bool> {
    write!(
        output,
        "Save directory {} already exists. Press <Enter> to overwrite or <Ctrl-C> to exit ",
        save_dir.display()
    )?;
    output.flush()?;
    let mut line = String::new();
    Ok(input.read_line(&mut line)? > 0)
}

/// Prompt shown when a training loop picks up an interrupt. EOF or a read
/// error counts as abort.
pub fn ask_save_or_exit(input: &mut impl BufRead, output: &mut impl Write) -> InterruptChoice {
    let _ = write!(output, "\nPress <Enter> to save or <Ctrl-C> to exit ");
    let _ = output.flush();
    let mut line = String::new();
    match input.read_line(&mut line) {
        Ok(0) | Err(_) => InterruptChoice::Abort,
        Ok(_) => InterruptChoice::Save,
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Cursor;

    use clap::error::ErrorKind;

    use super::*;

    #[test]
    fn parses_defaults() {
        let run = try_command_from_iter(["depnet"]).expect("valid command");

        assert_eq!(run.model_kind, ModelKind::Parser);
        assert!(!run.pretrain);
        assert!(!run.test);
        assert!(!run.load);
        assert!(!run.force);
        assert_eq!(run.config_file, None);
        assert_eq!(run.save_dir, None);
        assert!(run.overrides.is_empty());
    }

    #[test]
    fn parses_mode_flags_and_paths() {
        let run = try_command_from_iter([
            "depnet",
            "--pretrain",
            "--model",
            "tagger",
            "--config-file",
            "runs/tagger.toml",
            "--save-dir",
            "saves/tagger",
            "--force",
        ])
        .expect("valid command");

        assert!(run.pretrain);
        assert!(run.force);
        assert_eq!(run.model_kind, ModelKind::Tagger);
        assert_eq!(run.config_file, Some(PathBuf::from("runs/tagger.toml")));
        assert_eq!(run.save_dir, Some(PathBuf::from("saves/tagger")));
    }

    #[test]
    fn collects_repeated_overrides_in_order() {
        let run = try_command_from_iter([
            "depnet",
            "--test",
            "--set",
            "training.train_iters=10",
            "--set",
            "os.train_file=data/en.conllu",
        ])
        .expect("valid command");

        assert!(run.test);
        assert_eq!(
            run.overrides,
            vec!["training.train_iters=10", "os.train_file=data/en.conllu"]
        );
    }

    #[test]
    fn rejects_unknown_model() {
        let err = try_command_from_iter(["depnet", "--model", "lstm"]).expect_err("bad model");
        assert_eq!(err.kind(), ErrorKind::InvalidValue);
    }

    #[test]
    fn supports_help_flag() {
        let err = try_command_from_iter(["depnet", "--help"]).expect_err("help exits");
        assert_eq!(err.kind(), ErrorKind::DisplayHelp);
    }

    #[test]
    fn overwrite_prompt_keeps_existing_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("train.conllu"), "1\tword\n").expect("write input");

        let mut shown = Vec::new();
        let confirmed = confirm_overwrite(dir.path(), &mut Cursor::new("\n"), &mut shown)
            .expect("prompt");
        assert!(confirmed);
        assert!(String::from_utf8(shown).expect("utf8").contains("Press <Enter> to overwrite"));
        assert!(dir.path().join("train.conllu").exists());

        let declined = confirm_overwrite(dir.path(), &mut Cursor::new(""), &mut Vec::<u8>::new())
            .expect("prompt");
        assert!(!declined);
    }

    #[test]
    fn save_prompt_saves_on_enter_and_aborts_on_eof() {
        let mut shown = Vec::new();
        assert_eq!(
            ask_save_or_exit(&mut Cursor::new("\n"), &mut shown),
            InterruptChoice::Save
        );
        assert!(String::from_utf8(shown).expect("utf8").contains("Press <Enter> to save"));
        assert_eq!(
            ask_save_or_exit(&mut Cursor::new(""), &mut Vec::<u8>::new()),
            InterruptChoice::Abort
        );
    }
}
