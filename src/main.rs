use std::io;
use std::process;
use std::thread;

use anyhow::{Context, bail};
use depnet::cli;
use depnet::config::RunConfig;
use depnet::network::{Interrupt, Network, NetworkError, Phase, SignalOutcome};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    init_logger();
    let run = cli::parse_command();
    let mode = if run.test { "test" } else { "train" };
    if let Err(err) = execute(&run) {
        if matches!(err.downcast_ref::<NetworkError>(), Some(NetworkError::Aborted)) {
            tracing::info!("exiting without saving");
            return;
        }
        eprintln!("{mode} failed: {err:#}");
        process::exit(1);
    }
}

fn init_logger() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("depnet=info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .compact(),
        )
        .init();
}

fn execute(run: &RunConfig) -> anyhow::Result<()> {
    let config = run.resolve().context("cannot build the run config")?;
    let save_dir = &config.os.save_dir;
    if !(run.test || run.load || run.force)
        && save_dir.is_dir()
        && !cli::confirm_overwrite(save_dir, &mut io::stdin().lock(), &mut io::stderr())?
    {
        bail!("refusing to reuse {}; pass --force or pick another --save-dir", save_dir.display());
    }

    tracing::info!("*** {} ***", run.model_kind);
    let interrupt = Interrupt::default();
    spawn_interrupt_listener(interrupt.clone());
    let mut handler = || cli::ask_save_or_exit(&mut io::stdin().lock(), &mut io::stderr());

    let mut network = Network::new(run.model_kind, config, interrupt)?;
    if run.test {
        network.mark_head(Phase::Testing)?;
        network.load()?;
        let scores = network.test(false)?;
        print!("{scores}");
        return Ok(());
    }

    if run.load {
        network.mark_head(Phase::Loading)?;
        network.load()?;
    } else {
        network.mark_head(Phase::Training)?;
    }
    if run.pretrain {
        network.pretrain(&mut handler)?;
    }
    network.train(&mut handler)?;
    Ok(())
}

/// Ctrl-C inside a pretrain/train loop is deferred to the loop's save-or-exit
/// prompt; anywhere else, or a second one before the loop reacts, exits.
fn spawn_interrupt_listener(interrupt: Interrupt) {
    thread::spawn(move || {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                tracing::warn!(error = %err, "cannot install the Ctrl-C listener");
                return;
            }
        };
        runtime.block_on(async {
            while tokio::signal::ctrl_c().await.is_ok() {
                if interrupt.signal() == SignalOutcome::Exit {
                    process::exit(130);
                }
            }
        });
    });
}
