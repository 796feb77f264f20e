use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use rootsim_core::abi::DynModel;
use rootsim_core::config::SimConfig;
use rootsim_core::Kernel;

#[derive(Parser, Debug)]
#[command(name = "rootsim")]
#[command(about = "ROOT-Sim: a parallel discrete-event Time Warp simulator kernel")]
struct Args {
    /// Number of worker threads.
    #[arg(long, value_name = "N")]
    np: Option<usize>,
    /// Number of logical processes.
    #[arg(long, value_name = "N")]
    lp: Option<usize>,
    /// Model configuration file, either TOML run parameters or both
    /// run parameters and model-specific settings the loaded model
    /// parses itself from the argv-tail.
    #[arg(long, value_name = "PATH")]
    input: Option<PathBuf>,
    /// Wall-clock interval between GVT rounds, in milliseconds.
    #[arg(long, value_name = "MS")]
    gvt_period: Option<u64>,
    /// Checkpoint period in events.
    #[arg(long, value_name = "P")]
    ckpt_period: Option<u32>,
    /// Path to a model compiled as a cdylib exporting the rootsim_*
    /// ABI symbols.
    #[arg(long, value_name = "PATH")]
    model: PathBuf,
    /// Wall-clock deadline for the whole run, in seconds. Absent means
    /// run until every LP terminates.
    #[arg(long, value_name = "SECS")]
    max_seconds: Option<u64>,
    /// Everything after the recognized flags is handed to the model
    /// untouched, NUL-joined, as the INIT event's payload (§6).
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "MODEL_ARGS")]
    model_args: Vec<String>,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err:?}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let mut config = SimConfig::load(args.input.as_deref());
    if let Some(np) = args.np {
        config.np = np;
    }
    if let Some(lp) = args.lp {
        config.lp = lp;
    }
    if let Some(gvt_period) = args.gvt_period {
        config.gvt_period_ms = gvt_period;
    }
    if let Some(ckpt_period) = args.ckpt_period {
        config.ckpt_period = ckpt_period;
    }

    log::info!(
        "starting rootsim: np={} lp={} gvt_period={:?} ckpt_period={}",
        config.np,
        config.lp,
        config.gvt_period(),
        config.ckpt_period
    );

    let model = unsafe { DynModel::load(&args.model) }
        .with_context(|| format!("loading model {}", args.model.display()))?;

    let init_payload = args.model_args.join("\0").into_bytes();

    let kernel = Kernel::new(config, Arc::new(model));
    kernel.run(args.max_seconds.map(Duration::from_secs), &init_payload);

    let metrics = kernel.metrics();
    log::info!(
        "run finished: gvt={} events_committed={} rollbacks={} antimessages_sent={}",
        kernel.gvt(),
        metrics.events_committed,
        metrics.rollbacks,
        metrics.antimessages_sent
    );

    Ok(())
}
