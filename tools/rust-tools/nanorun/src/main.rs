use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nanorun_compute::LaunchEnv;
use nanorun_logging::{logging, LogOutput};
use nanorun_topology::{PlanDigest, TrainingHorizon, TrainingPlan};
use serde::Serialize;

mod agreement;
mod args;
mod init;
mod spawn;
#[cfg(test)]
mod testing;

use args::{InitArgs, PlanCommandArgs, SpawnArgs};

#[derive(Parser, Debug)]
#[command(name = "nanorun")]
#[command(about = "Bootstraps multi-process training runs and resolves their topology")]
struct Args {
    /// Where log lines go
    #[clap(long, env = "NANORUN_LOGS", value_enum, default_value_t = LogOutput::Console, global = true)]
    logs: LogOutput,

    /// Also append detailed logs to this file
    #[clap(long, env = "NANORUN_WRITE_LOG_FILE", global = true)]
    write_log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Resolves the training plan for a given world size and prints it.
    Plan(PlanCommandArgs),

    /// Bootstraps this process from the launcher environment, resolves the
    /// plan and checks that every rank agrees on it.
    Init(InitArgs),

    /// Starts `--nproc-per-node` local ranks of `nanorun init`.
    Spawn(SpawnArgs),

    // Prints the help, optionally as markdown. Used for docs generation.
    #[clap(hide = true)]
    PrintAllHelp {
        #[arg(long, required = true)]
        markdown: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    if let Commands::PrintAllHelp { markdown } = args.command {
        // This is a required argument for the time being.
        assert!(markdown);

        let () = clap_markdown::print_help_markdown::<Args>();

        return Ok(());
    }

    // a partial launcher environment is reported by `init`, not here
    let rank = LaunchEnv::from_process_env()
        .ok()
        .and_then(|launch| launch.signals().map(|signals| signals.rank));
    logging()
        .with_output(args.logs)
        .with_log_file(args.write_log_file)
        .with_rank(rank)
        .init()?;

    match args.command {
        Commands::Plan(plan_args) => plan(plan_args),
        Commands::Init(init_args) => init::run(init_args),
        Commands::Spawn(spawn_args) => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?
            .block_on(spawn::run(spawn_args)),
        Commands::PrintAllHelp { .. } => Ok(()),
    }
}

#[derive(Serialize)]
struct PlanReport {
    plan: TrainingPlan,
    num_params: u128,
    flops_per_token: u128,
    horizon: TrainingHorizon,
    digest: String,
}

fn plan(args: PlanCommandArgs) -> Result<()> {
    let request = args.plan.request()?;
    let plan = request
        .resolve(args.world_size)
        .context("invalid training topology")?;
    let horizon = plan
        .horizon(&request.horizon)
        .context("invalid training horizon")?;
    // same digest `init` agrees on
    let digest = PlanDigest::of(&(plan, horizon))?;

    if args.json {
        let report = PlanReport {
            plan,
            num_params: plan.num_params(),
            flops_per_token: plan.flops_per_token(),
            horizon,
            digest: digest.to_string(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{plan}");
        println!("{horizon}");
        println!("digest {digest}");
    }
    Ok(())
}
