use std::{ffi::OsStr, path::Path, process::Stdio};

use anyhow::{bail, Context, Result};
use futures::future::try_join_all;
use nanorun_compute::{LOCAL_RANK_VAR, MASTER_ADDR_VAR, MASTER_PORT_VAR, RANK_VAR, WORLD_SIZE_VAR};
use tokio::process::Command;
use tracing::{error, info};

use crate::args::SpawnArgs;

/// Starts one `nanorun init` per local rank and waits for all of them.
pub async fn run(args: SpawnArgs) -> Result<()> {
    let exe = std::env::current_exe().context("could not locate the nanorun executable")?;
    let world_size = args.nproc_per_node as usize;

    info!(
        world_size,
        master_addr = %args.master_addr,
        master_port = args.master_port,
        "starting local ranks"
    );

    let commands = (0..world_size).map(|rank| {
        let mut cmd = rank_command(&exe, rank, world_size, &args);
        cmd.arg("init").args(&args.init_args);
        cmd
    });
    run_ranks(commands).await
}

/// A command for `rank` with the launcher variables set, IO forwarded, and
/// killed when dropped.
fn rank_command(
    program: impl AsRef<OsStr>,
    rank: usize,
    world_size: usize,
    args: &SpawnArgs,
) -> Command {
    let mut cmd = Command::new(program);
    cmd.env(RANK_VAR, rank.to_string())
        .env(LOCAL_RANK_VAR, rank.to_string())
        .env(WORLD_SIZE_VAR, world_size.to_string())
        .env(MASTER_ADDR_VAR, &args.master_addr)
        .env(MASTER_PORT_VAR, args.master_port.to_string())
        // forward IO for logging
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    cmd
}

/// Waits for every rank. The first rank to fail drops the rest, which kills
/// their processes.
async fn run_ranks(commands: impl IntoIterator<Item = Command>) -> Result<()> {
    let ranks = commands
        .into_iter()
        .enumerate()
        .map(|(rank, cmd)| run_rank(rank, cmd));

    match try_join_all(ranks).await {
        Ok(_) => {
            info!("all ranks completed successfully");
            Ok(())
        }
        Err(e) => bail!("aborted the run: {e:#}"),
    }
}

async fn run_rank(rank: usize, mut cmd: Command) -> Result<()> {
    let program = Path::new(cmd.as_std().get_program()).display().to_string();
    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to start rank {rank} ({program})"))?;
    let exit_status = child
        .wait()
        .await
        .with_context(|| format!("failed to wait for rank {rank}"))?;

    if exit_status.success() {
        info!(rank, "rank exited cleanly");
        Ok(())
    } else {
        error!(rank, "rank failed with exit code: {:?}", exit_status.code());
        bail!("rank {rank} failed ({exit_status})")
    }
}
