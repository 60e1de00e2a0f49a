//! Starts one worker per device.

use crate::error::{TrainingError, TrainingResult};
use crate::job::WorkerArgs;
use crate::rendezvous::{cleanup_rendezvous, unused_rendezvous_path};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// How to start a worker process: the program plus the arguments that select
/// its worker entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl WorkerCommand {
    /// Re-executes the running binary with `args`.
    pub fn current_exe<I, S>(args: I) -> TrainingResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Ok(Self { program: std::env::current_exe()?, args: args.into_iter().map(Into::into).collect() })
    }
}

/// Runs a training job on every device in `template.devices`.
///
/// A single device runs `inline` in this process as rank 0. Otherwise one
/// worker process per device is spawned, each reading its [`WorkerArgs`] from
/// stdin; the first failing worker takes the others down with it.
pub async fn launch<F>(template: WorkerArgs, command: &WorkerCommand, inline: F) -> TrainingResult<()>
where
    F: FnOnce(WorkerArgs) -> TrainingResult<()>,
{
    let world_size = template.devices.len();
    if world_size <= 1 {
        let args = WorkerArgs { rank: 0, world_size: 1, ..template };
        args.validate()?;
        info!(device = %args.device(), "training in the launching process");
        return inline(args);
    }

    let rendezvous = unused_rendezvous_path(&template.rendezvous_path);
    let template = WorkerArgs { world_size, rendezvous_path: rendezvous.clone(), ..template };
    template.for_rank(0).validate()?;

    let result = run_workers(&template, command).await;
    if let Err(e) = cleanup_rendezvous(&rendezvous) {
        warn!(path = %rendezvous.display(), error = %e, "cannot remove rendezvous files");
    }
    result
}

async fn run_workers(template: &WorkerArgs, command: &WorkerCommand) -> TrainingResult<()> {
    let mut children: Vec<(usize, Child)> = Vec::with_capacity(template.world_size);
    for rank in 0..template.world_size {
        let bundle = serde_json::to_vec(&template.for_rank(rank))?;
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TrainingError::WorkerFailed { rank, reason: format!("spawn failed: {e}") })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| TrainingError::WorkerFailed { rank, reason: "stdin is not piped".to_string() })?;
        stdin.write_all(&bundle).await?;
        stdin.shutdown().await?;
        drop(stdin);

        info!(rank, device = %template.devices[rank], pid = child.id(), "spawned worker");
        children.push((rank, child));
    }

    let mut running = JoinSet::new();
    for (rank, mut child) in children {
        running.spawn(async move { (rank, child.wait().await) });
    }

    while let Some(joined) = running.join_next().await {
        let (rank, status) = joined.map_err(|e| TrainingError::Other(e.into()))?;
        let failure = match status {
            Ok(status) if status.success() => {
                debug!(rank, "worker finished");
                continue;
            }
            Ok(status) => format!("exited with {status}"),
            Err(e) => format!("cannot wait for worker: {e}"),
        };
        warn!(rank, reason = %failure, "worker failed, stopping the others");
        // Dropping the wait futures kills the remaining children.
        running.abort_all();
        while running.join_next().await.is_some() {}
        return Err(TrainingError::WorkerFailed { rank, reason: failure });
    }
    Ok(())
}
