//! xln-node — operational CLI over the XLN core.
//!
//! Commands:
//!   snapshot      Recover state and write a fresh snapshot
//!   state-hashes  Print per-replica state hashes (divergence detection)
//!   replay-wal    Rebuild state from snapshot + WAL and print the root
//!   verify-wal    Checksum sweep over the log
//!
//! Exit code 0 on success, non-zero on any integrity violation.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;

use xln_core::HashSigner;
use xln_storage::{recover, verify_integrity, wal_path, SnapshotStore};

#[derive(Parser, Debug)]
#[command(
    name = "xln-node",
    version,
    about = "XLN node tooling — snapshots, state hashes, WAL verification"
)]
struct Args {
    /// Directory holding the WAL and snapshots.
    #[arg(long, default_value = "~/.xln/data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Recover the current state and write a snapshot of it.
    Snapshot {
        /// Override the snapshot height label (defaults to the highest
        /// committed entity height).
        #[arg(long)]
        height: Option<u64>,
    },

    /// Print each replica's state hash, sorted by replica key.
    StateHashes,

    /// Replay the WAL over the newest snapshot and print the state root.
    ReplayWal,

    /// Recompute every WAL entry checksum.
    VerifyWal,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".parse().expect("static filter")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let data_dir = expand_tilde(&args.data_dir);

    match args.command {
        Command::Snapshot { height } => {
            let recovered =
                recover(&data_dir, &HashSigner).context("recovering state before snapshot")?;
            let height = height.unwrap_or_else(|| {
                recovered
                    .replicas
                    .values()
                    .map(|r| r.current_height)
                    .max()
                    .unwrap_or(0)
            });
            let store = SnapshotStore::new(&data_dir).context("opening snapshot store")?;
            let now = chrono::Utc::now().timestamp();
            let path = store
                .write(height, now, &recovered.replicas)
                .context("writing snapshot")?;
            info!(height, "snapshot complete");
            println!("{}", path.display());
        }

        Command::StateHashes => {
            let recovered = recover(&data_dir, &HashSigner).context("recovering state")?;
            for (key, replica) in &recovered.replicas {
                println!("{key} {}", hex::encode(replica.state_hash()));
            }
        }

        Command::ReplayWal => {
            let recovered = recover(&data_dir, &HashSigner).context("replaying wal")?;
            info!(
                snapshot_height = recovered.snapshot_height,
                replayed = recovered.replayed,
                "replay finished"
            );
            println!("{}", hex::encode(recovered.state_root));
        }

        Command::VerifyWal => {
            let path = wal_path(&data_dir);
            if !verify_integrity(&path).context("verifying wal")? {
                bail!("wal integrity check failed: {}", path.display());
            }
            println!("ok");
        }
    }
    Ok(())
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.to_path_buf()
}
