//! Refresh and save the index

use std::time::Duration;

use clap::Args;
use tracing::{info, warn};

use cairn::{
    ProgressTracker, RefreshOptions, RefreshStats, Result as CasResult, TrackerError, TreeIndex,
    format::size_str,
};

use super::TreeArgs;

/// Bring the index up to date with the tree and save it
#[derive(Args, Debug)]
pub struct RefreshArgs {
    #[command(flatten)]
    tree: TreeArgs,

    /// Recompute every content id, not just those of changed entries
    #[arg(long, short)]
    force: bool,

    /// Save the index every this many seconds while recomputing ids
    #[arg(long, value_name = "SECS")]
    checkpoint: Option<u64>,

    /// Do not save the index afterwards
    #[arg(long, short = 'n')]
    dry_run: bool,

    /// Report progress every second
    #[arg(long)]
    progress: bool,
}

pub fn run(args: RefreshArgs) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let root = args.tree.root.canonicalize()?;
    let mut index = TreeIndex::with_config(&root, args.tree.config());
    if !index.load()? {
        info!(?root, "No saved index, scanning from scratch");
    }

    let options = RefreshOptions {
        force: args.force,
        checkpoint: args
            .checkpoint
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs),
    };

    let (index, stats) = if args.progress {
        refresh_in_background(index, options)?
    } else {
        let stats = index.refresh(options);
        (index, stats)
    };
    let stats = stats?;

    if args.dry_run {
        info!("Dry run, not saving");
    } else {
        index.save()?;
    }

    eprintln!("Index of {:?}", root);
    eprintln!("  Entries: {}", index.len());
    eprintln!(
        "  New: {} ({})",
        stats.new_entries,
        size_str(stats.new_bytes)
    );
    eprintln!(
        "  Changed: {} ({})",
        stats.changed_entries,
        size_str(stats.changed_bytes)
    );
    eprintln!(
        "  Vanished: {} ({})",
        stats.vanished_entries,
        size_str(stats.vanished_bytes)
    );
    eprintln!(
        "  Hashed: {} ({})",
        stats.refreshed_entries,
        size_str(stats.refreshed_bytes)
    );
    if stats.failed_entries > 0 {
        eprintln!("  Unresolved: {}", stats.failed_entries);
    }

    Ok(())
}

type Outcome = (TreeIndex, CasResult<RefreshStats>);

fn refresh_in_background(
    index: TreeIndex,
    options: RefreshOptions,
) -> Result<Outcome, Box<dyn std::error::Error + Send + Sync>> {
    let tracker = ProgressTracker::new(move |progress, mut index: TreeIndex| {
        let stats = index.refresh_with_progress(options, progress);
        (index, stats)
    })
    .with_name("refresh");

    match tracker.start(index) {
        Ok(()) => {
            while !tracker.wait(Some(Duration::from_secs(1))) {
                let sample = tracker.sample();
                eprintln!(
                    "{}/{} ({}%) elapsed {}s, about {}s to go",
                    sample.done,
                    sample.steps,
                    sample.percent,
                    sample.elapsed.as_secs(),
                    sample.eta.as_secs()
                );
            }
        }
        // Only a refresh that panicked gets here; take_result reports it.
        Err(TrackerError::ActionFailed) => warn!("Refresh worker failed to start"),
        Err(err) => return Err(err.into()),
    }

    tracker
        .take_result()
        .ok_or_else(|| "refresh worker did not return".into())
}
