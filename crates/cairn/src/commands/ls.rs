//! List indexed entries

use clap::Args;
use tracing::info;

use cairn::{TreeIndex, format::listing_line};

use super::TreeArgs;

/// List indexed entries in path order
#[derive(Args, Debug)]
pub struct LsArgs {
    #[command(flatten)]
    tree: TreeArgs,

    /// Also print each entry's content id
    #[arg(long, short = 'i')]
    ids: bool,
}

pub fn run(args: LsArgs) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let root = args.tree.root.canonicalize()?;
    let index = TreeIndex::open(&root, args.tree.config())?;
    info!(?root, entries = index.len(), "Listing");

    for record in index.records() {
        if args.ids {
            let cid = record.cid.as_ref().map(ToString::to_string);
            println!("{} {}", listing_line(record), cid.as_deref().unwrap_or("-"));
        } else {
            println!("{}", listing_line(record));
        }
    }

    Ok(())
}
