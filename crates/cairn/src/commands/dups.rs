//! Report duplicate content

use std::collections::HashMap;

use clap::Args;
use tracing::info;

use cairn::{ContentId, TreeIndex, format::size_str};

use super::TreeArgs;

/// List entries whose content appears earlier in the tree
#[derive(Args, Debug)]
pub struct DupsArgs {
    #[command(flatten)]
    tree: TreeArgs,
}

pub fn run(args: DupsArgs) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let root = args.tree.root.canonicalize()?;
    let index = TreeIndex::open(&root, args.tree.config())?;

    let mut first_seen: HashMap<&ContentId, &str> = HashMap::new();
    let mut count = 0u64;
    let mut bytes = 0u64;
    for record in index.records() {
        let Some(cid) = &record.cid else {
            continue;
        };
        match first_seen.get(cid) {
            Some(first) => {
                println!("{}\t{}", record.path, first);
                count += 1;
                bytes += record.size;
            }
            None => {
                first_seen.insert(cid, &record.path);
            }
        }
    }

    info!(count, bytes, "Duplicates found");
    eprintln!("{count} duplicates, {} reclaimable", size_str(bytes));
    Ok(())
}
