use std::path::PathBuf;

use clap::Args;

use cairn::{DEFAULT_METADATA, TreeConfig};

pub mod dups;
pub mod ls;
pub mod refresh;

/// Which tree to work on and where its index lives.
#[derive(Args, Debug)]
pub struct TreeArgs {
    /// Root of the tree
    #[arg(default_value = ".")]
    pub root: PathBuf,

    /// Metadata file, relative to the root unless absolute
    #[arg(long, default_value = DEFAULT_METADATA)]
    pub metadata: PathBuf,
}

impl TreeArgs {
    pub fn config(&self) -> TreeConfig {
        TreeConfig {
            metadata: self.metadata.clone(),
            ..TreeConfig::default()
        }
    }
}
