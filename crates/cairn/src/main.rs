use clap::{Parser, Subcommand};
use lloggs::LoggingArgs;

mod commands;

#[derive(Parser, Debug)]
#[command(name = "cairn")]
#[command(about = "Content-addressed index of a directory tree")]
struct Args {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    logging: LoggingArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bring the index up to date with the tree and save it
    Refresh(commands::refresh::RefreshArgs),

    /// List indexed entries in path order
    Ls(commands::ls::LsArgs),

    /// List entries whose content appears earlier in the tree
    Dups(commands::dups::DupsArgs),
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();
    let _guard = args.logging.setup(|v| match v {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    })?;

    match args.command {
        Command::Refresh(args) => commands::refresh::run(args),
        Command::Ls(args) => commands::ls::run(args),
        Command::Dups(args) => commands::dups::run(args),
    }
}
