//! flagplane: feature-flag daemon CLI.
//!
//! # Usage
//!
//! ```text
//! flagplane start [--uri <FILE>]...
//! flagplane stop
//! flagplane status
//! flagplane resolve <flag> [--flag-set <id>] [--kind boolean|number|string|object]
//! flagplane flags [--source <id>] [--table]
//! flagplane watch [--selector <id>] [--count <n>]
//! flagplane reload [--source <id>]
//! flagplane validate <FILE> [--json]
//! ```

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    daemon::{ReloadArgs, StartArgs},
    flags::FlagsArgs,
    resolve::ResolveArgs,
    validate::ValidateArgs,
    watch::WatchArgs,
};

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "flagplane",
    version,
    about = "Serve feature flags from local files over a Unix socket",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daemon in the foreground.
    Start(StartArgs),

    /// Request graceful daemon shutdown.
    Stop,

    /// Query daemon runtime status.
    Status,

    /// Resolve a flag to its default variant.
    Resolve(ResolveArgs),

    /// Print the cached flag snapshot, globally or for one source.
    Flags(FlagsArgs),

    /// Stream flag snapshots as they are published.
    Watch(WatchArgs),

    /// Re-read source files now instead of waiting for the file watcher.
    Reload(ReloadArgs),

    /// Parse and validate a flag document without a running daemon.
    Validate(ValidateArgs),
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Start(args) => args.run(),
        Commands::Stop => commands::daemon::stop(),
        Commands::Status => commands::daemon::status(),
        Commands::Resolve(args) => args.run(),
        Commands::Flags(args) => args.run(),
        Commands::Watch(args) => args.run(),
        Commands::Reload(args) => args.run(),
        Commands::Validate(args) => args.run(),
    }
}
