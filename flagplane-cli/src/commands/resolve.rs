//! `flagplane resolve`: default-variant lookup through the daemon.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use flagplane_core::VariantKind;
use flagplane_daemon::request_resolve;

use super::daemon::home;

#[derive(Args, Debug)]
pub struct ResolveArgs {
    /// Flag key.
    pub flag: String,

    /// Flag-set to look in; omitted means the unscoped set.
    #[arg(long)]
    pub flag_set: Option<String>,

    /// Fail unless the value has this kind.
    #[arg(long)]
    pub kind: Option<VariantKind>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl ResolveArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let resolution = request_resolve(
            &home,
            &self.flag,
            self.flag_set,
            self.kind.map(|kind| kind.to_string()),
        )
        .with_context(|| format!("failed to resolve '{}'", self.flag))?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&resolution)
                    .context("failed to render resolution JSON")?
            );
            return Ok(());
        }

        println!(
            "{} = {}  ({} via {})",
            self.flag.bold(),
            resolution["value"].to_string().green(),
            resolution["variant"].as_str().unwrap_or("?"),
            resolution["reason"].as_str().unwrap_or("?").bright_black(),
        );
        Ok(())
    }
}
