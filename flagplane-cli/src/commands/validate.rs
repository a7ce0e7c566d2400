//! `flagplane validate`: parse a flag document offline and summarize it.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde_json::json;
use tabled::{settings::Style, Table};

use flagplane_core::document::{DocumentFormat, FlagDocument};

use super::flags::{state_label, FlagRow};

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Flag document (.json, .yaml or .yml).
    pub file: PathBuf,

    /// Emit the parsed flags as JSON.
    #[arg(long)]
    pub json: bool,
}

impl ValidateArgs {
    pub fn run(self) -> Result<()> {
        let content = fs::read_to_string(&self.file)
            .with_context(|| format!("failed to read {}", self.file.display()))?;
        let format = DocumentFormat::from_path(&self.file);
        let document = FlagDocument::parse(&content, format)
            .with_context(|| format!("{} is not a valid flag document", self.file.display()))?;

        if self.json {
            let payload = json!({
                "valid": true,
                "file": self.file.display().to_string(),
                "flags": document.flags,
                "metadata": document.metadata,
            });
            println!(
                "{}",
                serde_json::to_string_pretty(&payload).context("failed to render document JSON")?
            );
            return Ok(());
        }

        println!(
            "{} {} ({} flag(s))",
            "valid".green().bold(),
            self.file.display(),
            document.flags.len()
        );
        if document.flags.is_empty() {
            return Ok(());
        }

        let disabled = document
            .flags
            .values()
            .filter(|flag| flag.state == "DISABLED")
            .count();
        if disabled > 0 {
            println!("{disabled} {}", state_label("DISABLED"));
        }

        let rows: Vec<FlagRow> = document
            .flags
            .iter()
            .map(|(key, flag)| FlagRow::new(key, flag))
            .collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}
