//! `flagplane flags`: print the multiplexer's cached snapshot.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde_json::Value;
use tabled::{settings::Style, Table, Tabled};

use flagplane_core::types::FLAG_SET_ID_KEY;
use flagplane_core::Flag;
use flagplane_daemon::request_flags;

use super::daemon::home;

#[derive(Args, Debug)]
pub struct FlagsArgs {
    /// Only flags served by this source id.
    #[arg(long)]
    pub source: Option<String>,

    /// Render a table instead of the raw snapshot JSON.
    #[arg(long)]
    pub table: bool,
}

impl FlagsArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let snapshot = request_flags(&home, self.source.clone()).with_context(|| match &self.source {
            Some(source) => format!("failed to fetch flags for source '{source}'"),
            None => "failed to fetch flags".to_string(),
        })?;

        if !self.table {
            println!(
                "{}",
                serde_json::to_string_pretty(&snapshot).context("failed to render flags JSON")?
            );
            return Ok(());
        }

        let rows = snapshot_rows(&snapshot)?;
        if rows.is_empty() {
            println!("{}", "no flags".bright_black());
            return Ok(());
        }
        let count = rows.len();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        println!("{count} flag(s)");
        Ok(())
    }
}

#[derive(Tabled)]
pub(crate) struct FlagRow {
    #[tabled(rename = "flag")]
    pub key: String,
    #[tabled(rename = "state")]
    pub state: String,
    #[tabled(rename = "default")]
    pub default_variant: String,
    #[tabled(rename = "kind")]
    pub kind: String,
    #[tabled(rename = "flag set")]
    pub flag_set: String,
    #[tabled(rename = "source")]
    pub source: String,
}

impl FlagRow {
    pub(crate) fn new(key: &str, flag: &Flag) -> Self {
        let flag_set = flag
            .metadata
            .get(FLAG_SET_ID_KEY)
            .and_then(Value::as_str)
            .unwrap_or_default();
        Self {
            key: key.to_string(),
            state: flag.state.clone(),
            default_variant: flag.default_variant.clone(),
            kind: flag
                .variant_kind()
                .map(|kind| kind.to_string())
                .unwrap_or_else(|| "mixed".to_string()),
            flag_set: or_dash(flag_set),
            source: or_dash(&flag.source),
        }
    }
}

fn snapshot_rows(snapshot: &Value) -> Result<Vec<FlagRow>> {
    let Some(flags) = snapshot.get("flags").and_then(Value::as_object) else {
        return Ok(Vec::new());
    };
    flags
        .iter()
        .map(|(key, raw)| {
            let flag: Flag = serde_json::from_value(raw.clone())
                .with_context(|| format!("daemon returned malformed flag '{key}'"))?;
            Ok(FlagRow::new(key, &flag))
        })
        .collect()
}

fn or_dash(value: &str) -> String {
    if value.is_empty() {
        "-".to_string()
    } else {
        value.to_string()
    }
}

pub(crate) fn state_label(state: &str) -> String {
    match state {
        "ENABLED" => state.green().bold().to_string(),
        "DISABLED" => state.red().bold().to_string(),
        other => other.yellow().to_string(),
    }
}
