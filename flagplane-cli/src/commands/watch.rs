//! `flagplane watch`: stream snapshots, one compact JSON document per line.

use std::io::Write;

use anyhow::{Context, Result};
use clap::Args;

use flagplane_daemon::watch;

use super::daemon::home;

#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Source id to follow; omitted follows the merged view of all sources.
    #[arg(long)]
    pub selector: Option<String>,

    /// Exit after this many snapshots, the initial one included.
    #[arg(long)]
    pub count: Option<usize>,
}

impl WatchArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let limit = self.count;
        let stdout = std::io::stdout();
        let mut write_failed: Option<std::io::Error> = None;
        let mut seen = 0usize;

        watch(&home, self.selector, |snapshot| {
            let mut out = stdout.lock();
            if let Err(err) = writeln!(out, "{snapshot}").and_then(|_| out.flush()) {
                write_failed = Some(err);
                return false;
            }
            seen += 1;
            limit.map_or(true, |limit| seen < limit)
        })
        .context("watch stream failed")?;

        if let Some(err) = write_failed {
            return Err(err).context("failed to write snapshot to stdout");
        }
        Ok(())
    }
}
