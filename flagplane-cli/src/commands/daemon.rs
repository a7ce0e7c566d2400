//! `flagplane start|stop|status|reload`: daemon lifecycle over the Unix socket.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use flagplane_daemon::paths::socket_path;
use flagplane_daemon::{request_reload, request_status, request_stop, start_blocking, DaemonError};

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Extra source file to serve, after those in ~/.flagplane/config.yaml.
    /// Repeat for several; later sources win same-key ties.
    #[arg(long = "uri", value_name = "FILE")]
    pub uris: Vec<PathBuf>,
}

impl StartArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        start_blocking(&home, self.uris).context("daemon exited with error")
    }
}

#[derive(Args, Debug)]
pub struct ReloadArgs {
    /// Only reload this source id.
    #[arg(long)]
    pub source: Option<String>,
}

impl ReloadArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let summaries = request_reload(&home, self.source).context("failed to reload sources")?;
        println!(
            "{}",
            serde_json::to_string_pretty(&summaries).context("failed to render reload JSON")?
        );
        Ok(())
    }
}

pub fn stop() -> Result<()> {
    let home = home()?;
    match request_stop(&home) {
        Ok(()) => println!("daemon stop requested"),
        Err(DaemonError::DaemonNotRunning { .. }) => {
            println!("daemon is not running");
        }
        Err(err) => return Err(err).context("failed to stop daemon"),
    }
    Ok(())
}

pub fn status() -> Result<()> {
    let home = home()?;
    let payload = match request_status(&home) {
        Ok(status) => status,
        Err(DaemonError::DaemonNotRunning { .. }) => serde_json::json!({
            "running": false,
            "socket": socket_path(&home).display().to_string(),
        }),
        Err(err) => return Err(err).context("failed to query daemon status"),
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&payload).context("failed to render daemon status JSON")?
    );
    Ok(())
}

pub(crate) fn home() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}
