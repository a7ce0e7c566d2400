use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DAEMON_SOCKET: &str = "flagplane.sock";

pub fn flagplane_root(home: &Path) -> PathBuf {
    home.join(".flagplane")
}

pub fn run_dir(home: &Path) -> PathBuf {
    flagplane_root(home).join("run")
}

pub fn socket_path(home: &Path) -> PathBuf {
    flagplane_root(home).join(DAEMON_SOCKET)
}

pub fn config_path(home: &Path) -> PathBuf {
    flagplane_core::config::config_path_at(home)
}

pub fn debounce_window(debounce_ms: u64) -> Duration {
    Duration::from_millis(debounce_ms)
}
