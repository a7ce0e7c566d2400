//! flagplane daemon runtime: file sources + watcher + reload processor +
//! socket server, all sharing one flag store and one sync multiplexer.

mod error;
pub mod paths;
pub mod protocol;
mod runtime;
pub mod source;

pub use error::DaemonError;
pub use protocol::{
    request_flags, request_reload, request_resolve, request_status, request_stop, send_request, watch,
    DaemonRequest, DaemonResponse,
};
pub use runtime::{run, start_blocking, ReloadSummary, ReloadTimestamps};
pub use source::{FileSource, LoadReport};
