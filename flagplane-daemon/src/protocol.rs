use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{io_err, DaemonError};
use crate::paths::socket_path;

/// JSON newline-delimited request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonRequest {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flag_set: Option<String>,
    /// Expected variant kind for `resolve`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
}

impl DaemonRequest {
    pub fn command(cmd: &str) -> Self {
        Self {
            cmd: cmd.to_string(),
            ..Self::default()
        }
    }
}

/// JSON newline-delimited response.
///
/// A `watch` request is answered with a stream of these, one per snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

fn connect(home: &Path) -> Result<UnixStream, DaemonError> {
    let socket = socket_path(home);
    if !socket.exists() {
        return Err(DaemonError::DaemonNotRunning { socket });
    }

    UnixStream::connect(&socket).map_err(|err| {
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
        ) {
            DaemonError::DaemonNotRunning {
                socket: socket.clone(),
            }
        } else {
            io_err(&socket, err)
        }
    })
}

fn write_request(
    stream: &mut UnixStream,
    home: &Path,
    request: &DaemonRequest,
) -> Result<(), DaemonError> {
    let socket = socket_path(home);
    let payload = serde_json::to_string(request)?;
    stream
        .write_all(payload.as_bytes())
        .map_err(|e| io_err(&socket, e))?;
    stream.write_all(b"\n").map_err(|e| io_err(&socket, e))?;
    stream.flush().map_err(|e| io_err(&socket, e))
}

/// Send one JSON request to the daemon socket and return one response.
pub fn send_request(home: &Path, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
    let mut stream = connect(home)?;
    write_request(&mut stream, home, request)?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .map_err(|e| io_err(socket_path(home), e))?;
    if read == 0 {
        return Err(DaemonError::Protocol(
            "daemon closed connection before responding".to_string(),
        ));
    }

    let response: DaemonResponse = serde_json::from_str(line.trim_end())?;
    Ok(response)
}

pub fn request_status(home: &Path) -> Result<Value, DaemonError> {
    let request = DaemonRequest::command("status");

    let mut last_not_running: Option<DaemonError> = None;
    for attempt in 0..5 {
        match send_request(home, &request) {
            Ok(response) => return response_into_data(response),
            Err(err @ DaemonError::DaemonNotRunning { .. }) => {
                last_not_running = Some(err);
                if attempt < 4 {
                    sleep(Duration::from_millis(100));
                    continue;
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_not_running.unwrap_or_else(|| {
        DaemonError::Protocol("daemon status retry loop exited unexpectedly".to_string())
    }))
}

pub fn request_stop(home: &Path) -> Result<(), DaemonError> {
    let response = send_request(home, &DaemonRequest::command("stop"))?;
    response_into_data(response).map(|_| ())
}

/// Resolve `flag` to its default variant.
pub fn request_resolve(
    home: &Path,
    flag: &str,
    flag_set: Option<String>,
    kind: Option<String>,
) -> Result<Value, DaemonError> {
    let request = DaemonRequest {
        flag: Some(flag.to_string()),
        flag_set,
        kind,
        ..DaemonRequest::command("resolve")
    };
    response_into_data(send_request(home, &request)?)
}

/// Cached snapshot for one source, or the global one when `source` is `None`.
pub fn request_flags(home: &Path, source: Option<String>) -> Result<Value, DaemonError> {
    let request = DaemonRequest {
        source,
        ..DaemonRequest::command("flags")
    };
    response_into_data(send_request(home, &request)?)
}

/// Ask the daemon to re-read one source, or every source when `None`.
pub fn request_reload(home: &Path, source: Option<String>) -> Result<Value, DaemonError> {
    let request = DaemonRequest {
        source,
        ..DaemonRequest::command("reload")
    };
    response_into_data(send_request(home, &request)?)
}

/// Subscribe to snapshots and hand each one to `on_snapshot`.
///
/// The first snapshot is the current state. Returns when `on_snapshot`
/// returns `false` or the daemon closes the stream; the count of delivered
/// snapshots is returned.
pub fn watch(
    home: &Path,
    selector: Option<String>,
    mut on_snapshot: impl FnMut(Value) -> bool,
) -> Result<usize, DaemonError> {
    let mut stream = connect(home)?;
    let request = DaemonRequest {
        selector,
        ..DaemonRequest::command("watch")
    };
    write_request(&mut stream, home, &request)?;

    let mut reader = BufReader::new(stream);
    let mut delivered = 0usize;
    let mut line = String::new();
    loop {
        line.clear();
        let read = reader
            .read_line(&mut line)
            .map_err(|e| io_err(socket_path(home), e))?;
        if read == 0 {
            return Ok(delivered);
        }
        let response: DaemonResponse = serde_json::from_str(line.trim_end())?;
        let snapshot = response_into_data(response)?;
        delivered += 1;
        if !on_snapshot(snapshot) {
            return Ok(delivered);
        }
    }
}

fn response_into_data(response: DaemonResponse) -> Result<Value, DaemonError> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(DaemonError::Protocol(
            response
                .error
                .unwrap_or_else(|| "unknown daemon error".to_string()),
        ))
    }
}
