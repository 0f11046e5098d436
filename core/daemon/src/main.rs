//! Attendance daemon entrypoint.
//!
//! A single-writer service that owns "who is inside": a Unix socket
//! listener with strict request validation, the in-memory attendance engine,
//! a SQLite session history, and the nightly sweep thread.

use fs_err as fs;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use attendance_protocol::{
    ErrorInfo, Request, Response, ERROR_TOO_MANY_CONNECTIONS, MAX_REQUEST_BYTES,
};

mod config;
mod db;
mod directory;
mod engine;
mod error;
mod handlers;
mod scan_log;
mod session_store;
mod snapshot;
mod state;
mod sweep;

use config::{DaemonConfig, DaemonPaths};
use state::SharedState;
use sweep::{SweepScheduler, SweepTracker};

const READ_TIMEOUT_SECS: u64 = 2;
const WRITE_TIMEOUT_SECS: u64 = 1;
const READ_CHUNK_SIZE: usize = 4096;
const MAX_ACTIVE_CONNECTIONS: usize = 64;
const LOG_FILE_PREFIX: &str = "attendance-daemon.log";

fn main() {
    let loaded = config::load_config(None);
    let log_dir = loaded
        .as_ref()
        .ok()
        .and_then(|config| config.log_dir.clone());
    let _log_guard = init_logging(log_dir.as_deref());

    let config = loaded.unwrap_or_else(|err| {
        warn!(error = %err, "Failed to load daemon config; using defaults");
        DaemonConfig::default()
    });
    run(config);
}

fn run(config: DaemonConfig) {
    let home = match config::home_dir() {
        Ok(home) => home,
        Err(err) => {
            error!(error = %err, "Failed to resolve home directory");
            std::process::exit(1);
        }
    };
    let paths = DaemonPaths::resolve(&config, &home);

    let sweep_at = config.sweep.time_of_day_or_default();
    let tracker = SweepTracker::new(config.sweep.enabled, sweep_at);

    // Storage comes up before the socket so no client reaches a half-started daemon.
    let opened = SharedState::open(paths.clone(), config.scan_history_len, tracker.clone());
    let shared_state = match opened {
        Ok(state) => Arc::new(state),
        Err(err) => {
            error!(
                error = %err,
                data_dir = %paths.data_dir.display(),
                "Failed to initialize attendance state"
            );
            std::process::exit(1);
        }
    };

    if config.sweep.enabled {
        let scheduler = SweepScheduler::new(shared_state.engine(), sweep_at, tracker);
        if let Err(err) = scheduler.spawn() {
            error!(error = %err, "Failed to start sweep scheduler");
            std::process::exit(1);
        }
    } else {
        info!("Nightly sweep disabled by config");
    }

    let socket_path = paths.socket.clone();
    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    info!(
        path = %socket_path.display(),
        data_dir = %paths.data_dir.display(),
        "Attendance daemon started"
    );

    let active = Arc::new(AtomicUsize::new(0));
    for stream in listener.incoming() {
        match stream {
            Ok(mut stream) => {
                let Some(slot) = ConnectionSlot::acquire(&active) else {
                    shared_state.record_rejected_connection();
                    warn!(limit = MAX_ACTIVE_CONNECTIONS, "Rejecting connection; limit reached");
                    let response = Response::error(
                        None,
                        ERROR_TOO_MANY_CONNECTIONS,
                        "daemon is at its connection limit",
                    );
                    let _ = write_response(&mut stream, response);
                    continue;
                };
                let state = Arc::clone(&shared_state);
                thread::spawn(move || {
                    let _slot = slot;
                    handle_connection(stream, &state);
                });
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }

    // `incoming()` only ends if the listener fails for good and no signal is
    // trapped, so in practice this flush does not run. Every mutation already
    // rewrites the snapshot, so a killed daemon restarts with current state.
    if let Err(err) = shared_state.engine().shutdown() {
        warn!(error = %err, "Failed to flush live snapshot on shutdown");
    }
}

/// Counts one in-flight connection; released on drop.
struct ConnectionSlot {
    active: Arc<AtomicUsize>,
}

impl ConnectionSlot {
    fn acquire(active: &Arc<AtomicUsize>) -> Option<Self> {
        let previous = active.fetch_add(1, Ordering::AcqRel);
        if previous >= MAX_ACTIVE_CONNECTIONS {
            active.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(Self {
            active: Arc::clone(active),
        })
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

fn init_logging(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let debug_enabled = env::var("ATTENDANCE_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    let mut setup_error = None;
    let (file_layer, guard) = match log_dir {
        Some(dir) => match fs::create_dir_all(dir) {
            Ok(()) => {
                let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
                let (writer, guard) = tracing_appender::non_blocking(appender);
                let layer = tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_thread_names(true)
                    .boxed();
                (Some(layer), Some(guard))
            }
            Err(err) => {
                setup_error = Some(format!("log dir init failed for {}: {}", dir.display(), err));
                (None, None)
            }
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();

    if let Some(err) = setup_error {
        warn!("{}", err);
    }
    guard
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, state: &SharedState) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    tracing::debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    let response = handlers::handle_request(request, state);
    let _ = write_response(&mut stream, response);
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    let request_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => {
            if buffer[index + 1..].iter().any(|b| !b.is_ascii_whitespace()) {
                warn!("Extra bytes detected after newline; ignoring trailing data");
            }
            &buffer[..index]
        }
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    stream.set_write_timeout(Some(Duration::from_secs(WRITE_TIMEOUT_SECS)))?;
    serde_json::to_writer(&mut *stream, &response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
