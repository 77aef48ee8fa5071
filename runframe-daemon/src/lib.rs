//! runframe daemon: sync client + render orchestrator + control socket.

mod error;
pub mod paths;
pub mod protocol;
mod runtime;

pub use error::DaemonError;
pub use protocol::{
    request_edit, request_engine, request_files, request_run, request_shutdown, request_status, request_stop,
    request_upsert, send_request, DaemonRequest, DaemonResponse,
};
pub use runtime::{init_tracing, run, serve, start_blocking, Daemon, StartOptions};
