use std::path::{Path, PathBuf};

pub use runframe_core::config::runframe_root;

pub const DAEMON_SOCKET: &str = "daemon.sock";

pub fn run_dir(home: &Path) -> PathBuf {
    runframe_root(home).join("run")
}

pub fn socket_path(home: &Path) -> PathBuf {
    run_dir(home).join(DAEMON_SOCKET)
}
