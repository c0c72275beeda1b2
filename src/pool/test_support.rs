//! Shared fixtures for the process-backed tests.

use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

/// Executable that accepts glider's arguments and stays alive until signalled.
///
/// Written once per test binary; the directory lives for the whole run.
pub(crate) fn sleeping_glider() -> &'static Path {
    static BINARY: OnceLock<PathBuf> = OnceLock::new();
    BINARY.get_or_init(|| {
        let dir = Box::leak(Box::new(tempfile::tempdir().unwrap()));
        let path = dir.path().join("glider");
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o755)
            .open(&path)
            .unwrap();
        file.write_all(b"#!/bin/sh\nexec sleep 30\n").unwrap();
        file.sync_all().unwrap();
        drop(file);
        // A child forked by a concurrent test may still hold the write handle
        // until it execs; exec of the script fails with ETXTBSY until then.
        std::thread::sleep(Duration::from_millis(100));
        path
    })
}

/// Whether `pid` still names a process (reaped children vanish from /proc).
#[cfg(target_os = "linux")]
pub(crate) fn pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}
