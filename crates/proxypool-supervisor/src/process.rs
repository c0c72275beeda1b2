//! Supervised child process handle.
//!
//! # Lifecycle
//! ```text
//! ManagedProcess::spawn(bin, args, mode)
//!   → spawns the child with kill_on_drop
//!
//! process.terminate(grace)
//!   → SIGTERM (Unix) / kill request (elsewhere)
//!   → waits up to `grace` for exit
//!   → forced kill + reap if still alive
//! ```

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::{Child, Command};
use tracing::debug;

/// Where the child's stdout/stderr go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Share the parent's stdout/stderr (the live tunnel).
    Inherit,
    /// Send output to the null device (probe instances are noisy).
    Discard,
}

impl OutputMode {
    fn stdio(self) -> Stdio {
        match self {
            Self::Inherit => Stdio::inherit(),
            Self::Discard => Stdio::null(),
        }
    }
}

/// Handle to a spawned child process.
///
/// Dropping the handle issues a non-blocking kill; call [`terminate`](Self::terminate)
/// for the graceful path.
#[derive(Debug)]
pub struct ManagedProcess {
    child: Option<Child>,
    label: String,
}

impl ManagedProcess {
    /// Spawn `program` with `args`.
    pub fn spawn<I, S>(program: &Path, args: I, output: OutputMode) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(output.stdio())
            .stderr(output.stdio())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", program.display()))?;

        let label = program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.display().to_string());
        debug!("spawned {label} (pid {:?})", child.id());

        Ok(Self {
            child: Some(child),
            label,
        })
    }

    /// OS process id, if the child has not been reaped yet.
    pub fn id(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Whether the child is still alive.
    pub fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => child.try_wait().ok().flatten().is_none(),
            None => false,
        }
    }

    /// Ask the child to exit, escalating to a forced kill after `grace`.
    ///
    /// Safe to call repeatedly and on an already-exited child. Never fails.
    pub async fn terminate(&mut self, grace: Duration) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        if let Ok(Some(status)) = child.try_wait() {
            debug!("{} already exited with {status}", self.label);
            return;
        }

        request_exit(&mut child);

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => debug!("{} exited with {status}", self.label),
            Ok(Err(e)) => debug!("failed to wait for {}: {e}", self.label),
            Err(_) => {
                debug!(
                    "{} ignored termination for {}ms, killing",
                    self.label,
                    grace.as_millis()
                );
                if let Err(e) = child.kill().await {
                    debug!("failed to kill {}: {e}", self.label);
                }
            }
        }
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        if let Some(ref mut child) = self.child {
            let _ = child.start_kill();
        }
    }
}

#[cfg(unix)]
fn request_exit(child: &mut Child) {
    match child.id() {
        Some(pid) => {
            // SAFETY: plain signal delivery to a pid we spawned and have not reaped.
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                let _ = child.start_kill();
            }
        }
        None => {
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn request_exit(child: &mut Child) {
    let _ = child.start_kill();
}
