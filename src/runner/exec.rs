use anyhow::{Context, Result};
use std::cmp::min;
use std::io::{self, ErrorKind};
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const MAX_POLL_DELAY: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExecStatus {
    /// The process exited on its own, `None` means that it was killed by a signal
    Exited(Option<i32>),
    /// The process was killed after running past the deadline
    TimedOut,
    /// The process was killed because the run was cancelled
    Cancelled,
}

/// Kill a child along with every process in its process group
/// Falls back to killing only the child when it doesn't lead a group of its own.
fn kill_process_group(child: &mut Child) -> io::Result<()> {
    #[cfg(unix)]
    if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
        // SAFETY: killpg only sends a signal and doesn't touch memory
        if unsafe { libc::killpg(pgid, libc::SIGKILL) } == 0 {
            return Ok(());
        }
    }

    // An InvalidInput error means that the process exited after the last check
    match child.kill() {
        Err(err) if err.kind() == ErrorKind::InvalidInput => Ok(()),
        result => result,
    }
}

fn kill_and_reap(child: &mut Child) -> Result<()> {
    kill_process_group(child).context("Failed to kill engine process")?;
    child.wait().context("Failed to reap engine process")?;
    Ok(())
}

// Check the status of the process until it exits, the timeout elapses or `cancelled` is set
// The poll interval starts small so that quick scripts return quickly and backs off to avoid spinning on slow ones.
pub fn wait_with_timeout(
    child: &mut Child,
    timeout: Duration,
    cancelled: &AtomicBool,
) -> Result<ExecStatus> {
    let deadline = Instant::now() + timeout;
    let mut poll_interval = Duration::from_millis(1);
    loop {
        // Try to read the process' exit status without blocking
        if let Some(status) = child
            .try_wait()
            .context("Failed to get engine process status")?
        {
            return Ok(ExecStatus::Exited(status.code()));
        }

        if cancelled.load(Ordering::Relaxed) {
            kill_and_reap(child)?;
            return Ok(ExecStatus::Cancelled);
        }

        let now = Instant::now();
        if now >= deadline {
            kill_and_reap(child)?;
            return Ok(ExecStatus::TimedOut);
        }

        poll_interval = min(poll_interval * 2, MAX_POLL_DELAY);
        thread::sleep(min(poll_interval, deadline - now));
    }
}
