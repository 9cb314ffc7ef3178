//! Child process termination
//!
//! Children are started in their own process group so that a terminate
//! signal reaches grandchildren (interpreters spawning helpers) as well.

use std::io;
use std::process::{Child, Command, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Interval between exit checks while waiting for a child.
pub const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How a child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Had already exited before any signal.
    AlreadyExited(ExitStatus),
    /// Exited within the grace period after SIGTERM.
    Graceful(ExitStatus),
    /// Killed after the grace period.
    Forced(ExitStatus),
}

impl Termination {
    pub fn status(&self) -> ExitStatus {
        match *self {
            Self::AlreadyExited(s) | Self::Graceful(s) | Self::Forced(s) => s,
        }
    }

    pub fn was_forced(&self) -> bool {
        matches!(self, Self::Forced(_))
    }
}

/// Put the child in a new process group led by itself.
pub fn isolate_process_group(command: &mut Command) -> &mut Command {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    command
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // Negative pid addresses the whole group; fall back to the leader.
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if kill(Pid::from_raw(-raw), signal).is_ok() {
        return true;
    }
    kill(Pid::from_raw(raw), signal).is_ok()
}

/// SIGKILL whatever remains of the group led by `pgid`.
///
/// Meant for after the leader was reaped: background children it left
/// behind keep pipes open. Returns `true` if anything was signalled.
pub fn kill_group(pgid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        let Ok(raw) = i32::try_from(pgid) else {
            return false;
        };
        kill(Pid::from_raw(-raw), Signal::SIGKILL).is_ok()
    }
    #[cfg(not(unix))]
    {
        let _ = pgid;
        false
    }
}

/// Ask the child to exit.
pub fn request_exit(child: &mut Child) -> io::Result<()> {
    #[cfg(unix)]
    {
        if signal_group(child.id(), nix::sys::signal::Signal::SIGTERM) {
            return Ok(());
        }
        debug!(pid = child.id(), "SIGTERM delivery failed");
        Ok(())
    }
    #[cfg(not(unix))]
    {
        child.kill()
    }
}

/// Kill the child (and its group) immediately.
pub fn force_kill(child: &mut Child) -> io::Result<()> {
    #[cfg(unix)]
    {
        if signal_group(child.id(), nix::sys::signal::Signal::SIGKILL) {
            return Ok(());
        }
    }
    match child.kill() {
        Ok(()) => Ok(()),
        // Already reaped.
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
        Err(e) => Err(e),
    }
}

/// Poll for exit until `deadline`.
pub fn wait_until(child: &mut Child, deadline: Instant) -> io::Result<Option<ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        thread::sleep(EXIT_POLL_INTERVAL.min(deadline - now));
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
pub fn terminate(child: &mut Child, grace: Duration) -> io::Result<Termination> {
    if let Some(status) = child.try_wait()? {
        return Ok(Termination::AlreadyExited(status));
    }
    let pid = child.id();
    request_exit(child)?;
    if let Some(status) = wait_until(child, Instant::now() + grace)? {
        debug!(pid, ?status, "child exited after SIGTERM");
        return Ok(Termination::Graceful(status));
    }
    warn!(pid, grace_ms = grace.as_millis() as u64, "child ignored SIGTERM, killing");
    force_kill(child)?;
    let status = child.wait()?;
    Ok(Termination::Forced(status))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn spawn_sh(script: &str) -> Child {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        isolate_process_group(&mut cmd);
        cmd.spawn().unwrap()
    }

    #[test]
    fn test_already_exited() {
        let mut child = spawn_sh("exit 3");
        thread::sleep(Duration::from_millis(100));
        let t = terminate(&mut child, Duration::from_secs(1)).unwrap();
        assert!(matches!(t, Termination::AlreadyExited(_)));
        assert_eq!(t.status().code(), Some(3));
    }

    #[test]
    fn test_graceful_termination() {
        let mut child = spawn_sh("sleep 30");
        let start = Instant::now();
        let t = terminate(&mut child, Duration::from_secs(2)).unwrap();
        assert!(matches!(t, Termination::Graceful(_)));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_kill_group_reaches_background_children() {
        use std::io::Read;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg("sleep 30 & echo started; exit 0")
            .stdout(std::process::Stdio::piped());
        isolate_process_group(&mut cmd);
        let mut child = cmd.spawn().unwrap();
        let pgid = child.id();
        let mut stdout = child.stdout.take().unwrap();
        assert!(child.wait().unwrap().success());

        assert!(kill_group(pgid));
        // The background sleep held the pipe; EOF proves it is gone.
        let start = Instant::now();
        let mut out = String::new();
        stdout.read_to_string(&mut out).unwrap();
        assert_eq!(out.trim(), "started");
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_forced_termination() {
        let mut child = spawn_sh("trap '' TERM; sleep 30");
        thread::sleep(Duration::from_millis(100));
        let start = Instant::now();
        let t = terminate(&mut child, Duration::from_millis(200)).unwrap();
        assert!(t.was_forced());
        assert!(start.elapsed() < Duration::from_secs(2));
    }
}
