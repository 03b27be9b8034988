use log::warn;
use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use simple_error::{bail, try_with};

use crate::result::Result;

/// A child that called `PTRACE_TRACEME` and is traced by us.
///
/// Dropping a tracee that was not reaped yet kills it and collects its exit
/// status, so no traced zombie outlives the tracer.
pub struct Tracee {
    pub pid: Pid,
    reaped: bool,
}

impl Tracee {
    #[must_use]
    pub fn new(pid: Pid) -> Tracee {
        Tracee { pid, reaped: false }
    }

    /// Report syscall stops as `SIGTRAP | 0x80` and enable seccomp stops.
    pub fn set_options(&self) -> Result<()> {
        try_with!(
            ptrace::setoptions(
                self.pid,
                Options::PTRACE_O_TRACESYSGOOD | Options::PTRACE_O_TRACESECCOMP
            ),
            "cannot set ptrace options"
        );
        Ok(())
    }

    pub fn syscall(&self) -> Result<()> {
        try_with!(
            ptrace::syscall(self.pid, None),
            "cannot set break on syscall with ptrace"
        );
        Ok(())
    }

    /// Next state change of the tracee. Once it exited or was killed it
    /// counts as reaped.
    pub fn wait(&mut self) -> Result<WaitStatus> {
        let status = loop {
            match waitpid(self.pid, None) {
                Err(Errno::EINTR) => continue,
                res => break try_with!(res, "failed to waitpid on tracee {}", self.pid),
            }
        };
        match status.pid() {
            Some(pid) if pid == self.pid => {}
            other => bail!("waitpid for {} returned {:?}", self.pid, other),
        }
        if let WaitStatus::Exited(..) | WaitStatus::Signaled(..) = status {
            self.reaped = true;
        }
        Ok(status)
    }

    fn kill_and_reap(&mut self) -> Result<()> {
        try_with!(kill(self.pid, Signal::SIGKILL), "cannot kill {}", self.pid);
        while !self.reaped {
            self.wait()?;
        }
        Ok(())
    }
}

impl Drop for Tracee {
    fn drop(&mut self) {
        if self.reaped {
            return;
        }
        if let Err(e) = self.kill_and_reap() {
            warn!("cannot reap tracee {}: {}", self.pid, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{fork, ForkResult};

    fn stopped_tracee() -> Tracee {
        let child = match unsafe { fork() }.unwrap() {
            ForkResult::Parent { child } => child,
            ForkResult::Child => unsafe {
                if ptrace::traceme().is_err() || libc::kill(libc::getpid(), libc::SIGSTOP) != 0 {
                    libc::_exit(1);
                }
                loop {
                    libc::pause();
                }
            },
        };
        let mut tracee = Tracee::new(child);
        assert_eq!(
            tracee.wait().unwrap(),
            WaitStatus::Stopped(child, Signal::SIGSTOP)
        );
        tracee
    }

    #[test]
    fn drop_kills_and_reaps() {
        let tracee = stopped_tracee();
        let pid = tracee.pid;
        drop(tracee);
        assert_eq!(waitpid(pid, None), Err(Errno::ECHILD));
    }

    #[test]
    fn exited_tracee_is_reaped_once() {
        let mut tracee = stopped_tracee();
        let pid = tracee.pid;
        kill(pid, Signal::SIGKILL).unwrap();
        assert_eq!(
            tracee.wait().unwrap(),
            WaitStatus::Signaled(pid, Signal::SIGKILL, false)
        );
        drop(tracee);
        assert_eq!(waitpid(pid, None), Err(Errno::ECHILD));
    }
}
