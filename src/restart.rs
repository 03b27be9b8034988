use nix::sys::ptrace;
use nix::unistd::Pid;
use simple_error::try_with;

use crate::result::Result;
use crate::trace_set::TraceSet;

/// How a stopped tracee continues after a syscall exit.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Restart {
    /// `PTRACE_SYSCALL`: stop at the next syscall entry
    Syscall,
    /// `PTRACE_CONT`: run until the seccomp filter hands over a syscall
    Cont,
}

impl Restart {
    pub fn resume(self, pid: Pid) -> Result<()> {
        match self {
            Restart::Syscall => try_with!(
                ptrace::syscall(pid, None),
                "cannot resume {} with ptrace syscall",
                pid
            ),
            Restart::Cont => try_with!(
                ptrace::cont(pid, None),
                "cannot resume {} with ptrace cont",
                pid
            ),
        }
        Ok(())
    }
}

/// Decision for a tracee that is filtered by a seccomp program built from
/// `set` and just left syscall `nr` of `personality`.
#[must_use]
pub fn restart_after_exit(set: &TraceSet, nr: u32, personality: usize) -> Restart {
    if nr < set.nsyscalls(personality) && set.is_traced(nr, personality) {
        Restart::Syscall
    } else {
        Restart::Cont
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::personality::{Personality, AUDIT_ARCH_I386, AUDIT_ARCH_X86_64};
    use nix::sys::signal::Signal;
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, ForkResult};

    #[test]
    fn traced_syscalls_restart_with_syscall() {
        let table = [
            Personality {
                name: "x86_64",
                arch: AUDIT_ARCH_X86_64,
                flag: 0,
                nsyscalls: 463,
            },
            Personality {
                name: "i386",
                arch: AUDIT_ARCH_I386,
                flag: 0,
                nsyscalls: 463,
            },
        ];
        let mut set = TraceSet::new(&table, false);
        set.trace(0, 1).unwrap();

        assert_eq!(restart_after_exit(&set, 1, 0), Restart::Syscall);
        assert_eq!(restart_after_exit(&set, 1, 1), Restart::Cont);
        assert_eq!(restart_after_exit(&set, 0, 0), Restart::Cont);
        // execve is always traced
        assert_eq!(restart_after_exit(&set, 59, 0), Restart::Syscall);
        // unknown numbers and personalities
        assert_eq!(restart_after_exit(&set, 463, 0), Restart::Cont);
        assert_eq!(restart_after_exit(&set, 1, 2), Restart::Cont);
    }

    /// Forks a tracee that stops itself and then exits.
    fn stopped_child() -> Pid {
        match unsafe { fork() }.unwrap() {
            ForkResult::Parent { child } => {
                assert_eq!(
                    waitpid(child, None).unwrap(),
                    WaitStatus::Stopped(child, Signal::SIGSTOP)
                );
                child
            }
            ForkResult::Child => unsafe {
                if ptrace::traceme().is_err() || libc::kill(libc::getpid(), libc::SIGSTOP) != 0 {
                    libc::_exit(1);
                }
                libc::_exit(0)
            },
        }
    }

    #[test]
    fn resume_stopped_tracee() {
        let child = stopped_child();
        Restart::Cont.resume(child).unwrap();
        assert_eq!(waitpid(child, None).unwrap(), WaitStatus::Exited(child, 0));

        // exit_group entry stop, without TRACESYSGOOD reported as SIGTRAP
        let child = stopped_child();
        Restart::Syscall.resume(child).unwrap();
        assert_eq!(
            waitpid(child, None).unwrap(),
            WaitStatus::Stopped(child, Signal::SIGTRAP)
        );
        Restart::Cont.resume(child).unwrap();
        assert_eq!(waitpid(child, None).unwrap(), WaitStatus::Exited(child, 0));
    }
}
