//! Finds out whether the kernel reports the seccomp stop of a syscall before
//! or after its syscall-entry stop.
//!
//! A forked child installs a filter that only traces `gettid`, becomes our
//! tracee, stops itself and then runs `gettid` followed by `exit_group`.
//! The parent expects exactly this sequence of stops:
//!
//! ```text
//! 0  SIGSTOP                      set options
//! 1  seccomp stop | syscall entry gettid, in either order
//! 2  syscall entry | seccomp stop
//! 3  syscall exit                 gettid
//! 4  syscall entry                exit_group
//! 5  exited with status 0
//! ```

use log::{debug, warn};
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::{fork, ForkResult};
use simple_error::try_with;

use crate::bpf::{
    self, Instruction, SockFprog, BPF_ABS, BPF_JEQ, BPF_K, BPF_LD, BPF_RET, BPF_W, OFFSET_NR,
    SECCOMP_MODE_FILTER, SECCOMP_RET_ALLOW, SECCOMP_RET_TRACE,
};
use crate::result::Result;
use crate::tracer::ptrace::Tracee;

/// Traces `gettid`, allows everything else.
const PROBE_FILTER: [Instruction; 4] = [
    bpf::stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_NR),
    bpf::jump(BPF_JEQ | BPF_K, libc::SYS_gettid as u32, 0, 1),
    bpf::stmt(BPF_RET | BPF_K, SECCOMP_RET_TRACE),
    bpf::stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW),
];

/// A tracee state change as far as the probe cares.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Event {
    Stopped(Signal),
    Seccomp,
    Syscall,
    PtraceEvent(Signal, i32),
    Exited(i32),
    Signaled(Signal),
    Other,
}

impl From<WaitStatus> for Event {
    fn from(status: WaitStatus) -> Event {
        match status {
            WaitStatus::Stopped(_, sig) => Event::Stopped(sig),
            WaitStatus::PtraceEvent(_, Signal::SIGTRAP, libc::PTRACE_EVENT_SECCOMP) => {
                Event::Seccomp
            }
            WaitStatus::PtraceEvent(_, sig, event) => Event::PtraceEvent(sig, event),
            WaitStatus::PtraceSyscall(_) => Event::Syscall,
            WaitStatus::Exited(_, code) => Event::Exited(code),
            WaitStatus::Signaled(_, sig, _) => Event::Signaled(sig),
            _ => Event::Other,
        }
    }
}

/// The stop the probe waits for next.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum State {
    InitialStop,
    GettidFirst,
    GettidSecond { seccomp_first: bool },
    GettidExit { seccomp_first: bool },
    ExitGroupEntry { seccomp_first: bool },
    ChildExit { seccomp_first: bool },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Transition {
    /// set the ptrace options, then resume
    Configure(State),
    /// resume until the next syscall or seccomp stop
    Resume(State),
    /// the child exited after the full sequence; true if the seccomp stop
    /// came first
    Success(bool),
    /// event did not fit the sequence
    Violation(Event),
}

impl State {
    #[must_use]
    pub fn step(self, event: Event) -> Transition {
        use Transition::{Configure, Resume, Success, Violation};

        match (self, event) {
            (State::InitialStop, Event::Stopped(Signal::SIGSTOP)) => Configure(State::GettidFirst),
            (State::GettidFirst, Event::Seccomp) => Resume(State::GettidSecond {
                seccomp_first: true,
            }),
            (State::GettidFirst, Event::Syscall) => Resume(State::GettidSecond {
                seccomp_first: false,
            }),
            (State::GettidSecond { seccomp_first: true }, Event::Syscall)
            | (State::GettidSecond { seccomp_first: false }, Event::Seccomp) => {
                let seccomp_first = matches!(event, Event::Syscall);
                Resume(State::GettidExit { seccomp_first })
            }
            (State::GettidExit { seccomp_first }, Event::Syscall) => {
                Resume(State::ExitGroupEntry { seccomp_first })
            }
            (State::ExitGroupEntry { seccomp_first }, Event::Syscall) => {
                Resume(State::ChildExit { seccomp_first })
            }
            (State::ChildExit { seccomp_first }, Event::Exited(0)) => Success(seccomp_first),
            (_, event) => Violation(event),
        }
    }
}

/// Runs the state machine over a sequence of events and returns the stop
/// order if the sequence was complete.
pub fn replay<I: IntoIterator<Item = Event>>(events: I) -> Option<bool> {
    let mut state = State::InitialStop;
    for event in events {
        match state.step(event) {
            Transition::Configure(next) | Transition::Resume(next) => state = next,
            Transition::Success(seccomp_first) => return Some(seccomp_first),
            Transition::Violation(_) => return None,
        }
    }
    None
}

/// Body of the probe child. Only async-signal-safe calls between `fork`
/// and `_exit`.
fn run_child() -> ! {
    let prog = SockFprog {
        len: PROBE_FILTER.len() as libc::c_ushort,
        filter: PROBE_FILTER.as_ptr(),
    };
    unsafe {
        if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) != 0
            || libc::prctl(
                libc::PR_SET_SECCOMP,
                SECCOMP_MODE_FILTER,
                &prog as *const SockFprog,
            ) != 0
            || ptrace::traceme().is_err()
            || libc::kill(libc::getpid(), libc::SIGSTOP) != 0
        {
            libc::_exit(1);
        }
        libc::syscall(libc::SYS_gettid);
        libc::_exit(0);
    }
}

fn drive(tracee: &mut Tracee) -> Result<Option<bool>> {
    let mut state = State::InitialStop;
    loop {
        let status = tracee.wait()?;
        let event = Event::from(status);
        debug!("stop order probe: {:?} in {:?}", event, state);

        let resumed = match state.step(event) {
            Transition::Configure(next) => {
                state = next;
                tracee.set_options().and_then(|_| tracee.syscall())
            }
            Transition::Resume(next) => {
                state = next;
                tracee.syscall()
            }
            Transition::Success(seccomp_first) => return Ok(Some(seccomp_first)),
            Transition::Violation(event) => {
                warn!(
                    "unexpected {:?} while waiting for {:?}, cannot determine seccomp stop order",
                    event, state
                );
                return Ok(None);
            }
        };
        if let Err(e) = resumed {
            warn!("{}, cannot determine seccomp stop order", e);
            return Ok(None);
        }
    }
}

/// Returns `Some(true)` if seccomp stops precede syscall-entry stops,
/// `Some(false)` if they follow them and `None` if the probe child did not
/// behave as expected. Only failures of `fork` or `waitpid` are errors.
pub fn probe_stop_order() -> Result<Option<bool>> {
    let child = match try_with!(unsafe { fork() }, "cannot fork probe child") {
        ForkResult::Parent { child } => child,
        ForkResult::Child => run_child(),
    };
    // kills and reaps the child on every early return
    let mut tracee = Tracee::new(child);
    let order = drive(&mut tracee)?;
    debug!("seccomp stop order: {:?}", order);
    Ok(order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    fn sequence(seccomp_first: bool) -> Vec<Event> {
        let (first, second) = if seccomp_first {
            (Event::Seccomp, Event::Syscall)
        } else {
            (Event::Syscall, Event::Seccomp)
        };
        vec![
            Event::Stopped(Signal::SIGSTOP),
            first,
            second,
            Event::Syscall,
            Event::Syscall,
            Event::Exited(0),
        ]
    }

    #[test]
    fn seccomp_before_syscall_entry() {
        assert_eq!(replay(sequence(true)), Some(true));
    }

    #[test]
    fn seccomp_after_syscall_entry() {
        assert_eq!(replay(sequence(false)), Some(false));
    }

    #[test]
    fn transitions() {
        let state = State::InitialStop;
        assert_eq!(
            state.step(Event::Stopped(Signal::SIGSTOP)),
            Transition::Configure(State::GettidFirst)
        );
        assert_eq!(
            State::GettidFirst.step(Event::Seccomp),
            Transition::Resume(State::GettidSecond {
                seccomp_first: true
            })
        );
        assert_eq!(
            State::ChildExit {
                seccomp_first: false
            }
            .step(Event::Exited(0)),
            Transition::Success(false)
        );
    }

    #[test]
    fn violations() {
        // two seccomp stops for the same syscall
        let mut events = sequence(true);
        events[2] = Event::Seccomp;
        assert_eq!(replay(events), None);

        // no seccomp stop at all
        let mut events = sequence(false);
        events[2] = Event::Syscall;
        assert_eq!(replay(events), None);

        let mut events = sequence(true);
        events[0] = Event::Stopped(Signal::SIGTRAP);
        assert_eq!(replay(events), None);

        assert_eq!(
            State::GettidExit {
                seccomp_first: true
            }
            .step(Event::PtraceEvent(Signal::SIGTRAP, 1)),
            Transition::Violation(Event::PtraceEvent(Signal::SIGTRAP, 1))
        );
    }

    #[test]
    fn early_exit_is_a_failure() {
        // child could not install the filter
        assert_eq!(replay(vec![Event::Exited(1)]), None);

        let mut events = sequence(true);
        events.truncate(4);
        events.push(Event::Signaled(Signal::SIGKILL));
        assert_eq!(replay(events), None);

        let mut events = sequence(false);
        events[5] = Event::Exited(3);
        assert_eq!(replay(events), None);

        // sequence cut short
        assert_eq!(replay(sequence(true).into_iter().take(5)), None);
    }

    #[test]
    fn events_from_wait_status() {
        let pid = Pid::from_raw(1);
        assert_eq!(
            Event::from(WaitStatus::PtraceEvent(
                pid,
                Signal::SIGTRAP,
                libc::PTRACE_EVENT_SECCOMP
            )),
            Event::Seccomp
        );
        assert_eq!(
            Event::from(WaitStatus::PtraceEvent(
                pid,
                Signal::SIGTRAP,
                libc::PTRACE_EVENT_EXEC
            )),
            Event::PtraceEvent(Signal::SIGTRAP, libc::PTRACE_EVENT_EXEC)
        );
        assert_eq!(Event::from(WaitStatus::PtraceSyscall(pid)), Event::Syscall);
        assert_eq!(Event::from(WaitStatus::Exited(pid, 0)), Event::Exited(0));
        assert_eq!(Event::from(WaitStatus::StillAlive), Event::Other);
    }

    #[test]
    fn probe_filter_traces_gettid_only() {
        let verdict = |nr| bpf::run(&PROBE_FILTER, &bpf::SeccompData { nr, arch: 0 }).unwrap();
        assert_eq!(verdict(libc::SYS_gettid as u32), SECCOMP_RET_TRACE);
        assert_eq!(verdict(libc::SYS_getpid as u32), SECCOMP_RET_ALLOW);
    }

    #[test]
    fn live_probe() {
        // the outcome depends on the kernel and on whether we are already
        // traced or sandboxed, only process control must not fail
        assert!(probe_stop_order().is_ok());
    }
}
