use log::{debug, info, warn};
use nix::errno::Errno;
use simple_error::try_with;
use std::{fmt, ptr};

use crate::bpf::{Instruction, SockFprog, BPF_MAXINSNS, SECCOMP_MODE_FILTER};
use crate::filter::{generators, Generator};
use crate::personality::Personality;
use crate::restart::{self, Restart};
use crate::result::Result;
use crate::trace_set::TraceSet;
use crate::tracer::order_probe;

#[derive(Copy, Clone, Debug, Default)]
pub struct FilterOptions {
    /// log the chosen program, one instruction per line
    pub dump: bool,
}

/// Kernel properties determined once at startup.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Capabilities {
    /// a seccomp filter is installed in tracees
    pub filtering: bool,
    /// seccomp stops are reported before the syscall-entry stop
    pub seccomp_before_sysentry: bool,
}

/// Why tracees run without a seccomp filter.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Disabled {
    Unsupported(Errno),
    NoPersonalities,
    /// every generator overflowed its jump offsets
    Overflow,
    /// the shortest program has this many instructions
    TooLarge(usize),
}

impl fmt::Display for Disabled {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Disabled::Unsupported(errno) => {
                write!(f, "seccomp filters are not supported by the kernel: {}", errno)
            }
            Disabled::NoPersonalities => {
                write!(f, "no syscall personality known for this architecture")
            }
            Disabled::Overflow => write!(f, "seccomp filter jump offsets overflow"),
            Disabled::TooLarge(len) => write!(
                f,
                "seccomp filter has {} instructions, the kernel accepts at most {}",
                len, BPF_MAXINSNS
            ),
        }
    }
}

/// The program installed in every tracee.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ActiveFilter {
    generator: &'static str,
    insns: Vec<Instruction>,
}

#[allow(clippy::len_without_is_empty)]
impl ActiveFilter {
    /// Name of the generator that produced the program.
    #[must_use]
    pub fn generator(&self) -> &'static str {
        self.generator
    }

    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.insns
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn dump(&self) {
        debug!(
            "seccomp filter ({}, {} instructions):",
            self.generator,
            self.insns.len()
        );
        for (idx, insn) in self.insns.iter().enumerate() {
            debug!("{:4}: {}", idx, insn);
        }
    }

    /// Installs the filter into the calling process. Meant for a tracee
    /// before it execs the traced program.
    pub fn install(&self) -> Result<()> {
        let prog = SockFprog {
            len: self.insns.len() as libc::c_ushort,
            filter: self.insns.as_ptr(),
        };
        let res = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
        try_with!(Errno::result(res), "cannot set no_new_privs");
        let res = unsafe {
            libc::prctl(
                libc::PR_SET_SECCOMP,
                SECCOMP_MODE_FILTER,
                &prog as *const SockFprog,
            )
        };
        try_with!(Errno::result(res), "cannot install seccomp filter");
        Ok(())
    }
}

/// Result of [`setup`], passed to everything that needs to know how
/// tracees are filtered.
#[derive(Debug)]
pub struct FilterSetup {
    pub filter: Option<ActiveFilter>,
    pub caps: Capabilities,
    pub disabled: Option<Disabled>,
    pub set: TraceSet,
}

impl FilterSetup {
    /// How to resume a tracee after the exit of syscall `nr`.
    #[must_use]
    pub fn restart_after_exit(&self, nr: u32, personality: usize) -> Restart {
        if !self.caps.filtering {
            return Restart::Syscall;
        }
        restart::restart_after_exit(&self.set, nr, personality)
    }
}

/// Runs all `generators` and keeps the shortest program that did not
/// overflow.
pub fn choose(
    generators: &[&dyn Generator],
    table: &[Personality],
    set: &TraceSet,
) -> std::result::Result<ActiveFilter, Disabled> {
    if table.is_empty() {
        return Err(Disabled::NoPersonalities);
    }
    let mut best: Option<ActiveFilter> = None;
    for generator in generators {
        let generated = generator.generate(table, set);
        debug!(
            "{} generator: {} instructions{}",
            generator.name(),
            generated.insns.len(),
            if generated.overflow { ", overflow" } else { "" }
        );
        if generated.overflow {
            continue;
        }
        if best.as_ref().map_or(true, |b| generated.insns.len() < b.len()) {
            best = Some(ActiveFilter {
                generator: generator.name(),
                insns: generated.insns,
            });
        }
    }

    match best {
        None => Err(Disabled::Overflow),
        Some(filter) if filter.len() > BPF_MAXINSNS => Err(Disabled::TooLarge(filter.len())),
        Some(filter) => Ok(filter),
    }
}

/// Interprets the result of installing a NULL program: a kernel that knows
/// `SECCOMP_MODE_FILTER` fails with `EFAULT` rather than `EINVAL`. Success
/// would mean the kernel accepted garbage, so it counts as unsupported too.
fn null_install_support(res: nix::Result<libc::c_int>) -> std::result::Result<(), Errno> {
    match res {
        Err(Errno::EINVAL) => Err(Errno::EINVAL),
        Err(_) => Ok(()),
        Ok(_) => Err(Errno::UnknownErrno),
    }
}

fn seccomp_filter_supported() -> std::result::Result<(), Errno> {
    let res = unsafe {
        libc::prctl(
            libc::PR_SET_SECCOMP,
            SECCOMP_MODE_FILTER,
            ptr::null::<SockFprog>(),
        )
    };
    null_install_support(Errno::result(res))
}

fn disable(set: TraceSet, reason: Disabled) -> FilterSetup {
    warn!("{}, tracing every syscall", reason);
    FilterSetup {
        filter: None,
        caps: Capabilities::default(),
        disabled: Some(reason),
        set,
    }
}

/// Picks the seccomp filter for `set` and determines the kernel's stop
/// order. Only broken process control is an error; everything else ends in
/// a setup with filtering disabled.
pub fn setup(table: &[Personality], set: TraceSet, opts: &FilterOptions) -> Result<FilterSetup> {
    if let Err(errno) = seccomp_filter_supported() {
        return Ok(disable(set, Disabled::Unsupported(errno)));
    }
    let filter = match choose(&generators(), table, &set) {
        Ok(filter) => filter,
        Err(reason) => return Ok(disable(set, reason)),
    };

    let seccomp_before_sysentry = match order_probe::probe_stop_order()? {
        Some(order) => order,
        None => {
            warn!("assuming seccomp stops follow syscall-entry stops");
            false
        }
    };
    info!(
        "using {} seccomp filter with {} instructions",
        filter.generator(),
        filter.len()
    );
    if opts.dump {
        filter.dump();
    }

    Ok(FilterSetup {
        filter: Some(filter),
        caps: Capabilities {
            filtering: true,
            seccomp_before_sysentry,
        },
        disabled: None,
        set,
    })
}
