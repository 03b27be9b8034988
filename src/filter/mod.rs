//! Synthesis of the seccomp program that classifies syscalls into "allow"
//! and "stop in the tracer".
//!
//! Programs are laid out as one section per personality:
//!
//! ```text
//! ld [arch]
//! section(p) for p in personality::check_order(table)
//! ret TRACE          ; arch matched no personality
//! ```
//!
//! Every section starts by comparing `arch` (jumping over itself on a
//! mismatch) and ends in `ret ALLOW; ret TRACE`. All jumps stay inside their
//! own section, so a section may be at most 255 instructions long: that is
//! the largest offset an 8-bit jump field can express.

use log::debug;

use crate::bpf::{
    self, Instruction, BPF_ABS, BPF_JA, BPF_JEQ, BPF_JGE, BPF_K, BPF_LD, BPF_MAXINSNS, BPF_RET,
    BPF_W, OFFSET_ARCH, OFFSET_NR, SECCOMP_RET_ALLOW, SECCOMP_RET_TRACE,
};
use crate::personality::{self, Personality};
use crate::trace_set::TraceSet;

pub mod binary;
pub mod linear;
pub mod select;

pub use select::{choose, setup, ActiveFilter, Capabilities, Disabled, FilterOptions, FilterSetup};

/// Longest personality section a jump can cross.
pub const MAX_SECTION_LEN: usize = u8::MAX as usize;

/// Generators stop once a program grows past this, overflowed or not.
pub const PROGRAM_CAPACITY: usize = 2 * BPF_MAXINSNS;

/// Destination of a jump emitted before the section length is known.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Target {
    /// skip this many instructions
    Skip(u8),
    /// first instruction of the next section
    Next,
    /// the section's `ret TRACE`
    Trace,
    /// the section's `ret ALLOW`
    Allow,
}

#[derive(Copy, Clone, Debug)]
enum Slot {
    Stmt(Instruction),
    Jump {
        code: u16,
        k: u32,
        jt: Target,
        jf: Target,
    },
    Always(Target),
}

/// One personality section under construction. Jumps are recorded with
/// symbolic targets and turned into offsets by [`Section::finish`].
#[derive(Debug, Default)]
pub struct Section {
    slots: Vec<Slot>,
}

#[allow(clippy::len_without_is_empty)]
impl Section {
    /// Section preamble shared by all generators: leave the section unless
    /// `arch` matches, then load `nr`. For a personality with a
    /// disambiguation flag, numbers without the flag are sent to the next
    /// section with `arch` reloaded into the accumulator.
    #[must_use]
    pub fn new(p: &Personality) -> Section {
        let mut section = Section::default();
        section.jump(BPF_JEQ | BPF_K, p.arch, Target::Skip(0), Target::Next);
        section.stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_NR);
        if p.flag != 0 {
            section.jump(BPF_JGE | BPF_K, p.flag, Target::Skip(2), Target::Skip(0));
            section.stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_ARCH);
            section.always(Target::Next);
        }
        section
    }

    pub fn stmt(&mut self, code: u16, k: u32) {
        self.slots.push(Slot::Stmt(bpf::stmt(code, k)));
    }

    /// Conditional jump; `code` is given without the `BPF_JMP` class.
    pub fn jump(&mut self, code: u16, k: u32, jt: Target, jf: Target) {
        self.slots.push(Slot::Jump { code, k, jt, jf });
    }

    /// Unconditional `ja`.
    pub fn always(&mut self, target: Target) {
        self.slots.push(Slot::Always(target));
    }

    /// Length of the finished section, terminal returns included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len() + 2
    }

    /// Appends `ret ALLOW; ret TRACE` and resolves every jump target.
    /// Returns `None` if the section is too long for 8-bit jump offsets.
    #[must_use]
    pub fn finish(self) -> Option<Vec<Instruction>> {
        let len = self.len();
        if len > MAX_SECTION_LEN {
            return None;
        }
        // offsets are relative to the instruction after the jump
        let resolve = |at: usize, target: Target| -> u8 {
            let distance = match target {
                Target::Skip(n) => return n,
                Target::Next => len - at - 1,
                Target::Trace => len - at - 2,
                Target::Allow => len - at - 3,
            };
            distance as u8
        };

        let mut insns: Vec<Instruction> = self
            .slots
            .iter()
            .enumerate()
            .map(|(at, slot)| match *slot {
                Slot::Stmt(insn) => insn,
                Slot::Jump { code, k, jt, jf } => {
                    bpf::jump(code, k, resolve(at, jt), resolve(at, jf))
                }
                Slot::Always(target) => bpf::jump(BPF_JA, u32::from(resolve(at, target)), 0, 0),
            })
            .collect();
        insns.push(bpf::stmt(BPF_RET | BPF_K, SECCOMP_RET_ALLOW));
        insns.push(bpf::stmt(BPF_RET | BPF_K, SECCOMP_RET_TRACE));
        Some(insns)
    }
}

/// Output of a [`Generator`]. An overflowed program is incomplete and must
/// never be installed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Generated {
    pub insns: Vec<Instruction>,
    pub overflow: bool,
}

/// A strategy for compiling a [`TraceSet`] into a seccomp program.
pub trait Generator {
    fn name(&self) -> &'static str;

    fn generate(&self, table: &[Personality], set: &TraceSet) -> Generated;
}

/// Lays out the sections of all personalities around a generator specific
/// section body. `body` receives the section right after [`Section::new`]
/// and the index of the personality in `table`.
pub fn assemble<F>(table: &[Personality], mut body: F) -> Generated
where
    F: FnMut(&mut Section, &Personality, usize),
{
    let mut insns = Vec::with_capacity(PROGRAM_CAPACITY);
    insns.push(bpf::stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_ARCH));

    for idx in personality::check_order(table) {
        let p = &table[idx];
        let mut section = Section::new(p);
        body(&mut section, p, idx);

        let len = section.len();
        match section.finish() {
            Some(code) if insns.len() + code.len() < PROGRAM_CAPACITY => insns.extend(code),
            Some(_) => {
                debug!("filter program exceeds {} instructions", PROGRAM_CAPACITY);
                return Generated {
                    insns,
                    overflow: true,
                };
            }
            None => {
                debug!(
                    "section of personality {} has {} instructions, jumps would overflow",
                    p.name, len
                );
                return Generated {
                    insns,
                    overflow: true,
                };
            }
        }
    }

    insns.push(bpf::stmt(BPF_RET | BPF_K, SECCOMP_RET_TRACE));
    Generated {
        insns,
        overflow: false,
    }
}

/// The generators [`setup`] chooses from.
#[must_use]
pub fn generators() -> [&'static dyn Generator; 2] {
    [&linear::Linear, &binary::BinaryMatch]
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use crate::bpf::SeccompData;

    pub fn personality(arch: u32, flag: u32, nsyscalls: u32) -> Personality {
        Personality {
            name: "test",
            arch,
            flag,
            nsyscalls,
        }
    }

    /// Verdict of `insns` for `nr` on `arch`, `true` meaning "trace".
    pub fn traces(insns: &[Instruction], arch: u32, nr: u32) -> bool {
        let ret = bpf::run(insns, &SeccompData { nr, arch }).expect("program must not fault");
        assert!(ret == SECCOMP_RET_TRACE || ret == SECCOMP_RET_ALLOW);
        ret == SECCOMP_RET_TRACE
    }

    /// Checks `insns` against `set` for every syscall number of every
    /// personality, plus a few numbers past the end of each table.
    pub fn assert_agrees(insns: &[Instruction], table: &[Personality], set: &TraceSet) {
        for (idx, p) in table.iter().enumerate() {
            for nr in 0..p.nsyscalls {
                assert_eq!(
                    traces(insns, p.arch, nr | p.flag),
                    set.is_traced(nr, idx),
                    "personality #{} syscall {}",
                    idx,
                    nr
                );
            }
            for nr in p.nsyscalls..p.nsyscalls + 40 {
                assert!(traces(insns, p.arch, nr | p.flag), "{} past table", nr);
            }
        }
    }

    /// Same as [`assert_agrees`], but only every `stride`th number.
    pub fn assert_agrees_sampled(
        insns: &[Instruction],
        table: &[Personality],
        set: &TraceSet,
        stride: usize,
    ) {
        for (idx, p) in table.iter().enumerate() {
            for nr in (0..p.nsyscalls).step_by(stride) {
                assert_eq!(
                    traces(insns, p.arch, nr | p.flag),
                    set.is_traced(nr, idx),
                    "personality #{} syscall {}",
                    idx,
                    nr
                );
            }
        }
    }
}
