//! Classic BPF as understood by `SECCOMP_MODE_FILTER`.
//!
//! Only the subset of the instruction set that the filter generators emit is
//! modelled: absolute word loads from `struct seccomp_data`, immediate loads,
//! a handful of ALU operations, forward jumps, `tax`/`txa` and constant
//! returns.

use simple_error::bail;
use std::fmt;

use crate::result::Result;

// instruction classes
pub const BPF_LD: u16 = 0x00;
pub const BPF_ALU: u16 = 0x04;
pub const BPF_JMP: u16 = 0x05;
pub const BPF_RET: u16 = 0x06;
pub const BPF_MISC: u16 = 0x07;

// ld/ldx fields
pub const BPF_W: u16 = 0x00;
pub const BPF_IMM: u16 = 0x00;
pub const BPF_ABS: u16 = 0x20;

// alu/jmp fields
pub const BPF_AND: u16 = 0x50;
pub const BPF_LSH: u16 = 0x60;
pub const BPF_RSH: u16 = 0x70;
pub const BPF_JA: u16 = 0x00;
pub const BPF_JEQ: u16 = 0x10;
pub const BPF_JGE: u16 = 0x30;
pub const BPF_JSET: u16 = 0x40;
pub const BPF_K: u16 = 0x00;
pub const BPF_X: u16 = 0x08;

// misc fields
pub const BPF_TAX: u16 = 0x00;
pub const BPF_TXA: u16 = 0x80;

/// Largest program the kernel accepts.
pub const BPF_MAXINSNS: usize = 4096;

pub const SECCOMP_RET_KILL: u32 = 0x0000_0000;
pub const SECCOMP_RET_TRACE: u32 = 0x7ff0_0000;
pub const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
pub const SECCOMP_MODE_FILTER: libc::c_ulong = 2;

/// `offsetof(struct seccomp_data, nr)`
pub const OFFSET_NR: u32 = 0;
/// `offsetof(struct seccomp_data, arch)`
pub const OFFSET_ARCH: u32 = 4;

/// equivalent to `struct sock_filter`
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub struct Instruction {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

/// equivalent to `struct sock_fprog`
#[repr(C)]
pub struct SockFprog {
    pub len: libc::c_ushort,
    pub filter: *const Instruction,
}

#[must_use]
pub const fn stmt(code: u16, k: u32) -> Instruction {
    Instruction {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}

#[must_use]
pub const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> Instruction {
    Instruction {
        code: BPF_JMP | code,
        jt,
        jf,
        k,
    }
}

#[must_use]
pub const fn class(code: u16) -> u16 {
    code & 0x07
}

#[must_use]
pub const fn op(code: u16) -> u16 {
    code & 0xf0
}

impl Instruction {
    #[must_use]
    pub fn is_jump(&self) -> bool {
        class(self.code) == BPF_JMP
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        const LD_ABS: u16 = BPF_LD | BPF_W | BPF_ABS;
        const LD_IMM: u16 = BPF_LD | BPF_W | BPF_IMM;
        const RET_K: u16 = BPF_RET | BPF_K;
        const JEQ_K: u16 = BPF_JMP | BPF_JEQ | BPF_K;
        const JGE_K: u16 = BPF_JMP | BPF_JGE | BPF_K;
        const JSET_K: u16 = BPF_JMP | BPF_JSET | BPF_K;
        const JA: u16 = BPF_JMP | BPF_JA;
        const AND_K: u16 = BPF_ALU | BPF_AND | BPF_K;
        const LSH_X: u16 = BPF_ALU | BPF_LSH | BPF_X;
        const RSH_K: u16 = BPF_ALU | BPF_RSH | BPF_K;
        const TAX: u16 = BPF_MISC | BPF_TAX;
        const TXA: u16 = BPF_MISC | BPF_TXA;

        match (self.code, self.k) {
            (LD_ABS, OFFSET_ARCH) => write!(f, "ld [arch]"),
            (LD_ABS, OFFSET_NR) => write!(f, "ld [nr]"),
            (LD_ABS, k) => write!(f, "ld [{}]", k),
            (LD_IMM, k) => write!(f, "ld #{:#x}", k),
            (RET_K, SECCOMP_RET_KILL) => write!(f, "ret KILL"),
            (RET_K, SECCOMP_RET_TRACE) => write!(f, "ret TRACE"),
            (RET_K, SECCOMP_RET_ALLOW) => write!(f, "ret ALLOW"),
            (RET_K, k) => write!(f, "ret #{:#x}", k),
            (JEQ_K, k) => write!(f, "jeq #{:#x}, jt {}, jf {}", k, self.jt, self.jf),
            (JGE_K, k) => write!(f, "jge #{:#x}, jt {}, jf {}", k, self.jt, self.jf),
            (JSET_K, k) => write!(f, "jset #{:#x}, jt {}, jf {}", k, self.jt, self.jf),
            (JA, k) => write!(f, "ja +{}", k),
            (AND_K, k) => write!(f, "and #{:#x}", k),
            (LSH_X, _) => write!(f, "lsh x"),
            (RSH_K, k) => write!(f, "rsh #{}", k),
            (TAX, _) => write!(f, "tax"),
            (TXA, _) => write!(f, "txa"),
            (code, k) => write!(
                f,
                "raw code={:#06x} jt={} jf={} k={:#x}",
                code, self.jt, self.jf, k
            ),
        }
    }
}

/// The two fields of `struct seccomp_data` the generated filters look at.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SeccompData {
    pub nr: u32,
    pub arch: u32,
}

/// Evaluates `prog` the way the kernel would for one syscall and returns the
/// constant of the `ret` instruction that was reached.
pub fn run(prog: &[Instruction], data: &SeccompData) -> Result<u32> {
    let mut a: u32 = 0;
    let mut x: u32 = 0;
    let mut pc = 0usize;

    loop {
        let insn = match prog.get(pc) {
            Some(insn) => insn,
            None => bail!("program counter {} ran past the end of the program", pc),
        };
        pc += 1;

        match class(insn.code) {
            BPF_LD => {
                a = match insn.code {
                    c if c == BPF_LD | BPF_W | BPF_ABS => match insn.k {
                        OFFSET_NR => data.nr,
                        OFFSET_ARCH => data.arch,
                        k => bail!("unsupported seccomp_data offset {}", k),
                    },
                    c if c == BPF_LD | BPF_W | BPF_IMM => insn.k,
                    c => bail!("unsupported load {:#x} at {}", c, pc - 1),
                }
            }
            BPF_ALU => {
                let operand = if insn.code & BPF_X != 0 { x } else { insn.k };
                a = match op(insn.code) {
                    BPF_AND => a & operand,
                    BPF_LSH => a.checked_shl(operand).unwrap_or(0),
                    BPF_RSH => a.checked_shr(operand).unwrap_or(0),
                    o => bail!("unsupported alu operation {:#x} at {}", o, pc - 1),
                }
            }
            BPF_JMP => {
                let taken = match op(insn.code) {
                    BPF_JA => {
                        pc += insn.k as usize;
                        continue;
                    }
                    BPF_JEQ => a == insn.k,
                    BPF_JGE => a >= insn.k,
                    BPF_JSET => a & insn.k != 0,
                    o => bail!("unsupported jump {:#x} at {}", o, pc - 1),
                };
                pc += usize::from(if taken { insn.jt } else { insn.jf });
            }
            BPF_RET => return Ok(insn.k),
            BPF_MISC => match insn.code & 0xf8 {
                BPF_TAX => x = a,
                BPF_TXA => a = x,
                o => bail!("unsupported misc operation {:#x} at {}", o, pc - 1),
            },
            c => bail!("unsupported instruction class {:#x} at {}", c, pc - 1),
        }
    }
}
