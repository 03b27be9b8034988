//! Syscalls that get special treatment regardless of what the user asked to
//! trace.

use bitflags::bitflags;

use crate::personality::{
    Personality, AUDIT_ARCH_AARCH64, AUDIT_ARCH_ARM, AUDIT_ARCH_I386, AUDIT_ARCH_RISCV64,
    AUDIT_ARCH_X86_64, X32_SYSCALL_BIT,
};

bitflags! {
    pub struct SyscallFlags: u32 {
        /// multiplexer whose real operation is only known from its arguments
        const INDIRECT_SUBCALL = 1 << 0;
        /// must always stop in the tracer, e.g. to notice execve
        const SECCOMP_DEFAULT = 1 << 1;
        /// changes the memory mappings; needed to keep stack unwinding caches fresh
        const MEMORY_MAPPING_CHANGE = 1 << 2;
    }
}

const DEFAULT: SyscallFlags = SyscallFlags::SECCOMP_DEFAULT;
const SUBCALL: SyscallFlags = SyscallFlags::INDIRECT_SUBCALL;
const MMAP: SyscallFlags = SyscallFlags::MEMORY_MAPPING_CHANGE;

const X86_64: &[(u32, SyscallFlags)] = &[
    (9, MMAP), // mmap
    (10, MMAP), // mprotect
    (11, MMAP), // munmap
    (12, MMAP), // brk
    (25, MMAP), // mremap
    (30, MMAP), // shmat
    (59, DEFAULT), // execve
    (67, MMAP), // shmdt
    (216, MMAP), // remap_file_pages
    (322, DEFAULT), // execveat
];

const X32: &[(u32, SyscallFlags)] = &[
    (9, MMAP),
    (10, MMAP),
    (11, MMAP),
    (12, MMAP),
    (25, MMAP),
    (30, MMAP),
    (67, MMAP),
    (216, MMAP),
    (520, DEFAULT), // x32 execve
    (545, DEFAULT), // x32 execveat
];

const I386: &[(u32, SyscallFlags)] = &[
    (11, DEFAULT), // execve
    (45, MMAP), // brk
    (90, MMAP), // mmap
    (91, MMAP), // munmap
    (102, SUBCALL), // socketcall
    (117, SUBCALL), // ipc
    (125, MMAP), // mprotect
    (163, MMAP), // mremap
    (192, MMAP), // mmap2
    (257, MMAP), // remap_file_pages
    (358, DEFAULT), // execveat
    (397, MMAP), // shmat
    (398, MMAP), // shmdt
];

const ARM: &[(u32, SyscallFlags)] = &[
    (11, DEFAULT),
    (45, MMAP),
    (91, MMAP),
    (125, MMAP),
    (163, MMAP),
    (192, MMAP),
    (253, MMAP),
    (305, MMAP),
    (306, MMAP),
    (387, DEFAULT),
];

// asm-generic numbering
const GENERIC: &[(u32, SyscallFlags)] = &[
    (196, MMAP), // shmat
    (197, MMAP), // shmdt
    (214, MMAP), // brk
    (215, MMAP), // munmap
    (216, MMAP), // mremap
    (221, DEFAULT), // execve
    (222, MMAP), // mmap
    (226, MMAP), // mprotect
    (234, MMAP), // remap_file_pages
    (281, DEFAULT), // execveat
];

fn builtin(p: &Personality) -> &'static [(u32, SyscallFlags)] {
    match (p.arch, p.flag) {
        (AUDIT_ARCH_X86_64, 0) => X86_64,
        (AUDIT_ARCH_X86_64, X32_SYSCALL_BIT) => X32,
        (AUDIT_ARCH_I386, 0) => I386,
        (AUDIT_ARCH_ARM, 0) => ARM,
        (AUDIT_ARCH_AARCH64, 0) | (AUDIT_ARCH_RISCV64, 0) => GENERIC,
        _ => &[],
    }
}

/// Dense per-number flag table for `p`, `p.nsyscalls` entries long.
#[must_use]
pub fn flags_for(p: &Personality) -> Vec<SyscallFlags> {
    let mut flags = vec![SyscallFlags::empty(); p.nsyscalls as usize];
    for &(nr, f) in builtin(p) {
        if let Some(slot) = flags.get_mut(nr as usize) {
            *slot |= f;
        }
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x86_64_execve_is_always_traced() {
        let p = Personality {
            name: "x86_64",
            arch: AUDIT_ARCH_X86_64,
            flag: 0,
            nsyscalls: 463,
        };
        let flags = flags_for(&p);
        assert_eq!(flags.len(), 463);
        assert!(flags[59].contains(SyscallFlags::SECCOMP_DEFAULT));
        assert!(flags[9].contains(SyscallFlags::MEMORY_MAPPING_CHANGE));
        assert!(flags[0].is_empty());
    }

    #[test]
    fn x32_uses_its_own_execve() {
        let p = Personality {
            name: "x32",
            arch: AUDIT_ARCH_X86_64,
            flag: X32_SYSCALL_BIT,
            nsyscalls: 548,
        };
        let flags = flags_for(&p);
        assert!(flags[520].contains(SyscallFlags::SECCOMP_DEFAULT));
        assert!(flags[545].contains(SyscallFlags::SECCOMP_DEFAULT));
        assert!(flags[59].is_empty());
        assert!(flags[322].is_empty());
        assert!(flags[9].contains(SyscallFlags::MEMORY_MAPPING_CHANGE));
    }

    #[test]
    fn entries_beyond_table_are_dropped() {
        let p = Personality {
            name: "i386",
            arch: AUDIT_ARCH_I386,
            flag: 0,
            nsyscalls: 100,
        };
        let flags = flags_for(&p);
        assert_eq!(flags.len(), 100);
        assert!(flags[11].contains(SyscallFlags::SECCOMP_DEFAULT));
        assert!(flags.iter().all(|f| !f.contains(SyscallFlags::INDIRECT_SUBCALL)));
    }

    #[test]
    fn unknown_personality_has_no_builtins() {
        let p = Personality {
            name: "other",
            arch: 1,
            flag: 0,
            nsyscalls: 4,
        };
        assert!(flags_for(&p).iter().all(SyscallFlags::is_empty));
    }
}
