//! Syscall ABIs ("personalities") a tracee on this host may use.

pub const AUDIT_ARCH_X86_64: u32 = 0xc000_003e;
pub const AUDIT_ARCH_I386: u32 = 0x4000_0003;
pub const AUDIT_ARCH_AARCH64: u32 = 0xc000_00b7;
pub const AUDIT_ARCH_ARM: u32 = 0x4000_0028;
pub const AUDIT_ARCH_RISCV64: u32 = 0xc000_00f3;

/// `__X32_SYSCALL_BIT`
pub const X32_SYSCALL_BIT: u32 = 0x4000_0000;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Personality {
    pub name: &'static str,
    /// `AUDIT_ARCH_*` value reported in `seccomp_data.arch`
    pub arch: u32,
    /// Bit or'ed into every syscall number of this personality, 0 if none.
    pub flag: u32,
    /// Syscall numbers `0..nsyscalls` are known for this personality.
    pub nsyscalls: u32,
}

#[cfg(target_arch = "x86_64")]
const HOST: &[Personality] = &[
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
    Personality {
        name: "x32",
        arch: AUDIT_ARCH_X86_64,
        flag: X32_SYSCALL_BIT,
        nsyscalls: 548,
    },
];

#[cfg(target_arch = "x86")]
const HOST: &[Personality] = &[Personality {
    name: "i386",
    arch: AUDIT_ARCH_I386,
    flag: 0,
    nsyscalls: 463,
}];

#[cfg(target_arch = "aarch64")]
const HOST: &[Personality] = &[
    Personality {
        name: "aarch64",
        arch: AUDIT_ARCH_AARCH64,
        flag: 0,
        nsyscalls: 463,
    },
    Personality {
        name: "arm",
        arch: AUDIT_ARCH_ARM,
        flag: 0,
        nsyscalls: 463,
    },
];

#[cfg(target_arch = "riscv64")]
const HOST: &[Personality] = &[Personality {
    name: "riscv64",
    arch: AUDIT_ARCH_RISCV64,
    flag: 0,
    nsyscalls: 463,
}];

#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "x86",
    target_arch = "aarch64",
    target_arch = "riscv64"
)))]
const HOST: &[Personality] = &[];

/// Personality table of the architecture we were built for, index 0 being
/// the native ABI. Empty if the architecture is not supported.
#[must_use]
pub fn host_personalities() -> &'static [Personality] {
    HOST
}

/// Order in which personality sections are laid out in a filter program.
///
/// A personality that carries a disambiguation flag shares its `arch` value
/// with a broader one and therefore has to be tested first. Within each of
/// the two groups later table entries come first, so for the x86_64 table
/// this is the plain reverse order (x32, i386, x86_64).
#[must_use]
pub fn check_order(table: &[Personality]) -> Vec<usize> {
    let flagged = (0..table.len()).rev().filter(|&p| table[p].flag != 0);
    let plain = (0..table.len()).rev().filter(|&p| table[p].flag == 0);
    flagged.chain(plain).collect()
}
