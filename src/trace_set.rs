use simple_error::{bail, try_with};
use std::ops::RangeInclusive;

use crate::personality::Personality;
use crate::result::Result;
use crate::syscalls::{self, SyscallFlags};

/// Syscalls that need to stop in the tracer, for every personality.
///
/// Combines the numbers the user asked for with the built-in classes from
/// [`syscalls`]. Built once before filter synthesis and only read afterwards.
#[derive(Clone, Debug)]
pub struct TraceSet {
    /// user selection, one `nsyscalls` sized table per personality
    selected: Vec<Vec<bool>>,
    flags: Vec<Vec<SyscallFlags>>,
    stack_trace: bool,
}

impl TraceSet {
    /// Empty selection with the built-in classes of every personality in
    /// `table`. `stack_trace` adds the memory-mapping-change class.
    #[must_use]
    pub fn new(table: &[Personality], stack_trace: bool) -> TraceSet {
        TraceSet {
            selected: table
                .iter()
                .map(|p| vec![false; p.nsyscalls as usize])
                .collect(),
            flags: table.iter().map(syscalls::flags_for).collect(),
            stack_trace,
        }
    }

    /// Like [`TraceSet::new`] but without any built-in class, so that only
    /// explicitly selected numbers are traced.
    #[must_use]
    pub fn bare(table: &[Personality]) -> TraceSet {
        TraceSet {
            selected: table
                .iter()
                .map(|p| vec![false; p.nsyscalls as usize])
                .collect(),
            flags: table
                .iter()
                .map(|p| vec![SyscallFlags::empty(); p.nsyscalls as usize])
                .collect(),
            stack_trace: false,
        }
    }

    #[must_use]
    pub fn personalities(&self) -> usize {
        self.selected.len()
    }

    /// Number of known syscalls of `personality`, 0 for unknown personalities.
    #[must_use]
    pub fn nsyscalls(&self, personality: usize) -> u32 {
        self.selected
            .get(personality)
            .map_or(0, |s| s.len() as u32)
    }

    pub fn trace(&mut self, personality: usize, nr: u32) -> Result<()> {
        self.trace_range(personality, nr..=nr)
    }

    pub fn trace_range(&mut self, personality: usize, range: RangeInclusive<u32>) -> Result<()> {
        let selected = match self.selected.get_mut(personality) {
            Some(s) => s,
            None => bail!("no personality #{}", personality),
        };
        if range.is_empty() {
            bail!("empty syscall range {:?}", range);
        }
        if *range.end() as usize >= selected.len() {
            bail!(
                "syscall {} is out of range for personality #{} ({} syscalls)",
                range.end(),
                personality,
                selected.len()
            );
        }
        for nr in range {
            selected[nr as usize] = true;
        }
        Ok(())
    }

    /// Whether syscall `nr` of `personality` has to be handed to the tracer.
    #[must_use]
    pub fn is_traced(&self, nr: u32, personality: usize) -> bool {
        let nr = nr as usize;
        let selected = self
            .selected
            .get(personality)
            .and_then(|s| s.get(nr))
            .copied()
            .unwrap_or(false);
        if selected {
            return true;
        }
        let flags = match self.flags.get(personality).and_then(|f| f.get(nr)) {
            Some(f) => *f,
            None => return false,
        };
        if flags.intersects(SyscallFlags::INDIRECT_SUBCALL | SyscallFlags::SECCOMP_DEFAULT) {
            return true;
        }
        self.stack_trace && flags.contains(SyscallFlags::MEMORY_MAPPING_CHANGE)
    }
}

/// Parses a comma separated list of syscall numbers and inclusive `a-b`
/// ranges, e.g. `0,2,5-7`. Every number has to be below `nsyscalls`.
pub fn parse_number_set(spec: &str, nsyscalls: u32) -> Result<Vec<RangeInclusive<u32>>> {
    let mut ranges = vec![];
    for item in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let (lower, upper) = match item.split_once('-') {
            Some((lower, upper)) => (lower.trim(), upper.trim()),
            None => (item, item),
        };
        let lower = try_with!(lower.parse::<u32>(), "invalid syscall number '{}'", lower);
        let upper = try_with!(upper.parse::<u32>(), "invalid syscall number '{}'", upper);
        if lower > upper {
            bail!("invalid syscall range '{}'", item);
        }
        if upper >= nsyscalls {
            bail!(
                "syscall {} is out of range (personality has {} syscalls)",
                upper,
                nsyscalls
            );
        }
        ranges.push(lower..=upper);
    }
    if ranges.is_empty() {
        bail!("empty syscall set '{}'", spec);
    }
    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::personality::{AUDIT_ARCH_I386, AUDIT_ARCH_X86_64};

    fn table() -> Vec<Personality> {
        vec![
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
        ]
    }

    #[test]
    fn user_selection() {
        let mut set = TraceSet::bare(&table());
        set.trace(0, 2).unwrap();
        set.trace_range(1, 5..=7).unwrap();
        assert!(set.is_traced(2, 0));
        assert!(!set.is_traced(2, 1));
        assert!(set.is_traced(6, 1));
        assert!(!set.is_traced(8, 1));
        assert!(!set.is_traced(1000, 0));
        assert!(!set.is_traced(0, 7));
    }

    #[test]
    fn builtin_classes() {
        let set = TraceSet::new(&table(), false);
        assert!(set.is_traced(59, 0)); // execve
        assert!(set.is_traced(102, 1)); // socketcall
        assert!(!set.is_traced(9, 0)); // mmap

        let set = TraceSet::new(&table(), true);
        assert!(set.is_traced(9, 0));
        assert!(set.is_traced(192, 1)); // mmap2
    }

    #[test]
    fn out_of_range_selection_is_rejected() {
        let mut set = TraceSet::bare(&table());
        assert!(set.trace(0, 463).is_err());
        assert!(set.trace(2, 0).is_err());
        #[allow(clippy::reversed_empty_ranges)]
        let empty = 7..=5;
        assert!(set.trace_range(0, empty).is_err());
        assert_eq!(set.nsyscalls(1), 463);
        assert_eq!(set.nsyscalls(2), 0);
    }

    #[test]
    fn parse_sets() {
        assert_eq!(parse_number_set("0,2,5-7", 10).unwrap(), vec![0..=0, 2..=2, 5..=7]);
        assert_eq!(parse_number_set(" 3 , 4-4 ", 10).unwrap(), vec![3..=3, 4..=4]);
        assert!(parse_number_set("", 10).is_err());
        assert!(parse_number_set("7-5", 10).is_err());
        assert!(parse_number_set("10", 10).is_err());
        assert!(parse_number_set("read", 10).is_err());
    }
}
