//! Range comparison filter.
//!
//! A personality section looks like
//!
//! ```text
//! if (nr == 59) return TRACE;
//! if (nr >= 321 && nr < 324) return TRACE;
//! ...
//! if (nr >= nsyscalls) return TRACE;
//! return ALLOW;
//! ```
//!
//! which is short when the traced numbers form a few contiguous runs.

use crate::bpf::{BPF_JEQ, BPF_JGE, BPF_K};
use crate::filter::{assemble, Generated, Generator, Section, Target};
use crate::personality::Personality;
use crate::trace_set::TraceSet;

pub struct Linear;

/// Traces `lower..upper`.
fn range(section: &mut Section, lower: u32, upper: u32) {
    if lower + 1 == upper {
        section.jump(BPF_JEQ | BPF_K, lower, Target::Trace, Target::Skip(0));
    } else {
        section.jump(BPF_JGE | BPF_K, lower, Target::Skip(0), Target::Skip(1));
        section.jump(BPF_JGE | BPF_K, upper, Target::Skip(0), Target::Trace);
    }
}

impl Generator for Linear {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn generate(&self, table: &[Personality], set: &TraceSet) -> Generated {
        assemble(table, |section, p, idx| {
            let mut lower = None;
            for nr in 0..p.nsyscalls {
                if set.is_traced(nr, idx) {
                    lower.get_or_insert(nr);
                } else if let Some(start) = lower.take() {
                    range(section, start | p.flag, nr | p.flag);
                }
            }
            if let Some(start) = lower {
                range(section, start | p.flag, p.nsyscalls | p.flag);
            }
            section.jump(
                BPF_JGE | BPF_K,
                p.nsyscalls | p.flag,
                Target::Trace,
                Target::Allow,
            );
        })
    }
}
