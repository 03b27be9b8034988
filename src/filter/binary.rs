//! Bitmask filter.
//!
//! Syscall numbers are split into blocks of 32. Each block gets a 32-bit
//! mask with one bit per traced number, and a section tests the bit of
//! `nr` in the mask of block `nr / 32`:
//!
//! ```text
//! X = 1 << (nr & 31);
//! A = nr >> 5;
//! if (A == 0) return (X & mask0) ? TRACE : ALLOW;
//! if (A == 1) return ALLOW;                  ; mask1 == 0
//! if (A == 2) return TRACE;                  ; mask2 == !0
//! ...
//! return TRACE;                              ; past the table
//! ```
//!
//! The program length only depends on the table size, not on how scattered
//! the traced numbers are.

use crate::bpf::{
    BPF_ABS, BPF_ALU, BPF_AND, BPF_IMM, BPF_JEQ, BPF_JSET, BPF_K, BPF_LD, BPF_LSH, BPF_MISC,
    BPF_RSH, BPF_TAX, BPF_TXA, BPF_W, BPF_X, OFFSET_NR,
};
use crate::filter::{assemble, Generated, Generator, Section, Target};
use crate::personality::Personality;
use crate::trace_set::TraceSet;

pub struct BinaryMatch;

/// Mask of block `block`; numbers past the table count as traced.
fn block_mask(set: &TraceSet, p: &Personality, idx: usize, block: u32) -> u32 {
    (0..32).fold(0, |mask, bit| {
        let nr = block * 32 + bit;
        if nr >= p.nsyscalls || set.is_traced(nr, idx) {
            mask | 1 << bit
        } else {
            mask
        }
    })
}

fn match_block(section: &mut Section, block: u32, mask: u32) {
    match mask {
        0 => section.jump(BPF_JEQ | BPF_K, block, Target::Allow, Target::Skip(0)),
        u32::MAX => section.jump(BPF_JEQ | BPF_K, block, Target::Trace, Target::Skip(0)),
        _ => {
            section.jump(BPF_JEQ | BPF_K, block, Target::Skip(0), Target::Skip(2));
            section.stmt(BPF_MISC | BPF_TXA, 0);
            section.jump(BPF_JSET | BPF_K, mask, Target::Trace, Target::Allow);
        }
    }
}

impl Generator for BinaryMatch {
    fn name(&self) -> &'static str {
        "binary-match"
    }

    fn generate(&self, table: &[Personality], set: &TraceSet) -> Generated {
        assemble(table, |section, p, idx| {
            // A holds nr; the disambiguation flag is above bit 4, so the bit
            // index needs no masking
            section.stmt(BPF_ALU | BPF_AND | BPF_K, 0x1f);
            section.stmt(BPF_MISC | BPF_TAX, 0);
            section.stmt(BPF_LD | BPF_W | BPF_IMM, 1);
            section.stmt(BPF_ALU | BPF_LSH | BPF_X, 0);
            section.stmt(BPF_MISC | BPF_TAX, 0);

            section.stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_NR);
            if p.flag != 0 {
                section.stmt(BPF_ALU | BPF_AND | BPF_K, !p.flag);
            }
            section.stmt(BPF_ALU | BPF_RSH | BPF_K, 5);

            let blocks = (p.nsyscalls + 31) / 32;
            for block in 0..blocks {
                match_block(section, block, block_mask(set, p, idx, block));
            }
            section.always(Target::Trace);
        })
    }
}
