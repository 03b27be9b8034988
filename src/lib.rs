#![deny(clippy::print_stdout, clippy::print_stderr, clippy::unwrap_used)]

pub mod bpf;
pub mod filter;
pub mod personality;
pub mod restart;
pub mod result;
pub mod syscalls;
pub mod trace_set;
pub mod tracer;
