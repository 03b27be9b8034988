pub mod order_probe;
pub mod ptrace;
