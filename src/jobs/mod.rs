//! Ready-made [`Job`](crate::scheduler::Job) implementations.

pub mod shell;

pub use shell::ShellJob;
