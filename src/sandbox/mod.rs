//! Sandbox supervisor (C11): spawns the untrusted child process, injects
//! per-execution broker endpoints via a preamble, and owns the child's
//! lifecycle from scratch-file write through teardown.

pub mod preamble;
pub mod supervisor;

pub use supervisor::{Permissions, SandboxOutcome, SandboxSpec, Supervisor};
