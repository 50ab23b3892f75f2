//! Process entry point for the `twopc` replicated store. [Author fengyang]
//!
//! The binary plays one of two roles, chosen on the command line: the
//! coordinator (`-m`) or a replica (`-r -i <index>`). Both roles share the
//! same logging setup ([`trace`]) and on-disk config ([`config`]); the 2PC
//! state machines themselves live in the `twopc` library crate.

pub mod config;
pub mod trace;
