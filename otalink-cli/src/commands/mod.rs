//! Command implementations.
//!
//! Each subcommand is implemented in its own module.

pub(crate) mod completions;
pub(crate) mod console;
pub(crate) mod info;
pub(crate) mod send;
