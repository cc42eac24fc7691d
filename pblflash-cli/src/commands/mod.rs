//! Command implementations.
//!
//! Each subcommand that talks to a device lives in its own module.

pub(crate) mod flash;
pub(crate) mod query;
