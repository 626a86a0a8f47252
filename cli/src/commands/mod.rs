//! Subcommand implementations

pub mod client;
pub mod collect;
pub mod snapshot;
