//! Shared building blocks for Toolgear
//!
//! This crate holds everything both sides of a client/collector connection
//! agree on: the wire codec and framed transport, the message tag table,
//! request correlation, the program vocabulary types and the MD snapshot
//! store.

pub mod md;
pub mod protocol;
pub mod types;
pub mod utils;

pub use types::program::*;
