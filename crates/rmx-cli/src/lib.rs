//! remux command-line interface
//!
//! Connection targets, command implementations and terminal output
//! helpers behind the `remux` binary.

pub mod commands;
pub mod output;
pub mod target;
