//! Generic utility primitives with zero domain knowledge.
//!
//! - `command` - Command execution with error handling, stdin piping and timeouts
//! - `io` - File I/O with consistent error handling

pub mod command;
pub mod io;
