//! webprobe CLI
//!
//! Command-line surface for running scenario suites, listing scenarios and
//! commands, and managing configuration.

pub mod commands;
pub mod output;
