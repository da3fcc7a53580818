//! CLI subcommands.

pub mod cleanup;
pub mod common;
pub mod export;
pub mod seed;
