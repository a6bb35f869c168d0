//! CLI command implementations.
//!
//! Each submodule implements one `sandtrap` subcommand; pure logic is kept
//! apart from IO where it can be.

pub mod check;
pub mod init;
pub mod replay;
pub mod serve;
