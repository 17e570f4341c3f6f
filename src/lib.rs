//! sockpty: run a command inside a pseudo-terminal owned by a local daemon.
//!
//! The client forwards its own terminal's input, output, and resize events
//! over a multiplexed unix-socket session and exits with the remote
//! command's exit code.

pub mod client;
pub mod config;
pub mod server;
