//! Core library for sockpty.
//!
//! Holds everything both halves of a session share: the rendezvous socket
//! paths, the wire protocol, and the channel multiplexer that carves one
//! unix-socket connection into the Info/Control/Data streams.

pub mod mux;
pub mod paths;
pub mod protocol;

pub use mux::{Channel, ChannelRole, MuxSession};
pub use paths::{Rendezvous, SocketGuard};
