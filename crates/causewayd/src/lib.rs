//! causewayd — the federation daemon: transport framing, the inbound and
//! outbound dialback state machines, packet dispatch, and the sweeper.
//!
//! Exposed as a library so the integration suite can run whole nodes
//! in-process; the binary in `main.rs` wires the same pieces to real
//! configuration, DNS, and a logging delivery port.

pub mod dispatch;
pub mod federation;
pub mod net;
pub mod resolver;
pub mod sweeper;
