//! causeway-core — wire frames, dialback key derivation, and configuration.
//! All other Causeway crates depend on this one.

pub mod config;
pub mod keys;
pub mod wire;

pub use wire::{domain_of, Envelope, Frame, StreamHeader, NAMESPACE};
