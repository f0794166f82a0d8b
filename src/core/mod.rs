//! Core policy management functionality
//!
//! - [`model`]: Typed users, rules and network configuration
//! - [`allocator`]: Free-address allocation from the user subnet
//! - [`compiler`]: Snapshot to ordered packet-filter directives
//! - [`batch`]: iptables-restore wire format
//! - [`applier`]: Atomic load through iptables-restore
//! - [`verify`]: Batch diagnostics and live-state comparison
//! - [`store`]: Policy records and their JSON persistence
//! - [`error`]: Error types

pub mod allocator;
pub mod applier;
pub mod batch;
pub mod compiler;
pub mod error;
pub mod model;
pub mod store;
pub mod verify;

#[cfg(test)]
pub mod test_helpers;
