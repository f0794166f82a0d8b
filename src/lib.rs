//! fwmgr - per-user firewall policy manager
//!
//! Keeps a record of users (each bound to one address of a managed subnet and
//! a forwarding mode) and their access rules, compiles that record into
//! iptables directives, and loads them into the kernel in one atomic
//! `iptables-restore` batch.
//!
//! # Architecture
//!
//! - [`core`] - data model, compiler, batch rendering, applier, verification, store
//! - [`audit`] - audit logging for mutations and privileged operations
//! - [`validators`] - input validation and sanitization
//! - [`config`] - configuration persistence
//! - [`elevation`] - sudo/run0/pkexec wrapping of the enforcement tools
//! - [`utils`] - XDG directories, binary lookup
//!
//! # Safety Properties
//!
//! - Compilation is pure and deterministic; the whole policy is validated
//!   before a single directive is emitted
//! - Administrative access (loopback, established connections, admin ports)
//!   is emitted ahead of every user directive
//! - Loads are atomic and idempotent: every owned chain is flushed and
//!   repopulated inside one batch
//! - The batch file is private (0600) and removed on every exit path
//!
//! # Example
//!
//! ```
//! use fwmgr::core::batch::render_batch;
//! use fwmgr::core::store::{NewRule, NewUser, PolicyDatabase, PolicyStore};
//! use fwmgr::{compile, Action, ForwardMode, InputPolicy, NetworkConfig, Protocol};
//!
//! let mut db = PolicyDatabase::new();
//! db.initialize(NetworkConfig::parse("10.0.0.1", "10.0.0.0/24")?)?;
//! db.add_user(NewUser {
//!     name: "alice".into(),
//!     mode: ForwardMode::Route,
//!     ..NewUser::default()
//! })?;
//! db.add_rule(NewRule {
//!     user: "alice".into(),
//!     destination: "1.1.1.1".parse()?,
//!     port: Some(80),
//!     protocol: Protocol::Tcp,
//!     action: Action::Accept,
//! })?;
//!
//! let set = compile(&db.snapshot()?, &InputPolicy::default())?;
//! assert!(render_batch(&set).contains("-A FORWARD -s 10.0.0.2 -d 1.1.1.1 -p tcp --dport 80 -j ACCEPT"));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use crate::core::applier::{ApplierSettings, ApplyReport, PolicyApplier};
pub use crate::core::compiler::{compile, DirectiveSet, InputPolicy};
pub use crate::core::error::{Error, Result};
pub use crate::core::model::{Action, Destination, ForwardMode, NetworkConfig, Protocol, Rule, Snapshot, User};
