//! Shared test utilities for core module tests
//!
//! Provides fixture builders so unit tests describe policies in one line.
//! This module is only compiled in test mode.

use crate::core::applier::ApplierSettings;
use crate::core::model::{
    Action, ForwardMode, NetworkConfig, Protocol, Rule, RuleId, Snapshot, User, UserId, UserKind,
    UserPolicy,
};
use chrono::{DateTime, Utc};
use std::sync::Mutex;

/// Mutex for tests that need exclusive access to environment variables.
///
/// # Example
///
/// ```ignore
/// let _guard = ENV_VAR_MUTEX.lock().unwrap();
/// unsafe {
///     std::env::set_var("FWMGR_ELEVATION_METHOD", "sudo");
/// }
/// // ... test with custom env state ...
/// unsafe {
///     std::env::remove_var("FWMGR_ELEVATION_METHOD");
/// }
/// ```
pub static ENV_VAR_MUTEX: Mutex<()> = Mutex::new(());

/// `10.0.0.0/24` with the gateway on `10.0.0.1`.
pub fn network() -> NetworkConfig {
    NetworkConfig::parse("10.0.0.1", "10.0.0.0/24").unwrap()
}

/// Fixed timestamp derived from an id, so fixtures sort by id by default.
pub fn timestamp(seconds: u64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + i64::try_from(seconds).unwrap(), 0).unwrap()
}

pub fn user(id: u64, name: &str, address: &str, mode: ForwardMode) -> User {
    User {
        id: UserId(id),
        name: name.to_string(),
        address: address.parse().unwrap(),
        mode,
        full_name: None,
        email: None,
        contact: None,
        kind: UserKind::Employee,
        created_at: timestamp(id),
    }
}

pub fn rule(
    id: u64,
    owner: &User,
    destination: &str,
    port: Option<u16>,
    protocol: Protocol,
    action: Action,
) -> Rule {
    Rule {
        id: RuleId(id),
        user_id: owner.id,
        destination: destination.parse().unwrap(),
        port,
        protocol,
        action,
        created_at: timestamp(id),
    }
}

/// Snapshot over [`network`] with the given users and rules, in input order.
pub fn snapshot(users: Vec<(User, Vec<Rule>)>) -> Snapshot {
    Snapshot::new(
        network(),
        users
            .into_iter()
            .map(|(user, rules)| UserPolicy { user, rules })
            .collect(),
    )
}

/// Applier settings that run `sh -c <script>` in place of both tools.
///
/// The mode argument (`--noflush` or `--test`) arrives as `$0`.
pub fn shell_settings(script: &str) -> ApplierSettings {
    ApplierSettings {
        restore_command: "sh".to_string(),
        restore_args: vec!["-c".to_string(), script.to_string()],
        save_command: "sh".to_string(),
        save_args: vec!["-c".to_string(), script.to_string()],
        timeout_secs: 10,
        elevate: false,
    }
}
