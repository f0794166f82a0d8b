//! Policy store
//!
//! The record store behind the compiler: one JSON document holding the
//! network configuration, users and rules. [`PolicyDatabase`] carries the
//! CRUD operations and rejects contradictory edits as they are made;
//! [`JsonStore`] persists it atomically. Snapshots handed to the compiler are
//! taken from one loaded document, so they are always consistent.

use crate::core::allocator::next_available_address;
use crate::core::error::{Error, Result, StoreError, Violation};
use crate::core::model::{
    check_port, Action, Destination, ForwardMode, NetworkConfig, Protocol, Rule, RuleId, Snapshot,
    User, UserId, UserKind, UserPolicy,
};
use crate::utils::compute_checksum;
use crate::validators;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// On-disk format version
pub const STORE_VERSION: u32 = 1;

/// Upper bound on stored rules, checked on load and on insert
pub const MAX_RULES: usize = 10_000;

/// Read seam between the CLI and whatever holds the policy records.
pub trait PolicyStore {
    /// Point-in-time view of the network, users and rules.
    ///
    /// # Errors
    ///
    /// Fails if the network is not configured or the records are inconsistent.
    fn snapshot(&self) -> Result<Snapshot>;
}

/// Fields of a user to be created
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub name: String,
    /// `None` allocates the first free address of the subnet
    pub address: Option<Ipv4Addr>,
    pub mode: ForwardMode,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub contact: Option<String>,
    pub kind: UserKind,
}

/// Partial update of a user; `None` leaves a field unchanged
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub address: Option<Ipv4Addr>,
    pub mode: Option<ForwardMode>,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub contact: Option<String>,
    pub kind: Option<UserKind>,
}

/// Fields of a rule to be created
#[derive(Debug, Clone)]
pub struct NewRule {
    /// Owning user, by name
    pub user: String,
    pub destination: Destination,
    pub port: Option<u16>,
    pub protocol: Protocol,
    pub action: Action,
}

#[derive(Debug, Clone, Default)]
pub struct RuleFilter {
    pub user: Option<String>,
    pub protocol: Option<Protocol>,
    pub action: Option<Action>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDatabase {
    pub version: u32,
    #[serde(default)]
    network: Option<NetworkConfig>,
    next_user_id: u64,
    next_rule_id: u64,
    #[serde(default)]
    users: Vec<User>,
    #[serde(default)]
    rules: Vec<Rule>,
}

impl Default for PolicyDatabase {
    fn default() -> Self {
        Self {
            version: STORE_VERSION,
            network: None,
            next_user_id: 1,
            next_rule_id: 1,
            users: Vec::new(),
            rules: Vec::new(),
        }
    }
}

fn clean_metadata(value: Option<String>) -> Option<String> {
    value
        .map(|v| validators::sanitize_metadata(&v))
        .filter(|v| !v.is_empty())
}

fn clean_email(user: &str, value: Option<String>) -> Result<Option<String>> {
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(email) => validators::validate_email(email)
            .map(Some)
            .map_err(|e| Error::user_violation(user, Violation::Malformed(e))),
    }
}

impl PolicyDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn network(&self) -> Option<&NetworkConfig> {
        self.network.as_ref()
    }

    /// # Errors
    ///
    /// `StoreError::NotInitialized` before `initialize` has run.
    pub fn require_network(&self) -> Result<&NetworkConfig> {
        self.network
            .as_ref()
            .ok_or(Error::Store(StoreError::NotInitialized))
    }

    /// Sets (or replaces) the network configuration.
    ///
    /// Existing users must remain valid under the new configuration.
    ///
    /// # Errors
    ///
    /// `Error::PolicyValidation` for the first user the new network would
    /// invalidate.
    pub fn initialize(&mut self, network: NetworkConfig) -> Result<()> {
        for user in self.users() {
            Self::check_placement(&network, &user.name, user.address)?;
        }
        info!(
            "Network configured: host {} subnet {}",
            network.host_address(),
            network.subnet()
        );
        self.network = Some(network);
        Ok(())
    }

    /// Address must lie inside the subnet and differ from the host address.
    fn check_placement(network: &NetworkConfig, name: &str, address: Ipv4Addr) -> Result<()> {
        if !network.contains(address) {
            return Err(Error::user_violation(
                name,
                Violation::AddressOutsideSubnet {
                    address: address.to_string(),
                    subnet: network.subnet().to_string(),
                },
            ));
        }
        if address == network.host_address() {
            return Err(Error::user_violation(
                name,
                Violation::HostAddressAssigned(address.to_string()),
            ));
        }
        Ok(())
    }

    /// Users in ascending id order.
    pub fn users(&self) -> Vec<&User> {
        let mut users: Vec<&User> = self.users.iter().collect();
        users.sort_by_key(|u| u.id);
        users
    }

    /// # Errors
    ///
    /// `StoreError::UserNotFound` if no user has this name.
    pub fn user(&self, name: &str) -> Result<&User> {
        self.users
            .iter()
            .find(|u| u.name == name)
            .ok_or_else(|| Error::Store(StoreError::UserNotFound(name.to_string())))
    }

    fn user_index(&self, name: &str) -> Result<usize> {
        self.users
            .iter()
            .position(|u| u.name == name)
            .ok_or_else(|| Error::Store(StoreError::UserNotFound(name.to_string())))
    }

    /// The address the next user would get.
    ///
    /// # Errors
    ///
    /// `StoreError::NotInitialized` or `StoreError::AddressPoolExhausted`.
    pub fn next_address(&self) -> Result<Ipv4Addr> {
        let network = self.require_network()?;
        next_available_address(network, self.users.iter().map(|u| u.address)).ok_or_else(|| {
            Error::Store(StoreError::AddressPoolExhausted(network.subnet().to_string()))
        })
    }

    /// Checks that `address` is usable by the user named `name`.
    fn check_address(&self, name: &str, address: Ipv4Addr) -> Result<()> {
        Self::check_placement(self.require_network()?, name, address)?;
        if let Some(owner) = self
            .users
            .iter()
            .find(|u| u.address == address && u.name != name)
        {
            return Err(Error::user_violation(
                name,
                Violation::DuplicateAddress {
                    address: address.to_string(),
                    owner: owner.name.clone(),
                },
            ));
        }
        Ok(())
    }

    /// Registers a user, allocating an address when none is given.
    ///
    /// # Errors
    ///
    /// `Error::PolicyValidation` for an invalid or taken name or address,
    /// `Error::Store` when the network is not configured or the pool is
    /// exhausted.
    pub fn add_user(&mut self, new: NewUser) -> Result<User> {
        self.require_network()?;

        let name = validators::validate_username(&new.name)
            .map_err(|e| Error::user_violation(new.name.trim(), Violation::Malformed(e)))?;
        if let Some(existing) = self.users.iter().find(|u| u.name == name) {
            return Err(Error::user_violation(
                &name,
                Violation::DuplicateName(existing.id.0),
            ));
        }

        let address = match new.address {
            Some(address) => address,
            None => self.next_address()?,
        };
        self.check_address(&name, address)?;

        let email = clean_email(&name, new.email)?;

        let user = User {
            id: UserId(self.next_user_id),
            name,
            address,
            mode: new.mode,
            full_name: clean_metadata(new.full_name),
            email,
            contact: clean_metadata(new.contact),
            kind: new.kind,
            created_at: Utc::now(),
        };
        self.next_user_id += 1;

        info!(
            "Added user '{}' (#{}) at {} mode {}",
            user.name, user.id, user.address, user.mode
        );
        self.users.push(user.clone());
        Ok(user)
    }

    /// Edits a user's address, forwarding mode or metadata.
    ///
    /// # Errors
    ///
    /// `Error::PolicyValidation` if the new address is unusable, or if the
    /// switch to NAT would turn one of the user's DROP rules into a
    /// contradiction.
    pub fn update_user(&mut self, name: &str, update: UserUpdate) -> Result<User> {
        let index = self.user_index(name)?;
        let id = self.users[index].id;

        if let Some(address) = update.address {
            self.check_address(name, address)?;
        }

        if update.mode == Some(ForwardMode::Nat)
            && let Some(drop_rule) = self
                .rules_of(id)
                .into_iter()
                .find(|r| r.action == Action::Drop)
        {
            return Err(Error::rule_violation(
                name,
                drop_rule.id,
                Violation::DropUnderNat,
            ));
        }

        let email = match update.email {
            Some(email) => Some(clean_email(name, Some(email))?),
            None => None,
        };

        let user = &mut self.users[index];
        if let Some(address) = update.address {
            user.address = address;
        }
        if let Some(mode) = update.mode {
            user.mode = mode;
        }
        if let Some(full_name) = update.full_name {
            user.full_name = clean_metadata(Some(full_name));
        }
        if let Some(email) = email {
            user.email = email;
        }
        if let Some(contact) = update.contact {
            user.contact = clean_metadata(Some(contact));
        }
        if let Some(kind) = update.kind {
            user.kind = kind;
        }

        debug!("Updated user '{}'", user.name);
        Ok(user.clone())
    }

    /// Removes a user and every rule it owns.
    ///
    /// Returns the removed user and the number of rules removed with it.
    ///
    /// # Errors
    ///
    /// `StoreError::UserNotFound`.
    pub fn delete_user(&mut self, name: &str) -> Result<(User, usize)> {
        let index = self.user_index(name)?;
        let user = self.users.remove(index);

        let before = self.rules.len();
        self.rules.retain(|r| r.user_id != user.id);
        let removed = before - self.rules.len();

        info!("Removed user '{}' and {removed} rule(s)", user.name);
        Ok((user, removed))
    }

    /// Rules of one user in creation order.
    pub fn rules_of(&self, user: UserId) -> Vec<&Rule> {
        let mut rules: Vec<&Rule> = self.rules.iter().filter(|r| r.user_id == user).collect();
        rules.sort_by_key(|r| r.sort_key());
        rules
    }

    /// Rules matching the filter, ordered by owner id then creation order.
    ///
    /// # Errors
    ///
    /// `StoreError::UserNotFound` if the filter names an unknown user.
    pub fn rules(&self, filter: &RuleFilter) -> Result<Vec<&Rule>> {
        let owner = match filter.user {
            Some(ref name) => Some(self.user(name)?.id),
            None => None,
        };

        let mut rules: Vec<&Rule> = self
            .rules
            .iter()
            .filter(|r| owner.is_none_or(|id| r.user_id == id))
            .filter(|r| filter.protocol.is_none_or(|p| r.protocol == p))
            .filter(|r| filter.action.is_none_or(|a| r.action == a))
            .collect();
        rules.sort_by_key(|r| (r.user_id, r.sort_key()));
        Ok(rules)
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Adds an access rule to a user.
    ///
    /// # Errors
    ///
    /// `Error::PolicyValidation` for a port with protocol `all`, port 0, or a
    /// DROP rule for a NAT user; `StoreError` for an unknown user or a full
    /// store.
    pub fn add_rule(&mut self, new: NewRule) -> Result<Rule> {
        let owner = self.user(&new.user)?.clone();

        check_port(new.protocol, new.port)
            .map_err(|reason| Error::user_violation(&owner.name, reason))?;

        if owner.mode == ForwardMode::Nat && new.action == Action::Drop {
            return Err(Error::user_violation(&owner.name, Violation::DropUnderNat));
        }

        if self.rules.len() >= MAX_RULES {
            return Err(Error::Store(StoreError::TooManyRules {
                found: self.rules.len() + 1,
                max: MAX_RULES,
            }));
        }

        let rule = Rule {
            id: RuleId(self.next_rule_id),
            user_id: owner.id,
            destination: new.destination,
            port: new.port,
            protocol: new.protocol,
            action: new.action,
            created_at: Utc::now(),
        };
        self.next_rule_id += 1;

        info!(
            "Added rule #{} for '{}': {} {} {}{}",
            rule.id,
            owner.name,
            rule.action,
            rule.protocol,
            rule.destination,
            rule.port.map(|p| format!(":{p}")).unwrap_or_default()
        );
        self.rules.push(rule.clone());
        Ok(rule)
    }

    /// # Errors
    ///
    /// `StoreError::RuleNotFound`.
    pub fn delete_rule(&mut self, id: RuleId) -> Result<Rule> {
        let index = self
            .rules
            .iter()
            .position(|r| r.id == id)
            .ok_or(Error::Store(StoreError::RuleNotFound(id.0)))?;
        let rule = self.rules.remove(index);
        info!("Removed rule #{}", rule.id);
        Ok(rule)
    }

    /// Structural checks for a document read from disk.
    fn check_integrity(&self) -> Result<()> {
        if self.version != STORE_VERSION {
            return Err(Error::Store(StoreError::VersionMismatch {
                found: self.version,
                expected: STORE_VERSION,
            }));
        }
        if self.rules.len() > MAX_RULES {
            return Err(Error::Store(StoreError::TooManyRules {
                found: self.rules.len(),
                max: MAX_RULES,
            }));
        }
        Ok(())
    }
}

impl PolicyStore for PolicyDatabase {
    fn snapshot(&self) -> Result<Snapshot> {
        let network = self.require_network()?.clone();

        let mut by_user: BTreeMap<UserId, Vec<Rule>> =
            self.users.iter().map(|u| (u.id, Vec::new())).collect();
        for rule in &self.rules {
            let Some(rules) = by_user.get_mut(&rule.user_id) else {
                return Err(Error::Store(StoreError::OrphanRule {
                    rule: rule.id.0,
                    user: rule.user_id.0,
                }));
            };
            rules.push(rule.clone());
        }

        let users = self
            .users()
            .into_iter()
            .map(|user| UserPolicy {
                user: user.clone(),
                rules: by_user.remove(&user.id).unwrap_or_default(),
            })
            .collect();

        Ok(Snapshot::new(network, users))
    }
}

/// JSON file persistence for a [`PolicyDatabase`]
#[derive(Debug, Clone)]
pub struct JsonStore {
    path: PathBuf,
}

impl JsonStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<data dir>/policy.json`
    ///
    /// # Errors
    ///
    /// `StoreError::DataDirUnavailable` when no home directory is known.
    pub fn default_path() -> Result<PathBuf> {
        crate::utils::get_data_dir()
            .map(|dir| dir.join("policy.json"))
            .ok_or(Error::Store(StoreError::DataDirUnavailable))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn checksum_path(&self) -> PathBuf {
        let mut path = self.path.clone().into_os_string();
        path.push(".sha256");
        PathBuf::from(path)
    }

    /// Loads the document, or an empty one if the file does not exist yet.
    ///
    /// A checksum mismatch only warns (the file may have been edited by hand).
    ///
    /// # Errors
    ///
    /// I/O or JSON errors, and `StoreError` for a foreign version or an
    /// oversized document.
    pub async fn load(&self) -> Result<PolicyDatabase> {
        if !tokio::fs::try_exists(&self.path).await? {
            debug!("No policy store at {}, starting empty", self.path.display());
            return Ok(PolicyDatabase::new());
        }

        let json = tokio::fs::read_to_string(&self.path).await?;

        if let Ok(expected) = tokio::fs::read_to_string(self.checksum_path()).await {
            let actual = compute_checksum(&json);
            if expected.trim() != actual {
                warn!(
                    "Policy store {} checksum mismatch (expected: {}, got: {})",
                    self.path.display(),
                    expected.trim(),
                    actual
                );
            }
        }

        let db: PolicyDatabase = serde_json::from_str(&json)?;
        db.check_integrity()?;
        Ok(db)
    }

    /// Saves the document atomically (0600 temp file, fsync, rename), then
    /// refreshes the checksum sidecar.
    ///
    /// # Errors
    ///
    /// I/O or JSON errors.
    pub async fn save(&self, db: &PolicyDatabase) -> Result<()> {
        use tokio::fs::OpenOptions;
        use tokio::io::AsyncWriteExt;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(db)?;

        let mut temp_path = self.path.clone().into_os_string();
        temp_path.push(".tmp");
        let temp_path = PathBuf::from(temp_path);

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(&temp_path)
            .await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&temp_path, &self.path).await?;

        let checksum = compute_checksum(&json);
        tokio::fs::write(self.checksum_path(), checksum).await?;

        debug!("Saved policy store to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::network;

    fn db() -> PolicyDatabase {
        let mut db = PolicyDatabase::new();
        db.initialize(network()).unwrap();
        db
    }

    fn new_user(name: &str, mode: ForwardMode) -> NewUser {
        NewUser {
            name: name.to_string(),
            mode,
            ..NewUser::default()
        }
    }

    fn new_rule(user: &str, dest: &str, port: Option<u16>, protocol: Protocol, action: Action) -> NewRule {
        NewRule {
            user: user.to_string(),
            destination: dest.parse().unwrap(),
            port,
            protocol,
            action,
        }
    }

    #[test]
    fn test_add_user_allocates_addresses_in_order() {
        let mut db = db();
        let a = db.add_user(new_user("alice", ForwardMode::Route)).unwrap();
        let b = db.add_user(new_user("bob", ForwardMode::Nat)).unwrap();
        assert_eq!(a.address, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(b.address, Ipv4Addr::new(10, 0, 0, 3));
        assert_eq!(db.next_address().unwrap(), Ipv4Addr::new(10, 0, 0, 4));
        assert!(a.id < b.id);
    }

    #[test]
    fn test_add_user_requires_network() {
        let mut db = PolicyDatabase::new();
        let err = db.add_user(new_user("alice", ForwardMode::Route)).unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::NotInitialized)));
    }

    #[test]
    fn test_add_user_rejects_duplicates() {
        let mut db = db();
        db.add_user(new_user("alice", ForwardMode::Route)).unwrap();

        let err = db.add_user(new_user("alice", ForwardMode::Nat)).unwrap_err();
        assert!(matches!(
            err,
            Error::PolicyValidation {
                reason: Violation::DuplicateName(_),
                ..
            }
        ));

        let err = db
            .add_user(NewUser {
                address: Some(Ipv4Addr::new(10, 0, 0, 2)),
                ..new_user("carol", ForwardMode::Route)
            })
            .unwrap_err();
        assert!(matches!(
            err,
            Error::PolicyValidation {
                reason: Violation::DuplicateAddress { .. },
                ..
            }
        ));
    }

    #[test]
    fn test_add_user_rejects_host_and_foreign_addresses() {
        let mut db = db();
        let host = db.add_user(NewUser {
            address: Some(Ipv4Addr::new(10, 0, 0, 1)),
            ..new_user("gw", ForwardMode::Route)
        });
        assert!(matches!(
            host,
            Err(Error::PolicyValidation {
                reason: Violation::HostAddressAssigned(_),
                ..
            })
        ));

        let outside = db.add_user(NewUser {
            address: Some(Ipv4Addr::new(192, 168, 1, 5)),
            ..new_user("far", ForwardMode::Route)
        });
        assert!(matches!(
            outside,
            Err(Error::PolicyValidation {
                reason: Violation::AddressOutsideSubnet { .. },
                ..
            })
        ));
    }

    #[test]
    fn test_add_user_validates_metadata() {
        let mut db = db();
        assert!(db.add_user(new_user("bad name", ForwardMode::Route)).is_err());
        assert!(
            db.add_user(NewUser {
                email: Some("not-an-email".to_string()),
                ..new_user("dave", ForwardMode::Route)
            })
            .is_err()
        );

        let user = db
            .add_user(NewUser {
                full_name: Some("Dave \"The Admin\" Doe\n".to_string()),
                email: Some(" dave@example.com ".to_string()),
                ..new_user("dave", ForwardMode::Route)
            })
            .unwrap();
        assert_eq!(user.full_name.as_deref(), Some("Dave The Admin Doe"));
        assert_eq!(user.email.as_deref(), Some("dave@example.com"));
    }

    #[test]
    fn test_drop_rule_rejected_for_nat_user() {
        let mut db = db();
        db.add_user(new_user("bob", ForwardMode::Nat)).unwrap();
        let err = db
            .add_rule(new_rule("bob", "8.8.8.8", None, Protocol::Tcp, Action::Drop))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::PolicyValidation {
                reason: Violation::DropUnderNat,
                ..
            }
        ));
    }

    #[test]
    fn test_port_with_protocol_all_rejected() {
        let mut db = db();
        db.add_user(new_user("alice", ForwardMode::Route)).unwrap();
        let err = db
            .add_rule(new_rule("alice", "1.1.1.1", Some(80), Protocol::All, Action::Accept))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::PolicyValidation {
                reason: Violation::PortWithoutProtocol,
                ..
            }
        ));
    }

    #[test]
    fn test_switch_to_nat_blocked_by_drop_rules() {
        let mut db = db();
        db.add_user(new_user("alice", ForwardMode::Route)).unwrap();
        let drop = db
            .add_rule(new_rule("alice", "10.20.0.0/16", None, Protocol::All, Action::Drop))
            .unwrap();

        let err = db
            .update_user(
                "alice",
                UserUpdate {
                    mode: Some(ForwardMode::Nat),
                    ..UserUpdate::default()
                },
            )
            .unwrap_err();
        assert!(matches!(
            err,
            Error::PolicyValidation { rule: Some(id), reason: Violation::DropUnderNat, .. } if id == drop.id
        ));

        db.delete_rule(drop.id).unwrap();
        let user = db
            .update_user(
                "alice",
                UserUpdate {
                    mode: Some(ForwardMode::Nat),
                    ..UserUpdate::default()
                },
            )
            .unwrap();
        assert_eq!(user.mode, ForwardMode::Nat);
    }

    #[test]
    fn test_update_user_address_keeps_own_address_valid() {
        let mut db = db();
        let alice = db.add_user(new_user("alice", ForwardMode::Route)).unwrap();
        db.add_user(new_user("bob", ForwardMode::Route)).unwrap();

        // Re-asserting the current address is not a conflict
        let same = db.update_user(
            "alice",
            UserUpdate {
                address: Some(alice.address),
                ..UserUpdate::default()
            },
        );
        assert!(same.is_ok());

        let taken = db.update_user(
            "alice",
            UserUpdate {
                address: Some(Ipv4Addr::new(10, 0, 0, 3)),
                ..UserUpdate::default()
            },
        );
        assert!(taken.is_err());

        let moved = db
            .update_user(
                "alice",
                UserUpdate {
                    address: Some(Ipv4Addr::new(10, 0, 0, 50)),
                    ..UserUpdate::default()
                },
            )
            .unwrap();
        assert_eq!(moved.address, Ipv4Addr::new(10, 0, 0, 50));
        assert_eq!(db.next_address().unwrap(), Ipv4Addr::new(10, 0, 0, 2));
    }

    #[test]
    fn test_delete_user_cascades_rules() {
        let mut db = db();
        db.add_user(new_user("alice", ForwardMode::Route)).unwrap();
        db.add_user(new_user("bob", ForwardMode::Route)).unwrap();
        db.add_rule(new_rule("alice", "1.1.1.1", Some(80), Protocol::Tcp, Action::Accept))
            .unwrap();
        db.add_rule(new_rule("alice", "1.0.0.1", Some(443), Protocol::Tcp, Action::Accept))
            .unwrap();
        db.add_rule(new_rule("bob", "9.9.9.9", None, Protocol::All, Action::Drop))
            .unwrap();

        let (user, removed) = db.delete_user("alice").unwrap();
        assert_eq!(user.name, "alice");
        assert_eq!(removed, 2);
        assert_eq!(db.rule_count(), 1);
        assert!(matches!(
            db.delete_user("alice"),
            Err(Error::Store(StoreError::UserNotFound(_)))
        ));
    }

    #[test]
    fn test_rule_filter() {
        let mut db = db();
        db.add_user(new_user("alice", ForwardMode::Route)).unwrap();
        db.add_user(new_user("bob", ForwardMode::Nat)).unwrap();
        db.add_rule(new_rule("alice", "1.1.1.1", Some(80), Protocol::Tcp, Action::Accept))
            .unwrap();
        db.add_rule(new_rule("alice", "10.9.0.0/16", None, Protocol::All, Action::Drop))
            .unwrap();
        db.add_rule(new_rule("bob", "8.8.8.8", Some(53), Protocol::Udp, Action::Accept))
            .unwrap();

        assert_eq!(db.rules(&RuleFilter::default()).unwrap().len(), 3);
        let alice_rules = db
            .rules(&RuleFilter {
                user: Some("alice".to_string()),
                ..RuleFilter::default()
            })
            .unwrap();
        assert_eq!(alice_rules.len(), 2);

        let drops = db
            .rules(&RuleFilter {
                action: Some(Action::Drop),
                ..RuleFilter::default()
            })
            .unwrap();
        assert_eq!(drops.len(), 1);

        let udp = db
            .rules(&RuleFilter {
                protocol: Some(Protocol::Udp),
                ..RuleFilter::default()
            })
            .unwrap();
        assert_eq!(udp[0].port, Some(53));

        assert!(
            db.rules(&RuleFilter {
                user: Some("nobody".to_string()),
                ..RuleFilter::default()
            })
            .is_err()
        );
    }

    #[test]
    fn test_snapshot_groups_rules_by_user() {
        let mut db = db();
        db.add_user(new_user("alice", ForwardMode::Route)).unwrap();
        db.add_user(new_user("bob", ForwardMode::Nat)).unwrap();
        db.add_rule(new_rule("bob", "8.8.8.8", Some(53), Protocol::Udp, Action::Accept))
            .unwrap();
        db.add_rule(new_rule("alice", "1.1.1.1", Some(80), Protocol::Tcp, Action::Accept))
            .unwrap();

        let snapshot = db.snapshot().unwrap();
        assert_eq!(snapshot.users.len(), 2);
        assert_eq!(snapshot.users[0].user.name, "alice");
        assert_eq!(snapshot.users[0].rules.len(), 1);
        assert_eq!(snapshot.users[1].rules[0].port, Some(53));
        assert_eq!(snapshot.rule_count(), 2);
    }

    #[test]
    fn test_snapshot_rejects_orphan_rules() {
        let mut db = db();
        db.add_user(new_user("alice", ForwardMode::Route)).unwrap();
        db.add_rule(new_rule("alice", "1.1.1.1", None, Protocol::Tcp, Action::Accept))
            .unwrap();
        // Simulate a hand-edited document that dropped the user record
        db.users.clear();
        assert!(matches!(
            db.snapshot(),
            Err(Error::Store(StoreError::OrphanRule { rule: 1, user: 1 }))
        ));
    }

    #[test]
    fn test_reinitialize_must_keep_users_valid() {
        let mut db = db();
        db.add_user(new_user("alice", ForwardMode::Route)).unwrap();

        let smaller = NetworkConfig::parse("10.0.1.1", "10.0.1.0/24").unwrap();
        assert!(db.initialize(smaller).is_err());
        assert_eq!(db.network(), Some(&network()));

        let wider = NetworkConfig::parse("10.0.0.1", "10.0.0.0/16").unwrap();
        db.initialize(wider).unwrap();
    }

    #[tokio::test]
    async fn test_json_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new(dir.path().join("nested").join("policy.json"));

        let empty = store.load().await.unwrap();
        assert!(empty.network().is_none());

        let mut db = db();
        db.add_user(new_user("alice", ForwardMode::Route)).unwrap();
        db.add_rule(new_rule("alice", "mirror.example.org", Some(443), Protocol::Tcp, Action::Accept))
            .unwrap();
        store.save(&db).await.unwrap();

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, db);

        let checksum = std::fs::read_to_string(dir.path().join("nested/policy.json.sha256")).unwrap();
        let json = std::fs::read_to_string(store.path()).unwrap();
        assert_eq!(checksum, crate::utils::compute_checksum(&json));

        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_json_store_rejects_foreign_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        std::fs::write(
            &path,
            r#"{"version":99,"next_user_id":1,"next_rule_id":1}"#,
        )
        .unwrap();

        let err = JsonStore::new(&path).load().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Store(StoreError::VersionMismatch { found: 99, .. })
        ));
    }

    #[tokio::test]
    async fn test_json_store_rejects_malformed_network() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        std::fs::write(
            &path,
            r#"{"version":1,"network":{"host_address":"10.0.0.1","subnet":"10.0.0.7/24"},"next_user_id":1,"next_rule_id":1}"#,
        )
        .unwrap();

        assert!(JsonStore::new(&path).load().await.is_err());
    }
}
