//! Policy compiler
//!
//! Translates a [`Snapshot`] of users and rules into an ordered
//! [`DirectiveSet`]: the packet-filter directives for the chains fwmgr owns
//! (`filter/INPUT`, `filter/FORWARD`, `nat/POSTROUTING`).
//!
//! Compilation is pure. The same snapshot always yields the same directives in
//! the same order; map iteration order, random ids and clocks never reach the
//! output (rule timestamps are only used as a sort key).
//!
//! # Ordering
//!
//! Packet filters evaluate top to bottom and the first match wins, so the
//! order is part of the contract:
//!
//! 1. flush `FORWARD`, flush `INPUT`
//! 2. `INPUT`: loopback, established/related, then the admin ports. These
//!    come before any user directive so administrative access can never be
//!    shadowed by a user's DROP.
//! 3. `FORWARD`: one directive per rule of every ROUTE user
//! 4. flush `POSTROUTING`, then one masquerade per rule of every NAT user
//!
//! Users are visited in ascending id order, rules in creation order.
//!
//! # Example
//!
//! ```
//! use fwmgr::core::compiler::{compile, InputPolicy};
//! use fwmgr::core::model::{NetworkConfig, Snapshot};
//!
//! let network = NetworkConfig::parse("10.0.0.1", "10.0.0.0/24").unwrap();
//! let set = compile(&Snapshot::new(network, vec![]), &InputPolicy::default()).unwrap();
//! assert!(set.forward().is_empty());
//! assert_eq!(set.input().len(), 6);
//! ```

use crate::core::error::{Error, Result, Violation};
use crate::core::model::{
    Action, Destination, ForwardMode, NetworkConfig, Protocol, Rule, Snapshot, User, UserId,
    UserPolicy,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;

/// Netfilter table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::AsRefStr)]
pub enum Table {
    #[strum(serialize = "filter")]
    Filter,
    #[strum(serialize = "nat")]
    Nat,
}

/// Chains owned (flushed and repopulated) by fwmgr
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::AsRefStr, strum::EnumIter)]
pub enum Chain {
    #[strum(serialize = "INPUT")]
    Input,
    #[strum(serialize = "FORWARD")]
    Forward,
    #[strum(serialize = "POSTROUTING")]
    Postrouting,
}

impl Chain {
    pub const fn table(self) -> Table {
        match self {
            Chain::Input | Chain::Forward => Table::Filter,
            Chain::Postrouting => Table::Nat,
        }
    }
}

/// Jump target of an appended directive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum Target {
    #[strum(serialize = "ACCEPT")]
    Accept,
    #[strum(serialize = "DROP")]
    Drop,
    #[strum(serialize = "MASQUERADE")]
    Masquerade,
}

impl From<Action> for Target {
    fn from(action: Action) -> Self {
        match action {
            Action::Accept => Target::Accept,
            Action::Drop => Target::Drop,
        }
    }
}

/// Transport protocol match (`all` is expressed by omitting it)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum Transport {
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
}

impl Transport {
    pub const fn from_protocol(protocol: Protocol) -> Option<Self> {
        match protocol {
            Protocol::Tcp => Some(Transport::Tcp),
            Protocol::Udp => Some(Transport::Udp),
            Protocol::All => None,
        }
    }
}

/// Connection-tracking state for the stateful shortcut
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum ConnState {
    #[strum(serialize = "ESTABLISHED")]
    Established,
    #[strum(serialize = "RELATED")]
    Related,
}

/// Match and target of one appended directive.
///
/// Renders in the fixed field order iptables-restore expects:
/// `-i`, `-m state --state`, `-s`, `-d`, `-p`, `--dport`, `-j`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleSpec {
    pub in_interface: Option<String>,
    pub states: Vec<ConnState>,
    pub source: Option<Ipv4Addr>,
    pub destination: Option<Destination>,
    pub transport: Option<Transport>,
    /// Only rendered together with `transport`
    pub dport: Option<u16>,
    pub target: Target,
    /// Name of the owning user; shown in previews, never rendered to the wire
    pub owner: Option<String>,
}

impl RuleSpec {
    pub fn new(target: Target) -> Self {
        Self {
            in_interface: None,
            states: Vec::new(),
            source: None,
            destination: None,
            transport: None,
            dport: None,
            target,
            owner: None,
        }
    }

    fn for_user_rule(user: &User, rule: &Rule, target: Target) -> Self {
        let transport = Transport::from_protocol(rule.protocol);
        Self {
            source: Some(user.address),
            destination: Some(rule.destination.clone()),
            transport,
            dport: transport.and(rule.port),
            owner: Some(user.name.clone()),
            ..Self::new(target)
        }
    }
}

impl fmt::Display for RuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref iface) = self.in_interface {
            write!(f, "-i {iface} ")?;
        }
        if !self.states.is_empty() {
            let states: Vec<String> = self.states.iter().map(ToString::to_string).collect();
            write!(f, "-m state --state {} ", states.join(","))?;
        }
        if let Some(src) = self.source {
            write!(f, "-s {src} ")?;
        }
        if let Some(ref dst) = self.destination {
            write!(f, "-d {dst} ")?;
        }
        if let Some(transport) = self.transport {
            write!(f, "-p {transport} ")?;
            if let Some(port) = self.dport {
                write!(f, "--dport {port} ")?;
            }
        }
        write!(f, "-j {}", self.target)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Clear the chain before repopulating it
    Flush,
    Append(RuleSpec),
}

/// One line of packet-filter policy
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Directive {
    pub chain: Chain,
    pub op: Operation,
}

impl Directive {
    pub fn flush(chain: Chain) -> Self {
        Self {
            chain,
            op: Operation::Flush,
        }
    }

    pub fn append(chain: Chain, spec: RuleSpec) -> Self {
        Self {
            chain,
            op: Operation::Append(spec),
        }
    }

    pub fn spec(&self) -> Option<&RuleSpec> {
        match self.op {
            Operation::Append(ref spec) => Some(spec),
            Operation::Flush => None,
        }
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op {
            Operation::Flush => write!(f, "-F {}", self.chain),
            Operation::Append(ref spec) => write!(f, "-A {} {spec}", self.chain),
        }
    }
}

/// Compiled policy, grouped by table in emission order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectiveSet {
    filter: Vec<Directive>,
    nat: Vec<Directive>,
}

impl DirectiveSet {
    fn push(&mut self, directive: Directive) {
        match directive.chain.table() {
            Table::Filter => self.filter.push(directive),
            Table::Nat => self.nat.push(directive),
        }
    }

    /// Directives of one table, flushes included, in emission order.
    pub fn table(&self, table: Table) -> &[Directive] {
        match table {
            Table::Filter => &self.filter,
            Table::Nat => &self.nat,
        }
    }

    pub fn filter(&self) -> &[Directive] {
        &self.filter
    }

    pub fn nat(&self) -> &[Directive] {
        &self.nat
    }

    /// Appended rule specs of one chain, in order.
    pub fn chain(&self, chain: Chain) -> Vec<&RuleSpec> {
        self.table(chain.table())
            .iter()
            .filter(|d| d.chain == chain)
            .filter_map(Directive::spec)
            .collect()
    }

    /// The self-protection group.
    pub fn input(&self) -> Vec<&RuleSpec> {
        self.chain(Chain::Input)
    }

    /// Routed (ROUTE-mode) user traffic.
    pub fn forward(&self) -> Vec<&RuleSpec> {
        self.chain(Chain::Forward)
    }

    /// Masqueraded (NAT-mode) user traffic.
    pub fn postrouting(&self) -> Vec<&RuleSpec> {
        self.chain(Chain::Postrouting)
    }

    /// Total number of directives, flushes included.
    pub fn len(&self) -> usize {
        self.filter.len() + self.nat.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filter.is_empty() && self.nat.is_empty()
    }

    /// Human-readable dry-run rendering, grouped by chain and annotated with
    /// the owning user of each directive.
    pub fn to_preview_text(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        for chain in [Chain::Input, Chain::Forward, Chain::Postrouting] {
            let table = self.table(chain.table());
            let flushed = table
                .iter()
                .any(|d| d.chain == chain && d.op == Operation::Flush);
            let specs = self.chain(chain);

            let _ = writeln!(
                out,
                "{}/{} ({}{} rules)",
                chain.table(),
                chain,
                if flushed { "flushed, " } else { "" },
                specs.len()
            );
            if specs.is_empty() {
                let _ = writeln!(out, "    (none)");
            }
            for spec in specs {
                match spec.owner {
                    Some(ref owner) => {
                        let line = spec.to_string();
                        let _ = writeln!(out, "    {line:<64} # user {owner}");
                    }
                    None => {
                        let _ = writeln!(out, "    {spec}");
                    }
                }
            }
            let _ = writeln!(out);
        }
        out
    }
}

/// Self-protection section of the `INPUT` chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputPolicy {
    #[serde(default = "default_loopback")]
    pub loopback_interface: String,
    /// SSH, the administrative web portal, and HTTP/HTTPS for a reverse proxy
    #[serde(default = "default_admin_ports")]
    pub admin_ports: Vec<u16>,
}

impl Default for InputPolicy {
    fn default() -> Self {
        Self {
            loopback_interface: default_loopback(),
            admin_ports: default_admin_ports(),
        }
    }
}

fn default_loopback() -> String {
    "lo".to_string()
}

fn default_admin_ports() -> Vec<u16> {
    vec![22, 5000, 80, 443]
}

impl InputPolicy {
    /// Validates the settings and returns the admin ports, de-duplicated in
    /// configured order.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` for an invalid loopback interface, an
    /// empty port list (it would lock out administration) or port 0.
    pub fn checked_admin_ports(&self) -> Result<Vec<u16>> {
        crate::validators::validate_interface(&self.loopback_interface)
            .map_err(|e| Error::Configuration(format!("loopback interface: {e}")))?;

        if self.admin_ports.is_empty() {
            return Err(Error::Configuration(
                "no admin ports configured; applying would lock out administrative access"
                    .to_string(),
            ));
        }

        let mut ports = Vec::with_capacity(self.admin_ports.len());
        for &port in &self.admin_ports {
            crate::validators::validate_port(port)
                .map_err(|e| Error::Configuration(format!("admin port: {e}")))?;
            if !ports.contains(&port) {
                ports.push(port);
            }
        }
        Ok(ports)
    }
}

/// Users in ascending id order, each with its rules in creation order.
fn ordered(snapshot: &Snapshot) -> Vec<(&User, Vec<&Rule>)> {
    let mut users: Vec<&UserPolicy> = snapshot.users.iter().collect();
    users.sort_by_key(|policy| policy.user.id);
    users
        .into_iter()
        .map(|policy| {
            let mut rules: Vec<&Rule> = policy.rules.iter().collect();
            rules.sort_by_key(|rule| rule.sort_key());
            (&policy.user, rules)
        })
        .collect()
}

/// Validates every user and rule, stopping at the first violation.
fn check_users(network: &NetworkConfig, users: &[(&User, Vec<&Rule>)]) -> Result<()> {
    let mut names: HashMap<&str, UserId> = HashMap::with_capacity(users.len());
    let mut addresses: HashMap<Ipv4Addr, &str> = HashMap::with_capacity(users.len());

    for (user, rules) in users {
        if let Some(previous) = names.insert(user.name.as_str(), user.id) {
            return Err(Error::user_violation(
                &user.name,
                Violation::DuplicateName(previous.0),
            ));
        }

        if !network.contains(user.address) {
            return Err(Error::user_violation(
                &user.name,
                Violation::AddressOutsideSubnet {
                    address: user.address.to_string(),
                    subnet: network.subnet().to_string(),
                },
            ));
        }

        if user.address == network.host_address() {
            return Err(Error::user_violation(
                &user.name,
                Violation::HostAddressAssigned(user.address.to_string()),
            ));
        }

        if let Some(owner) = addresses.insert(user.address, user.name.as_str()) {
            return Err(Error::user_violation(
                &user.name,
                Violation::DuplicateAddress {
                    address: user.address.to_string(),
                    owner: owner.to_string(),
                },
            ));
        }

        for rule in rules {
            check_rule(user, rule)?;
        }
    }

    Ok(())
}

fn check_rule(user: &User, rule: &Rule) -> Result<()> {
    if rule.user_id != user.id {
        return Err(Error::rule_violation(
            &user.name,
            rule.id,
            Violation::ForeignRule {
                expected: user.id.0,
                found: rule.user_id.0,
            },
        ));
    }

    rule.check_shape()
        .map_err(|reason| Error::rule_violation(&user.name, rule.id, reason))?;

    if user.mode == ForwardMode::Nat && rule.action == Action::Drop {
        return Err(Error::rule_violation(
            &user.name,
            rule.id,
            Violation::DropUnderNat,
        ));
    }

    Ok(())
}

fn emit_input(set: &mut DirectiveSet, input: &InputPolicy, admin_ports: &[u16]) {
    set.push(Directive::append(
        Chain::Input,
        RuleSpec {
            in_interface: Some(input.loopback_interface.clone()),
            ..RuleSpec::new(Target::Accept)
        },
    ));

    set.push(Directive::append(
        Chain::Input,
        RuleSpec {
            states: vec![ConnState::Established, ConnState::Related],
            ..RuleSpec::new(Target::Accept)
        },
    ));

    for &port in admin_ports {
        set.push(Directive::append(
            Chain::Input,
            RuleSpec {
                transport: Some(Transport::Tcp),
                dport: Some(port),
                ..RuleSpec::new(Target::Accept)
            },
        ));
    }
}

/// Compiles a policy snapshot into ordered packet-filter directives.
///
/// The whole snapshot is validated before anything is emitted, so a failure
/// never yields partial output.
///
/// # Errors
///
/// - `Error::Configuration` for unusable input-protection settings
/// - `Error::PolicyValidation` for the first contradictory user or rule
///   (duplicate name/address, address outside the subnet or equal to the
///   host address, port with protocol `all`, DROP under NAT)
pub fn compile(snapshot: &Snapshot, input: &InputPolicy) -> Result<DirectiveSet> {
    let admin_ports = input.checked_admin_ports()?;
    let users = ordered(snapshot);
    check_users(&snapshot.network, &users)?;

    let mut set = DirectiveSet::default();

    set.push(Directive::flush(Chain::Forward));
    set.push(Directive::flush(Chain::Input));
    emit_input(&mut set, input, &admin_ports);

    set.push(Directive::flush(Chain::Postrouting));

    for (user, rules) in &users {
        for rule in rules {
            let directive = match user.mode {
                ForwardMode::Route => Directive::append(
                    Chain::Forward,
                    RuleSpec::for_user_rule(user, rule, rule.action.into()),
                ),
                ForwardMode::Nat => Directive::append(
                    Chain::Postrouting,
                    RuleSpec::for_user_rule(user, rule, Target::Masquerade),
                ),
            };
            set.push(directive);
        }
    }

    tracing::debug!(
        users = users.len(),
        directives = set.len(),
        "Compiled policy snapshot"
    );

    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_helpers::{network, rule, snapshot, user};

    #[test]
    fn test_empty_snapshot_has_input_protection_only() {
        let set = compile(&snapshot(vec![]), &InputPolicy::default()).unwrap();

        let lines: Vec<String> = set.filter().iter().map(ToString::to_string).collect();
        assert_eq!(
            lines,
            vec![
                "-F FORWARD",
                "-F INPUT",
                "-A INPUT -i lo -j ACCEPT",
                "-A INPUT -m state --state ESTABLISHED,RELATED -j ACCEPT",
                "-A INPUT -p tcp --dport 22 -j ACCEPT",
                "-A INPUT -p tcp --dport 5000 -j ACCEPT",
                "-A INPUT -p tcp --dport 80 -j ACCEPT",
                "-A INPUT -p tcp --dport 443 -j ACCEPT",
            ]
        );
        assert_eq!(set.nat().len(), 1);
        assert_eq!(set.nat()[0].to_string(), "-F POSTROUTING");
    }

    #[test]
    fn test_route_user_compiles_to_forward() {
        let alice = user(1, "alice", "10.0.0.5", ForwardMode::Route);
        let r = rule(1, &alice, "1.1.1.1", Some(80), Protocol::Tcp, Action::Accept);
        let set = compile(&snapshot(vec![(alice, vec![r])]), &InputPolicy::default()).unwrap();

        let forward = set.forward();
        assert_eq!(forward.len(), 1);
        assert_eq!(
            forward[0].to_string(),
            "-s 10.0.0.5 -d 1.1.1.1 -p tcp --dport 80 -j ACCEPT"
        );
        assert!(set.postrouting().is_empty());
    }

    #[test]
    fn test_nat_user_compiles_to_masquerade() {
        let bob = user(2, "bob", "10.0.0.6", ForwardMode::Nat);
        let r = rule(1, &bob, "8.8.8.8", Some(53), Protocol::Udp, Action::Accept);
        let set = compile(&snapshot(vec![(bob, vec![r])]), &InputPolicy::default()).unwrap();

        let post = set.postrouting();
        assert_eq!(post.len(), 1);
        assert_eq!(
            post[0].to_string(),
            "-s 10.0.0.6 -d 8.8.8.8 -p udp --dport 53 -j MASQUERADE"
        );
        assert!(set.forward().is_empty());
    }

    #[test]
    fn test_protocol_all_omits_transport_clause() {
        let alice = user(1, "alice", "10.0.0.5", ForwardMode::Route);
        let r = rule(1, &alice, "10.20.0.0/16", None, Protocol::All, Action::Drop);
        let set = compile(&snapshot(vec![(alice, vec![r])]), &InputPolicy::default()).unwrap();

        assert_eq!(
            set.forward()[0].to_string(),
            "-s 10.0.0.5 -d 10.20.0.0/16 -j DROP"
        );
    }

    #[test]
    fn test_port_absent_matches_all_ports() {
        let alice = user(1, "alice", "10.0.0.5", ForwardMode::Route);
        let r = rule(1, &alice, "1.1.1.1", None, Protocol::Tcp, Action::Accept);
        let set = compile(&snapshot(vec![(alice, vec![r])]), &InputPolicy::default()).unwrap();

        assert_eq!(
            set.forward()[0].to_string(),
            "-s 10.0.0.5 -d 1.1.1.1 -p tcp -j ACCEPT"
        );
    }

    #[test]
    fn test_drop_under_nat_rejected() {
        let bob = user(2, "bob", "10.0.0.6", ForwardMode::Nat);
        let r = rule(9, &bob, "8.8.8.8", None, Protocol::Tcp, Action::Drop);
        let err = compile(&snapshot(vec![(bob, vec![r])]), &InputPolicy::default()).unwrap_err();

        match err {
            Error::PolicyValidation { user, rule, reason } => {
                assert_eq!(user, "bob");
                assert_eq!(rule.map(|r| r.0), Some(9));
                assert_eq!(reason, Violation::DropUnderNat);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_port_with_protocol_all_rejected() {
        let alice = user(1, "alice", "10.0.0.5", ForwardMode::Route);
        let r = rule(4, &alice, "1.1.1.1", Some(443), Protocol::All, Action::Accept);
        let err = compile(&snapshot(vec![(alice, vec![r])]), &InputPolicy::default()).unwrap_err();

        assert!(matches!(
            err,
            Error::PolicyValidation {
                reason: Violation::PortWithoutProtocol,
                ..
            }
        ));
    }

    #[test]
    fn test_first_violation_in_user_order_reported() {
        // Both users are broken; user #1 is visited first regardless of input order
        let bob = user(2, "bob", "10.0.0.6", ForwardMode::Nat);
        let bob_rule = rule(1, &bob, "8.8.8.8", None, Protocol::Tcp, Action::Drop);
        let alice = user(1, "alice", "10.0.0.5", ForwardMode::Route);
        let alice_rule = rule(2, &alice, "1.1.1.1", Some(1), Protocol::All, Action::Accept);

        let err = compile(
            &snapshot(vec![(bob, vec![bob_rule]), (alice, vec![alice_rule])]),
            &InputPolicy::default(),
        )
        .unwrap_err();

        assert!(matches!(err, Error::PolicyValidation { ref user, .. } if user == "alice"));
    }

    #[test]
    fn test_user_address_checks() {
        let outside = user(1, "carol", "192.168.9.9", ForwardMode::Route);
        assert!(matches!(
            compile(&snapshot(vec![(outside, vec![])]), &InputPolicy::default()),
            Err(Error::PolicyValidation {
                reason: Violation::AddressOutsideSubnet { .. },
                ..
            })
        ));

        let on_host = user(1, "dave", "10.0.0.1", ForwardMode::Route);
        assert!(matches!(
            compile(&snapshot(vec![(on_host, vec![])]), &InputPolicy::default()),
            Err(Error::PolicyValidation {
                reason: Violation::HostAddressAssigned(_),
                ..
            })
        ));

        let a = user(1, "erin", "10.0.0.8", ForwardMode::Route);
        let b = user(2, "frank", "10.0.0.8", ForwardMode::Nat);
        assert!(matches!(
            compile(&snapshot(vec![(a, vec![]), (b, vec![])]), &InputPolicy::default()),
            Err(Error::PolicyValidation {
                reason: Violation::DuplicateAddress { .. },
                ..
            })
        ));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let a = user(1, "erin", "10.0.0.8", ForwardMode::Route);
        let b = user(2, "erin", "10.0.0.9", ForwardMode::Route);
        let err = compile(&snapshot(vec![(a, vec![]), (b, vec![])]), &InputPolicy::default())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::PolicyValidation {
                reason: Violation::DuplicateName(1),
                ..
            }
        ));
    }

    #[test]
    fn test_foreign_rule_rejected() {
        let alice = user(1, "alice", "10.0.0.5", ForwardMode::Route);
        let bob = user(2, "bob", "10.0.0.6", ForwardMode::Route);
        let stray = rule(3, &bob, "1.1.1.1", None, Protocol::Tcp, Action::Accept);
        let err = compile(&snapshot(vec![(alice, vec![stray])]), &InputPolicy::default())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::PolicyValidation {
                reason: Violation::ForeignRule { expected: 1, found: 2 },
                ..
            }
        ));
    }

    #[test]
    fn test_rules_emitted_in_creation_order() {
        let alice = user(1, "alice", "10.0.0.5", ForwardMode::Route);
        let mut first = rule(10, &alice, "1.1.1.1", None, Protocol::Tcp, Action::Accept);
        let mut second = rule(2, &alice, "2.2.2.2", None, Protocol::Tcp, Action::Accept);
        first.created_at = chrono::DateTime::from_timestamp(1_000, 0).unwrap();
        second.created_at = chrono::DateTime::from_timestamp(2_000, 0).unwrap();

        let set = compile(
            &snapshot(vec![(alice, vec![second, first])]),
            &InputPolicy::default(),
        )
        .unwrap();
        let dests: Vec<String> = set
            .forward()
            .iter()
            .map(|s| s.destination.as_ref().unwrap().to_string())
            .collect();
        assert_eq!(dests, vec!["1.1.1.1", "2.2.2.2"]);
    }

    #[test]
    fn test_admin_ports_deduplicated_in_order() {
        let input = InputPolicy {
            loopback_interface: "lo".to_string(),
            admin_ports: vec![2222, 443, 2222, 80],
        };
        let set = compile(&snapshot(vec![]), &input).unwrap();
        let ports: Vec<u16> = set.input().iter().filter_map(|s| s.dport).collect();
        assert_eq!(ports, vec![2222, 443, 80]);
    }

    #[test]
    fn test_invalid_input_policy_is_configuration_error() {
        let no_ports = InputPolicy {
            loopback_interface: "lo".to_string(),
            admin_ports: vec![],
        };
        assert!(matches!(
            compile(&snapshot(vec![]), &no_ports),
            Err(Error::Configuration(_))
        ));

        let bad_iface = InputPolicy {
            loopback_interface: "lo; rm -rf".to_string(),
            admin_ports: vec![22],
        };
        assert!(matches!(
            compile(&snapshot(vec![]), &bad_iface),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_preview_annotates_owner() {
        let alice = user(1, "alice", "10.0.0.5", ForwardMode::Route);
        let r = rule(1, &alice, "1.1.1.1", Some(80), Protocol::Tcp, Action::Accept);
        let set = compile(&snapshot(vec![(alice, vec![r])]), &InputPolicy::default()).unwrap();

        let text = set.to_preview_text();
        assert!(text.contains("filter/FORWARD (flushed, 1 rules)"));
        assert!(text.contains("# user alice"));
        assert!(text.contains("nat/POSTROUTING (flushed, 0 rules)"));
        assert!(text.contains("(none)"));
    }

    #[test]
    fn test_hostname_destination_rendered_verbatim() {
        let alice = user(1, "alice", "10.0.0.5", ForwardMode::Route);
        let r = rule(1, &alice, "mirror.example.org", Some(443), Protocol::Tcp, Action::Accept);
        let set = compile(&snapshot(vec![(alice, vec![r])]), &InputPolicy::default()).unwrap();
        assert!(
            set.forward()[0]
                .to_string()
                .starts_with("-s 10.0.0.5 -d mirror.example.org -p tcp")
        );
    }

    #[test]
    fn test_network_helper_matches_fixture() {
        assert_eq!(network().host_address(), Ipv4Addr::new(10, 0, 0, 1));
    }
}
