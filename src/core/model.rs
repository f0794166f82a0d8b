//! Policy data model
//!
//! Typed representations of the network configuration, users and their access
//! rules. String-typed fields from the outside world (CLI arguments, the JSON
//! store) are parsed into closed enums and address types here, once, so the
//! compiler can assume well-formed input and only has to check the
//! cross-record contradictions.
//!
//! # Example
//!
//! ```
//! use fwmgr::core::model::{Destination, ForwardMode, NetworkConfig, Protocol};
//!
//! let network = NetworkConfig::parse("10.0.0.1", "10.0.0.0/24").unwrap();
//! assert!(network.contains("10.0.0.7".parse().unwrap()));
//!
//! let mode: ForwardMode = "nat".parse().unwrap();
//! assert_eq!(mode, ForwardMode::Nat);
//!
//! let dest: Destination = "1.1.1.1".parse().unwrap();
//! assert_eq!(dest.to_string(), "1.1.1.1");
//! assert!(Protocol::Tcp.supports_ports());
//! ```

use crate::core::error::{Error, Result, Violation};
use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

/// Store-assigned user identifier (ascending in creation order)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Store-assigned rule identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(pub u64);

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-wide network settings, set once during provisioning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawNetworkConfig", into = "RawNetworkConfig")]
pub struct NetworkConfig {
    host_address: Ipv4Addr,
    subnet: Ipv4Network,
}

/// On-disk form of [`NetworkConfig`]; validated on the way in.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawNetworkConfig {
    host_address: String,
    subnet: String,
}

impl TryFrom<RawNetworkConfig> for NetworkConfig {
    type Error = Error;

    fn try_from(raw: RawNetworkConfig) -> Result<Self> {
        Self::parse(&raw.host_address, &raw.subnet)
    }
}

impl From<NetworkConfig> for RawNetworkConfig {
    fn from(config: NetworkConfig) -> Self {
        Self {
            host_address: config.host_address.to_string(),
            subnet: config.subnet.to_string(),
        }
    }
}

impl NetworkConfig {
    /// Builds a config from typed parts.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` if the subnet has host bits set
    /// (e.g. `10.0.0.5/24`), since it would not describe a network prefix.
    pub fn new(host_address: Ipv4Addr, subnet: Ipv4Network) -> Result<Self> {
        if subnet.network() != subnet.ip() {
            return Err(Error::Configuration(format!(
                "user subnet {subnet} is not a network prefix (did you mean {}/{}?)",
                subnet.network(),
                subnet.prefix()
            )));
        }
        Ok(Self {
            host_address,
            subnet,
        })
    }

    /// Parses a host address and CIDR subnet as entered by an administrator.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` for malformed addresses or prefixes.
    pub fn parse(host_address: &str, subnet: &str) -> Result<Self> {
        let host: Ipv4Addr = host_address.trim().parse().map_err(|e| {
            Error::Configuration(format!("invalid host address '{host_address}': {e}"))
        })?;
        let net: Ipv4Network = subnet
            .trim()
            .parse()
            .map_err(|e| Error::Configuration(format!("invalid user subnet '{subnet}': {e}")))?;
        Self::new(host, net)
    }

    pub fn host_address(&self) -> Ipv4Addr {
        self.host_address
    }

    pub fn subnet(&self) -> Ipv4Network {
        self.subnet
    }

    pub fn contains(&self, address: Ipv4Addr) -> bool {
        self.subnet.contains(address)
    }
}

/// How a user's traffic leaves the gateway
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(ascii_case_insensitive)]
pub enum ForwardMode {
    /// Forwarded untranslated; per-destination ACCEPT/DROP applies
    #[default]
    #[strum(serialize = "ROUTE")]
    Route,
    /// Forwarded with source NAT (masquerade); implicitly accepted
    #[strum(serialize = "NAT")]
    Nat,
}

/// Transport protocol a rule matches
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive)]
pub enum Protocol {
    #[default]
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "udp")]
    Udp,
    /// Every transport; no protocol or port clause is rendered
    #[strum(serialize = "all")]
    All,
}

impl Protocol {
    pub const fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::All => "all",
        }
    }

    /// Only TCP and UDP carry ports.
    pub const fn supports_ports(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp)
    }
}

/// Verdict for routed traffic matching a rule
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Hash,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(ascii_case_insensitive)]
pub enum Action {
    #[default]
    #[strum(serialize = "ACCEPT")]
    Accept,
    #[strum(serialize = "DROP")]
    Drop,
}

/// Descriptive user category (opaque to the compiler)
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Default,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive, serialize_all = "lowercase")]
pub enum UserKind {
    #[default]
    Employee,
    Vendor,
    Other,
}

/// Where a rule's traffic is headed: an IPv4 address/network or a hostname.
///
/// Hostnames are resolved by iptables-restore at load time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Destination {
    Network(Ipv4Network),
    Host(String),
}

impl FromStr for Destination {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Destination cannot be empty".to_string());
        }
        if let Ok(net) = s.parse::<Ipv4Network>() {
            return Ok(Destination::Network(net));
        }
        let bare = s.split('/').next().unwrap_or(s);
        if let Ok(IpAddr::V6(_)) = bare.parse::<IpAddr>() {
            return Err(format!(
                "IPv6 destination '{s}' is not supported by iptables (use an IPv4 address)"
            ));
        }
        if s.contains('/') {
            return Err(format!("Invalid destination network '{s}'"));
        }
        crate::validators::validate_hostname(s).map(Destination::Host)
    }
}

impl TryFrom<String> for Destination {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Destination> for String {
    fn from(dest: Destination) -> Self {
        dest.to_string()
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Single addresses render bare, the way iptables-save prints them back
            Destination::Network(net) if net.prefix() == 32 => write!(f, "{}", net.ip()),
            Destination::Network(net) => write!(f, "{net}"),
            Destination::Host(host) => write!(f, "{host}"),
        }
    }
}

impl From<Ipv4Addr> for Destination {
    fn from(addr: Ipv4Addr) -> Self {
        Destination::Network(Ipv4Network::from(addr))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub name: String,
    pub address: Ipv4Addr,
    #[serde(default)]
    pub mode: ForwardMode,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub contact: Option<String>,
    #[serde(default)]
    pub kind: UserKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    pub user_id: UserId,
    pub destination: Destination,
    /// `None` matches every port of the protocol
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub action: Action,
    pub created_at: DateTime<Utc>,
}

impl Rule {
    /// Checks the rule on its own, without regard to its owner.
    ///
    /// # Errors
    ///
    /// Returns the violated constraint: a port with protocol `all`, or port 0.
    pub fn check_shape(&self) -> std::result::Result<(), Violation> {
        check_port(self.protocol, self.port)
    }

    /// Creation order, with the id breaking timestamp ties.
    pub fn sort_key(&self) -> (DateTime<Utc>, RuleId) {
        (self.created_at, self.id)
    }
}

/// Port/protocol compatibility shared by stored rules and rule drafts.
///
/// # Errors
///
/// Returns `Violation::PortWithoutProtocol` or `Violation::ZeroPort`.
pub fn check_port(protocol: Protocol, port: Option<u16>) -> std::result::Result<(), Violation> {
    match port {
        Some(_) if !protocol.supports_ports() => Err(Violation::PortWithoutProtocol),
        Some(0) => Err(Violation::ZeroPort),
        _ => Ok(()),
    }
}

/// A user together with the rules it owns, as handed to the compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserPolicy {
    pub user: User,
    pub rules: Vec<Rule>,
}

/// Point-in-time view of the whole policy, read in one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub network: NetworkConfig,
    pub users: Vec<UserPolicy>,
}

impl Snapshot {
    pub fn new(network: NetworkConfig, users: Vec<UserPolicy>) -> Self {
        Self { network, users }
    }

    pub fn rule_count(&self) -> usize {
        self.users.iter().map(|u| u.rules.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_config_parse_valid() {
        let config = NetworkConfig::parse("10.0.0.1", "10.0.0.0/24").unwrap();
        assert_eq!(config.host_address(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(config.subnet().prefix(), 24);
        assert!(config.contains(Ipv4Addr::new(10, 0, 0, 200)));
        assert!(!config.contains(Ipv4Addr::new(10, 0, 1, 1)));
    }

    #[test]
    fn test_network_config_rejects_malformed() {
        assert!(matches!(
            NetworkConfig::parse("10.0.0.300", "10.0.0.0/24"),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            NetworkConfig::parse("10.0.0.1", "10.0.0.0/33"),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            NetworkConfig::parse("10.0.0.1", "not-a-cidr"),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_network_config_rejects_host_bits() {
        let err = NetworkConfig::parse("10.0.0.1", "10.0.0.5/24").unwrap_err();
        assert!(err.to_string().contains("10.0.0.0/24"));
    }

    #[test]
    fn test_network_config_deserialize_validates() {
        let ok: NetworkConfig =
            serde_json::from_str(r#"{"host_address":"10.0.0.1","subnet":"10.0.0.0/24"}"#)
                .unwrap();
        assert_eq!(ok.subnet().to_string(), "10.0.0.0/24");

        let bad = serde_json::from_str::<NetworkConfig>(
            r#"{"host_address":"10.0.0.1","subnet":"10.0.0.9/24"}"#,
        );
        assert!(bad.is_err());
    }

    #[test]
    fn test_enum_string_forms() {
        assert_eq!(ForwardMode::Route.to_string(), "ROUTE");
        assert_eq!("route".parse::<ForwardMode>().unwrap(), ForwardMode::Route);
        assert_eq!("ALL".parse::<Protocol>().unwrap(), Protocol::All);
        assert_eq!("drop".parse::<Action>().unwrap(), Action::Drop);
        assert_eq!(Action::Drop.to_string(), "DROP");
        assert_eq!("Vendor".parse::<UserKind>().unwrap(), UserKind::Vendor);
        assert!("icmp".parse::<Protocol>().is_err());
    }

    #[test]
    fn test_enum_serde_forms() {
        assert_eq!(serde_json::to_string(&ForwardMode::Nat).unwrap(), "\"NAT\"");
        assert_eq!(serde_json::to_string(&Protocol::Udp).unwrap(), "\"udp\"");
        assert_eq!(serde_json::to_string(&Action::Accept).unwrap(), "\"ACCEPT\"");
    }

    #[test]
    fn test_destination_parsing() {
        let single: Destination = "8.8.8.8".parse().unwrap();
        assert_eq!(single.to_string(), "8.8.8.8");

        let net: Destination = "192.168.0.0/16".parse().unwrap();
        assert_eq!(net.to_string(), "192.168.0.0/16");

        let host: Destination = "Updates.Example.com".parse().unwrap();
        assert_eq!(host, Destination::Host("updates.example.com".to_string()));

        assert!("2001:db8::1".parse::<Destination>().is_err());
        assert!("10.0.0.0/40".parse::<Destination>().is_err());
        assert!("".parse::<Destination>().is_err());
        assert!("bad host!".parse::<Destination>().is_err());
    }

    #[test]
    fn test_check_port() {
        assert!(check_port(Protocol::Tcp, Some(80)).is_ok());
        assert!(check_port(Protocol::All, None).is_ok());
        assert_eq!(
            check_port(Protocol::All, Some(53)),
            Err(Violation::PortWithoutProtocol)
        );
        assert_eq!(check_port(Protocol::Udp, Some(0)), Err(Violation::ZeroPort));
    }
}
