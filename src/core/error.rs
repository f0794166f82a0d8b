use crate::core::model::RuleId;
use thiserror::Error;

/// Core error types for fwmgr
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Network configuration or input-protection settings are unusable
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A user or rule contradicts the policy model
    #[error("Policy validation error for user '{user}'{}: {reason}", rule_suffix(.rule))]
    PolicyValidation {
        user: String,
        rule: Option<RuleId>,
        reason: Violation,
    },

    /// The enforcement tool (or its elevation wrapper) is not installed
    #[error("Dependency missing: '{0}' not found in PATH")]
    DependencyMissing(String),

    /// iptables-restore rejected the batch, failed to run, or timed out
    #[error("Apply error: {message}")]
    Apply {
        message: String,
        stderr: Option<String>,
        exit_code: Option<i32>,
    },

    /// Policy store operation failed
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Privilege escalation failed
    #[error("Elevation error: {0}")]
    Elevation(#[from] crate::elevation::ElevationError),

    /// Internal logic error
    #[error("Internal error: {0}")]
    Internal(String),
}

fn rule_suffix(rule: &Option<RuleId>) -> String {
    rule.map(|id| format!(", rule #{id}")).unwrap_or_default()
}

impl Error {
    /// Shorthand for a validation failure attached to a specific rule.
    pub fn rule_violation(user: impl Into<String>, rule: RuleId, reason: Violation) -> Self {
        Self::PolicyValidation {
            user: user.into(),
            rule: Some(rule),
            reason,
        }
    }

    /// Shorthand for a validation failure attached to a user as a whole.
    pub fn user_violation(user: impl Into<String>, reason: Violation) -> Self {
        Self::PolicyValidation {
            user: user.into(),
            rule: None,
            reason,
        }
    }

    /// Raw diagnostic text from the enforcement tool, when there is one.
    pub fn tool_diagnostic(&self) -> Option<&str> {
        match self {
            Self::Apply {
                stderr: Some(stderr),
                ..
            } => Some(stderr.as_str()),
            _ => None,
        }
    }
}

/// Contradictions detected while validating a policy snapshot
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Violation {
    #[error("DROP rules cannot be expressed under NAT forwarding (masquerade always accepts)")]
    DropUnderNat,

    #[error("a destination port requires protocol tcp or udp, not 'all'")]
    PortWithoutProtocol,

    #[error("port 0 is reserved")]
    ZeroPort,

    #[error("address {address} lies outside the user subnet {subnet}")]
    AddressOutsideSubnet { address: String, subnet: String },

    #[error("address {0} is the host address and cannot be assigned to a user")]
    HostAddressAssigned(String),

    #[error("address {address} is already assigned to user '{owner}'")]
    DuplicateAddress { address: String, owner: String },

    #[error("name is already taken by user #{0}")]
    DuplicateName(u64),

    #[error("rule references user #{found} but is listed under user #{expected}")]
    ForeignRule { expected: u64, found: u64 },

    #[error("{0}")]
    Malformed(String),
}

/// Policy store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Network is not configured - run `fwmgr init` first")]
    NotInitialized,

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Rule not found: #{0}")]
    RuleNotFound(u64),

    #[error("No free address left in subnet {0}")]
    AddressPoolExhausted(String),

    #[error("Store contains {found} rules (max: {max})")]
    TooManyRules { found: usize, max: usize },

    #[error("Store format version mismatch: found v{found}, expected v{expected}")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("Rule #{rule} belongs to user #{user}, which does not exist")]
    OrphanRule { rule: u64, user: u64 },

    #[error("Data directory not available")]
    DataDirUnavailable,
}

/// Represents a translated error with helpful context
#[derive(Debug, Clone)]
pub struct ErrorTranslation {
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl ErrorTranslation {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            user_message: message.into(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

/// Known iptables-restore diagnostics and their operator-facing translations.
pub struct IptablesErrorPattern;

impl IptablesErrorPattern {
    /// Matches a diagnostic against known patterns and returns a translation.
    pub fn match_error(msg: &str) -> ErrorTranslation {
        let lower = msg.to_lowercase();

        if lower.contains("permission denied") || lower.contains("operation not permitted") {
            return ErrorTranslation::new("Insufficient permissions to modify firewall rules")
                .with_suggestion("Run fwmgr as root or allow elevation via sudo/run0/pkexec")
                .with_suggestion("Check that CAP_NET_ADMIN is available to the process");
        }

        if lower.contains("another app is currently holding the xtables lock")
            || lower.contains("resource temporarily unavailable")
        {
            return ErrorTranslation::new("The xtables lock is held by another process")
                .with_suggestion("Another firewall manager may be applying rules right now")
                .with_suggestion("Wait for it to finish and apply again");
        }

        if lower.contains("no such file") || lower.contains("command not found") {
            return ErrorTranslation::new("iptables-restore is not installed or not found in PATH")
                .with_suggestion("Install iptables: sudo apt install iptables  (Debian/Ubuntu)")
                .with_suggestion("Or: sudo dnf install iptables  (Fedora/RHEL)")
                .with_suggestion("Or: sudo pacman -S iptables  (Arch)");
        }

        if lower.contains("table does not exist") || lower.contains("can't initialize") {
            return ErrorTranslation::new("A required netfilter table is unavailable")
                .with_suggestion("Load the kernel modules: sudo modprobe iptable_filter iptable_nat")
                .with_suggestion("Check for an nftables-only kernel without the iptables compat layer");
        }

        if lower.contains("line") && lower.contains("failed") {
            return ErrorTranslation::new("iptables-restore rejected a line of the batch")
                .with_suggestion("Run `fwmgr validate --format batch` to inspect the generated lines")
                .with_suggestion("Hostname destinations must resolve at load time");
        }

        if lower.contains("host/network") && lower.contains("not found") {
            return ErrorTranslation::new("A destination hostname could not be resolved")
                .with_suggestion("Check DNS resolution on the firewall host")
                .with_suggestion("Prefer literal addresses for destinations");
        }

        if lower.contains("timed out") || lower.contains("timeout") {
            return ErrorTranslation::new("The enforcement tool did not finish in time")
                .with_suggestion("Run `fwmgr verify` to see which ruleset the kernel holds")
                .with_suggestion("Increase applier.timeout_secs if the host is heavily loaded");
        }

        ErrorTranslation::new(format!("Firewall error: {msg}"))
            .with_suggestion("Check the detailed error message for more information")
            .with_suggestion("Inspect the live ruleset: sudo iptables-save")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
