//! Input validation and sanitization functions for fwmgr
//!
//! This module provides centralized validation for everything an administrator
//! types in (user names, contact metadata, destinations, interface names) so
//! the policy store only ever holds well-formed values.

/// Maximum length of a user name.
pub const MAX_USERNAME_LEN: usize = 64;

/// Sanitizes descriptive metadata (full name, contact) for display.
///
/// Removes control characters, quotes, and shell metacharacters, and limits
/// the value to 120 ASCII characters.
///
/// # Examples
///
/// ```
/// use fwmgr::validators::sanitize_metadata;
///
/// assert_eq!(sanitize_metadata("Alice Doe"), "Alice Doe");
///
/// let unsafe_value = "Alice\n\"Doe\"";
/// let safe = sanitize_metadata(unsafe_value);
/// assert!(!safe.contains('\n'));
/// assert!(!safe.contains('"'));
/// ```
pub fn sanitize_metadata(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.' | ':' | '+' | '@' | ','))
        .take(120)
        .collect::<String>()
        .trim()
        .to_string()
}

/// Validates a user name.
///
/// Constraints:
/// - ASCII alphanumerics, underscore, dash and dot only
/// - Max 64 characters
/// - Must start with an alphanumeric character
///
/// # Errors
///
/// Returns `Err` describing the first constraint the name breaks.
pub fn validate_username(name: &str) -> Result<String, String> {
    let name = name.trim();

    if name.is_empty() {
        return Err("User name cannot be empty".to_string());
    }

    if name.len() > MAX_USERNAME_LEN {
        return Err(format!("User name too long (max {MAX_USERNAME_LEN} chars)"));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err("User name contains invalid characters (use only a-z, 0-9, _, -, .)".to_string());
    }

    if !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return Err("User name must start with a letter or digit".to_string());
    }

    Ok(name.to_string())
}

/// Validates an e-mail address loosely (one `@`, non-empty local part, dotted domain).
///
/// # Errors
///
/// Returns `Err` if the address is obviously malformed.
pub fn validate_email(input: &str) -> Result<String, String> {
    let input = input.trim();
    let Some((local, domain)) = input.split_once('@') else {
        return Err("E-mail address must contain '@'".to_string());
    };

    if local.is_empty() || domain.contains('@') {
        return Err("Malformed e-mail address".to_string());
    }

    if input.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err("E-mail address cannot contain whitespace".to_string());
    }

    validate_hostname(domain).map_err(|_| "Malformed e-mail domain".to_string())?;

    Ok(input.to_string())
}

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Validates a network interface name.
///
/// Linux kernel interface name rules:
/// - Max 15 characters (IFNAMSIZ - 1)
/// - Alphanumeric, dot, dash, underscore only
/// - Cannot be "." or ".."
///
/// # Errors
///
/// Returns `Err` if interface name violates kernel constraints.
pub fn validate_interface(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Err("Interface name cannot be empty".to_string());
    }

    if name.len() > 15 {
        return Err("Interface name too long (max 15 characters)".to_string());
    }

    if name == "." || name == ".." {
        return Err("Invalid interface name".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err("Interface name contains invalid characters".to_string());
    }

    Ok(name.to_string())
}

/// Validates a DNS hostname (RFC 1123 labels) and returns it lowercased.
///
/// A name made only of digits and dots is rejected: it is a mistyped IPv4
/// address, not a host.
///
/// # Errors
///
/// Returns `Err` for empty names, overlong names or labels, and invalid characters.
pub fn validate_hostname(input: &str) -> Result<String, String> {
    let host = input.trim().trim_end_matches('.').to_ascii_lowercase();

    if host.is_empty() {
        return Err("Hostname cannot be empty".to_string());
    }

    if host.len() > 253 {
        return Err("Hostname too long (max 253 characters)".to_string());
    }

    for label in host.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(format!("Invalid hostname label in '{input}'"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(format!("Hostname label cannot start or end with '-' in '{input}'"));
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(format!("Hostname '{input}' contains invalid characters"));
        }
    }

    if host.chars().all(|c| c.is_ascii_digit() || c == '.') {
        return Err(format!("'{input}' is not a valid IPv4 address"));
    }

    Ok(host)
}

/// Checks if a port is well-known and returns informational message.
///
/// This is informational only and does not block saving.
pub fn check_well_known_port(port: u16) -> Option<String> {
    if port <= 1024 {
        let name = match port {
            22 => "SSH",
            80 => "HTTP",
            443 => "HTTPS",
            53 => "DNS",
            25 => "SMTP",
            21 => "FTP",
            123 => "NTP",
            _ => return Some(format!("Privileged port {port}")),
        };
        Some(format!("Port {port}: {name}"))
    } else {
        None
    }
}
