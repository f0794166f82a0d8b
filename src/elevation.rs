//! Privilege elevation for the enforcement tools
//!
//! fwmgr can run as an unprivileged administrator account and only elevates
//! the two programs that touch kernel state:
//!
//! - **iptables-restore**: atomic batch load (and `--test` parse checks)
//! - **iptables-save**: live-state reads for verification
//!
//! # Elevation Strategy
//!
//! - Already root: the program runs directly
//! - `FWMGR_ELEVATION_METHOD` (`sudo`, `run0` or `pkexec`) forces a method,
//!   e.g. for sudoers NOPASSWD setups: `FWMGR_ELEVATION_METHOD=sudo fwmgr apply`
//! - Otherwise `run0` when available (systemd v256+, no SUID), then `sudo` on a
//!   terminal, then `pkexec`
//!
//! Arguments are passed without shell interpolation.
//!
//! # Example
//!
//! ```no_run
//! use fwmgr::elevation::create_save_command;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut cmd = create_save_command("iptables-save", &[], true)?;
//! let output = cmd.output().await?;
//! # Ok(())
//! # }
//! ```

use std::io;
use tokio::process::Command;

/// Environment variable that forces an elevation method
pub const ELEVATION_METHOD_ENV: &str = "FWMGR_ELEVATION_METHOD";

#[derive(Debug, thiserror::Error)]
pub enum ElevationError {
    /// No elevation wrapper could be found for a non-root caller
    #[error("No elevation method available (install sudo, run0 or pkexec, or run as root)")]
    NoMethodAvailable,

    /// Requested elevation method is not available (binary not found)
    #[error("Elevation method '{0}' is not available (binary not found)")]
    MethodNotAvailable(String),

    #[error("Invalid FWMGR_ELEVATION_METHOD '{0}'. Valid options: sudo, run0, pkexec")]
    InvalidMethod(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

fn wrapped(wrapper: &str, program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(wrapper);
    cmd.arg(program).args(args);
    cmd
}

fn direct(program: &str, args: &[&str]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd
}

/// Builds the command line for `program`, wrapped in an elevation tool when
/// the caller is not root and `elevate` is set.
fn build_elevated_command(
    program: &str,
    args: &[&str],
    elevate: bool,
) -> Result<Command, ElevationError> {
    use std::os::fd::AsFd;

    if !elevate || nix::unistd::getuid().is_root() {
        return Ok(direct(program, args));
    }

    if let Ok(method) = std::env::var(ELEVATION_METHOD_ENV) {
        let method = method.to_lowercase();
        if !method.is_empty() {
            return match method.as_str() {
                "sudo" | "run0" | "pkexec" => {
                    if !crate::utils::binary_exists(&method) {
                        return Err(ElevationError::MethodNotAvailable(method));
                    }
                    Ok(wrapped(&method, program, args))
                }
                _ => Err(ElevationError::InvalidMethod(method)),
            };
        }
    }

    if crate::utils::binary_exists("run0") {
        return Ok(wrapped("run0", program, args));
    }

    let is_atty = nix::unistd::isatty(std::io::stdin().as_fd()).unwrap_or(false);
    if is_atty && crate::utils::binary_exists("sudo") {
        return Ok(wrapped("sudo", program, args));
    }

    if crate::utils::binary_exists("pkexec") {
        return Ok(wrapped("pkexec", program, args));
    }

    Err(ElevationError::NoMethodAvailable)
}

/// Creates an `iptables-restore` command (or the configured replacement).
///
/// # Errors
///
/// Returns `ElevationError` if elevation is required but unavailable.
pub fn create_restore_command(
    program: &str,
    args: &[&str],
    elevate: bool,
) -> Result<Command, ElevationError> {
    build_elevated_command(program, args, elevate)
}

/// Creates an `iptables-save` command (or the configured replacement).
///
/// # Errors
///
/// Returns `ElevationError` if elevation is required but unavailable.
pub fn create_save_command(
    program: &str,
    args: &[&str],
    elevate: bool,
) -> Result<Command, ElevationError> {
    build_elevated_command(program, args, elevate)
}
