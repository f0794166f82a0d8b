//! Utility functions for directory management, binary lookup and checksums
//!
//! Directories follow the XDG Base Directory specification:
//!
//! - Config: `~/.config/fwmgr/` - `config.json`
//! - Data: `~/.local/share/fwmgr/` - the policy database
//! - State: `~/.local/state/fwmgr/` - audit log, apply lock
//!
//! # Example
//!
//! ```no_run
//! use fwmgr::utils::{ensure_dirs, get_data_dir};
//!
//! ensure_dirs().expect("Failed to create directories");
//!
//! if let Some(data_path) = get_data_dir() {
//!     let _db = data_path.join("policy.json");
//! }
//! ```

use directories::ProjectDirs;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("org", "fwmgr", "fwmgr")
}

pub fn get_config_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.config_dir().to_path_buf())
}

pub fn get_data_dir() -> Option<PathBuf> {
    project_dirs().map(|pd| pd.data_dir().to_path_buf())
}

pub fn get_state_dir() -> Option<PathBuf> {
    project_dirs().and_then(|pd| pd.state_dir().map(Path::to_path_buf))
}

pub fn ensure_dirs() -> std::io::Result<()> {
    use std::fs::DirBuilder;
    use std::os::unix::fs::DirBuilderExt;

    let mut builder = DirBuilder::new();
    builder.mode(0o700);
    builder.recursive(true);

    for dir in [get_config_dir(), get_data_dir(), get_state_dir()]
        .into_iter()
        .flatten()
    {
        builder.create(dir)?;
    }

    Ok(())
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Administrator directories searched after `PATH`.
///
/// Unprivileged accounts on Debian-family systems have no sbin entries in
/// `PATH`, yet the enforcement tools live there and run elevated.
pub const SYSTEM_SBIN_DIRS: [&str; 3] = ["/usr/local/sbin", "/usr/sbin", "/sbin"];

fn search_dirs<I>(name: &str, dirs: I) -> Option<PathBuf>
where
    I: IntoIterator<Item = PathBuf>,
{
    dirs.into_iter()
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

/// Resolves a program name the way `execvp` would, then falls back to the
/// system sbin directories.
///
/// Names containing a `/` are taken as paths; bare names are searched in
/// `PATH` first, then in [`SYSTEM_SBIN_DIRS`]. Returns `None` when no
/// executable file is found.
pub fn find_binary(name: &str) -> Option<PathBuf> {
    if name.is_empty() {
        return None;
    }

    if name.contains('/') {
        let path = PathBuf::from(name);
        return is_executable(&path).then_some(path);
    }

    let path_dirs: Vec<PathBuf> = std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).collect())
        .unwrap_or_default();

    search_dirs(
        name,
        path_dirs
            .into_iter()
            .chain(SYSTEM_SBIN_DIRS.iter().map(PathBuf::from)),
    )
}

pub fn binary_exists(name: &str) -> bool {
    find_binary(name).is_some()
}

/// SHA-256 of `content`, hex encoded.
pub fn compute_checksum(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Truncates a string to a maximum length and adds an ellipsis if needed
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        // Nearest character boundary, so multi-byte characters are not split
        let end = s
            .char_indices()
            .map(|(idx, _)| idx)
            .take_while(|&idx| idx <= max_len.saturating_sub(3))
            .last()
            .unwrap_or(0);
        format!("{}...", &s[..end])
    }
}
