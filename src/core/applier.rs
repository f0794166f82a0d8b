//! Policy applier
//!
//! Commits a compiled [`DirectiveSet`] to the kernel with one
//! `iptables-restore --noflush` invocation. The batch flushes every chain
//! fwmgr owns before repopulating it, so a load either replaces all of them
//! or fails and leaves the previous ruleset in place, and loading the same
//! batch twice yields the same state as loading it once.
//!
//! Callers must not run two applies against the same host concurrently; the
//! CLI serializes them with a lock file.

use crate::core::batch::{batch_checksum, render_batch};
use crate::core::compiler::DirectiveSet;
use crate::core::error::{Error, Result};
use crate::core::verify::{parse_restore_errors, VerifyResult};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Time a timed-out tool gets to exit after SIGTERM before it is killed
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

fn default_restore_command() -> String {
    option_env!("FWMGR_SYSTEM_RESTORE_PATH")
        .unwrap_or("iptables-restore")
        .to_string()
}

fn default_save_command() -> String {
    option_env!("FWMGR_SYSTEM_SAVE_PATH")
        .unwrap_or("iptables-save")
        .to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

/// How the enforcement tools are located and invoked
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplierSettings {
    #[serde(default = "default_restore_command")]
    pub restore_command: String,
    /// Extra arguments placed before `--noflush`/`--test` (e.g. `["-w", "5"]`
    /// to wait for the xtables lock)
    #[serde(default)]
    pub restore_args: Vec<String>,
    #[serde(default = "default_save_command")]
    pub save_command: String,
    #[serde(default)]
    pub save_args: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Wrap the tools in sudo/run0/pkexec when not running as root
    #[serde(default = "default_true")]
    pub elevate: bool,
}

impl Default for ApplierSettings {
    fn default() -> Self {
        Self {
            restore_command: default_restore_command(),
            restore_args: Vec::new(),
            save_command: default_save_command(),
            save_args: Vec::new(),
            timeout_secs: default_timeout_secs(),
            elevate: true,
        }
    }
}

/// Summary of a successful load
#[derive(Debug, Clone)]
pub struct ApplyReport {
    /// Directives loaded, flushes included
    pub directives: usize,
    /// SHA-256 of the loaded batch
    pub checksum: String,
    pub elapsed: Duration,
}

/// Writes a batch to a private temp file and hands it to iptables-restore.
#[derive(Debug, Clone)]
pub struct PolicyApplier {
    settings: ApplierSettings,
    timeout: Duration,
}

impl PolicyApplier {
    pub fn new(settings: ApplierSettings) -> Self {
        let timeout = Duration::from_secs(settings.timeout_secs.max(1));
        Self { settings, timeout }
    }

    /// Overrides the per-invocation timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn settings(&self) -> &ApplierSettings {
        &self.settings
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn resolve(program: &str) -> Result<PathBuf> {
        crate::utils::find_binary(program).ok_or_else(|| {
            error!("Enforcement tool '{program}' not found");
            Error::DependencyMissing(program.to_string())
        })
    }

    /// Renders the batch into a 0600 temp file. The file is removed when the
    /// returned handle drops, on every exit path.
    fn write_batch(batch: &str) -> Result<NamedTempFile> {
        use std::os::unix::fs::PermissionsExt;

        let mut file = NamedTempFile::with_prefix("fwmgr-batch-")?;
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600))?;
        file.write_all(batch.as_bytes())?;
        file.flush()?;
        Ok(file)
    }

    /// Runs iptables-restore with the batch file as stdin, bounded by the
    /// timeout. A child that outlives the timeout is terminated.
    async fn run_restore(&self, batch: &str, mode_arg: &str) -> Result<Output> {
        let program = Self::resolve(&self.settings.restore_command)?;
        let file = Self::write_batch(batch)?;
        let stdin = file.reopen()?;

        let mut args: Vec<&str> = self.settings.restore_args.iter().map(String::as_str).collect();
        args.push(mode_arg);

        let program = program.to_string_lossy();
        debug!("Running {program} {}", args.join(" "));

        let mut cmd =
            crate::elevation::create_restore_command(&program, &args, self.settings.elevate)?;
        let elevated = is_wrapped(&cmd, &program);
        let child = cmd
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                error!("Failed to spawn {program}: {e}");
                Error::Apply {
                    message: format!("failed to start {program}: {e}"),
                    stderr: None,
                    exit_code: None,
                }
            })?;

        let Some(output) = self.wait_or_terminate(child).await? else {
            error!("{program} did not finish within {:?}", self.timeout);
            let outcome = if elevated {
                "it was asked to stop, but the elevated load may still finish; \
                 run `fwmgr verify` in a few seconds to see which ruleset is live"
            } else {
                "the live ruleset is unknown (either fully old or fully new), \
                 run `fwmgr verify` to find out"
            };
            return Err(Error::Apply {
                message: format!(
                    "{program} timed out after {}s; {outcome}",
                    self.timeout.as_secs_f32()
                ),
                stderr: None,
                exit_code: None,
            });
        };

        drop(file);
        Ok(output)
    }

    /// Waits for the child within the timeout, collecting its output.
    ///
    /// Returns `None` on timeout, after the child has been terminated:
    /// SIGTERM first, which sudo and run0 relay to the wrapped tool, then
    /// SIGKILL once [`TERMINATE_GRACE`] has passed.
    async fn wait_or_terminate(&self, mut child: Child) -> Result<Option<Output>> {
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(status) => Ok(Some(Output {
                status: status?,
                stdout: collect(stdout).await?,
                stderr: collect(stderr).await?,
            })),
            Err(_) => {
                stdout.abort();
                stderr.abort();
                terminate(&mut child).await;
                Ok(None)
            }
        }
    }

    /// Loads the compiled policy atomically.
    ///
    /// # Errors
    ///
    /// - `Error::DependencyMissing` if the restore tool is not installed
    ///   (checked before anything is written or run)
    /// - `Error::Elevation` if elevation is needed but unavailable
    /// - `Error::Apply` if the tool rejects the batch, fails to start or
    ///   times out; the tool's stderr and exit code are attached
    pub async fn apply(&self, set: &DirectiveSet) -> Result<ApplyReport> {
        let started = Instant::now();
        let batch = render_batch(set);
        let checksum = batch_checksum(&batch);

        info!(
            directives = set.len(),
            checksum = &checksum[..12],
            "Loading ruleset via iptables-restore --noflush"
        );

        let output = self.run_restore(&batch, "--noflush").await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let exit_code = output.status.code();
            error!("iptables-restore rejected the batch: {stderr}");
            return Err(Error::Apply {
                message: match exit_code {
                    Some(code) => format!("iptables-restore exited with status {code}"),
                    None => "iptables-restore was terminated by a signal".to_string(),
                },
                stderr: Some(stderr),
                exit_code,
            });
        }

        let elapsed = started.elapsed();
        info!("Ruleset loaded in {elapsed:?}");

        Ok(ApplyReport {
            directives: set.len(),
            checksum,
            elapsed,
        })
    }

    /// Parses the batch with `iptables-restore --test` without committing it.
    ///
    /// A rejected batch is reported as an unsuccessful [`VerifyResult`], not an
    /// error.
    ///
    /// # Errors
    ///
    /// Same as [`apply`](Self::apply) for a missing tool, elevation failure,
    /// spawn failure or timeout.
    pub async fn check(&self, set: &DirectiveSet) -> Result<VerifyResult> {
        let batch = render_batch(set);
        info!("Verifying batch via iptables-restore --test");

        let output = self.run_restore(&batch, "--test").await?;
        let stderr = String::from_utf8_lossy(&output.stderr);

        if output.status.success() {
            info!("Batch verification passed");
            Ok(VerifyResult::success().with_warnings(parse_restore_errors(&stderr)))
        } else {
            warn!("Batch verification failed: {}", stderr.trim());
            Ok(VerifyResult::failure(parse_restore_errors(&stderr)))
        }
    }

    /// Reads the live ruleset with iptables-save.
    ///
    /// Used after a timed-out apply to find out which ruleset the kernel holds.
    ///
    /// # Errors
    ///
    /// `Error::DependencyMissing`, `Error::Elevation`, or `Error::Apply` when
    /// the save tool fails or times out.
    pub async fn read_live(&self) -> Result<String> {
        let program = Self::resolve(&self.settings.save_command)?;
        let program = program.to_string_lossy();
        let args: Vec<&str> = self.settings.save_args.iter().map(String::as_str).collect();

        let mut cmd = crate::elevation::create_save_command(&program, &args, self.settings.elevate)?;
        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Apply {
                message: format!("failed to start {program}: {e}"),
                stderr: None,
                exit_code: None,
            })?;

        let output = self.wait_or_terminate(child).await?.ok_or_else(|| Error::Apply {
            message: format!("{program} timed out after {}s", self.timeout.as_secs_f32()),
            stderr: None,
            exit_code: None,
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!("{program} failed: {stderr}");
            return Err(Error::Apply {
                message: format!("{program} failed"),
                stderr: Some(stderr),
                exit_code: output.status.code(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Whether the elevation layer wrapped `program` in sudo/run0/pkexec.
fn is_wrapped(cmd: &Command, program: &str) -> bool {
    cmd.as_std().get_program() != std::ffi::OsStr::new(program)
}

fn drain<R>(pipe: Option<R>) -> JoinHandle<std::io::Result<Vec<u8>>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_end(&mut buf).await?;
        }
        Ok(buf)
    })
}

async fn collect(reader: JoinHandle<std::io::Result<Vec<u8>>>) -> Result<Vec<u8>> {
    reader
        .await
        .map_err(|e| Error::Internal(format!("output reader failed: {e}")))?
        .map_err(Error::from)
}

/// Stops a timed-out child: SIGTERM, a grace period, then SIGKILL.
///
/// A bare SIGKILL would only reach an elevation wrapper and orphan the tool
/// it started, which could then commit after the caller has moved on.
async fn terminate(child: &mut Child) {
    if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => {
                if let Ok(Ok(status)) = tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
                    debug!("Timed-out child exited after SIGTERM ({status})");
                    return;
                }
                warn!("Timed-out child ignored SIGTERM for {TERMINATE_GRACE:?}, killing it");
            }
            Err(e) => warn!("Failed to send SIGTERM to pid {pid}: {e}"),
        }
    }

    if let Err(e) = child.kill().await {
        warn!("Failed to kill timed-out child: {e}");
    }
}

/// Exclusive advisory lock serializing applies on one host; released on drop.
pub struct ApplyLock {
    _guard: Flock<std::fs::File>,
}

impl ApplyLock {
    /// Takes the lock without waiting.
    ///
    /// # Errors
    ///
    /// `Error::Apply` if another process holds it, `Error::Io` if the lock
    /// file cannot be opened or locked.
    pub fn acquire(path: &Path) -> Result<Self> {
        use std::os::unix::fs::OpenOptionsExt;

        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .mode(0o600)
            .open(path)?;

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(guard) => {
                debug!("Acquired apply lock {}", path.display());
                Ok(Self { _guard: guard })
            }
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => Err(Error::Apply {
                message: format!(
                    "another apply is in progress (lock held on {})",
                    path.display()
                ),
                stderr: None,
                exit_code: None,
            }),
            Err((_, errno)) => Err(Error::Io(std::io::Error::from(errno))),
        }
    }
}
