use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tokio::process::{ChildStderr, ChildStdout};

/// Unique identifier for a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub u32);

impl From<u32> for ProcessId {
    fn from(pid: u32) -> Self {
        ProcessId(pid)
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a process
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessStatus {
    /// Process is currently running
    Running,
    /// Process exited with status information
    Exited(std::process::ExitStatus),
    /// Process status is unknown
    Unknown,
}

impl ProcessStatus {
    pub fn code(&self) -> Option<i32> {
        match self {
            ProcessStatus::Exited(status) => status.code(),
            _ => None,
        }
    }

    /// Terminating signal, always `None` off Unix
    pub fn signal(&self) -> Option<i32> {
        match self {
            #[cfg(unix)]
            ProcessStatus::Exited(status) => {
                use std::os::unix::process::ExitStatusExt;
                status.signal()
            }
            _ => None,
        }
    }
}

/// Result of a process termination operation
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationResult {
    /// Process was successfully terminated
    Success,
    /// Process was not found (already exited)
    ProcessNotFound,
    /// Insufficient privileges
    AccessDenied,
    /// The operation does not exist on this platform
    Unsupported,
    /// Operation failed with specific error message
    Failed(String),
}

impl TerminationResult {
    /// Success and "already gone" both mean nothing is left to do
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            TerminationResult::Success | TerminationResult::ProcessNotFound
        )
    }
}

/// How a graceful-then-forceful termination played out
#[derive(Debug, Clone, PartialEq)]
pub struct TerminationOutcome {
    /// The process was force killed
    pub escalated: bool,
    /// The graceful request was delivered and the full grace period ran out.
    /// False when escalation happened because the request could not be sent.
    pub grace_elapsed: bool,
    /// Exit status once observed, `None` if the process could not be reaped
    pub status: Option<ProcessStatus>,
}

/// Core trait for process lifecycle management
#[async_trait]
pub trait ProcessLifecycle: Send + Sync {
    /// Spawn a process with piped stdout and stderr and a null stdin
    async fn spawn_process(
        &self,
        command: &str,
        args: &[String],
        working_dir: Option<&Path>,
        env: &HashMap<String, String>,
    ) -> Result<Box<dyn ProcessHandle>, std::io::Error>;

    /// Wait for a process to exit with optional timeout
    async fn wait_for_exit(
        &self,
        handle: &mut dyn ProcessHandle,
        timeout: Option<Duration>,
    ) -> Result<ProcessStatus> {
        match timeout {
            Some(duration) => tokio::time::timeout(duration, handle.wait())
                .await
                .map_err(|_| anyhow::anyhow!("Timeout waiting for process exit"))?,
            None => handle.wait().await,
        }
    }
}

/// Trait for process termination including process trees
#[async_trait]
pub trait ProcessTermination: Send + Sync {
    /// Ask a process and the processes it started to exit (SIGTERM on Unix)
    async fn terminate_gracefully(&self, handle: &mut dyn ProcessHandle) -> TerminationResult;

    /// Force kill a process and the processes it started (SIGKILL on Unix)
    async fn force_kill(&self, handle: &mut dyn ProcessHandle) -> TerminationResult;

    /// Find all descendants of a process, deepest first
    async fn find_child_processes(&self, pid: ProcessId) -> Result<Vec<ProcessId>>;

    /// Force kill every process whose image name matches.
    ///
    /// Best effort and indiscriminate: it also hits processes this manager
    /// never launched. Platforms without a meaningful image-name kill
    /// return `Unsupported`.
    async fn kill_by_image_name(&self, image_name: &str) -> TerminationResult;
}

/// Trait representing a handle to a spawned process
#[async_trait]
pub trait ProcessHandle: Send + Sync {
    /// Get the process ID (None once the process has been reaped)
    fn get_pid(&self) -> Option<ProcessId>;

    /// Get the command that started this process
    fn get_command(&self) -> &str;

    /// Get the arguments passed to this process
    fn get_args(&self) -> &[String];

    /// Take ownership of the captured output pipes. Returns `None`s on the
    /// second call.
    fn take_output(&mut self) -> (Option<ChildStdout>, Option<ChildStderr>);

    /// Check if the process is still running (non-blocking)
    async fn is_running(&self) -> bool;

    /// Try to get exit status without blocking
    async fn try_wait(&mut self) -> Result<Option<ProcessStatus>>;

    /// Wait for the process to exit
    async fn wait(&mut self) -> Result<ProcessStatus>;

    /// Kill the process and reap it
    async fn kill(&mut self) -> Result<()>;
}

/// High-level process manager trait that combines lifecycle and termination
#[async_trait]
pub trait ProcessManager: ProcessLifecycle + ProcessTermination {
    /// Create a new process manager instance
    fn new() -> Self
    where
        Self: Sized;

    /// Synchronously kill a pid and its group/tree. Used from `Drop`, where
    /// nothing can be awaited.
    fn emergency_kill(&self, pid: ProcessId);

    /// Graceful signal, bounded wait, then forced kill.
    async fn terminate_with_grace(
        &self,
        handle: &mut dyn ProcessHandle,
        grace: Duration,
    ) -> TerminationOutcome {
        let graceful = self.terminate_gracefully(handle).await;
        if graceful == TerminationResult::Success {
            if let Ok(status) = self.wait_for_exit(handle, Some(grace)).await {
                return TerminationOutcome {
                    escalated: false,
                    grace_elapsed: false,
                    status: Some(status),
                };
            }
        } else if let Ok(Some(status)) = handle.try_wait().await {
            return TerminationOutcome {
                escalated: false,
                grace_elapsed: false,
                status: Some(status),
            };
        } else {
            tracing::debug!(result = ?graceful, "Graceful termination not delivered");
        }

        let forced = self.force_kill(handle).await;
        tracing::debug!(result = ?forced, "Escalated to forced kill");

        // A SIGKILLed process is reaped almost immediately; a bound keeps a
        // wedged kernel state from hanging the caller.
        let status = self
            .wait_for_exit(handle, Some(Duration::from_secs(5)))
            .await
            .ok();
        TerminationOutcome {
            escalated: true,
            grace_elapsed: graceful == TerminationResult::Success,
            status,
        }
    }
}

/// Factory trait for creating platform-specific process managers
pub trait ProcessManagerFactory {
    /// The type of process manager this factory creates
    type Manager: ProcessManager;

    /// Create a process manager for the current platform
    fn create_process_manager() -> Self::Manager;

    /// Get the platform name for logging and debugging
    fn platform_name() -> &'static str;
}
