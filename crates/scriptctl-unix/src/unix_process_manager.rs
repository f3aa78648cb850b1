use anyhow::Result;
use async_trait::async_trait;
use scriptctl_core::{
    ProcessHandle, ProcessId, ProcessLifecycle, ProcessManager, ProcessStatus, ProcessTermination,
    TerminationResult,
};
use std::collections::HashMap;
use std::path::Path;
use tokio::process::{ChildStderr, ChildStdout};

#[cfg(unix)]
mod unix_impl {
    use super::*;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid as NixPid;
    use std::process::Stdio;
    use sysinfo::System;
    use tokio::process::{Child, Command};
    use tracing::{debug, info, warn};

    /// Unix-specific process handle implementation
    pub struct UnixProcessHandle {
        child: Child,
        command: String,
        args: Vec<String>,
    }

    impl UnixProcessHandle {
        pub fn new(child: Child, command: String, args: Vec<String>) -> Self {
            Self {
                child,
                command,
                args,
            }
        }
    }

    #[async_trait]
    impl ProcessHandle for UnixProcessHandle {
        fn get_pid(&self) -> Option<ProcessId> {
            self.child.id().map(ProcessId::from)
        }

        fn get_command(&self) -> &str {
            &self.command
        }

        fn get_args(&self) -> &[String] {
            &self.args
        }

        fn take_output(&mut self) -> (Option<ChildStdout>, Option<ChildStderr>) {
            (self.child.stdout.take(), self.child.stderr.take())
        }

        async fn is_running(&self) -> bool {
            match self.get_pid() {
                // Signal 0 only checks that the process exists
                Some(pid) => signal::kill(NixPid::from_raw(pid.0 as i32), None).is_ok(),
                None => false,
            }
        }

        async fn try_wait(&mut self) -> Result<Option<ProcessStatus>> {
            Ok(self.child.try_wait()?.map(ProcessStatus::Exited))
        }

        async fn wait(&mut self) -> Result<ProcessStatus> {
            let status = self.child.wait().await?;
            Ok(ProcessStatus::Exited(status))
        }

        async fn kill(&mut self) -> Result<()> {
            self.child
                .kill()
                .await
                .map_err(|e| anyhow::anyhow!("Failed to kill process: {}", e))
        }
    }

    /// Unix process manager.
    ///
    /// Every script runs as the leader of its own process group, so signals
    /// sent to the group also reach whatever an interpreter forked.
    pub struct UnixProcessManager {
        system: std::sync::Mutex<System>,
    }

    impl Default for UnixProcessManager {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl ProcessLifecycle for UnixProcessManager {
        async fn spawn_process(
            &self,
            command: &str,
            args: &[String],
            working_dir: Option<&Path>,
            env: &HashMap<String, String>,
        ) -> Result<Box<dyn ProcessHandle>, std::io::Error> {
            let mut cmd = Command::new(command);
            cmd.args(args)
                .envs(env)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            if let Some(dir) = working_dir {
                cmd.current_dir(dir);
            }

            // New process group for group-wide signalling
            cmd.process_group(0);

            let child = cmd.spawn()?;

            if let Some(pid) = child.id() {
                info!(pid, command, args = ?args, "Spawned Unix process");
            }

            Ok(Box::new(UnixProcessHandle::new(
                child,
                command.to_string(),
                args.to_vec(),
            )))
        }
    }

    #[async_trait]
    impl ProcessTermination for UnixProcessManager {
        async fn terminate_gracefully(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
            let Some(pid) = handle.get_pid() else {
                return TerminationResult::ProcessNotFound;
            };
            match send_to_group(pid, Signal::SIGTERM) {
                TerminationResult::Success => {
                    info!(pid = pid.0, "Sent SIGTERM to process group");
                    TerminationResult::Success
                }
                other => other,
            }
        }

        async fn force_kill(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
            let Some(pid) = handle.get_pid() else {
                return TerminationResult::ProcessNotFound;
            };

            // Descendants that left the group (setsid, daemonized workers)
            // are only reachable by pid.
            match self.find_child_processes(pid).await {
                Ok(children) => {
                    for child_pid in children {
                        if let Err(e) =
                            signal::kill(NixPid::from_raw(child_pid.0 as i32), Signal::SIGKILL)
                        {
                            debug!(pid = child_pid.0, error = %e, "SIGKILL to descendant failed");
                        }
                    }
                }
                Err(e) => warn!(pid = pid.0, error = %e, "Failed to enumerate descendants"),
            }

            let result = send_to_group(pid, Signal::SIGKILL);
            if result == TerminationResult::Success {
                info!(pid = pid.0, "Sent SIGKILL to process group");
            }

            // Also call handle's kill method so the child gets reaped
            if let Err(e) = handle.kill().await {
                warn!(pid = pid.0, error = %e, "Handle kill cleanup failed");
            }
            result
        }

        async fn find_child_processes(&self, parent_pid: ProcessId) -> Result<Vec<ProcessId>> {
            let mut system = self
                .system
                .lock()
                .map_err(|_| anyhow::anyhow!("process table lock poisoned"))?;
            system.refresh_processes_specifics(
                sysinfo::ProcessesToUpdate::All,
                true,
                sysinfo::ProcessRefreshKind::default(),
            );

            let mut children = Vec::new();
            Self::find_children_recursive(&system, parent_pid.0, &mut children);

            Ok(children.into_iter().map(ProcessId::from).collect())
        }

        async fn kill_by_image_name(&self, image_name: &str) -> TerminationResult {
            // Handle and group based termination already covers what this
            // manager launched on Unix.
            debug!(image_name, "Image-name sweep is not used on Unix");
            TerminationResult::Unsupported
        }
    }

    impl UnixProcessManager {
        /// Recursively find all child processes, grandchildren first
        fn find_children_recursive(system: &System, parent_pid: u32, result: &mut Vec<u32>) {
            for (pid, process) in system.processes() {
                #[allow(clippy::collapsible_if)]
                if let Some(ppid) = process.parent() {
                    if ppid.as_u32() == parent_pid {
                        let child_pid = pid.as_u32();
                        Self::find_children_recursive(system, child_pid, result);
                        result.push(child_pid);
                    }
                }
            }
        }
    }

    #[async_trait]
    impl ProcessManager for UnixProcessManager {
        fn new() -> Self {
            info!("Initializing Unix process manager with system monitoring");
            Self {
                system: std::sync::Mutex::new(System::new()),
            }
        }

        fn emergency_kill(&self, pid: ProcessId) {
            if let TerminationResult::Failed(e) = send_to_group(pid, Signal::SIGKILL) {
                warn!(pid = pid.0, error = %e, "Emergency kill failed");
            }
        }
    }

    /// Signal the process group led by `pid`, falling back to the pid alone
    fn send_to_group(pid: ProcessId, sig: Signal) -> TerminationResult {
        let nix_pid = NixPid::from_raw(pid.0 as i32);
        let result = match signal::killpg(nix_pid, sig) {
            Err(nix::errno::Errno::ESRCH) => signal::kill(nix_pid, sig),
            other => other,
        };
        match result {
            Ok(()) => TerminationResult::Success,
            Err(nix::errno::Errno::ESRCH) => {
                info!(pid = pid.0, "Process not found (already terminated)");
                TerminationResult::ProcessNotFound
            }
            Err(nix::errno::Errno::EPERM) => {
                warn!(pid = pid.0, signal = %sig, "Permission denied to signal process");
                TerminationResult::AccessDenied
            }
            Err(e) => {
                warn!(pid = pid.0, signal = %sig, error = %e, "Failed to signal process");
                TerminationResult::Failed(format!("{sig} failed: {e}"))
            }
        }
    }
}

// Re-export the Unix implementation when on Unix systems
#[cfg(unix)]
pub use unix_impl::{UnixProcessHandle, UnixProcessManager};
