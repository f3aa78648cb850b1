use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use sysinfo::System;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{info, warn};

use scriptctl_core::*;

/// taskkill exit code when no process matched
const TASKKILL_NOT_FOUND: i32 = 128;

/// Windows-specific process handle implementation
pub struct WindowsProcessHandle {
    child: Child,
    command: String,
    args: Vec<String>,
}

impl WindowsProcessHandle {
    pub fn new(child: Child, command: String, args: Vec<String>) -> Self {
        Self {
            child,
            command,
            args,
        }
    }
}

#[async_trait]
impl ProcessHandle for WindowsProcessHandle {
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
        let Some(pid) = self.get_pid() else {
            warn!("Windows process handle has no PID - process may have exited");
            return false;
        };
        let target = sysinfo::Pid::from_u32(pid.0);
        let mut system = System::new();
        system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[target]), true);
        system.process(target).is_some()
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

/// Windows-specific process manager built on `taskkill`
pub struct WindowsProcessManager {
    system: std::sync::Mutex<System>,
}

impl Default for WindowsProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessLifecycle for WindowsProcessManager {
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

        #[cfg(windows)]
        {
            // CREATE_NO_WINDOW: no console popup for background scripts
            cmd.creation_flags(0x08000000);
        }

        let child = cmd.spawn()?;

        if let Some(pid) = child.id() {
            info!(
                pid = %pid,
                command = %command,
                args = ?args,
                "Spawned Windows process"
            );
        }

        Ok(Box::new(WindowsProcessHandle::new(
            child,
            command.to_string(),
            args.to_vec(),
        )))
    }
}

#[async_trait]
impl ProcessTermination for WindowsProcessManager {
    async fn terminate_gracefully(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
        let Some(pid) = handle.get_pid() else {
            return TerminationResult::ProcessNotFound;
        };
        let pid_string = pid.0.to_string();
        let result = taskkill(&["/T", "/PID", &pid_string]).await;
        if result == TerminationResult::Success {
            info!(pid = %pid.0, "Sent graceful termination to process tree");
        }
        result
    }

    async fn force_kill(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
        let Some(pid) = handle.get_pid() else {
            return TerminationResult::ProcessNotFound;
        };

        let pid_string = pid.0.to_string();
        let result = match taskkill(&["/F", "/T", "/PID", &pid_string]).await {
            TerminationResult::Failed(e) => {
                warn!(pid = %pid.0, error = %e, "taskkill /T failed, killing descendants manually");
                self.kill_descendants(pid).await;
                TerminationResult::Failed(e)
            }
            other => other,
        };

        // Also call handle's kill method for cleanup
        if let Err(e) = handle.kill().await {
            warn!(error = %e, "Handle kill cleanup failed");
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
        warn!(image_name, "Force killing every process with this image name");
        taskkill(&["/F", "/IM", image_name]).await
    }
}

impl WindowsProcessManager {
    async fn kill_descendants(&self, root_pid: ProcessId) {
        let children = match self.find_child_processes(root_pid).await {
            Ok(children) => children,
            Err(e) => {
                warn!(root_pid = %root_pid.0, error = %e, "Failed to find child processes");
                return;
            }
        };
        for child_pid in children {
            let pid_string = child_pid.0.to_string();
            let result = taskkill(&["/F", "/PID", &pid_string]).await;
            if !result.is_settled() {
                warn!(pid = %child_pid.0, result = ?result, "Failed to terminate child process");
            }
        }
    }

    /// Recursively find all child processes
    fn find_children_recursive(system: &System, parent_pid: u32, result: &mut Vec<u32>) {
        for (pid, process) in system.processes() {
            #[allow(clippy::collapsible_if)]
            if let Some(ppid) = process.parent() {
                if ppid.as_u32() == parent_pid {
                    let child_pid = pid.as_u32();
                    // Recursively find grandchildren first
                    Self::find_children_recursive(system, child_pid, result);
                    result.push(child_pid);
                }
            }
        }
    }
}

#[async_trait]
impl ProcessManager for WindowsProcessManager {
    fn new() -> Self {
        info!("Initializing Windows process manager with system monitoring");
        Self {
            system: std::sync::Mutex::new(System::new()),
        }
    }

    fn emergency_kill(&self, pid: ProcessId) {
        if let Err(e) = std::process::Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pid.0.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
        {
            warn!(pid = %pid.0, error = %e, "Emergency cleanup failed");
        }
    }
}

async fn taskkill(args: &[&str]) -> TerminationResult {
    let output = match Command::new("taskkill").args(args).output().await {
        Ok(output) => output,
        Err(e) => return TerminationResult::Failed(format!("taskkill could not run: {e}")),
    };
    match output.status.code() {
        Some(0) => TerminationResult::Success,
        Some(TASKKILL_NOT_FOUND) => TerminationResult::ProcessNotFound,
        _ => TerminationResult::Failed(String::from_utf8_lossy(&output.stderr).trim().to_string()),
    }
}
