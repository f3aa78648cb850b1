use anyhow::Result;
use async_trait::async_trait;
use scriptctl_core::{
    ProcessHandle, ProcessId, ProcessLifecycle, ProcessManager, ProcessManagerFactory,
    ProcessTermination, TerminationResult,
};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Platform-specific process manager implementations
#[derive(Clone)]
pub enum PlatformProcessManager {
    #[cfg(unix)]
    Unix(Arc<scriptctl_unix::UnixProcessManager>),
    #[cfg(windows)]
    Windows(Arc<scriptctl_windows::WindowsProcessManager>),
}

impl PlatformProcessManager {
    pub fn platform_name() -> &'static str {
        #[cfg(unix)]
        {
            scriptctl_unix::UnixProcessManagerFactory::platform_name()
        }

        #[cfg(windows)]
        {
            scriptctl_windows::WindowsProcessManagerFactory::platform_name()
        }
    }
}

#[async_trait]
impl ProcessLifecycle for PlatformProcessManager {
    async fn spawn_process(
        &self,
        command: &str,
        args: &[String],
        working_dir: Option<&Path>,
        env: &HashMap<String, String>,
    ) -> Result<Box<dyn ProcessHandle>, std::io::Error> {
        match self {
            #[cfg(unix)]
            Self::Unix(manager) => manager.spawn_process(command, args, working_dir, env).await,
            #[cfg(windows)]
            Self::Windows(manager) => manager.spawn_process(command, args, working_dir, env).await,
        }
    }
}

#[async_trait]
impl ProcessTermination for PlatformProcessManager {
    async fn terminate_gracefully(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
        match self {
            #[cfg(unix)]
            Self::Unix(manager) => manager.terminate_gracefully(handle).await,
            #[cfg(windows)]
            Self::Windows(manager) => manager.terminate_gracefully(handle).await,
        }
    }

    async fn force_kill(&self, handle: &mut dyn ProcessHandle) -> TerminationResult {
        match self {
            #[cfg(unix)]
            Self::Unix(manager) => manager.force_kill(handle).await,
            #[cfg(windows)]
            Self::Windows(manager) => manager.force_kill(handle).await,
        }
    }

    async fn find_child_processes(&self, parent_pid: ProcessId) -> Result<Vec<ProcessId>> {
        match self {
            #[cfg(unix)]
            Self::Unix(manager) => manager.find_child_processes(parent_pid).await,
            #[cfg(windows)]
            Self::Windows(manager) => manager.find_child_processes(parent_pid).await,
        }
    }

    async fn kill_by_image_name(&self, image_name: &str) -> TerminationResult {
        match self {
            #[cfg(unix)]
            Self::Unix(manager) => manager.kill_by_image_name(image_name).await,
            #[cfg(windows)]
            Self::Windows(manager) => manager.kill_by_image_name(image_name).await,
        }
    }
}

#[async_trait]
impl ProcessManager for PlatformProcessManager {
    fn new() -> Self {
        #[cfg(unix)]
        {
            info!("Creating Unix process manager");
            Self::Unix(Arc::new(
                scriptctl_unix::UnixProcessManagerFactory::create_process_manager(),
            ))
        }

        #[cfg(windows)]
        {
            info!("Creating Windows process manager");
            Self::Windows(Arc::new(
                scriptctl_windows::WindowsProcessManagerFactory::create_process_manager(),
            ))
        }

        #[cfg(not(any(unix, windows)))]
        {
            compile_error!("Unsupported platform: only Unix and Windows are currently supported");
        }
    }

    fn emergency_kill(&self, pid: ProcessId) {
        match self {
            #[cfg(unix)]
            Self::Unix(manager) => manager.emergency_kill(pid),
            #[cfg(windows)]
            Self::Windows(manager) => manager.emergency_kill(pid),
        }
    }
}

/// Platform-agnostic factory that selects the appropriate implementation at compile time
pub struct PlatformProcessManagerFactory;

impl ProcessManagerFactory for PlatformProcessManagerFactory {
    type Manager = PlatformProcessManager;

    fn create_process_manager() -> PlatformProcessManager {
        PlatformProcessManager::new()
    }

    fn platform_name() -> &'static str {
        PlatformProcessManager::platform_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_detection() {
        let platform = PlatformProcessManagerFactory::platform_name();
        #[cfg(unix)]
        assert_eq!(platform, "Unix");
        #[cfg(windows)]
        assert_eq!(platform, "Windows");

        let _process_manager = PlatformProcessManagerFactory::create_process_manager();
    }
}
