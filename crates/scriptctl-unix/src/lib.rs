//! Unix process management: process groups, POSIX signals, sysinfo-based
//! descendant discovery.

mod unix_process_manager;

#[cfg(unix)]
pub use unix_process_manager::{UnixProcessHandle, UnixProcessManager};

#[cfg(unix)]
pub struct UnixProcessManagerFactory;

#[cfg(unix)]
impl scriptctl_core::ProcessManagerFactory for UnixProcessManagerFactory {
    type Manager = UnixProcessManager;

    fn create_process_manager() -> UnixProcessManager {
        use scriptctl_core::ProcessManager;
        UnixProcessManager::new()
    }

    fn platform_name() -> &'static str {
        "Unix"
    }
}
