//! scriptctl - launch, observe and stop the scripts in a directory
//!
//! ```rust,no_run
//! use scriptctl::{ManagerConfig, ScriptManager};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ManagerConfig::builder()
//!     .scripts_dir("/opt/scripts")
//!     .allowed_extensions(["sh"])
//!     .interpreter("sh", "/bin/sh")
//!     .build()?;
//! let manager = ScriptManager::new(config)?;
//!
//! let mut events = manager.subscribe();
//! manager.start("backup.sh").await?;
//! while let Some(event) = events.recv().await {
//!     println!("[{}] {}", event.stream, event.message);
//!     if event.is_terminal() {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod manager;

pub use manager::{
    InstanceId, InstanceInfo, InstanceState, PlatformProcessManager,
    PlatformProcessManagerFactory, RunHandle, RunState, ScriptManager, StopResult,
};

// Re-export core functionality
pub use scriptctl_core::*;
