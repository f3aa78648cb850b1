mod log_sink;
mod platform_factory;
mod registry;
mod supervisor;

pub use platform_factory::{PlatformProcessManager, PlatformProcessManagerFactory};
pub use registry::{InstanceId, InstanceInfo, InstanceState};

use chrono::{DateTime, Utc};
use scriptctl_core::{
    EventBus, ManagerConfig, OutputEvent, OutputStream, OutputSubscription, ProcessId,
    ProcessLifecycle, ProcessManager, ProcessManagerFactory, ScriptDescriptor, ScriptError,
    list_scripts, resolve_script,
};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use log_sink::ScriptLog;
use registry::{Registry, RunningInstance, StopRequest};
use supervisor::{Supervisor, spawn_reader};

/// Answer of [`ScriptManager::status`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Running,
    NotRunning,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Running => f.write_str("Running"),
            RunState::NotRunning => f.write_str("Not Running"),
        }
    }
}

/// Answer of [`ScriptManager::stop`]. Stopping something that is not
/// running is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopResult {
    Stopped {
        /// The grace period ran out and the process was killed
        forced: bool,
        exit_code: Option<i32>,
    },
    NotRunning,
}

/// Returned by a successful [`ScriptManager::start`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunHandle {
    pub script_name: String,
    pub instance_id: InstanceId,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
}

/// The process lifecycle manager.
///
/// Lists scripts in the configured directory, launches them, keeps at most
/// one running instance per script name, broadcasts their output as
/// [`OutputEvent`]s and stops them on request. Dropping the manager kills
/// whatever is still registered.
pub struct ScriptManager {
    shared: Arc<Shared>,
}

struct Shared {
    config: ManagerConfig,
    platform: Arc<PlatformProcessManager>,
    registry: Arc<Registry>,
    bus: EventBus,
}

impl ScriptManager {
    pub fn new(config: ManagerConfig) -> Result<Self, ScriptError> {
        config.validate()?;
        info!(
            platform = PlatformProcessManagerFactory::platform_name(),
            scripts_dir = %config.scripts_dir.display(),
            "Creating script manager"
        );
        Ok(Self {
            shared: Arc::new(Shared {
                bus: EventBus::new(config.event_capacity),
                platform: Arc::new(PlatformProcessManagerFactory::create_process_manager()),
                registry: Arc::new(Registry::new()),
                config,
            }),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    /// Directory scripts are read from, e.g. for an "open folder" action
    pub fn scripts_dir(&self) -> &Path {
        &self.shared.config.scripts_dir
    }

    /// Fresh snapshot of the scripts directory; empty if it does not exist
    pub fn list_available(&self) -> Vec<ScriptDescriptor> {
        list_scripts(&self.shared.config)
    }

    /// Observe output events from now on
    pub fn subscribe(&self) -> OutputSubscription {
        self.shared.bus.subscribe()
    }

    /// Launch a script, stopping a previous instance of it first.
    ///
    /// Failures are returned and also published as a `system` event.
    pub async fn start(&self, name: &str) -> Result<RunHandle, ScriptError> {
        self.shared.start(name).await
    }

    pub async fn stop(&self, name: &str) -> StopResult {
        self.shared.stop(name).await
    }

    /// Stop everything, then clear the registry even where a stop could not
    /// be confirmed.
    pub async fn stop_all(&self) {
        let names = self.shared.registry.names();
        info!(count = names.len(), "Stopping all scripts");

        let mut stops = JoinSet::new();
        for name in names {
            let shared = self.shared.clone();
            stops.spawn(async move {
                let result = shared.stop(&name).await;
                (name, result)
            });
        }
        while let Some(joined) = stops.join_next().await {
            match joined {
                Ok((name, result)) => debug!(script = %name, result = ?result, "Stopped"),
                Err(e) => warn!(error = %e, "Stop task failed"),
            }
        }

        for (name, instance) in self.shared.registry.drain() {
            warn!(script = %name, "Dropping unconfirmed instance from registry");
            let _ = instance.control.try_send(StopRequest { reply: None });
        }
    }

    /// `Running` iff an instance is registered for the name
    pub fn status(&self, name: &str) -> RunState {
        if self.shared.registry.contains(name) {
            RunState::Running
        } else {
            RunState::NotRunning
        }
    }

    pub fn running(&self) -> Vec<InstanceInfo> {
        self.shared.registry.snapshot()
    }
}

impl Shared {
    async fn start(&self, name: &str) -> Result<RunHandle, ScriptError> {
        let script = match resolve_script(&self.config, name) {
            Ok(script) => script,
            Err(e) => return Err(self.report_failure(name, e)),
        };

        let key_lock = self.registry.key_lock(name);
        let result = {
            let _guard = key_lock.lock().await;
            self.start_locked(name, script).await
        };
        drop(key_lock);
        self.registry.prune_key_lock(name);
        result
    }

    /// Caller holds the key lock for `name`
    async fn start_locked(
        &self,
        name: &str,
        script: ScriptDescriptor,
    ) -> Result<RunHandle, ScriptError> {
        if let StopResult::Stopped { .. } = self.stop_locked(name).await {
            debug!(script = %name, "Replaced previous instance");
        }

        let launch = LaunchCommand::new(&self.config, &script);
        let env = HashMap::new();
        let spawn = self.platform.spawn_process(
            &launch.program,
            &launch.args,
            Some(self.config.scripts_dir.as_path()),
            &env,
        );
        let mut handle = match tokio::time::timeout(self.config.spawn_timeout(), spawn).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(source)) => {
                let error = ScriptError::SpawnFailed {
                    name: name.to_string(),
                    source,
                };
                return Err(self.report_failure(name, error));
            }
            Err(_) => {
                let error = ScriptError::SpawnTimeout {
                    name: name.to_string(),
                    timeout: self.config.spawn_timeout(),
                };
                return Err(self.report_failure(name, error));
            }
        };

        let log = self
            .config
            .logs_dir
            .as_deref()
            .map(|dir| Arc::new(ScriptLog::new(dir, name)));
        let (stdout, stderr) = handle.take_output();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = stdout {
            readers.push(spawn_reader(
                stdout,
                name.to_string(),
                OutputStream::Stdout,
                self.bus.clone(),
                log.clone(),
            ));
        }
        if let Some(stderr) = stderr {
            readers.push(spawn_reader(
                stderr,
                name.to_string(),
                OutputStream::Stderr,
                self.bus.clone(),
                log,
            ));
        }

        let id = self.registry.next_id();
        let pid = handle.get_pid();
        let started_at = Utc::now();
        let (control, control_rx) = mpsc::channel(4);
        self.registry.insert(
            name,
            RunningInstance {
                id,
                pid,
                started_at,
                state: InstanceState::Running,
                control,
            },
        );

        let supervisor = Supervisor {
            id,
            script_name: name.to_string(),
            image_name: launch.image_name,
            handle,
            platform: self.platform.clone(),
            registry: self.registry.clone(),
            bus: self.bus.clone(),
            grace: self.config.termination_grace(),
            image_name_sweep: self.config.image_name_sweep,
            control: control_rx,
            readers,
        };
        tokio::spawn(supervisor.run());

        info!(script = %name, pid = ?pid.map(|p| p.0), "Script started");
        Ok(RunHandle {
            script_name: name.to_string(),
            instance_id: id,
            pid: pid.map(|p| p.0),
            started_at,
        })
    }

    async fn stop(&self, name: &str) -> StopResult {
        let key_lock = self.registry.key_lock(name);
        let result = {
            let _guard = key_lock.lock().await;
            self.stop_locked(name).await
        };
        drop(key_lock);
        self.registry.prune_key_lock(name);
        result
    }

    /// Caller holds the key lock for `name`
    async fn stop_locked(&self, name: &str) -> StopResult {
        let Some((id, control)) = self.registry.begin_exit(name) else {
            return StopResult::NotRunning;
        };

        let (reply, outcome) = oneshot::channel();
        if control
            .send(StopRequest { reply: Some(reply) })
            .await
            .is_err()
        {
            // The supervisor already finished and deregistered the instance
            return StopResult::NotRunning;
        }

        match outcome.await {
            Ok(report) => StopResult::Stopped {
                forced: report.escalated,
                exit_code: report.status.and_then(|status| status.code()),
            },
            Err(_) => {
                warn!(script = %name, "Supervisor went away without confirming the stop");
                self.registry.remove_if(name, id);
                StopResult::NotRunning
            }
        }
    }

    fn report_failure(&self, name: &str, error: ScriptError) -> ScriptError {
        warn!(script = %name, error = %error, "Failed to run script");
        self.bus.publish(OutputEvent::system(
            name,
            format!("Failed to run script: {error}"),
        ));
        error
    }
}

/// What actually gets executed for a script
#[derive(Debug, Clone, PartialEq, Eq)]
struct LaunchCommand {
    program: String,
    args: Vec<String>,
    /// File name of the running image: the interpreter when one is mapped,
    /// otherwise the script itself
    image_name: String,
}

impl LaunchCommand {
    fn new(config: &ManagerConfig, script: &ScriptDescriptor) -> Self {
        let path = script.path.to_string_lossy().into_owned();
        match config.interpreter_for(&script.name) {
            Some(interpreter) => Self {
                program: interpreter.to_string(),
                args: vec![path],
                image_name: Path::new(interpreter)
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_else(|| interpreter.to_string()),
            },
            None => Self {
                program: path,
                args: Vec::new(),
                image_name: script.name.clone(),
            },
        }
    }
}

impl Drop for ScriptManager {
    fn drop(&mut self) {
        let pids: Vec<ProcessId> = self.shared.registry.pids();
        if pids.is_empty() {
            return;
        }
        warn!(
            count = pids.len(),
            "Script manager dropped with running scripts - attempting emergency cleanup"
        );
        for pid in pids {
            self.shared.platform.emergency_kill(pid);
        }
    }
}
