use scriptctl_core::{
    EventBus, ExitReport, OutputEvent, OutputStream, ProcessHandle, ProcessManager,
    ProcessStatus, ProcessTermination, TerminationResult, stdio,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use super::log_sink::ScriptLog;
use super::platform_factory::PlatformProcessManager;
use super::registry::{InstanceId, Registry, StopReport, StopRequest};

/// How long output readers may keep going after the process is gone. A
/// grandchild holding the pipe open would otherwise keep them alive forever.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Owns one spawned process until it is gone and deregistered.
pub(crate) struct Supervisor {
    pub id: InstanceId,
    pub script_name: String,
    pub image_name: String,
    pub handle: Box<dyn ProcessHandle>,
    pub platform: Arc<PlatformProcessManager>,
    pub registry: Arc<Registry>,
    pub bus: EventBus,
    pub grace: Duration,
    pub image_name_sweep: bool,
    pub control: mpsc::Receiver<StopRequest>,
    pub readers: Vec<JoinHandle<()>>,
}

enum Ending {
    Exited(Option<ProcessStatus>),
    Stop(StopRequest),
}

impl Supervisor {
    pub async fn run(mut self) {
        let ending = tokio::select! {
            status = self.handle.wait() => Ending::Exited(status.ok()),
            request = self.control.recv() => match request {
                Some(request) => Ending::Stop(request),
                // Registry was cleared under us
                None => Ending::Stop(StopRequest { reply: None }),
            },
        };

        let (report, reply, requested) = match ending {
            Ending::Exited(status) => {
                self.registry.mark_exiting(&self.script_name, self.id);
                debug!(script = %self.script_name, status = ?status, "Process exited on its own");
                let report = StopReport {
                    escalated: false,
                    status,
                };
                (report, None, false)
            }
            Ending::Stop(request) => (self.terminate().await, request.reply, true),
        };

        self.drain_readers().await;

        // Deregistered before the terminal event goes out
        self.registry.remove_if(&self.script_name, self.id);
        self.registry.prune_key_lock(&self.script_name);
        let status = report.status.as_ref();
        self.bus.publish(OutputEvent::exited(
            &self.script_name,
            ExitReport {
                code: status.and_then(ProcessStatus::code),
                signal: status.and_then(ProcessStatus::signal),
                requested,
            },
        ));

        if let Some(reply) = reply {
            let _ = reply.send(report.clone());
        }
        // Stops that raced with a natural exit still get an answer
        self.control.close();
        while let Ok(request) = self.control.try_recv() {
            if let Some(reply) = request.reply {
                let _ = reply.send(report.clone());
            }
        }
    }

    async fn terminate(&mut self) -> StopReport {
        info!(script = %self.script_name, grace = ?self.grace, "Stopping script");
        let outcome = self
            .platform
            .terminate_with_grace(self.handle.as_mut(), self.grace)
            .await;

        if outcome.escalated && !outcome.grace_elapsed {
            debug!(script = %self.script_name, "Graceful termination not delivered, killed");
        } else if outcome.escalated {
            self.bus.publish(OutputEvent::system(
                &self.script_name,
                format!(
                    "Script did not exit within {} ms, forcing termination",
                    self.grace.as_millis()
                ),
            ));
        }

        if self.image_name_sweep {
            match self.platform.kill_by_image_name(&self.image_name).await {
                TerminationResult::Unsupported => {}
                TerminationResult::Success => self.bus.publish(OutputEvent::system(
                    &self.script_name,
                    format!("Force-stopped {}", self.image_name),
                )),
                TerminationResult::ProcessNotFound => {}
                other => {
                    warn!(image = %self.image_name, result = ?other, "Image-name sweep failed");
                    self.bus.publish(OutputEvent::system(
                        &self.script_name,
                        format!("Failed to force-stop {}: {other:?}", self.image_name),
                    ));
                }
            }
        }

        StopReport {
            escalated: outcome.escalated,
            status: outcome.status,
        }
    }

    async fn drain_readers(&mut self) {
        for mut reader in self.readers.drain(..) {
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut reader).await.is_err() {
                warn!(script = %self.script_name, "Output pipe still open after exit, detaching reader");
                reader.abort();
            }
        }
    }
}

/// Forward one output pipe line by line to the bus and the optional log file
pub(crate) fn spawn_reader<R>(
    pipe: R,
    script_name: String,
    stream: OutputStream,
    bus: EventBus,
    log: Option<Arc<ScriptLog>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = stdio::lines(pipe);
        while let Some(line) = lines.next().await {
            match line {
                Ok(line) => {
                    if let Some(log) = &log {
                        log.append(&line).await;
                    }
                    let event = match stream {
                        OutputStream::Stderr => OutputEvent::stderr(&script_name, line),
                        _ => OutputEvent::stdout(&script_name, line),
                    };
                    bus.publish(event);
                }
                Err(e) => {
                    warn!(script = %script_name, %stream, error = %e, "Failed to read script output");
                    break;
                }
            }
        }
    })
}
