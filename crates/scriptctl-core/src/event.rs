use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::warn;

/// Source of an output event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
    /// Generated by the manager: failures, timeouts and exit reports
    System,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Stdout => f.write_str("stdout"),
            OutputStream::Stderr => f.write_str("stderr"),
            OutputStream::System => f.write_str("system"),
        }
    }
}

/// How an instance ended. Only carried by the terminal event of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitReport {
    /// Exit code, absent when the process was ended by a signal
    pub code: Option<i32>,
    /// Terminating signal on Unix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    /// The exit was caused by a stop request
    pub requested: bool,
}

impl ExitReport {
    pub fn describe(&self, script_name: &str) -> String {
        if self.requested {
            return match self.code {
                Some(code) => format!("Stopped script: {script_name} (exit code {code})"),
                None => format!("Stopped script: {script_name}"),
            };
        }
        match (self.code, self.signal) {
            (Some(code), _) => format!("Script exited with code {code}"),
            (None, Some(signal)) => format!("Script terminated by signal {signal}"),
            (None, None) => "Script exited".to_string(),
        }
    }
}

/// One line of output, or one manager notice, attributed to a script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputEvent {
    pub script_name: String,
    pub stream: OutputStream,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit: Option<ExitReport>,
}

impl OutputEvent {
    pub fn stdout(script_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(script_name, OutputStream::Stdout, message)
    }

    pub fn stderr(script_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(script_name, OutputStream::Stderr, message)
    }

    pub fn system(script_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(script_name, OutputStream::System, message)
    }

    pub fn exited(script_name: impl Into<String>, report: ExitReport) -> Self {
        let script_name = script_name.into();
        Self {
            message: report.describe(&script_name),
            script_name,
            stream: OutputStream::System,
            exit: Some(report),
        }
    }

    fn new(script_name: impl Into<String>, stream: OutputStream, message: impl Into<String>) -> Self {
        Self {
            script_name: script_name.into(),
            stream,
            message: message.into(),
            exit: None,
        }
    }

    /// True for the last event an instance produces
    pub fn is_terminal(&self) -> bool {
        self.exit.is_some()
    }
}

/// Fan-out point for output events.
///
/// Publishing never blocks and never fails: with no subscribers the event is
/// simply dropped, and late subscribers see nothing that happened before
/// they subscribed.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<OutputEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, event: OutputEvent) {
        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> OutputSubscription {
        OutputSubscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// A single observer's view of the event bus
pub struct OutputSubscription {
    receiver: broadcast::Receiver<OutputEvent>,
}

impl OutputSubscription {
    /// Next event, or `None` once the bus is gone.
    ///
    /// A subscriber that falls more than the configured capacity behind
    /// loses the oldest events; the gap is logged and reading resumes.
    pub async fn recv(&mut self) -> Option<OutputEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Output subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`recv`](Self::recv)
    pub fn try_recv(&mut self) -> Option<OutputEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Output subscriber lagged, events dropped");
                }
                Err(_) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = OutputEvent> + Send + Unpin {
        BroadcastStream::new(self.receiver).filter_map(|item| match item {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(error = %e, "Output subscriber lagged, events dropped");
                None
            }
        })
    }
}
