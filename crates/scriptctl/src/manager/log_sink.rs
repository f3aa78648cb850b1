use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

/// Append-only `<logs_dir>/<script>.log` shared by one run's stdout and
/// stderr readers. Nothing touches the filesystem until the first line.
pub(crate) struct ScriptLog {
    dir: PathBuf,
    path: PathBuf,
    file: Mutex<Option<File>>,
    failed: AtomicBool,
}

impl ScriptLog {
    pub fn new(logs_dir: &Path, script_name: &str) -> Self {
        Self {
            dir: logs_dir.to_path_buf(),
            path: logs_dir.join(format!("{script_name}.log")),
            file: Mutex::new(None),
            failed: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one line. Failures are logged once and otherwise ignored so a
    /// full disk never interrupts output forwarding.
    pub async fn append(&self, line: &str) {
        if let Err(e) = self.try_append(line).await {
            if !self.failed.swap(true, Ordering::Relaxed) {
                warn!(path = %self.path.display(), error = %e, "Failed to write script log");
            }
        }
    }

    async fn try_append(&self, line: &str) -> std::io::Result<()> {
        let mut guard = self.file.lock().await;
        if guard.is_none() {
            tokio::fs::create_dir_all(&self.dir).await?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            *guard = Some(file);
        }
        if let Some(file) = guard.as_mut() {
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
            file.flush().await?;
        }
        Ok(())
    }
}
