use std::time::Duration;
use thiserror::Error;

/// Caller-visible failures of manager operations
///
/// Anything that happens after a process is already running (crashes,
/// unexpected exits, termination timeouts) is reported on the output event
/// channel instead.
#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("Script not found: {0}")]
    NotFound(String),

    #[error("Failed to spawn script {name}: {source}")]
    SpawnFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Spawning script {name} did not complete within {timeout:?}")]
    SpawnTimeout { name: String, timeout: Duration },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl ScriptError {
    /// Structural errors are failures of the originating call itself
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            ScriptError::NotFound(_)
                | ScriptError::SpawnFailed { .. }
                | ScriptError::SpawnTimeout { .. }
        )
    }

    /// True for both flavours of process creation failure
    pub fn is_spawn_failure(&self) -> bool {
        matches!(
            self,
            ScriptError::SpawnFailed { .. } | ScriptError::SpawnTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ScriptError::NotFound("../evil".to_string());
        assert_eq!(format!("{error}"), "Script not found: ../evil");

        let error = ScriptError::SpawnFailed {
            name: "tool.exe".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        let display = format!("{error}");
        assert!(display.contains("Failed to spawn script tool.exe"));
    }

    #[test]
    fn test_error_categorization() {
        assert!(ScriptError::NotFound("a".to_string()).is_structural());
        assert!(
            ScriptError::SpawnTimeout {
                name: "a".to_string(),
                timeout: Duration::from_secs(1),
            }
            .is_spawn_failure()
        );
        assert!(!ScriptError::Configuration("bad".to_string()).is_structural());
        assert!(!ScriptError::NotFound("a".to_string()).is_spawn_failure());
    }

    #[test]
    fn test_error_source_is_kept() {
        use std::error::Error as _;
        let error = ScriptError::SpawnFailed {
            name: "a".to_string(),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };
        assert!(error.source().is_some());
    }
}
