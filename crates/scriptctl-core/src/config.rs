use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ScriptError;

/// Configuration of the script manager
///
/// Every field except `scripts_dir` has a default, so a config file only
/// needs to name the directory:
///
/// ```json
/// { "scriptsDir": "/opt/scripts", "allowedExtensions": ["exe", "ahk"] }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Builder)]
#[serde(rename_all = "camelCase")]
#[builder(setter(into, strip_option), build_fn(validate = "Self::validate_builder"))]
pub struct ManagerConfig {
    /// Absolute path of the directory scripts are discovered in
    pub scripts_dir: PathBuf,

    /// Permitted file suffixes. Empty means every regular file is listed.
    #[serde(default)]
    #[builder(default)]
    #[builder(setter(custom))]
    pub allowed_extensions: BTreeSet<String>,

    /// Time between the graceful termination signal and the forced kill
    #[serde(default = "default_termination_grace_ms")]
    #[builder(default = "default_termination_grace_ms()")]
    pub termination_grace_ms: u64,

    /// Directory receiving one append-only `<name>.log` per script
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[builder(default)]
    pub logs_dir: Option<PathBuf>,

    /// Upper bound on process creation latency
    #[serde(default = "default_spawn_timeout_ms")]
    #[builder(default = "default_spawn_timeout_ms()")]
    pub spawn_timeout_ms: u64,

    /// Extension to interpreter program, e.g. `"ahk" -> "AutoHotkey.exe"`
    #[serde(default)]
    #[builder(default)]
    #[builder(setter(custom))]
    pub interpreters: HashMap<String, String>,

    /// Force-kill every process sharing the script's image name after a stop.
    /// Windows only; it also hits processes this manager did not launch.
    #[serde(default)]
    #[builder(default)]
    pub image_name_sweep: bool,

    /// Number of events buffered per subscriber before it starts lagging
    #[serde(default = "default_event_capacity")]
    #[builder(default = "default_event_capacity()")]
    pub event_capacity: usize,
}

impl ManagerConfig {
    pub fn builder() -> ManagerConfigBuilder {
        ManagerConfigBuilder::default()
    }

    /// Load a JSON configuration file and validate it
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ScriptError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ScriptError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut config: ManagerConfig = serde_json::from_str(&raw).map_err(|e| {
            ScriptError::Configuration(format!("invalid config {}: {e}", path.display()))
        })?;
        config.allowed_extensions = config
            .allowed_extensions
            .iter()
            .map(|ext| normalize_extension(ext))
            .collect();
        config.interpreters = config
            .interpreters
            .into_iter()
            .map(|(ext, program)| (normalize_extension(&ext), program))
            .collect();
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), ScriptError> {
        if !self.scripts_dir.is_absolute() {
            return Err(ScriptError::Configuration(format!(
                "scriptsDir must be an absolute path, got {}",
                self.scripts_dir.display()
            )));
        }

        if self.allowed_extensions.iter().any(|ext| ext.is_empty()) {
            return Err(ScriptError::Configuration(
                "allowedExtensions must not contain empty suffixes".to_string(),
            ));
        }

        if self.spawn_timeout_ms == 0 {
            return Err(ScriptError::Configuration(
                "spawnTimeoutMs must be greater than zero".to_string(),
            ));
        }

        if self.event_capacity == 0 {
            return Err(ScriptError::Configuration(
                "eventCapacity must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Check a file name against the allowed extension set
    pub fn is_allowed(&self, file_name: &str) -> bool {
        if self.allowed_extensions.is_empty() {
            return true;
        }
        extension_of(file_name)
            .map(|ext| self.allowed_extensions.contains(&ext))
            .unwrap_or(false)
    }

    /// Interpreter configured for a script file, if any
    pub fn interpreter_for(&self, file_name: &str) -> Option<&str> {
        extension_of(file_name)
            .and_then(|ext| self.interpreters.get(&ext))
            .map(String::as_str)
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }

    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_millis(self.spawn_timeout_ms)
    }
}

impl ManagerConfigBuilder {
    pub fn allowed_extensions<S: AsRef<str>, I: IntoIterator<Item = S>>(
        &mut self,
        iter: I,
    ) -> &mut Self {
        let set = self.allowed_extensions.get_or_insert_with(BTreeSet::new);
        set.extend(iter.into_iter().map(|ext| normalize_extension(ext.as_ref())));
        self
    }

    pub fn interpreter<E: AsRef<str>, P: ToString>(&mut self, extension: E, program: P) -> &mut Self {
        let map = self.interpreters.get_or_insert_with(HashMap::new);
        map.insert(normalize_extension(extension.as_ref()), program.to_string());
        self
    }

    fn validate_builder(&self) -> Result<(), String> {
        if let Some(dir) = &self.scripts_dir {
            if !dir.is_absolute() {
                return Err(format!(
                    "scriptsDir must be an absolute path, got {}",
                    dir.display()
                ));
            }
        }
        if self.event_capacity == Some(0) {
            return Err("eventCapacity must be greater than zero".to_string());
        }
        if self.spawn_timeout_ms == Some(0) {
            return Err("spawnTimeoutMs must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Lowercase and strip a leading dot: `".EXE"` becomes `"exe"`
pub fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_ascii_lowercase()
}

fn extension_of(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(normalize_extension)
}

// Default value functions for serde
fn default_termination_grace_ms() -> u64 {
    2_000
}
fn default_spawn_timeout_ms() -> u64 {
    10_000
}
fn default_event_capacity() -> usize {
    1024
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_dir() -> PathBuf {
        std::env::temp_dir().join("scripts")
    }

    #[test]
    fn test_builder_defaults() {
        let config = ManagerConfig::builder()
            .scripts_dir(base_dir())
            .build()
            .unwrap();
        assert_eq!(config.termination_grace_ms, 2_000);
        assert_eq!(config.spawn_timeout_ms, 10_000);
        assert_eq!(config.event_capacity, 1024);
        assert!(config.allowed_extensions.is_empty());
        assert!(config.logs_dir.is_none());
        assert!(!config.image_name_sweep);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_extensions_are_normalized() {
        let config = ManagerConfig::builder()
            .scripts_dir(base_dir())
            .allowed_extensions([".EXE", "ahk"])
            .build()
            .unwrap();
        assert!(config.allowed_extensions.contains("exe"));
        assert!(config.allowed_extensions.contains("ahk"));
        assert!(config.is_allowed("tool.exe"));
        assert!(config.is_allowed("Macro.AHK"));
        assert!(!config.is_allowed("notes.txt"));
        assert!(!config.is_allowed("README"));
    }

    #[test]
    fn test_empty_extension_set_allows_everything() {
        let config = ManagerConfig::builder()
            .scripts_dir(base_dir())
            .build()
            .unwrap();
        assert!(config.is_allowed("anything.bin"));
        assert!(config.is_allowed("no_extension"));
    }

    #[test]
    fn test_interpreter_lookup() {
        let config = ManagerConfig::builder()
            .scripts_dir(base_dir())
            .interpreter(".sh", "/bin/sh")
            .build()
            .unwrap();
        assert_eq!(config.interpreter_for("run.sh"), Some("/bin/sh"));
        assert_eq!(config.interpreter_for("run.SH"), Some("/bin/sh"));
        assert_eq!(config.interpreter_for("run.exe"), None);
    }

    #[test]
    fn test_relative_scripts_dir_rejected() {
        let result = ManagerConfig::builder().scripts_dir("scripts").build();
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_config() {
        let mut config = ManagerConfig::builder()
            .scripts_dir(base_dir())
            .build()
            .unwrap();
        config.event_capacity = 0;
        assert!(config.validate().is_err());

        config.event_capacity = 8;
        config.allowed_extensions.insert(String::new());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let scripts = dir.path().join("scripts");
        let json = serde_json::json!({
            "scriptsDir": scripts,
            "allowedExtensions": [".PS1", "exe"],
            "terminationGraceMs": 250,
            "interpreters": { ".ps1": "pwsh" }
        });
        let path = dir.path().join("config.json");
        std::fs::write(&path, json.to_string()).unwrap();

        let config = ManagerConfig::from_json_file(&path).unwrap();
        assert_eq!(config.scripts_dir, scripts);
        assert_eq!(config.termination_grace(), Duration::from_millis(250));
        assert!(config.is_allowed("setup.ps1"));
        assert_eq!(config.interpreter_for("setup.ps1"), Some("pwsh"));
        assert_eq!(config.event_capacity, 1024);
    }

    #[test]
    fn test_from_json_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = ManagerConfig::from_json_file(dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, ScriptError::Configuration(_)));
    }
}
