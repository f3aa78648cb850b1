use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

use crate::config::ManagerConfig;
use crate::error::ScriptError;

/// A runnable file found in the scripts directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptDescriptor {
    /// File name, unique within one directory snapshot
    pub name: String,
    /// Absolute path of the file
    pub path: PathBuf,
}

/// Enumerate the scripts directory without recursing.
///
/// A missing or unreadable directory is the "not yet populated" state and
/// yields an empty list.
pub fn list_scripts(config: &ManagerConfig) -> Vec<ScriptDescriptor> {
    let dir = &config.scripts_dir;
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(dir = %dir.display(), "Scripts directory not found");
            return Vec::new();
        }
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Scripts directory unavailable");
            return Vec::new();
        }
    };

    // Read succeeded, so this only fails on a race with removal
    let Ok(canonical_dir) = dir.canonicalize() else {
        return Vec::new();
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_file())
        .filter(|entry| stays_inside(entry, &canonical_dir))
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            config.is_allowed(&name).then(|| ScriptDescriptor {
                path: dir.join(&name),
                name,
            })
        })
        .collect()
}

/// Resolve a script name to a file inside the scripts directory.
///
/// The name must be a single plain path component. Names with separators,
/// traversal segments, drive prefixes or a root are rejected before the
/// filesystem is touched, and a symlink leading out of the directory is
/// rejected after canonicalization.
pub fn resolve_script(config: &ManagerConfig, name: &str) -> Result<ScriptDescriptor, ScriptError> {
    if !is_plain_file_name(name) {
        debug!(name, "Rejected script name failing containment");
        return Err(ScriptError::NotFound(name.to_string()));
    }
    if !config.is_allowed(name) {
        return Err(ScriptError::NotFound(name.to_string()));
    }

    let path = config.scripts_dir.join(name);
    let canonical_dir = config
        .scripts_dir
        .canonicalize()
        .map_err(|_| ScriptError::NotFound(name.to_string()))?;
    let canonical = path
        .canonicalize()
        .map_err(|_| ScriptError::NotFound(name.to_string()))?;

    if !canonical.starts_with(&canonical_dir) || !canonical.is_file() {
        return Err(ScriptError::NotFound(name.to_string()));
    }

    Ok(ScriptDescriptor {
        name: name.to_string(),
        path,
    })
}

/// Symlinks are only listed when their target is inside the directory,
/// matching what [`resolve_script`] will accept
fn stays_inside(entry: &std::fs::DirEntry, canonical_dir: &Path) -> bool {
    let is_symlink = entry.file_type().is_ok_and(|kind| kind.is_symlink());
    if !is_symlink {
        return true;
    }
    match entry.path().canonicalize() {
        Ok(target) => target.starts_with(canonical_dir),
        Err(_) => false,
    }
}

fn is_plain_file_name(name: &str) -> bool {
    if name.is_empty() || name.contains(['/', '\\', '\0']) {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(part)), None) if part == name
    )
}
