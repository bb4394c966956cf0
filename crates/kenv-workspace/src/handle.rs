//! Workspace handles and the registry that maps environments to them
//!
//! A handle is derived from the environment id and module name only, so the
//! same environment always lands in the same directory and two environments
//! never share one, however the runs interleave.

use std::path::{Path, PathBuf};

use dashmap::DashMap;

use kenv_common::Error;

/// Isolated working directory for one environment and one module
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WorkspaceHandle {
    env_id: String,
    module: String,
    dir: PathBuf,
}

impl WorkspaceHandle {
    /// Derive the handle for `env_id` running `module` under `state_root`.
    ///
    /// Both parts become path components, so both must be path-safe.
    pub fn derive(state_root: &Path, env_id: &str, module: &str) -> Result<Self, Error> {
        validate_component("environment id", env_id)?;
        validate_component("module", module)?;
        Ok(Self {
            env_id: env_id.to_string(),
            module: module.to_string(),
            dir: state_root.join(env_id).join(module),
        })
    }

    /// Environment this workspace belongs to
    pub fn env_id(&self) -> &str {
        &self.env_id
    }

    /// Module this workspace runs
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Working directory for every command against this handle
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl std::fmt::Display for WorkspaceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.env_id, self.module)
    }
}

/// Reject anything that could escape the state root or collide after joining
fn validate_component(what: &str, value: &str) -> Result<(), Error> {
    let ok = !value.is_empty()
        && value.len() <= 128
        && value != "."
        && value != ".."
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if ok {
        Ok(())
    } else {
        Err(Error::validation_for(
            value,
            format!("{what} must be a non-empty path-safe name"),
        ))
    }
}

/// Environment id to live workspace handle.
///
/// Lookups go through this map; the filesystem is never listed to find a
/// workspace.
#[derive(Debug, Default)]
pub struct HandleRegistry {
    handles: DashMap<String, WorkspaceHandle>,
}

impl HandleRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the handle for its environment, replacing any earlier one
    pub fn register(&self, handle: WorkspaceHandle) {
        self.handles.insert(handle.env_id.clone(), handle);
    }

    /// Handle last registered for `env_id`
    pub fn get(&self, env_id: &str) -> Option<WorkspaceHandle> {
        self.handles.get(env_id).map(|h| h.value().clone())
    }

    /// Forget the handle for `env_id`
    pub fn remove(&self, env_id: &str) -> Option<WorkspaceHandle> {
        self.handles.remove(env_id).map(|(_, h)| h)
    }

    /// Number of registered handles
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
