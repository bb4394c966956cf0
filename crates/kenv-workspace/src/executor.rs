//! Workspace executor: drives the infrastructure tool inside per-environment
//! workspace directories.
//!
//! Each `apply`/`destroy` initializes the workspace from the module source,
//! writes the variables file, then runs the tool with auto-approve. An
//! existing workspace picks up the module's current files before init, so a
//! module change reaches environments on their next apply. Every
//! failure comes back as `Error::Execution` with the tool's stderr. Nothing
//! here retries.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, instrument};

use kenv_common::Error;

use crate::handle::{HandleRegistry, WorkspaceHandle};
use crate::runner::{CommandRunner, CommandSpec};

/// Variables handed to a module, written as a JSON vars file
pub type Variables = BTreeMap<String, Value>;

/// Flattened `output -json` result: output name to value
pub type Outputs = BTreeMap<String, Value>;

/// File name of the variables file inside each workspace
pub const VARS_FILE: &str = "terraform.tfvars.json";

/// The tool's provider and module cache inside a workspace
const TOOL_DATA_DIR: &str = ".terraform";

/// Where the tool lives and where workspaces go
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// Tool binary (a Terraform-compatible CLI)
    pub binary: String,
    /// Directory holding one subdirectory per module
    pub module_root: PathBuf,
    /// Directory holding one subdirectory per environment
    pub state_root: PathBuf,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            binary: "terraform".to_string(),
            module_root: PathBuf::from("/opt/kenv/modules"),
            state_root: PathBuf::from("/var/lib/kenv/workspaces"),
        }
    }
}

/// Runs apply/destroy/output against isolated workspaces
pub struct WorkspaceExecutor {
    config: ExecutorConfig,
    runner: Arc<dyn CommandRunner>,
    registry: HandleRegistry,
}

impl WorkspaceExecutor {
    /// Create an executor using `runner` for every subprocess
    pub fn new(config: ExecutorConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            runner,
            registry: HandleRegistry::new(),
        }
    }

    /// The executor's configuration
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Handle for `env_id`: the registered one if any, else the derived one.
    ///
    /// Derivation is deterministic, so after a restart an environment
    /// resolves to the workspace that holds its state.
    pub fn handle_for(&self, env_id: &str, module: &str) -> Result<WorkspaceHandle, Error> {
        match self.registry.get(env_id) {
            Some(handle) if handle.module() == module => Ok(handle),
            _ => WorkspaceHandle::derive(&self.config.state_root, env_id, module),
        }
    }

    /// Registered handle for `env_id`, if an apply has run in this process
    pub fn lookup(&self, env_id: &str) -> Option<WorkspaceHandle> {
        self.registry.get(env_id)
    }

    /// Initialize and apply `module` for `env_id`, returning its handle
    #[instrument(skip(self, variables), fields(env_id = %env_id, module = %module))]
    pub async fn apply(
        &self,
        env_id: &str,
        module: &str,
        variables: &Variables,
    ) -> Result<WorkspaceHandle, Error> {
        let handle = self.handle_for(env_id, module)?;
        self.prepare(&handle, variables).await?;
        self.registry.register(handle.clone());

        self.tool(
            &handle,
            "terraform apply",
            &["apply", "-no-color", "-input=false", "-auto-approve"],
        )
        .await?;

        info!(workspace = %handle, "apply completed");
        Ok(handle)
    }

    /// Initialize and destroy everything `handle` manages
    #[instrument(skip(self, variables), fields(workspace = %handle, module = %module))]
    pub async fn destroy(
        &self,
        module: &str,
        variables: &Variables,
        handle: &WorkspaceHandle,
    ) -> Result<(), Error> {
        if handle.module() != module {
            return Err(Error::validation_for(
                handle.env_id(),
                format!(
                    "workspace {} runs module {}, not {}",
                    handle,
                    handle.module(),
                    module
                ),
            ));
        }

        self.prepare(handle, variables).await?;
        self.tool(
            handle,
            "terraform destroy",
            &["destroy", "-no-color", "-input=false", "-auto-approve"],
        )
        .await?;

        self.registry.remove(handle.env_id());
        info!("destroy completed");
        Ok(())
    }

    /// Read the outputs of the last apply in `handle`.
    ///
    /// The tool reports `{name: {value, type, sensitive}}`; this returns
    /// `{name: value}`.
    pub async fn outputs(&self, handle: &WorkspaceHandle) -> Result<Outputs, Error> {
        let spec = CommandSpec {
            program: self.config.binary.clone(),
            args: vec!["output".into(), "-no-color".into(), "-json".into()],
            current_dir: handle.dir().to_path_buf(),
            description: "terraform output".to_string(),
        };
        let output = self.runner.run(&spec).await?;
        flatten_outputs(&output.stdout)
    }

    /// Create the directory, init it from the module source, write vars
    async fn prepare(&self, handle: &WorkspaceHandle, variables: &Variables) -> Result<(), Error> {
        let module_path = self.config.module_root.join(handle.module());
        tokio::fs::create_dir_all(handle.dir()).await.map_err(|e| {
            Error::execution(
                "prepare workspace",
                format!("failed to create {}: {}", handle.dir().display(), e),
            )
        })?;

        // First init copies the module in. Later ones sync the module's current
        // files over the workspace and refresh providers in place.
        if has_configuration(handle.dir()).await? {
            let synced = sync_module(&module_path, handle.dir()).await?;
            debug!(files = synced, "module configuration synced");
            self.tool(handle, "terraform init", &["init", "-no-color", "-input=false"])
                .await?;
        } else {
            let from_module = format!("-from-module={}", module_path.display());
            self.tool(
                handle,
                "terraform init",
                &["init", "-no-color", "-input=false", &from_module],
            )
            .await?;
        }

        write_vars_file(handle.dir(), variables).await
    }

    async fn tool(
        &self,
        handle: &WorkspaceHandle,
        description: &str,
        args: &[&str],
    ) -> Result<(), Error> {
        let mut args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        if matches!(args.first().map(String::as_str), Some("apply" | "destroy")) {
            args.push(format!("-var-file={VARS_FILE}"));
        }
        let spec = CommandSpec {
            program: self.config.binary.clone(),
            args,
            current_dir: handle.dir().to_path_buf(),
            description: description.to_string(),
        };
        self.runner.run(&spec).await.map(|_| ())
    }
}

fn prepare_error(action: &str, path: &Path, e: std::io::Error) -> Error {
    Error::execution(
        "prepare workspace",
        format!("failed to {} {}: {}", action, path.display(), e),
    )
}

/// Module configuration, as opposed to state, lock or vars files
fn is_configuration(name: &str) -> bool {
    name.ends_with(".tf") || (name.ends_with(".tf.json") && name != VARS_FILE)
}

/// Configuration file names directly inside `dir`, and its subdirectories
async fn scan_dir(dir: &Path) -> Result<(BTreeSet<OsString>, Vec<OsString>), Error> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| prepare_error("read", dir, e))?;
    let mut files = BTreeSet::new();
    let mut dirs = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| prepare_error("read", dir, e))?
    {
        let name = entry.file_name();
        let file_type = entry
            .file_type()
            .await
            .map_err(|e| prepare_error("inspect", &entry.path(), e))?;
        if file_type.is_dir() {
            if name != TOOL_DATA_DIR {
                dirs.push(name);
            }
        } else if is_configuration(&name.to_string_lossy()) {
            files.insert(name);
        }
    }
    Ok((files, dirs))
}

/// True once the workspace holds module configuration
async fn has_configuration(dir: &Path) -> Result<bool, Error> {
    Ok(!scan_dir(dir).await?.0.is_empty())
}

/// Copy the module's configuration files over the workspace's, recursing
/// into nested module directories, and delete configuration files the module
/// no longer has. State, the vars file and the tool's data directory are
/// left alone. Returns the number of files copied.
async fn sync_module(module: &Path, workspace: &Path) -> Result<usize, Error> {
    let mut pending = vec![PathBuf::new()];
    let mut copied = 0;

    while let Some(rel) = pending.pop() {
        let source = module.join(&rel);
        let target = workspace.join(&rel);
        let (files, dirs) = scan_dir(&source).await?;

        tokio::fs::create_dir_all(&target)
            .await
            .map_err(|e| prepare_error("create", &target, e))?;
        for name in &files {
            let to = target.join(name);
            tokio::fs::copy(source.join(name), &to)
                .await
                .map_err(|e| prepare_error("copy module file to", &to, e))?;
            copied += 1;
        }

        let (existing, _) = scan_dir(&target).await?;
        for stale in existing.difference(&files) {
            let path = target.join(stale);
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| prepare_error("remove", &path, e))?;
        }

        pending.extend(dirs.into_iter().map(|d| rel.join(d)));
    }
    Ok(copied)
}

async fn write_vars_file(dir: &Path, variables: &Variables) -> Result<(), Error> {
    let body = serde_json::to_vec_pretty(variables)?;
    let path = dir.join(VARS_FILE);
    tokio::fs::write(&path, body).await.map_err(|e| {
        Error::execution(
            "write variables",
            format!("failed to write {}: {}", path.display(), e),
        )
    })
}

fn flatten_outputs(stdout: &str) -> Result<Outputs, Error> {
    let raw: BTreeMap<String, Value> = serde_json::from_str(stdout.trim()).map_err(|e| {
        Error::serialization_for_kind("terraform output", format!("invalid output JSON: {}", e))
    })?;
    Ok(raw
        .into_iter()
        .map(|(name, entry)| {
            let value = match entry {
                Value::Object(mut fields) => fields.remove("value").unwrap_or(Value::Null),
                other => other,
            };
            (name, value)
        })
        .collect())
}
