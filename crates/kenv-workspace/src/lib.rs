//! Per-environment workspaces for a Terraform-compatible tool
//!
//! - [`handle`] - workspace handles derived from environment ids, and their registry
//! - [`runner`] - the subprocess boundary
//! - [`executor`] - apply/destroy/output against one workspace
//! - [`orchestrator`] - provisioning sequences with validated outputs

#![deny(missing_docs)]

pub mod executor;
pub mod handle;
pub mod orchestrator;
pub mod runner;

pub use executor::{ExecutorConfig, Outputs, Variables, WorkspaceExecutor, VARS_FILE};
pub use handle::{HandleRegistry, WorkspaceHandle};
pub use orchestrator::{ProvisionOutputs, ProvisioningOrchestrator, TerraformOrchestrator};
pub use runner::{CommandOutput, CommandRunner, CommandSpec, TokioCommandRunner};

pub use kenv_common::{Error, Result};
