//! Shared command plumbing: compose loading and the per-invocation
//! context value threaded into every component.

use std::path::Path;

use anyhow::Result;

use crate::config::{self, ComposeConfig};
use crate::project::Project;

pub struct CommandContext {
    pub project: Project,
    pub config: ComposeConfig,
}

/// Resolve the compose file and parse it. Every compose-backed command
/// starts here.
pub fn load_context(file_flag: Option<&Path>) -> Result<CommandContext> {
    let project = Project::locate(file_flag)?;
    let config = config::load_compose_file(&project.compose_path)?;
    Ok(CommandContext { project, config })
}

/// The header every multi-VM command prints.
pub fn print_header(ctx: &CommandContext) {
    println!("Using compose file: {}", ctx.project.compose_path.display());
    println!("Project: {}", ctx.project.name);
}
