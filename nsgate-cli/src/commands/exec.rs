use anyhow::{Context, Result};
use nsgate_core::ExitOutcome;
use nsgate_namespace::{CommandSpec, IdMapping, IsolationMode, NamespaceExecutor, ShadowIdMapper};
use std::ffi::OsString;
use std::path::PathBuf;
use tracing::debug;

/// Run a command in new mount and PID namespaces
pub fn nsexec(command: &[OsString]) -> Result<ExitOutcome> {
    let command = CommandSpec::new(command).context("Invalid command")?;

    NamespaceExecutor::new(IsolationMode::Namespaces)
        .run(&command)
        .with_context(|| format!("Failed to run {}", command.display()))
}

/// Run a command in new mount, PID and user namespaces after mapping `ranges`
pub fn usernsexec(
    ranges: &[String],
    command: &[OsString],
    newuidmap: PathBuf,
    newgidmap: PathBuf,
) -> Result<ExitOutcome> {
    let mapping = IdMapping::parse_args(ranges).context("Invalid id ranges")?;
    let command = CommandSpec::new(command).context("Invalid command")?;

    debug!(
        uid_ranges = mapping.uids().len(),
        gid_ranges = mapping.gids().len(),
        "Parsed id mapping"
    );

    let mapper = ShadowIdMapper::new()
        .with_newuidmap(newuidmap)
        .with_newgidmap(newgidmap);

    NamespaceExecutor::new(IsolationMode::UserNamespace(mapping))
        .with_mapper(mapper)
        .run(&command)
        .with_context(|| format!("Failed to run {}", command.display()))
}
