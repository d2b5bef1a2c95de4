use crate::cli::Commands;
use anyhow::Result;
use nsgate_core::ExitOutcome;

pub mod exec;
pub mod spawn;

/// Dispatch command to appropriate handler
pub fn dispatch(command: Commands) -> Result<ExitOutcome> {
    match command {
        Commands::Spawn {
            name,
            path,
            config,
            lxc_start,
        } => spawn::execute(&name, &path, &config, lxc_start),

        Commands::Nsexec { command } => exec::nsexec(&command),

        Commands::Usernsexec {
            newuidmap,
            newgidmap,
            ranges,
            command,
        } => exec::usernsexec(&ranges, &command, newuidmap, newgidmap),
    }
}
