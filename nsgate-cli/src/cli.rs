//! CLI argument definitions

use clap::{Parser, Subcommand};
use std::ffi::OsString;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "nsgate")]
#[command(about = "Run commands in fresh mount, PID and user namespaces", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a container in the foreground and exit with its status
    Spawn {
        /// Container name
        name: String,

        /// Directory holding the container (lxcpath)
        path: PathBuf,

        /// Container configuration file
        config: PathBuf,

        /// lxc-start binary used to start the container
        #[arg(long, env = "NSGATE_LXC_START", default_value = "lxc-start")]
        lxc_start: PathBuf,
    },

    /// Run a command in new mount and PID namespaces
    Nsexec {
        /// Command to run
        #[arg(last = true, required = true)]
        command: Vec<OsString>,
    },

    /// Run a command in new mount, PID and user namespaces with mapped ids
    Usernsexec {
        /// UID mapping tool
        #[arg(long, env = "NSGATE_NEWUIDMAP", default_value = "newuidmap")]
        newuidmap: PathBuf,

        /// GID mapping tool
        #[arg(long, env = "NSGATE_NEWGIDMAP", default_value = "newgidmap")]
        newgidmap: PathBuf,

        /// ID ranges: u <ns> <host> <count>... [g <ns> <host> <count>...]
        #[arg(required = true, value_name = "RANGES")]
        ranges: Vec<String>,

        /// Command to run
        #[arg(last = true, required = true)]
        command: Vec<OsString>,
    },
}
