//! Namespace entry for isolated command execution
//!
//! This crate clones a child into new namespaces and runs a command there:
//! - Mount namespace - private mount tree
//! - PID namespace - fresh `/proc`, with a small init as PID 1 so the command stays killable
//! - User namespace - UID/GID maps written by `newuidmap`/`newgidmap` before exec
//!
//! The parent and child synchronize over a [`sync`] channel so the command never runs
//! before its ID maps are in place.

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

pub mod child;
pub mod config;
pub mod executor;
pub mod idmap;
mod init;
pub mod sync;

pub use config::{CommandSpec, IdMapping, IsolationMode, NamespaceRequest};
pub use executor::{ChildHandle, NamespaceExecutor};
pub use idmap::{IdMapper, ShadowIdMapper};
