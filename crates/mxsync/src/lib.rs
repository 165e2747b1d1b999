//! Model explorer glue and the `mxsync` command line tool

pub mod cli;
pub mod explorer;

pub use explorer::{ExplorerError, ModelExplorer, SNAPSHOT_KIND};
