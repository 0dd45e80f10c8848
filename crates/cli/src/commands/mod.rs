//! CLI commands for the paired quoting engine.

pub mod check_config;
pub mod replay;

pub use check_config::{run_check_config, CheckConfigArgs};
pub use replay::{run_replay, ReplayArgs};
