//! devlaunch: supervises local development servers.
//!
//! Inputs pass through the guards (`path_guard`, `command_guard`) before the
//! `supervisor` spawns anything. Missing dependencies are installed with the
//! project's package manager first.

pub mod command_guard;
pub mod config;
pub mod events;
pub mod history;
pub mod installer;
pub mod launch;
pub mod output;
pub mod package_manager;
pub mod path_guard;
pub mod process;
pub mod supervisor;
pub mod validation;
