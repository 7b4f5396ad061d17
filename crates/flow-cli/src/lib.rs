//! # flow-cli
//!
//! Command-line interface for the kodus-flow runtime.
//!
//! ## Commands
//!
//! - `kflow run`: Register an agent and call it once
//! - `kflow call-tool`: Call a built-in tool directly
//! - `kflow status`: Show service health and orchestrator stats
//! - `kflow config`: Show the resolved configuration and its warnings
//! - `kflow transitions`: Print the status transition table

pub mod commands;

pub use commands::Cli;
