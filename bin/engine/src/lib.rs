//! chainweave engine.
//!
//! This crate wires the workflow engine to its configuration, its Postgres
//! stores and the model provider, and runs workflows from the command line.

pub mod app;
pub mod config;
pub mod db;
pub mod error;
