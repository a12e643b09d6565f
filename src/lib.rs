#![forbid(unsafe_code)]

//! Process-backed session runner driving an AI coding agent CLI from Slack.

pub mod config;
pub mod errors;
pub mod models;
pub mod persistence;
pub mod runner;
pub mod slack;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
