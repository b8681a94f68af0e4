//! Session configuration.
//!
//! Every knob has a serde default so a config file only needs to name the
//! values it overrides; an empty TOML document is a valid config.

use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::error::Result;

pub const DEFAULT_MAX_ITERATIONS: i64 = 100;
pub const DEFAULT_NO_CHANGE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 120;
/// Output beyond this is truncated, oldest portion first.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 40 * 1024;
pub const DEFAULT_MAX_OUTPUT_LINES: usize = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Working directory bash sessions start in.
    pub work_dir: PathBuf,
    pub shell_path: PathBuf,
    /// Headless sessions have no user to approve iteration extensions.
    pub headless: bool,
    /// Gate runnable actions behind user approval.
    pub confirmation_mode: bool,
    pub max_iterations: i64,
    /// Amount the iteration ceiling grows by on an approved extension; also
    /// the default iteration budget handed to delegates.
    pub iteration_delta: i64,
    pub max_budget_per_task: Option<f64>,
    pub budget_delta: f64,
    pub no_change_timeout_secs: u64,
    pub default_timeout_secs: u64,
    pub max_output_bytes: usize,
    pub max_output_lines: usize,
    /// Root of the persisted session layout (`sessions/{sid}/...`).
    pub sessions_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("."),
            shell_path: PathBuf::from("/bin/bash"),
            headless: false,
            confirmation_mode: false,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            iteration_delta: DEFAULT_MAX_ITERATIONS,
            max_budget_per_task: None,
            budget_delta: 0.0,
            no_change_timeout_secs: DEFAULT_NO_CHANGE_TIMEOUT_SECS,
            default_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            max_output_lines: DEFAULT_MAX_OUTPUT_LINES,
            sessions_dir: PathBuf::from("sessions"),
        }
    }
}

impl Config {
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| crate::error::WindlassErr::Config(e.to_string()))
    }
}
