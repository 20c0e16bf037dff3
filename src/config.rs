//! Configuration shapes recognized by the core.
//!
//! Loading a config file from a path supplied on the command line is the
//! out-of-scope config-file-loader's job; this module only defines the
//! shape the loader deserializes into and sane defaults so a caller can
//! start from [`Config::default`] and override only what it needs.

use std::time::Duration;

use serde::Deserialize;

fn default_port() -> u16 {
    49153
}

fn default_protocol() -> String {
    "http".to_string()
}

fn default_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_database_path() -> String {
    "./data".to_string()
}

fn default_buffer_size() -> u64 {
    1024 * 1024
}

fn default_task_count() -> u16 {
    10
}

fn default_tasks_waiting_second() -> u64 {
    5
}

/// Server network configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub protocol: String,
    /// Peer-probe and client-call deadline, e.g. `"1s"`, `"500ms"`.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { port: default_port(), protocol: default_protocol(), timeout: default_timeout() }
    }
}

/// Persistent-store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_database_path() }
    }
}

/// Log level recognized by the ambient logger (§2.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Info,
    Error,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
}

/// Volume permission bits (§3 Data Model).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumePerm {
    Read,
    Write,
}

/// One `volumes[]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct VolumeConfig {
    pub name: String,
    pub os_path: String,
    pub perm: Vec<VolumePerm>,
}

/// Top-level configuration recognized by the core.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub buffer_size: u64,
    pub max_available_tasks: u16,
    pub tasks_waiting_second: u64,
    pub log: LogConfig,
    pub volumes: Vec<VolumeConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            buffer_size: default_buffer_size(),
            max_available_tasks: default_task_count(),
            tasks_waiting_second: default_tasks_waiting_second(),
            log: LogConfig::default(),
            volumes: Vec::new(),
        }
    }
}

impl Config {
    /// Parses a TOML document into a [`Config`], falling back to defaults
    /// for any field the document omits.
    pub fn from_str(data: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(data)
    }
}
