//! Operator configuration (spec §6, §1 ambient stack): every knob the
//! dispatcher, executor, and reload supervisor read at startup.
//!
//! Grounded on the teacher's `from_file`/`ConfigError` (`config.rs`) — a
//! `toml::from_str` load with a hand-rolled error enum — generalized from the
//! teacher's two hook-routing tables to the full set of operational knobs,
//! with `thiserror` replacing the hand-rolled `Display` impl.

use serde::Deserialize;
use std::fs;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_addr: IpAddr,
    pub bind_port: u16,
    pub hooks_paths: Vec<PathBuf>,
    pub hooks_prefix: String,

    pub max_concurrent_hooks: usize,
    pub hook_timeout_seconds: u64,
    pub slot_acquisition_timeout_seconds: u64,
    pub allowed_command_paths: Vec<PathBuf>,
    pub allow_auto_chmod: bool,

    pub strict_mode: bool,
    pub max_arg_length: usize,
    pub max_total_args_length: usize,
    pub max_args_count: usize,

    pub max_multipart_memory: usize,
    pub max_request_body_size: usize,

    pub use_x_request_id: bool,
    pub x_request_id_limit: usize,

    pub hot_reload: bool,
    pub template_mode: bool,

    pub verbose: bool,
    pub no_panic: bool,
    pub shutdown_grace_seconds: u64,

    pub global_http_methods: Vec<String>,
    pub global_response_headers: Vec<crate::hook::ResponseHeader>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind_addr: IpAddr::from([0, 0, 0, 0]),
            bind_port: 9000,
            hooks_paths: Vec::new(),
            hooks_prefix: "hooks".to_string(),

            max_concurrent_hooks: 10,
            hook_timeout_seconds: 30,
            slot_acquisition_timeout_seconds: 5,
            allowed_command_paths: Vec::new(),
            allow_auto_chmod: false,

            strict_mode: false,
            max_arg_length: 8192,
            max_total_args_length: 65536,
            max_args_count: 256,

            max_multipart_memory: 10 << 20,
            max_request_body_size: 10 << 20,

            use_x_request_id: false,
            x_request_id_limit: 64,

            hot_reload: true,
            template_mode: false,

            verbose: false,
            no_panic: false,
            shutdown_grace_seconds: 15,

            global_http_methods: Vec::new(),
            global_response_headers: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Config, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: Config = toml::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_hooks == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_hooks must be > 0".to_string(),
            ));
        }
        if self.hook_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "hook_timeout_seconds must be > 0".to_string(),
            ));
        }
        if self.slot_acquisition_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "slot_acquisition_timeout_seconds must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.hook_timeout_seconds)
    }

    pub fn slot_acquisition_timeout(&self) -> Duration {
        Duration::from_secs(self.slot_acquisition_timeout_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}
