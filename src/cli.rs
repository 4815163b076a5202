//! Command-line arguments (spec §4.9, §6): generalizes the teacher's single
//! positional config-path argument into a full `clap`-derived surface. CLI
//! flags override config-file values, which override built-in defaults.

use clap::Parser;
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "hookforge", about = "Trigger local commands from declarative HTTP-triggered rules")]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, env = "HOOKFORGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Hook definition file (JSON or YAML); may be repeated.
    #[arg(long = "hooks", value_name = "PATH")]
    pub hooks_paths: Vec<PathBuf>,

    /// Address to bind.
    #[arg(long)]
    pub addr: Option<IpAddr>,

    /// Port to bind.
    #[arg(long)]
    pub port: Option<u16>,

    /// Verbose logging; combined with --no-panic, non-fatal config errors
    /// are logged instead of exiting the process.
    #[arg(short, long)]
    pub verbose: bool,

    /// Do not exit on errors that would otherwise be fatal (requires --verbose).
    #[arg(long = "no-panic")]
    pub no_panic: bool,

    #[arg(long = "hot-reload", overrides_with = "no_hot_reload")]
    pub hot_reload: bool,

    #[arg(long = "no-hot-reload", overrides_with = "hot_reload")]
    pub no_hot_reload: bool,

    /// Preprocess hook definition files as Handlebars templates.
    #[arg(long = "template-mode")]
    pub template_mode: bool,
}

impl Cli {
    /// Apply the flags a user actually passed onto `cfg`, leaving
    /// config-file/default values alone otherwise.
    pub fn apply_overrides(&self, cfg: &mut crate::config::Config) {
        if let Some(addr) = self.addr {
            cfg.bind_addr = addr;
        }
        if let Some(port) = self.port {
            cfg.bind_port = port;
        }
        if !self.hooks_paths.is_empty() {
            cfg.hooks_paths = self.hooks_paths.clone();
        }
        if self.verbose {
            cfg.verbose = true;
        }
        if self.no_panic {
            cfg.no_panic = true;
        }
        if self.hot_reload {
            cfg.hot_reload = true;
        }
        if self.no_hot_reload {
            cfg.hot_reload = false;
        }
        if self.template_mode {
            cfg.template_mode = true;
        }
    }
}
