use std::{net::SocketAddr, path::PathBuf, time::Duration};

use serde::Deserialize;

use crate::vars::{DesplegarVars, render_template};

/// Environment variable that moves the directory repositories are cloned into.
pub const PROJECTS_BASE_ENV: &str = "PROJECTS_BASE";

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 5000))
}

fn default_projects_dir() -> PathBuf {
    PathBuf::from("/proyectos")
}

fn default_container_port() -> u16 {
    5006
}

fn default_capture_lines() -> usize {
    500
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Templating error: {0:?}")]
    Template((PathBuf, minijinja::Error)),
}

/// Time limits, in seconds, for each step of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Timeouts {
    pub fetch: u64,
    pub build: u64,
    pub start: u64,
    /// How long shutdown waits for cancelled deployments to clean up.
    pub shutdown: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            fetch: 120,
            build: 900,
            start: 120,
            shutdown: 30,
        }
    }
}

impl Timeouts {
    pub fn fetch(&self) -> Duration {
        Duration::from_secs(self.fetch)
    }

    pub fn build(&self) -> Duration {
        Duration::from_secs(self.build)
    }

    pub fn start(&self) -> Duration {
        Duration::from_secs(self.start)
    }

    pub fn shutdown(&self) -> Duration {
        Duration::from_secs(self.shutdown)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DesplegarConfig {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    #[serde(default = "default_projects_dir")]
    pub projects_dir: PathBuf,
    /// Container port assumed when a built image declares none.
    #[serde(default = "default_container_port")]
    pub default_container_port: u16,
    /// Lines of tool output kept per deployment.
    #[serde(default = "default_capture_lines")]
    pub capture_lines: usize,
    #[serde(default)]
    pub timeouts: Timeouts,
}

impl Default for DesplegarConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            projects_dir: default_projects_dir(),
            default_container_port: default_container_port(),
            capture_lines: default_capture_lines(),
            timeouts: Timeouts::default(),
        }
    }
}

impl DesplegarConfig {
    fn try_init_from_string(
        config: &str,
        path: PathBuf,
        vars: &DesplegarVars,
    ) -> Result<Self, ConfigError> {
        let rendered = render_template(config, vars).map_err(|e| ConfigError::Template((path, e)))?;
        Ok(toml::from_str(&rendered)?)
    }

    /// Loads the config at `path`. A missing file means every default.
    pub fn try_init(path: &std::path::Path) -> Result<Self, ConfigError> {
        let config = match std::fs::read_to_string(path) {
            Ok(config) => config,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No config file at {path:?}, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        let vars = DesplegarVars::try_init(path);
        Self::try_init_from_string(&config, path.to_path_buf(), &vars)
    }

    /// Applies environment overrides read through `lookup`.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(base) = lookup(PROJECTS_BASE_ENV).filter(|v| !v.trim().is_empty()) {
            self.projects_dir = PathBuf::from(base.trim());
        }
    }

    /// Command line flags win over the file and the environment.
    pub fn apply_cli(&mut self, args: &crate::cli::Args) {
        if let Some(bind) = args.bind {
            self.bind = bind;
        }
        if let Some(projects_dir) = &args.projects_dir {
            self.projects_dir = projects_dir.clone();
        }
    }
}
