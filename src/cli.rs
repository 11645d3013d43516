use std::{net::SocketAddr, path::PathBuf, sync::OnceLock};

use clap::Parser;

/// Builds and runs projects straight from their git repositories.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to the config file.
    #[arg(short, long, default_value = "desplegar.toml")]
    pub config: PathBuf,
    /// Address the HTTP API listens on. Overrides `bind` in the config.
    #[arg(short, long)]
    pub bind: Option<SocketAddr>,
    /// Directory repositories are cloned into. Overrides `projects_dir`
    /// and the PROJECTS_BASE environment variable.
    #[arg(long)]
    pub projects_dir: Option<PathBuf>,
}

static ARGS: OnceLock<Args> = OnceLock::new();

pub fn get_cli_args() -> &'static Args {
    ARGS.get_or_init(Args::parse)
}
