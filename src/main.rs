use std::{process::ExitCode, sync::Arc, time::Duration};

use config::DesplegarConfig;
use deploy::machine::Deployments;
use service::{
    builder::DockerBuilder, fetcher::GitFetcher, inventory::Inventory,
    supervisor::DockerSupervisor,
};

mod api;
mod cli;
mod config;
mod deploy;
mod server;
mod service;
mod signals;
#[cfg(test)]
mod testing;
mod vars;

/// How long a fresh container has to stay up before it counts as running.
const SETTLE_DELAY: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize the logger
    env_logger::init();

    let args = cli::get_cli_args();
    let mut config = match DesplegarConfig::try_init(&args.config) {
        Ok(config) => config,
        Err(e) => {
            log::error!("Unable to load {:?}: {e}", args.config);
            return ExitCode::FAILURE;
        }
    };
    config.apply_env_overrides(|key| std::env::var(key).ok());
    config.apply_cli(args);
    log::info!("Cloning projects into {:?}", config.projects_dir);

    let docker = match service::docker::connect() {
        Ok(docker) => docker,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };
    service::docker::check_daemon(&docker).await;

    let builder = DockerBuilder::new(
        docker.clone(),
        config.timeouts.build(),
        config.default_container_port,
    );
    let runtime = Arc::new(DockerSupervisor::new(
        docker,
        config.timeouts.start(),
        SETTLE_DELAY,
    ));
    let deployments = Arc::new(Deployments::new(
        Arc::new(GitFetcher::new(&config.projects_dir, config.timeouts.fetch())),
        Arc::new(builder),
        runtime.clone(),
        config.capture_lines,
    ));
    let state = Arc::new(api::AppState {
        deployments: deployments.clone(),
        inventory: Inventory::new(runtime),
    });

    let shutdown = match signals::handle_shutdown() {
        Ok(shutdown) => shutdown,
        Err(e) => {
            log::error!("Unable to install signal handlers: {e}");
            return ExitCode::FAILURE;
        }
    };

    let served = server::serve(api::router(state), config.bind, shutdown).await;
    deployments.shutdown(config.timeouts.shutdown()).await;

    match served {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Server error: {e}");
            ExitCode::FAILURE
        }
    }
}
