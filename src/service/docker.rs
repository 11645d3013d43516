//! Docker client module using bollard.

use bollard::Docker;

use crate::deploy::error::DeployError;

/// Connects to Docker using the default connection method (Unix socket on
/// Linux/macOS, named pipe on Windows, or `DOCKER_HOST` when set).
///
/// This only configures the client. Use [`check_daemon`] to find out
/// whether the daemon actually answers.
pub fn connect() -> Result<Docker, DeployError> {
    Docker::connect_with_local_defaults()
        .map_err(|e| DeployError::Runtime(format!("Failed to configure Docker client: {e}")))
}

pub async fn check_daemon(docker: &Docker) {
    match docker.version().await {
        Ok(version) => log::info!(
            "Connected to Docker {} (API {})",
            version.version.unwrap_or_default(),
            version.api_version.unwrap_or_default()
        ),
        Err(e) => log::warn!("Docker daemon is not reachable yet: {e}"),
    }
}
