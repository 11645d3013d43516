use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use bollard::{
    Docker,
    models::{ContainerCreateBody, ContainerSummary, HostConfig, PortBinding},
    query_parameters::{
        CreateContainerOptions, CreateContainerOptionsBuilder, ListContainersOptions,
        ListContainersOptionsBuilder, RemoveContainerOptions, RemoveContainerOptionsBuilder,
        StartContainerOptions, StartContainerOptionsBuilder, StopContainerOptions,
        StopContainerOptionsBuilder,
    },
};
use futures_util::future;

use crate::deploy::{
    error::{DeployError, Step},
    project::{HostPort, ProjectName},
};
use crate::service::{
    builder::{BuildArtifact, compose_command},
    process::{CapturedOutput, RunError, run_captured},
    snapshot::{ContainerSnapshot, PROJECT_LABEL},
};

/// Lines of `docker compose up` output quoted in a failure.
const START_ERROR_LINES: usize = 20;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Replaces the project's containers with fresh ones running `artifact`
    /// and returns the ids of the new containers.
    async fn run(
        &self,
        artifact: &BuildArtifact,
        name: &ProjectName,
        host_port: HostPort,
        output: &CapturedOutput,
    ) -> Result<Vec<String>, DeployError>;

    /// Stops and removes every managed container called `name` or belonging
    /// to project `name`. Returns the projects that lost containers; empty
    /// when nothing matched.
    async fn stop(&self, name: &str) -> Result<Vec<String>, DeployError>;

    /// Live snapshots of every container of `name`, in any state.
    async fn project_containers(
        &self,
        name: &ProjectName,
    ) -> Result<Vec<ContainerSnapshot>, DeployError>;

    /// Every managed container, in any state.
    async fn list_all(&self) -> Result<Vec<ContainerSnapshot>, DeployError>;

    /// The main container of `name`, if one exists.
    async fn inspect(&self, name: &ProjectName) -> Result<Option<ContainerSnapshot>, DeployError> {
        let containers = self.project_containers(name).await?;
        Ok(primary_container(name, containers))
    }
}

/// Prefers the container named after the project, then a running one.
pub fn primary_container(
    name: &ProjectName,
    mut containers: Vec<ContainerSnapshot>,
) -> Option<ContainerSnapshot> {
    let position = containers
        .iter()
        .position(|c| c.has_name(name.as_str()))
        .or_else(|| containers.iter().position(ContainerSnapshot::is_running))
        .or(if containers.is_empty() { None } else { Some(0) })?;
    Some(containers.swap_remove(position))
}

pub struct DockerSupervisor {
    docker: Docker,
    start_timeout: Duration,
    /// How long a fresh container must stay up before a run counts.
    settle: Duration,
}

impl DockerSupervisor {
    pub fn new(docker: Docker, start_timeout: Duration, settle: Duration) -> Self {
        Self {
            docker,
            start_timeout,
            settle,
        }
    }

    async fn list(&self, all: bool) -> Result<Vec<ContainerSummary>, DeployError> {
        let options: ListContainersOptions = ListContainersOptionsBuilder::new().all(all).build();
        Ok(self.docker.list_containers(Some(options)).await?)
    }

    async fn managed(&self) -> Result<Vec<ContainerSnapshot>, DeployError> {
        Ok(self
            .list(true)
            .await?
            .into_iter()
            .map(ContainerSnapshot::from_summary)
            .filter(|c| c.project.is_some())
            .collect())
    }

    async fn stop_container(&self, id: &str) -> Result<(), DeployError> {
        let options: StopContainerOptions = StopContainerOptionsBuilder::new().t(10).build();
        match self.docker.stop_container(id, Some(options)).await {
            Ok(_) => {
                log::info!("Container {id} stopped successfully");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                log::warn!("Container {id} not found, skipping stop");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                log::info!("Container {id} already stopped");
                Ok(())
            }
            Err(e) => {
                log::warn!("Failed to stop container {id}: {e}");
                Err(e.into())
            }
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), DeployError> {
        let options: RemoveContainerOptions =
            RemoveContainerOptionsBuilder::new().force(true).build();
        match self.docker.remove_container(id, Some(options)).await {
            Ok(_) => {
                log::info!("Container {id} removed successfully");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                log::info!("Container {id} not found, skipping removal");
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to remove container {id}: {e}");
                Err(e.into())
            }
        }
    }

    async fn stop_and_remove(&self, containers: &[ContainerSnapshot]) -> Result<(), DeployError> {
        let results = future::join_all(containers.iter().map(|c| async move {
            // Removal is forced, so a failed stop is not fatal.
            let _ = self.stop_container(&c.id).await;
            self.remove_container(&c.id).await
        }))
        .await;
        results.into_iter().collect()
    }

    /// Networks created by `docker compose up` for a project.
    async fn remove_compose_network(&self, project: &str) {
        let network = format!("{project}_default");
        match self.docker.remove_network(&network).await {
            Ok(_) => log::info!("Network {network} removed"),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => log::debug!("Network {network} not removed: {e}"),
        }
    }

    /// Fails when a running container outside `name` publishes `host_port`.
    async fn ensure_port_free(&self, name: &ProjectName, host_port: HostPort) -> Result<(), DeployError> {
        let running: Vec<ContainerSnapshot> = self
            .list(false)
            .await?
            .into_iter()
            .map(ContainerSnapshot::from_summary)
            .collect();
        let holders = port_holders(&running, name, host_port);
        if holders.is_empty() {
            return Ok(());
        }
        Err(DeployError::PortInUse {
            port: host_port.get(),
            details: format!("published by {}", holders.join(", ")),
        })
    }

    async fn run_image(
        &self,
        tag: &str,
        container_port: u16,
        name: &ProjectName,
        host_port: HostPort,
    ) -> Result<Vec<String>, DeployError> {
        log::info!("Creating container: {name}");
        let container_port = format!("{container_port}/tcp");

        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        port_bindings.insert(
            container_port.clone(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(host_port.to_string()),
            }]),
        );

        let mut labels = HashMap::new();
        labels.insert(PROJECT_LABEL.to_string(), name.to_string());

        let config = ContainerCreateBody {
            image: Some(tag.to_string()),
            labels: Some(labels),
            exposed_ports: Some(vec![container_port.clone()]),
            host_config: Some(HostConfig {
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        };

        let options: CreateContainerOptions =
            CreateContainerOptionsBuilder::new().name(name.as_str()).build();
        let created = self.docker.create_container(Some(options), config).await?;

        let options: StartContainerOptions = StartContainerOptionsBuilder::new().build();
        if let Err(e) = self.docker.start_container(&created.id, Some(options)).await {
            log::error!("Failed to start container {name}: {e}");
            let _ = self.remove_container(&created.id).await;
            return Err(start_error(host_port, e.to_string()));
        }

        log::info!("Container {name} started successfully");
        Ok(vec![created.id])
    }

    async fn run_compose(
        &self,
        project_dir: &std::path::Path,
        compose_file: &std::path::Path,
        name: &ProjectName,
        host_port: HostPort,
        output: &CapturedOutput,
    ) -> Result<Vec<String>, DeployError> {
        log::info!("Starting compose project {name}");
        let mut command = compose_command(name, compose_file);
        command
            .args(["up", "-d", "--remove-orphans"])
            .current_dir(project_dir);

        match run_captured(command, self.start_timeout, output).await {
            Ok(status) if status.success() => {}
            Ok(status) => {
                let tail = output.tail(START_ERROR_LINES);
                return Err(start_error(
                    host_port,
                    format!("docker compose up exited with {status}: {tail}"),
                ));
            }
            Err(RunError::TimedOut { .. }) => {
                return Err(DeployError::Timeout {
                    step: Step::Start,
                    seconds: self.start_timeout.as_secs(),
                });
            }
            Err(e) => return Err(DeployError::Runtime(e.to_string())),
        }

        let ids: Vec<String> = self
            .project_containers(name)
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect();
        if ids.is_empty() {
            return Err(DeployError::Runtime(format!(
                "docker compose up started no containers for {name}"
            )));
        }
        log::info!("Compose project {name} started {} container(s)", ids.len());
        Ok(ids)
    }

    /// Containers that die right after starting are a failed run, not a
    /// running deployment.
    async fn ensure_settled(
        &self,
        name: &ProjectName,
        ids: &[String],
        allow_completed: bool,
    ) -> Result<(), DeployError> {
        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }
        let containers = self.project_containers(name).await?;
        match unsettled(&containers, ids, allow_completed) {
            Some(reason) => Err(DeployError::Runtime(reason)),
            None => Ok(()),
        }
    }

    async fn remove_project(&self, name: &ProjectName) -> Result<(), DeployError> {
        let containers = self.project_containers(name).await?;
        if !containers.is_empty() {
            log::info!("Replacing {} container(s) of {name}", containers.len());
            self.stop_and_remove(&containers).await?;
        }
        Ok(())
    }
}

/// Resolves a stop request for `name`, a project or a container name, into
/// the projects it hits and every container of those projects.
pub fn stop_targets(
    managed: Vec<ContainerSnapshot>,
    name: &str,
) -> (Vec<String>, Vec<ContainerSnapshot>) {
    let mut projects: Vec<String> = managed
        .iter()
        .filter(|c| c.project.as_deref() == Some(name) || c.has_name(name))
        .filter_map(|c| c.project.clone())
        .collect();
    projects.sort();
    projects.dedup();

    // Stopping one container of a compose project stops the project.
    let targets = managed
        .into_iter()
        .filter(|c| c.project.as_ref().is_some_and(|p| projects.contains(p)))
        .collect();
    (projects, targets)
}

/// Names of the containers in `running` outside project `name` that
/// publish `host_port`. Unmanaged containers count.
pub fn port_holders(
    running: &[ContainerSnapshot],
    name: &ProjectName,
    host_port: HostPort,
) -> Vec<String> {
    running
        .iter()
        .filter(|c| c.published.contains(&host_port.get()))
        .filter(|c| c.project.as_deref() != Some(name.as_str()))
        .map(|c| c.names.clone())
        .collect()
}

/// Why the freshly started `ids` do not count as a running deployment, if
/// they don't. With `allow_completed`, containers that exited with status 0
/// are finished one-shot services, as long as something else stays up.
pub fn unsettled(
    containers: &[ContainerSnapshot],
    ids: &[String],
    allow_completed: bool,
) -> Option<String> {
    let mut any_running = false;
    for id in ids {
        match containers.iter().find(|c| &c.id == id) {
            Some(c) if c.is_running() => any_running = true,
            Some(c) if allow_completed && c.status.starts_with("Exited (0)") => {
                log::info!("Container {} completed: {}", c.names, c.status);
            }
            Some(c) => {
                return Some(format!(
                    "container {} stopped right after starting: {}",
                    c.names, c.status
                ));
            }
            None => return Some(format!("container {id} disappeared right after starting")),
        }
    }
    if any_running {
        None
    } else {
        Some("no container stayed up after starting".to_string())
    }
}

/// Classifies a failed container start.
pub fn start_error(host_port: HostPort, message: String) -> DeployError {
    let lowered = message.to_lowercase();
    if lowered.contains("port is already allocated") || lowered.contains("address already in use")
    {
        DeployError::PortInUse {
            port: host_port.get(),
            details: message,
        }
    } else {
        DeployError::Runtime(message)
    }
}

#[async_trait]
impl ContainerRuntime for DockerSupervisor {
    async fn run(
        &self,
        artifact: &BuildArtifact,
        name: &ProjectName,
        host_port: HostPort,
        output: &CapturedOutput,
    ) -> Result<Vec<String>, DeployError> {
        self.remove_project(name).await?;
        self.ensure_port_free(name, host_port).await?;

        let started = match artifact {
            BuildArtifact::Image {
                tag,
                container_port,
            } => self.run_image(tag, *container_port, name, host_port).await,
            BuildArtifact::Compose {
                project_dir,
                compose_file,
            } => {
                self.run_compose(project_dir, compose_file, name, host_port, output)
                    .await
            }
        };

        let allow_completed = matches!(artifact, BuildArtifact::Compose { .. });
        let result = match started {
            Ok(ids) => self
                .ensure_settled(name, &ids, allow_completed)
                .await
                .map(|_| ids),
            Err(e) => Err(e),
        };
        if result.is_err() {
            // Nothing half started is left behind.
            if let Err(e) = self.remove_project(name).await {
                log::warn!("Failed to clean up containers of {name}: {e}");
            }
        }
        result
    }

    async fn stop(&self, name: &str) -> Result<Vec<String>, DeployError> {
        let (projects, targets) = stop_targets(self.managed().await?, name);
        if targets.is_empty() {
            log::info!("Nothing to stop for {name}");
            return Ok(Vec::new());
        }

        self.stop_and_remove(&targets).await?;
        for project in &projects {
            self.remove_compose_network(project).await;
        }
        Ok(projects)
    }

    async fn project_containers(
        &self,
        name: &ProjectName,
    ) -> Result<Vec<ContainerSnapshot>, DeployError> {
        Ok(self
            .managed()
            .await?
            .into_iter()
            .filter(|c| c.project.as_deref() == Some(name.as_str()))
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<ContainerSnapshot>, DeployError> {
        self.managed().await
    }
}
