use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use async_trait::async_trait;
use bollard::{
    Docker,
    query_parameters::{
        RemoveImageOptions, RemoveImageOptionsBuilder, TagImageOptions, TagImageOptionsBuilder,
    },
};
use tokio::process::Command;
use uuid::Uuid;

use crate::deploy::{
    error::{DeployError, Step},
    project::{HostPort, ProjectName},
};
use crate::service::{
    compose::{find_compose_file, prepare_compose_file},
    process::{CapturedOutput, RunError, run_captured},
};

/// Lines of build output attached to a `BuildError`.
const BUILD_ERROR_LINES: usize = 60;

/// What a build produces for the supervisor to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildArtifact {
    /// A single image built from a Dockerfile.
    Image { tag: String, container_port: u16 },
    /// A compose project whose images were built by `docker compose build`.
    Compose {
        project_dir: PathBuf,
        compose_file: PathBuf,
    },
}

#[async_trait]
pub trait ImageBuilder: Send + Sync {
    /// Decides what building `workdir` will produce without building
    /// anything, so a failed or cancelled build can be discarded exactly.
    async fn plan(&self, workdir: &Path, name: &ProjectName) -> Result<BuildArtifact, DeployError>;

    /// Builds `plan` and returns the artifact to run.
    async fn build(
        &self,
        workdir: &Path,
        plan: &BuildArtifact,
        name: &ProjectName,
        host_port: HostPort,
        output: &CapturedOutput,
    ) -> Result<BuildArtifact, DeployError>;

    /// Removes whatever a (possibly partial) build of `name` produced.
    async fn discard(&self, name: &ProjectName, artifact: Option<&BuildArtifact>);
}

/// A compose file wins over a Dockerfile. Dockerfile builds go to a tag of
/// their own and only replace `:latest` once they succeed.
pub fn plan_build(
    workdir: &Path,
    name: &ProjectName,
    default_container_port: u16,
) -> Result<BuildArtifact, DeployError> {
    if let Some(compose_file) = find_compose_file(workdir) {
        return Ok(BuildArtifact::Compose {
            project_dir: workdir.to_path_buf(),
            compose_file,
        });
    }
    if workdir.join("Dockerfile").is_file() {
        return Ok(BuildArtifact::Image {
            tag: attempt_tag(name),
            container_port: default_container_port,
        });
    }
    Err(DeployError::Build {
        reason: "No docker-compose.yml or Dockerfile found in the repository".to_string(),
        output: String::new(),
    })
}

fn attempt_tag(name: &ProjectName) -> String {
    format!("{}:build-{}", name.image_repository(), Uuid::now_v7().simple())
}

pub struct DockerBuilder {
    docker: Docker,
    timeout: Duration,
    default_container_port: u16,
}

impl DockerBuilder {
    pub fn new(docker: Docker, timeout: Duration, default_container_port: u16) -> Self {
        Self {
            docker,
            timeout,
            default_container_port,
        }
    }

    fn timed_out(&self) -> DeployError {
        DeployError::Timeout {
            step: Step::Build,
            seconds: self.timeout.as_secs(),
        }
    }

    async fn build_image(
        &self,
        workdir: &Path,
        attempt: &str,
        fallback_port: u16,
        name: &ProjectName,
        output: &CapturedOutput,
    ) -> Result<BuildArtifact, DeployError> {
        log::info!("Building image {attempt} from {workdir:?}");

        let mut command = Command::new("docker");
        command
            .args(["build", "-t", attempt, "."])
            .current_dir(workdir);

        match run_captured(command, self.timeout, output).await {
            Ok(status) if status.success() => {}
            Ok(status) => {
                return Err(DeployError::Build {
                    reason: format!("docker build exited with {status}"),
                    output: output.tail(BUILD_ERROR_LINES),
                });
            }
            Err(RunError::TimedOut { .. }) => return Err(self.timed_out()),
            Err(e) => {
                return Err(DeployError::Build {
                    reason: e.to_string(),
                    output: output.tail(BUILD_ERROR_LINES),
                });
            }
        }

        let container_port = match self.declared_port(attempt).await {
            Some(port) => port,
            None => {
                log::warn!("Image {attempt} declares no TCP port, using {fallback_port}");
                fallback_port
            }
        };

        let tag = self.promote(attempt, name).await?;
        log::info!("Image {tag} built, container port {container_port}");
        Ok(BuildArtifact::Image {
            tag,
            container_port,
        })
    }

    /// Points `:latest` at the freshly built `attempt` and drops the
    /// attempt tag.
    async fn promote(&self, attempt: &str, name: &ProjectName) -> Result<String, DeployError> {
        let repository = name.image_repository();
        let options: TagImageOptions = TagImageOptionsBuilder::new()
            .repo(&repository)
            .tag("latest")
            .build();
        self.docker
            .tag_image(attempt, Some(options))
            .await
            .map_err(|e| DeployError::Build {
                reason: format!("Unable to tag {attempt} as {repository}:latest: {e}"),
                output: String::new(),
            })?;

        let options: RemoveImageOptions = RemoveImageOptionsBuilder::new().build();
        if let Err(e) = self.docker.remove_image(attempt, Some(options), None).await {
            log::warn!("Failed to untag {attempt}: {e}");
        }
        Ok(name.image_tag())
    }

    async fn declared_port(&self, tag: &str) -> Option<u16> {
        match self.docker.inspect_image(tag).await {
            Ok(image) => image
                .config
                .and_then(|config| config.exposed_ports)
                .and_then(|ports| lowest_tcp_port(&ports)),
            Err(e) => {
                log::warn!("Failed to inspect image {tag}: {e}");
                None
            }
        }
    }

    async fn remove_image(&self, tag: &str) {
        let options: RemoveImageOptions = RemoveImageOptionsBuilder::new().force(true).build();
        match self.docker.remove_image(tag, Some(options), None).await {
            Ok(_) => log::info!("Image {tag} removed"),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => log::debug!("Image {tag} not found, skipping removal"),
            Err(e) => log::warn!("Failed to remove image {tag}: {e}"),
        }
    }

    async fn build_compose(
        &self,
        project_dir: &Path,
        compose_file: &Path,
        name: &ProjectName,
        host_port: HostPort,
        output: &CapturedOutput,
    ) -> Result<BuildArtifact, DeployError> {
        log::info!("Building compose project {name} from {compose_file:?}");
        prepare_compose_file(compose_file, name, host_port)
            .await
            .map_err(|e| DeployError::Build {
                reason: format!("Unable to prepare {compose_file:?}: {e}"),
                output: String::new(),
            })?;

        let mut command = compose_command(name, compose_file);
        command.arg("build").current_dir(project_dir);

        match run_captured(command, self.timeout, output).await {
            Ok(status) if status.success() => Ok(BuildArtifact::Compose {
                project_dir: project_dir.to_path_buf(),
                compose_file: compose_file.to_path_buf(),
            }),
            Ok(status) => Err(DeployError::Build {
                reason: format!("docker compose build exited with {status}"),
                output: output.tail(BUILD_ERROR_LINES),
            }),
            Err(RunError::TimedOut { .. }) => Err(self.timed_out()),
            Err(e) => Err(DeployError::Build {
                reason: e.to_string(),
                output: output.tail(BUILD_ERROR_LINES),
            }),
        }
    }
}

/// `docker compose -p <name> -f <file>`
pub fn compose_command(name: &ProjectName, compose_file: &Path) -> Command {
    let mut command = Command::new("docker");
    command
        .arg("compose")
        .args(["-p", name.as_str()])
        .arg("-f")
        .arg(compose_file);
    command
}

/// Tears a compose project down together with the images it built.
pub fn compose_down_command(name: &ProjectName, project_dir: &Path, compose_file: &Path) -> Command {
    let mut command = compose_command(name, compose_file);
    command
        .args(["down", "--rmi", "local", "--remove-orphans"])
        .current_dir(project_dir);
    command
}

#[async_trait]
impl ImageBuilder for DockerBuilder {
    async fn plan(&self, workdir: &Path, name: &ProjectName) -> Result<BuildArtifact, DeployError> {
        plan_build(workdir, name, self.default_container_port)
    }

    async fn build(
        &self,
        workdir: &Path,
        plan: &BuildArtifact,
        name: &ProjectName,
        host_port: HostPort,
        output: &CapturedOutput,
    ) -> Result<BuildArtifact, DeployError> {
        match plan {
            BuildArtifact::Compose {
                project_dir,
                compose_file,
            } => {
                self.build_compose(project_dir, compose_file, name, host_port, output)
                    .await
            }
            BuildArtifact::Image {
                tag,
                container_port,
            } => {
                self.build_image(workdir, tag, *container_port, name, output)
                    .await
            }
        }
    }

    async fn discard(&self, name: &ProjectName, artifact: Option<&BuildArtifact>) {
        match artifact {
            Some(BuildArtifact::Compose {
                project_dir,
                compose_file,
            }) => {
                let result = compose_down_command(name, project_dir, compose_file)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await;
                match result {
                    Ok(status) if status.success() => {
                        log::info!("Discarded compose images of {name}")
                    }
                    Ok(status) => log::debug!("Nothing to discard for {name} ({status})"),
                    Err(e) => log::warn!("Failed to discard compose images of {name}: {e}"),
                }
            }
            Some(BuildArtifact::Image { tag, .. }) => self.remove_image(tag).await,
            None => log::debug!("No build output to discard for {name}"),
        }
    }
}

/// Picks the lowest TCP port among an image's exposed ports, which are
/// keyed like `5006/tcp` or `53/udp`.
pub fn lowest_tcp_port<I, S>(ports: I) -> Option<u16>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    ports
        .into_iter()
        .filter_map(|key| {
            let key = key.as_ref();
            let (port, protocol) = key.split_once('/').unwrap_or((key, "tcp"));
            (protocol == "tcp").then(|| port.parse::<u16>().ok()).flatten()
        })
        .min()
}
