//! In-memory stand-ins for git and docker used by unit tests.

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::deploy::{
    error::DeployError,
    machine::Deployments,
    project::{HostPort, ProjectName, RepoLink},
    state::LifecycleState,
};
use crate::service::{
    builder::{BuildArtifact, ImageBuilder},
    fetcher::RepositoryFetcher,
    process::CapturedOutput,
    snapshot::ContainerSnapshot,
    supervisor::{ContainerRuntime, stop_targets},
};

#[derive(Default)]
pub struct FakeFetcher {
    delay: Duration,
    error: Option<DeployError>,
}

impl FakeFetcher {
    pub fn slow(delay: Duration) -> Self {
        Self { delay, error: None }
    }

    pub fn failing(error: DeployError) -> Self {
        Self {
            delay: Duration::ZERO,
            error: Some(error),
        }
    }
}

#[async_trait]
impl RepositoryFetcher for FakeFetcher {
    async fn fetch(
        &self,
        name: &ProjectName,
        link: &RepoLink,
        output: &CapturedOutput,
    ) -> Result<PathBuf, DeployError> {
        tokio::time::sleep(self.delay).await;
        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        output.push(format!("fetched {link}"));
        Ok(Path::new("/proyectos").join(name.as_str()))
    }

    async fn discard(&self, _name: &ProjectName) {}
}

#[derive(Default)]
pub struct FakeBuilder {
    delay: Duration,
    error: Option<DeployError>,
    plan: Option<BuildArtifact>,
    discarded: Arc<Mutex<Vec<Option<BuildArtifact>>>>,
}

impl FakeBuilder {
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn failing(error: DeployError) -> Self {
        Self {
            error: Some(error),
            ..Default::default()
        }
    }

    /// Plans `plan` instead of a Dockerfile build.
    pub fn with_plan(self, plan: BuildArtifact) -> Self {
        Self {
            plan: Some(plan),
            ..self
        }
    }

    /// Artifacts passed to `discard`, in call order.
    pub fn discarded(&self) -> Arc<Mutex<Vec<Option<BuildArtifact>>>> {
        Arc::clone(&self.discarded)
    }
}

#[async_trait]
impl ImageBuilder for FakeBuilder {
    async fn plan(&self, _workdir: &Path, name: &ProjectName) -> Result<BuildArtifact, DeployError> {
        Ok(self.plan.clone().unwrap_or_else(|| BuildArtifact::Image {
            tag: format!("{}:build-attempt", name.image_repository()),
            container_port: 80,
        }))
    }

    async fn build(
        &self,
        _workdir: &Path,
        plan: &BuildArtifact,
        name: &ProjectName,
        _host_port: HostPort,
        output: &CapturedOutput,
    ) -> Result<BuildArtifact, DeployError> {
        tokio::time::sleep(self.delay).await;
        if let Some(error) = &self.error {
            return Err(error.clone());
        }
        let built = match plan {
            BuildArtifact::Image { container_port, .. } => BuildArtifact::Image {
                tag: name.image_tag(),
                container_port: *container_port,
            },
            compose => compose.clone(),
        };
        output.push(format!("built {built:?}"));
        Ok(built)
    }

    async fn discard(&self, _name: &ProjectName, artifact: Option<&BuildArtifact>) {
        self.discarded.lock().unwrap().push(artifact.cloned());
    }
}

#[derive(Default)]
pub struct FakeRuntime {
    containers: Mutex<Vec<ContainerSnapshot>>,
    stopped: Mutex<Vec<String>>,
    run_error: Option<DeployError>,
    unavailable: AtomicBool,
    next_id: AtomicUsize,
}

impl FakeRuntime {
    pub fn failing_run(error: DeployError) -> Self {
        Self {
            run_error: Some(error),
            ..Default::default()
        }
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn add_running(&self, project: &str, id: &str, host_port: u16) {
        self.lock().push(running(project, id, host_port));
    }

    /// Names passed to `stop`, in call order.
    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().unwrap().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ContainerSnapshot>> {
        self.containers.lock().unwrap()
    }

    fn check(&self) -> Result<(), DeployError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DeployError::Runtime("Cannot connect to the Docker daemon".into()));
        }
        Ok(())
    }
}

pub fn running(project: &str, id: &str, host_port: u16) -> ContainerSnapshot {
    ContainerSnapshot {
        id: id.into(),
        names: project.into(),
        image: format!("desplegar-{project}:latest"),
        state: "running".into(),
        status: "Up 2 seconds".into(),
        ports: format!("0.0.0.0:{host_port}->80/tcp, [::]:{host_port}->80/tcp"),
        project: Some(project.into()),
        published: vec![host_port],
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn run(
        &self,
        _artifact: &BuildArtifact,
        name: &ProjectName,
        host_port: HostPort,
        _output: &CapturedOutput,
    ) -> Result<Vec<String>, DeployError> {
        self.check()?;
        if let Some(error) = &self.run_error {
            return Err(error.clone());
        }
        let id = format!("{name}-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut containers = self.lock();
        containers.retain(|c| c.project.as_deref() != Some(name.as_str()));
        containers.push(running(name.as_str(), &id, host_port.get()));
        Ok(vec![id])
    }

    async fn stop(&self, name: &str) -> Result<Vec<String>, DeployError> {
        self.check()?;
        self.stopped.lock().unwrap().push(name.to_string());
        let mut containers = self.lock();
        let (projects, targets) = stop_targets(containers.clone(), name);
        containers.retain(|c| !targets.contains(c));
        Ok(projects)
    }

    async fn project_containers(
        &self,
        name: &ProjectName,
    ) -> Result<Vec<ContainerSnapshot>, DeployError> {
        self.check()?;
        Ok(self
            .lock()
            .iter()
            .filter(|c| c.project.as_deref() == Some(name.as_str()))
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<ContainerSnapshot>, DeployError> {
        self.check()?;
        Ok(self.lock().clone())
    }
}

/// Polls until the record of `name` reaches `state`.
pub async fn wait_for_state(deployments: &Deployments, name: &str, state: LifecycleState) {
    let reached = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok((record, _)) = deployments.logs(name) {
                if record.state == state {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "{name} never reached {state}");
}
