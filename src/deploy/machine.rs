use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::deploy::{
    error::{DeployError, Step},
    project::{HostPort, ProjectName, RepoLink},
    state::{DeploymentRecord, LifecycleState},
};
use crate::service::{
    builder::{BuildArtifact, ImageBuilder},
    fetcher::RepositoryFetcher,
    process::CapturedOutput,
    snapshot::ContainerSnapshot,
    supervisor::ContainerRuntime,
};

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

struct Entry {
    record: DeploymentRecord,
    /// Present while the pipeline of `record` is running.
    cancel: Option<mpsc::Sender<()>>,
}

/// What `/status` reports for a project.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub nombre: ProjectName,
    pub state: Option<LifecycleState>,
    pub deployment: Option<DeploymentRecord>,
    pub containers: Vec<ContainerSnapshot>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StopOutcome {
    /// Projects whose containers were removed.
    pub stopped: Vec<String>,
    /// Whether an in-flight deployment was cancelled.
    pub cancelled: bool,
}

/// Owns every deployment record and drives the fetch, build and start
/// pipeline of each accepted deploy.
pub struct Deployments {
    records: Mutex<HashMap<ProjectName, Entry>>,
    fetcher: Arc<dyn RepositoryFetcher>,
    builder: Arc<dyn ImageBuilder>,
    runtime: Arc<dyn ContainerRuntime>,
    capture_lines: usize,
}

impl Deployments {
    pub fn new(
        fetcher: Arc<dyn RepositoryFetcher>,
        builder: Arc<dyn ImageBuilder>,
        runtime: Arc<dyn ContainerRuntime>,
        capture_lines: usize,
    ) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            fetcher,
            builder,
            runtime,
            capture_lines,
        }
    }

    fn records(&self) -> MutexGuard<'_, HashMap<ProjectName, Entry>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Applies `f` to the record of `name` if it is still attempt `id`.
    fn update<R>(
        &self,
        name: &ProjectName,
        id: Uuid,
        f: impl FnOnce(&mut Entry) -> R,
    ) -> Option<R> {
        let mut records = self.records();
        match records.get_mut(name) {
            Some(entry) if entry.record.id == id => Some(f(entry)),
            _ => None,
        }
    }

    fn advance(&self, name: &ProjectName, id: Uuid, next: LifecycleState) -> Result<(), DeployError> {
        match self.update(name, id, |entry| entry.record.transition(next)) {
            Some(true) => Ok(()),
            _ => Err(DeployError::Cancelled),
        }
    }

    /// Accepts a deploy of `link` as project `nombre` on `host_port` and
    /// returns the new record while the pipeline runs in the background.
    pub fn start(
        self: &Arc<Self>,
        nombre: &str,
        link: &str,
        host_port: HostPort,
    ) -> Result<DeploymentRecord, DeployError> {
        let name = ProjectName::sanitize(nombre)?;
        let link = RepoLink::parse(link)?;

        let (tx, rx) = mpsc::channel(1);
        let record = {
            let mut records = self.records();
            if let Some(entry) = records.get(&name) {
                if entry.record.is_active() {
                    return Err(DeployError::Conflict(name.to_string()));
                }
            }
            let record = DeploymentRecord::new(name.clone(), link, host_port, self.capture_lines);
            records.insert(
                name.clone(),
                Entry {
                    record: record.clone(),
                    cancel: Some(tx),
                },
            );
            record
        };

        log::info!(
            "Accepted deployment {} of {name} from {} on port {host_port}",
            record.id,
            record.link
        );
        tokio::spawn(Arc::clone(self).pipeline(record.clone(), rx));
        Ok(record)
    }

    async fn pipeline(self: Arc<Self>, record: DeploymentRecord, mut cancel: mpsc::Receiver<()>) {
        let DeploymentRecord {
            id,
            project: name,
            link,
            host_port,
            output,
            ..
        } = record;

        let mut reached = Step::Fetch;
        let mut artifact = None;
        let outcome = tokio::select! {
            result = self.execute(id, &name, &link, host_port, &output, &mut reached, &mut artifact) => result,
            _ = cancel.recv() => Err(DeployError::Cancelled),
        };

        match outcome {
            Ok(container_ids) => {
                let landed = self.update(&name, id, |entry| {
                    entry.cancel = None;
                    entry.record.container_ids = container_ids;
                    entry.record.transition(LifecycleState::Running)
                });
                if landed != Some(true) {
                    log::warn!("Deployment {id} of {name} was superseded while starting");
                    return;
                }
                match self.runtime.inspect(&name).await {
                    Ok(Some(container)) => log::info!(
                        "{name} is {} on host port {}",
                        container.status,
                        container
                            .host_port()
                            .map_or_else(|| "none".to_string(), |p| p.to_string())
                    ),
                    Ok(None) => log::warn!("{name} has no container right after starting"),
                    Err(e) => log::warn!("Unable to inspect {name}: {e}"),
                }
            }
            Err(error) => {
                log::error!("Deployment {id} of {name} failed: {error}");
                self.cleanup(&name, reached, artifact.as_ref()).await;
                self.update(&name, id, |entry| {
                    entry.cancel = None;
                    entry.record.fail(&error);
                });
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        id: Uuid,
        name: &ProjectName,
        link: &RepoLink,
        host_port: HostPort,
        output: &CapturedOutput,
        reached: &mut Step,
        artifact: &mut Option<BuildArtifact>,
    ) -> Result<Vec<String>, DeployError> {
        self.advance(name, id, LifecycleState::Building)?;
        let workdir: PathBuf = self.fetcher.fetch(name, link, output).await?;

        *reached = Step::Build;
        // Recorded before building so cleanup knows exactly what to discard.
        let planned = artifact.insert(self.builder.plan(&workdir, name).await?);
        let built = self
            .builder
            .build(&workdir, planned, name, host_port, output)
            .await?;
        let built = artifact.insert(built);

        *reached = Step::Start;
        self.advance(name, id, LifecycleState::Starting)?;
        self.runtime.run(built, name, host_port, output).await
    }

    /// Removes what a failed attempt left behind, newest resources first.
    async fn cleanup(&self, name: &ProjectName, reached: Step, artifact: Option<&BuildArtifact>) {
        if reached == Step::Start {
            if let Err(e) = self.runtime.stop(name.as_str()).await {
                log::warn!("Failed to remove containers of {name}: {e}");
            }
        }
        if reached != Step::Fetch {
            self.builder.discard(name, artifact).await;
        }
        self.fetcher.discard(name).await;
    }

    /// The current record of `nombre` next to a live view of its containers.
    pub async fn status(&self, nombre: &str) -> Result<StatusReport, DeployError> {
        let name = ProjectName::sanitize(nombre)?;
        let record = self.records().get(&name).map(|e| e.record.clone());
        let mut containers = self.runtime.project_containers(&name).await?;

        if let Some(record) = &record {
            // Leftovers of earlier attempts must not stand in for this one.
            containers.retain(|c| record.owns(&c.id));
        } else if containers.is_empty() {
            return Err(DeployError::NotFound(name.to_string()));
        }

        Ok(StatusReport {
            state: record.as_ref().map(|r| r.state),
            nombre: name,
            deployment: record,
            containers,
        })
    }

    /// Removes the containers of `nombre`, which may be a project or a
    /// container name, and cancels its deployment if one is in flight.
    pub async fn stop(&self, nombre: &str) -> Result<StopOutcome, DeployError> {
        let raw = nombre.trim();
        // A name with nothing left after sanitising can still match a
        // container name verbatim, and otherwise matches nothing.
        let name = ProjectName::sanitize(raw).ok();

        let cancelled = match &name {
            Some(name) => {
                let records = self.records();
                records
                    .get(name)
                    .and_then(|e| e.cancel.as_ref())
                    .map(|tx| tx.try_send(()).is_ok())
                    .unwrap_or(false)
            }
            None => false,
        };
        if cancelled {
            log::info!("Cancelling in-flight deployment of {raw}");
        }

        let mut stopped = self.runtime.stop(raw).await?;
        if let Some(name) = name.as_ref().filter(|name| raw != name.as_str()) {
            stopped.extend(self.runtime.stop(name.as_str()).await?);
        }
        stopped.sort();
        stopped.dedup();

        {
            let mut records = self.records();
            for entry in records.values_mut() {
                let project = entry.record.project.as_str();
                let affected = name.as_ref().is_some_and(|n| n.as_str() == project)
                    || stopped.iter().any(|p| p == project);
                if affected && entry.record.state == LifecycleState::Running {
                    entry.record.transition(LifecycleState::Stopped);
                }
            }
        }

        Ok(StopOutcome { stopped, cancelled })
    }

    /// The current record of `nombre` and the tool output it captured.
    pub fn logs(&self, nombre: &str) -> Result<(DeploymentRecord, Vec<String>), DeployError> {
        let name = ProjectName::sanitize(nombre)?;
        let records = self.records();
        let entry = records
            .get(&name)
            .ok_or_else(|| DeployError::NotFound(name.to_string()))?;
        Ok((entry.record.clone(), entry.record.output.lines()))
    }

    fn active(&self) -> usize {
        self.records().values().filter(|e| e.record.is_active()).count()
    }

    /// Cancels every in-flight deployment and waits up to `limit` for
    /// their cleanup to finish.
    pub async fn shutdown(&self, limit: Duration) {
        {
            let records = self.records();
            for (name, entry) in records.iter() {
                if let Some(tx) = &entry.cancel {
                    log::info!("Cancelling deployment of {name}");
                    let _ = tx.try_send(());
                }
            }
        }

        let waited = tokio::time::timeout(limit, async {
            while self.active() > 0 {
                tokio::time::sleep(SHUTDOWN_POLL).await;
            }
        })
        .await;
        match waited {
            Ok(()) => log::info!("All deployments settled"),
            Err(_) => log::warn!(
                "{} deployment(s) still running after {limit:?}",
                self.active()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBuilder, FakeFetcher, FakeRuntime, wait_for_state};

    fn deployments(
        fetcher: FakeFetcher,
        builder: FakeBuilder,
        runtime: Arc<FakeRuntime>,
    ) -> Arc<Deployments> {
        Arc::new(Deployments::new(
            Arc::new(fetcher),
            Arc::new(builder),
            runtime,
            100,
        ))
    }

    fn port(p: i64) -> HostPort {
        HostPort::try_from(p).unwrap()
    }

    const LINK: &str = "https://example.com/demo.git";

    #[tokio::test]
    async fn test_successful_deploy_is_up() {
        let runtime = Arc::new(FakeRuntime::default());
        let deployments = deployments(
            FakeFetcher::default(),
            FakeBuilder::default(),
            runtime.clone(),
        );

        let record = deployments.start("Demo", LINK, port(8080)).unwrap();
        assert_eq!(record.state, LifecycleState::Pending);
        assert_eq!(record.project.as_str(), "demo");

        wait_for_state(&deployments, "demo", LifecycleState::Running).await;
        let report = deployments.status("demo").await.unwrap();
        assert_eq!(report.state, Some(LifecycleState::Running));
        assert_eq!(report.containers.len(), 1);
        assert!(report.containers[0].status.contains("Up"));
        assert_eq!(report.containers[0].host_port(), Some(8080));

        let inspected = runtime
            .inspect(&ProjectName::sanitize("demo").unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(inspected.status.contains("Up"));

        let (_, lines) = deployments.logs("demo").unwrap();
        assert!(lines.iter().any(|l| l.contains("fetched")));
    }

    #[tokio::test]
    async fn test_second_deploy_conflicts() {
        let deployments = deployments(
            FakeFetcher::slow(Duration::from_secs(30)),
            FakeBuilder::default(),
            Arc::new(FakeRuntime::default()),
        );
        deployments.start("demo", LINK, port(8080)).unwrap();
        let second = deployments.start("DEMO", LINK, port(8081));
        assert!(matches!(second, Err(DeployError::Conflict(_))));

        // Other names deploy independently.
        assert!(deployments.start("other", LINK, port(8082)).is_ok());
    }

    #[tokio::test]
    async fn test_failed_build_never_reports_up() {
        let runtime = Arc::new(FakeRuntime::default());
        // An older container of the project is still up.
        runtime.add_running("demo", "old", 8080);
        let deployments = deployments(
            FakeFetcher::default(),
            FakeBuilder::failing(DeployError::Build {
                reason: "docker build exited with exit status: 1".into(),
                output: "Step 3/5 : RUN make\nUp to date\nError 2".into(),
            }),
            runtime.clone(),
        );

        deployments.start("demo", LINK, port(8080)).unwrap();
        wait_for_state(&deployments, "demo", LifecycleState::Failed).await;

        let report = deployments.status("demo").await.unwrap();
        assert!(report.containers.is_empty());
        let error = report.deployment.unwrap().error.unwrap();
        assert_eq!(error.kind, "BuildError");
        assert!(!error.message.contains("Up"));
    }

    #[tokio::test]
    async fn test_unreachable_link_fails_with_reason() {
        let fetcher = FakeFetcher::failing(DeployError::Fetch(
            "fatal: unable to access 'https://nowhere.invalid/': Could not resolve host".into(),
        ));
        let deployments = deployments(fetcher, FakeBuilder::default(), Arc::new(FakeRuntime::default()));

        deployments
            .start("demo", "https://nowhere.invalid/repo.git", port(8080))
            .unwrap();
        wait_for_state(&deployments, "demo", LifecycleState::Failed).await;

        let (record, _) = deployments.logs("demo").unwrap();
        let error = record.error.unwrap();
        assert_eq!(error.kind, "FetchError");
        assert!(error.message.contains("Could not resolve host"));
        assert!(record.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_invalid_input_rejected_before_accepting() {
        let deployments = deployments(
            FakeFetcher::default(),
            FakeBuilder::default(),
            Arc::new(FakeRuntime::default()),
        );
        assert!(matches!(
            deployments.start("!!!", LINK, port(8080)),
            Err(DeployError::InvalidRequest(_))
        ));
        assert!(matches!(
            deployments.start("demo", "--upload-pack=touch /tmp/x", port(8080)),
            Err(DeployError::Fetch(_))
        ));
        assert!(matches!(
            deployments.status("demo").await,
            Err(DeployError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_without_containers_is_noop() {
        let deployments = deployments(
            FakeFetcher::default(),
            FakeBuilder::default(),
            Arc::new(FakeRuntime::default()),
        );
        let outcome = deployments.stop("ghost").await.unwrap();
        assert_eq!(outcome, StopOutcome::default());
    }

    #[tokio::test]
    async fn test_stop_unsanitizable_name_is_noop() {
        let runtime = Arc::new(FakeRuntime::default());
        runtime.add_running("demo", "c1", 8080);
        let deployments = deployments(FakeFetcher::default(), FakeBuilder::default(), runtime.clone());

        let outcome = deployments.stop("___").await.unwrap();
        assert_eq!(outcome, StopOutcome::default());
        assert_eq!(runtime.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_running_deployment() {
        let runtime = Arc::new(FakeRuntime::default());
        let deployments = deployments(FakeFetcher::default(), FakeBuilder::default(), runtime.clone());

        deployments.start("demo", LINK, port(8080)).unwrap();
        wait_for_state(&deployments, "demo", LifecycleState::Running).await;

        let outcome = deployments.stop("demo").await.unwrap();
        assert_eq!(outcome.stopped, vec!["demo".to_string()]);
        assert!(!outcome.cancelled);

        let report = deployments.status("demo").await.unwrap();
        assert_eq!(report.state, Some(LifecycleState::Stopped));
        assert!(report.containers.is_empty());
        assert!(runtime.list_all().await.unwrap().is_empty());

        // A stopped project can be deployed again.
        deployments.start("demo", LINK, port(8080)).unwrap();
        wait_for_state(&deployments, "demo", LifecycleState::Running).await;
    }

    #[tokio::test]
    async fn test_stop_cancels_in_flight_deployment() {
        let builder = FakeBuilder::slow(Duration::from_secs(30));
        let discarded = builder.discarded();
        let deployments = deployments(
            FakeFetcher::default(),
            builder,
            Arc::new(FakeRuntime::default()),
        );

        deployments.start("demo", LINK, port(8080)).unwrap();
        wait_for_state(&deployments, "demo", LifecycleState::Building).await;
        // Let the fetch finish so the build is running.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let outcome = deployments.stop("demo").await.unwrap();
        assert!(outcome.cancelled);

        wait_for_state(&deployments, "demo", LifecycleState::Failed).await;
        let (record, _) = deployments.logs("demo").unwrap();
        assert_eq!(record.error.unwrap().kind, "CancelledError");
        let discarded = discarded.lock().unwrap();
        assert_eq!(discarded.len(), 1);
        assert!(matches!(
            &discarded[0],
            Some(BuildArtifact::Image { tag, .. }) if tag != "desplegar-demo:latest"
        ));
    }

    #[tokio::test]
    async fn test_failed_image_build_keeps_live_image() {
        let builder = FakeBuilder::failing(DeployError::Build {
            reason: "docker build exited with exit status: 1".into(),
            output: String::new(),
        });
        let discarded = builder.discarded();
        let runtime = Arc::new(FakeRuntime::default());
        runtime.add_running("demo", "live", 8080);
        let deployments = deployments(FakeFetcher::default(), builder, runtime.clone());

        deployments.start("demo", LINK, port(8080)).unwrap();
        wait_for_state(&deployments, "demo", LifecycleState::Failed).await;

        // Only the attempt's own tag goes, never the image the live
        // container runs.
        assert_eq!(
            *discarded.lock().unwrap(),
            vec![Some(BuildArtifact::Image {
                tag: "desplegar-demo:build-attempt".into(),
                container_port: 80,
            })]
        );
        assert!(runtime.stopped().is_empty());
        assert_eq!(runtime.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_compose_build_tears_project_down() {
        let plan = BuildArtifact::Compose {
            project_dir: PathBuf::from("/proyectos/demo"),
            compose_file: PathBuf::from("/proyectos/demo/compose.yml"),
        };
        let builder = FakeBuilder::failing(DeployError::Build {
            reason: "docker compose build exited with exit status: 1".into(),
            output: String::new(),
        })
        .with_plan(plan.clone());
        let discarded = builder.discarded();
        let deployments = deployments(
            FakeFetcher::default(),
            builder,
            Arc::new(FakeRuntime::default()),
        );

        deployments.start("demo", LINK, port(8080)).unwrap();
        wait_for_state(&deployments, "demo", LifecycleState::Failed).await;

        assert_eq!(*discarded.lock().unwrap(), vec![Some(plan)]);
    }

    #[tokio::test]
    async fn test_start_failure_discards_built_image() {
        let builder = FakeBuilder::default();
        let discarded = builder.discarded();
        let runtime = Arc::new(FakeRuntime::failing_run(DeployError::Runtime(
            "container exited".into(),
        )));
        let deployments = deployments(FakeFetcher::default(), builder, runtime);

        deployments.start("demo", LINK, port(8080)).unwrap();
        wait_for_state(&deployments, "demo", LifecycleState::Failed).await;

        assert_eq!(
            *discarded.lock().unwrap(),
            vec![Some(BuildArtifact::Image {
                tag: "desplegar-demo:latest".into(),
                container_port: 80,
            })]
        );
    }

    #[tokio::test]
    async fn test_start_failure_removes_containers() {
        let runtime = Arc::new(FakeRuntime::failing_run(DeployError::PortInUse {
            port: 8080,
            details: "published by web".into(),
        }));
        let deployments = deployments(FakeFetcher::default(), FakeBuilder::default(), runtime.clone());

        deployments.start("demo", LINK, port(8080)).unwrap();
        wait_for_state(&deployments, "demo", LifecycleState::Failed).await;

        let (record, _) = deployments.logs("demo").unwrap();
        assert_eq!(record.error.unwrap().kind, "PortInUseError");
        assert!(runtime.stopped().contains(&"demo".to_string()));
    }

    #[tokio::test]
    async fn test_status_without_record_shows_live_containers() {
        let runtime = Arc::new(FakeRuntime::default());
        runtime.add_running("legacy", "c1", 9000);
        let deployments = deployments(FakeFetcher::default(), FakeBuilder::default(), runtime);

        let report = deployments.status("legacy").await.unwrap();
        assert!(report.state.is_none());
        assert_eq!(report.containers.len(), 1);
    }

    #[tokio::test]
    async fn test_status_surfaces_runtime_outage() {
        let runtime = Arc::new(FakeRuntime::default());
        runtime.set_unavailable(true);
        let deployments = deployments(FakeFetcher::default(), FakeBuilder::default(), runtime);
        assert!(matches!(
            deployments.status("demo").await,
            Err(DeployError::Runtime(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_cancels_everything() {
        let deployments = deployments(
            FakeFetcher::slow(Duration::from_secs(30)),
            FakeBuilder::default(),
            Arc::new(FakeRuntime::default()),
        );
        deployments.start("one", LINK, port(8080)).unwrap();
        deployments.start("two", LINK, port(8081)).unwrap();

        deployments.shutdown(Duration::from_secs(5)).await;
        assert_eq!(deployments.active(), 0);
        for name in ["one", "two"] {
            let (record, _) = deployments.logs(name).unwrap();
            assert_eq!(record.state, LifecycleState::Failed);
        }
    }
}
