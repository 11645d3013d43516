use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use tokio::process::Command;

use crate::deploy::{
    error::{DeployError, Step},
    project::{ProjectName, RepoLink},
};
use crate::service::process::{run_captured, CapturedOutput, RunError};

/// Lines of git output quoted back in a fetch failure.
const REASON_LINES: usize = 5;

#[async_trait]
pub trait RepositoryFetcher: Send + Sync {
    /// Clones `link` into a clean, project scoped directory and returns it.
    async fn fetch(
        &self,
        name: &ProjectName,
        link: &RepoLink,
        output: &CapturedOutput,
    ) -> Result<PathBuf, DeployError>;

    /// Removes the working directory of `name`, if any.
    async fn discard(&self, name: &ProjectName);
}

pub struct GitFetcher {
    projects_dir: PathBuf,
    timeout: Duration,
}

impl GitFetcher {
    pub fn new(projects_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            projects_dir: projects_dir.into(),
            timeout,
        }
    }

    pub fn workdir(&self, name: &ProjectName) -> PathBuf {
        self.projects_dir.join(name.as_str())
    }
}

async fn remove_dir(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[async_trait]
impl RepositoryFetcher for GitFetcher {
    async fn fetch(
        &self,
        name: &ProjectName,
        link: &RepoLink,
        output: &CapturedOutput,
    ) -> Result<PathBuf, DeployError> {
        let workdir = self.workdir(name);
        tokio::fs::create_dir_all(&self.projects_dir).await?;
        // Every deploy builds from a fresh clone, never from leftovers.
        remove_dir(&workdir).await?;

        log::info!("Cloning {link} into {workdir:?}");
        let mut command = Command::new("git");
        command
            .arg("clone")
            .args(["--depth", "1"])
            .arg("--")
            .arg(link.as_str())
            .arg(&workdir)
            .env("GIT_TERMINAL_PROMPT", "0");

        let result = run_captured(command, self.timeout, output).await;
        let error = match result {
            Ok(status) if status.success() => {
                log::info!("Repository for {name} cloned");
                return Ok(workdir);
            }
            Ok(status) => {
                let reason = output.tail(REASON_LINES);
                DeployError::Fetch(if reason.is_empty() {
                    format!("git clone exited with {status}")
                } else {
                    reason
                })
            }
            Err(RunError::TimedOut { .. }) => DeployError::Timeout {
                step: Step::Fetch,
                seconds: self.timeout.as_secs(),
            },
            Err(e) => DeployError::Fetch(e.to_string()),
        };

        log::error!("Fetching {link} for {name} failed: {error}");
        self.discard(name).await;
        Err(error)
    }

    async fn discard(&self, name: &ProjectName) {
        let workdir = self.workdir(name);
        if let Err(e) = remove_dir(&workdir).await {
            log::warn!("Failed to remove {workdir:?}: {e}");
        }
    }
}
