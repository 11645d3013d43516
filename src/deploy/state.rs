use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::deploy::{
    error::DeployError,
    project::{HostPort, ProjectName, RepoLink},
};
use crate::service::process::CapturedOutput;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Pending,
    Building,
    Starting,
    Running,
    Failed,
    Stopped,
}

impl LifecycleState {
    /// An attempt in a terminal state no longer blocks a new deploy.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Running | Self::Failed | Self::Stopped)
    }

    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Pending, Building)
                | (Pending, Failed)
                | (Building, Starting)
                | (Building, Failed)
                | (Starting, Running)
                | (Starting, Failed)
                | (Running, Stopped)
        )
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Building => "building",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        })
    }
}

/// Terminal error of a failed attempt, as sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordedError {
    pub kind: &'static str,
    pub message: String,
}

impl From<&DeployError> for RecordedError {
    fn from(e: &DeployError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

/// One deployment attempt of a project.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentRecord {
    pub id: Uuid,
    pub project: ProjectName,
    #[serde(skip)]
    pub link: RepoLink,
    pub host_port: HostPort,
    pub state: LifecycleState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<RecordedError>,
    pub container_ids: Vec<String>,
    #[serde(skip)]
    pub output: CapturedOutput,
}

impl DeploymentRecord {
    pub fn new(project: ProjectName, link: RepoLink, host_port: HostPort, capture_lines: usize) -> Self {
        Self {
            id: Uuid::now_v7(),
            project,
            link,
            host_port,
            state: LifecycleState::Pending,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
            container_ids: Vec::new(),
            output: CapturedOutput::new(capture_lines),
        }
    }

    pub fn is_active(&self) -> bool {
        !self.state.is_terminal()
    }

    /// Moves to `next` if the lifecycle allows it. Rejected moves are
    /// logged and leave the record untouched.
    pub fn transition(&mut self, next: LifecycleState) -> bool {
        if !self.state.can_transition_to(next) {
            log::warn!(
                "Ignoring transition of {} from {} to {next}",
                self.project,
                self.state
            );
            return false;
        }
        log::info!("Deployment {} of {}: {} -> {next}", self.id, self.project, self.state);
        self.state = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        true
    }

    pub fn fail(&mut self, error: &DeployError) -> bool {
        if !self.transition(LifecycleState::Failed) {
            return false;
        }
        self.error = Some(error.into());
        true
    }

    pub fn owns(&self, container_id: &str) -> bool {
        self.container_ids.iter().any(|id| id == container_id)
    }
}
