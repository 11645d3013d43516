use std::fmt;

use serde::Serialize;

/// The step of a deployment pipeline that exceeded its time limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    Fetch,
    Build,
    Start,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Fetch => "fetch",
            Self::Build => "build",
            Self::Start => "start",
        })
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DeployError {
    #[error("A deployment for {0} is already in progress")]
    Conflict(String),
    #[error("Unable to fetch repository: {0}")]
    Fetch(String),
    #[error("Build failed: {reason}")]
    Build { reason: String, output: String },
    #[error("The {step} step exceeded its time limit of {seconds}s")]
    Timeout { step: Step, seconds: u64 },
    #[error("Host port {port} is already in use: {details}")]
    PortInUse { port: u16, details: String },
    #[error("Container runtime failure: {0}")]
    Runtime(String),
    #[error("No project or container named {0}")]
    NotFound(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Deployment cancelled")]
    Cancelled,
}

impl DeployError {
    /// Stable name of the error class, sent to clients next to the message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Conflict(_) => "ConflictError",
            Self::Fetch(_) => "FetchError",
            Self::Build { .. } => "BuildError",
            Self::Timeout { .. } => "TimeoutError",
            Self::PortInUse { .. } => "PortInUseError",
            Self::Runtime(_) => "RuntimeError",
            Self::NotFound(_) => "NotFoundError",
            Self::InvalidRequest(_) => "InvalidRequestError",
            Self::Cancelled => "CancelledError",
        }
    }

    /// Captured tool output attached to the error, if any.
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::Build { output, .. } if !output.is_empty() => Some(output),
            _ => None,
        }
    }
}

impl From<bollard::errors::Error> for DeployError {
    fn from(e: bollard::errors::Error) -> Self {
        Self::Runtime(e.to_string())
    }
}

impl From<std::io::Error> for DeployError {
    fn from(e: std::io::Error) -> Self {
        Self::Runtime(e.to_string())
    }
}
