use std::{fmt, str::FromStr};

use serde::Serialize;
use url::Url;

use super::error::DeployError;

/// Docker container names are not limited to this, but image
/// repositories and directory names are happier with short names.
const MAX_NAME_LEN: usize = 63;

/// A user supplied project name reduced to `[a-z0-9-]`.
///
/// The sanitized form is used as container name, working directory
/// and image tag, so it must never contain path separators or
/// uppercase characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ProjectName(String);

impl ProjectName {
    pub fn sanitize(raw: &str) -> Result<Self, DeployError> {
        let mut name = String::with_capacity(raw.len());
        for c in raw.trim().chars() {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                name.push(c);
            } else if !name.is_empty() && !name.ends_with('-') {
                name.push('-');
            }
        }
        name.truncate(MAX_NAME_LEN);
        let name = name.trim_end_matches('-');
        if name.is_empty() {
            return Err(DeployError::InvalidRequest(format!(
                "project name {raw:?} contains no usable characters"
            )));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Repository every image of this project is tagged into.
    pub fn image_repository(&self) -> String {
        format!("desplegar-{}", self.0)
    }

    /// Tag of the image built for this project.
    pub fn image_tag(&self) -> String {
        format!("{}:latest", self.image_repository())
    }
}

impl fmt::Display for ProjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ProjectName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A host port in `1..=65535`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct HostPort(u16);

impl HostPort {
    pub fn get(self) -> u16 {
        self.0
    }
}

impl TryFrom<i64> for HostPort {
    type Error = DeployError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match u16::try_from(value) {
            Ok(port) if port != 0 => Ok(Self(port)),
            _ => Err(DeployError::InvalidRequest(format!(
                "port {value} is outside 1-65535"
            ))),
        }
    }
}

impl FromStr for HostPort {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: i64 = s
            .trim()
            .parse()
            .map_err(|_| DeployError::InvalidRequest(format!("port {s:?} is not a number")))?;
        Self::try_from(value)
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A repository location accepted by `git clone`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoLink(String);

const ALLOWED_SCHEMES: &[&str] = &["http", "https", "ssh", "git", "file"];

impl RepoLink {
    pub fn parse(raw: &str) -> Result<Self, DeployError> {
        let raw = raw.trim();
        // Anything starting with a dash would be read as a git option.
        if raw.is_empty() || raw.starts_with('-') {
            return Err(DeployError::Fetch(format!("invalid repository link {raw:?}")));
        }
        match Url::parse(raw) {
            Ok(url) if ALLOWED_SCHEMES.contains(&url.scheme()) => Ok(Self(raw.to_string())),
            Ok(url) => Err(DeployError::Fetch(format!(
                "unsupported repository scheme {:?}",
                url.scheme()
            ))),
            Err(_) if is_scp_like(raw) => Ok(Self(raw.to_string())),
            Err(e) => Err(DeployError::Fetch(format!(
                "invalid repository link {raw:?}: {e}"
            ))),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepoLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `user@host:path`, the short ssh form git understands.
fn is_scp_like(raw: &str) -> bool {
    let Some((user_host, path)) = raw.split_once(':') else {
        return false;
    };
    let Some((user, host)) = user_host.split_once('@') else {
        return false;
    };
    let valid = |s: &str| {
        !s.is_empty()
            && s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    };
    valid(user) && valid(host) && !path.is_empty() && !raw.contains(char::is_whitespace)
}
