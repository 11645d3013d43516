//! Compose projects pulled from a repository are adjusted before they are
//! built: published ports are pointed at the requested host port, bind
//! mounts are dropped so they cannot shadow the built sources, and every
//! service is labelled so the supervisor can find its containers.

use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};

use crate::deploy::project::{HostPort, ProjectName};
use crate::service::snapshot::PROJECT_LABEL;

/// File names `docker compose` looks for, in its own preference order.
pub const COMPOSE_FILES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Compose file has no services")]
    NoServices,
}

pub fn find_compose_file(dir: &Path) -> Option<PathBuf> {
    COMPOSE_FILES
        .iter()
        .map(|f| dir.join(f))
        .find(|p| p.is_file())
}

/// Rewrites the compose file at `path` in place.
pub async fn prepare_compose_file(
    path: &Path,
    name: &ProjectName,
    host_port: HostPort,
) -> Result<(), ComposeError> {
    let source = tokio::fs::read_to_string(path).await?;
    let rewritten = rewrite_compose(&source, name, host_port)?;
    tokio::fs::write(path, rewritten).await?;
    Ok(())
}

pub fn rewrite_compose(
    source: &str,
    name: &ProjectName,
    host_port: HostPort,
) -> Result<String, ComposeError> {
    let mut document: Value = serde_yaml::from_str(source)?;
    let services = document
        .get_mut("services")
        .and_then(Value::as_mapping_mut)
        .ok_or(ComposeError::NoServices)?;

    for (_, service) in services.iter_mut() {
        let Some(service) = service.as_mapping_mut() else {
            continue;
        };
        if let Some(ports) = service.get_mut("ports").and_then(Value::as_sequence_mut) {
            for port in ports.iter_mut() {
                republish(port, host_port);
            }
        }
        service.remove("volumes");
        add_project_label(service, name);
    }

    Ok(serde_yaml::to_string(&document)?)
}

fn republish(port: &mut Value, host_port: HostPort) {
    match port {
        // "8000:80", "127.0.0.1:8000:80/udp". Bare "80" publishes nothing
        // predictable and is left alone.
        Value::String(spec) => {
            if let Some((_, container)) = spec.rsplit_once(':') {
                let republished = format!("{host_port}:{container}");
                *spec = republished;
            }
        }
        // Long syntax: { target: 80, published: 8000, protocol: tcp }
        Value::Mapping(long) => {
            if long.contains_key("target") {
                long.insert("published".into(), Value::from(host_port.get()));
            }
        }
        _ => {}
    }
}

fn add_project_label(service: &mut Mapping, name: &ProjectName) {
    match service.get_mut("labels") {
        Some(Value::Mapping(labels)) => {
            labels.insert(PROJECT_LABEL.into(), name.as_str().into());
        }
        Some(Value::Sequence(labels)) => {
            let prefix = format!("{PROJECT_LABEL}=");
            labels.retain(|l| !l.as_str().is_some_and(|l| l.starts_with(&prefix)));
            labels.push(format!("{prefix}{name}").into());
        }
        _ => {
            let mut labels = Mapping::new();
            labels.insert(PROJECT_LABEL.into(), name.as_str().into());
            service.insert("labels".into(), Value::Mapping(labels));
        }
    }
}
