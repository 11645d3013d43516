//! Live views of managed containers.
//!
//! Snapshots are never stored. They are rebuilt from the runtime on every
//! `/status` and `/list` call and serialized with the same keys the docker
//! CLI uses for `docker ps --format json`, which is what the UI reads.

use std::collections::HashMap;

use bollard::models::ContainerSummary;
use serde::Serialize;

/// Label put on every container this service creates.
pub const PROJECT_LABEL: &str = "desplegar.project";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerSnapshot {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Names")]
    pub names: String,
    #[serde(rename = "Image")]
    pub image: String,
    #[serde(rename = "State")]
    pub state: String,
    /// Native runtime text such as `Up 2 minutes`. Clients match on it,
    /// so it is passed through untouched.
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "Ports")]
    pub ports: String,
    #[serde(skip)]
    pub project: Option<String>,
    /// Host ports the container publishes.
    #[serde(skip)]
    pub published: Vec<u16>,
}

impl ContainerSnapshot {
    pub fn from_summary(summary: ContainerSummary) -> Self {
        let ports = summary
            .ports
            .unwrap_or_default()
            .into_iter()
            .map(|p| PublishedPort {
                ip: p.ip,
                private_port: p.private_port,
                public_port: p.public_port,
                protocol: p.typ.map(|t| t.to_string()),
            })
            .collect::<Vec<_>>();
        let mut published: Vec<u16> = ports.iter().filter_map(|p| p.public_port).collect();
        published.sort_unstable();
        published.dedup();

        let names = summary
            .names
            .unwrap_or_default()
            .iter()
            .map(|n| n.trim_start_matches('/').to_string())
            .collect::<Vec<_>>()
            .join(",");

        Self {
            id: summary.id.unwrap_or_default(),
            names,
            image: summary.image.unwrap_or_default(),
            state: summary.state.map(|s| s.to_string()).unwrap_or_default(),
            status: summary.status.unwrap_or_default(),
            ports: format_ports(&ports),
            project: project_label(summary.labels.as_ref()),
            published,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status.starts_with("Up")
    }

    pub fn has_name(&self, name: &str) -> bool {
        self.names.split(',').any(|n| n == name)
    }

    pub fn host_port(&self) -> Option<u16> {
        extract_host_port(&self.ports)
    }
}

fn project_label(labels: Option<&HashMap<String, String>>) -> Option<String> {
    labels.and_then(|l| l.get(PROJECT_LABEL)).cloned()
}

/// One entry of a container's port table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedPort {
    pub ip: Option<String>,
    pub private_port: u16,
    pub public_port: Option<u16>,
    pub protocol: Option<String>,
}

impl PublishedPort {
    fn render(&self) -> String {
        let protocol = match self.protocol.as_deref() {
            Some(p) if !p.is_empty() => p,
            _ => "tcp",
        };
        match self.public_port {
            Some(public) => {
                let ip = match self.ip.as_deref() {
                    None | Some("") => String::new(),
                    Some(ip) if ip.contains(':') => format!("[{ip}]:"),
                    Some(ip) => format!("{ip}:"),
                };
                format!("{ip}{public}->{}/{protocol}", self.private_port)
            }
            None => format!("{}/{protocol}", self.private_port),
        }
    }
}

/// Renders a port table the way `docker ps` prints it, e.g.
/// `0.0.0.0:8080->80/tcp, [::]:8080->80/tcp`.
pub fn format_ports(ports: &[PublishedPort]) -> String {
    let mut rendered: Vec<String> = Vec::with_capacity(ports.len());
    for port in ports {
        let entry = port.render();
        if !rendered.contains(&entry) {
            rendered.push(entry);
        }
    }
    rendered.join(", ")
}

/// Extracts the first published host port from a `Ports` string.
///
/// Looks for `<hostPort>->` where the digits follow a `:` or start an
/// entry. Returns `None` when nothing is published.
pub fn extract_host_port(ports: &str) -> Option<u16> {
    let bytes = ports.as_bytes();
    let mut search_from = 0;
    while let Some(offset) = ports[search_from..].find("->") {
        let arrow = search_from + offset;
        let mut start = arrow;
        while start > 0 && bytes[start - 1].is_ascii_digit() {
            start -= 1;
        }
        let preceded_ok = start == 0 || matches!(bytes[start - 1], b':' | b' ' | b',');
        if start < arrow && preceded_ok {
            if let Ok(port) = ports[start..arrow].parse::<u16>() {
                return Some(port);
            }
        }
        search_from = arrow + 2;
    }
    None
}
