mod convert;
mod docker;
pub mod proxy;

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Display};
use std::time::Duration;

use async_trait::async_trait;
use bollard::models::ContainerSummary;
use chrono::{DateTime, Utc};
use eyre::Result;
use serde::Serialize;

use crate::io::Shutdown;
use crate::project::{labels, Project};

pub use convert::{container_config, container_name, parse_duration, parse_port, PortMapping};
pub use docker::DockerCompose;
pub use proxy::ServiceProxy;

/// Lifecycle operations on a compose project.
#[async_trait]
pub trait Compose: Send + Sync {
    async fn list(&self, options: ListOptions) -> Result<Vec<Stack>>;
    async fn create(&self, project: &Project, options: CreateOptions) -> Result<()>;
    async fn start(&self, project: &Project, options: StartOptions) -> Result<()>;
    async fn stop(&self, project: &Project, options: StopOptions) -> Result<()>;
    async fn remove(&self, project: &Project, options: RemoveOptions) -> Result<()>;
    async fn pull(&self, project: &Project, options: PullOptions) -> Result<()>;
    async fn events(&self, project_name: &str, options: EventsOptions) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ListOptions {
    /// Include stacks without running containers.
    pub all: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Recreate {
    Never,
    #[default]
    Diverged,
    Force,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CreateOptions {
    pub recreate: Recreate,
    pub remove_orphans: bool,
    /// Pull images that are not present locally before creating.
    pub pull_missing: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct StartOptions {
    /// Block until every container is running, and healthy when it has
    /// a healthcheck.
    pub wait: bool,
    pub wait_timeout: Duration,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            wait: true,
            wait_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StopOptions {
    pub timeout: Duration,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RemoveOptions {
    pub force: bool,
    pub volumes: bool,
}

impl Default for RemoveOptions {
    fn default() -> Self {
        Self {
            force: true,
            volumes: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PullOptions {
    pub ignore_failures: bool,
    pub quiet: bool,
}

pub type EventConsumer = Box<dyn FnMut(Event) -> Result<()> + Send>;

pub struct EventsOptions {
    /// Only report these services; empty means all.
    pub services: Vec<String>,
    pub consumer: EventConsumer,
    pub shutdown: Option<Shutdown>,
}

impl EventsOptions {
    pub fn new(consumer: impl FnMut(Event) -> Result<()> + Send + 'static) -> Self {
        Self {
            services: Vec::new(),
            consumer: Box::new(consumer),
            shutdown: None,
        }
    }

    pub fn with_shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn with_services(mut self, services: Vec<String>) -> Self {
        self.services = services;
        self
    }
}

/// A compose project as seen by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stack {
    pub id: String,
    pub name: String,
    pub status: String,
    pub config_files: String,
}

impl Display for Stack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ID:{} Name:{} Status:{} ConfigFiles:{}}}",
            self.id, self.name, self.status, self.config_files
        )
    }
}

/// Group labelled containers into stacks, sorted by name. The status is a
/// summary such as `exited(1), running(2)`.
pub fn stacks_from_containers(containers: &[ContainerSummary]) -> Vec<Stack> {
    let mut projects: BTreeMap<String, (BTreeMap<String, usize>, String)> = BTreeMap::new();

    for container in containers {
        let labels = match &container.labels {
            Some(labels) => labels,
            None => continue,
        };
        let project = match labels.get(labels::PROJECT) {
            Some(project) => project,
            None => continue,
        };
        let entry = projects.entry(project.clone()).or_default();
        let state = container.state.clone().unwrap_or_else(|| "unknown".to_string());
        *entry.0.entry(state).or_default() += 1;
        if entry.1.is_empty() {
            if let Some(files) = labels.get(labels::CONFIG_FILES) {
                entry.1 = files.clone();
            }
        }
    }

    projects
        .into_iter()
        .map(|(name, (states, config_files))| Stack {
            id: name.clone(),
            name,
            status: states
                .iter()
                .map(|(state, count)| format!("{}({})", state, count))
                .collect::<Vec<_>>()
                .join(", "),
            config_files,
        })
        .collect()
}

/// A container lifecycle event of a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub container: String,
    pub service: String,
    pub status: String,
    pub attributes: BTreeMap<String, String>,
}

impl Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} container {} {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.6f"),
            self.status,
            self.container
        )?;
        let attrs = self
            .attributes
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>();
        if !attrs.is_empty() {
            write!(f, " ({})", attrs.join(", "))?;
        }
        Ok(())
    }
}

impl Event {
    /// Build from the engine's actor attributes. Compose labels are kept
    /// out of the attribute list; the rest is reported as is.
    pub fn from_parts(
        timestamp: DateTime<Utc>,
        action: &str,
        attributes: &HashMap<String, String>,
    ) -> Option<Event> {
        let service = attributes.get(labels::SERVICE)?.clone();
        let container = attributes.get("name").cloned().unwrap_or_default();
        let attributes = attributes
            .iter()
            .filter(|(k, _)| !k.starts_with("com.docker.compose."))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Some(Event {
            timestamp,
            container,
            service,
            status: action.to_string(),
            attributes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn container(project: Option<&str>, state: &str) -> ContainerSummary {
        let mut labels = HashMap::new();
        if let Some(project) = project {
            labels.insert(labels::PROJECT.to_string(), project.to_string());
            labels.insert(
                labels::CONFIG_FILES.to_string(),
                format!("/srv/{}/docker-compose.yml", project),
            );
        }
        ContainerSummary {
            labels: Some(labels),
            state: Some(state.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn stacks_are_grouped_by_project() {
        let stacks = stacks_from_containers(&[
            container(Some("wp"), "running"),
            container(Some("blog"), "exited"),
            container(Some("wp"), "exited"),
            container(Some("wp"), "running"),
            container(None, "running"),
        ]);

        assert_eq!(stacks.len(), 2);
        assert_eq!(stacks[0].name, "blog");
        assert_eq!(stacks[0].status, "exited(1)");
        assert_eq!(stacks[1].name, "wp");
        assert_eq!(stacks[1].status, "exited(1), running(2)");
        assert_eq!(stacks[1].config_files, "/srv/wp/docker-compose.yml");
        assert_eq!(
            stacks[1].to_string(),
            "{ID:wp Name:wp Status:exited(1), running(2) ConfigFiles:/srv/wp/docker-compose.yml}"
        );
    }

    #[test]
    fn events_need_a_service_label() {
        let ts = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut attrs = HashMap::new();
        attrs.insert("name".to_string(), "wp-db-1".to_string());
        attrs.insert("image".to_string(), "mysql:5.7".to_string());
        assert!(Event::from_parts(ts, "start", &attrs).is_none());

        attrs.insert(labels::SERVICE.to_string(), "db".to_string());
        attrs.insert(labels::PROJECT.to_string(), "wp".to_string());
        let event = Event::from_parts(ts, "start", &attrs).unwrap();
        assert_eq!(event.service, "db");
        assert_eq!(event.container, "wp-db-1");
        assert_eq!(
            event.to_string(),
            "2023-11-14 22:13:20.000000 container start wp-db-1 (image=mysql:5.7, name=wp-db-1)"
        );
    }
}
