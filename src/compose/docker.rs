use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{
    ContainerStateStatusEnum, ContainerSummary, EventMessage, HealthStatusEnum,
};
use bollard::network::{ConnectNetworkOptions, CreateNetworkOptions, InspectNetworkOptions};
use bollard::system::EventsOptions as EngineEventsOptions;
use bollard::volume::{CreateVolumeOptions, RemoveVolumeOptions};
use bollard::Docker;
use chrono::{TimeZone, Utc};
use eyre::{bail, eyre, Result, WrapErr};
use futures::stream::StreamExt;
use log::{debug, error, info, warn};

use super::convert::{config_hash, container_config, container_name, pull_reference};
use super::{
    stacks_from_containers, Compose, CreateOptions, Event, EventsOptions, ListOptions,
    PullOptions, Recreate, RemoveOptions, Stack, StartOptions, StopOptions,
};
use crate::io::{ProgressEvent, ProgressWriter};
use crate::project::{graph, labels, DependencyCondition, Project, ServiceConfig};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// [`Compose`] on top of the Docker Engine API.
#[derive(Clone)]
pub struct DockerCompose {
    docker: Docker,
    progress: ProgressWriter,
}

impl DockerCompose {
    pub fn new(docker: Docker, progress: ProgressWriter) -> Self {
        Self { docker, progress }
    }

    /// Connect through `DOCKER_HOST` or the local socket.
    pub fn connect_with_local_defaults(progress: ProgressWriter) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .wrap_err("cannot connect to the Docker daemon")?;
        Ok(Self::new(docker, progress))
    }

    async fn project_containers(
        &self,
        project: &str,
        service: Option<&str>,
        all: bool,
    ) -> Result<Vec<ContainerSummary>> {
        let mut label_filters = vec![labels::project_filter(project)];
        if let Some(service) = service {
            label_filters.push(format!("{}={}", labels::SERVICE, service));
        }
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), label_filters);

        let mut containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all,
                filters,
                ..Default::default()
            }))
            .await
            .wrap_err_with(|| format!("cannot list containers of project {}", project))?;
        containers.sort_by_key(|c| display_name(c));
        Ok(containers)
    }

    async fn ensure_networks(&self, project: &Project) -> Result<()> {
        for (key, network) in &project.networks {
            let name = project.network_name(key);
            let exists = match self
                .docker
                .inspect_network(&name, None::<InspectNetworkOptions<String>>)
                .await
            {
                Ok(_) => true,
                Err(e) if is_not_found(&e) => false,
                Err(e) => {
                    return Err(e).wrap_err_with(|| format!("cannot inspect network {}", name))
                }
            };
            if network.is_external() {
                if !exists {
                    bail!("network {} declared as external, but could not be found", name);
                }
                continue;
            }
            if exists {
                debug!("Network {} already exists", name);
                continue;
            }

            let mut network_labels = HashMap::new();
            network_labels.insert(labels::PROJECT.to_string(), project.name.clone());
            network_labels.insert(labels::NETWORK.to_string(), key.clone());
            network_labels.insert(labels::VERSION.to_string(), labels::COMPOSE_VERSION.to_string());

            self.progress.resource("Network", &name, "Creating").await;
            self.docker
                .create_network(CreateNetworkOptions {
                    name: name.clone(),
                    check_duplicate: true,
                    driver: network.driver.clone().unwrap_or_else(|| "bridge".to_string()),
                    internal: network.internal.unwrap_or(false),
                    labels: network_labels,
                    ..Default::default()
                })
                .await
                .wrap_err_with(|| format!("cannot create network {}", name))?;
            self.progress.resource("Network", &name, "Created").await;
        }
        Ok(())
    }

    async fn ensure_volumes(&self, project: &Project) -> Result<()> {
        for (key, volume) in &project.volumes {
            let name = project.volume_name(key);
            let exists = match self.docker.inspect_volume(&name).await {
                Ok(_) => true,
                Err(e) if is_not_found(&e) => false,
                Err(e) => return Err(e).wrap_err_with(|| format!("cannot inspect volume {}", name)),
            };
            if volume.is_external() {
                if !exists {
                    bail!("external volume {} not found", name);
                }
                continue;
            }
            if exists {
                continue;
            }

            let mut volume_labels = HashMap::new();
            volume_labels.insert(labels::PROJECT.to_string(), project.name.clone());
            volume_labels.insert(labels::VOLUME.to_string(), key.clone());
            volume_labels.insert(labels::VERSION.to_string(), labels::COMPOSE_VERSION.to_string());

            self.progress.resource("Volume", &name, "Creating").await;
            self.docker
                .create_volume(CreateVolumeOptions {
                    name: name.clone(),
                    driver: volume.driver.clone().unwrap_or_else(|| "local".to_string()),
                    labels: volume_labels,
                    ..Default::default()
                })
                .await
                .wrap_err_with(|| format!("cannot create volume {}", name))?;
            self.progress.resource("Volume", &name, "Created").await;
        }
        Ok(())
    }

    async fn create_service(
        &self,
        project: &Project,
        service: &ServiceConfig,
        options: &CreateOptions,
    ) -> Result<()> {
        let hash = config_hash(service)?;
        let image = service.image_name(&project.name);
        if options.pull_missing && !self.image_exists(&image).await? {
            self.pull_image(service, &image, false).await?;
        }

        for number in 1..=service.replicas() {
            let name = container_name(project, service, number);

            match self.docker.inspect_container(&name, None::<InspectContainerOptions>).await {
                Ok(existing) => {
                    let existing_hash = existing
                        .config
                        .and_then(|c| c.labels)
                        .and_then(|l| l.get(labels::CONFIG_HASH).cloned());
                    let keep = match options.recreate {
                        Recreate::Never => true,
                        Recreate::Diverged => existing_hash.as_deref() == Some(hash.as_str()),
                        Recreate::Force => false,
                    };
                    if keep {
                        self.progress.resource("Container", &name, "Running").await;
                        continue;
                    }
                    self.progress.resource("Container", &name, "Recreate").await;
                    self.docker
                        .remove_container(
                            &name,
                            Some(RemoveContainerOptions {
                                force: true,
                                ..Default::default()
                            }),
                        )
                        .await
                        .wrap_err_with(|| format!("cannot remove container {}", name))?;
                }
                Err(e) if is_not_found(&e) => {}
                Err(e) => {
                    return Err(e).wrap_err_with(|| format!("cannot inspect container {}", name))
                }
            }

            let config = container_config(project, service, number)?;
            self.progress.resource("Container", &name, "Creating").await;
            let created = self
                .docker
                .create_container(
                    Some(CreateContainerOptions {
                        name: name.clone(),
                        ..Default::default()
                    }),
                    config,
                )
                .await
                .wrap_err_with(|| format!("cannot create container {}", name))?;
            for warning in created.warnings {
                warn!("{}: {}", name, warning);
            }

            // The primary network is attached at creation time.
            for key in service.network_keys().iter().skip(1) {
                let mut aliases = vec![service.name.clone()];
                aliases.extend(service.network_aliases(key));
                let network = project.network_name(key);
                self.docker
                    .connect_network(
                        &network,
                        ConnectNetworkOptions {
                            container: name.clone(),
                            endpoint_config: bollard::models::EndpointSettings {
                                aliases: Some(aliases),
                                ..Default::default()
                            },
                        },
                    )
                    .await
                    .wrap_err_with(|| format!("cannot connect {} to network {}", name, network))?;
            }
            self.progress.resource("Container", &name, "Created").await;
        }
        Ok(())
    }

    async fn remove_orphans(&self, project: &Project) -> Result<()> {
        let known: HashSet<String> = project.service_names().into_iter().collect();
        for container in self.project_containers(&project.name, None, true).await? {
            let service = container
                .labels
                .as_ref()
                .and_then(|l| l.get(labels::SERVICE))
                .cloned()
                .unwrap_or_default();
            if known.contains(&service) {
                continue;
            }
            let name = display_name(&container);
            info!("Removing orphan container {}", name);
            self.progress.resource("Container", &name, "Removing").await;
            self.docker
                .remove_container(
                    container.id.as_deref().unwrap_or(&name),
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
                .wrap_err_with(|| format!("cannot remove orphan container {}", name))?;
            self.progress.resource("Container", &name, "Removed").await;
        }
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e).wrap_err_with(|| format!("cannot inspect image {}", image)),
        }
    }

    async fn pull_image(&self, service: &ServiceConfig, image: &str, quiet: bool) -> Result<()> {
        info!("Pulling image {} for service {}", image, service.name);
        self.progress.resource("Image", image, "Pulling").await;

        let (repository, tag) = pull_reference(image);
        let mut stream = Box::pin(self.docker.create_image(
            Some(CreateImageOptions {
                from_image: repository.to_string(),
                tag: tag.to_string(),
                ..Default::default()
            }),
            None,
            None,
        ));
        while let Some(item) = stream.next().await {
            let info = item.wrap_err_with(|| format!("cannot pull image {}", image))?;
            if let Some(err) = info.error {
                bail!("cannot pull image {}: {}", image, err);
            }
            if quiet {
                continue;
            }
            if let Some(status) = info.status {
                self.progress
                    .send(ProgressEvent::Pull {
                        service: service.name.clone(),
                        layer: info.id,
                        status,
                        progress: info.progress,
                    })
                    .await;
            }
        }

        self.progress.resource("Image", image, "Pulled").await;
        Ok(())
    }

    async fn container_status(
        &self,
        id: &str,
    ) -> Result<(ContainerStateStatusEnum, Option<HealthStatusEnum>, Option<i64>)> {
        let container = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .wrap_err_with(|| format!("cannot inspect container {}", id))?;
        let state = container.state.unwrap_or_default();
        let status = state.status.unwrap_or(ContainerStateStatusEnum::EMPTY);
        let health = state.health.and_then(|h| h.status);
        Ok((status, health, state.exit_code))
    }

    /// Block until every container of `service` satisfies `condition`.
    async fn wait_for(
        &self,
        project: &Project,
        service: &str,
        condition: DependencyCondition,
        timeout: Duration,
    ) -> Result<()> {
        let containers = self.project_containers(&project.name, Some(service), true).await?;
        let wait = async {
            for container in &containers {
                let name = display_name(container);
                let id = container.id.clone().unwrap_or_else(|| name.clone());
                loop {
                    let (status, health, exit_code) = self.container_status(&id).await?;
                    if is_satisfied(condition, &status, health.as_ref(), exit_code)? {
                        let label = match condition {
                            DependencyCondition::Healthy => "Healthy",
                            DependencyCondition::CompletedSuccessfully => "Exited",
                            DependencyCondition::Started => "Started",
                        };
                        self.progress.resource("Container", &name, label).await;
                        break;
                    }
                    if condition != DependencyCondition::CompletedSuccessfully
                        && matches!(
                            status,
                            ContainerStateStatusEnum::EXITED | ContainerStateStatusEnum::DEAD
                        )
                    {
                        bail!("container {} exited (code {})", name, exit_code.unwrap_or(-1));
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
            Ok::<(), eyre::Report>(())
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| eyre!("timed out waiting for service {}", service))?
    }
}

/// Whether a container state satisfies a dependency condition. A failed
/// one-shot container is an error, not an unmet condition.
fn is_satisfied(
    condition: DependencyCondition,
    status: &ContainerStateStatusEnum,
    health: Option<&HealthStatusEnum>,
    exit_code: Option<i64>,
) -> Result<bool> {
    Ok(match condition {
        DependencyCondition::Started => *status == ContainerStateStatusEnum::RUNNING,
        DependencyCondition::Healthy => match health {
            Some(HealthStatusEnum::HEALTHY) => true,
            Some(HealthStatusEnum::UNHEALTHY) => bail!("container is unhealthy"),
            Some(HealthStatusEnum::STARTING) => false,
            // No healthcheck: running is as good as it gets.
            _ => *status == ContainerStateStatusEnum::RUNNING,
        },
        DependencyCondition::CompletedSuccessfully => match status {
            ContainerStateStatusEnum::EXITED => match exit_code {
                Some(0) | None => true,
                Some(code) => bail!("container exited with code {}", code),
            },
            _ => false,
        },
    })
}

/// Services to start, dependencies first. Services scaled to zero have no
/// containers and are left out.
fn start_order(project: &Project) -> Result<Vec<&ServiceConfig>> {
    Ok(graph::dependency_order(project)?
        .iter()
        .filter_map(|name| project.service(name))
        .filter(|service| service.replicas() > 0)
        .collect())
}

/// Images to pull, each with the first service using it, and the images
/// skipped because of their `pull_policy`. Services without an image are
/// built, never pulled.
fn pull_plan(project: &Project) -> (Vec<(&ServiceConfig, &str)>, Vec<&str>) {
    let mut seen = HashSet::new();
    let mut pulls = Vec::new();
    let mut skipped = Vec::new();
    for service in &project.services {
        let Some(image) = service.image.as_deref() else {
            debug!("Service {} is built, not pulled", service.name);
            continue;
        };
        if matches!(service.pull_policy.as_deref(), Some("never") | Some("build")) {
            skipped.push(image);
            continue;
        }
        if seen.insert(image) {
            pulls.push((service, image));
        }
    }
    (pulls, skipped)
}

async fn pull_each<'a, F, Fut>(
    pulls: &[(&'a ServiceConfig, &'a str)],
    ignore_failures: bool,
    mut pull: F,
) -> Result<()>
where
    F: FnMut(&'a ServiceConfig, &'a str) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    for &(service, image) in pulls {
        if let Err(err) = pull(service, image).await {
            if !ignore_failures {
                return Err(err);
            }
            warn!("{:#}", err);
        }
    }
    Ok(())
}

/// Project networks `remove` deletes. External ones belong to someone else.
fn removable_networks(project: &Project) -> Vec<String> {
    project
        .networks
        .iter()
        .filter(|(_, network)| !network.is_external())
        .map(|(key, _)| project.network_name(key))
        .collect()
}

fn removable_volumes(project: &Project) -> Vec<String> {
    project
        .volumes
        .iter()
        .filter(|(_, volume)| !volume.is_external())
        .map(|(key, _)| project.volume_name(key))
        .collect()
}

fn wants_event(services: &[String], event: &Event) -> bool {
    services.is_empty() || services.contains(&event.service)
}

fn is_not_found(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn display_name(container: &ContainerSummary) -> String {
    container
        .names
        .as_ref()
        .and_then(|names| names.first())
        .map(|name| name.trim_start_matches('/').to_string())
        .or_else(|| container.id.clone())
        .unwrap_or_default()
}

fn event_from_message(message: EventMessage) -> Option<Event> {
    let action = message.action?;
    let attributes = message.actor?.attributes.unwrap_or_default();
    let timestamp = match (message.time_nano, message.time) {
        (Some(nanos), _) => Utc.timestamp_nanos(nanos),
        (None, Some(secs)) => Utc.timestamp_opt(secs, 0).single()?,
        (None, None) => Utc::now(),
    };
    Event::from_parts(timestamp, &action, &attributes)
}

#[async_trait]
impl Compose for DockerCompose {
    async fn list(&self, options: ListOptions) -> Result<Vec<Stack>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![labels::PROJECT.to_string()]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: options.all,
                filters,
                ..Default::default()
            }))
            .await
            .wrap_err("cannot list containers")?;
        Ok(stacks_from_containers(&containers))
    }

    async fn create(&self, project: &Project, options: CreateOptions) -> Result<()> {
        let order = graph::dependency_order(project)?;
        self.ensure_networks(project).await?;
        self.ensure_volumes(project).await?;
        if options.remove_orphans {
            self.remove_orphans(project).await?;
        }
        for name in order {
            if let Some(service) = project.service(&name) {
                self.create_service(project, service, &options).await?;
            }
        }
        Ok(())
    }

    async fn start(&self, project: &Project, options: StartOptions) -> Result<()> {
        for service in start_order(project)? {
            let name = service.name.as_str();
            for (dep, condition) in service.dependencies() {
                if condition != DependencyCondition::Started {
                    self.wait_for(project, &dep, condition, options.wait_timeout)
                        .await?;
                }
            }

            let containers = self.project_containers(&project.name, Some(name), true).await?;
            if containers.is_empty() {
                bail!("service {} has no container to start, create it first", name);
            }
            for container in containers {
                let container_name = display_name(&container);
                if container.state.as_deref() == Some("running") {
                    continue;
                }
                self.progress.resource("Container", &container_name, "Starting").await;
                self.docker
                    .start_container(
                        container.id.as_deref().unwrap_or(&container_name),
                        None::<StartContainerOptions<String>>,
                    )
                    .await
                    .wrap_err_with(|| format!("cannot start container {}", container_name))?;
                self.progress.resource("Container", &container_name, "Started").await;
            }
        }

        if options.wait {
            for name in project.service_names() {
                self.wait_for(project, &name, DependencyCondition::Healthy, options.wait_timeout)
                    .await?;
            }
        }
        Ok(())
    }

    async fn stop(&self, project: &Project, options: StopOptions) -> Result<()> {
        for name in graph::reverse_order(project)? {
            for container in self.project_containers(&project.name, Some(&name), false).await? {
                let container_name = display_name(&container);
                self.progress.resource("Container", &container_name, "Stopping").await;
                self.docker
                    .stop_container(
                        container.id.as_deref().unwrap_or(&container_name),
                        Some(StopContainerOptions {
                            t: options.timeout.as_secs() as i64,
                        }),
                    )
                    .await
                    .wrap_err_with(|| format!("cannot stop container {}", container_name))?;
                self.progress.resource("Container", &container_name, "Stopped").await;
            }
        }
        Ok(())
    }

    async fn remove(&self, project: &Project, options: RemoveOptions) -> Result<()> {
        let containers = self.project_containers(&project.name, None, true).await?;
        for container in containers {
            let container_name = display_name(&container);
            if !options.force && container.state.as_deref() == Some("running") {
                bail!("container {} is running, stop it first or force removal", container_name);
            }
            self.progress.resource("Container", &container_name, "Removing").await;
            self.docker
                .remove_container(
                    container.id.as_deref().unwrap_or(&container_name),
                    Some(RemoveContainerOptions {
                        force: options.force,
                        v: options.volumes,
                        ..Default::default()
                    }),
                )
                .await
                .wrap_err_with(|| format!("cannot remove container {}", container_name))?;
            self.progress.resource("Container", &container_name, "Removed").await;
        }

        for name in removable_networks(project) {
            match self.docker.remove_network(&name).await {
                Ok(()) => self.progress.resource("Network", &name, "Removed").await,
                Err(e) if is_not_found(&e) => debug!("Network {} already gone", name),
                Err(e) => return Err(e).wrap_err_with(|| format!("cannot remove network {}", name)),
            }
        }

        if options.volumes {
            for name in removable_volumes(project) {
                match self
                    .docker
                    .remove_volume(&name, Some(RemoveVolumeOptions { force: options.force }))
                    .await
                {
                    Ok(()) => self.progress.resource("Volume", &name, "Removed").await,
                    Err(e) if is_not_found(&e) => debug!("Volume {} already gone", name),
                    Err(e) => {
                        return Err(e).wrap_err_with(|| format!("cannot remove volume {}", name))
                    }
                }
            }
        }
        Ok(())
    }

    async fn pull(&self, project: &Project, options: PullOptions) -> Result<()> {
        let (pulls, skipped) = pull_plan(project);
        for image in skipped {
            self.progress.resource("Image", image, "Skipped").await;
        }
        let quiet = options.quiet;
        pull_each(&pulls, options.ignore_failures, move |service, image| {
            self.pull_image(service, image, quiet)
        })
        .await
    }

    async fn events(&self, project_name: &str, options: EventsOptions) -> Result<()> {
        let EventsOptions {
            services,
            mut consumer,
            shutdown,
        } = options;

        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        filters.insert("label".to_string(), vec![labels::project_filter(project_name)]);
        let mut stream = Box::pin(self.docker.events(Some(EngineEventsOptions::<String> {
            filters,
            ..Default::default()
        })));

        let mut shutdown = shutdown;
        loop {
            let next = match shutdown.as_mut() {
                Some(shutdown) => tokio::select! {
                    _ = shutdown.wait() => None,
                    item = stream.next() => item,
                },
                None => stream.next().await,
            };
            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    error!("Event stream of {} failed: {}", project_name, e);
                    return Err(e).wrap_err("event stream failed");
                }
                None => break,
            };
            if let Some(event) = event_from_message(message) {
                if !wants_event(&services, &event) {
                    continue;
                }
                consumer(event)?;
            }
        }
        debug!("Event stream of {} closed", project_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{ExternalConfig, NetworkConfig, VolumeConfig};
    use bollard::models::EventActor;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn service(name: &str, yaml: &str) -> ServiceConfig {
        let mut service: ServiceConfig = serde_yaml::from_str(yaml).unwrap();
        service.name = name.to_string();
        service
    }

    fn project(services: Vec<ServiceConfig>) -> Project {
        Project {
            name: "wp".to_string(),
            working_dir: PathBuf::from("/srv/wp"),
            compose_files: vec![PathBuf::from("/srv/wp/docker-compose.yml")],
            env_file: None,
            environment: HashMap::new(),
            services,
            networks: BTreeMap::new(),
            volumes: BTreeMap::new(),
            disabled_services: Vec::new(),
        }
    }

    #[test]
    fn services_scaled_to_zero_are_not_started() {
        let p = project(vec![
            service("db", "image: mysql\n"),
            service("worker", "image: app\nscale: 0\n"),
            service("web", "image: wordpress\ndepends_on: [db]\ndeploy:\n  replicas: 0\n"),
        ]);
        let names: Vec<&str> = start_order(&p)
            .unwrap()
            .into_iter()
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(names, vec!["db"]);
    }

    #[test]
    fn pull_plan_skips_and_dedupes() {
        let p = project(vec![
            service("app", "build: .\n"),
            service("cron", "image: wordpress:6\n"),
            service("db", "image: mysql:5.7\n"),
            service("local", "image: wp-local\npull_policy: never\n"),
            service("tool", "image: wp-tool\nbuild: ./tool\npull_policy: build\n"),
            service("web", "image: wordpress:6\n"),
        ]);
        let (pulls, skipped) = pull_plan(&p);
        let pulls: Vec<(&str, &str)> = pulls
            .into_iter()
            .map(|(service, image)| (service.name.as_str(), image))
            .collect();
        assert_eq!(pulls, vec![("cron", "wordpress:6"), ("db", "mysql:5.7")]);
        assert_eq!(skipped, vec!["wp-local", "wp-tool"]);
    }

    #[tokio::test]
    async fn pull_failures_stop_unless_ignored() {
        let p = project(vec![
            service("broken", "image: nope\n"),
            service("db", "image: mysql\n"),
        ]);
        let (pulls, _) = pull_plan(&p);
        let fail_on_nope = |_: &ServiceConfig, image: &str| {
            let result = if image == "nope" {
                Err(eyre!("cannot pull image {}", image))
            } else {
                Ok(())
            };
            async move { result }
        };

        let err = pull_each(&pulls, false, fail_on_nope).await.unwrap_err();
        assert_eq!(err.to_string(), "cannot pull image nope");

        let mut attempted = Vec::new();
        pull_each(&pulls, true, |service, image| {
            attempted.push(service.name.clone());
            fail_on_nope(service, image)
        })
        .await
        .unwrap();
        assert_eq!(attempted, vec!["broken", "db"]);
    }

    #[test]
    fn external_resources_are_not_removed() {
        let external = || Some(ExternalConfig::Bool(true));
        let mut p = project(Vec::new());
        p.networks.insert("default".to_string(), NetworkConfig::default());
        p.networks.insert(
            "proxy".to_string(),
            NetworkConfig {
                external: external(),
                ..Default::default()
            },
        );
        p.volumes.insert("db_data".to_string(), VolumeConfig::default());
        p.volumes.insert(
            "shared".to_string(),
            VolumeConfig {
                external: external(),
                ..Default::default()
            },
        );

        assert_eq!(removable_networks(&p), vec!["wp_default"]);
        assert_eq!(removable_volumes(&p), vec!["wp_db_data"]);
    }

    #[test]
    fn events_are_filtered_by_service() {
        let mut attributes = HashMap::new();
        attributes.insert(labels::SERVICE.to_string(), "db".to_string());
        let event = Event::from_parts(Utc::now(), "start", &attributes).unwrap();

        assert!(wants_event(&[], &event));
        assert!(wants_event(&["web".to_string(), "db".to_string()], &event));
        assert!(!wants_event(&["web".to_string()], &event));
    }

    #[test]
    fn messages_become_events() {
        let mut attributes = HashMap::new();
        attributes.insert("name".to_string(), "wp-wordpress-1".to_string());
        attributes.insert(labels::SERVICE.to_string(), "wordpress".to_string());
        let message = EventMessage {
            action: Some("die".to_string()),
            actor: Some(EventActor {
                id: Some("abc".to_string()),
                attributes: Some(attributes),
            }),
            time: Some(1_700_000_000),
            ..Default::default()
        };
        let event = event_from_message(message).unwrap();
        assert_eq!(event.status, "die");
        assert_eq!(event.service, "wordpress");
        assert_eq!(event.timestamp.timestamp(), 1_700_000_000);

        assert!(event_from_message(EventMessage::default()).is_none());
    }

    #[test]
    fn dependency_conditions() {
        use ContainerStateStatusEnum::*;
        use DependencyCondition::*;

        assert!(is_satisfied(Started, &RUNNING, None, None).unwrap());
        assert!(!is_satisfied(Started, &CREATED, None, None).unwrap());
        assert!(is_satisfied(Healthy, &RUNNING, None, None).unwrap());
        assert!(!is_satisfied(Healthy, &RUNNING, Some(&HealthStatusEnum::STARTING), None).unwrap());
        assert!(is_satisfied(Healthy, &RUNNING, Some(&HealthStatusEnum::HEALTHY), None).unwrap());
        assert!(is_satisfied(Healthy, &RUNNING, Some(&HealthStatusEnum::UNHEALTHY), None).is_err());
        assert!(is_satisfied(CompletedSuccessfully, &EXITED, None, Some(0)).unwrap());
        assert!(!is_satisfied(CompletedSuccessfully, &RUNNING, None, None).unwrap());
        assert!(is_satisfied(CompletedSuccessfully, &EXITED, None, Some(2)).is_err());
    }

    #[test]
    fn names_drop_the_leading_slash() {
        let container = ContainerSummary {
            id: Some("abc".to_string()),
            names: Some(vec!["/wp-db-1".to_string()]),
            ..Default::default()
        };
        assert_eq!(display_name(&container), "wp-db-1");
        let unnamed = ContainerSummary {
            id: Some("abc".to_string()),
            ..Default::default()
        };
        assert_eq!(display_name(&unnamed), "abc");
    }

    #[tokio::test]
    async fn progress_is_written_to_the_channel() {
        let (writer, mut rx) = ProgressWriter::new(8);
        writer.resource("Container", "wp-db-1", "Created").await;
        assert_eq!(
            rx.recv().await,
            Some(ProgressEvent::Resource {
                kind: "Container",
                name: "wp-db-1".to_string(),
                status: "Created".to_string(),
            })
        );
    }
}
