//! Well-known `com.docker.compose.*` label keys.
//!
//! The engine driver finds everything it owns through these, so values
//! must match what the docker compose CLI writes.

use std::collections::BTreeMap;

use super::Project;

pub const PROJECT: &str = "com.docker.compose.project";
pub const SERVICE: &str = "com.docker.compose.service";
pub const VERSION: &str = "com.docker.compose.version";
pub const WORKING_DIR: &str = "com.docker.compose.project.working_dir";
pub const CONFIG_FILES: &str = "com.docker.compose.project.config_files";
pub const ENVIRONMENT_FILE: &str = "com.docker.compose.project.environment_file";
pub const ONEOFF: &str = "com.docker.compose.oneoff";
pub const CONTAINER_NUMBER: &str = "com.docker.compose.container-number";
pub const CONFIG_HASH: &str = "com.docker.compose.config-hash";
pub const NETWORK: &str = "com.docker.compose.network";
pub const VOLUME: &str = "com.docker.compose.volume";

/// Version written to the version label.
pub const COMPOSE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Attach the standard labels to every service of the project.
///
/// `oneoff` is always `False`; the environment file label is only set
/// when the project was loaded with one.
pub fn inject(project: &mut Project) {
    let config_files = project
        .compose_files
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(",");
    let working_dir = project.working_dir.display().to_string();
    let env_file = project.env_file.as_ref().map(|p| p.display().to_string());

    for service in project.services.iter_mut() {
        let mut labels = BTreeMap::new();
        labels.insert(PROJECT.to_string(), project.name.clone());
        labels.insert(SERVICE.to_string(), service.name.clone());
        labels.insert(VERSION.to_string(), COMPOSE_VERSION.to_string());
        labels.insert(WORKING_DIR.to_string(), working_dir.clone());
        labels.insert(CONFIG_FILES.to_string(), config_files.clone());
        labels.insert(ONEOFF.to_string(), "False".to_string());
        if let Some(env_file) = &env_file {
            labels.insert(ENVIRONMENT_FILE.to_string(), env_file.clone());
        }
        service.custom_labels = labels;
    }
}

/// `key=value` filter selecting objects of one project.
pub fn project_filter(project_name: &str) -> String {
    format!("{}={}", PROJECT, project_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::ServiceConfig;
    use std::collections::{BTreeMap, HashMap};
    use std::path::PathBuf;

    fn project(env_file: Option<PathBuf>) -> Project {
        Project {
            name: "wp".to_string(),
            working_dir: PathBuf::from("/srv/wp"),
            compose_files: vec![
                PathBuf::from("/srv/wp/docker-compose.yml"),
                PathBuf::from("/srv/wp/docker-compose.override.yml"),
            ],
            env_file,
            environment: HashMap::new(),
            services: vec![
                ServiceConfig {
                    name: "db".to_string(),
                    ..Default::default()
                },
                ServiceConfig {
                    name: "wordpress".to_string(),
                    ..Default::default()
                },
            ],
            networks: BTreeMap::new(),
            volumes: BTreeMap::new(),
            disabled_services: Vec::new(),
        }
    }

    #[test]
    fn inject_sets_fixed_keys() {
        let mut p = project(None);
        inject(&mut p);

        let labels = &p.services[1].custom_labels;
        assert_eq!(labels.len(), 6);
        assert_eq!(labels[PROJECT], "wp");
        assert_eq!(labels[SERVICE], "wordpress");
        assert_eq!(labels[WORKING_DIR], "/srv/wp");
        assert_eq!(
            labels[CONFIG_FILES],
            "/srv/wp/docker-compose.yml,/srv/wp/docker-compose.override.yml"
        );
        assert_eq!(labels[ONEOFF], "False");
        assert!(!labels.contains_key(ENVIRONMENT_FILE));
    }

    #[test]
    fn inject_adds_env_file_when_present() {
        let mut p = project(Some(PathBuf::from("/srv/wp/.env")));
        inject(&mut p);
        for service in &p.services {
            assert_eq!(service.custom_labels[ENVIRONMENT_FILE], "/srv/wp/.env");
        }
    }
}
