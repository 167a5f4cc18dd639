//! Service dependency ordering.

use std::collections::HashSet;

use eyre::{bail, Result};

use super::Project;

/// Enabled services in start order: dependencies first, ties by name.
pub fn dependency_order(project: &Project) -> Result<Vec<String>> {
    let mut order = Vec::new();
    let mut visited = HashSet::new();
    let mut visiting = Vec::new();

    for name in project.service_names() {
        visit(project, &name, &mut visited, &mut visiting, &mut order)?;
    }

    Ok(order)
}

/// Stop and remove order.
pub fn reverse_order(project: &Project) -> Result<Vec<String>> {
    let mut order = dependency_order(project)?;
    order.reverse();
    Ok(order)
}

fn visit(
    project: &Project,
    service: &str,
    visited: &mut HashSet<String>,
    visiting: &mut Vec<String>,
    order: &mut Vec<String>,
) -> Result<()> {
    if visited.contains(service) {
        return Ok(());
    }
    if visiting.iter().any(|s| s == service) {
        visiting.push(service.to_string());
        bail!("dependency cycle detected: {}", visiting.join(" -> "));
    }

    // Dependencies outside the enabled set are not ours to start.
    let config = match project.service(service) {
        Some(config) => config,
        None => return Ok(()),
    };

    visiting.push(service.to_string());
    for (dep, _) in config.dependencies() {
        visit(project, &dep, visited, visiting, order)?;
    }
    visiting.pop();

    visited.insert(service.to_string());
    order.push(service.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{DependsOnConfig, ServiceConfig};
    use std::collections::{BTreeMap, HashMap};
    use std::path::PathBuf;

    fn project(services: &[(&str, &[&str])]) -> Project {
        Project {
            name: "test".to_string(),
            working_dir: PathBuf::from("/tmp"),
            compose_files: Vec::new(),
            env_file: None,
            environment: HashMap::new(),
            services: services
                .iter()
                .map(|(name, deps)| ServiceConfig {
                    name: name.to_string(),
                    image: Some("busybox".to_string()),
                    depends_on: if deps.is_empty() {
                        None
                    } else {
                        Some(DependsOnConfig::Array(
                            deps.iter().map(|d| d.to_string()).collect(),
                        ))
                    },
                    ..Default::default()
                })
                .collect(),
            networks: BTreeMap::new(),
            volumes: BTreeMap::new(),
            disabled_services: Vec::new(),
        }
    }

    #[test]
    fn dependencies_come_first() {
        let p = project(&[
            ("api", &["db"]),
            ("db", &[]),
            ("web", &["api", "cache"]),
            ("cache", &[]),
        ]);
        let order = dependency_order(&p).unwrap();
        assert_eq!(order, vec!["db", "api", "cache", "web"]);
        assert_eq!(reverse_order(&p).unwrap(), vec!["web", "cache", "api", "db"]);
    }

    #[test]
    fn cycle_is_reported_with_path() {
        let p = project(&[("a", &["b"]), ("b", &["c"]), ("c", &["a"])]);
        let err = dependency_order(&p).unwrap_err().to_string();
        assert_eq!(err, "dependency cycle detected: a -> b -> c -> a");
    }

    #[test]
    fn unknown_dependency_is_skipped() {
        let p = project(&[("web", &["gone"])]);
        assert_eq!(dependency_order(&p).unwrap(), vec!["web"]);
    }
}
