//! Compose project model.
//!
//! The YAML side is deserialized into these types after interpolation and
//! merging (see [`loader`]). Only the keys the engine driver understands
//! are modelled; anything else in the file is ignored.

pub mod graph;
pub mod labels;
pub mod loader;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};

pub use loader::{load_project, ProjectOptions};

/// A loaded and resolved compose project.
#[derive(Debug, Clone, Serialize)]
pub struct Project {
    pub name: String,
    pub working_dir: PathBuf,
    pub compose_files: Vec<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_file: Option<PathBuf>,
    #[serde(skip)]
    pub environment: HashMap<String, String>,
    pub services: Vec<ServiceConfig>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub networks: BTreeMap<String, NetworkConfig>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub volumes: BTreeMap<String, VolumeConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub disabled_services: Vec<ServiceConfig>,
}

impl Project {
    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.iter().map(|s| s.name.clone()).collect()
    }

    /// Engine name of a top-level network key.
    pub fn network_name(&self, key: &str) -> String {
        match self.networks.get(key) {
            Some(NetworkConfig {
                name: Some(name), ..
            }) => name.clone(),
            Some(net) if net.is_external() => key.to_string(),
            _ => format!("{}_{}", self.name, key),
        }
    }

    /// Engine name of a top-level volume key.
    pub fn volume_name(&self, key: &str) -> String {
        match self.volumes.get(key) {
            Some(VolumeConfig {
                name: Some(name), ..
            }) => name.clone(),
            Some(vol) if vol.is_external() => key.to_string(),
            _ => format!("{}_{}", self.name, key),
        }
    }

    /// Drop top-level networks and volumes that no enabled service uses.
    pub fn without_unnecessary_resources(&mut self) {
        let mut used_networks = Vec::new();
        let mut used_volumes = Vec::new();
        for service in &self.services {
            used_networks.extend(service.network_keys());
            used_volumes.extend(service.named_volume_sources());
        }
        self.networks.retain(|key, _| used_networks.contains(key));
        self.volumes.retain(|key, _| used_volumes.contains(key));
    }
}

/// One entry of `services:`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(skip_deserializing)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<CommandConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvironmentConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_file: Option<EnvFileConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub expose: Vec<StringOrNumber>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeMount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networks: Option<NetworksConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<DependsOnConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthcheckConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<LabelsConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privileged: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy: Option<DeployConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub profiles: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_policy: Option<String>,
    /// Labels injected by the loader, never read from YAML.
    #[serde(skip_deserializing, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_labels: BTreeMap<String, String>,
}

impl ServiceConfig {
    pub fn replicas(&self) -> u32 {
        self.deploy
            .as_ref()
            .and_then(|d| d.replicas)
            .or(self.scale)
            .unwrap_or(1)
    }

    /// Image reference used for the service's containers.
    pub fn image_name(&self, project: &str) -> String {
        self.image
            .clone()
            .unwrap_or_else(|| format!("{}-{}", project, self.name))
    }

    /// Names of the services this one depends on, with their condition.
    pub fn dependencies(&self) -> Vec<(String, DependencyCondition)> {
        let mut deps: Vec<(String, DependencyCondition)> = match &self.depends_on {
            None => Vec::new(),
            Some(DependsOnConfig::Array(arr)) => arr
                .iter()
                .map(|d| (d.clone(), DependencyCondition::Started))
                .collect(),
            Some(DependsOnConfig::Map(map)) => map
                .iter()
                .map(|(d, c)| (d.clone(), DependencyCondition::from(c.condition.as_deref())))
                .collect(),
        };
        deps.sort_by(|a, b| a.0.cmp(&b.0));
        deps
    }

    pub fn uses_default_network(&self) -> bool {
        self.network_mode.is_none() && self.networks.is_none()
    }

    /// Top-level network keys this service attaches to.
    pub fn network_keys(&self) -> Vec<String> {
        if self.network_mode.is_some() {
            return Vec::new();
        }
        match &self.networks {
            None => vec!["default".to_string()],
            Some(NetworksConfig::Array(arr)) => arr.clone(),
            Some(NetworksConfig::Map(map)) => {
                let mut keys: Vec<String> = map.keys().cloned().collect();
                keys.sort();
                keys
            }
        }
    }

    /// Aliases requested for the service on a given network key.
    pub fn network_aliases(&self, key: &str) -> Vec<String> {
        match &self.networks {
            Some(NetworksConfig::Map(map)) => map
                .get(key)
                .and_then(|n| n.as_ref())
                .and_then(|n| n.aliases.clone())
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Volume mounts whose source is a named (top-level) volume.
    pub fn named_volume_sources(&self) -> Vec<String> {
        self.volumes
            .iter()
            .filter_map(|v| match v.parse() {
                Mount::Volume { source, .. } => Some(source),
                _ => None,
            })
            .collect()
    }

    /// Environment as `KEY=VALUE` pairs. Map entries without a value are
    /// looked up in `env`, and dropped when absent there too.
    pub fn environment_list(&self, env: &HashMap<String, String>) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = Vec::new();
        let mut push = |key: String, value: Option<String>| {
            let value = value.or_else(|| env.get(&key).cloned());
            if let Some(value) = value {
                out.retain(|(k, _)| *k != key);
                out.push((key, value));
            }
        };
        match &self.environment {
            None => {}
            Some(EnvironmentConfig::Array(arr)) => {
                for item in arr {
                    match item.split_once('=') {
                        Some((k, v)) => push(k.to_string(), Some(v.to_string())),
                        None => push(item.clone(), None),
                    }
                }
            }
            Some(EnvironmentConfig::Map(map)) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                for key in keys {
                    let value = map.get(key).cloned().flatten().map(|v| v.to_string());
                    push(key.clone(), value);
                }
            }
        }
        out
    }

    /// Labels declared in the file merged with the injected ones.
    pub fn all_labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        match &self.labels {
            None => {}
            Some(LabelsConfig::Array(arr)) => {
                for item in arr {
                    let (k, v) = item.split_once('=').unwrap_or((item.as_str(), ""));
                    labels.insert(k.to_string(), v.to_string());
                }
            }
            Some(LabelsConfig::Map(map)) => {
                for (k, v) in map {
                    labels.insert(k.clone(), v.to_string());
                }
            }
        }
        labels.extend(self.custom_labels.clone());
        labels
    }
}

/// Condition attached to a `depends_on` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyCondition {
    Started,
    Healthy,
    CompletedSuccessfully,
}

impl From<Option<&str>> for DependencyCondition {
    fn from(s: Option<&str>) -> Self {
        match s {
            Some("service_healthy") => DependencyCondition::Healthy,
            Some("service_completed_successfully") => DependencyCondition::CompletedSuccessfully,
            _ => DependencyCondition::Started,
        }
    }
}

/// YAML scalars that compose accepts as either strings or numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrNumber {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl std::fmt::Display for StringOrNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StringOrNumber::String(s) => write!(f, "{}", s),
            StringOrNumber::Int(i) => write!(f, "{}", i),
            StringOrNumber::Float(n) => write!(f, "{}", n),
            StringOrNumber::Bool(b) => write!(f, "{}", b),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BuildConfig {
    Simple(String),
    Full {
        #[serde(default)]
        context: Option<String>,
        #[serde(default)]
        dockerfile: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandConfig {
    Shell(String),
    Exec(Vec<String>),
}

impl CommandConfig {
    /// Shell form is split into words the way a POSIX shell would,
    /// exec form is used as is.
    pub fn to_args(&self) -> Result<Vec<String>> {
        match self {
            CommandConfig::Shell(s) => {
                shlex::split(s).ok_or_else(|| eyre!("unbalanced quotes in {:?}", s))
            }
            CommandConfig::Exec(arr) => Ok(arr.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentConfig {
    Array(Vec<String>),
    Map(HashMap<String, Option<StringOrNumber>>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvFileConfig {
    Single(String),
    Multiple(Vec<String>),
}

impl EnvFileConfig {
    pub fn paths(&self) -> Vec<String> {
        match self {
            EnvFileConfig::Single(s) => vec![s.clone()],
            EnvFileConfig::Multiple(v) => v.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortConfig {
    Short(StringOrNumber),
    Long {
        target: u16,
        #[serde(default)]
        published: Option<StringOrNumber>,
        #[serde(default)]
        host_ip: Option<String>,
        #[serde(default)]
        protocol: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VolumeMount {
    Short(String),
    Long {
        #[serde(rename = "type", default)]
        mount_type: Option<String>,
        #[serde(default)]
        source: Option<String>,
        target: String,
        #[serde(default)]
        read_only: Option<bool>,
    },
}

/// A volume entry classified by what it mounts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mount {
    Bind {
        source: String,
        target: String,
        read_only: bool,
    },
    Volume {
        source: String,
        target: String,
        read_only: bool,
    },
    Anonymous {
        target: String,
    },
}

fn is_path_like(source: &str) -> bool {
    source.starts_with('/') || source.starts_with('.') || source.starts_with('~')
}

impl VolumeMount {
    pub fn parse(&self) -> Mount {
        match self {
            VolumeMount::Short(spec) => {
                let parts: Vec<&str> = spec.split(':').collect();
                match parts.as_slice() {
                    [target] => Mount::Anonymous {
                        target: target.to_string(),
                    },
                    [source, target, rest @ ..] => {
                        let read_only = rest
                            .first()
                            .map_or(false, |m| m.split(',').any(|o| o == "ro"));
                        if is_path_like(source) {
                            Mount::Bind {
                                source: source.to_string(),
                                target: target.to_string(),
                                read_only,
                            }
                        } else {
                            Mount::Volume {
                                source: source.to_string(),
                                target: target.to_string(),
                                read_only,
                            }
                        }
                    }
                    [] => Mount::Anonymous {
                        target: String::new(),
                    },
                }
            }
            VolumeMount::Long {
                mount_type,
                source,
                target,
                read_only,
            } => {
                let read_only = read_only.unwrap_or(false);
                match (mount_type.as_deref(), source) {
                    (Some("bind"), Some(source)) => Mount::Bind {
                        source: source.clone(),
                        target: target.clone(),
                        read_only,
                    },
                    (_, Some(source)) if mount_type.is_none() && is_path_like(source) => {
                        Mount::Bind {
                            source: source.clone(),
                            target: target.clone(),
                            read_only,
                        }
                    }
                    (_, Some(source)) => Mount::Volume {
                        source: source.clone(),
                        target: target.clone(),
                        read_only,
                    },
                    (_, None) => Mount::Anonymous {
                        target: target.clone(),
                    },
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NetworksConfig {
    Array(Vec<String>),
    Map(HashMap<String, Option<ServiceNetworkConfig>>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceNetworkConfig {
    #[serde(default)]
    pub aliases: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOnConfig {
    Array(Vec<String>),
    Map(HashMap<String, DependsOnCondition>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependsOnCondition {
    #[serde(default)]
    pub condition: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthcheckConfig {
    #[serde(default)]
    pub test: Option<CommandConfig>,
    #[serde(default)]
    pub interval: Option<String>,
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub retries: Option<i64>,
    #[serde(default)]
    pub start_period: Option<String>,
    #[serde(default)]
    pub disable: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LabelsConfig {
    Array(Vec<String>),
    Map(HashMap<String, StringOrNumber>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployConfig {
    #[serde(default)]
    pub replicas: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExternalConfig {
    Bool(bool),
    Named { name: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default)]
    pub external: Option<ExternalConfig>,
    #[serde(default)]
    pub internal: Option<bool>,
    #[serde(default)]
    pub labels: Option<LabelsConfig>,
}

impl NetworkConfig {
    pub fn is_external(&self) -> bool {
        matches!(
            self.external,
            Some(ExternalConfig::Bool(true)) | Some(ExternalConfig::Named { .. })
        )
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub driver: Option<String>,
    #[serde(default)]
    pub external: Option<ExternalConfig>,
    #[serde(default)]
    pub labels: Option<LabelsConfig>,
}

impl VolumeConfig {
    pub fn is_external(&self) -> bool {
        matches!(
            self.external,
            Some(ExternalConfig::Bool(true)) | Some(ExternalConfig::Named { .. })
        )
    }
}

/// Raw shape of a compose file after interpolation and merging.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ComposeFile {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,
    #[serde(default)]
    pub networks: HashMap<String, Option<NetworkConfig>>,
    #[serde(default)]
    pub volumes: HashMap<String, Option<VolumeConfig>>,
}
