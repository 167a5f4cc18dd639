//! Compose file loading.
//!
//! Files are read as untyped YAML, interpolated, merged in order and only
//! then turned into a [`Project`]. Relative paths are resolved against the
//! directory of the first file, and the standard labels are attached to
//! every service before the project is handed out.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use eyre::{bail, eyre, Result, WrapErr};
use log::{debug, info, warn};
use regex::Regex;
use serde_yaml::Value;

use super::{
    graph, labels, BuildConfig, ComposeFile, EnvFileConfig, EnvironmentConfig, Mount, Project,
    ServiceConfig, StringOrNumber, VolumeMount,
};

/// File names looked up when no compose file is given.
pub const DEFAULT_COMPOSE_FILES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

const COMPOSE_FILE_ENV: &str = "COMPOSE_FILE";
const COMPOSE_PROJECT_NAME_ENV: &str = "COMPOSE_PROJECT_NAME";

/// Inputs of [`load_project`].
#[derive(Debug, Clone, Default)]
pub struct ProjectOptions {
    pub config_paths: Vec<PathBuf>,
    pub name: Option<String>,
    pub env_file: Option<PathBuf>,
    pub profiles: Vec<String>,
    /// Directory the default file search starts from. Defaults to the cwd.
    pub working_dir: Option<PathBuf>,
    /// Process environment, used for interpolation and `COMPOSE_*` lookups.
    pub environment: HashMap<String, String>,
}

impl ProjectOptions {
    pub fn new(config_paths: Vec<PathBuf>) -> Self {
        Self {
            config_paths,
            environment: std::env::vars().collect(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }

    pub fn with_env_file(mut self, env_file: Option<PathBuf>) -> Self {
        self.env_file = env_file;
        self
    }

    pub fn with_profiles(mut self, profiles: Vec<String>) -> Self {
        self.profiles = profiles;
        self
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn with_environment(mut self, environment: HashMap<String, String>) -> Self {
        self.environment = environment;
        self
    }
}

/// Load, interpolate, merge and validate a compose project.
pub fn load_project(options: &ProjectOptions) -> Result<Project> {
    let search_dir = match &options.working_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().wrap_err("cannot read current directory")?,
    };

    let compose_files = resolve_compose_files(options, &search_dir)?;
    let first = compose_files
        .first()
        .ok_or_else(|| eyre!("no compose file given"))?;
    let working_dir = first
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| search_dir.clone());

    let (env_file, environment) = resolve_environment(options, &working_dir)?;

    let mut merged = Value::Null;
    for path in &compose_files {
        debug!("Reading compose file: {}", path.display());
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read {}", path.display()))?;
        let mut value: Value = serde_yaml::from_str(&content)
            .wrap_err_with(|| format!("failed to parse {}", path.display()))?;
        interpolate_value(&mut value, &environment)
            .wrap_err_with(|| format!("failed to interpolate {}", path.display()))?;
        merge_values(&mut merged, value);
    }

    let file: ComposeFile = if merged.is_null() {
        ComposeFile::default()
    } else {
        serde_yaml::from_value(merged).wrap_err("invalid compose file")?
    };

    let raw_name = options
        .name
        .clone()
        .or_else(|| environment.get(COMPOSE_PROJECT_NAME_ENV).cloned())
        .filter(|n| !n.is_empty())
        .or_else(|| file.name.clone())
        .or_else(|| {
            working_dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
        })
        .unwrap_or_default();
    let name = normalize_project_name(&raw_name)?;

    let mut services: Vec<ServiceConfig> = file
        .services
        .into_iter()
        .map(|(name, mut service)| {
            service.name = name;
            service
        })
        .collect();
    services.sort_by(|a, b| a.name.cmp(&b.name));

    for service in services.iter_mut() {
        resolve_service_paths(service, &working_dir, &environment);
        merge_service_env_files(service)?;
    }

    let mut project = Project {
        name,
        working_dir,
        compose_files,
        env_file,
        environment,
        services,
        networks: file
            .networks
            .into_iter()
            .map(|(k, v)| (k, v.unwrap_or_default()))
            .collect(),
        volumes: file
            .volumes
            .into_iter()
            .map(|(k, v)| (k, v.unwrap_or_default()))
            .collect(),
        disabled_services: Vec::new(),
    };

    validate(&project)?;
    apply_profiles(&mut project, &options.profiles);

    if project.services.iter().any(|s| s.uses_default_network()) {
        project.networks.entry("default".to_string()).or_default();
    }
    graph::dependency_order(&project)?;

    labels::inject(&mut project);
    project.without_unnecessary_resources();

    info!(
        "Loaded project {} with {} service(s) from {}",
        project.name,
        project.services.len(),
        project.working_dir.display()
    );
    Ok(project)
}

fn resolve_compose_files(options: &ProjectOptions, search_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = options.config_paths.clone();
    if paths.is_empty() {
        if let Some(from_env) = options.environment.get(COMPOSE_FILE_ENV) {
            paths = from_env
                .split(':')
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .collect();
        }
    }
    if paths.is_empty() {
        let found = find_compose_file(search_dir).ok_or_else(|| {
            eyre!(
                "no configuration file provided: none of {} found in {} or its parents",
                DEFAULT_COMPOSE_FILES.join(", "),
                search_dir.display()
            )
        })?;
        paths.push(found);
    }

    paths
        .into_iter()
        .map(|p| {
            let p = if p.is_absolute() { p } else { search_dir.join(p) };
            p.canonicalize()
                .wrap_err_with(|| format!("compose file {} not found", p.display()))
        })
        .collect()
}

/// Look for a default compose file in `dir` and then its parents.
pub fn find_compose_file(dir: &Path) -> Option<PathBuf> {
    let mut current = Some(dir);
    while let Some(dir) = current {
        for name in DEFAULT_COMPOSE_FILES {
            let path = dir.join(name);
            if path.is_file() {
                return Some(path);
            }
        }
        current = dir.parent();
    }
    None
}

fn resolve_environment(
    options: &ProjectOptions,
    working_dir: &Path,
) -> Result<(Option<PathBuf>, HashMap<String, String>)> {
    let env_file = match &options.env_file {
        Some(path) => {
            let path = if path.is_absolute() {
                path.clone()
            } else {
                options
                    .working_dir
                    .clone()
                    .unwrap_or_else(|| working_dir.to_path_buf())
                    .join(path)
            };
            if !path.is_file() {
                bail!("env file {} not found", path.display());
            }
            Some(path)
        }
        None => Some(working_dir.join(".env")).filter(|p| p.is_file()),
    };

    let mut environment = HashMap::new();
    if let Some(path) = &env_file {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read {}", path.display()))?;
        for (key, value) in parse_dotenv(&content)
            .wrap_err_with(|| format!("failed to parse {}", path.display()))?
        {
            environment.insert(key, value);
        }
    }
    // The process environment wins over the dotenv file.
    environment.extend(options.environment.clone());
    Ok((env_file, environment))
}

/// Parse `KEY=VALUE` lines. Blank lines and `#` comments are skipped,
/// an `export ` prefix is accepted and matching quotes are stripped.
pub fn parse_dotenv(content: &str) -> Result<Vec<(String, String)>> {
    let mut vars = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| eyre!("line {}: expected KEY=VALUE", lineno + 1))?;
        let key = key.trim();
        if key.is_empty() || key.contains(char::is_whitespace) {
            bail!("line {}: invalid variable name {:?}", lineno + 1, key);
        }
        let value = value.trim();
        let value = match value.chars().next() {
            Some(q @ ('"' | '\'')) if value.len() >= 2 && value.ends_with(q) => {
                value[1..value.len() - 1].to_string()
            }
            _ => match value.find(" #") {
                Some(idx) => value[..idx].trim_end().to_string(),
                None => value.to_string(),
            },
        };
        vars.push((key.to_string(), value));
    }
    Ok(vars)
}

fn interpolation_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"\$(?:(\$)|([A-Za-z_][A-Za-z0-9_]*)|\{([A-Za-z_][A-Za-z0-9_]*)(?:(:?[-?+])([^}]*))?\})",
        )
        .expect("interpolation pattern is valid")
    })
}

/// Substitute `$VAR`, `${VAR}` and the `:-`, `-`, `:?`, `?`, `:+`, `+`
/// forms. `$$` yields a literal `$`.
pub fn interpolate(input: &str, env: &HashMap<String, String>) -> Result<String> {
    let re = interpolation_regex();
    let mut out = String::with_capacity(input.len());
    let mut last = 0;

    for caps in re.captures_iter(input) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        out.push_str(&input[last..whole.start()]);
        last = whole.end();

        if caps.get(1).is_some() {
            out.push('$');
            continue;
        }
        if let Some(name) = caps.get(2) {
            out.push_str(&lookup(env, name.as_str()));
            continue;
        }

        let name = caps.get(3).map(|m| m.as_str()).unwrap_or_default();
        let arg = caps.get(5).map(|m| m.as_str()).unwrap_or_default();
        let value = env.get(name);
        let is_set = value.is_some();
        let is_non_empty = value.map_or(false, |v| !v.is_empty());

        let replacement = match caps.get(4).map(|m| m.as_str()) {
            None => lookup(env, name),
            Some(":-") if is_non_empty => value.cloned().unwrap_or_default(),
            Some(":-") => interpolate(arg, env)?,
            Some("-") if is_set => value.cloned().unwrap_or_default(),
            Some("-") => interpolate(arg, env)?,
            Some(":?") if is_non_empty => value.cloned().unwrap_or_default(),
            Some("?") if is_set => value.cloned().unwrap_or_default(),
            Some(":?") | Some("?") => {
                bail!("required variable {} is missing a value: {}", name, arg)
            }
            Some(":+") if is_non_empty => interpolate(arg, env)?,
            Some("+") if is_set => interpolate(arg, env)?,
            Some(_) => String::new(),
        };
        out.push_str(&replacement);
    }
    out.push_str(&input[last..]);
    Ok(out)
}

fn lookup(env: &HashMap<String, String>, name: &str) -> String {
    match env.get(name) {
        Some(value) => value.clone(),
        None => {
            warn!("The \"{}\" variable is not set. Defaulting to a blank string.", name);
            String::new()
        }
    }
}

/// Interpolate every string scalar of a YAML tree in place.
pub fn interpolate_value(value: &mut Value, env: &HashMap<String, String>) -> Result<()> {
    match value {
        Value::String(s) => {
            if s.contains('$') {
                *s = interpolate(s, env)?;
            }
        }
        Value::Sequence(seq) => {
            for item in seq.iter_mut() {
                interpolate_value(item, env)?;
            }
        }
        Value::Mapping(map) => {
            for (_, item) in map.iter_mut() {
                interpolate_value(item, env)?;
            }
        }
        Value::Tagged(tagged) => interpolate_value(&mut tagged.value, env)?,
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
    Ok(())
}

/// Deep merge of `overlay` into `base`. Mappings merge key by key, any
/// other value (sequences included) is replaced.
pub fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Lowercase and strip everything outside `[a-z0-9_-]`; the name has to
/// start with a letter or a digit.
pub fn normalize_project_name(name: &str) -> Result<String> {
    let normalized: String = name
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-')
        .collect();
    let normalized = normalized
        .trim_start_matches(|c: char| c == '_' || c == '-')
        .to_string();
    if normalized.is_empty() {
        bail!("project name {:?} is empty after normalization", name);
    }
    Ok(normalized)
}

fn resolve_path(working_dir: &Path, env: &HashMap<String, String>, path: &str) -> String {
    let expanded = shellexpand::tilde_with_context(path, || env.get("HOME"));
    let p = Path::new(&*expanded);
    let joined = if p.is_absolute() {
        p.to_path_buf()
    } else {
        working_dir.join(p)
    };
    clean_path(&joined).display().to_string()
}

fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn resolve_service_paths(
    service: &mut ServiceConfig,
    working_dir: &Path,
    env: &HashMap<String, String>,
) {
    for volume in service.volumes.iter_mut() {
        if let Mount::Bind { source, .. } = volume.parse() {
            let resolved = resolve_path(working_dir, env, &source);
            match volume {
                VolumeMount::Short(spec) => {
                    let rest = &spec[source.len()..];
                    *spec = format!("{}{}", resolved, rest);
                }
                VolumeMount::Long { source, .. } => *source = Some(resolved),
            }
        }
    }

    if let Some(env_file) = &service.env_file {
        let resolved = env_file
            .paths()
            .iter()
            .map(|p| resolve_path(working_dir, env, p))
            .collect();
        service.env_file = Some(EnvFileConfig::Multiple(resolved));
    }

    match &mut service.build {
        Some(BuildConfig::Simple(context)) => *context = resolve_path(working_dir, env, context),
        Some(BuildConfig::Full {
            context: Some(context),
            ..
        }) => *context = resolve_path(working_dir, env, context),
        Some(BuildConfig::Full { context, .. }) => {
            *context = Some(working_dir.display().to_string())
        }
        None => {}
    }
}

/// Fold `env_file` contents under the service's explicit `environment`.
fn merge_service_env_files(service: &mut ServiceConfig) -> Result<()> {
    let files = match &service.env_file {
        Some(files) => files.paths(),
        None => return Ok(()),
    };

    let mut merged: HashMap<String, Option<StringOrNumber>> = HashMap::new();
    for file in files {
        let content = std::fs::read_to_string(&file).wrap_err_with(|| {
            format!("service {}: failed to read env file {}", service.name, file)
        })?;
        for (key, value) in parse_dotenv(&content)
            .wrap_err_with(|| format!("service {}: failed to parse {}", service.name, file))?
        {
            merged.insert(key, Some(StringOrNumber::String(value)));
        }
    }

    let explicit: Vec<(String, Option<StringOrNumber>)> = match service.environment.take() {
        None => Vec::new(),
        Some(EnvironmentConfig::Array(arr)) => arr
            .into_iter()
            .map(|item| match item.split_once('=') {
                Some((k, v)) => (k.to_string(), Some(StringOrNumber::String(v.to_string()))),
                None => (item, None),
            })
            .collect(),
        Some(EnvironmentConfig::Map(map)) => map.into_iter().collect(),
    };
    for (key, value) in explicit {
        if value.is_some() || !merged.contains_key(&key) {
            merged.insert(key, value);
        }
    }

    service.environment = Some(EnvironmentConfig::Map(merged));
    Ok(())
}

fn validate(project: &Project) -> Result<()> {
    let names: HashSet<&str> = project.services.iter().map(|s| s.name.as_str()).collect();

    for service in &project.services {
        if service.image.is_none() && service.build.is_none() {
            bail!(
                "service {:?} has neither an image nor a build context specified",
                service.name
            );
        }
        for (dep, _) in service.dependencies() {
            if !names.contains(dep.as_str()) {
                bail!("service {:?} depends on undefined service {:?}", service.name, dep);
            }
        }
        for key in service.network_keys() {
            if key != "default" && !project.networks.contains_key(&key) {
                bail!("service {:?} refers to undefined network {:?}", service.name, key);
            }
        }
        for source in service.named_volume_sources() {
            if !project.volumes.contains_key(&source) {
                bail!("service {:?} refers to undefined volume {:?}", service.name, source);
            }
        }
    }
    Ok(())
}

/// Move services whose profiles are all inactive to `disabled_services`,
/// keeping any that an enabled service depends on.
fn apply_profiles(project: &mut Project, active: &[String]) {
    let is_active = |s: &ServiceConfig| {
        s.profiles.is_empty()
            || s.profiles.iter().any(|p| p == "*" || active.contains(p))
            || active.iter().any(|p| p == "*")
    };

    let mut enabled: HashSet<String> = project
        .services
        .iter()
        .filter(|s| is_active(s))
        .map(|s| s.name.clone())
        .collect();

    loop {
        let required: Vec<String> = project
            .services
            .iter()
            .filter(|s| enabled.contains(&s.name))
            .flat_map(|s| s.dependencies().into_iter().map(|(d, _)| d))
            .filter(|d| !enabled.contains(d))
            .collect();
        if required.is_empty() {
            break;
        }
        enabled.extend(required);
    }

    let (kept, disabled): (Vec<ServiceConfig>, Vec<ServiceConfig>) = project
        .services
        .drain(..)
        .partition(|s| enabled.contains(&s.name));
    if !disabled.is_empty() {
        debug!(
            "Services disabled by profiles: {}",
            disabled
                .iter()
                .map(|s| s.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    project.services = kept;
    project.disabled_services = disabled;
}
