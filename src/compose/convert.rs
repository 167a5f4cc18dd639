//! Service definition to engine container configuration.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use bollard::container::{Config, NetworkingConfig};
use bollard::models::{
    EndpointSettings, HealthConfig, HostConfig, PortBinding, RestartPolicy, RestartPolicyNameEnum,
};
use eyre::{bail, eyre, Result, WrapErr};
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::project::{
    labels, CommandConfig, HealthcheckConfig, Mount, PortConfig, Project, ServiceConfig,
};

/// Name of the `number`th container of a service.
pub fn container_name(project: &Project, service: &ServiceConfig, number: u32) -> String {
    match &service.container_name {
        Some(name) if service.replicas() == 1 => name.clone(),
        _ => format!("{}-{}-{}", project.name, service.name, number),
    }
}

/// Stable digest of a service definition, stored on its containers to
/// detect configuration drift.
pub fn config_hash(service: &ServiceConfig) -> Result<String> {
    // Going through a JSON value sorts map keys.
    let value = serde_json::to_value(service).wrap_err("cannot serialize service")?;
    Ok(hex::encode(Sha256::digest(value.to_string().as_bytes())))
}

/// Split an image reference into the `fromImage` and `tag` parameters of
/// an engine pull. The tag defaults to `latest`; a digest is passed as
/// the tag.
pub fn pull_reference(image: &str) -> (&str, &str) {
    if let Some((repository, digest)) = image.split_once('@') {
        return (repository, digest);
    }
    let name_start = image.rfind('/').map_or(0, |i| i + 1);
    match image[name_start..].rfind(':') {
        Some(i) => (&image[..name_start + i], &image[name_start + i + 1..]),
        None => (image, "latest"),
    }
}

/// Engine configuration for the `number`th container of `service`.
pub fn container_config(
    project: &Project,
    service: &ServiceConfig,
    number: u32,
) -> Result<Config<String>> {
    let mut labels: HashMap<String, String> = service.all_labels().into_iter().collect();
    labels.insert(labels::CONTAINER_NUMBER.to_string(), number.to_string());
    labels.insert(labels::CONFIG_HASH.to_string(), config_hash(service)?);

    let env = service
        .environment_list(&project.environment)
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>();

    let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
    let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
    for port in &service.ports {
        for mapping in parse_port(port)
            .wrap_err_with(|| format!("service {}: invalid port", service.name))?
        {
            let key = format!("{}/{}", mapping.container_port, mapping.protocol);
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings
                .entry(key)
                .or_insert_with(|| Some(Vec::new()))
                .get_or_insert_with(Vec::new)
                .push(PortBinding {
                    host_ip: mapping.host_ip,
                    host_port: mapping.host_port,
                });
        }
    }
    for expose in &service.expose {
        let expose = expose.to_string();
        let key = if expose.contains('/') {
            expose
        } else {
            format!("{}/tcp", expose)
        };
        exposed_ports.entry(key).or_default();
    }

    let mut binds = Vec::new();
    let mut anonymous: HashMap<String, HashMap<(), ()>> = HashMap::new();
    for volume in &service.volumes {
        match volume.parse() {
            Mount::Bind {
                source,
                target,
                read_only,
            } => binds.push(bind_spec(&source, &target, read_only)),
            Mount::Volume {
                source,
                target,
                read_only,
            } => binds.push(bind_spec(&project.volume_name(&source), &target, read_only)),
            Mount::Anonymous { target } => {
                anonymous.insert(target, HashMap::new());
            }
        }
    }

    let network_keys = service.network_keys();
    let primary_network = network_keys.first().map(|key| project.network_name(key));
    let network_mode = match service.network_mode.as_deref() {
        Some(mode) => Some(match mode.strip_prefix("service:") {
            Some(other) => format!("container:{}-{}-1", project.name, other),
            None => mode.to_string(),
        }),
        None => primary_network.clone(),
    };

    let networking_config = match (&primary_network, network_keys.first()) {
        (Some(network), Some(key)) => {
            let mut aliases = vec![service.name.clone()];
            aliases.extend(service.network_aliases(key));
            let mut endpoints = HashMap::new();
            endpoints.insert(
                network.clone(),
                EndpointSettings {
                    aliases: Some(aliases),
                    ..Default::default()
                },
            );
            Some(NetworkingConfig {
                endpoints_config: endpoints,
            })
        }
        _ => None,
    };

    let host_config = HostConfig {
        binds: if binds.is_empty() { None } else { Some(binds) },
        port_bindings: if port_bindings.is_empty() {
            None
        } else {
            Some(port_bindings)
        },
        restart_policy: service
            .restart
            .as_deref()
            .map(restart_policy)
            .transpose()
            .wrap_err_with(|| format!("service {}: invalid restart policy", service.name))?,
        network_mode,
        privileged: service.privileged,
        extra_hosts: if service.extra_hosts.is_empty() {
            None
        } else {
            Some(service.extra_hosts.iter().map(|h| h.replacen('=', ":", 1)).collect())
        },
        ..Default::default()
    };

    let cmd = service
        .command
        .as_ref()
        .map(CommandConfig::to_args)
        .transpose()
        .wrap_err_with(|| format!("service {}: invalid command", service.name))?;
    let entrypoint = service
        .entrypoint
        .as_ref()
        .map(CommandConfig::to_args)
        .transpose()
        .wrap_err_with(|| format!("service {}: invalid entrypoint", service.name))?;

    Ok(Config {
        image: Some(service.image_name(&project.name)),
        cmd,
        entrypoint,
        env: if env.is_empty() { None } else { Some(env) },
        labels: Some(labels),
        hostname: service.hostname.clone(),
        user: service.user.clone(),
        working_dir: service.working_dir.clone(),
        exposed_ports: if exposed_ports.is_empty() {
            None
        } else {
            Some(exposed_ports)
        },
        volumes: if anonymous.is_empty() {
            None
        } else {
            Some(anonymous)
        },
        healthcheck: service
            .healthcheck
            .as_ref()
            .map(health_config)
            .transpose()
            .wrap_err_with(|| format!("service {}: invalid healthcheck", service.name))?,
        host_config: Some(host_config),
        networking_config,
        ..Default::default()
    })
}

fn bind_spec(source: &str, target: &str, read_only: bool) -> String {
    if read_only {
        format!("{}:{}:ro", source, target)
    } else {
        format!("{}:{}", source, target)
    }
}

fn restart_policy(restart: &str) -> Result<RestartPolicy> {
    let (name, retries) = match restart.split_once(':') {
        Some((name, retries)) => (
            name,
            Some(
                retries
                    .parse::<i64>()
                    .map_err(|_| eyre!("invalid retry count {:?}", retries))?,
            ),
        ),
        None => (restart, None),
    };
    let name = match name {
        "no" | "" => RestartPolicyNameEnum::NO,
        "always" => RestartPolicyNameEnum::ALWAYS,
        "unless-stopped" => RestartPolicyNameEnum::UNLESS_STOPPED,
        "on-failure" => RestartPolicyNameEnum::ON_FAILURE,
        other => bail!("unknown restart policy {:?}", other),
    };
    Ok(RestartPolicy {
        name: Some(name),
        maximum_retry_count: retries,
    })
}

fn health_config(health: &HealthcheckConfig) -> Result<HealthConfig> {
    if health.disable == Some(true) {
        return Ok(HealthConfig {
            test: Some(vec!["NONE".to_string()]),
            ..Default::default()
        });
    }
    let nanos = |value: &Option<String>| -> Result<Option<i64>> {
        value
            .as_deref()
            .map(|v| {
                let d = parse_duration(v)?;
                i64::try_from(d.as_nanos()).map_err(|_| eyre!("duration {:?} is too long", v))
            })
            .transpose()
    };
    Ok(HealthConfig {
        test: health.test.as_ref().map(|test| match test {
            CommandConfig::Shell(cmd) => vec!["CMD-SHELL".to_string(), cmd.clone()],
            CommandConfig::Exec(args) => args.clone(),
        }),
        interval: nanos(&health.interval)?,
        timeout: nanos(&health.timeout)?,
        retries: health.retries,
        start_period: nanos(&health.start_period)?,
        ..Default::default()
    })
}

fn duration_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\d+)(?:\.(\d+))?(ns|us|µs|ms|s|m|h)").expect("duration pattern is valid")
    })
}

/// Parse compose durations such as `30s`, `1m30s` or `1.5h`.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let input = input.trim();
    if input.is_empty() {
        bail!("empty duration");
    }
    let invalid = || eyre!("invalid duration {:?}", input);
    let overflow = || eyre!("duration {:?} is too long", input);

    let mut total: u64 = 0;
    let mut consumed = 0;
    for caps in duration_regex().captures_iter(input) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        if whole.start() != consumed {
            return Err(invalid());
        }
        consumed = whole.end();

        let unit: u64 = match &caps[3] {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60_000_000_000,
            _ => 3_600_000_000_000,
        };
        let integer: u64 = caps[1].parse().map_err(|_| overflow())?;
        let mut nanos = integer.checked_mul(unit).ok_or_else(overflow)?;
        if let Some(fraction) = caps.get(2) {
            // Digits past the nanosecond of an hour cannot change the result.
            let digits = &fraction.as_str()[..fraction.as_str().len().min(18)];
            let scale = 10u128.pow(digits.len() as u32);
            let value: u128 = digits.parse().map_err(|_| invalid())?;
            let part = u64::try_from(value * u128::from(unit) / scale).map_err(|_| overflow())?;
            nanos = nanos.checked_add(part).ok_or_else(overflow)?;
        }
        total = total.checked_add(nanos).ok_or_else(overflow)?;
    }
    if consumed != input.len() {
        return Err(invalid());
    }
    Ok(Duration::from_nanos(total))
}

/// One published (or merely exposed) container port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub host_ip: Option<String>,
    pub host_port: Option<String>,
    pub container_port: u16,
    pub protocol: String,
}

/// Expand a `ports:` entry; ranges yield one mapping per port.
pub fn parse_port(port: &PortConfig) -> Result<Vec<PortMapping>> {
    match port {
        PortConfig::Long {
            target,
            published,
            host_ip,
            protocol,
        } => Ok(vec![PortMapping {
            host_ip: host_ip.clone(),
            host_port: published.as_ref().map(|p| p.to_string()),
            container_port: *target,
            protocol: protocol.clone().unwrap_or_else(|| "tcp".to_string()),
        }]),
        PortConfig::Short(spec) => parse_short_port(&spec.to_string()),
    }
}

fn parse_short_port(spec: &str) -> Result<Vec<PortMapping>> {
    let (spec, protocol) = match spec.rsplit_once('/') {
        Some((spec, protocol)) => (spec, protocol.to_string()),
        None => (spec, "tcp".to_string()),
    };

    let (host_ip, host, container) = match spec.strip_prefix('[') {
        Some(rest) => {
            let (ip, rest) = rest
                .split_once("]:")
                .ok_or_else(|| eyre!("invalid port {:?}", spec))?;
            let (host, container) = rest
                .split_once(':')
                .ok_or_else(|| eyre!("invalid port {:?}", spec))?;
            (Some(ip), Some(host), container)
        }
        None => {
            let parts: Vec<&str> = spec.split(':').collect();
            match parts.as_slice() {
                [container] => (None, None, *container),
                [host, container] => (None, Some(*host), *container),
                [ip, host, container] => (Some(*ip), Some(*host), *container),
                _ => bail!("invalid port {:?}", spec),
            }
        }
    };

    let (c_start, c_end) = parse_range(container)?;
    let host_range = match host.filter(|h| !h.is_empty()) {
        Some(host) => Some(parse_range(host)?),
        None => None,
    };
    let count = c_end - c_start;
    if let Some((h_start, h_end)) = host_range {
        if h_end - h_start != count && h_start != h_end {
            bail!("port ranges of {:?} do not match", spec);
        }
    }

    Ok((0..=count)
        .map(|i| PortMapping {
            host_ip: host_ip.filter(|ip| !ip.is_empty()).map(String::from),
            host_port: host_range.map(|(h_start, h_end)| {
                if h_start == h_end && count > 0 {
                    // A single host port for a range means "pick one of".
                    h_start.to_string()
                } else {
                    (h_start + i).to_string()
                }
            }),
            container_port: c_start + i,
            protocol: protocol.clone(),
        })
        .collect())
}

fn parse_range(s: &str) -> Result<(u16, u16)> {
    let parse = |p: &str| {
        p.trim()
            .parse::<u16>()
            .map_err(|_| eyre!("invalid port number {:?}", p))
    };
    match s.split_once('-') {
        Some((start, end)) => {
            let (start, end) = (parse(start)?, parse(end)?);
            if end < start {
                bail!("invalid port range {:?}", s);
            }
            Ok((start, end))
        }
        None => {
            let port = parse(s)?;
            Ok((port, port))
        }
    }
}
