//! Compose descriptor rendering for project stacks

use crate::error::{Error, Result};
use crate::models::{Project, Service};
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use tracing::info;

/// Shared network every routed container joins
pub const PROXY_NETWORK: &str = "proxynet";

/// File name of the rendered descriptor inside a stack directory
pub const COMPOSE_FILE: &str = "docker-compose.yml";

/// Container/service name of an image-backed service
pub fn service_name(project: &str, host: &str) -> String {
    format!("{}-{}", project, host)
}

/// Build the compose document for `project`. Only image-backed services
/// are included.
pub fn compose_document(project: &Project) -> Result<Mapping> {
    let mut network = Mapping::new();
    network.insert(key("name"), key(PROXY_NETWORK));
    network.insert(key("external"), Value::Bool(true));
    let mut networks = Mapping::new();
    networks.insert(key(PROXY_NETWORK), Value::Mapping(network));

    let mut services = Mapping::new();
    for service in project.services.iter().filter(|s| s.is_upstream()) {
        services.insert(
            key(&service_name(&project.name, &service.host)),
            Value::Mapping(compose_service(&project.name, service)?),
        );
    }

    let mut doc = Mapping::new();
    doc.insert(key("version"), key("3.8"));
    doc.insert(key("networks"), Value::Mapping(networks));
    doc.insert(key("services"), Value::Mapping(services));
    Ok(doc)
}

fn compose_service(project: &str, service: &Service) -> Result<Mapping> {
    let mut entry = Mapping::new();

    if let Some(image) = &service.image {
        entry.insert(key("image"), key(image));
    }

    if let Some(command) = &service.command {
        let argv = shell_words::split(command).map_err(|e| {
            Error::Validation(vec![format!(
                "project '{}': service '{}': invalid command: {}",
                project, service.host, e
            )])
        })?;
        entry.insert(key("command"), sequence(argv));
    }

    entry.insert(key("networks"), sequence(["default", PROXY_NETWORK]));
    entry.insert(key("restart"), key("unless-stopped"));

    if !service.env.is_empty() {
        let mut environment = Mapping::new();
        for (name, value) in service.env.iter() {
            environment.insert(key(name), serde_yaml::to_value(value)?);
        }
        entry.insert(key("environment"), Value::Mapping(environment));
    }

    entry.insert(key("expose"), sequence([service.port.to_string()]));

    if !service.volumes.is_empty() {
        entry.insert(key("volumes"), sequence(&service.volumes));
    }
    if !service.labels.is_empty() {
        entry.insert(key("labels"), sequence(&service.labels));
    }

    // Explicit properties win over anything generated
    for (k, v) in &service.additional_properties {
        entry.insert(k.clone(), v.clone());
    }

    Ok(entry)
}

/// Render the compose descriptor of `project` as YAML
pub fn render(project: &Project) -> Result<String> {
    Ok(serde_yaml::to_string(&compose_document(project)?)?)
}

/// Write `<stack_dir>/docker-compose.yml`, creating the directory
pub fn write(project: &Project, stack_dir: &Path) -> Result<PathBuf> {
    let yaml = render(project)?;
    std::fs::create_dir_all(stack_dir).map_err(|e| Error::io(stack_dir, e))?;

    let path = stack_dir.join(COMPOSE_FILE);
    std::fs::write(&path, yaml).map_err(|e| Error::io(&path, e))?;

    info!(project = %project.name, path = %path.display(), "Wrote compose file");
    Ok(path)
}

fn key(s: &str) -> Value {
    Value::String(s.to_string())
}

fn sequence<I, S>(items: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    Value::Sequence(items.into_iter().map(|s| key(s.as_ref())).collect())
}
