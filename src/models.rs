//! Registry document: projects, services, ingress rules and plugins
//!
//! Every optional attribute has an explicit serde default so a registry
//! written by hand only needs to carry what differs from the defaults.
//! Semantic checks that serde cannot express live in [`Registry::validate`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// A scalar environment value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Null,
}

impl std::fmt::Display for EnvValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvValue::Bool(b) => write!(f, "{}", b),
            EnvValue::Int(i) => write!(f, "{}", i),
            EnvValue::Float(x) => write!(f, "{}", x),
            EnvValue::String(s) => write!(f, "{}", s),
            EnvValue::Null => Ok(()),
        }
    }
}

impl From<&str> for EnvValue {
    fn from(s: &str) -> Self {
        EnvValue::String(s.to_string())
    }
}

impl From<String> for EnvValue {
    fn from(s: String) -> Self {
        EnvValue::String(s)
    }
}

impl From<i64> for EnvValue {
    fn from(i: i64) -> Self {
        EnvValue::Int(i)
    }
}

impl From<bool> for EnvValue {
    fn from(b: bool) -> Self {
        EnvValue::Bool(b)
    }
}

/// Open key/value environment attached to a service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Env(BTreeMap<String, EnvValue>);

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&EnvValue> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<EnvValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &EnvValue)> {
        self.0.iter()
    }

    /// Merge `other` into this environment: keys in `other` are added or
    /// overwritten, every other key is kept
    pub fn merge(&mut self, other: Env) {
        self.0.extend(other.0);
    }

    /// Parse `KEY=VALUE` pairs as given on the command line
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut env = Env::new();
        for pair in pairs {
            let pair = pair.as_ref();
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", pair))?;
            if key.is_empty() {
                return Err(format!("empty key in '{}'", pair));
            }
            env.insert(key, value);
        }
        Ok(env)
    }
}

impl<K: Into<String>, V: Into<EnvValue>> FromIterator<(K, V)> for Env {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Env(iter
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect())
    }
}

/// One routing rule for a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ingress {
    pub domain: String,

    /// Only route requests under this path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,

    /// Strip the path prefix before forwarding
    #[serde(default, skip_serializing_if = "is_false")]
    pub path_remove: bool,
}

impl Ingress {
    pub fn new(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
            path_prefix: None,
            path_remove: false,
        }
    }
}

/// A network-facing service of a project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    /// Compose-network name of the service
    #[serde(alias = "name")]
    pub host: String,

    /// Image plus tag; absent for routing-only entries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingress: Vec<Ingress>,

    /// TLS is terminated by the service itself
    #[serde(default, skip_serializing_if = "is_false")]
    pub passthrough: bool,

    /// Speak PROXY protocol v2 towards the service
    #[serde(default = "default_true")]
    pub proxyprotocol: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,

    #[serde(default, skip_serializing_if = "Env::is_empty")]
    pub env: Env,

    /// Extra compose properties merged into the generated service entry
    #[serde(default, skip_serializing_if = "serde_yaml::Mapping::is_empty")]
    pub additional_properties: serde_yaml::Mapping,
}

impl Service {
    /// Create a routing-only service with defaults
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            image: None,
            command: None,
            port: default_port(),
            ingress: Vec::new(),
            passthrough: false,
            proxyprotocol: true,
            labels: Vec::new(),
            volumes: Vec::new(),
            env: Env::new(),
            additional_properties: serde_yaml::Mapping::new(),
        }
    }

    /// Set the image (builder pattern)
    pub fn with_image(mut self, image: &str) -> Self {
        self.image = Some(image.to_string());
        self
    }

    /// Set the port (builder pattern)
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Add an ingress domain (builder pattern)
    pub fn with_domain(mut self, domain: &str) -> Self {
        self.ingress.push(Ingress::new(domain));
        self
    }

    /// Mark as TLS passthrough (builder pattern)
    pub fn with_passthrough(mut self) -> Self {
        self.passthrough = true;
        self
    }

    /// Set environment (builder pattern)
    pub fn with_env(mut self, env: Env) -> Self {
        self.env = env;
        self
    }

    /// Whether the service is deployed from an image in its project's stack
    pub fn is_upstream(&self) -> bool {
        self.image.is_some()
    }

    fn validate(&self, project: &str, errors: &mut Vec<String>) {
        if self.host.trim().is_empty() {
            errors.push(format!("project '{}': service with empty host", project));
        }
        if self.port == 0 {
            errors.push(format!(
                "project '{}': service '{}': 'port' must be greater than 0",
                project, self.host
            ));
        }
        for ingress in &self.ingress {
            if ingress.domain.trim().is_empty() {
                errors.push(format!(
                    "project '{}': service '{}': ingress with empty domain",
                    project, self.host
                ));
            }
        }
    }
}

/// A named group of services deployed as one compose stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Default domain, routed to the entrypoint service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    /// Service treated as the project's primary backend; must have an image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,

    #[serde(default)]
    pub services: Vec<Service>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Project {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            domain: None,
            entrypoint: None,
            services: Vec::new(),
            enabled: true,
        }
    }

    /// Add a service (builder pattern)
    pub fn with_service(mut self, service: Service) -> Self {
        self.services.push(service);
        self
    }

    /// Set the entrypoint (builder pattern)
    pub fn with_entrypoint(mut self, entrypoint: &str) -> Self {
        self.entrypoint = Some(entrypoint.to_string());
        self
    }

    /// Set the enabled flag (builder pattern)
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn service(&self, host: &str) -> Option<&Service> {
        self.services.iter().find(|s| s.host == host)
    }

    /// Whether any service would be materialized in a compose stack
    pub fn has_upstreams(&self) -> bool {
        self.services.iter().any(Service::is_upstream)
    }

    fn validate(&self, errors: &mut Vec<String>) {
        if self.name.trim().is_empty() {
            errors.push("project with empty name".to_string());
        }

        let mut hosts = HashSet::new();
        for service in &self.services {
            if !hosts.insert(service.host.as_str()) {
                errors.push(format!(
                    "project '{}': duplicate service '{}'",
                    self.name, service.host
                ));
            }
            service.validate(&self.name, errors);
        }

        if let Some(entrypoint) = &self.entrypoint {
            match self.service(entrypoint) {
                None => errors.push(format!(
                    "project '{}': entrypoint '{}' does not name a service",
                    self.name, entrypoint
                )),
                Some(service) if !service.is_upstream() => errors.push(format!(
                    "project '{}': entrypoint '{}' has no image",
                    self.name, entrypoint
                )),
                Some(_) => {}
            }
        }
    }
}

/// A global add-on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plugin {
    pub version: String,

    #[serde(default)]
    pub enabled: bool,

    /// API key, for plugins that need one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apikey: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "serde_yaml::Mapping::is_empty")]
    pub options: serde_yaml::Mapping,
}

/// Plugins keyed by name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginRegistry(BTreeMap<String, Plugin>);

impl PluginRegistry {
    pub fn get(&self, name: &str) -> Option<&Plugin> {
        self.0.get(name)
    }

    pub fn insert(&mut self, name: &str, plugin: Plugin) {
        self.0.insert(name.to_string(), plugin);
    }

    /// Names of enabled plugins, sorted
    pub fn enabled(&self) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(_, p)| p.enabled)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// The whole registry document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    /// Tool version pins
    #[serde(default)]
    pub versions: BTreeMap<String, String>,

    #[serde(default)]
    pub plugins: PluginRegistry,

    #[serde(default)]
    pub projects: Vec<Project>,
}

impl Registry {
    pub fn from_yaml(content: &str) -> crate::Result<Self> {
        let registry: Registry = serde_yaml::from_str(content)?;
        Ok(registry)
    }

    pub fn to_yaml(&self) -> crate::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn project(&self, name: &str) -> Option<&Project> {
        self.projects.iter().find(|p| p.name == name)
    }

    /// Validate all projects, collecting every problem
    pub fn validate(&self) -> crate::Result<()> {
        let mut errors = Vec::new();
        let mut names = HashSet::new();

        for project in &self.projects {
            if !names.insert(project.name.as_str()) {
                errors.push(format!("duplicate project '{}'", project.name));
            }
            project.validate(&mut errors);
        }

        if !errors.is_empty() {
            return Err(crate::Error::Validation(errors));
        }

        Ok(())
    }
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn is_false(b: &bool) -> bool {
    !*b
}
