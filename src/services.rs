//! Flattening of the registry into routable service records

use crate::models::{Project, Registry, Service};

/// One routable (service, domain) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    /// Owning project
    pub project: String,
    /// Compose project that namespaces the container name; only set for
    /// services deployed from an image inside the owning project's stack
    pub namespace: Option<String>,
    pub host: String,
    pub domain: String,
    pub port: u16,
    pub passthrough: bool,
    pub proxyprotocol: bool,
    pub path_prefix: Option<String>,
    pub path_remove: bool,
    /// Whether the owning project is enabled
    pub enabled: bool,
}

impl ServiceRecord {
    fn new(project: &Project, service: &Service, domain: &str) -> Self {
        Self {
            project: project.name.clone(),
            namespace: service.is_upstream().then(|| project.name.clone()),
            host: service.host.clone(),
            domain: domain.to_string(),
            port: service.port,
            passthrough: service.passthrough,
            proxyprotocol: service.proxyprotocol,
            path_prefix: None,
            path_remove: false,
            enabled: project.enabled,
        }
    }

    /// Address of the backend as seen from the proxy network
    pub fn upstream(&self) -> String {
        match &self.namespace {
            Some(namespace) => format!("{}-{}:{}", namespace, self.host, self.port),
            None => format!("{}:{}", self.host, self.port),
        }
    }

    /// Path prefix without its trailing `/`; a bare `/` is the root route
    pub fn route_prefix(&self) -> Option<&str> {
        self.path_prefix
            .as_deref()
            .map(|p| p.trim_end_matches('/'))
            .filter(|p| !p.is_empty())
    }

    /// Address used when the raw TLS stream is forwarded
    pub fn passthrough_upstream(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// All (service, domain) records in registry order, enabled or not
pub fn enumerate(registry: &Registry) -> Vec<ServiceRecord> {
    let mut records = Vec::new();

    for project in &registry.projects {
        for service in &project.services {
            for ingress in &service.ingress {
                let mut record = ServiceRecord::new(project, service, &ingress.domain);
                record.path_prefix = ingress.path_prefix.clone();
                // Store the canonical form so "/api/" and "/api" compare equal
                record.path_prefix = record.route_prefix().map(str::to_string);
                record.path_remove = ingress.path_remove;
                records.push(record);
            }

            // The project domain routes to the entrypoint unless already listed
            let is_entrypoint = project.entrypoint.as_deref() == Some(service.host.as_str());
            if let (true, Some(domain)) = (is_entrypoint, &project.domain) {
                if !service.ingress.iter().any(|i| &i.domain == domain) {
                    records.push(ServiceRecord::new(project, service, domain));
                }
            }
        }
    }

    records
}

/// Records of enabled projects
pub fn routable(registry: &Registry) -> Vec<ServiceRecord> {
    enumerate(registry).into_iter().filter(|r| r.enabled).collect()
}

/// Enabled records whose TLS is terminated by the terminate tier
pub fn terminate_services(registry: &Registry) -> Vec<ServiceRecord> {
    routable(registry)
        .into_iter()
        .filter(|r| !r.passthrough)
        .collect()
}

/// Enabled records whose TLS stream is passed through untouched
pub fn passthrough_services(registry: &Registry) -> Vec<ServiceRecord> {
    routable(registry)
        .into_iter()
        .filter(|r| r.passthrough)
        .collect()
}

/// Sorted, de-duplicated domains served by the terminate tier
pub fn terminate_domains(registry: &Registry) -> Vec<String> {
    let mut domains: Vec<String> = terminate_services(registry)
        .into_iter()
        .map(|r| r.domain)
        .collect();
    domains.sort();
    domains.dedup();
    domains
}
