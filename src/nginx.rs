//! Generated nginx configuration for the edge and terminate tiers
//!
//! Layout under the proxy directory:
//!
//! ```text
//! proxy/
//!   proxy.conf          edge tier, stream context
//!   terminate.conf      terminate tier, http context
//!   map/internal.conf   domain -> terminate tier
//!   map/passthrough.conf
//!   map/terminate.conf  domain -> backend
//! ```

use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::Registry;
use crate::routing::{RoutingMapBuilder, RoutingMaps};
use crate::services::{self, ServiceRecord};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::info;

const HEADER: &str = "# Generated by stackgate. Do not edit.\n";

/// Docker's embedded DNS, needed for upstreams held in variables
const RESOLVER: &str = "127.0.0.11";

pub struct NginxWriter {
    proxy_dir: PathBuf,
    builder: RoutingMapBuilder,
    terminate_port: u16,
    certs_dir: String,
}

impl NginxWriter {
    pub fn new(proxy_dir: impl Into<PathBuf>) -> Self {
        Self {
            proxy_dir: proxy_dir.into(),
            builder: RoutingMapBuilder::default(),
            terminate_port: 8443,
            certs_dir: "/etc/nginx/certs".to_string(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.paths.proxy_dir)
            .with_terminate(&config.proxy.terminate_host, config.proxy.terminate_port)
            .with_certs_dir(&config.proxy.certs_dir)
    }

    /// Set the terminate tier address (builder pattern)
    pub fn with_terminate(mut self, host: &str, port: u16) -> Self {
        self.builder = RoutingMapBuilder::new(host, port);
        self.terminate_port = port;
        self
    }

    /// Set the certificate root (builder pattern)
    pub fn with_certs_dir(mut self, certs_dir: &str) -> Self {
        self.certs_dir = certs_dir.to_string();
        self
    }

    pub fn proxy_dir(&self) -> &Path {
        &self.proxy_dir
    }

    pub fn write_maps(&self, maps: &RoutingMaps) -> Result<()> {
        let map_dir = self.proxy_dir.join("map");
        write_file(&map_dir.join("internal.conf"), &render_map(&maps.internal))?;
        write_file(&map_dir.join("passthrough.conf"), &render_map(&maps.passthrough))?;
        write_file(&map_dir.join("terminate.conf"), &render_map(&maps.terminate))?;
        Ok(())
    }

    pub fn write_proxy(&self) -> Result<()> {
        write_file(
            &self.proxy_dir.join("proxy.conf"),
            &render_proxy(&self.builder.terminate_address()),
        )
    }

    pub fn write_terminate(&self, records: &[ServiceRecord]) -> Result<()> {
        write_file(
            &self.proxy_dir.join("terminate.conf"),
            &render_terminate(records, self.terminate_port, &self.certs_dir),
        )
    }

    /// Regenerate every proxy file from `registry`
    pub fn write_nginx(&self, registry: &Registry) -> Result<RoutingMaps> {
        let records = services::enumerate(registry);
        let maps = self.builder.build(&records)?;

        self.write_maps(&maps)?;
        self.write_proxy()?;
        self.write_terminate(&records)?;

        info!(
            proxy_dir = %self.proxy_dir.display(),
            domains = maps.domain_count(),
            "Wrote proxy configuration"
        );
        Ok(maps)
    }
}

/// One `<domain> <upstream>;` line per entry
pub fn render_map(map: &BTreeMap<String, String>) -> String {
    let mut out = String::from(HEADER);
    for (domain, upstream) in map {
        let _ = writeln!(out, "{} {};", domain, upstream);
    }
    out
}

/// Edge tier: route on the SNI name without terminating TLS
pub fn render_proxy(terminate_address: &str) -> String {
    let mut out = String::from(HEADER);
    let _ = writeln!(out, "resolver {} valid=10s;", RESOLVER);
    out.push('\n');
    out.push_str("map $ssl_preread_server_name $edge_upstream {\n");
    out.push_str("    include map/internal.conf;\n");
    out.push_str("    include map/passthrough.conf;\n");
    let _ = writeln!(out, "    default {};", terminate_address);
    out.push_str("}\n\n");
    out.push_str("server {\n");
    out.push_str("    listen 443;\n");
    out.push_str("    ssl_preread on;\n");
    out.push_str("    proxy_pass $edge_upstream;\n");
    out.push_str("    proxy_protocol on;\n");
    out.push_str("}\n");
    out
}

/// Terminate tier: one server per terminated domain
pub fn render_terminate(records: &[ServiceRecord], port: u16, certs_dir: &str) -> String {
    let mut domains: BTreeMap<&str, Vec<&ServiceRecord>> = BTreeMap::new();
    for record in records.iter().filter(|r| r.enabled && !r.passthrough) {
        let routes = domains.entry(record.domain.as_str()).or_default();
        if !routes.iter().any(|r| r.route_prefix() == record.route_prefix()) {
            routes.push(record);
        }
    }

    let certs_dir = certs_dir.trim_end_matches('/');
    let mut out = String::from(HEADER);
    let _ = writeln!(out, "resolver {} valid=10s;", RESOLVER);
    out.push('\n');
    out.push_str("map $host $terminate_upstream {\n");
    out.push_str("    include map/terminate.conf;\n");
    out.push_str("}\n");

    for (domain, routes) in &domains {
        out.push('\n');
        out.push_str("server {\n");
        let _ = writeln!(out, "    listen {} ssl proxy_protocol;", port);
        let _ = writeln!(out, "    server_name {};", domain);
        let _ = writeln!(out, "    ssl_certificate {}/{}/fullchain.pem;", certs_dir, domain);
        let _ = writeln!(out, "    ssl_certificate_key {}/{}/privkey.pem;", certs_dir, domain);

        if routes.iter().any(|r| r.proxyprotocol) {
            out.push_str("    set_real_ip_from 0.0.0.0/0;\n");
            out.push_str("    real_ip_header proxy_protocol;\n");
        }

        for route in routes {
            out.push('\n');
            render_location(&mut out, route);
        }
        out.push_str("}\n");
    }

    out
}

fn render_location(out: &mut String, route: &ServiceRecord) {
    match route.route_prefix() {
        None => {
            out.push_str("    location / {\n");
            out.push_str("        proxy_pass http://$terminate_upstream;\n");
        }
        Some(prefix) => {
            let _ = writeln!(out, "    location {}/ {{", prefix);
            let _ = writeln!(out, "        set $backend {};", route.upstream());
            if route.path_remove {
                let _ = writeln!(out, "        rewrite ^{}/?(.*)$ /$1 break;", prefix);
            }
            out.push_str("        proxy_pass http://$backend;\n");
        }
    }
    out.push_str("        proxy_set_header Host $host;\n");
    out.push_str("        proxy_set_header X-Real-IP $remote_addr;\n");
    out.push_str("        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n");
    out.push_str("        proxy_set_header X-Forwarded-Proto https;\n");
    out.push_str("    }\n");
}

fn write_file(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }
    std::fs::write(path, content).map_err(|e| Error::io(path, e))
}
