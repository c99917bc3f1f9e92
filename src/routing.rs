//! Domain routing maps for the edge and terminate proxy tiers
//!
//! The edge tier looks up the SNI name in `internal` (send to the terminate
//! tier) and `passthrough` (send the raw TLS stream to the backend). The
//! terminate tier looks up the `Host` in `terminate` to find the backend.

use crate::error::{Error, Result};
use crate::services::ServiceRecord;
use std::collections::BTreeMap;
use tracing::debug;

/// The three domain maps consumed by the proxy configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingMaps {
    /// domain -> terminate tier address, for TLS-terminated domains
    pub internal: BTreeMap<String, String>,
    /// domain -> backend address, for TLS-terminated domains
    pub terminate: BTreeMap<String, String>,
    /// domain -> backend address, for passthrough domains
    pub passthrough: BTreeMap<String, String>,
}

impl RoutingMaps {
    pub fn is_empty(&self) -> bool {
        self.internal.is_empty() && self.passthrough.is_empty()
    }

    /// Number of distinct routed domains
    pub fn domain_count(&self) -> usize {
        self.internal.len() + self.passthrough.len()
    }
}

/// One routing target claimed for a domain
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    passthrough: bool,
    path_prefix: Option<String>,
    upstream: String,
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let class = if self.passthrough { "passthrough" } else { "terminate" };
        write!(f, "{} {}", class, self.upstream)?;
        if let Some(prefix) = &self.path_prefix {
            write!(f, " at {}", prefix)?;
        }
        Ok(())
    }
}

/// Builds [`RoutingMaps`] from enumerated service records
#[derive(Debug, Clone)]
pub struct RoutingMapBuilder {
    terminate_host: String,
    terminate_port: u16,
}

impl Default for RoutingMapBuilder {
    fn default() -> Self {
        Self::new("terminate", 8443)
    }
}

impl RoutingMapBuilder {
    pub fn new(terminate_host: &str, terminate_port: u16) -> Self {
        Self {
            terminate_host: terminate_host.to_string(),
            terminate_port,
        }
    }

    /// Address of the terminate tier as seen from the edge tier
    pub fn terminate_address(&self) -> String {
        format!("{}:{}", self.terminate_host, self.terminate_port)
    }

    /// Build the maps from `records`, ignoring records of disabled projects.
    ///
    /// A domain may be claimed by several terminated records as long as each
    /// claims its own path prefix. Any other double claim with a different
    /// target is a [`Error::ConfigurationConflict`]; repeating an identical
    /// claim is harmless.
    pub fn build(&self, records: &[ServiceRecord]) -> Result<RoutingMaps> {
        let mut claims: BTreeMap<&str, Vec<Target>> = BTreeMap::new();

        for record in records.iter().filter(|r| r.enabled) {
            let target = Target {
                passthrough: record.passthrough,
                path_prefix: if record.passthrough {
                    None
                } else {
                    record.route_prefix().map(str::to_string)
                },
                upstream: if record.passthrough {
                    record.passthrough_upstream()
                } else {
                    record.upstream()
                },
            };

            let existing = claims.entry(record.domain.as_str()).or_default();
            if existing.contains(&target) {
                continue;
            }
            if let Some(first) = existing.iter().find(|t| clashes(t, &target)) {
                return Err(Error::ConfigurationConflict {
                    domain: record.domain.clone(),
                    first: first.to_string(),
                    second: target.to_string(),
                });
            }
            existing.push(target);
        }

        let terminate_address = self.terminate_address();
        let mut maps = RoutingMaps::default();

        for (domain, targets) in claims {
            if targets[0].passthrough {
                maps.passthrough
                    .insert(domain.to_string(), targets[0].upstream.clone());
                continue;
            }

            // The root route owns the map entry; prefix-only domains use the first claim
            let primary = targets
                .iter()
                .find(|t| t.path_prefix.is_none())
                .unwrap_or(&targets[0]);
            maps.internal
                .insert(domain.to_string(), terminate_address.clone());
            maps.terminate
                .insert(domain.to_string(), primary.upstream.clone());
        }

        debug!(
            internal = maps.internal.len(),
            passthrough = maps.passthrough.len(),
            "Routing maps built"
        );
        Ok(maps)
    }
}

fn clashes(a: &Target, b: &Target) -> bool {
    a.passthrough || b.passthrough || a.path_prefix == b.path_prefix
}
