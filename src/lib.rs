//! Stackgate - registry-driven control plane for a two-tier nginx edge
//!
//! This library keeps a YAML registry of projects and their services and
//! derives everything else from it:
//! - Domain routing maps for an SNI-routing edge proxy and a TLS-terminating tier
//! - Generated nginx configuration for both tiers
//! - One docker compose stack per project, reconciled against the registry
//! - Zero-downtime rollouts triggered by CI webhooks
//! - Graceful proxy reloads after configuration changes

pub mod catalog;
pub mod compose;
pub mod config;
pub mod error;
pub mod models;
pub mod nginx;
pub mod reload;
pub mod routing;
pub mod runner;
pub mod services;
pub mod store;
pub mod upstream;
pub mod webhooks;

pub use error::{Error, Result};
