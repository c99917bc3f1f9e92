//! Graceful reload of the proxy tiers

use crate::config::Config;
use crate::error::Result;
use crate::runner::{CommandRunner, CommandSpec};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Issues `nginx -s reload` inside the proxy compose services
pub struct ProxyReloader {
    runner: Arc<dyn CommandRunner>,
    docker: String,
    proxy_dir: PathBuf,
    edge_service: String,
    terminate_service: String,
}

impl ProxyReloader {
    pub fn new(runner: Arc<dyn CommandRunner>, proxy_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            docker: "docker".to_string(),
            proxy_dir: proxy_dir.into(),
            edge_service: "proxy".to_string(),
            terminate_service: "terminate".to_string(),
        }
    }

    pub fn from_config(runner: Arc<dyn CommandRunner>, config: &Config) -> Self {
        Self {
            runner,
            docker: config.commands.docker.clone(),
            proxy_dir: config.paths.proxy_dir.clone(),
            edge_service: config.proxy.edge_service.clone(),
            terminate_service: config.proxy.terminate_service.clone(),
        }
    }

    /// Reload one proxy service, or the edge tier then the terminate tier
    pub async fn reload_proxy(&self, service: Option<&str>) -> Result<()> {
        match service {
            Some(service) => self.reload(service).await,
            None => {
                self.reload(&self.edge_service).await?;
                self.reload(&self.terminate_service).await
            }
        }
    }

    async fn reload(&self, service: &str) -> Result<()> {
        info!(service, "Reloading proxy");
        let spec = CommandSpec::compose(
            &self.docker,
            &self.proxy_dir,
            ["exec", service, "nginx", "-s", "reload"],
        );
        self.runner.run(&spec).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::RecordingRunner;

    fn reloader(runner: &Arc<RecordingRunner>) -> ProxyReloader {
        ProxyReloader::new(runner.clone(), "proxy")
    }

    #[tokio::test]
    async fn test_reload_all_edge_then_terminate() {
        let runner = Arc::new(RecordingRunner::new());

        reloader(&runner).reload_proxy(None).await.unwrap();

        assert_eq!(
            runner.commands(),
            vec![
                "docker compose exec proxy nginx -s reload",
                "docker compose exec terminate nginx -s reload",
            ]
        );
        assert!(runner.calls().iter().all(|c| c.cwd == PathBuf::from("proxy")));
    }

    #[tokio::test]
    async fn test_reload_single_service() {
        let runner = Arc::new(RecordingRunner::new());

        reloader(&runner).reload_proxy(Some("terminate")).await.unwrap();

        assert_eq!(runner.commands(), vec!["docker compose exec terminate nginx -s reload"]);
    }

    #[tokio::test]
    async fn test_edge_failure_skips_terminate() {
        let runner = Arc::new(RecordingRunner::new().fail_on("exec proxy"));

        assert!(reloader(&runner).reload_proxy(None).await.is_err());
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_from_config_names() {
        let runner = Arc::new(RecordingRunner::new());
        let mut config = Config::default();
        config.proxy.edge_service = "edge".to_string();
        config.commands.docker = "podman".to_string();

        ProxyReloader::from_config(runner.clone(), &config)
            .reload_proxy(None)
            .await
            .unwrap();

        assert_eq!(
            runner.commands(),
            vec![
                "podman compose exec edge nginx -s reload",
                "podman compose exec terminate nginx -s reload",
            ]
        );
    }
}
