use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Environment variable naming the settings file
pub const CONFIG_ENV: &str = "STACKGATE_CONFIG";

/// Settings file looked up in the working directory by default
pub const DEFAULT_CONFIG_FILE: &str = "stackgate.toml";

/// Global settings for stackgate
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Where the registry, compose stacks and proxy config live
    #[serde(default)]
    pub paths: PathsConfig,

    /// Proxy tier naming and addressing
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// External command execution
    #[serde(default)]
    pub commands: CommandsConfig,

    /// Webhook verification
    #[serde(default)]
    pub webhook: WebhookConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// Registry document (default: db.yml)
    #[serde(default = "default_registry")]
    pub registry: PathBuf,

    /// Parent of the per-project compose stacks (default: upstream)
    #[serde(default = "default_upstream_dir")]
    pub upstream_dir: PathBuf,

    /// Proxy compose project and generated nginx config (default: proxy)
    #[serde(default = "default_proxy_dir")]
    pub proxy_dir: PathBuf,
}

impl PathsConfig {
    /// Stack directory of one project
    pub fn project_dir(&self, project: &str) -> PathBuf {
        self.upstream_dir.join(project)
    }

    /// Directory holding the generated map files
    pub fn map_dir(&self) -> PathBuf {
        self.proxy_dir.join("map")
    }

    /// Resolve relative paths against `base`
    pub fn rebase(&mut self, base: &Path) {
        for path in [&mut self.registry, &mut self.upstream_dir, &mut self.proxy_dir] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            registry: default_registry(),
            upstream_dir: default_upstream_dir(),
            proxy_dir: default_proxy_dir(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Compose service of the edge tier (default: proxy)
    #[serde(default = "default_edge_service")]
    pub edge_service: String,

    /// Compose service of the terminate tier (default: terminate)
    #[serde(default = "default_terminate_service")]
    pub terminate_service: String,

    /// Host the edge tier forwards terminated domains to (default: terminate)
    #[serde(default = "default_terminate_host")]
    pub terminate_host: String,

    /// Port the terminate tier listens on (default: 8443)
    #[serde(default = "default_terminate_port")]
    pub terminate_port: u16,

    /// Certificate root inside the terminate container
    #[serde(default = "default_certs_dir")]
    pub certs_dir: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            edge_service: default_edge_service(),
            terminate_service: default_terminate_service(),
            terminate_host: default_terminate_host(),
            terminate_port: default_terminate_port(),
            certs_dir: default_certs_dir(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CommandsConfig {
    /// Docker CLI binary (default: docker)
    #[serde(default = "default_docker")]
    pub docker: String,

    /// Bounded wait for a single command in seconds (default: 600)
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl CommandsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            docker: default_docker(),
            timeout_secs: default_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct WebhookConfig {
    /// Shared secret for X-Hub-Signature-256 verification
    pub secret: Option<String>,
}

fn default_registry() -> PathBuf {
    PathBuf::from("db.yml")
}

fn default_upstream_dir() -> PathBuf {
    PathBuf::from("upstream")
}

fn default_proxy_dir() -> PathBuf {
    PathBuf::from("proxy")
}

fn default_edge_service() -> String {
    "proxy".to_string()
}

fn default_terminate_service() -> String {
    "terminate".to_string()
}

fn default_terminate_host() -> String {
    "terminate".to_string()
}

fn default_terminate_port() -> u16 {
    8443
}

fn default_certs_dir() -> String {
    "/etc/nginx/certs".to_string()
}

fn default_docker() -> String {
    "docker".to_string()
}

fn default_timeout() -> u64 {
    600
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let config = Self::from_toml(&content)?;
        debug!(path = %path.display(), "Settings loaded");
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            debug!(path = %path.display(), "No settings file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.proxy.edge_service.trim().is_empty() {
            errors.push("proxy: 'edge_service' must not be empty".to_string());
        }
        if self.proxy.terminate_service.trim().is_empty() {
            errors.push("proxy: 'terminate_service' must not be empty".to_string());
        }
        if self.proxy.terminate_host.trim().is_empty() {
            errors.push("proxy: 'terminate_host' must not be empty".to_string());
        }
        if self.proxy.terminate_port == 0 {
            errors.push("proxy: 'terminate_port' must be greater than 0".to_string());
        }
        if self.commands.docker.trim().is_empty() {
            errors.push("commands: 'docker' must not be empty".to_string());
        }
        if self.commands.timeout_secs == 0 {
            errors.push("commands: 'timeout_secs' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(Error::Validation(errors));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[paths]
registry = "/srv/stack/db.yml"
upstream_dir = "/srv/stack/upstream"

[proxy]
terminate_port = 9443
certs_dir = "/certs"

[commands]
docker = "/usr/local/bin/docker"
timeout_secs = 30

[webhook]
secret = "s3cret"
"#;

        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.paths.registry, PathBuf::from("/srv/stack/db.yml"));
        assert_eq!(config.paths.upstream_dir, PathBuf::from("/srv/stack/upstream"));
        assert_eq!(config.paths.proxy_dir, PathBuf::from("proxy"));
        assert_eq!(config.proxy.terminate_port, 9443);
        assert_eq!(config.proxy.terminate_host, "terminate");
        assert_eq!(config.proxy.certs_dir, "/certs");
        assert_eq!(config.commands.docker, "/usr/local/bin/docker");
        assert_eq!(config.commands.timeout(), Duration::from_secs(30));
        assert_eq!(config.webhook.secret.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_empty_config() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.paths.registry, PathBuf::from("db.yml"));
        assert_eq!(config.paths.upstream_dir, PathBuf::from("upstream"));
        assert_eq!(config.paths.proxy_dir, PathBuf::from("proxy"));
        assert_eq!(config.proxy.edge_service, "proxy");
        assert_eq!(config.proxy.terminate_service, "terminate");
        assert_eq!(config.proxy.terminate_port, 8443);
        assert_eq!(config.commands.docker, "docker");
        assert_eq!(config.commands.timeout_secs, 600);
        assert!(config.webhook.secret.is_none());
    }

    #[test]
    fn test_path_helpers() {
        let paths = PathsConfig::default();
        assert_eq!(paths.project_dir("whoami"), PathBuf::from("upstream/whoami"));
        assert_eq!(paths.map_dir(), PathBuf::from("proxy/map"));
    }

    #[test]
    fn test_rebase_only_touches_relative_paths() {
        let mut paths = PathsConfig {
            registry: PathBuf::from("/abs/db.yml"),
            ..Default::default()
        };
        paths.rebase(Path::new("/srv"));

        assert_eq!(paths.registry, PathBuf::from("/abs/db.yml"));
        assert_eq!(paths.upstream_dir, PathBuf::from("/srv/upstream"));
        assert_eq!(paths.proxy_dir, PathBuf::from("/srv/proxy"));
    }

    #[test]
    fn test_validate_port_nonzero() {
        let err = Config::from_toml("[proxy]\nterminate_port = 0\n").unwrap_err();
        assert!(err.to_string().contains("'terminate_port' must be greater than 0"));
    }

    #[test]
    fn test_validate_multiple_errors() {
        let toml = r#"
[proxy]
edge_service = ""

[commands]
timeout_secs = 0
"#;
        let err = Config::from_toml(toml).unwrap_err().to_string();
        assert!(err.contains("'edge_service' must not be empty"));
        assert!(err.contains("'timeout_secs' must be greater than 0"));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let err = Config::from_toml("[proxy]\nterminate_port = \"high\"\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let tmp = TempDir::new().unwrap();
        let config = Config::load_or_default(tmp.path().join("stackgate.toml")).unwrap();
        assert_eq!(config.proxy.terminate_port, 8443);
    }

    #[test]
    fn test_load_from_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("stackgate.toml");
        std::fs::write(&path, "[proxy]\nedge_service = \"edge\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.proxy.edge_service, "edge");
    }
}
