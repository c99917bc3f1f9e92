//! Upstream lifecycle reconciliation
//!
//! Drives each project's compose stack towards its registry state: enabled
//! projects are rendered, pulled and brought up; disabled projects are taken
//! down. Every step is an awaited external command and a failing step aborts
//! the rest of that project's sequence.

use crate::catalog::Catalog;
use crate::compose;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::Project;
use crate::reload::ProxyReloader;
use crate::runner::{CommandRunner, CommandSpec};
use crate::store::RegistryStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Result of one project in a bulk reconciliation
#[derive(Debug)]
pub struct ProjectOutcome {
    pub project: String,
    pub result: Result<()>,
}

/// Outcomes of [`Reconciler::update_upstreams`], in scan order
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub outcomes: Vec<ProjectOutcome>,
    /// Stack directories with no matching registry project
    pub skipped: Vec<String>,
}

impl ReconcileReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &ProjectOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }

    pub fn reconciled(&self) -> Vec<&str> {
        self.outcomes.iter().map(|o| o.project.as_str()).collect()
    }
}

pub struct Reconciler<S> {
    catalog: Catalog<S>,
    runner: Arc<dyn CommandRunner>,
    reloader: ProxyReloader,
    docker: String,
    upstream_dir: PathBuf,
}

impl<S: RegistryStore> Reconciler<S> {
    pub fn new(
        store: S,
        runner: Arc<dyn CommandRunner>,
        upstream_dir: impl Into<PathBuf>,
        proxy_dir: impl Into<PathBuf>,
    ) -> Self {
        let reloader = ProxyReloader::new(runner.clone(), proxy_dir);
        Self {
            catalog: Catalog::new(store),
            runner,
            reloader,
            docker: "docker".to_string(),
            upstream_dir: upstream_dir.into(),
        }
    }

    pub fn from_config(store: S, runner: Arc<dyn CommandRunner>, config: &Config) -> Self {
        Self {
            catalog: Catalog::new(store),
            reloader: ProxyReloader::from_config(runner.clone(), config),
            runner,
            docker: config.commands.docker.clone(),
            upstream_dir: config.paths.upstream_dir.clone(),
        }
    }

    pub fn catalog(&self) -> &Catalog<S> {
        &self.catalog
    }

    pub fn reloader(&self) -> &ProxyReloader {
        &self.reloader
    }

    fn project_dir(&self, project: &str) -> PathBuf {
        self.upstream_dir.join(project)
    }

    /// Bring one project's stack in line with the registry.
    ///
    /// With `rollout` and a `service`, the service is additionally restarted
    /// without downtime. `rollout` without a service changes nothing.
    pub async fn update_upstream(
        &self,
        project: &str,
        service: Option<&str>,
        rollout: bool,
    ) -> Result<()> {
        let project = self.catalog.get_project(project)?;
        let dir = self.project_dir(&project.name);

        if !project.enabled {
            return self.take_down(&project.name, &dir).await;
        }

        let rollout_target = match (rollout, service) {
            (true, Some(service)) => {
                check_rollout(&project, service)?;
                Some(service)
            }
            _ => None,
        };

        if !project.has_upstreams() {
            debug!(project = %project.name, "No image-backed services, nothing to deploy");
            return Ok(());
        }

        info!(project = %project.name, "Updating upstream");
        compose::write(&project, &dir)?;
        self.compose(&dir, ["pull"]).await?;
        self.compose(&dir, ["up", "-d"]).await?;

        if let Some(service) = rollout_target {
            self.rollout(&project.name, service, &dir).await?;
        }

        Ok(())
    }

    /// Reconcile every stack directory that names a registry project, in
    /// sorted order. Failures are recorded and the scan continues.
    pub async fn update_upstreams(&self) -> Result<ReconcileReport> {
        let registry = self.catalog.registry()?;
        let mut report = ReconcileReport::default();

        for name in self.stack_dirs()? {
            if registry.project(&name).is_none() {
                debug!(dir = %name, "Skipping directory without project");
                report.skipped.push(name);
                continue;
            }

            let result = self.update_upstream(&name, None, false).await;
            if let Err(e) = &result {
                error!(project = %name, "Upstream update failed: {}", e);
            }
            report.outcomes.push(ProjectOutcome {
                project: name,
                result,
            });
        }

        info!(
            reconciled = report.outcomes.len(),
            failed = report.failures().count(),
            skipped = report.skipped.len(),
            "Reconciliation finished"
        );
        Ok(report)
    }

    /// Restart one service of a project without taking the stack down
    pub async fn rollout_service(&self, project: &str, service: &str) -> Result<()> {
        let project = self.catalog.get_project(project)?;
        check_rollout(&project, service)?;
        let dir = self.project_dir(&project.name);
        self.rollout(&project.name, service, &dir).await
    }

    /// Render the compose descriptor of one enabled project
    pub fn write_upstream(&self, project: &str) -> Result<Option<PathBuf>> {
        let project = self.catalog.get_project(project)?;
        self.write_project(&project)
    }

    /// Render the compose descriptor of every enabled project with an
    /// image-backed service
    pub fn write_upstreams(&self) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        for project in self.catalog.get_projects()? {
            if let Some(path) = self.write_project(&project)? {
                written.push(path);
            }
        }
        Ok(written)
    }

    fn write_project(&self, project: &Project) -> Result<Option<PathBuf>> {
        if !project.enabled || !project.has_upstreams() {
            debug!(project = %project.name, "Nothing to render");
            return Ok(None);
        }
        compose::write(project, &self.project_dir(&project.name)).map(Some)
    }

    async fn take_down(&self, project: &str, dir: &Path) -> Result<()> {
        info!(project, "Taking down disabled project");
        self.compose(dir, ["down"]).await
    }

    async fn rollout(&self, project: &str, service: &str, dir: &Path) -> Result<()> {
        let name = compose::service_name(project, service);
        info!(project, service, "Rolling out service");
        let spec = CommandSpec::new(&self.docker, dir).args(["rollout", name.as_str()]);
        self.runner.run(&spec).await
    }

    async fn compose<'a>(&self, dir: &Path, args: impl IntoIterator<Item = &'a str>) -> Result<()> {
        let spec = CommandSpec::compose(&self.docker, dir, args);
        self.runner.run(&spec).await
    }

    /// Immediate subdirectories of the upstream directory, sorted by name
    fn stack_dirs(&self) -> Result<Vec<String>> {
        if !self.upstream_dir.is_dir() {
            warn!(dir = %self.upstream_dir.display(), "Upstream directory missing");
            return Ok(Vec::new());
        }

        let entries = std::fs::read_dir(&self.upstream_dir)
            .map_err(|e| Error::io(&self.upstream_dir, e))?;

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::io(&self.upstream_dir, e))?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Only services deployed from an image have a container to roll out
fn check_rollout(project: &Project, service: &str) -> Result<()> {
    match project.service(service) {
        None => Err(Error::service_not_found(&project.name, service)),
        Some(s) if !s.is_upstream() => Err(Error::Validation(vec![format!(
            "project '{}': service '{}' has no image and cannot be rolled out",
            project.name, service
        )])),
        Some(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Registry, Service};
    use crate::runner::RecordingRunner;
    use crate::store::MemoryStore;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        upstream: PathBuf,
        runner: Arc<RecordingRunner>,
        reconciler: Reconciler<MemoryStore>,
    }

    fn fixture(projects: Vec<Project>) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let upstream = tmp.path().join("upstream");
        std::fs::create_dir_all(&upstream).unwrap();
        let runner = Arc::new(RecordingRunner::new());
        let store = MemoryStore::new(Registry {
            projects,
            ..Default::default()
        });
        let reconciler = Reconciler::new(store, runner.clone(), &upstream, tmp.path().join("proxy"));
        Fixture {
            _tmp: tmp,
            upstream,
            runner,
            reconciler,
        }
    }

    fn my_project() -> Project {
        Project::new("my-project")
            .with_service(Service::new("my-service").with_image("acme/app:1"))
            .with_entrypoint("my-service")
    }

    #[tokio::test]
    async fn test_enabled_project_pull_then_up() {
        let f = fixture(vec![my_project()]);

        f.reconciler.update_upstream("my-project", None, false).await.unwrap();

        assert_eq!(f.runner.commands(), vec!["docker compose pull", "docker compose up -d"]);
        assert!(f.runner.calls().iter().all(|c| c.cwd == f.upstream.join("my-project")));
        assert!(f.upstream.join("my-project/docker-compose.yml").is_file());
    }

    #[tokio::test]
    async fn test_rollout_without_service_is_ignored() {
        let f = fixture(vec![my_project()]);

        f.reconciler.update_upstream("my-project", None, true).await.unwrap();

        assert_eq!(f.runner.commands(), vec!["docker compose pull", "docker compose up -d"]);
    }

    #[tokio::test]
    async fn test_unknown_project_issues_nothing() {
        let f = fixture(vec![my_project()]);

        let err = f.reconciler.update_upstream("nope", None, false).await.unwrap_err();

        assert!(err.is_not_found());
        assert!(f.runner.calls().is_empty());
    }

    fn routing_only() -> Project {
        Project::new("home-assistant").with_service(
            Service::new("192.168.1.111")
                .with_port(8123)
                .with_domain("home.example.com"),
        )
    }

    #[tokio::test]
    async fn test_routing_only_project_deploys_nothing() {
        let f = fixture(vec![routing_only()]);

        f.reconciler
            .update_upstream("home-assistant", None, false)
            .await
            .unwrap();

        assert!(f.runner.calls().is_empty());
        assert!(!f.upstream.join("home-assistant").exists());
    }

    #[tokio::test]
    async fn test_routing_only_service_cannot_roll_out() {
        let f = fixture(vec![my_project().with_service(Service::new("legacy").with_port(80))]);

        let err = f
            .reconciler
            .update_upstream("my-project", Some("legacy"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let err = f.reconciler.rollout_service("my-project", "legacy").await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(f.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_rollout_service_issues_nothing() {
        let f = fixture(vec![my_project()]);

        let err = f
            .reconciler
            .update_upstream("my-project", Some("ghost"), true)
            .await
            .unwrap_err();

        assert!(err.is_not_found());
        assert!(f.runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_pull_aborts_sequence() {
        let tmp = TempDir::new().unwrap();
        let runner = Arc::new(RecordingRunner::new().fail_on("pull"));
        let reconciler = Reconciler::new(
            MemoryStore::new(Registry {
                projects: vec![my_project()],
                ..Default::default()
            }),
            runner.clone(),
            tmp.path().join("upstream"),
            tmp.path().join("proxy"),
        );

        let err = reconciler
            .update_upstream("my-project", Some("my-service"), true)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::CommandFailure { .. }));
        assert_eq!(runner.commands(), vec!["docker compose pull"]);
    }

    #[tokio::test]
    async fn test_disabled_project_goes_down_regardless_of_rollout() {
        let f = fixture(vec![my_project().with_enabled(false)]);

        f.reconciler
            .update_upstream("my-project", Some("my-service"), true)
            .await
            .unwrap();

        assert_eq!(f.runner.commands(), vec!["docker compose down"]);
        assert!(!f.upstream.join("my-project/docker-compose.yml").exists());
    }

    #[tokio::test]
    async fn test_rollout_service_directly() {
        let f = fixture(vec![my_project()]);

        f.reconciler.rollout_service("my-project", "my-service").await.unwrap();

        assert_eq!(f.runner.commands(), vec!["docker rollout my-project-my-service"]);
        assert!(f.reconciler.rollout_service("my-project", "nope").await.is_err());
    }

    #[test]
    fn test_write_upstreams_skips_routing_only_and_disabled() {
        let f = fixture(vec![
            my_project(),
            Project::new("external").with_service(Service::new("192.168.1.10")),
            Project::new("old")
                .with_service(Service::new("web").with_image("old:1"))
                .with_enabled(false),
        ]);

        let written = f.reconciler.write_upstreams().unwrap();

        assert_eq!(written, vec![f.upstream.join("my-project/docker-compose.yml")]);
        assert_eq!(f.reconciler.write_upstream("external").unwrap(), None);
        assert!(f.reconciler.write_upstream("missing").is_err());
    }

    #[test]
    fn test_report_accessors() {
        let report = ReconcileReport {
            outcomes: vec![
                ProjectOutcome {
                    project: "a".to_string(),
                    result: Ok(()),
                },
                ProjectOutcome {
                    project: "b".to_string(),
                    result: Err(Error::project_not_found("b")),
                },
            ],
            skipped: vec![],
        };

        assert!(!report.is_success());
        assert_eq!(report.reconciled(), vec!["a", "b"]);
        assert_eq!(report.failures().count(), 1);
    }
}
