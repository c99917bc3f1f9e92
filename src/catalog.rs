//! Registry queries and upsert operations
//!
//! These are the only mutation entry points for the registry. Each mutation
//! is one transaction: take the store lock, load, replace-by-name or append,
//! validate and save the whole document.

use crate::error::{Error, Result};
use crate::models::{Env, Project, Registry, Service};
use crate::store::RegistryStore;
use tracing::info;

/// Query/upsert facade over a registry store
pub struct Catalog<S> {
    store: S,
}

impl<S: RegistryStore> Catalog<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Load a snapshot of the whole registry
    pub fn registry(&self) -> Result<Registry> {
        self.store.load()
    }

    pub fn get_projects(&self) -> Result<Vec<Project>> {
        Ok(self.store.load()?.projects)
    }

    /// Projects narrowed to the services matching `filter`; projects left
    /// without any matching service are dropped
    pub fn get_projects_matching<F>(&self, filter: F) -> Result<Vec<Project>>
    where
        F: Fn(&Project, &Service) -> bool,
    {
        let projects = self.get_projects()?;
        Ok(projects
            .into_iter()
            .filter_map(|project| {
                let services: Vec<Service> = project
                    .services
                    .iter()
                    .filter(|s| filter(&project, s))
                    .cloned()
                    .collect();
                if services.is_empty() {
                    None
                } else {
                    Some(Project { services, ..project })
                }
            })
            .collect())
    }

    pub fn get_project(&self, name: &str) -> Result<Project> {
        self.store
            .load()?
            .projects
            .into_iter()
            .find(|p| p.name == name)
            .ok_or_else(|| Error::project_not_found(name))
    }

    pub fn get_service(&self, project: &str, name: &str) -> Result<Service> {
        self.get_project(project)?
            .services
            .into_iter()
            .find(|s| s.host == name)
            .ok_or_else(|| Error::service_not_found(project, name))
    }

    /// Replace the whole project list, keeping versions and plugins
    pub fn write_projects(&self, projects: Vec<Project>) -> Result<()> {
        self.transaction(|registry| {
            registry.projects = projects;
            Ok(())
        })
    }

    /// Replace the project with the same name in place, or append it
    pub fn upsert_project(&self, project: Project) -> Result<()> {
        self.transaction(|registry| {
            match registry.projects.iter_mut().find(|p| p.name == project.name) {
                Some(existing) => {
                    info!(project = %project.name, "Replacing project");
                    *existing = project;
                }
                None => {
                    info!(project = %project.name, "Adding project");
                    registry.projects.push(project);
                }
            }
            Ok(())
        })
    }

    /// Replace the service with the same host in the project, or append it
    pub fn upsert_service(&self, project: &str, service: Service) -> Result<()> {
        self.transaction(|registry| {
            let target = project_mut(registry, project)?;

            match target.services.iter_mut().find(|s| s.host == service.host) {
                Some(existing) => {
                    info!(project, service = %service.host, "Replacing service");
                    *existing = service;
                }
                None => {
                    info!(project, service = %service.host, "Adding service");
                    target.services.push(service);
                }
            }
            Ok(())
        })
    }

    /// Merge `env` into the service's environment, under the same lock
    /// as the read so concurrent writers are not lost
    pub fn upsert_env(&self, project: &str, service: &str, env: Env) -> Result<()> {
        self.transaction(|registry| {
            let existing = project_mut(registry, project)?
                .services
                .iter_mut()
                .find(|s| s.host == service)
                .ok_or_else(|| Error::service_not_found(project, service))?;

            info!(project, service, keys = env.len(), "Merging environment");
            existing.env.merge(env);
            Ok(())
        })
    }

    fn transaction<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Registry) -> Result<()>,
    {
        let _lock = self.store.lock()?;
        let mut registry = self.store.load()?;
        mutate(&mut registry)?;
        self.store.save(&registry)
    }
}

fn project_mut<'a>(registry: &'a mut Registry, name: &str) -> Result<&'a mut Project> {
    registry
        .projects
        .iter_mut()
        .find(|p| p.name == name)
        .ok_or_else(|| Error::project_not_found(name))
}
