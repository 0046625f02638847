//! Inventory: the arena of entities loaded from one configuration.
//!
//! Instances, environments and jobs are stored in flat vectors; all
//! cross-references between them are vector indices ([`InstanceId`],
//! [`EnvId`], [`JobId`]). Entities that are mutated by fan-out workers
//! live behind `Arc<RwLock<_>>`; environments are immutable after load.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::config::AirliftConfig;
use crate::entity::{
    EnvId, Environment, Instance, InstanceId, Job, JobId, SharedInstance, SharedJob,
};
use crate::error::{ConfigError, ConfigResult};
use crate::expand::{self, CpuCatalog};

/// All entities of one run.
#[derive(Debug)]
pub struct Inventory {
    pub instances: Vec<SharedInstance>,
    pub environments: Vec<Arc<Environment>>,
    pub jobs: Vec<SharedJob>,
}

impl Inventory {
    /// Load every entity from the configuration: expand instance requests
    /// against the provider catalog, build environments, build jobs and
    /// link each job to exactly one environment.
    ///
    /// Linking rules: a job without `env_name` takes the single defined
    /// environment; with several environments defined the omission is a
    /// fatal error, as is an `env_name` that resolves to nothing.
    pub fn load(config: &AirliftConfig, catalog: &dyn CpuCatalog) -> ConfigResult<Self> {
        let project = config.project.as_deref();

        let mut instances: Vec<SharedInstance> = Vec::new();
        for inst_cfg in &config.instances {
            for spec in expand::expand_request(inst_cfg, catalog, project, config.dev)? {
                instances.push(Arc::new(RwLock::new(Instance::new(spec))));
            }
        }
        debug!(count = instances.len(), "expanded instances");

        let environments: Vec<Arc<Environment>> = config
            .environments
            .iter()
            .map(|env_cfg| {
                Arc::new(Environment::new(
                    config.project.clone(),
                    config.dev,
                    env_cfg.clone(),
                ))
            })
            .collect();

        let mut jobs: Vec<SharedJob> = Vec::new();
        for (rank, job_cfg) in config.jobs.iter().enumerate() {
            let mut job = Job::new(job_cfg.clone(), rank)?;
            let env = resolve_environment(&job, &environments, rank)?;
            job.attach_env(env);
            jobs.push(Arc::new(RwLock::new(job)));
        }

        Ok(Self {
            instances,
            environments,
            jobs,
        })
    }

    /// Look up an environment by derived name.
    pub fn environment_by_name(&self, name: &str) -> Option<(EnvId, &Arc<Environment>)> {
        self.environments
            .iter()
            .enumerate()
            .find(|(_, env)| env.name == name)
    }

    /// Look up an instance by rank.
    pub async fn instance_by_rank(&self, rank: &str) -> Option<(InstanceId, SharedInstance)> {
        for (id, instance) in self.instances.iter().enumerate() {
            if instance.read().await.spec.rank == rank {
                return Some((id, instance.clone()));
            }
        }
        None
    }

    /// The environment attached to a job. Jobs always leave [`load`] with
    /// an environment, so a `None` here is a programming error surfaced as
    /// such by callers.
    pub fn environment_of(&self, job: &Job) -> Option<&Arc<Environment>> {
        job.env.and_then(|id| self.environments.get(id))
    }
}

fn resolve_environment(
    job: &Job,
    environments: &[Arc<Environment>],
    rank: JobId,
) -> ConfigResult<EnvId> {
    match &job.config.env_name {
        None => {
            if environments.is_empty() {
                Err(ConfigError::NoEnvironments)
            } else if environments.len() == 1 {
                Ok(0)
            } else {
                Err(ConfigError::AmbiguousEnvironment { rank })
            }
        }
        Some(name) => environments
            .iter()
            .position(|env| &env.name == name)
            .ok_or_else(|| ConfigError::UnknownEnvironment {
                rank,
                name: name.clone(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnvironmentConfig, InstanceConfig, JobConfig};

    struct NoCatalog;

    impl CpuCatalog for NoCatalog {
        fn recommended_cpus(&self, _instance_type: &str) -> Option<Vec<u32>> {
            None
        }
        fn core_count(&self, _instance_type: &str) -> Option<u32> {
            None
        }
    }

    fn base_config() -> AirliftConfig {
        AirliftConfig {
            project: Some("demo".to_string()),
            dev: false,
            job_assign: Default::default(),
            print_deploy: false,
            instances: vec![InstanceConfig {
                instance_type: "c5.large".to_string(),
                region: None,
                cpus: None,
                explode: None,
                number: Some(2),
                remote_user: "ubuntu".to_string(),
            }],
            environments: vec![EnvironmentConfig {
                name: Some("e1".to_string()),
                conda: None,
                pip: Some(vec!["requests".to_string()]),
                apt: None,
            }],
            jobs: vec![JobConfig {
                env_name: None,
                run_script: None,
                run_command: Some("echo hi".to_string()),
                upload_files: None,
                input_file: Some("in.txt".to_string()),
                output_file: Some("out.txt".to_string()),
                cpus: None,
            }],
        }
    }

    #[tokio::test]
    async fn load_links_job_to_single_environment() {
        let inventory = Inventory::load(&base_config(), &NoCatalog).unwrap();
        assert_eq!(inventory.instances.len(), 2);
        assert_eq!(inventory.environments.len(), 1);
        assert_eq!(inventory.jobs.len(), 1);

        let job = inventory.jobs[0].read().await;
        assert_eq!(job.env, Some(0));
        assert!(job.instance.is_none());
    }

    #[test]
    fn ambiguous_environment_is_fatal() {
        let mut config = base_config();
        config.environments.push(EnvironmentConfig {
            name: Some("e2".to_string()),
            conda: None,
            pip: None,
            apt: None,
        });
        let err = Inventory::load(&config, &NoCatalog).unwrap_err();
        assert!(matches!(err, ConfigError::AmbiguousEnvironment { rank: 0 }));
    }

    #[test]
    fn unknown_environment_is_fatal() {
        let mut config = base_config();
        config.jobs[0].env_name = Some("missing".to_string());
        let err = Inventory::load(&config, &NoCatalog).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownEnvironment { .. }));
    }

    #[test]
    fn named_environment_resolves() {
        let mut config = base_config();
        config.jobs[0].env_name = Some("e1".to_string());
        let inventory = Inventory::load(&config, &NoCatalog).unwrap();
        assert!(inventory.environment_by_name("e1").is_some());
    }

    #[tokio::test]
    async fn instance_lookup_by_rank() {
        let inventory = Inventory::load(&base_config(), &NoCatalog).unwrap();
        let (id, instance) = inventory.instance_by_rank("2.1").await.unwrap();
        assert_eq!(id, 1);
        assert_eq!(instance.read().await.spec.rank, "2.1");
        assert!(inventory.instance_by_rank("9.9").await.is_none());
    }
}
