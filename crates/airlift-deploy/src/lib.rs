//! Airlift deployment: the marker-driven, idempotent upload state machine.

mod error;
mod machine;

pub use error::{DeployError, DeployResult};
pub use machine::{DeployLedger, Deployer};

#[cfg(test)]
mod tests {
    use super::*;
    use airlift_core::config::{
        AirliftConfig, AssignPolicy, EnvironmentConfig, InstanceConfig, JobConfig,
    };
    use airlift_core::expand::CpuCatalog;
    use airlift_core::registry::Inventory;
    use airlift_remote::MemoryExecutor;

    struct NoCatalog;

    impl CpuCatalog for NoCatalog {
        fn recommended_cpus(&self, _t: &str) -> Option<Vec<u32>> {
            None
        }
        fn core_count(&self, _t: &str) -> Option<u32> {
            None
        }
    }

    fn config(env: EnvironmentConfig, jobs: Vec<JobConfig>) -> AirliftConfig {
        AirliftConfig {
            project: Some("demo".to_string()),
            dev: false,
            job_assign: AssignPolicy::Random,
            print_deploy: false,
            instances: vec![InstanceConfig {
                instance_type: "mem.large".to_string(),
                region: None,
                cpus: None,
                explode: None,
                number: None,
                remote_user: "ubuntu".to_string(),
            }],
            environments: vec![env],
            jobs,
        }
    }

    fn pip_env() -> EnvironmentConfig {
        EnvironmentConfig {
            name: Some("e1".to_string()),
            conda: None,
            pip: Some(vec!["requests".to_string()]),
            apt: None,
        }
    }

    fn simple_job() -> JobConfig {
        JobConfig {
            env_name: None,
            run_script: None,
            run_command: Some("python3 main.py".to_string()),
            upload_files: Some(vec!["data/set.csv".to_string()]),
            input_file: Some("in.json".to_string()),
            output_file: Some("out.json".to_string()),
            cpus: None,
        }
    }

    /// Inventory with the single job assigned to the single instance and
    /// the instance reachable at `host`.
    async fn deployed_inventory(env: EnvironmentConfig, jobs: Vec<JobConfig>, host: &str) -> Inventory {
        let inventory = Inventory::load(&config(env, jobs), &NoCatalog).unwrap();
        {
            let mut instance = inventory.instances[0].write().await;
            instance.dns_addr = Some(host.to_string());
            for job_id in 0..inventory.jobs.len() {
                instance.attach_job(job_id, "e1");
            }
        }
        for job in &inventory.jobs {
            job.write().await.instance = Some(0);
        }
        inventory
    }

    #[tokio::test]
    async fn deploy_is_idempotent() {
        let exec = MemoryExecutor::new();
        let inventory = deployed_inventory(pip_env(), vec![simple_job()], "h1").await;
        let deployer = Deployer::new(exec.clone(), false, false);

        let ledger = deployer.deploy(&inventory, 0).await.unwrap();
        assert!(ledger.instance_uploaded);
        assert_eq!(ledger.env_uploaded.get("e1"), Some(&true));
        assert_eq!(ledger.jobs_uploaded, 1);
        assert!(exec.upload_count("h1") > 0);
        assert!(exec.has_file("h1", "/home/ubuntu/run/run.sh"));
        assert!(exec.has_file("h1", "/home/ubuntu/run/e1/manifest.json"));

        // All markers are present now: the second pass uploads nothing.
        exec.reset_upload_count("h1");
        let ledger = deployer.deploy(&inventory, 0).await.unwrap();
        assert!(!ledger.instance_uploaded);
        assert_eq!(ledger.env_uploaded.get("e1"), Some(&false));
        assert_eq!(ledger.jobs_uploaded, 0);
        assert_eq!(exec.upload_count("h1"), 0);
    }

    #[tokio::test]
    async fn missing_local_files_are_skipped_not_fatal() {
        let exec = MemoryExecutor::new();
        let mut job = simple_job();
        job.run_script = Some("does/not/exist.py --flag".to_string());
        job.run_command = None;
        let inventory = deployed_inventory(pip_env(), vec![job], "h1").await;
        let deployer = Deployer::new(exec.clone(), false, false);

        let ledger = deployer.deploy(&inventory, 0).await.unwrap();
        // The payload marker is still written after best-effort uploads.
        assert_eq!(ledger.jobs_uploaded, 1);
        let files = exec.files("h1");
        assert!(files.iter().any(|f| f.ends_with("/ready")));
        assert!(!files.iter().any(|f| f.ends_with("exist.py")));
    }

    #[tokio::test]
    async fn vanished_conda_dir_forces_environment_reupload() {
        let exec = MemoryExecutor::new();
        let env = EnvironmentConfig {
            name: Some("e1".to_string()),
            conda: Some(vec!["numpy".to_string()]),
            pip: None,
            apt: None,
        };
        let inventory = deployed_inventory(env, vec![simple_job()], "h1").await;
        let deployer = Deployer::new(exec.clone(), false, false);

        deployer.deploy(&inventory, 0).await.unwrap();
        // Primary marker exists but the conda env was removed out of band.
        exec.remove_dir("h1", "/home/ubuntu/micromamba/envs/e1");
        let ledger = deployer.deploy(&inventory, 0).await.unwrap();
        assert_eq!(ledger.env_uploaded.get("e1"), Some(&true));
    }

    #[tokio::test]
    async fn reset_clears_all_markers() {
        let exec = MemoryExecutor::new();
        let inventory = deployed_inventory(pip_env(), vec![simple_job()], "h1").await;
        let deployer = Deployer::new(exec.clone(), false, false);

        deployer.deploy(&inventory, 0).await.unwrap();
        deployer.reset(&inventory, 0).await.unwrap();

        exec.reset_upload_count("h1");
        let ledger = deployer.deploy(&inventory, 0).await.unwrap();
        assert!(ledger.instance_uploaded);
        assert_eq!(ledger.jobs_uploaded, 1);
        assert!(exec.upload_count("h1") > 0);
    }

    #[tokio::test]
    async fn unreachable_instance_fails_deployment() {
        let exec = MemoryExecutor::new();
        exec.refuse("h1");
        let inventory = deployed_inventory(pip_env(), vec![simple_job()], "h1").await;
        let deployer = Deployer::new(exec, false, false);

        assert!(deployer.deploy(&inventory, 0).await.is_err());
    }
}
