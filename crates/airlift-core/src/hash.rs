//! Content hashing for entity naming and re-upload decisions.
//!
//! Hashes are computed over a normalized view of the configuration so that
//! cosmetic differences (field order in package lists, an explicit name)
//! do not change identity. Two environments with identical normalized
//! configs hash the same and are interchangeable on the remote side.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::{EnvironmentConfig, InstanceConfig, JobConfig};

/// Length of the hex hash suffix used in names and remote paths.
const HASH_LEN: usize = 12;

fn digest<T: Serialize>(value: &T) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let full = hex::encode(hasher.finalize());
    full[..HASH_LEN].to_string()
}

fn sorted(list: &Option<Vec<String>>) -> Option<Vec<String>> {
    list.as_ref().map(|v| {
        let mut v = v.clone();
        v.sort();
        v
    })
}

/// Normalized environment view: package lists sorted, name excluded.
#[derive(Serialize)]
struct NormalizedEnv {
    conda: Option<Vec<String>>,
    pip: Option<Vec<String>>,
    apt: Option<Vec<String>>,
}

/// Hash of an environment's normalized package configuration.
pub fn environment_hash(config: &EnvironmentConfig) -> String {
    digest(&NormalizedEnv {
        conda: sorted(&config.conda),
        pip: sorted(&config.pip),
        apt: sorted(&config.apt),
    })
}

/// Normalized job view: payload-defining fields only.
#[derive(Serialize)]
struct NormalizedJob<'a> {
    env_name: &'a Option<String>,
    run_script: &'a Option<String>,
    run_command: &'a Option<String>,
    upload_files: Option<Vec<String>>,
    input_file: &'a Option<String>,
    output_file: &'a Option<String>,
}

/// Hash of a job's payload-defining configuration.
pub fn job_hash(config: &JobConfig) -> String {
    digest(&NormalizedJob {
        env_name: &config.env_name,
        run_script: &config.run_script,
        run_command: &config.run_command,
        upload_files: sorted(&config.upload_files),
        input_file: &config.input_file,
        output_file: &config.output_file,
    })
}

/// Normalized instance view used for deterministic instance names.
#[derive(Serialize)]
struct NormalizedInstance<'a> {
    instance_type: &'a str,
    region: &'a Option<String>,
    cpus: Option<u32>,
}

/// Hash of an instance's identity-defining configuration.
pub fn instance_hash(config: &InstanceConfig, cpus: Option<u32>) -> String {
    digest(&NormalizedInstance {
        instance_type: &config.instance_type,
        region: &config.region,
        cpus,
    })
}
