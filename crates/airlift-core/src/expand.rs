//! Instance request expansion.
//!
//! Turns one user instance request (type, desired cpu count, explode
//! flag, replica count) into concrete [`InstanceSpec`]s, honoring the
//! provider's recommended cpu increments for the type. Pure and
//! deterministic: the provider catalog is passed in as plain data.

use tracing::warn;

use crate::config::InstanceConfig;
use crate::entity::InstanceSpec;
use crate::error::{ConfigError, ConfigResult};
use crate::hash;

/// Provider knowledge needed by the expansion: valid cpu sizes per
/// instance type. Implemented by instance backends and by test catalogs.
pub trait CpuCatalog {
    /// Valid cpu counts for the type, ascending. `None` when the provider
    /// has no recommendation for it.
    fn recommended_cpus(&self, instance_type: &str) -> Option<Vec<u32>>;

    /// Physical core count reported for the type.
    fn core_count(&self, instance_type: &str) -> Option<u32>;
}

/// Expand one instance request into concrete specs, one group per replica.
///
/// Ranks are `"{replica}.{sub}"`, 1-indexed in emission order. The sum of
/// sub-instance cpus over a replica equals the requested total. A computed
/// sub-instance cpu count that the provider does not accept fails the
/// whole expansion — no partial spec list is returned.
pub fn expand_request(
    config: &InstanceConfig,
    catalog: &dyn CpuCatalog,
    project: Option<&str>,
    dev: bool,
) -> ConfigResult<Vec<InstanceSpec>> {
    let number = config.number.unwrap_or(1);
    let recommended = catalog.recommended_cpus(&config.instance_type);
    if recommended.is_none() {
        warn!(
            instance_type = %config.instance_type,
            "no recommended cpu sizes for instance type"
        );
    }

    let mut specs = Vec::new();
    for replica in 1..=number {
        match &recommended {
            None => {
                if config.cpus.is_some() {
                    warn!(
                        instance_type = %config.instance_type,
                        "dropping cpu requirement: provider reports no valid sizes"
                    );
                }
                specs.push(make_spec(config, format!("{replica}.1"), None, project, dev));
            }
            Some(valid) => {
                let cpu_split = *valid.last().unwrap_or(&1);
                expand_replica(
                    config, catalog, valid, cpu_split, replica, project, dev, &mut specs,
                )?;
            }
        }
    }
    Ok(specs)
}

/// Expand a single replica against a known recommended-size list.
#[allow(clippy::too_many_arguments)]
fn expand_replica(
    config: &InstanceConfig,
    catalog: &dyn CpuCatalog,
    valid: &[u32],
    cpu_split: u32,
    replica: u32,
    project: Option<&str>,
    dev: bool,
    specs: &mut Vec<InstanceSpec>,
) -> ConfigResult<()> {
    // Resolve the requested total: a non-numeric request falls back to the
    // provider's reported core count, default 1.
    let total = match config.cpus.as_ref().and_then(|c| c.count()) {
        Some(n) => n,
        None => {
            let cores = catalog.core_count(&config.instance_type).unwrap_or(1);
            warn!(
                instance_type = %config.instance_type,
                cpus = cores,
                "defaulting cpu count to the type's core count"
            );
            cores
        }
    };

    // Never silently under-provision: a total above one machine's capacity
    // forces a split.
    let mut explode = config.explode.unwrap_or(false);
    if !explode && total > cpu_split {
        warn!(
            instance_type = %config.instance_type,
            total,
            cpu_split,
            "forcing explode: requested cpus exceed the largest valid size"
        );
        explode = true;
    }

    let (sub_count, increment) = if explode {
        let n = total / cpu_split;
        if n == 0 { (1, total) } else { (n + 1, cpu_split) }
    } else {
        (1, total)
    };

    let mut created = 0;
    for sub in 1..=sub_count {
        let cpus = if sub == sub_count {
            // The last sub-instance takes whatever remains.
            total - created
        } else {
            increment
        };
        if cpus == 0 {
            continue;
        }

        let rank = format!("{replica}.{sub}");
        if !valid.contains(&cpus) {
            return Err(ConfigError::CpuIncrement {
                rank,
                cpus,
                instance_type: config.instance_type.clone(),
                valid: valid.to_vec(),
            });
        }

        specs.push(make_spec(config, rank, Some(cpus), project, dev));
        created += cpus;
    }
    Ok(())
}

fn make_spec(
    config: &InstanceConfig,
    rank: String,
    cpus: Option<u32>,
    project: Option<&str>,
    dev: bool,
) -> InstanceSpec {
    InstanceSpec {
        instance_type: config.instance_type.clone(),
        region: config.region.clone(),
        rank,
        cpus,
        remote_user: config.remote_user.clone(),
        project: project.map(String::from),
        dev,
        hash: hash::instance_hash(config, cpus),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CpuRequest;
    use std::collections::HashMap;

    struct TestCatalog {
        recommended: HashMap<String, Vec<u32>>,
        cores: HashMap<String, u32>,
    }

    impl TestCatalog {
        fn new() -> Self {
            Self {
                recommended: HashMap::new(),
                cores: HashMap::new(),
            }
        }

        fn with(mut self, instance_type: &str, recommended: &[u32], cores: u32) -> Self {
            self.recommended
                .insert(instance_type.to_string(), recommended.to_vec());
            self.cores.insert(instance_type.to_string(), cores);
            self
        }
    }

    impl CpuCatalog for TestCatalog {
        fn recommended_cpus(&self, instance_type: &str) -> Option<Vec<u32>> {
            self.recommended.get(instance_type).cloned()
        }

        fn core_count(&self, instance_type: &str) -> Option<u32> {
            self.cores.get(instance_type).copied()
        }
    }

    fn request(instance_type: &str, cpus: Option<u32>, explode: Option<bool>, number: Option<u32>) -> InstanceConfig {
        InstanceConfig {
            instance_type: instance_type.to_string(),
            region: None,
            cpus: cpus.map(CpuRequest::Count),
            explode,
            number,
            remote_user: "ubuntu".to_string(),
        }
    }

    #[test]
    fn unknown_type_strips_cpu_requirement() {
        let catalog = TestCatalog::new();
        let config = request("weird.type", Some(8), None, Some(3));
        let specs = expand_request(&config, &catalog, None, false).unwrap();

        assert_eq!(specs.len(), 3);
        for (i, spec) in specs.iter().enumerate() {
            assert_eq!(spec.cpus, None);
            assert_eq!(spec.rank, format!("{}.1", i + 1));
        }
    }

    #[test]
    fn explode_splits_on_largest_increment() {
        let catalog = TestCatalog::new().with("c5.4xlarge", &[2, 4, 8, 16], 16);
        let config = request("c5.4xlarge", Some(40), Some(true), None);
        let specs = expand_request(&config, &catalog, None, false).unwrap();

        let cpus: Vec<u32> = specs.iter().map(|s| s.cpus.unwrap()).collect();
        assert_eq!(cpus, vec![16, 16, 8]);
        let ranks: Vec<&str> = specs.iter().map(|s| s.rank.as_str()).collect();
        assert_eq!(ranks, vec!["1.1", "1.2", "1.3"]);
        assert_eq!(cpus.iter().sum::<u32>(), 40);
    }

    #[test]
    fn explode_is_forced_when_total_exceeds_split() {
        let catalog = TestCatalog::new().with("c5.xlarge", &[2, 4], 4);
        let config = request("c5.xlarge", Some(8), None, None);
        let specs = expand_request(&config, &catalog, None, false).unwrap();

        let cpus: Vec<u32> = specs.iter().map(|s| s.cpus.unwrap()).collect();
        assert_eq!(cpus, vec![4, 4]);
    }

    #[test]
    fn exact_multiple_drops_zero_remainder() {
        let catalog = TestCatalog::new().with("c5.4xlarge", &[2, 4, 8, 16], 16);
        let config = request("c5.4xlarge", Some(32), Some(true), None);
        let specs = expand_request(&config, &catalog, None, false).unwrap();

        // 32 / 16 = two full sub-instances; the zero remainder is dropped
        // and its rank slot gaps.
        let cpus: Vec<u32> = specs.iter().map(|s| s.cpus.unwrap()).collect();
        assert_eq!(cpus, vec![16, 16]);
        let ranks: Vec<&str> = specs.iter().map(|s| s.rank.as_str()).collect();
        assert_eq!(ranks, vec!["1.1", "1.2"]);
    }

    #[test]
    fn invalid_sub_cpu_fails_whole_expansion() {
        // 10 = 8 + 2 under explode with split 8; remainder 2 is valid, but
        // a total of 13 leaves remainder 5 which is not in the list.
        let catalog = TestCatalog::new().with("c5.2xlarge", &[2, 4, 8], 8);
        let config = request("c5.2xlarge", Some(13), Some(true), None);
        let err = expand_request(&config, &catalog, None, false).unwrap_err();

        assert!(matches!(err, ConfigError::CpuIncrement { cpus: 5, .. }));
    }

    #[test]
    fn no_explode_keeps_single_instance() {
        let catalog = TestCatalog::new().with("c5.large", &[1, 2, 4], 4);
        let config = request("c5.large", Some(2), None, Some(2));
        let specs = expand_request(&config, &catalog, None, false).unwrap();

        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].rank, "1.1");
        assert_eq!(specs[1].rank, "2.1");
        assert_eq!(specs[0].cpus, Some(2));
    }

    #[test]
    fn non_numeric_cpus_falls_back_to_core_count() {
        let catalog = TestCatalog::new().with("t2.micro", &[1, 2], 2);
        let mut config = request("t2.micro", None, None, None);
        config.cpus = Some(CpuRequest::Auto("auto".to_string()));
        let specs = expand_request(&config, &catalog, None, false).unwrap();

        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].cpus, Some(2));
    }

    #[test]
    fn small_total_with_explode_stays_whole() {
        let catalog = TestCatalog::new().with("c5.4xlarge", &[2, 4, 8, 16], 16);
        let config = request("c5.4xlarge", Some(4), Some(true), None);
        let specs = expand_request(&config, &catalog, None, false).unwrap();

        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].cpus, Some(4));
        assert_eq!(specs[0].rank, "1.1");
    }
}
