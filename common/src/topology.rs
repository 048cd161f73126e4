//! Replication topology: which remote target a dataset inherits.
//!
//! Policies are declared on dataset subtrees. A dataset without its own
//! policy inherits the nearest ancestor's, with the remote dataset extended by
//! the path below that ancestor.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::model::ReplicationPolicy;

/// Effective replication policy of a dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedReplication {
    /// Policy with `target_dataset` adjusted for the resolved dataset
    pub policy: ReplicationPolicy,
    /// Dataset the policy is declared on
    pub declared_on: String,
}

impl ResolvedReplication {
    pub fn is_inherited(&self, dataset: &str) -> bool {
        self.declared_on != normalize(dataset)
    }
}

fn normalize(dataset: &str) -> &str {
    dataset.trim_matches('/')
}

fn parent(dataset: &str) -> Option<&str> {
    dataset.rsplit_once('/').map(|(parent, _)| parent)
}

/// Resolves the replication policy `dataset` inherits, if any.
pub fn resolve(
    policies: &BTreeMap<String, ReplicationPolicy>,
    dataset: &str,
) -> Option<ResolvedReplication> {
    let dataset = normalize(dataset);
    if dataset.is_empty() {
        return None;
    }

    let mut current = dataset;
    loop {
        if let Some(policy) = policies.get(current) {
            let suffix = &dataset[current.len()..];
            let mut policy = policy.clone();
            if !suffix.is_empty() {
                policy.target_dataset =
                    format!("{}{}", policy.target_dataset.trim_end_matches('/'), suffix);
            }
            return Some(ResolvedReplication {
                policy,
                declared_on: current.to_string(),
            });
        }
        current = parent(current)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(host: &str, target: &str) -> ReplicationPolicy {
        ReplicationPolicy {
            target_host: host.to_string(),
            target_dataset: target.to_string(),
            send_options: "w".to_string(),
            recv_options: "u".to_string(),
            host_key: None,
            ssh_user: "zfs-replication".to_string(),
            ssh_key: None,
            ssh_port: 22,
        }
    }

    fn policies() -> BTreeMap<String, ReplicationPolicy> {
        let mut map = BTreeMap::new();
        map.insert(
            "tank/services".to_string(),
            policy("nas-1", "backup/forge/zfs-recv"),
        );
        map.insert(
            "tank/services/plex".to_string(),
            policy("nas-2", "media/plex"),
        );
        map
    }

    /// `adjust` from the inheritance rule: extend the parent's target by the last segment
    fn adjust(parent: Option<ResolvedReplication>, leaf: &str) -> Option<ResolvedReplication> {
        parent.map(|mut resolved| {
            let segment = leaf.rsplit_once('/').map(|(_, s)| s).unwrap_or(leaf);
            resolved.policy.target_dataset =
                format!("{}/{}", resolved.policy.target_dataset, segment);
            resolved
        })
    }

    #[test]
    fn test_inherits_from_ancestor() {
        let resolved = resolve(&policies(), "tank/services/sonarr").unwrap();
        assert_eq!(resolved.policy.target_host, "nas-1");
        assert_eq!(resolved.policy.target_dataset, "backup/forge/zfs-recv/sonarr");
        assert_eq!(resolved.declared_on, "tank/services");
        assert!(resolved.is_inherited("tank/services/sonarr"));
    }

    #[test]
    fn test_explicit_policy_is_unmodified() {
        let map = policies();
        let resolved = resolve(&map, "tank/services/plex").unwrap();
        assert_eq!(resolved.policy, map["tank/services/plex"]);
        assert!(!resolved.is_inherited("tank/services/plex"));

        let resolved = resolve(&map, "/tank/services/").unwrap();
        assert_eq!(resolved.policy, map["tank/services"]);
    }

    #[test]
    fn test_deep_descendant_keeps_full_suffix() {
        let resolved = resolve(&policies(), "tank/services/sonarr/config/db").unwrap();
        assert_eq!(
            resolved.policy.target_dataset,
            "backup/forge/zfs-recv/sonarr/config/db"
        );
    }

    #[test]
    fn test_no_policy_resolves_to_none() {
        assert!(resolve(&policies(), "tank/home").is_none());
        assert!(resolve(&policies(), "tank").is_none());
        assert!(resolve(&policies(), "").is_none());
        assert!(resolve(&BTreeMap::new(), "tank/services/sonarr").is_none());
    }

    #[test]
    fn test_prefix_matches_whole_segments_only() {
        assert!(resolve(&policies(), "tank/services2/sonarr").is_none());
        let resolved = resolve(&policies(), "tank/services/plexmediaserver").unwrap();
        assert_eq!(resolved.declared_on, "tank/services");
    }

    #[test]
    fn test_resolution_matches_parent_adjustment() {
        let map = policies();
        for dataset in [
            "tank/services/sonarr",
            "tank/services/sonarr/config",
            "tank/services/plex/transcode",
            "tank/home/alice",
        ] {
            if map.contains_key(dataset) {
                continue;
            }
            let parent = dataset.rsplit_once('/').map(|(p, _)| p).unwrap();
            let expected = adjust(resolve(&map, parent), dataset);
            let actual = resolve(&map, dataset);
            assert_eq!(
                actual.as_ref().map(|r| &r.policy),
                expected.as_ref().map(|r| &r.policy),
                "dataset {dataset}"
            );
        }
    }

    #[test]
    fn test_repeated_calls_are_stable() {
        let map = policies();
        let first = resolve(&map, "tank/services/sonarr");
        let second = resolve(&map, "tank/services/sonarr");
        assert_eq!(first, second);
    }
}
