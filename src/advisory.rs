//! Deployment-topology advisory for the in-process counter store.
//!
//! Counters held in process memory are only correct when a single instance
//! serves all traffic. When the environment looks like a multi-instance
//! deployment and no shared backend is configured, a warning is logged once
//! per store construction. The check never fails or blocks construction.

use std::collections::HashMap;

use tracing::warn;

/// Variables set by orchestrators that usually run several replicas.
const ORCHESTRATION_MARKERS: &[&str] = &[
    "KUBERNETES_SERVICE_HOST",
    "KUBERNETES_PORT",
    "NOMAD_ALLOC_ID",
    "ECS_CONTAINER_METADATA_URI",
    "ECS_CONTAINER_METADATA_URI_V4",
];

/// Variables set by container runtimes.
const CONTAINER_MARKERS: &[&str] = &["container", "DOCKER_CONTAINER"];

/// Variables set by multi-process compose setups.
const COMPOSE_MARKERS: &[&str] = &["COMPOSE_PROJECT_NAME", "COMPOSE_SERVICE"];

/// Connection URLs that select a shared counter backend.
const SHARED_BACKEND_VARS: &[&str] = &["REDIS_URL", "DATABASE_URL", "TOLLGATE__STORE__REDIS_URL"];

/// A snapshot of environment variables.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    vars: HashMap<String, String>,
}

impl Environment {
    /// Snapshot the current process environment.
    pub fn capture() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// Build a snapshot from explicit pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// The value of `name`, if set to a non-blank value.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    /// Whether `name` is set to a non-blank value.
    pub fn is_set(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    fn present<'a>(&self, names: &[&'a str]) -> Vec<&'a str> {
        names.iter().copied().filter(|n| self.is_set(n)).collect()
    }
}

/// Why per-instance counters are unsafe in the observed environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyWarning {
    /// The marker variables that were found.
    pub markers: Vec<&'static str>,
}

impl TopologyWarning {
    pub fn message(&self) -> String {
        format!(
            "In-process rate limiting detected a multi-instance deployment ({}). \
             Limits are enforced per instance only and can be exceeded by spreading \
             requests across instances. Set REDIS_URL (or store.backend: redis with \
             store.redis_url) to share counters between instances.",
            self.markers.join(", ")
        )
    }
}

/// Decide whether the environment calls for a topology warning.
pub fn assess(env: &Environment) -> Option<TopologyWarning> {
    if !env.present(SHARED_BACKEND_VARS).is_empty() {
        return None;
    }

    let markers: Vec<&'static str> = [ORCHESTRATION_MARKERS, CONTAINER_MARKERS, COMPOSE_MARKERS]
        .iter()
        .flat_map(|group| env.present(group))
        .collect();

    if markers.is_empty() {
        None
    } else {
        Some(TopologyWarning { markers })
    }
}

/// Run the assessment and log the warning if one applies.
pub fn warn_if_multi_instance(env: &Environment) -> Option<TopologyWarning> {
    let warning = assess(env)?;
    warn!(
        markers = ?warning.markers,
        remedy = "REDIS_URL",
        "{}",
        warning.message()
    );
    Some(warning)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_markers_no_warning() {
        let env = Environment::from_pairs([("HOME", "/root"), ("PATH", "/usr/bin")]);
        assert_eq!(assess(&env), None);
    }

    #[test]
    fn test_kubernetes_without_backend_warns() {
        let env = Environment::from_pairs([("KUBERNETES_SERVICE_HOST", "10.96.0.1")]);
        let warning = assess(&env).unwrap();
        assert_eq!(warning.markers, vec!["KUBERNETES_SERVICE_HOST"]);
        assert!(warning.message().contains("REDIS_URL"));
        assert!(warning.message().contains("per instance"));
    }

    #[test]
    fn test_redis_url_suppresses_warning() {
        let env = Environment::from_pairs([
            ("KUBERNETES_SERVICE_HOST", "10.96.0.1"),
            ("REDIS_URL", "redis://cache:6379"),
        ]);
        assert_eq!(assess(&env), None);
    }

    #[test]
    fn test_database_url_suppresses_warning() {
        let env = Environment::from_pairs([
            ("COMPOSE_PROJECT_NAME", "shop"),
            ("DATABASE_URL", "postgres://db/shop"),
        ]);
        assert_eq!(assess(&env), None);
    }

    #[test]
    fn test_blank_values_are_ignored() {
        let env = Environment::from_pairs([("KUBERNETES_SERVICE_HOST", ""), ("REDIS_URL", " ")]);
        assert_eq!(assess(&env), None);

        let env = Environment::from_pairs([("container", "podman"), ("REDIS_URL", "")]);
        assert_eq!(assess(&env).unwrap().markers, vec!["container"]);
    }

    #[test]
    fn test_all_marker_groups_reported() {
        let env = Environment::from_pairs([
            ("NOMAD_ALLOC_ID", "abc"),
            ("DOCKER_CONTAINER", "1"),
            ("COMPOSE_SERVICE", "api"),
        ]);
        let warning = warn_if_multi_instance(&env).unwrap();
        assert_eq!(
            warning.markers,
            vec!["NOMAD_ALLOC_ID", "DOCKER_CONTAINER", "COMPOSE_SERVICE"]
        );
    }
}
