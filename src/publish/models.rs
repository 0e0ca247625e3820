//! Project data as the publisher sees it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Step count reported while a remote platform build runs.
pub const REMOTE_TOTAL_STEPS: u32 = 12;

/// Step count reported while a local docker build runs.
pub const LOCAL_DOCKER_TOTAL_STEPS: u32 = 14;

/// The publish-relevant subset of a project row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub id: String,
    pub owner_id: String,
    pub slug: String,
    pub custom_domain: Option<String>,
    pub use_custom_domain: bool,
    /// Empty until the remote platform has created an application.
    pub deployment_target_id: String,
    pub supervised_process_id: Option<u32>,
    pub build_last_step: u32,
    pub build_total_step: u32,
    /// Deploy-time values baked into the image as `ENV` lines.
    pub env: BTreeMap<String, String>,
}

impl Project {
    pub fn has_deployment_target(&self) -> bool {
        !self.deployment_target_id.is_empty()
    }

    /// The custom domain, when the project has opted into one.
    pub fn active_custom_domain(&self) -> Option<&str> {
        if !self.use_custom_domain {
            return None;
        }
        self.custom_domain
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
    }

    /// Public hostnames, custom domain first. The `{slug}.{main_domain}`
    /// hostname is always kept so links shared before the switch keep working.
    pub fn public_hosts(&self, main_domain: &str) -> Vec<String> {
        let mut hosts = Vec::new();
        if let Some(custom) = self.active_custom_domain() {
            hosts.push(custom.to_string());
        }
        hosts.push(format!("{}.{}", self.slug, main_domain));
        hosts
    }

    /// Comma-separated `https://` URLs in the form the platform expects.
    pub fn domains(&self, main_domain: &str) -> String {
        self.public_hosts(main_domain)
            .iter()
            .map(|host| format!("https://{}", host))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Parse the `env` column. Non-string values are rendered as JSON text and
/// nulls are dropped.
pub fn env_from_json(value: &serde_json::Value) -> BTreeMap<String, String> {
    let Some(object) = value.as_object() else {
        return BTreeMap::new();
    };
    object
        .iter()
        .filter_map(|(key, value)| match value {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some((key.clone(), s.clone())),
            other => Some((key.clone(), other.to_string())),
        })
        .collect()
}

#[cfg(test)]
pub(crate) fn sample_project(id: &str, owner_id: &str) -> Project {
    Project {
        id: id.to_string(),
        owner_id: owner_id.to_string(),
        slug: "acme-bakery".to_string(),
        custom_domain: None,
        use_custom_domain: false,
        deployment_target_id: String::new(),
        supervised_process_id: None,
        build_last_step: 0,
        build_total_step: 0,
        env: BTreeMap::from([("NEXT_PUBLIC_UMAMI_ID".to_string(), "umami-123".to_string())]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domains_without_custom_domain() {
        let project = sample_project("p1", "u1");
        assert_eq!(
            project.domains("sites.example.com"),
            "https://acme-bakery.sites.example.com"
        );
    }

    #[test]
    fn test_domains_with_custom_domain() {
        let mut project = sample_project("p1", "u1");
        project.custom_domain = Some("www.acme.com".to_string());
        project.use_custom_domain = true;
        assert_eq!(
            project.domains("sites.example.com"),
            "https://www.acme.com,https://acme-bakery.sites.example.com"
        );
    }

    #[test]
    fn test_custom_domain_ignored_when_disabled_or_blank() {
        let mut project = sample_project("p1", "u1");
        project.custom_domain = Some("www.acme.com".to_string());
        assert!(project.active_custom_domain().is_none());

        project.use_custom_domain = true;
        project.custom_domain = Some("   ".to_string());
        assert!(project.active_custom_domain().is_none());
    }

    #[test]
    fn test_env_from_json() {
        let value = serde_json::json!({
            "NEXT_PUBLIC_UMAMI_ID": "abc",
            "FEATURE_COUNT": 3,
            "UNSET": null
        });
        let env = env_from_json(&value);
        assert_eq!(env.get("NEXT_PUBLIC_UMAMI_ID").map(String::as_str), Some("abc"));
        assert_eq!(env.get("FEATURE_COUNT").map(String::as_str), Some("3"));
        assert!(!env.contains_key("UNSET"));
    }

    #[test]
    fn test_env_from_non_object_is_empty() {
        assert!(env_from_json(&serde_json::json!(null)).is_empty());
        assert!(env_from_json(&serde_json::json!("text")).is_empty());
    }
}
