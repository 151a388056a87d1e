use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::config::{prefer_non_empty, Config, MergeError, ValidationError};

const DEFAULT_PLATFORM: &str = "linux";
const DEFAULT_OS: &str = "ubuntu22.04";
const DEFAULT_TARGET: &str = "x86_64";

/// The host platform and the operating systems and targets the concretizer may choose from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PlatformConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,

    /// The default operating system.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,

    /// The default target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// The C library of the host, e.g. `glibc@2.35`. When set, compatibility is decided by the
    /// libc version instead of the operating system.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub libc: Option<String>,

    /// Operating systems that may be chosen besides the default, most preferred first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub operating_systems: Vec<String>,

    /// Targets that may be chosen besides the default, most preferred first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,

    /// For each target, the targets it can run code for, nearest first.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub target_ancestors: IndexMap<String, Vec<String>>,

    /// For each operating system, the operating systems whose binaries run on it.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub os_compatibility: IndexMap<String, Vec<String>>,
}

impl PlatformConfig {
    pub fn host_platform(&self) -> &str {
        self.platform.as_deref().unwrap_or(DEFAULT_PLATFORM)
    }

    pub fn default_os(&self) -> &str {
        self.os.as_deref().unwrap_or(DEFAULT_OS)
    }

    pub fn default_target(&self) -> &str {
        self.target.as_deref().unwrap_or(DEFAULT_TARGET)
    }

    /// The operating systems in preference order, starting with the default.
    pub fn os_candidates(&self) -> Vec<&str> {
        let mut result = vec![self.default_os()];
        for os in &self.operating_systems {
            if !result.contains(&os.as_str()) {
                result.push(os);
            }
        }
        result
    }

    /// The targets in preference order, starting with the default and its ancestors.
    pub fn target_candidates(&self) -> Vec<&str> {
        let mut result = vec![self.default_target()];
        let ancestors = self
            .target_ancestors
            .get(self.default_target())
            .into_iter()
            .flatten();
        for target in ancestors.chain(&self.targets) {
            if !result.contains(&target.as_str()) {
                result.push(target);
            }
        }
        result
    }
}

impl Config for PlatformConfig {
    fn get_extension_name(&self) -> String {
        "platform".to_string()
    }

    fn merge_config(self, other: &Self) -> Result<Self, MergeError> {
        let mut target_ancestors = self.target_ancestors;
        target_ancestors.extend(other.target_ancestors.clone());
        let mut os_compatibility = self.os_compatibility;
        os_compatibility.extend(other.os_compatibility.clone());
        Ok(Self {
            platform: other.platform.clone().or(self.platform),
            os: other.os.clone().or(self.os),
            target: other.target.clone().or(self.target),
            libc: other.libc.clone().or(self.libc),
            operating_systems: prefer_non_empty(self.operating_systems, &other.operating_systems),
            targets: prefer_non_empty(self.targets, &other.targets),
            target_ancestors,
            os_compatibility,
        })
    }

    fn validate(&self) -> Result<(), ValidationError> {
        for (target, ancestors) in &self.target_ancestors {
            if ancestors.contains(target) {
                return Err(ValidationError::InvalidValue(
                    format!("target-ancestors.{target}"),
                    "a target cannot be its own ancestor".to_string(),
                ));
            }
        }
        if let Some(libc) = &self.libc {
            if spackle_types::parse_spec(libc)
                .ok()
                .and_then(|spec| spec.name)
                .is_none()
            {
                return Err(ValidationError::InvalidValue(
                    "libc".to_string(),
                    format!("'{libc}' must be a spec such as glibc@2.35"),
                ));
            }
        }
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        vec![
            "platform".to_string(),
            "os".to_string(),
            "target".to_string(),
            "libc".to_string(),
            "operating-systems".to_string(),
            "targets".to_string(),
            "target-ancestors".to_string(),
            "os-compatibility".to_string(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::PlatformConfig;

    #[test]
    fn test_candidates() {
        let config: PlatformConfig = toml::from_str(
            r#"
            target = "x86_64_v3"
            targets = ["x86_64", "aarch64"]
            operating-systems = ["ubuntu20.04"]
            [target-ancestors]
            x86_64_v3 = ["x86_64_v2", "x86_64"]
            "#,
        )
        .unwrap();
        assert_eq!(
            config.target_candidates(),
            vec!["x86_64_v3", "x86_64_v2", "x86_64", "aarch64"]
        );
        assert_eq!(config.os_candidates(), vec!["ubuntu22.04", "ubuntu20.04"]);
        assert_eq!(config.host_platform(), "linux");
    }
}
