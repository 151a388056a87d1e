use std::{collections::BTreeMap, str::FromStr};

use serde::{Deserialize, Serialize};
use spackle_types::{FlagType, Version};

use crate::config::{Config, MergeError, ValidationError};

/// A compiler available on the site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CompilerEntry {
    /// Name and exact version, e.g. `gcc@12.3.0`.
    pub spec: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operating_system: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Flags by category that every package built with this compiler receives.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub flags: BTreeMap<String, String>,

    /// A runtime support package that every node built with this compiler depends on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,

    /// Unavailable compilers are only used for reused specs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available: Option<bool>,
}

impl CompilerEntry {
    /// Splits the spec into name and version.
    pub fn name_and_version(&self) -> Result<(String, Version), ValidationError> {
        let invalid = |message: String| ValidationError::InvalidValue("spec".to_string(), message);
        let (name, version) = self
            .spec
            .split_once('@')
            .ok_or_else(|| invalid(format!("'{}' must be written as name@version", self.spec)))?;
        if name.is_empty() {
            return Err(invalid(format!("'{}' has no compiler name", self.spec)));
        }
        let version = Version::from_str(version.trim_start_matches('='))
            .map_err(|e| invalid(e.to_string()))?;
        Ok((name.to_string(), version))
    }

    /// Returns the flags split into individual arguments.
    pub fn parsed_flags(&self) -> Result<Vec<(FlagType, Vec<String>)>, ValidationError> {
        self.flags
            .iter()
            .map(|(category, value)| {
                let path = format!("flags.{category}");
                let flag_type = FlagType::from_str(category).map_err(|_| {
                    ValidationError::InvalidValue(path.clone(), "unknown flag category".into())
                })?;
                let flags = shlex::split(value).ok_or_else(|| {
                    ValidationError::InvalidValue(path, format!("cannot split '{value}'"))
                })?;
                Ok((flag_type, flags))
            })
            .collect()
    }

    pub fn is_available(&self) -> bool {
        self.available.unwrap_or(true)
    }
}

/// The compilers of the site, most preferred first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompilersConfig(pub Vec<CompilerEntry>);

impl CompilersConfig {
    pub fn iter(&self) -> impl Iterator<Item = &CompilerEntry> {
        self.0.iter()
    }
}

impl Config for CompilersConfig {
    fn get_extension_name(&self) -> String {
        "compilers".to_string()
    }

    /// Compilers of the closer scope come first. An entry for the same compiler spec replaces
    /// the one from the outer scope.
    fn merge_config(self, other: &Self) -> Result<Self, MergeError> {
        let mut merged = other.0.clone();
        merged.extend(
            self.0
                .into_iter()
                .filter(|entry| !other.0.iter().any(|o| o.spec == entry.spec)),
        );
        Ok(CompilersConfig(merged))
    }

    fn validate(&self) -> Result<(), ValidationError> {
        for (idx, entry) in self.0.iter().enumerate() {
            entry
                .name_and_version()
                .and_then(|_| entry.parsed_flags())
                .map_err(|e| e.within(&format!("[{idx}]")))?;
        }
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        vec![
            "spec".to_string(),
            "operating-system".to_string(),
            "target".to_string(),
            "flags".to_string(),
            "runtime".to_string(),
            "available".to_string(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use spackle_types::FlagType;

    use super::CompilersConfig;
    use crate::config::{Config, ValidationError};

    #[test]
    fn test_parse_compilers() {
        let config: CompilersConfig = toml::from_str(
            r#"
            [[compilers]]
            spec = "gcc@12.3.0"
            operating-system = "ubuntu22.04"
            runtime = "gcc-runtime"
            flags = { cflags = "-O2 -g" }
            "#,
        )
        .map(|c: toml::Table| c["compilers"].clone())
        .and_then(|v| v.try_into())
        .unwrap();

        let entry = &config.0[0];
        let (name, version) = entry.name_and_version().unwrap();
        assert_eq!(name, "gcc");
        assert_eq!(version.to_string(), "12.3.0");
        assert_eq!(
            entry.parsed_flags().unwrap(),
            vec![(FlagType::Cflags, vec!["-O2".to_string(), "-g".to_string()])]
        );
        assert!(entry.is_available());
    }

    #[test]
    fn test_validate_reports_index() {
        let config = CompilersConfig(vec![super::CompilerEntry {
            spec: "gcc".to_string(),
            operating_system: None,
            target: None,
            flags: Default::default(),
            runtime: None,
            available: None,
        }]);
        assert_matches!(
            config.validate(),
            Err(ValidationError::InvalidValue(path, _)) if path == "[0].spec"
        );
    }
}
