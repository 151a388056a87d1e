use std::str::FromStr;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use spackle_types::{parse_spec, Spec, VersionItem, VersionList};

use crate::config::{one_or_many, prefer_non_empty, Config, MergeError, ValidationError};

/// The key whose settings apply to every package.
pub const ALL_PACKAGES: &str = "all";

/// An external installation of a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExternalConfig {
    /// A spec describing the installation, e.g. `cmake@3.27.1 +ssl`.
    pub spec: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modules: Vec<String>,
}

/// The members of a requirement group and how many of them must hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequirementPolicy {
    /// The single spec must hold.
    Single(String),
    /// Exactly one of the specs must hold.
    OneOf(Vec<String>),
    /// At least one of the specs must hold.
    AnyOf(Vec<String>),
}

impl RequirementPolicy {
    pub fn members(&self) -> &[String] {
        match self {
            RequirementPolicy::Single(spec) => std::slice::from_ref(spec),
            RequirementPolicy::OneOf(specs) | RequirementPolicy::AnyOf(specs) => specs,
        }
    }
}

/// A `require`, `prefer` or `conflict` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequirementConfig {
    /// A plain spec string.
    Spec(String),
    /// A group with an explicit policy.
    Group(RequirementGroupConfig),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RequirementGroupConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub one_of: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub any_of: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl RequirementConfig {
    /// Returns the policy of the entry. Fails if a group sets none or more than one of `spec`,
    /// `one-of` and `any-of`.
    pub fn policy(&self) -> Result<RequirementPolicy, String> {
        match self {
            RequirementConfig::Spec(spec) => Ok(RequirementPolicy::Single(spec.clone())),
            RequirementConfig::Group(group) => {
                match (&group.spec, group.one_of.is_empty(), group.any_of.is_empty()) {
                    (Some(spec), true, true) => Ok(RequirementPolicy::Single(spec.clone())),
                    (None, false, true) => Ok(RequirementPolicy::OneOf(group.one_of.clone())),
                    (None, true, false) => Ok(RequirementPolicy::AnyOf(group.any_of.clone())),
                    _ => Err("exactly one of 'spec', 'one-of' or 'any-of' must be set".to_string()),
                }
            }
        }
    }

    pub fn when(&self) -> Option<&str> {
        match self {
            RequirementConfig::Spec(_) => None,
            RequirementConfig::Group(group) => group.when.as_deref(),
        }
    }

    pub fn message(&self) -> Option<&str> {
        match self {
            RequirementConfig::Spec(_) => None,
            RequirementConfig::Group(group) => group.message.as_deref(),
        }
    }
}

/// Settings for one package, or for all packages under the `all` key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PackageConfig {
    /// Preferred versions, most preferred first. Each entry must name a single version.
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "one_or_many")]
    pub version: Vec<String>,

    /// Preferred variant values, written as anonymous specs such as `+shared ~debug`.
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "one_or_many")]
    pub variants: Vec<String>,

    /// Preferred providers by virtual, most preferred first.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub providers: IndexMap<String, Vec<String>>,

    /// Preferred compilers, most preferred first.
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "one_or_many")]
    pub compiler: Vec<String>,

    /// Preferred targets, most preferred first.
    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "one_or_many")]
    pub target: Vec<String>,

    /// If false the package may only come from an external.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buildable: Option<bool>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub externals: Vec<ExternalConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "one_or_many")]
    pub require: Vec<RequirementConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "one_or_many")]
    pub prefer: Vec<RequirementConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "one_or_many")]
    pub conflict: Vec<RequirementConfig>,
}

impl PackageConfig {
    fn merge(self, other: &PackageConfig) -> PackageConfig {
        let mut providers = self.providers;
        for (virtual_name, list) in &other.providers {
            providers.insert(virtual_name.clone(), list.clone());
        }
        PackageConfig {
            version: prefer_non_empty(self.version, &other.version),
            variants: prefer_non_empty(self.variants, &other.variants),
            providers,
            compiler: prefer_non_empty(self.compiler, &other.compiler),
            target: prefer_non_empty(self.target, &other.target),
            buildable: other.buildable.or(self.buildable),
            externals: other
                .externals
                .iter()
                .cloned()
                .chain(self.externals)
                .collect(),
            require: prefer_non_empty(self.require, &other.require),
            prefer: prefer_non_empty(self.prefer, &other.prefer),
            conflict: prefer_non_empty(self.conflict, &other.conflict),
        }
    }

    fn validate(&self) -> Result<(), ValidationError> {
        for (idx, version) in self.version.iter().enumerate() {
            parse_version_preference(version)
                .map_err(|message| ValidationError::InvalidValue(format!("version[{idx}]"), message))?;
        }
        let specs = self
            .variants
            .iter()
            .enumerate()
            .map(|(i, s)| (format!("variants[{i}]"), s.as_str()))
            .chain(
                self.compiler
                    .iter()
                    .enumerate()
                    .map(|(i, s)| (format!("compiler[{i}]"), s.as_str())),
            )
            .chain(
                self.externals
                    .iter()
                    .enumerate()
                    .map(|(i, e)| (format!("externals[{i}].spec"), e.spec.as_str())),
            );
        for (path, text) in specs {
            parse_spec(text).map_err(|e| ValidationError::InvalidValue(path, e.to_string()))?;
        }
        for (key, entries) in [
            ("require", &self.require),
            ("prefer", &self.prefer),
            ("conflict", &self.conflict),
        ] {
            for (idx, entry) in entries.iter().enumerate() {
                let path = format!("{key}[{idx}]");
                let policy = entry
                    .policy()
                    .map_err(|message| ValidationError::InvalidValue(path.clone(), message))?;
                for text in policy.members().iter().map(String::as_str).chain(entry.when()) {
                    parse_spec(text)
                        .map_err(|e| ValidationError::InvalidValue(path.clone(), e.to_string()))?;
                }
            }
        }
        Ok(())
    }
}

/// Parses a version preference. Only a single version (`1.2` or `=1.2`) can be preferred.
pub fn parse_version_preference(text: &str) -> Result<spackle_types::Version, String> {
    let list = VersionList::from_str(text).map_err(|e| e.to_string())?;
    match list.items() {
        [VersionItem::Exact(version)] => Ok(version.clone()),
        [VersionItem::Range(range)] => match (&range.lo, &range.hi) {
            (Some(lo), Some(hi)) if lo == hi => Ok(lo.clone()),
            _ => Err(format!("'{text}' is a range, preferences must name a single version")),
        },
        _ => Err(format!("'{text}' must name a single version")),
    }
}

/// Per-package settings keyed by package name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackagesConfig(pub IndexMap<String, PackageConfig>);

impl PackagesConfig {
    pub fn get(&self, package: &str) -> Option<&PackageConfig> {
        self.0.get(package)
    }

    /// The settings under the `all` key.
    pub fn all(&self) -> Option<&PackageConfig> {
        self.0.get(ALL_PACKAGES)
    }

    /// Iterates over the package specific settings, excluding `all`.
    pub fn packages(&self) -> impl Iterator<Item = (&str, &PackageConfig)> {
        self.0
            .iter()
            .filter(|(name, _)| name.as_str() != ALL_PACKAGES)
            .map(|(name, config)| (name.as_str(), config))
    }

    /// Returns a package setting, falling back to the `all` settings when the package does not
    /// set it.
    pub fn lookup<'a, T: ?Sized>(
        &'a self,
        package: &str,
        select: impl Fn(&'a PackageConfig) -> Option<&'a T>,
    ) -> Option<&'a T> {
        self.get(package)
            .and_then(&select)
            .or_else(|| self.all().and_then(&select))
    }

    /// Returns true if the package may be built from source.
    pub fn is_buildable(&self, package: &str) -> bool {
        self.get(package)
            .and_then(|c| c.buildable)
            .or_else(|| self.all().and_then(|c| c.buildable))
            .unwrap_or(true)
    }

    /// Returns the parsed external specs of a package together with their configuration.
    pub fn externals(&self, package: &str) -> Vec<(Spec, &ExternalConfig)> {
        self.get(package)
            .map(|config| {
                config
                    .externals
                    .iter()
                    .filter_map(|external| {
                        parse_spec(&external.spec)
                            .ok()
                            .map(|spec| (spec, external))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Config for PackagesConfig {
    fn get_extension_name(&self) -> String {
        "packages".to_string()
    }

    fn merge_config(self, other: &Self) -> Result<Self, MergeError> {
        let mut merged = self.0;
        for (name, config) in &other.0 {
            let entry = merged.shift_remove(name).unwrap_or_default().merge(config);
            merged.insert(name.clone(), entry);
        }
        Ok(PackagesConfig(merged))
    }

    fn validate(&self) -> Result<(), ValidationError> {
        for (name, config) in &self.0 {
            config.validate().map_err(|e| e.within(name))?;
        }
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.0.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::{PackagesConfig, RequirementConfig, RequirementPolicy};
    use crate::config::{Config, ValidationError};

    fn parse(input: &str) -> PackagesConfig {
        toml::from_str(input).unwrap()
    }

    #[test]
    fn test_requirement_shapes() {
        let config = parse(
            r#"
            [zlib]
            require = "+shared"

            [hdf5]
            require = [
                "@1.14",
                { one-of = ["+mpi", "~mpi"], when = "%gcc", message = "pick one" },
                { any-of = ["+fortran", "+cxx"] },
            ]
            "#,
        );
        assert_eq!(
            config.get("zlib").unwrap().require,
            vec![RequirementConfig::Spec("+shared".to_string())]
        );
        let hdf5 = &config.get("hdf5").unwrap().require;
        assert_eq!(hdf5.len(), 3);
        assert_matches!(hdf5[1].policy(), Ok(RequirementPolicy::OneOf(specs)) if specs.len() == 2);
        assert_eq!(hdf5[1].when(), Some("%gcc"));
        assert_matches!(hdf5[2].policy(), Ok(RequirementPolicy::AnyOf(_)));
        config.validate().unwrap();
    }

    #[test]
    fn test_version_preference_must_be_single_version() {
        let config = parse(
            r#"
            [zlib]
            version = ["1.3", "1.2:"]
            "#,
        );
        assert_matches!(
            config.validate(),
            Err(ValidationError::InvalidValue(path, _)) if path == "zlib.version[1]"
        );
    }

    #[test]
    fn test_group_needs_exactly_one_policy() {
        let config = parse(
            r#"
            [zlib]
            require = [{ spec = "+shared", one-of = ["+pic"] }]
            "#,
        );
        assert_matches!(
            config.validate(),
            Err(ValidationError::InvalidValue(path, _)) if path == "zlib.require[0]"
        );
    }

    #[test]
    fn test_merge_and_lookup() {
        let site = parse(
            r#"
            [all]
            compiler = ["gcc"]
            buildable = true

            [cmake]
            buildable = false
            externals = [{ spec = "cmake@3.20", prefix = "/usr" }]
            "#,
        );
        let user = parse(
            r#"
            [all]
            compiler = ["clang"]

            [cmake]
            externals = [{ spec = "cmake@3.27", prefix = "/opt/cmake" }]
            "#,
        );
        let merged = site.merge_config(&user).unwrap();
        assert_eq!(
            merged.lookup("zlib", |c| c.compiler.first()),
            Some(&"clang".to_string())
        );
        assert!(!merged.is_buildable("cmake"));
        assert!(merged.is_buildable("zlib"));
        let externals = merged.externals("cmake");
        assert_eq!(externals.len(), 2);
        assert_eq!(externals[0].1.prefix.as_deref(), Some("/opt/cmake"));
    }
}
