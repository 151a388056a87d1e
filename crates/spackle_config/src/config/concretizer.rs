use std::{collections::BTreeMap, fmt};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use spackle_types::parse_spec;

use crate::config::{Config, MergeError, ValidationError};

/// The default cap on the number of nodes per package under the `full` duplicate strategy.
pub const DEFAULT_MAX_DUPES: usize = 2;

/// Which already concrete specs may be reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReuseMode {
    /// Reuse any eligible spec.
    #[default]
    Enabled,
    /// Always build everything.
    Disabled,
    /// Reuse dependencies but always build the requested roots.
    Dependencies,
}

impl Serialize for ReuseMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ReuseMode::Enabled => serializer.serialize_bool(true),
            ReuseMode::Disabled => serializer.serialize_bool(false),
            ReuseMode::Dependencies => serializer.serialize_str("dependencies"),
        }
    }
}

impl<'de> Deserialize<'de> for ReuseMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;

        impl de::Visitor<'_> for Visitor {
            type Value = ReuseMode;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("true, false or \"dependencies\"")
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<Self::Value, E> {
                Ok(if v {
                    ReuseMode::Enabled
                } else {
                    ReuseMode::Disabled
                })
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                match v {
                    "dependencies" => Ok(ReuseMode::Dependencies),
                    other => Err(E::invalid_value(de::Unexpected::Str(other), &self)),
                }
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

/// Whether all requested specs are solved together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnifyMode {
    /// All specs share one DAG with one node per package.
    #[default]
    Together,
    /// Each spec is solved on its own.
    Separately,
    /// Solve as many specs together as possible, in rounds.
    WhenPossible,
}

impl Serialize for UnifyMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            UnifyMode::Together => serializer.serialize_bool(true),
            UnifyMode::Separately => serializer.serialize_bool(false),
            UnifyMode::WhenPossible => serializer.serialize_str("when_possible"),
        }
    }
}

impl<'de> Deserialize<'de> for UnifyMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;

        impl de::Visitor<'_> for Visitor {
            type Value = UnifyMode;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("true, false or \"when_possible\"")
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> Result<Self::Value, E> {
                Ok(if v {
                    UnifyMode::Together
                } else {
                    UnifyMode::Separately
                })
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                match v {
                    "when_possible" | "when-possible" => Ok(UnifyMode::WhenPossible),
                    other => Err(E::invalid_value(de::Unexpected::Str(other), &self)),
                }
            }
        }

        deserializer.deserialize_any(Visitor)
    }
}

/// How many nodes of the same package may appear in one DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateStrategy {
    /// One node per package.
    None,
    /// Build tools may appear a second time in pure build subgraphs.
    #[default]
    Minimal,
    /// Counted per package over link/run and build subgraphs.
    Full,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DuplicatesConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<DuplicateStrategy>,

    /// Overrides the duplicate cap of individual packages.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub max_dupes: BTreeMap<String, usize>,
}

/// A source of reusable specs and the patterns that select from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ReuseSourceConfig {
    /// The name of the source, e.g. `local` or the name of a build cache.
    pub source: String,

    /// Only specs matching one of these are reused. Empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,

    /// Specs matching one of these are never reused.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
}

/// Replace dependencies matching `target` with an already concrete `replacement`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ExplicitSplice {
    pub target: String,
    pub replacement: String,
    #[serde(default)]
    pub transitive: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SpliceConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub explicit: Vec<ExplicitSplice>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetGranularity {
    /// Consider every known microarchitecture.
    Microarchitectures,
    /// Consider only generic targets such as `x86_64_v3`.
    Generic,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TargetsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granularity: Option<TargetGranularity>,

    /// Only consider targets the host can run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_compatible: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ConcretizerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reuse: Option<ReuseMode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unify: Option<UnifyMode>,

    #[serde(default, skip_serializing_if = "DuplicatesConfig::is_default")]
    pub duplicates: DuplicatesConfig,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reuse_from: Vec<ReuseSourceConfig>,

    #[serde(default, skip_serializing_if = "SpliceConfig::is_default")]
    pub splice: SpliceConfig,

    /// Allow deprecated versions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecated: Option<bool>,

    #[serde(default, skip_serializing_if = "TargetsConfig::is_default")]
    pub targets: TargetsConfig,

    /// Stop the search after this many complete models and return the best one found.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_limit: Option<u64>,
}

impl DuplicatesConfig {
    pub fn is_default(&self) -> bool {
        self == &Self::default()
    }
}

impl SpliceConfig {
    pub fn is_default(&self) -> bool {
        self.explicit.is_empty()
    }
}

impl TargetsConfig {
    pub fn is_default(&self) -> bool {
        self == &Self::default()
    }
}

impl ConcretizerConfig {
    pub fn reuse(&self) -> ReuseMode {
        self.reuse.unwrap_or_default()
    }

    pub fn unify(&self) -> UnifyMode {
        self.unify.unwrap_or_default()
    }

    pub fn duplicate_strategy(&self) -> DuplicateStrategy {
        self.duplicates.strategy.unwrap_or_default()
    }

    /// The duplicate cap for a package under the `full` strategy.
    pub fn max_dupes(&self, package: &str) -> usize {
        self.duplicates
            .max_dupes
            .get(package)
            .copied()
            .unwrap_or(DEFAULT_MAX_DUPES)
    }

    pub fn allow_deprecated(&self) -> bool {
        self.deprecated.unwrap_or(false)
    }
}

impl Config for ConcretizerConfig {
    fn get_extension_name(&self) -> String {
        "concretizer".to_string()
    }

    fn merge_config(self, other: &Self) -> Result<Self, MergeError> {
        Ok(Self {
            reuse: other.reuse.or(self.reuse),
            unify: other.unify.or(self.unify),
            duplicates: DuplicatesConfig {
                strategy: other.duplicates.strategy.or(self.duplicates.strategy),
                max_dupes: self
                    .duplicates
                    .max_dupes
                    .into_iter()
                    .chain(other.duplicates.max_dupes.clone())
                    .collect(),
            },
            reuse_from: if other.reuse_from.is_empty() {
                self.reuse_from
            } else {
                other.reuse_from.clone()
            },
            splice: SpliceConfig {
                explicit: other
                    .splice
                    .explicit
                    .iter()
                    .cloned()
                    .chain(self.splice.explicit)
                    .collect(),
            },
            deprecated: other.deprecated.or(self.deprecated),
            targets: TargetsConfig {
                granularity: other.targets.granularity.or(self.targets.granularity),
                host_compatible: other
                    .targets
                    .host_compatible
                    .or(self.targets.host_compatible),
            },
            search_limit: other.search_limit.or(self.search_limit),
        })
    }

    fn validate(&self) -> Result<(), ValidationError> {
        for (name, cap) in &self.duplicates.max_dupes {
            if *cap == 0 {
                return Err(ValidationError::InvalidValue(
                    format!("duplicates.max-dupes.{name}"),
                    "the duplicate cap must be at least 1".to_string(),
                ));
            }
        }
        for (idx, source) in self.reuse_from.iter().enumerate() {
            for (key, patterns) in [("include", &source.include), ("exclude", &source.exclude)] {
                for (pattern_idx, pattern) in patterns.iter().enumerate() {
                    parse_spec(pattern).map_err(|e| {
                        ValidationError::InvalidValue(
                            format!("reuse-from[{idx}].{key}[{pattern_idx}]"),
                            e.to_string(),
                        )
                    })?;
                }
            }
        }
        for (idx, splice) in self.splice.explicit.iter().enumerate() {
            for (key, text) in [("target", &splice.target), ("replacement", &splice.replacement)] {
                let spec = parse_spec(text).map_err(|e| {
                    ValidationError::InvalidValue(
                        format!("splice.explicit[{idx}].{key}"),
                        e.to_string(),
                    )
                })?;
                if spec.name.is_none() {
                    return Err(ValidationError::InvalidValue(
                        format!("splice.explicit[{idx}].{key}"),
                        "must name a package".to_string(),
                    ));
                }
            }
        }
        if self.search_limit == Some(0) {
            return Err(ValidationError::InvalidValue(
                "search-limit".to_string(),
                "must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        vec![
            "reuse".to_string(),
            "unify".to_string(),
            "duplicates.strategy".to_string(),
            "duplicates.max-dupes".to_string(),
            "reuse-from".to_string(),
            "splice.explicit".to_string(),
            "deprecated".to_string(),
            "targets.granularity".to_string(),
            "targets.host-compatible".to_string(),
            "search-limit".to_string(),
        ]
    }
}
