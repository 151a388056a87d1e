use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::config::{
    compilers::CompilersConfig, concretizer::ConcretizerConfig, packages::PackagesConfig,
    platform::PlatformConfig,
};

pub mod compilers;
pub mod concretizer;
pub mod packages;
pub mod platform;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A required key is absent.
    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    /// Invalid value for a field. The first element is the key path of the field.
    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),

    /// The scope is inconsistent as a whole.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ValidationError {
    /// Returns the key path of the offending value, if known.
    pub fn path(&self) -> Option<&str> {
        match self {
            ValidationError::MissingRequiredField(path) | ValidationError::InvalidValue(path, _) => {
                Some(path)
            }
            ValidationError::Invalid(_) => None,
        }
    }

    /// Prefixes the key path with the name of the enclosing section.
    pub fn within(self, section: &str) -> Self {
        let join = |path: String| {
            if path.starts_with('[') {
                format!("{section}{path}")
            } else {
                format!("{section}.{path}")
            }
        };
        match self {
            ValidationError::MissingRequiredField(path) => {
                ValidationError::MissingRequiredField(join(path))
            }
            ValidationError::InvalidValue(path, message) => {
                ValidationError::InvalidValue(join(path), message)
            }
            ValidationError::Invalid(message) => ValidationError::Invalid(message),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
    /// Two scopes cannot be combined.
    #[error("cannot merge configuration scopes: {0}")]
    Error(String),
}

#[derive(Error, Debug)]
pub enum LoadError {
    /// The scope at the path cannot be merged into the earlier ones.
    #[error("cannot merge {1}: {0}")]
    MergeError(MergeError, PathBuf),

    #[error("cannot read configuration scope: {0}")]
    IoError(#[from] std::io::Error),

    /// The scope is not valid TOML or has unexpected keys.
    #[error("cannot parse configuration scope: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    ValidationError(#[from] ValidationError),
}

/// A configuration problem found while the solver reads the merged configuration, tagged with
/// the key path of the offending value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid configuration at '{path}': {message}")]
pub struct ConfigurationError {
    /// The key path, e.g. `packages.zlib.version[0]`.
    pub path: String,
    /// What is wrong with the value.
    pub message: String,
}

impl ConfigurationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl From<ValidationError> for ConfigurationError {
    fn from(err: ValidationError) -> Self {
        let path = err.path().unwrap_or("").to_string();
        let message = match err {
            ValidationError::InvalidValue(_, message) => message,
            other => other.to_string(),
        };
        Self { path, message }
    }
}

pub trait Config:
    Serialize + for<'de> Deserialize<'de> + std::fmt::Debug + Clone + PartialEq + Default
{
    /// The name of the section this type configures.
    fn get_extension_name(&self) -> String;

    /// Merges a later scope into this one. Values set in `other` win.
    fn merge_config(self, other: &Self) -> Result<Self, MergeError>;

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ValidationError>;

    fn is_default(&self) -> bool {
        self == &Self::default()
    }

    /// Get the valid keys of the configuration.
    fn keys(&self) -> Vec<String>;
}

/// The merged site configuration the concretizer reads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SiteConfig {
    #[serde(default, skip_serializing_if = "ConcretizerConfig::is_default")]
    pub concretizer: ConcretizerConfig,

    #[serde(default, skip_serializing_if = "PackagesConfig::is_default")]
    pub packages: PackagesConfig,

    #[serde(default, skip_serializing_if = "CompilersConfig::is_default")]
    pub compilers: CompilersConfig,

    #[serde(default, skip_serializing_if = "PlatformConfig::is_default")]
    pub platform: PlatformConfig,

    #[serde(skip)]
    pub loaded_from: Vec<PathBuf>,
}

impl SiteConfig {
    /// Loads and merges the given files. Files later in the list are closer to the user and
    /// override earlier ones.
    pub fn load_from_files<I, P>(paths: I) -> Result<Self, LoadError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut config = SiteConfig::default();

        for path in paths {
            let content = std::fs::read_to_string(path.as_ref())?;
            let mut other: SiteConfig = toml::from_str(&content)?;
            other.loaded_from.push(path.as_ref().to_path_buf());
            config = config
                .merge_config(&other)
                .map_err(|e| LoadError::MergeError(e, path.as_ref().to_path_buf()))?;
            tracing::debug!("loaded configuration scope from {}", path.as_ref().display());
        }

        config.validate()?;
        Ok(config)
    }

    /// Parses and validates a single configuration scope.
    pub fn from_toml_str(content: &str) -> Result<Self, LoadError> {
        let config: SiteConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }
}

impl Config for SiteConfig {
    fn get_extension_name(&self) -> String {
        "site".to_string()
    }

    fn merge_config(self, other: &Self) -> Result<Self, MergeError> {
        Ok(Self {
            concretizer: self.concretizer.merge_config(&other.concretizer)?,
            packages: self.packages.merge_config(&other.packages)?,
            compilers: self.compilers.merge_config(&other.compilers)?,
            platform: self.platform.merge_config(&other.platform)?,
            loaded_from: self
                .loaded_from
                .iter()
                .chain(&other.loaded_from)
                .cloned()
                .collect(),
        })
    }

    fn validate(&self) -> Result<(), ValidationError> {
        fn section(config: &impl Config) -> Result<(), ValidationError> {
            config
                .validate()
                .map_err(|e| e.within(&config.get_extension_name()))
        }
        section(&self.concretizer)?;
        section(&self.packages)?;
        section(&self.compilers)?;
        section(&self.platform)?;
        Ok(())
    }

    /// Gather all the keys of the configuration.
    fn keys(&self) -> Vec<String> {
        fn get_keys(config: &impl Config) -> Vec<String> {
            config
                .keys()
                .iter()
                .map(|s| format!("{}.{}", config.get_extension_name(), s))
                .collect()
        }

        let mut keys = Vec::new();
        keys.extend(get_keys(&self.concretizer));
        keys.extend(get_keys(&self.packages));
        keys.extend(get_keys(&self.compilers));
        keys.extend(get_keys(&self.platform));
        keys
    }
}

/// Deserializes either a single value or a list of values into a list.
pub(crate) fn one_or_many<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        One(T),
        Many(Vec<T>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(value) => vec![value],
        OneOrMany::Many(values) => values,
    })
}

/// Takes `other` unless it is empty.
pub(crate) fn prefer_non_empty<T: Clone>(ours: Vec<T>, other: &[T]) -> Vec<T> {
    if other.is_empty() {
        ours
    } else {
        other.to_vec()
    }
}
