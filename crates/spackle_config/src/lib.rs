//! Site configuration for the spackle concretizer.
//!
//! Configuration is read from TOML scopes. Scopes are merged in order and a later scope (closer
//! to the user) overrides an earlier one. The concretizer only ever sees the merged view.

pub mod config;

pub use config::{
    Config, ConfigurationError, LoadError, MergeError, SiteConfig, ValidationError,
};
