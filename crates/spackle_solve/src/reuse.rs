//! Sources of already concrete specs and the selection of the ones a solve may reuse.

use std::{collections::BTreeSet, sync::Arc};

use parking_lot::{RwLock, RwLockReadGuard};
use spackle_config::{config::concretizer::ReuseMode, ConfigurationError, SiteConfig};
use spackle_types::{parse_spec, Spec};

use crate::error::SolveError;

/// The variant that marks specs built from a local development checkout. Those are never reused.
pub const DEV_PATH_VARIANT: &str = "dev_path";

/// Something that holds concrete specs, e.g. the local store or a binary cache.
pub trait SpecSource: Send + Sync {
    /// The name used to refer to the source in `concretizer.reuse-from`.
    fn name(&self) -> &str;

    /// Returns the concrete root specs of the source.
    fn specs(&self) -> Vec<Arc<Spec>>;
}

/// A [`SpecSource`] that keeps its specs in memory. Reads see a consistent snapshot while
/// other threads add specs.
#[derive(Debug)]
pub struct InMemoryStore {
    name: String,
    specs: RwLock<Vec<Arc<Spec>>>,
}

impl InMemoryStore {
    /// Creates an empty store.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            specs: RwLock::new(Vec::new()),
        }
    }

    /// Adds a concrete spec. Specs that are not concrete are rejected.
    pub fn insert(&self, spec: Arc<Spec>) -> Result<(), SolveError> {
        if !spec.is_concrete() {
            return Err(SolveError::input(
                format!("cannot store '{spec}'"),
                "only concrete specs can be stored",
            ));
        }
        let mut specs = self.specs.write();
        if !specs.iter().any(|s| s.dag_hash() == spec.dag_hash()) {
            specs.push(spec);
        }
        Ok(())
    }

    /// Locks the store for reading. Writers wait until the guard is dropped.
    pub fn read_transaction(&self) -> RwLockReadGuard<'_, Vec<Arc<Spec>>> {
        self.specs.read()
    }

    /// The number of stored root specs.
    pub fn len(&self) -> usize {
        self.specs.read().len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.specs.read().is_empty()
    }
}

impl SpecSource for InMemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn specs(&self) -> Vec<Arc<Spec>> {
        self.read_transaction().clone()
    }
}

fn parse_filters(
    texts: &[String],
    path: impl Fn(usize) -> String,
) -> Result<Vec<Spec>, ConfigurationError> {
    texts
        .iter()
        .enumerate()
        .map(|(idx, text)| {
            parse_spec(text).map_err(|e| ConfigurationError::new(path(idx), e.to_string()))
        })
        .collect()
}

/// Returns true if an external spec from a source matches an external the site declares, down
/// to the prefix and the modules that load it.
fn external_is_configured(config: &SiteConfig, spec: &Spec) -> bool {
    let Some(external) = &spec.external else {
        return true;
    };
    config
        .packages
        .externals(spec.name_or_empty())
        .iter()
        .any(|(declared, entry)| {
            spec.satisfies(declared)
                && entry.prefix == external.prefix
                && entry.modules == external.modules
        })
}

/// Collects the specs a solve may reuse, deduplicated by hash, in source order.
pub(crate) fn reusable_specs(
    config: &SiteConfig,
    sources: &[Arc<dyn SpecSource>],
) -> Result<Vec<Arc<Spec>>, SolveError> {
    if config.concretizer.reuse() == ReuseMode::Disabled {
        return Ok(Vec::new());
    }
    let reuse_from = &config.concretizer.reuse_from;
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut result = Vec::new();
    for source in sources {
        let filters = if reuse_from.is_empty() {
            Some((Vec::new(), Vec::new()))
        } else {
            match reuse_from.iter().position(|f| f.source == source.name()) {
                None => None,
                Some(idx) => {
                    let entry = &reuse_from[idx];
                    let include = parse_filters(&entry.include, |i| {
                        format!("concretizer.reuse-from[{idx}].include[{i}]")
                    })?;
                    let exclude = parse_filters(&entry.exclude, |i| {
                        format!("concretizer.reuse-from[{idx}].exclude[{i}]")
                    })?;
                    Some((include, exclude))
                }
            }
        };
        let Some((include, exclude)) = filters else {
            tracing::debug!("not reusing specs from '{}'", source.name());
            continue;
        };

        let mut taken = 0usize;
        for spec in source.specs() {
            let Some(hash) = spec.dag_hash() else {
                tracing::warn!("ignoring '{spec}' from '{}': it is not concrete", source.name());
                continue;
            };
            if seen.contains(hash) {
                continue;
            }
            if !include.is_empty() && !include.iter().any(|f| spec.satisfies(f)) {
                continue;
            }
            if exclude.iter().any(|f| spec.satisfies(f)) {
                continue;
            }
            let nodes = spec.traverse();
            if nodes.iter().any(|n| n.variants.contains_key(DEV_PATH_VARIANT)) {
                tracing::trace!("'{spec}' was built from a development checkout");
                continue;
            }
            if !nodes.iter().all(|n| external_is_configured(config, n)) {
                tracing::trace!("'{spec}' uses an external that is no longer configured");
                continue;
            }
            seen.insert(hash.to_string());
            result.push(spec);
            taken += 1;
        }
        tracing::debug!("reusing {taken} specs from '{}'", source.name());
    }
    Ok(result)
}
