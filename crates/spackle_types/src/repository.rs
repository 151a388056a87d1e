use std::collections::BTreeSet;

use indexmap::IndexMap;
use thiserror::Error;

use crate::PackageDefinition;

/// An error returned when looking up package metadata.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RepositoryError {
    /// No repository defines a package with this name.
    #[error("unknown package '{0}'")]
    UnknownPackage(String),

    /// The namespace of a qualified package name is not known.
    #[error("unknown namespace '{namespace}' in '{namespace}.{name}'")]
    UnknownNamespace {
        /// The namespace that was requested.
        namespace: String,
        /// The package name.
        name: String,
    },
}

/// Provides package metadata to the concretizer.
///
/// Any name for which no package is defined but that is provided by at least one package is a
/// virtual package.
pub trait PackageRepository {
    /// Returns the definition of a package, optionally restricted to a namespace.
    fn get(&self, namespace: Option<&str>, name: &str) -> Result<&PackageDefinition, RepositoryError>;

    /// Returns the names of all packages that may provide the virtual, sorted by name.
    fn providers_for(&self, virtual_name: &str) -> Vec<&str>;

    /// Returns all known namespaces.
    fn namespaces(&self) -> Vec<&str>;

    /// Returns true if a package with this name exists.
    fn exists(&self, name: &str) -> bool {
        self.get(None, name).is_ok()
    }

    /// Returns true if the name is not a package but is provided by some package.
    fn is_virtual(&self, name: &str) -> bool {
        !self.exists(name) && !self.providers_for(name).is_empty()
    }
}

/// A [`PackageRepository`] that keeps all definitions in memory. Packages are stored in
/// insertion order; a later definition with the same name replaces an earlier one.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRepository {
    packages: IndexMap<String, PackageDefinition>,
    namespaces: BTreeSet<String>,
}

impl InMemoryRepository {
    /// Creates an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a package definition.
    pub fn add(&mut self, package: PackageDefinition) {
        self.namespaces.insert(package.namespace.clone());
        if let Some(previous) = self.packages.insert(package.name.clone(), package) {
            tracing::debug!(
                "package '{}' from '{}' was replaced",
                previous.name,
                previous.namespace
            );
        }
    }

    /// Registers a namespace that has no packages.
    pub fn add_namespace(&mut self, namespace: impl Into<String>) {
        self.namespaces.insert(namespace.into());
    }

    /// Iterates over all package definitions in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &PackageDefinition> {
        self.packages.values()
    }
}

impl FromIterator<PackageDefinition> for InMemoryRepository {
    fn from_iter<T: IntoIterator<Item = PackageDefinition>>(iter: T) -> Self {
        let mut repository = Self::new();
        for package in iter {
            repository.add(package);
        }
        repository
    }
}

impl PackageRepository for InMemoryRepository {
    fn get(&self, namespace: Option<&str>, name: &str) -> Result<&PackageDefinition, RepositoryError> {
        if let Some(namespace) = namespace {
            if !self.namespaces.contains(namespace) {
                return Err(RepositoryError::UnknownNamespace {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                });
            }
        }
        self.packages
            .get(name)
            .filter(|package| namespace.is_none_or(|ns| ns == package.namespace))
            .ok_or_else(|| RepositoryError::UnknownPackage(name.to_string()))
    }

    fn providers_for(&self, virtual_name: &str) -> Vec<&str> {
        let mut providers: Vec<&str> = self
            .packages
            .values()
            .filter(|package| package.provided_virtuals().any(|v| v == virtual_name))
            .map(|package| package.name.as_str())
            .collect();
        providers.sort_unstable();
        providers
    }

    fn namespaces(&self) -> Vec<&str> {
        self.namespaces.iter().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use assert_matches::assert_matches;

    use super::{InMemoryRepository, PackageRepository, RepositoryError};
    use crate::{PackageDefinition, ProvidesDeclaration, Spec};

    fn repository() -> InMemoryRepository {
        let mut openmpi = PackageDefinition::new("openmpi");
        openmpi.provides.push(ProvidesDeclaration {
            virtual_spec: Spec::from_str("mpi@:3").unwrap(),
            when: Spec::default(),
        });
        let mut mpich = PackageDefinition::new("mpich");
        mpich.namespace = "site".to_string();
        mpich.provides.push(ProvidesDeclaration {
            virtual_spec: Spec::from_str("mpi").unwrap(),
            when: Spec::default(),
        });
        [openmpi, mpich, PackageDefinition::new("zlib")]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_lookup() {
        let repo = repository();
        assert!(repo.get(None, "zlib").is_ok());
        assert!(repo.get(Some("site"), "mpich").is_ok());
        assert_matches!(
            repo.get(Some("site"), "zlib"),
            Err(RepositoryError::UnknownPackage(_))
        );
        assert_matches!(
            repo.get(Some("nope"), "zlib"),
            Err(RepositoryError::UnknownNamespace { .. })
        );
        assert_matches!(repo.get(None, "hdf5"), Err(RepositoryError::UnknownPackage(_)));
    }

    #[test]
    fn test_virtuals() {
        let repo = repository();
        assert!(repo.is_virtual("mpi"));
        assert!(!repo.is_virtual("zlib"));
        assert!(!repo.is_virtual("hdf5"));
        assert_eq!(repo.providers_for("mpi"), vec!["mpich", "openmpi"]);
        assert_eq!(repo.namespaces(), vec!["builtin", "site"]);
    }
}
