//! Package metadata as declared by package recipes. The concretizer consumes it read-only.

use serde::{Deserialize, Serialize};

use crate::{DepTypes, Spec, VariantDefinition, Version};

/// A version declared by a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeclaredVersion {
    /// The version.
    pub version: Version,
    /// Preferred versions are chosen over any non-preferred version.
    #[serde(default)]
    pub preferred: bool,
    /// Deprecated versions are only used when explicitly allowed.
    #[serde(default)]
    pub deprecated: bool,
}

impl From<Version> for DeclaredVersion {
    fn from(version: Version) -> Self {
        Self {
            version,
            preferred: false,
            deprecated: false,
        }
    }
}

/// A `depends_on` declaration: while the package matches `when`, it depends on `spec`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyDeclaration {
    /// The dependency and the constraints imposed on it. Always named.
    pub spec: Spec,
    /// The condition on the dependent. The anonymous empty spec means "always".
    pub when: Spec,
    /// The dependency types of the resulting edge.
    pub deptypes: DepTypes,
}

/// A `conflicts` declaration: the package may not match `conflict` while it matches `when`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictDeclaration {
    /// The conflicting constraint.
    pub conflict: Spec,
    /// The condition under which the conflict applies.
    pub when: Spec,
    /// Optional explanation shown to the user.
    pub message: Option<String>,
}

/// A `provides` declaration: while the package matches `when`, it provides the virtual in
/// `virtual_spec` (e.g. `mpi@:3`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvidesDeclaration {
    /// The provided virtual with the versions of the interface that are provided.
    pub virtual_spec: Spec,
    /// The condition on the provider.
    pub when: Spec,
}

/// Everything a package recipe declares.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageDefinition {
    /// The package name.
    pub name: String,
    /// The repository namespace that defines the package.
    pub namespace: String,
    /// Declared versions in declaration order.
    pub versions: Vec<DeclaredVersion>,
    /// Variant definitions in registration order.
    pub variants: Vec<VariantDefinition>,
    /// Dependency declarations.
    pub dependencies: Vec<DependencyDeclaration>,
    /// Conflict declarations.
    pub conflicts: Vec<ConflictDeclaration>,
    /// Virtual packages provided.
    pub provides: Vec<ProvidesDeclaration>,
    /// Free-form tags, e.g. `build-tools`.
    pub tags: Vec<String>,
}

impl PackageDefinition {
    /// An empty package in the `builtin` namespace.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: "builtin".to_string(),
            versions: Vec::new(),
            variants: Vec::new(),
            dependencies: Vec::new(),
            conflicts: Vec::new(),
            provides: Vec::new(),
            tags: Vec::new(),
        }
    }

    /// Returns the declared version entry for `version`.
    pub fn declared_version(&self, version: &Version) -> Option<&DeclaredVersion> {
        self.versions.iter().find(|v| &v.version == version)
    }

    /// Returns all definitions of the variant with the given name.
    pub fn variant_definitions<'a>(
        &'a self,
        name: &'a str,
    ) -> impl Iterator<Item = &'a VariantDefinition> + 'a {
        self.variants.iter().filter(move |v| v.name == name)
    }

    /// Returns true if the package declares a variant with the given name.
    pub fn has_variant(&self, name: &str) -> bool {
        self.variant_definitions(name).next().is_some()
    }

    /// Returns true if the package carries the tag.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }

    /// Returns the names of the virtuals the package may provide.
    pub fn provided_virtuals(&self) -> impl Iterator<Item = &str> + '_ {
        self.provides
            .iter()
            .filter_map(|p| p.virtual_spec.name.as_deref())
    }

    /// Returns the names of all packages this package may depend on with any of the given types.
    pub fn dependency_names(&self, deptypes: DepTypes) -> impl Iterator<Item = &str> + '_ {
        self.dependencies
            .iter()
            .filter(move |d| d.deptypes.intersects(deptypes))
            .filter_map(|d| d.spec.name.as_deref())
    }
}
