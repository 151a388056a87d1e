#![deny(missing_docs)]
//! `spackle_types` contains the data model shared by the spackle crates: versions and version
//! constraints, variants, compilers, architectures, compiler flags, abstract and concrete specs
//! with their dependency edges, and the package metadata the concretizer reads.

mod arch;
mod compiler;
mod deptypes;
mod flags;
pub mod package;
mod repository;
pub mod spec;
mod variant;
mod version;

pub use arch::ArchSpec;
pub use compiler::CompilerSpec;
pub use deptypes::{DepType, DepTypes, ParseDepTypeError};
pub use flags::{CompilerFlag, FlagMap, FlagSource, FlagType};
pub use package::{
    ConflictDeclaration, DeclaredVersion, DependencyDeclaration, PackageDefinition,
    ProvidesDeclaration,
};
pub use repository::{InMemoryRepository, PackageRepository, RepositoryError};
pub use spec::{
    parse::{parse_spec, parse_specs},
    DependencySpec, ExternalInfo, ParseSpecError, Spec, SpecError,
};
pub use variant::{AllowedValues, VariantDefinition, VariantKind, VariantValue};
pub use version::{
    Component, ParseVersionError, ParseVersionListError, Version, VersionItem, VersionList,
    VersionRange,
};
