//! Abstract and concrete package specs.

use std::{
    collections::{BTreeMap, HashSet},
    fmt::{self, Display, Formatter},
    str::FromStr,
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    variant::format_variant, ArchSpec, CompilerSpec, DepTypes, FlagMap, VariantValue, VersionList,
};

mod hash;
pub mod parse;

pub use parse::ParseSpecError;

/// Information about a package that is provided by the system instead of being built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalInfo {
    /// The installation prefix of the external package.
    pub prefix: Option<String>,
    /// Environment modules that make the package available.
    pub modules: Vec<String>,
}

/// An edge from a spec to one of its dependencies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    /// The dependency. Concrete dependencies are shared between all dependents.
    pub spec: Arc<Spec>,
    /// The kinds of dependency this edge represents. Empty for `^dep` constraints of abstract
    /// specs.
    pub deptypes: DepTypes,
    /// The virtual packages this edge satisfies.
    pub virtuals: Vec<String>,
}

/// Errors that occur while combining or finalizing specs.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SpecError {
    /// A concrete spec was modified.
    #[error("cannot modify concrete spec '{0}'")]
    ModifyConcrete(String),

    /// Two specs with different names were combined.
    #[error("cannot combine specs for different packages '{0}' and '{1}'")]
    NameMismatch(String, String),

    /// Two specs require values that cannot hold at the same time.
    #[error("'{0}' conflicts with '{1}'")]
    Conflict(String, String),

    /// A parent has two edges to the same dependency name.
    #[error("'{0}' already depends on '{1}'")]
    DuplicateDependency(String, String),

    /// The spec lacks a value that is required to make it concrete.
    #[error("cannot finalize '{0}': {1}")]
    NotConcrete(String, &'static str),
}

/// A package instance: a name together with version, variant, compiler, architecture and flag
/// constraints, and edges to its dependencies.
///
/// A spec is abstract until [`Spec::finalize`] marks it concrete, which also freezes its
/// [`Spec::dag_hash`]. Concrete specs are shared through [`Arc`] and must not be mutated anymore.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spec {
    /// The package name. `None` for anonymous constraint fragments such as `+shared`.
    pub name: Option<String>,

    /// The repository namespace that defines the package.
    pub namespace: Option<String>,

    /// Acceptable versions. A single exact version once concrete.
    pub versions: VersionList,

    /// Variant values by variant name.
    pub variants: BTreeMap<String, VariantValue>,

    /// The compiler used to build the package.
    pub compiler: Option<CompilerSpec>,

    /// The target architecture.
    pub arch: ArchSpec,

    /// Compiler flags by category.
    pub compiler_flags: FlagMap,

    /// Set if the package is provided externally.
    pub external: Option<ExternalInfo>,

    /// A hash prefix written as `/abcdef` that refers to an existing concrete spec.
    pub abstract_hash: Option<String>,

    dependencies: Vec<DependencySpec>,

    build_spec: Option<Arc<Spec>>,

    concrete: bool,

    hash: Option<String>,
}

impl Spec {
    /// An empty spec for the given package.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Returns the name of the package or an empty string for anonymous specs.
    pub fn name_or_empty(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    /// Returns the direct dependency edges.
    pub fn dependencies(&self) -> &[DependencySpec] {
        &self.dependencies
    }

    /// Returns the edge to the direct dependency with the given name.
    pub fn dependency(&self, name: &str) -> Option<&DependencySpec> {
        self.dependencies
            .iter()
            .find(|dep| dep.spec.name.as_deref() == Some(name))
    }

    /// Adds a dependency edge. A parent may only have one edge per dependency name.
    pub fn add_dependency(&mut self, dependency: DependencySpec) -> Result<(), SpecError> {
        self.ensure_mutable()?;
        let child_name = dependency.spec.name_or_empty().to_string();
        if let Some(existing) = self
            .dependencies
            .iter_mut()
            .find(|dep| dep.spec.name.as_deref() == Some(child_name.as_str()))
        {
            if existing.spec != dependency.spec {
                return Err(SpecError::DuplicateDependency(
                    self.name_or_empty().to_string(),
                    child_name,
                ));
            }
            existing.deptypes |= dependency.deptypes;
            for virtual_name in dependency.virtuals {
                if !existing.virtuals.contains(&virtual_name) {
                    existing.virtuals.push(virtual_name);
                }
            }
            return Ok(());
        }
        self.dependencies.push(dependency);
        Ok(())
    }

    /// Returns true once the spec has been finalized.
    pub fn is_concrete(&self) -> bool {
        self.concrete
    }

    /// Returns the content hash of a concrete spec.
    pub fn dag_hash(&self) -> Option<&str> {
        self.hash.as_deref()
    }

    /// Returns the spec this one was spliced from, if any.
    pub fn build_spec(&self) -> Option<&Arc<Spec>> {
        self.build_spec.as_ref()
    }

    /// Records the original build of a spliced spec.
    pub fn set_build_spec(&mut self, build_spec: Arc<Spec>) -> Result<(), SpecError> {
        self.ensure_mutable()?;
        self.build_spec = Some(build_spec);
        Ok(())
    }

    /// Returns the concrete version, if the spec pins exactly one.
    pub fn version(&self) -> Option<&crate::Version> {
        self.versions.concrete()
    }

    /// Marks the spec concrete and computes its hash. All dependencies must already be concrete.
    pub fn finalize(&mut self) -> Result<(), SpecError> {
        if self.concrete {
            return Ok(());
        }
        let label = self.to_string();
        if self.name.is_none() {
            return Err(SpecError::NotConcrete(label, "missing name"));
        }
        if self.versions.concrete().is_none() {
            return Err(SpecError::NotConcrete(label, "version is not concrete"));
        }
        if self.dependencies.iter().any(|dep| !dep.spec.is_concrete()) {
            return Err(SpecError::NotConcrete(label, "dependency is not concrete"));
        }
        self.hash = Some(hash::compute_dag_hash(self));
        self.concrete = true;
        Ok(())
    }

    /// Returns a copy of this spec that is abstract again. Dependencies are dropped.
    pub fn to_abstract_node(&self) -> Spec {
        Spec {
            name: self.name.clone(),
            namespace: self.namespace.clone(),
            versions: self.versions.clone(),
            variants: self.variants.clone(),
            compiler: self.compiler.clone(),
            arch: self.arch.clone(),
            compiler_flags: self.compiler_flags.clone(),
            external: self.external.clone(),
            abstract_hash: self.abstract_hash.clone(),
            ..Default::default()
        }
    }

    /// Returns this spec and all its transitive dependencies, each exactly once, in pre-order.
    pub fn traverse(&self) -> Vec<&Spec> {
        let mut result = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![self];
        while let Some(spec) = stack.pop() {
            if !seen.insert(spec as *const Spec) {
                continue;
            }
            result.push(spec);
            for dep in spec.dependencies.iter().rev() {
                stack.push(dep.spec.as_ref());
            }
        }
        result
    }

    /// Returns every edge in the DAG below this spec as `(parent, edge)` pairs.
    pub fn traverse_edges(&self) -> Vec<(&Spec, &DependencySpec)> {
        self.traverse()
            .into_iter()
            .flat_map(|parent| parent.dependencies.iter().map(move |dep| (parent, dep)))
            .collect()
    }

    /// Returns true if `self` is at least as constrained as `other`. For a concrete spec this
    /// means `self` is a valid configuration for the request `other`.
    pub fn satisfies(&self, other: &Spec) -> bool {
        if !self.node_satisfies(other) {
            return false;
        }
        if let Some(prefix) = &other.abstract_hash {
            if !self.dag_hash().is_some_and(|hash| hash.starts_with(prefix)) {
                return false;
            }
        }
        let edges = self.traverse_edges();
        other.dependencies.iter().all(|required| {
            let Some(required_name) = required.spec.name.as_deref() else {
                return true;
            };
            edges.iter().any(|(_, edge)| {
                if edge.spec.name.as_deref() == Some(required_name) {
                    edge.spec.satisfies(&required.spec)
                } else {
                    edge.virtuals.iter().any(|v| v == required_name)
                }
            })
        })
    }

    /// Compares only the node attributes, ignoring dependencies.
    fn node_satisfies(&self, other: &Spec) -> bool {
        if let Some(name) = &other.name {
            if self.name.as_ref() != Some(name) {
                return false;
            }
        }
        if other.namespace.is_some() && self.namespace != other.namespace {
            return false;
        }
        if !self.versions.satisfies(&other.versions) {
            return false;
        }
        let variants_ok = other.variants.iter().all(|(name, value)| {
            self.variants
                .get(name)
                .is_some_and(|ours| ours.satisfies(value))
        });
        if !variants_ok {
            return false;
        }
        if let Some(compiler) = &other.compiler {
            if !self.compiler.as_ref().is_some_and(|c| c.satisfies(compiler)) {
                return false;
            }
        }
        self.arch.satisfies(&other.arch) && self.compiler_flags.satisfies(&other.compiler_flags)
    }

    /// Returns true if some configuration could satisfy both specs. Dependencies are compared by
    /// name only when both specs constrain the same dependency.
    pub fn intersects(&self, other: &Spec) -> bool {
        if let (Some(a), Some(b)) = (&self.name, &other.name) {
            if a != b {
                return false;
            }
        }
        if let (Some(a), Some(b)) = (&self.namespace, &other.namespace) {
            if a != b {
                return false;
            }
        }
        if !self.versions.intersects(&other.versions) {
            return false;
        }
        let variants_ok = self.variants.iter().all(|(name, value)| {
            other
                .variants
                .get(name)
                .is_none_or(|theirs| value.intersects(theirs))
        });
        if !variants_ok {
            return false;
        }
        if let (Some(a), Some(b)) = (&self.compiler, &other.compiler) {
            if !a.intersects(b) {
                return false;
            }
        }
        if !self.arch.intersects(&other.arch) {
            return false;
        }
        self.dependencies.iter().all(|ours| {
            other
                .dependencies
                .iter()
                .filter(|theirs| theirs.spec.name == ours.spec.name)
                .all(|theirs| ours.spec.intersects(&theirs.spec))
        })
    }

    /// Adds the constraints of `other` to `self`. Fails if the two cannot hold together.
    pub fn constrain(&mut self, other: &Spec) -> Result<(), SpecError> {
        self.ensure_mutable()?;
        if !self.intersects(other) {
            return Err(SpecError::Conflict(self.to_string(), other.to_string()));
        }
        match (&self.name, &other.name) {
            (None, Some(name)) => self.name = Some(name.clone()),
            (Some(a), Some(b)) if a != b => {
                return Err(SpecError::NameMismatch(a.clone(), b.clone()))
            }
            _ => {}
        }
        if self.namespace.is_none() {
            self.namespace.clone_from(&other.namespace);
        }
        self.versions = self.versions.intersection(&other.versions);
        for (name, value) in &other.variants {
            match self.variants.get(name) {
                Some(VariantValue::Multi(ours)) => {
                    let mut merged = ours.clone();
                    merged.extend(value.values());
                    self.variants
                        .insert(name.clone(), VariantValue::Multi(merged));
                }
                Some(_) => {}
                None => {
                    self.variants.insert(name.clone(), value.clone());
                }
            }
        }
        match (&mut self.compiler, &other.compiler) {
            (None, Some(theirs)) => self.compiler = Some(theirs.clone()),
            (Some(ours), Some(theirs)) => {
                ours.versions = ours.versions.intersection(&theirs.versions);
            }
            _ => {}
        }
        self.arch.constrain(&other.arch);
        self.compiler_flags.constrain(&other.compiler_flags);
        if self.external.is_none() {
            self.external.clone_from(&other.external);
        }
        if self.abstract_hash.is_none() {
            self.abstract_hash.clone_from(&other.abstract_hash);
        }
        for theirs in &other.dependencies {
            let existing = self
                .dependencies
                .iter_mut()
                .find(|ours| ours.spec.name == theirs.spec.name);
            match existing {
                Some(ours) => {
                    let mut merged = ours.spec.as_ref().clone();
                    merged.constrain(&theirs.spec)?;
                    ours.spec = Arc::new(merged);
                    ours.deptypes |= theirs.deptypes;
                }
                None => self.dependencies.push(theirs.clone()),
            }
        }
        Ok(())
    }

    fn ensure_mutable(&self) -> Result<(), SpecError> {
        if self.concrete {
            Err(SpecError::ModifyConcrete(self.to_string()))
        } else {
            Ok(())
        }
    }

    /// Formats only this node, without `^dependency` constraints.
    pub fn format_node(&self) -> String {
        NodeDisplay(self).to_string()
    }

    /// Formats the DAG as an indented tree, one node per line.
    pub fn tree(&self) -> String {
        fn walk(spec: &Spec, depth: usize, seen: &mut HashSet<*const Spec>, out: &mut String) {
            let hash = spec.dag_hash().map(|h| &h[..7.min(h.len())]).unwrap_or("");
            out.push_str(&format!(
                "{hash:7} {}{}\n",
                "    ".repeat(depth),
                spec.format_node()
            ));
            if !seen.insert(spec as *const Spec) {
                return;
            }
            for dep in &spec.dependencies {
                walk(&dep.spec, depth + 1, seen, out);
            }
        }
        let mut out = String::new();
        walk(self, 0, &mut HashSet::new(), &mut out);
        out
    }
}

struct NodeDisplay<'a>(&'a Spec);

impl Display for NodeDisplay<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let spec = self.0;
        if let Some(name) = &spec.name {
            if let Some(namespace) = &spec.namespace {
                if !spec.concrete {
                    write!(f, "{namespace}.")?;
                }
            }
            write!(f, "{name}")?;
        }
        if let Some(version) = spec.versions.concrete().filter(|_| spec.concrete) {
            write!(f, "@{version}")?;
        } else if !spec.versions.is_any() {
            write!(f, "@{}", spec.versions)?;
        }
        let (bools, valued): (Vec<_>, Vec<_>) = spec
            .variants
            .iter()
            .partition(|(_, value)| matches!(value, VariantValue::Bool(_)));
        for (name, value) in bools.into_iter().chain(valued) {
            format_variant(f, name, value)?;
        }
        if let Some(compiler) = &spec.compiler {
            write!(f, " {compiler}")?;
        }
        if !spec.arch.is_empty() {
            if spec.arch.is_concrete() {
                write!(f, " arch={}", spec.arch)?;
            } else {
                if let Some(platform) = &spec.arch.platform {
                    write!(f, " platform={platform}")?;
                }
                if let Some(os) = &spec.arch.os {
                    write!(f, " os={os}")?;
                }
                if let Some(target) = &spec.arch.target {
                    write!(f, " target={target}")?;
                }
            }
        }
        if !spec.compiler_flags.is_empty() {
            write!(f, " {}", spec.compiler_flags)?;
        }
        if let Some(hash) = &spec.abstract_hash {
            write!(f, " /{hash}")?;
        }
        Ok(())
    }
}

impl Display for Spec {
    /// Formats the spec in the spec-string syntax, with every transitive dependency as a
    /// `^dependency` constraint.
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let text = NodeDisplay(self).to_string();
        write!(f, "{}", text.trim_start())?;
        let mut deps: Vec<&Spec> = self.traverse().into_iter().skip(1).collect();
        deps.sort_by(|a, b| a.name.cmp(&b.name));
        for dep in deps {
            write!(f, " ^{}", NodeDisplay(dep).to_string().trim_start())?;
        }
        Ok(())
    }
}

impl FromStr for Spec {
    type Err = ParseSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse::parse_spec(s)
    }
}

#[cfg(test)]
mod tests {
    use std::{str::FromStr, sync::Arc};

    use super::{DependencySpec, Spec, SpecError};
    use crate::{DepTypes, VariantValue, VersionList};

    fn concrete(text: &str, deps: Vec<(Arc<Spec>, DepTypes)>) -> Arc<Spec> {
        let mut spec = Spec::from_str(text).unwrap();
        for (dep, deptypes) in deps {
            spec.add_dependency(DependencySpec {
                spec: dep,
                deptypes,
                virtuals: vec![],
            })
            .unwrap();
        }
        spec.finalize().unwrap();
        Arc::new(spec)
    }

    #[test]
    fn test_satisfies_request() {
        let zlib = concrete("zlib@=1.3 +shared", vec![]);
        let app = concrete("app@=2.0 ~debug", vec![(zlib.clone(), DepTypes::BUILD_LINK)]);

        assert!(app.satisfies(&Spec::from_str("app").unwrap()));
        assert!(app.satisfies(&Spec::from_str("app@2").unwrap()));
        assert!(app.satisfies(&Spec::from_str("app ~debug ^zlib+shared").unwrap()));
        assert!(!app.satisfies(&Spec::from_str("app ^zlib~shared").unwrap()));
        assert!(!app.satisfies(&Spec::from_str("app@1").unwrap()));
        assert!(!app.satisfies(&Spec::from_str("app ^openssl").unwrap()));
    }

    #[test]
    fn test_hash_is_deterministic_and_depends_on_children() {
        let a = concrete("zlib@=1.3 +shared", vec![]);
        let b = concrete("zlib@=1.3 +shared", vec![]);
        assert_eq!(a.dag_hash(), b.dag_hash());

        let c = concrete("zlib@=1.3 ~shared", vec![]);
        assert_ne!(a.dag_hash(), c.dag_hash());

        let app_a = concrete("app@=1.0", vec![(a, DepTypes::LINK)]);
        let app_c = concrete("app@=1.0", vec![(c, DepTypes::LINK)]);
        assert_ne!(app_a.dag_hash(), app_c.dag_hash());
    }

    #[test]
    fn test_concrete_is_immutable() {
        let mut spec = Spec::from_str("zlib@=1.3").unwrap();
        spec.finalize().unwrap();
        assert!(matches!(
            spec.constrain(&Spec::from_str("+shared").unwrap()),
            Err(SpecError::ModifyConcrete(_))
        ));
    }

    #[test]
    fn test_finalize_requires_concrete_version() {
        let mut spec = Spec::from_str("zlib@1.2:").unwrap();
        assert!(matches!(spec.finalize(), Err(SpecError::NotConcrete(..))));
    }

    #[test]
    fn test_constrain() {
        let mut spec = Spec::from_str("zlib@1:").unwrap();
        spec.constrain(&Spec::from_str("@:1.5 +shared").unwrap())
            .unwrap();
        assert_eq!(spec.versions, VersionList::from_str("1:1.5").unwrap());
        assert_eq!(spec.variants["shared"], VariantValue::Bool(true));

        let err = spec.constrain(&Spec::from_str("~shared").unwrap());
        assert!(matches!(err, Err(SpecError::Conflict(..))));
    }

    #[test]
    fn test_intersects() {
        let a = Spec::from_str("mpich@3: +fortran").unwrap();
        assert!(a.intersects(&Spec::from_str("mpich@3.2").unwrap()));
        assert!(!a.intersects(&Spec::from_str("mpich~fortran").unwrap()));
        assert!(!a.intersects(&Spec::from_str("openmpi").unwrap()));
    }

    #[test]
    fn test_display_round_trips_through_parser() {
        let text = "app@1.0:1.5+debug~shared build_type=Release %gcc@12 target=x86_64 ^zlib@1.3";
        let spec = Spec::from_str(text).unwrap();
        let reparsed = Spec::from_str(&spec.to_string()).unwrap();
        similar_asserts::assert_eq!(spec, reparsed);
    }
}
