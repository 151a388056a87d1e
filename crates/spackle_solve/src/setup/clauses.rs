//! Translation of specs into the clauses that appear in condition triggers and effects.

use std::collections::{BTreeMap, BTreeSet};

use smallvec::SmallVec;
use spackle_types::{FlagSource, Spec, VersionList};

use crate::{engine::Symbol, error::SolveError, sym};

/// Whether clauses are checked against a node or imposed on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ClauseKind {
    Trigger,
    /// Imposed clauses carry the source of the flags they set.
    Effect(FlagSource),
}

/// Turns specs into clauses and remembers every version constraint it emitted, so that the
/// matching `version_satisfies` facts can be generated once all versions are known.
#[derive(Debug, Default)]
pub(crate) struct ClauseBuilder {
    virtuals: BTreeSet<String>,
    hashes: Vec<String>,
    versions: BTreeMap<String, BTreeMap<String, VersionList>>,
    compiler_versions: BTreeMap<String, BTreeMap<String, VersionList>>,
}

impl ClauseBuilder {
    pub fn new(virtuals: BTreeSet<String>, hashes: impl IntoIterator<Item = String>) -> Self {
        let mut hashes: Vec<String> = hashes.into_iter().collect();
        hashes.sort_unstable();
        hashes.dedup();
        Self {
            virtuals,
            hashes,
            ..Default::default()
        }
    }

    pub fn is_virtual(&self, name: &str) -> bool {
        self.virtuals.contains(name)
    }

    /// Registers a version constraint on a package and returns the text it is referred to by.
    pub fn version_constraint(&mut self, package: &str, versions: &VersionList) -> String {
        let text = versions.to_string();
        self.versions
            .entry(package.to_string())
            .or_default()
            .entry(text.clone())
            .or_insert_with(|| versions.clone());
        text
    }

    /// The version constraints used on a package, by text.
    pub fn constraints_on(&self, package: &str) -> impl Iterator<Item = (&str, &VersionList)> {
        self.versions
            .get(package)
            .into_iter()
            .flatten()
            .map(|(text, list)| (text.as_str(), list))
    }

    /// Every package or virtual with at least one version constraint.
    pub fn constrained_packages(&self) -> impl Iterator<Item = &str> {
        self.versions.keys().map(String::as_str)
    }

    /// The version constraints used on compilers, as `(compiler, text, list)`.
    pub fn compiler_constraints(&self) -> impl Iterator<Item = (&str, &str, &VersionList)> {
        self.compiler_versions.iter().flat_map(|(name, constraints)| {
            constraints
                .iter()
                .map(move |(text, list)| (name.as_str(), text.as_str(), list))
        })
    }

    /// Returns the clauses for a spec. Anonymous specs are about `owner`. Each `^dependency`
    /// contributes clauses about the dependency's package.
    pub fn clauses(
        &mut self,
        spec: &Spec,
        owner: &str,
        kind: &ClauseKind,
    ) -> Result<Vec<Symbol>, SolveError> {
        let mut clauses = Vec::new();
        self.collect(spec, owner, kind, &mut clauses)?;
        Ok(clauses)
    }

    fn collect(
        &mut self,
        spec: &Spec,
        owner: &str,
        kind: &ClauseKind,
        out: &mut Vec<Symbol>,
    ) -> Result<(), SolveError> {
        let subject = spec.name.as_deref().unwrap_or(owner).to_string();
        let node = if self.is_virtual(&subject) {
            self.virtual_node_clauses(spec, &subject)?
        } else {
            self.node_clauses(spec, &subject, kind)?
        };
        out.extend(node);
        for dependency in spec.dependencies() {
            self.collect(&dependency.spec, owner, kind, out)?;
        }
        Ok(())
    }

    fn virtual_node_clauses(
        &mut self,
        spec: &Spec,
        subject: &str,
    ) -> Result<SmallVec<[Symbol; 8]>, SolveError> {
        let mut node_only = Spec::default();
        node_only.name = spec.name.clone();
        node_only.versions = spec.versions.clone();
        if spec.to_abstract_node() != node_only.to_abstract_node() {
            return Err(SolveError::input(
                format!("invalid constraint '{spec}'"),
                format!("'{subject}' is a virtual package and only accepts a version constraint"),
            ));
        }
        let mut clauses: SmallVec<[Symbol; 8]> = SmallVec::new();
        clauses.push(sym!("virtual_node", subject));
        if !spec.versions.is_any() {
            let constraint = self.version_constraint(subject, &spec.versions);
            clauses.push(sym!("node_version_satisfies", subject, constraint));
        }
        Ok(clauses)
    }

    fn node_clauses(
        &mut self,
        spec: &Spec,
        subject: &str,
        kind: &ClauseKind,
    ) -> Result<SmallVec<[Symbol; 8]>, SolveError> {
        let mut clauses: SmallVec<[Symbol; 8]> = SmallVec::new();
        clauses.push(sym!("node", subject));
        if let Some(namespace) = &spec.namespace {
            clauses.push(sym!("namespace", subject, namespace.as_str()));
        }
        if !spec.versions.is_any() {
            let constraint = self.version_constraint(subject, &spec.versions);
            clauses.push(sym!("node_version_satisfies", subject, constraint));
        }
        for (name, value) in &spec.variants {
            for value in value.values() {
                clauses.push(sym!("variant_value", subject, name.as_str(), value));
            }
        }
        if let Some(compiler) = &spec.compiler {
            clauses.push(sym!("node_compiler", subject, compiler.name.as_str()));
            if !compiler.versions.is_any() {
                let text = compiler.versions.to_string();
                self.compiler_versions
                    .entry(compiler.name.clone())
                    .or_default()
                    .entry(text.clone())
                    .or_insert_with(|| compiler.versions.clone());
                clauses.push(sym!(
                    "node_compiler_version_satisfies",
                    subject,
                    compiler.name.as_str(),
                    text
                ));
            }
        }
        if let Some(platform) = &spec.arch.platform {
            clauses.push(sym!("node_platform", subject, platform.as_str()));
        }
        if let Some(os) = &spec.arch.os {
            clauses.push(sym!("node_os", subject, os.as_str()));
        }
        if let Some(target) = &spec.arch.target {
            clauses.push(sym!("node_target", subject, target.as_str()));
        }
        for (flag_type, flags) in spec.compiler_flags.iter() {
            let ty = flag_type.to_string();
            for (position, flag) in flags.iter().enumerate() {
                let clause = match kind {
                    ClauseKind::Trigger => {
                        sym!("node_flag", subject, ty.as_str(), flag.flag.as_str())
                    }
                    ClauseKind::Effect(source) => {
                        let name = if flag.propagate {
                            "node_flag_propagate"
                        } else {
                            "node_flag"
                        };
                        Symbol::function(
                            name,
                            vec![
                                Symbol::from(subject),
                                Symbol::from(ty.as_str()),
                                Symbol::from(flag.flag.as_str()),
                                Symbol::from(source.tag()),
                                Symbol::from(position),
                            ],
                        )
                    }
                };
                clauses.push(clause);
            }
        }
        if let (Some(prefix), ClauseKind::Effect(_)) = (&spec.abstract_hash, kind) {
            let hash = self.resolve_hash(spec, prefix)?;
            clauses.push(sym!("hash", subject, hash));
        }
        Ok(clauses)
    }

    /// Resolves an abstract hash prefix against the hashes of the reusable specs.
    fn resolve_hash(&self, spec: &Spec, prefix: &str) -> Result<String, SolveError> {
        let mut matches = self.hashes.iter().filter(|h| h.starts_with(prefix));
        match (matches.next(), matches.next()) {
            (Some(hash), None) => Ok(hash.clone()),
            (None, _) => Err(SolveError::input(
                format!("invalid constraint '{spec}'"),
                format!("no reusable spec matches the hash '{prefix}'"),
            )),
            (Some(_), Some(_)) => Err(SolveError::input(
                format!("invalid constraint '{spec}'"),
                format!("the hash '{prefix}' is ambiguous"),
            )),
        }
    }
}

/// Describes a spec relative to the package that owns it, e.g. `pkg-a+X`.
pub(crate) fn describe(owner: &str, spec: &Spec) -> String {
    let text = spec.to_string();
    match &spec.name {
        Some(_) => text,
        None if text.is_empty() => owner.to_string(),
        None => {
            let node = spec.format_node();
            let rest = text.trim_start().strip_prefix(node.trim_start()).unwrap_or("");
            format!("{owner}{node}{rest}")
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, str::FromStr};

    use spackle_types::{FlagSource, Spec};

    use super::{describe, ClauseBuilder, ClauseKind};
    use crate::error::SolveError;

    fn builder() -> ClauseBuilder {
        ClauseBuilder::new(
            BTreeSet::from(["mpi".to_string()]),
            ["abcdef1234".to_string(), "abd0000000".to_string()],
        )
    }

    fn texts(clauses: &[crate::engine::Symbol]) -> Vec<String> {
        clauses.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_anonymous_spec_is_about_the_owner() {
        let mut builder = builder();
        let spec = Spec::from_str("@1.0:1.5 +shared %gcc@12 ^zlib@1.3").unwrap();
        let clauses = builder
            .clauses(&spec, "hdf5", &ClauseKind::Trigger)
            .unwrap();
        similar_asserts::assert_eq!(
            texts(&clauses),
            vec![
                r#"node("hdf5")"#,
                r#"node_version_satisfies("hdf5","1.0:1.5")"#,
                r#"variant_value("hdf5","shared","True")"#,
                r#"node_compiler("hdf5","gcc")"#,
                r#"node_compiler_version_satisfies("hdf5","gcc","12")"#,
                r#"node("zlib")"#,
                r#"node_version_satisfies("zlib","1.3")"#,
            ]
        );
        let constraints: Vec<&str> = builder.constraints_on("hdf5").map(|(t, _)| t).collect();
        assert_eq!(constraints, vec!["1.0:1.5"]);
        assert_eq!(builder.compiler_constraints().count(), 1);
    }

    #[test]
    fn test_effect_flags_carry_their_source() {
        let mut builder = builder();
        let spec = Spec::from_str("zlib cflags=\"-O3 -g\" ldflags==-lm").unwrap();
        let clauses = builder
            .clauses(&spec, "zlib", &ClauseKind::Effect(FlagSource::Literal))
            .unwrap();
        let clauses = texts(&clauses);
        assert!(clauses.contains(&r#"node_flag("zlib","cflags","-g","literal",1)"#.to_string()));
        assert!(clauses
            .contains(&r#"node_flag_propagate("zlib","ldflags","-lm","literal",0)"#.to_string()));
    }

    #[test]
    fn test_virtuals_only_take_versions() {
        let mut builder = builder();
        let spec = Spec::from_str("mpi@3:").unwrap();
        let clauses = builder.clauses(&spec, "app", &ClauseKind::Trigger).unwrap();
        assert_eq!(
            texts(&clauses),
            vec![
                r#"virtual_node("mpi")"#,
                r#"node_version_satisfies("mpi","3:")"#
            ]
        );

        let spec = Spec::from_str("mpi+cuda").unwrap();
        let err = builder.clauses(&spec, "app", &ClauseKind::Trigger).unwrap_err();
        assert!(matches!(err, SolveError::Input(_)));
    }

    #[test]
    fn test_hash_prefix_must_be_unique() {
        let mut builder = builder();
        let effect = ClauseKind::Effect(FlagSource::Literal);
        let spec = Spec::from_str("zlib/abc").unwrap();
        let clauses = builder.clauses(&spec, "zlib", &effect).unwrap();
        assert_eq!(texts(&clauses)[1], r#"hash("zlib","abcdef1234")"#);

        let spec = Spec::from_str("zlib/ab").unwrap();
        assert!(builder.clauses(&spec, "zlib", &effect).is_err());
        let spec = Spec::from_str("zlib/ffff").unwrap();
        assert!(builder.clauses(&spec, "zlib", &effect).is_err());
    }

    #[test]
    fn test_describe() {
        assert_eq!(describe("pkg-a", &Spec::from_str("+X").unwrap()), "pkg-a+X");
        assert_eq!(
            describe("pkg-a", &Spec::from_str("build_type=Release").unwrap()),
            "pkg-a build_type=Release"
        );
        assert_eq!(describe("pkg-a", &Spec::default()), "pkg-a");
        assert_eq!(describe("pkg-a", &Spec::from_str("zlib@1.3").unwrap()), "zlib@1.3");
    }
}
