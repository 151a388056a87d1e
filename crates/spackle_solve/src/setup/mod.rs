//! Generates the facts of a concretization problem.
//!
//! The generated program describes every package that can take part in the solve: its
//! versions with their preference weights, its variants, the conditions under which it depends
//! on other packages, its conflicts and the virtuals it provides. Site configuration adds
//! compilers, the platform, externals, requirements and preferences. Concrete specs that may be
//! reused are described attribute by attribute with `hash_attr` facts. The requested specs become
//! `literal` facts, one per spec, that the driver turns into assumptions.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use itertools::Itertools;
use spackle_config::{
    config::{
        concretizer::ReuseMode,
        packages::{
            parse_version_preference, PackageConfig, RequirementConfig, RequirementPolicy,
            ALL_PACKAGES,
        },
    },
    ConfigurationError, SiteConfig,
};
use spackle_types::{
    parse_spec, AllowedValues, ExternalInfo, FlagMap, FlagSource, PackageDefinition, PackageRepository,
    Spec, Version, VersionItem, VersionList,
};

use crate::{
    counter::{PossibleGraph, TestScope},
    engine::Symbol,
    error::SolveError,
    sym,
};

mod clauses;
mod conditions;
pub(crate) mod program;

pub(crate) use clauses::describe;
use clauses::{ClauseBuilder, ClauseKind};
use conditions::ConditionTable;
use program::ProgramBuilder;

/// Where a declared version comes from. The order is the order of preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, strum::Display)]
#[strum(serialize_all = "snake_case")]
enum VersionOrigin {
    Spec,
    External,
    PackagesYaml,
    PackagePy,
    Installed,
    Runtime,
}

/// The generated program together with what is needed to interpret its models.
#[derive(Debug)]
pub(crate) struct SolverProblem {
    pub text: String,
    pub facts: usize,
    /// The requested specs by literal index.
    pub literals: Vec<Spec>,
    pub graph: PossibleGraph,
    /// Reusable nodes by hash.
    pub reusable: BTreeMap<String, Arc<Spec>>,
    /// Selectable externals by package and index.
    pub externals: BTreeMap<(String, i64), ExternalInfo>,
    pub has_libc: bool,
}

impl SolverProblem {
    /// The assumptions that activate the literals.
    pub fn assumptions(&self) -> Vec<Symbol> {
        (0..self.literals.len())
            .map(|idx| sym!("literal", idx))
            .collect()
    }
}

/// What a problem is generated from.
pub(crate) struct SetupInput<'a, R: ?Sized> {
    pub repository: &'a R,
    pub config: &'a SiteConfig,
    pub specs: &'a [Spec],
    pub reusable: &'a [Arc<Spec>],
    pub graph: PossibleGraph,
    pub tests: &'a TestScope,
    /// Literals may be left unsolved, so they are not checked against each other.
    pub optional_literals: bool,
}

struct Setup<'a, R: ?Sized> {
    repository: &'a R,
    config: &'a SiteConfig,
    graph: PossibleGraph,
    tests: &'a TestScope,
    program: ProgramBuilder,
    conditions: ConditionTable,
    clauses: ClauseBuilder,
    versions: BTreeMap<String, Vec<(VersionOrigin, Version)>>,
    providers: Vec<ProviderCondition>,
    compilers: Vec<(String, Version)>,
    externals: BTreeMap<(String, i64), ExternalInfo>,
    next_variant: i64,
    next_group: i64,
}

struct ProviderCondition {
    package: String,
    condition: i64,
    virtual_name: String,
    versions: VersionList,
}

fn pkg_fact(package: &str, fact: Symbol) -> Symbol {
    sym!("pkg_fact", package, fact)
}

/// Builds the program for a solve.
pub(crate) fn setup<R: PackageRepository + ?Sized>(
    input: SetupInput<'_, R>,
) -> Result<SolverProblem, SolveError> {
    let span = tracing::debug_span!("setup", specs = input.specs.len());
    let _enter = span.enter();

    let hashes = input
        .reusable
        .iter()
        .flat_map(|spec| spec.traverse())
        .filter_map(|spec| spec.dag_hash().map(str::to_string));
    let mut setup = Setup {
        repository: input.repository,
        config: input.config,
        clauses: ClauseBuilder::new(input.graph.virtuals.clone(), hashes),
        graph: input.graph,
        tests: input.tests,
        program: ProgramBuilder::new(),
        conditions: ConditionTable::default(),
        versions: BTreeMap::new(),
        providers: Vec::new(),
        compilers: Vec::new(),
        externals: BTreeMap::new(),
        next_variant: 0,
        next_group: 0,
    };

    for spec in input.specs {
        setup.validate_literal(spec)?;
    }
    if !input.optional_literals {
        check_literals_intersect(input.specs)?;
    }

    setup.platform_facts()?;
    setup.global_facts();
    setup.compiler_facts()?;
    let reusable = setup.reuse_facts(input.reusable);
    setup.literal_facts(input.specs)?;
    let packages: Vec<String> = setup.graph.packages.iter().cloned().collect();
    for package in &packages {
        setup.package_facts(package)?;
    }
    setup.virtual_facts();
    setup.version_facts(&packages);
    setup.constraint_facts();

    tracing::debug!(
        "generated {} facts with {} conditions",
        setup.program.len(),
        setup.conditions.len()
    );
    let facts = setup.program.len();
    Ok(SolverProblem {
        text: setup.program.finish(),
        facts,
        literals: input.specs.to_vec(),
        graph: setup.graph,
        reusable,
        externals: setup.externals,
        has_libc: input.config.platform.libc.is_some(),
    })
}

/// Fails if two requested specs constrain the same package in incompatible ways.
fn check_literals_intersect(specs: &[Spec]) -> Result<(), SolveError> {
    let nodes: Vec<(&Spec, &Spec)> = specs
        .iter()
        .flat_map(|spec| spec.traverse().into_iter().map(move |node| (spec, node)))
        .filter(|(_, node)| node.name.is_some())
        .collect();
    for (i, (first_root, first)) in nodes.iter().enumerate() {
        for (second_root, second) in &nodes[i + 1..] {
            if std::ptr::eq(*first_root, *second_root) || first.name != second.name {
                continue;
            }
            if !first.to_abstract_node().intersects(&second.to_abstract_node()) {
                return Err(SolveError::input(
                    format!("cannot concretize '{first_root}' together with '{second_root}'"),
                    format!(
                        "'{}' conflicts with '{}'",
                        first.format_node().trim_start(),
                        second.format_node().trim_start()
                    ),
                ));
            }
        }
    }
    Ok(())
}

impl<R: PackageRepository + ?Sized> Setup<'_, R> {
    fn fact(&mut self, fact: Symbol) {
        self.program.fact(fact);
    }

    fn declare_version(&mut self, package: &str, origin: VersionOrigin, version: Version) {
        self.versions
            .entry(package.to_string())
            .or_default()
            .push((origin, version));
    }

    fn is_virtual(&self, name: &str) -> bool {
        self.graph.virtuals.contains(name)
    }

    fn clauses(
        &mut self,
        spec: &Spec,
        owner: &str,
        kind: &ClauseKind,
    ) -> Result<Vec<Symbol>, SolveError> {
        self.clauses.clauses(spec, owner, kind)
    }

    fn condition(
        &mut self,
        trigger: Vec<Symbol>,
        effect: Vec<Symbol>,
        description: &str,
    ) -> i64 {
        self.conditions
            .condition(&mut self.program, trigger, effect, description)
    }

    // -------------------------------------------------------------------------------------------
    // Requested specs
    // -------------------------------------------------------------------------------------------

    /// Checks the variants and compilers a requested spec names before anything is solved.
    fn validate_literal(&self, spec: &Spec) -> Result<(), SolveError> {
        let invalid = |reason: String| SolveError::input(format!("cannot concretize '{spec}'"), reason);
        for node in spec.traverse() {
            let Some(name) = node.name.as_deref() else {
                continue;
            };
            if let Some(compiler) = &node.compiler {
                let configured = self.config.compilers.iter().any(|entry| {
                    entry.name_and_version().is_ok_and(|(n, v)| {
                        n == compiler.name && compiler.versions.contains(&v)
                    })
                });
                if !configured {
                    return Err(invalid(format!(
                        "no configured compiler satisfies '%{compiler}'",
                        compiler = format_compiler(compiler)
                    )));
                }
            }
            if self.is_virtual(name) {
                continue;
            }
            let Ok(package) = self.repository.get(None, name) else {
                continue;
            };
            for (variant, value) in &node.variants {
                if !package.has_variant(variant) {
                    return Err(invalid(format!(
                        "variant '{variant}' does not exist in package '{name}'"
                    )));
                }
                for value in value.values() {
                    if !package
                        .variant_definitions(variant)
                        .any(|def| def.accepts(&value))
                    {
                        return Err(invalid(format!(
                            "'{value}' is not a valid value for '{name}' variant '{variant}'"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn literal_facts(&mut self, specs: &[Spec]) -> Result<(), SolveError> {
        self.program.section("requested specs");
        for (idx, spec) in specs.iter().enumerate() {
            let name = spec.name_or_empty().to_string();
            let effect = if self.is_virtual(&name) {
                let mut effect = vec![sym!("virtual_root", name.as_str())];
                effect.extend(self.clauses(spec, &name, &ClauseKind::Trigger)?);
                effect
            } else {
                let mut effect = vec![sym!("root", name.as_str())];
                let kind = ClauseKind::Effect(FlagSource::Literal);
                effect.extend(self.clauses(spec, &name, &kind)?);
                effect
            };
            for node in spec.traverse() {
                let Some(node_name) = node.name.as_deref() else {
                    continue;
                };
                for item in node.versions.items() {
                    if let VersionItem::Exact(version) = item {
                        self.declare_version(node_name, VersionOrigin::Spec, version.clone());
                    }
                }
            }
            let condition = self.condition(Vec::new(), effect, &spec.to_string());
            self.fact(sym!("literal", idx, condition));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------------------------
    // Site
    // -------------------------------------------------------------------------------------------

    fn platform_facts(&mut self) -> Result<(), SolveError> {
        let config = self.config;
        let platform = &config.platform;
        self.program.section("platform");
        self.program
            .fact(sym!("host_platform", platform.host_platform()));
        for (idx, os) in platform.os_candidates().into_iter().enumerate() {
            self.program.fact(sym!("os", os, idx));
        }
        for (idx, target) in platform.target_candidates().into_iter().enumerate() {
            self.program.fact(sym!("target", target, idx));
        }
        for (os, compatible) in &platform.os_compatibility {
            for other in compatible {
                self.program
                    .fact(sym!("os_compatibility_declared", os.as_str(), other.as_str()));
            }
        }
        for (target, ancestors) in &platform.target_ancestors {
            for parent in ancestors {
                self.program
                    .fact(sym!("target_parent", target.as_str(), parent.as_str()));
            }
        }
        if let Some(libc) = &platform.libc {
            let spec = parse_spec(libc)
                .map_err(|e| ConfigurationError::new("platform.libc", e.to_string()))?;
            let Some(name) = spec.name.as_deref() else {
                return Err(ConfigurationError::new("platform.libc", "the libc must be named").into());
            };
            self.program
                .fact(sym!("host_libc", name, spec.versions.to_string()));
        }
        Ok(())
    }

    fn global_facts(&mut self) {
        self.program.section("concretizer settings");
        if self.config.concretizer.allow_deprecated() {
            self.fact(sym!("deprecated_allowed"));
        }
        if self.config.concretizer.reuse() == ReuseMode::Dependencies {
            self.fact(sym!("no_root_reuse"));
        }
    }

    fn compiler_facts(&mut self) -> Result<(), SolveError> {
        let config = self.config;
        self.program.section("compilers");
        let mut compilers = Vec::new();
        for (idx, entry) in config.compilers.iter().enumerate() {
            let path = format!("compilers[{idx}]");
            let (name, version) = entry
                .name_and_version()
                .map_err(|e| ConfigurationError::from(e.within(&path)))?;
            self.program
                .fact(sym!("compiler", name.as_str(), version.to_string(), idx));
            compilers.push((idx, entry, name, version));
        }
        for (idx, entry, name, version) in compilers {
            let path = format!("compilers[{idx}]");
            let version_text = version.to_string();
            if entry.is_available() {
                self.fact(sym!("compiler_available", name.as_str(), version_text.as_str()));
            }
            if let Some(os) = &entry.operating_system {
                self.fact(sym!(
                    "compiler_os",
                    name.as_str(),
                    version_text.as_str(),
                    os.as_str()
                ));
            }
            let flags = entry
                .parsed_flags()
                .map_err(|e| ConfigurationError::from(e.within(&path)))?;
            for (flag_type, flags) in flags {
                for (position, flag) in flags.into_iter().enumerate() {
                    self.fact(sym!(
                        "compiler_flag",
                        name.as_str(),
                        version_text.as_str(),
                        flag_type.to_string(),
                        flag,
                        position
                    ));
                }
            }
            if let Some(runtime) = &entry.runtime {
                if !self.graph.packages.contains(runtime) {
                    return Err(ConfigurationError::new(
                        format!("{path}.runtime"),
                        format!("'{runtime}' is not a known package"),
                    )
                    .into());
                }
                let constraint = self
                    .clauses
                    .version_constraint(runtime, &VersionList::exact(version.clone()));
                let effect = vec![
                    sym!("node", runtime.as_str()),
                    sym!("node_version_satisfies", runtime.as_str(), constraint),
                ];
                let description = format!("{runtime}@={version_text} for {name}@{version_text}");
                let condition = self.condition(Vec::new(), effect, &description);
                self.fact(sym!("runtime_package", runtime.as_str()));
                self.fact(sym!(
                    "compiler_runtime",
                    name.as_str(),
                    version_text.as_str(),
                    condition
                ));
                self.declare_version(runtime, VersionOrigin::Runtime, version.clone());
            }
            self.compilers.push((name, version));
        }
        Ok(())
    }

    /// Describes the reusable specs whose whole DAG can take part in the solve. Returns the
    /// described nodes by hash.
    fn reuse_facts(&mut self, reusable: &[Arc<Spec>]) -> BTreeMap<String, Arc<Spec>> {
        self.program.section("reusable specs");
        let mut described: BTreeMap<String, Arc<Spec>> = BTreeMap::new();
        for root in reusable {
            let mut nodes = vec![root.clone()];
            nodes.extend(root.traverse_edges().into_iter().map(|(_, edge)| edge.spec.clone()));
            let usable = nodes
                .iter()
                .all(|node| self.graph.packages.contains(node.name_or_empty()));
            if !usable {
                tracing::trace!("'{}' has nodes outside the possible graph", root.format_node());
                continue;
            }
            for node in nodes {
                let Some(hash) = node.dag_hash().map(str::to_string) else {
                    continue;
                };
                if described.contains_key(&hash) {
                    continue;
                }
                self.describe_installed(&hash, &node);
                described.insert(hash, node);
            }
        }
        described
    }

    fn describe_installed(&mut self, hash: &str, node: &Spec) {
        fn text(value: impl AsRef<str>) -> Symbol {
            Symbol::from(value.as_ref())
        }
        let package = node.name_or_empty();
        let attr = |name: &str, args: Vec<Symbol>| {
            let mut all = vec![Symbol::from(hash), Symbol::from(name)];
            all.extend(args);
            Symbol::function("hash_attr", all)
        };

        self.fact(sym!("installed_hash", package, hash));
        if let Some(namespace) = &node.namespace {
            self.fact(attr("namespace", vec![text(package), text(namespace)]));
        }
        if let Some(version) = node.version() {
            self.fact(attr("version", vec![text(package), text(version.as_str())]));
            self.declare_version(package, VersionOrigin::Installed, version.clone());
        }
        for (key, value) in [
            ("node_platform", &node.arch.platform),
            ("node_os", &node.arch.os),
            ("node_target", &node.arch.target),
        ] {
            if let Some(value) = value {
                self.fact(attr(key, vec![text(package), text(value)]));
            }
        }
        for (name, value) in &node.variants {
            for value in value.values() {
                self.fact(attr(
                    "variant_value",
                    vec![text(package), text(name), text(&value)],
                ));
            }
        }
        if let Some(compiler) = &node.compiler {
            if let Some(version) = compiler.versions.concrete() {
                self.fact(attr(
                    "node_compiler_version",
                    vec![text(package), text(&compiler.name), text(version.as_str())],
                ));
            }
        }
        for (flag_type, flags) in node.compiler_flags.iter() {
            let ty = flag_type.to_string();
            for (position, flag) in flags.iter().enumerate() {
                self.fact(attr(
                    "node_flag",
                    vec![
                        text(package),
                        text(&ty),
                        text(&flag.flag),
                        Symbol::from(flag.source.tag()),
                        Symbol::from(position),
                    ],
                ));
            }
        }
        for edge in node.dependencies() {
            let child = edge.spec.name_or_empty();
            self.fact(attr(
                "depends_on",
                vec![text(package), text(child), Symbol::from(edge.deptypes.to_string())],
            ));
            if let Some(child_hash) = edge.spec.dag_hash() {
                self.fact(attr("child_hash", vec![text(child), text(child_hash)]));
            }
            for virtual_name in &edge.virtuals {
                self.fact(attr(
                    "virtual_on_edge",
                    vec![text(package), text(child), text(virtual_name)],
                ));
            }
        }
    }

    // -------------------------------------------------------------------------------------------
    // Packages
    // -------------------------------------------------------------------------------------------

    fn package_facts(&mut self, name: &str) -> Result<(), SolveError> {
        let repository = self.repository;
        let package = repository
            .get(None, name)
            .map_err(|e| SolveError::internal(format!("cannot load '{name}'"), e.to_string()))?;
        self.program.section(name);
        self.fact(pkg_fact(name, sym!("namespace", package.namespace.as_str())));

        self.declared_versions(package);
        self.preferred_versions(name)?;
        self.variant_facts(package)?;
        self.dependency_facts(package)?;
        self.conflict_facts(package)?;
        self.provider_facts(package)?;
        self.external_facts(name)?;
        if let Some(max_dupes) = self.graph.max_dupes.get(name) {
            self.fact(pkg_fact(name, sym!("max_dupes", *max_dupes)));
        }
        self.preference_facts(name)?;
        self.requirement_facts(package)?;
        Ok(())
    }

    fn declared_versions(&mut self, package: &PackageDefinition) {
        let (preferred, rest): (Vec<_>, Vec<_>) =
            package.versions.iter().partition(|v| v.preferred);
        let (develop, mut released): (Vec<_>, Vec<_>) =
            rest.into_iter().partition(|v| v.version.is_develop());
        released.sort_by(|a, b| b.version.cmp(&a.version));
        let develop = develop
            .into_iter()
            .sorted_by(|a, b| b.version.cmp(&a.version));
        for declared in preferred.into_iter().chain(released).chain(develop) {
            self.declare_version(&package.name, VersionOrigin::PackagePy, declared.version.clone());
            if declared.deprecated {
                self.fact(pkg_fact(
                    &package.name,
                    sym!("deprecated_version", declared.version.to_string()),
                ));
            }
        }
    }

    fn preferred_versions(&mut self, name: &str) -> Result<(), SolveError> {
        let site = self.config;
        let Some(config) = site.packages.get(name) else {
            return Ok(());
        };
        for (idx, text) in config.version.iter().enumerate() {
            let version = parse_version_preference(text)
                .map_err(|e| ConfigurationError::new(format!("packages.{name}.version[{idx}]"), e))?;
            self.declare_version(name, VersionOrigin::PackagesYaml, version);
        }
        Ok(())
    }

    fn variant_facts(&mut self, package: &PackageDefinition) -> Result<(), SolveError> {
        let name = package.name.as_str();
        for definition in &package.variants {
            self.next_variant += 1;
            let id = self.next_variant;
            self.fact(pkg_fact(
                name,
                sym!("variant_definition", definition.name.as_str(), id),
            ));
            self.fact(sym!("variant_type", id, definition.kind.to_string()));
            match &definition.values {
                AllowedValues::Any => self.fact(sym!("variant_open", id)),
                AllowedValues::Set(values) => {
                    for value in values {
                        self.fact(sym!("variant_possible_value", id, value.as_str()));
                    }
                }
            }
            for value in &definition.default {
                self.fact(sym!("variant_default", id, value.as_str()));
            }
            if definition.sticky {
                self.fact(sym!("variant_sticky", id));
            }
            if let Some(when) = &definition.when {
                let trigger = self.clauses(when, name, &ClauseKind::Trigger)?;
                let description = format!("{} when {}", definition.name, describe(name, when));
                let condition = self.condition(trigger, Vec::new(), &description);
                self.fact(pkg_fact(name, sym!("variant_condition", id, condition)));
            }
        }

        let Some((scope, preferences)) = scoped(self.config, name, |c| &c.variants) else {
            return Ok(());
        };
        for (idx, text) in preferences.iter().enumerate() {
            let spec = parse_spec(text).map_err(|e| {
                ConfigurationError::new(format!("packages.{scope}.variants[{idx}]"), e.to_string())
            })?;
            for (variant, value) in &spec.variants {
                if !package.has_variant(variant) {
                    continue;
                }
                for value in value.values() {
                    self.fact(pkg_fact(
                        name,
                        sym!("variant_default_preferred", variant.as_str(), value),
                    ));
                }
            }
        }
        Ok(())
    }

    fn dependency_facts(&mut self, package: &PackageDefinition) -> Result<(), SolveError> {
        let name = package.name.as_str();
        for dependency in &package.dependencies {
            let Some(child) = dependency.spec.name.as_deref() else {
                continue;
            };
            if !self.graph.contains(child) {
                continue;
            }
            let types = self.tests.deptypes(name, dependency.deptypes);
            if types.is_empty() {
                continue;
            }
            let trigger = self.clauses(&dependency.when, name, &ClauseKind::Trigger)?;
            let kind = ClauseKind::Effect(FlagSource::Dependent(name.to_string()));
            let mut effect = self.clauses(&dependency.spec, child, &kind)?;
            effect.insert(1, sym!("depends_on", name, child, types.to_string()));

            let mut description = format!("{name} depends on {}", dependency.spec);
            if dependency.when != Spec::default() {
                description.push_str(&format!(" when {}", describe(name, &dependency.when)));
            }
            let condition = self.condition(trigger, effect, &description);
            self.fact(pkg_fact(name, sym!("dependency_condition", condition, child)));
        }
        Ok(())
    }

    fn conflict_facts(&mut self, package: &PackageDefinition) -> Result<(), SolveError> {
        let name = package.name.as_str();
        for conflict in &package.conflicts {
            let trigger_clauses = self.clauses(&conflict.when, name, &ClauseKind::Trigger)?;
            let constraint_clauses = self.clauses(&conflict.conflict, name, &ClauseKind::Trigger)?;
            let when = describe(name, &conflict.when);
            let what = describe(name, &conflict.conflict);
            let trigger = self.condition(trigger_clauses, Vec::new(), &when);
            let constraint = self.condition(constraint_clauses, Vec::new(), &what);
            let message = match &conflict.message {
                Some(message) => message.clone(),
                None if conflict.when == Spec::default() => format!("'{what}' is not supported"),
                None => format!("'{what}' conflicts with '{when}'"),
            };
            self.fact(pkg_fact(
                name,
                sym!("conflict", trigger, constraint, message),
            ));
        }
        Ok(())
    }

    /// The providers allowed for a virtual by `require` entries on the virtual itself.
    fn allowed_providers(&self, virtual_name: &str) -> Option<BTreeSet<String>> {
        let entries = &self.config.packages.get(virtual_name)?.require;
        if entries.is_empty() {
            return None;
        }
        let allowed = entries
            .iter()
            .filter_map(|entry| entry.policy().ok())
            .flat_map(|policy| policy.members().to_vec())
            .filter_map(|text| parse_spec(&text).ok())
            .filter_map(|spec| spec.name)
            .collect();
        Some(allowed)
    }

    fn provider_facts(&mut self, package: &PackageDefinition) -> Result<(), SolveError> {
        let name = package.name.as_str();
        for provides in &package.provides {
            let Some(virtual_name) = provides.virtual_spec.name.clone() else {
                continue;
            };
            if !self.is_virtual(&virtual_name) {
                continue;
            }
            if self
                .allowed_providers(&virtual_name)
                .is_some_and(|allowed| !allowed.contains(name))
            {
                tracing::trace!("'{name}' may not provide '{virtual_name}'");
                continue;
            }
            let trigger = self.clauses(&provides.when, name, &ClauseKind::Trigger)?;
            let effect = vec![sym!("virtual_node", virtual_name.as_str())];
            let description = format!("{name} provides {}", provides.virtual_spec);
            let condition = self.condition(trigger, effect, &description);
            self.fact(pkg_fact(
                name,
                sym!("provider_condition", condition, virtual_name.as_str()),
            ));
            self.providers.push(ProviderCondition {
                package: name.to_string(),
                condition,
                virtual_name,
                versions: provides.virtual_spec.versions.clone(),
            });
        }
        Ok(())
    }

    fn external_facts(&mut self, name: &str) -> Result<(), SolveError> {
        let site = self.config;
        let Some(config) = site.packages.get(name) else {
            return Ok(());
        };
        let mut versions = Vec::new();
        for (idx, external) in config.externals.iter().enumerate() {
            let path = format!("packages.{name}.externals[{idx}].spec");
            let spec = parse_spec(&external.spec)
                .map_err(|e| ConfigurationError::new(path.clone(), e.to_string()))?;
            if spec.name.as_deref() != Some(name) {
                return Err(ConfigurationError::new(path, format!("the spec must name '{name}'")).into());
            }
            let version = parse_version_preference(&spec.versions.to_string())
                .map_err(|_| ConfigurationError::new(path.clone(), "the version must be concrete"))?;
            let mut node = spec.to_abstract_node();
            node.versions = VersionList::any();
            node.compiler = None;
            node.compiler_flags = FlagMap::default();
            let kind = ClauseKind::Effect(FlagSource::Requirement);
            let effect = self.clauses(&node, name, &kind)?;
            let condition = self.condition(
                vec![sym!("node", name)],
                effect,
                &format!("external {}", external.spec),
            );
            let idx = i64::try_from(idx).unwrap_or(i64::MAX);
            self.fact(pkg_fact(
                name,
                sym!("possible_external", condition, idx, version.to_string()),
            ));
            versions.push(version);
            self.externals.insert(
                (name.to_string(), idx),
                ExternalInfo {
                    prefix: external.prefix.clone(),
                    modules: external.modules.clone(),
                },
            );
        }
        versions.sort_by(|a, b| b.cmp(a));
        for version in versions {
            self.declare_version(name, VersionOrigin::External, version);
        }
        if !site.packages.is_buildable(name) {
            self.fact(pkg_fact(name, sym!("external_only")));
        }
        Ok(())
    }

    fn preference_facts(&mut self, name: &str) -> Result<(), SolveError> {
        let config = self.config;
        if let Some((_, targets)) = scoped(config, name, |c| &c.target) {
            for (idx, target) in targets.iter().enumerate() {
                self.fact(pkg_fact(name, sym!("target_weight", target.as_str(), idx)));
            }
        }
        let Some((scope, compilers)) = scoped(config, name, |c| &c.compiler) else {
            return Ok(());
        };
        let mut weights: BTreeMap<(String, String), usize> = BTreeMap::new();
        for (idx, text) in compilers.iter().enumerate() {
            let spec = parse_spec(text.trim_start_matches('%')).map_err(|e| {
                ConfigurationError::new(format!("packages.{scope}.compiler[{idx}]"), e.to_string())
            })?;
            for (compiler, version) in &self.compilers {
                if spec.name.as_deref() == Some(compiler.as_str()) && spec.versions.contains(version)
                {
                    weights
                        .entry((compiler.clone(), version.to_string()))
                        .or_insert(idx);
                }
            }
        }
        for ((compiler, version), weight) in weights {
            self.fact(pkg_fact(
                name,
                sym!("compiler_preference", compiler, version, weight),
            ));
        }
        Ok(())
    }

    fn requirement_facts(&mut self, package: &PackageDefinition) -> Result<(), SolveError> {
        let config = self.config;
        let name = package.name.as_str();
        for kind in ["require", "prefer", "conflict"] {
            let selected = scoped(config, name, |c| match kind {
                "require" => &c.require,
                "prefer" => &c.prefer,
                _ => &c.conflict,
            });
            let Some((scope, entries)) = selected else {
                continue;
            };
            for (idx, entry) in entries.iter().enumerate() {
                let path = format!("packages.{scope}.{kind}[{idx}]");
                self.requirement_group(package, kind, entry, &scope, &path)?;
            }
        }
        Ok(())
    }

    fn requirement_group(
        &mut self,
        package: &PackageDefinition,
        kind: &str,
        entry: &RequirementConfig,
        scope: &str,
        path: &str,
    ) -> Result<(), SolveError> {
        let name = package.name.as_str();
        let policy = entry
            .policy()
            .map_err(|message| ConfigurationError::new(path, message))?;
        let mut members = Vec::new();
        for (idx, text) in policy.members().iter().enumerate() {
            let spec = parse_spec(text)
                .map_err(|e| ConfigurationError::new(format!("{path}.{idx}"), e.to_string()))?;
            if let Err(reason) = check_requirement_member(package, &spec) {
                if scope == ALL_PACKAGES {
                    tracing::warn!("ignoring requirement '{text}' from 'all' for '{name}': {reason}");
                    continue;
                }
                return Err(SolveError::input(
                    format!("invalid requirement for '{name}'"),
                    reason,
                ));
            }
            members.push((idx, spec));
        }
        if members.is_empty() {
            return Ok(());
        }

        let mut conditions = Vec::new();
        for (weight, spec) in &members {
            let trigger = self.clauses(spec, name, &ClauseKind::Trigger)?;
            let effect = self.clauses(spec, name, &ClauseKind::Effect(FlagSource::Requirement))?;
            let condition = self.condition(trigger, effect, &describe(name, spec));
            conditions.push((condition, *weight));
        }
        let trigger = match entry.when() {
            Some(when) => {
                let spec = parse_spec(when)
                    .map_err(|e| ConfigurationError::new(format!("{path}.when"), e.to_string()))?;
                let clauses = self.clauses(&spec, name, &ClauseKind::Trigger)?;
                Some(self.condition(clauses, Vec::new(), &describe(name, &spec)))
            }
            None => None,
        };

        let described = members
            .iter()
            .map(|(_, spec)| format!("'{}'", describe(name, spec)))
            .join(", ");
        let policy_name = match policy {
            RequirementPolicy::Single(_) | RequirementPolicy::OneOf(_) => "one_of",
            RequirementPolicy::AnyOf(_) => "any_of",
        };
        let message = match entry.message() {
            Some(message) => message.to_string(),
            None => match (kind, policy_name, members.len()) {
                ("conflict", _, _) => format!("{described} is not allowed"),
                ("prefer", _, _) => format!("{described} is preferred"),
                (_, _, 1) => format!("{described} is required"),
                (_, "one_of", _) => format!("exactly one of {described} is required"),
                _ => format!("at least one of {described} is required"),
            },
        };

        self.next_group += 1;
        let group = self.next_group;
        self.fact(pkg_fact(name, sym!("requirement_group", group, policy_name, kind)));
        for (condition, weight) in conditions {
            self.fact(pkg_fact(
                name,
                sym!("requirement_member", group, condition, weight),
            ));
        }
        if let Some(trigger) = trigger {
            self.fact(pkg_fact(name, sym!("requirement_trigger", group, trigger)));
        }
        self.fact(pkg_fact(name, sym!("requirement_message", group, message)));
        Ok(())
    }

    // -------------------------------------------------------------------------------------------
    // Derived facts
    // -------------------------------------------------------------------------------------------

    fn virtual_facts(&mut self) {
        self.program.section("virtuals");
        let virtuals: Vec<String> = self.graph.virtuals.iter().cloned().collect();
        for virtual_name in virtuals {
            self.fact(sym!("virtual", virtual_name.as_str()));
            let providers: Vec<String> = self
                .providers
                .iter()
                .filter(|p| p.virtual_name == virtual_name)
                .map(|p| p.package.clone())
                .sorted()
                .dedup()
                .collect();
            let preferred: Vec<String> = self
                .config
                .packages
                .lookup(&virtual_name, |c| c.providers.get(&virtual_name))
                .cloned()
                .unwrap_or_default();
            let mut unlisted = 0;
            for provider in &providers {
                let weight = match preferred.iter().position(|p| p == provider) {
                    Some(position) => position,
                    None => {
                        unlisted += 1;
                        preferred.len() + unlisted - 1
                    }
                };
                self.fact(sym!(
                    "provider_weight",
                    provider.as_str(),
                    virtual_name.as_str(),
                    weight
                ));
            }
        }
    }

    /// Assigns each known version of a package a weight. Lower weights are preferred.
    fn version_facts(&mut self, packages: &[String]) {
        self.program.section("version preferences");
        for package in packages {
            let Some(mut declared) = self.versions.remove(package) else {
                continue;
            };
            declared.sort_by_key(|(origin, _)| *origin);
            let mut weights: BTreeMap<Version, usize> = BTreeMap::new();
            for (origin, version) in &declared {
                let next = weights.len();
                let weight = *weights.entry(version.clone()).or_insert(next);
                self.fact(pkg_fact(
                    package,
                    sym!(
                        "version_declared",
                        version.to_string(),
                        weight,
                        origin.to_string()
                    ),
                ));
            }
            self.versions.insert(package.clone(), declared);
        }
    }

    /// Resolves every version constraint used in a clause against the known versions.
    fn constraint_facts(&mut self) {
        self.program.section("version constraints");
        let mut facts = Vec::new();
        for package in self.clauses.constrained_packages() {
            if self.graph.virtuals.contains(package) {
                continue;
            }
            let known: BTreeSet<&Version> = self
                .versions
                .get(package)
                .into_iter()
                .flatten()
                .map(|(_, v)| v)
                .collect();
            for (text, list) in self.clauses.constraints_on(package) {
                for version in known.iter().filter(|v| list.contains(v)) {
                    facts.push(pkg_fact(
                        package,
                        sym!("version_satisfies", text, version.to_string()),
                    ));
                }
            }
        }
        for provider in &self.providers {
            for (text, list) in self.clauses.constraints_on(&provider.virtual_name) {
                if provider.versions.intersects(list) {
                    facts.push(pkg_fact(
                        &provider.package,
                        sym!("virtual_satisfies", provider.condition, text),
                    ));
                }
            }
        }
        for (name, text, list) in self.clauses.compiler_constraints() {
            for (compiler, version) in &self.compilers {
                if compiler == name && list.contains(version) {
                    facts.push(sym!(
                        "compiler_version_satisfies",
                        name,
                        text,
                        version.to_string()
                    ));
                }
            }
        }
        for fact in facts {
            self.fact(fact);
        }
    }
}

/// Looks up a list setting of a package, falling back to `all`. Returns the scope that set it.
fn scoped<'c, T>(
    config: &'c SiteConfig,
    name: &str,
    select: impl Fn(&'c PackageConfig) -> &'c Vec<T>,
) -> Option<(String, &'c Vec<T>)> {
    let packages = &config.packages;
    if let Some(values) = packages.get(name).map(&select).filter(|v| !v.is_empty()) {
        return Some((name.to_string(), values));
    }
    packages
        .all()
        .map(&select)
        .filter(|v| !v.is_empty())
        .map(|values| (ALL_PACKAGES.to_string(), values))
}

/// Checks that a requirement can be imposed on a package at all.
fn check_requirement_member(package: &PackageDefinition, spec: &Spec) -> Result<(), String> {
    if let Some(other) = spec.name.as_deref().filter(|n| *n != package.name) {
        return Err(format!("'{spec}' is about '{other}', not '{}'", package.name));
    }
    for (variant, value) in &spec.variants {
        if !package.has_variant(variant) {
            return Err(format!(
                "variant '{variant}' does not exist in package '{}'",
                package.name
            ));
        }
        for value in value.values() {
            if !package
                .variant_definitions(variant)
                .any(|def| def.accepts(&value))
            {
                return Err(format!(
                    "'{value}' is not a valid value for '{}' variant '{variant}'",
                    package.name
                ));
            }
        }
    }
    Ok(())
}

fn format_compiler(compiler: &spackle_types::CompilerSpec) -> String {
    compiler.to_string().trim_start_matches('%').to_string()
}

#[cfg(test)]
mod tests {
    use std::{str::FromStr, sync::Arc};

    use spackle_config::SiteConfig;
    use spackle_types::{
        ConflictDeclaration, DeclaredVersion, DepTypes, DependencyDeclaration, InMemoryRepository,
        PackageDefinition, Spec, VariantDefinition, Version,
    };

    use super::{setup, SetupInput};
    use crate::{
        counter::{possible_graph, TestScope},
        error::SolveError,
    };

    fn version(text: &str, preferred: bool) -> DeclaredVersion {
        DeclaredVersion {
            version: Version::from_str(text).unwrap(),
            preferred,
            deprecated: false,
        }
    }

    fn repository() -> InMemoryRepository {
        let mut a = PackageDefinition::new("pkg-a");
        a.versions = vec![version("1.0", false), version("2.0", false), version("develop", false)];
        a.variants = vec![
            VariantDefinition::boolean("X", false),
            VariantDefinition::boolean("Y", false),
        ];
        a.dependencies = vec![DependencyDeclaration {
            spec: Spec::from_str("pkg-b@1.0:1.5").unwrap(),
            when: Spec::default(),
            deptypes: DepTypes::BUILD_LINK,
        }];
        a.conflicts = vec![ConflictDeclaration {
            conflict: Spec::from_str("+X").unwrap(),
            when: Spec::from_str("+Y").unwrap(),
            message: None,
        }];
        let mut b = PackageDefinition::new("pkg-b");
        b.versions = vec![
            version("1.2", false),
            version("1.6", false),
            version("2.0", true),
        ];
        [a, b].into_iter().collect()
    }

    fn program(specs: &[&str], config: &SiteConfig) -> Result<String, SolveError> {
        let repo = repository();
        let specs: Vec<Spec> = specs.iter().map(|s| Spec::from_str(s).unwrap()).collect();
        let tests = TestScope::default();
        let graph = possible_graph(&repo, config, &specs, &[], &tests)?;
        let reusable: Vec<Arc<Spec>> = Vec::new();
        setup(SetupInput {
            repository: &repo,
            config,
            specs: &specs,
            reusable: &reusable,
            graph,
            tests: &tests,
            optional_literals: false,
        })
        .map(|problem| problem.text)
    }

    #[test]
    fn test_version_weights() {
        let text = program(&["pkg-a"], &SiteConfig::default()).unwrap();
        for fact in [
            r#"pkg_fact("pkg-b",version_declared("2.0",0,"package_py"))."#,
            r#"pkg_fact("pkg-b",version_declared("1.6",1,"package_py"))."#,
            r#"pkg_fact("pkg-b",version_declared("1.2",2,"package_py"))."#,
            r#"pkg_fact("pkg-a",version_declared("develop",2,"package_py"))."#,
            r#"pkg_fact("pkg-b",version_satisfies("1.0:1.5","1.2"))."#,
        ] {
            assert!(text.contains(fact), "missing {fact}\n{text}");
        }
        assert!(!text.contains(r#"version_satisfies("1.0:1.5","1.6")"#));
    }

    #[test]
    fn test_conflict_message_names_both_sides() {
        let text = program(&["pkg-a"], &SiteConfig::default()).unwrap();
        assert!(text.contains("'pkg-a+X' conflicts with 'pkg-a+Y'"), "{text}");
    }

    #[test]
    fn test_literals_are_validated() {
        let config = SiteConfig::default();
        for specs in [
            vec!["pkg-a +nope"],
            vec!["pkg-a X=maybe"],
            vec!["pkg-a %gcc"],
            vec!["pkg-a@1.0", "pkg-a@2.0"],
        ] {
            let err = program(&specs, &config).unwrap_err();
            assert!(matches!(err, SolveError::Input(_)), "{specs:?}: {err}");
        }
    }

    #[test]
    fn test_requirements_from_all_skip_unknown_variants() {
        let config = SiteConfig::from_toml_str(
            r#"
            [packages.all]
            require = ["+X"]
            "#,
        )
        .unwrap();
        let text = program(&["pkg-a"], &config).unwrap();
        assert!(text.contains(r#"pkg_fact("pkg-a",requirement_group(1,"one_of","require"))."#));
        assert!(!text.contains(r#"pkg_fact("pkg-b",requirement_group"#));

        let config = SiteConfig::from_toml_str(
            r#"
            [packages.pkg-b]
            require = ["+X"]
            "#,
        )
        .unwrap();
        let err = program(&["pkg-a"], &config).unwrap_err();
        assert!(matches!(err, SolveError::Input(_)));
    }

    #[test]
    fn test_external_version_must_be_concrete() {
        let config = SiteConfig::from_toml_str(
            r#"
            [[packages.pkg-b.externals]]
            spec = "pkg-b@1:"
            prefix = "/usr"
            "#,
        )
        .unwrap();
        let err = program(&["pkg-a"], &config).unwrap_err();
        assert!(matches!(&err, SolveError::Configuration(e) if e.path == "packages.pkg-b.externals[0].spec"));
    }
}
