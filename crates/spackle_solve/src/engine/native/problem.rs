//! Typed tables compiled from the grounded facts of a concretization program.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    str::FromStr,
    sync::Arc,
};

use spackle_types::DepTypes;
use strum::EnumString;

use super::BUILD_OFFSET;
use crate::engine::{datalog::FactBase, EngineError, Symbol};

pub(crate) type Name = Arc<str>;

/// Origins from which a node may be built.
const BUILDABLE_ORIGINS: [&str; 4] = ["spec", "packages_yaml", "package_py", "runtime"];

/// Priority of an error kind the program does not declare.
const UNKNOWN_ERROR_PRIORITY: i64 = 0;

/// The criteria the search knows how to charge, named the way the rule base declares them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, EnumString)]
pub(crate) enum Criterion {
    #[strum(serialize = "number of input specs not concretized")]
    UnsolvedLiterals,
    #[strum(serialize = "requirement weight")]
    RequirementWeight,
    #[strum(serialize = "deprecated versions used")]
    DeprecatedVersions,
    #[strum(serialize = "number of packages to build (vs. reuse)")]
    BuiltPackages,
    #[strum(serialize = "number of nodes from the same package")]
    DuplicateNodes,
    #[strum(serialize = "unmet preferences")]
    UnmetPreferences,
    #[strum(serialize = "version badness")]
    VersionBadness,
    #[strum(serialize = "non-preferred variant values")]
    NonDefaultVariants,
    #[strum(serialize = "non-preferred providers")]
    ProviderWeight,
    #[strum(serialize = "compiler mismatches")]
    CompilerMismatch,
    #[strum(serialize = "non-preferred compilers")]
    CompilerWeight,
    #[strum(serialize = "operating system mismatches")]
    OsMismatch,
    #[strum(serialize = "non-preferred operating systems")]
    OsWeight,
    #[strum(serialize = "target mismatches")]
    TargetMismatch,
    #[strum(serialize = "non-preferred targets")]
    TargetWeight,
}

/// A decision the search makes for every node, named the way `heuristic_step` facts refer to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
pub(crate) enum StepKind {
    #[strum(serialize = "requirement")]
    Requirement,
    #[strum(serialize = "origin")]
    Origin,
    #[strum(serialize = "version")]
    Version,
    #[strum(serialize = "node_os")]
    Os,
    #[strum(serialize = "node_target")]
    Target,
    #[strum(serialize = "node_compiler")]
    Compiler,
    #[strum(serialize = "variant_value")]
    Variant,
    #[strum(serialize = "depends_on")]
    Dependencies,
}

/// The decision order used when the program declares none.
const DEFAULT_STEP_ORDER: [StepKind; 8] = [
    StepKind::Requirement,
    StepKind::Origin,
    StepKind::Version,
    StepKind::Os,
    StepKind::Target,
    StepKind::Compiler,
    StepKind::Variant,
    StepKind::Dependencies,
];

/// Pairs of steps where the first reads what the second decides, so it must come first.
const STEP_PRECEDENCE: [(StepKind, StepKind); 8] = [
    (StepKind::Requirement, StepKind::Origin),
    (StepKind::Origin, StepKind::Version),
    (StepKind::Version, StepKind::Os),
    (StepKind::Version, StepKind::Target),
    (StepKind::Os, StepKind::Compiler),
    (StepKind::Target, StepKind::Compiler),
    (StepKind::Compiler, StepKind::Variant),
    (StepKind::Variant, StepKind::Dependencies),
];

/// Where a criterion sits in the cost vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CriterionSlot {
    Fixed(i64),
    PerNode(i64),
}

#[derive(Debug, Clone)]
pub(crate) struct VersionInfo {
    pub version: Name,
    pub weight: i64,
    pub origins: BTreeSet<Name>,
}

impl VersionInfo {
    pub fn buildable(&self) -> bool {
        self.origins
            .iter()
            .any(|origin| BUILDABLE_ORIGINS.contains(&origin.as_ref()))
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct VariantDef {
    pub kind: Name,
    pub values: Vec<Name>,
    pub open: bool,
    pub defaults: Vec<Name>,
    pub sticky: bool,
}

impl VariantDef {
    pub fn accepts(&self, value: &str) -> bool {
        self.open || self.values.iter().any(|v| v.as_ref() == value)
    }

    pub fn is_multi(&self) -> bool {
        self.kind.as_ref() == "multi"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Policy {
    OneOf,
    AnyOf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequirementKind {
    Require,
    Prefer,
    Conflict,
}

#[derive(Debug, Clone)]
pub(crate) struct RequirementGroup {
    pub id: i64,
    pub policy: Policy,
    pub kind: RequirementKind,
    pub members: Vec<(i64, i64)>,
    pub trigger: Option<i64>,
    pub message: Name,
}

#[derive(Debug, Clone)]
pub(crate) struct DependencyCondition {
    pub condition: i64,
    pub child: Name,
    pub types: DepTypes,
}

#[derive(Debug, Clone)]
pub(crate) struct Conflict {
    pub trigger: i64,
    pub constraint: i64,
    pub message: Name,
}

#[derive(Debug, Clone)]
pub(crate) struct ExternalCandidate {
    pub condition: i64,
    pub index: i64,
    pub version: Name,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct PackageInfo {
    pub namespace: Option<Name>,
    pub versions: Vec<VersionInfo>,
    pub deprecated: BTreeSet<Name>,
    pub version_satisfies: BTreeSet<(Name, Name)>,
    pub variant_defs: BTreeMap<Name, Vec<i64>>,
    pub variant_conditions: HashMap<i64, i64>,
    pub variant_order: Vec<Name>,
    pub variant_preferred: BTreeMap<Name, Vec<Name>>,
    pub dependencies: Vec<DependencyCondition>,
    pub conflicts: Vec<Conflict>,
    pub provider_conditions: Vec<(i64, Name)>,
    pub virtual_satisfies: BTreeSet<(i64, Name)>,
    pub externals: Vec<ExternalCandidate>,
    pub external_only: bool,
    pub max_dupes: usize,
    pub installed: Vec<Name>,
    pub requirements: Vec<RequirementGroup>,
    pub target_weights: BTreeMap<Name, i64>,
    pub compiler_preferences: BTreeMap<(Name, Name), i64>,
}

impl PackageInfo {
    pub fn version(&self, version: &str) -> Option<&VersionInfo> {
        self.versions.iter().find(|v| v.version.as_ref() == version)
    }

    pub fn satisfies(&self, constraint: &str, version: &str) -> bool {
        self.version_satisfies
            .contains(&(Name::from(constraint), Name::from(version)))
    }
}

/// A condition with its trigger split relative to the package that owns it. Clauses about the
/// owner are local and can be checked on a single node; all others must hold on some dependency.
#[derive(Debug, Clone, Default)]
pub(crate) struct Condition {
    pub trigger: Vec<Symbol>,
    pub effect: Vec<Symbol>,
    pub local: Vec<Symbol>,
    pub nonlocal: Vec<(Name, Vec<Symbol>)>,
}

impl Condition {
    pub fn is_local(&self) -> bool {
        self.nonlocal.is_empty()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CompilerInfo {
    pub name: Name,
    pub version: Name,
    pub weight: i64,
    pub os: Option<Name>,
    pub available: bool,
    pub flags: Vec<(Name, Name, i64)>,
}

#[derive(Debug, Clone)]
pub(crate) struct RuntimeDependency {
    pub compiler: (Name, Name),
    pub condition: i64,
    pub package: Name,
}

#[derive(Debug, Clone)]
pub(crate) struct Literal {
    pub index: i64,
    pub condition: i64,
    pub package: Name,
    pub is_virtual: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct InstalledDependency {
    pub package: Name,
    pub hash: Name,
    pub types: DepTypes,
    pub virtuals: BTreeSet<Name>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct InstalledSpec {
    pub package: Name,
    pub namespace: Option<Name>,
    pub version: Option<Name>,
    pub variants: BTreeMap<Name, BTreeSet<Name>>,
    pub platform: Option<Name>,
    pub os: Option<Name>,
    pub target: Option<Name>,
    pub compiler: Option<(Name, Name)>,
    pub flags: Vec<(Name, Name, Name, i64)>,
    pub dependencies: Vec<InstalledDependency>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Problem {
    pub packages: BTreeMap<Name, PackageInfo>,
    pub virtuals: BTreeSet<Name>,
    pub providers: BTreeMap<Name, Vec<(Name, i64)>>,
    pub conditions: HashMap<i64, Condition>,
    pub descriptions: HashMap<i64, Name>,
    pub literals: Vec<Literal>,
    pub optional_literals: bool,
    pub deprecated_allowed: bool,
    pub no_root_reuse: bool,
    pub host_platform: Option<Name>,
    pub os: Vec<(Name, i64)>,
    pub targets: Vec<(Name, i64)>,
    pub os_compatible: BTreeSet<(Name, Name)>,
    pub target_compatible: BTreeSet<(Name, Name)>,
    pub compilers: Vec<CompilerInfo>,
    pub compiler_version_satisfies: BTreeSet<(Name, Name, Name)>,
    pub runtimes: Vec<RuntimeDependency>,
    pub runtime_packages: BTreeSet<Name>,
    pub variant_defs: HashMap<i64, VariantDef>,
    pub installed: BTreeMap<Name, InstalledSpec>,
    pub criteria: Vec<(i64, Name)>,
    pub build_criteria: Vec<(i64, Name)>,
    pub error_messages: HashMap<Name, (i64, Name)>,
    pub origin_preference: Vec<(Name, i64)>,
    slots: BTreeMap<Criterion, CriterionSlot>,
    pub step_order: Vec<StepKind>,
    heuristic_steps: Vec<(i64, StepKind)>,
    triggers: HashMap<i64, Vec<Symbol>>,
    effects: HashMap<i64, Vec<Symbol>>,
    condition_triggers: HashMap<i64, i64>,
    condition_effects: HashMap<i64, i64>,
    provider_weights: BTreeMap<(Name, Name), i64>,
}

fn malformed(fact: &Symbol, reason: impl Into<String>) -> EngineError {
    EngineError::MalformedFact {
        fact: fact.to_string(),
        reason: reason.into(),
    }
}

/// Typed access to the arguments of a fact.
struct Args<'a> {
    fact: &'a Symbol,
    args: &'a [Symbol],
}

impl<'a> Args<'a> {
    fn new(fact: &'a Symbol, args: &'a [Symbol]) -> Self {
        Self { fact, args }
    }

    fn text(&self, idx: usize) -> Result<Name, EngineError> {
        match self.args.get(idx) {
            Some(Symbol::String(s)) => Ok(s.clone()),
            _ => Err(malformed(self.fact, format!("argument {idx} must be a string"))),
        }
    }

    fn number(&self, idx: usize) -> Result<i64, EngineError> {
        self.args
            .get(idx)
            .and_then(Symbol::as_number)
            .ok_or_else(|| malformed(self.fact, format!("argument {idx} must be a number")))
    }

    fn symbol(&self, idx: usize) -> Result<&'a Symbol, EngineError> {
        self.args
            .get(idx)
            .ok_or_else(|| malformed(self.fact, format!("missing argument {idx}")))
    }
}

/// The package a clause is about, or `None` for clauses that are not constraints on a node.
pub(crate) fn clause_subject(clause: &Symbol) -> Option<&str> {
    match clause.name() {
        Some("depends_on") => None,
        _ => clause.str_arg(0),
    }
}

fn split_clauses(clauses: &[Symbol], owner: &str) -> (Vec<Symbol>, Vec<(Name, Vec<Symbol>)>) {
    let mut local = Vec::new();
    let mut nonlocal: Vec<(Name, Vec<Symbol>)> = Vec::new();
    for clause in clauses {
        match clause_subject(clause) {
            None => {}
            Some(subject) if subject == owner => local.push(clause.clone()),
            Some(subject) => match nonlocal.iter_mut().find(|(s, _)| s.as_ref() == subject) {
                Some((_, group)) => group.push(clause.clone()),
                None => nonlocal.push((Name::from(subject), vec![clause.clone()])),
            },
        }
    }
    (local, nonlocal)
}

impl Problem {
    /// Compiles the tables from the grounded facts.
    pub fn compile(facts: &FactBase) -> Result<Self, EngineError> {
        let mut problem = Problem::default();
        for fact in facts.iter() {
            problem.read_fact(fact)?;
        }
        problem.finish()?;
        Ok(problem)
    }

    /// Returns true if the facts describe a concretization problem rather than a plain query.
    pub fn is_concretization(facts: &FactBase) -> bool {
        facts.atoms("literal", 2).next().is_some()
    }

    fn package(&mut self, name: Name) -> &mut PackageInfo {
        self.packages.entry(name).or_insert_with(|| PackageInfo {
            max_dupes: 1,
            ..Default::default()
        })
    }

    fn read_fact(&mut self, fact: &Symbol) -> Result<(), EngineError> {
        let Some((name, arity)) = fact.signature() else {
            return Ok(());
        };
        let a = Args::new(fact, fact.args());
        match (name, arity) {
            ("pkg_fact", 2) => {
                let package = a.text(0)?;
                let inner = a.symbol(1)?;
                self.read_package_fact(fact, package, inner)?;
            }
            ("host_platform", 1) => self.host_platform = Some(a.text(0)?),
            ("os", 2) => self.os.push((a.text(0)?, a.number(1)?)),
            ("target", 2) => self.targets.push((a.text(0)?, a.number(1)?)),
            ("os_compatible", 2) => {
                self.os_compatible.insert((a.text(0)?, a.text(1)?));
            }
            ("target_compatible", 2) => {
                self.target_compatible.insert((a.text(0)?, a.text(1)?));
            }
            ("deprecated_allowed", 0) => self.deprecated_allowed = true,
            ("optional_literals", 0) => self.optional_literals = true,
            ("no_root_reuse", 0) => self.no_root_reuse = true,
            ("virtual", 1) => {
                self.virtuals.insert(a.text(0)?);
            }
            ("possible_provider", 2) => {
                self.providers
                    .entry(a.text(1)?)
                    .or_default()
                    .push((a.text(0)?, i64::MAX));
            }
            ("provider_weight", 3) => {
                self.provider_weights
                    .insert((a.text(0)?, a.text(1)?), a.number(2)?);
            }
            ("compiler", 3) => self.compilers.push(CompilerInfo {
                name: a.text(0)?,
                version: a.text(1)?,
                weight: a.number(2)?,
                os: None,
                available: false,
                flags: Vec::new(),
            }),
            ("compiler_available", 2) => {
                let (name, version) = (a.text(0)?, a.text(1)?);
                if let Some(compiler) = self.compiler_mut(&name, &version) {
                    compiler.available = true;
                }
            }
            ("compiler_os", 3) => {
                let (name, version, os) = (a.text(0)?, a.text(1)?, a.text(2)?);
                if let Some(compiler) = self.compiler_mut(&name, &version) {
                    compiler.os = Some(os);
                }
            }
            ("compiler_flag", 5) => {
                let (name, version) = (a.text(0)?, a.text(1)?);
                let flag = (a.text(2)?, a.text(3)?, a.number(4)?);
                if let Some(compiler) = self.compiler_mut(&name, &version) {
                    compiler.flags.push(flag);
                }
            }
            ("compiler_version_satisfies", 3) => {
                self.compiler_version_satisfies
                    .insert((a.text(0)?, a.text(1)?, a.text(2)?));
            }
            ("compiler_runtime", 3) => self.runtimes.push(RuntimeDependency {
                compiler: (a.text(0)?, a.text(1)?),
                condition: a.number(2)?,
                package: Name::from(""),
            }),
            ("runtime_package", 1) => {
                self.runtime_packages.insert(a.text(0)?);
            }
            ("literal", 2) => self.literals.push(Literal {
                index: a.number(0)?,
                condition: a.number(1)?,
                package: Name::from(""),
                is_virtual: false,
            }),
            ("condition_trigger", 2) => {
                self.condition_triggers.insert(a.number(0)?, a.number(1)?);
            }
            ("condition_effect", 2) => {
                self.condition_effects.insert(a.number(0)?, a.number(1)?);
            }
            ("trigger_clause", 2) => {
                let clause = a.symbol(1)?.clone();
                self.triggers.entry(a.number(0)?).or_default().push(clause);
            }
            ("effect_clause", 2) => {
                let clause = a.symbol(1)?.clone();
                self.effects.entry(a.number(0)?).or_default().push(clause);
            }
            ("condition_desc", 2) => {
                self.descriptions.insert(a.number(0)?, a.text(1)?);
            }
            ("variant_type", 2) => self.variant_def(a.number(0)?).kind = a.text(1)?,
            ("variant_possible_value", 2) => {
                let value = a.text(1)?;
                self.variant_def(a.number(0)?).values.push(value);
            }
            ("variant_open", 1) => self.variant_def(a.number(0)?).open = true,
            ("variant_default", 2) => {
                let value = a.text(1)?;
                self.variant_def(a.number(0)?).defaults.push(value);
            }
            ("variant_sticky", 1) => self.variant_def(a.number(0)?).sticky = true,
            ("installed_hash", 2) => {
                let (package, hash) = (a.text(0)?, a.text(1)?);
                self.package(package.clone()).installed.push(hash.clone());
                self.installed.entry(hash).or_default().package = package;
            }
            ("hash_attr", _) => self.read_hash_attr(fact)?,
            ("opt_criterion", 2) => {
                let (priority, name) = (a.number(0)?, a.text(1)?);
                self.declare_criterion(&name, CriterionSlot::Fixed(priority));
                self.criteria.push((priority, name));
            }
            ("build_criterion", 2) => {
                let (priority, name) = (a.number(0)?, a.text(1)?);
                self.declare_criterion(&name, CriterionSlot::PerNode(priority));
                self.build_criteria.push((priority, name));
            }
            ("error_message", 3) => {
                self.error_messages
                    .insert(a.text(0)?, (a.number(1)?, a.text(2)?));
            }
            ("heuristic_step", 2) => {
                let step = StepKind::from_str(&a.text(1)?)
                    .map_err(|_| malformed(fact, "unknown decision"))?;
                self.heuristic_steps.push((a.number(0)?, step));
            }
            ("origin_preference", 2) => {
                self.origin_preference.push((a.text(0)?, a.number(1)?));
            }
            _ => {}
        }
        Ok(())
    }

    fn read_package_fact(
        &mut self,
        fact: &Symbol,
        package: Name,
        inner: &Symbol,
    ) -> Result<(), EngineError> {
        let Some((name, arity)) = inner.signature() else {
            return Err(malformed(fact, "the second argument must be a function term"));
        };
        let a = Args::new(fact, inner.args());
        let info = self.package(package);
        match (name, arity) {
            ("namespace", 1) => info.namespace = Some(a.text(0)?),
            ("version_declared", 3) => {
                let (version, weight, origin) = (a.text(0)?, a.number(1)?, a.text(2)?);
                match info.versions.iter_mut().find(|v| v.version == version) {
                    Some(existing) => {
                        existing.weight = existing.weight.min(weight);
                        existing.origins.insert(origin);
                    }
                    None => info.versions.push(VersionInfo {
                        version,
                        weight,
                        origins: BTreeSet::from([origin]),
                    }),
                }
            }
            ("deprecated_version", 1) => {
                info.deprecated.insert(a.text(0)?);
            }
            ("version_satisfies", 2) => {
                info.version_satisfies.insert((a.text(0)?, a.text(1)?));
            }
            ("variant_definition", 2) => {
                info.variant_defs
                    .entry(a.text(0)?)
                    .or_default()
                    .push(a.number(1)?);
            }
            ("variant_condition", 2) => {
                info.variant_conditions.insert(a.number(0)?, a.number(1)?);
            }
            ("variant_default_preferred", 2) => {
                info.variant_preferred
                    .entry(a.text(0)?)
                    .or_default()
                    .push(a.text(1)?);
            }
            ("dependency_condition", 2) => info.dependencies.push(DependencyCondition {
                condition: a.number(0)?,
                child: a.text(1)?,
                types: DepTypes::NONE,
            }),
            ("conflict", 3) => info.conflicts.push(Conflict {
                trigger: a.number(0)?,
                constraint: a.number(1)?,
                message: a.text(2)?,
            }),
            ("provider_condition", 2) => {
                info.provider_conditions.push((a.number(0)?, a.text(1)?));
            }
            ("virtual_satisfies", 2) => {
                info.virtual_satisfies.insert((a.number(0)?, a.text(1)?));
            }
            ("possible_external", 3) => info.externals.push(ExternalCandidate {
                condition: a.number(0)?,
                index: a.number(1)?,
                version: a.text(2)?,
            }),
            ("external_only", 0) => info.external_only = true,
            ("max_dupes", 1) => {
                info.max_dupes = usize::try_from(a.number(0)?)
                    .map_err(|_| malformed(fact, "max_dupes must not be negative"))?
                    .max(1);
            }
            ("target_weight", 2) => {
                info.target_weights.insert(a.text(0)?, a.number(1)?);
            }
            ("compiler_preference", 3) => {
                info.compiler_preferences
                    .insert((a.text(0)?, a.text(1)?), a.number(2)?);
            }
            ("requirement_group", 3) => {
                let policy = match a.text(1)?.as_ref() {
                    "one_of" => Policy::OneOf,
                    "any_of" => Policy::AnyOf,
                    other => return Err(malformed(fact, format!("unknown policy '{other}'"))),
                };
                let kind = match a.text(2)?.as_ref() {
                    "require" => RequirementKind::Require,
                    "prefer" => RequirementKind::Prefer,
                    "conflict" => RequirementKind::Conflict,
                    other => return Err(malformed(fact, format!("unknown kind '{other}'"))),
                };
                info.requirements.push(RequirementGroup {
                    id: a.number(0)?,
                    policy,
                    kind,
                    members: Vec::new(),
                    trigger: None,
                    message: Name::from(""),
                });
            }
            ("requirement_member", 3) => {
                let (group, condition, weight) = (a.number(0)?, a.number(1)?, a.number(2)?);
                let group = requirement_group(info, group, fact)?;
                group.members.push((condition, weight));
            }
            ("requirement_trigger", 2) => {
                let (group, condition) = (a.number(0)?, a.number(1)?);
                requirement_group(info, group, fact)?.trigger = Some(condition);
            }
            ("requirement_message", 2) => {
                let (group, message) = (a.number(0)?, a.text(1)?);
                requirement_group(info, group, fact)?.message = message;
            }
            _ => {}
        }
        Ok(())
    }

    fn read_hash_attr(&mut self, fact: &Symbol) -> Result<(), EngineError> {
        let a = Args::new(fact, fact.args());
        let hash = a.text(0)?;
        let attribute = a.text(1)?;
        let spec = self.installed.entry(hash).or_default();
        match (attribute.as_ref(), fact.args().len()) {
            ("namespace", 4) => spec.namespace = Some(a.text(3)?),
            ("version", 4) => spec.version = Some(a.text(3)?),
            ("node_platform", 4) => spec.platform = Some(a.text(3)?),
            ("node_os", 4) => spec.os = Some(a.text(3)?),
            ("node_target", 4) => spec.target = Some(a.text(3)?),
            ("variant_value", 5) => {
                spec.variants
                    .entry(a.text(3)?)
                    .or_default()
                    .insert(a.text(4)?);
            }
            ("node_compiler_version", 5) => spec.compiler = Some((a.text(3)?, a.text(4)?)),
            ("node_flag", 7) => {
                spec.flags
                    .push((a.text(3)?, a.text(4)?, a.text(5)?, a.number(6)?));
            }
            ("depends_on", 5) => {
                let child = a.text(3)?;
                let types = DepTypes::from_str(&a.text(4)?)
                    .map_err(|e| malformed(fact, e.to_string()))?;
                match spec.dependencies.iter_mut().find(|d| d.package == child) {
                    Some(dep) => dep.types |= types,
                    None => spec.dependencies.push(InstalledDependency {
                        package: child,
                        hash: Name::from(""),
                        types,
                        virtuals: BTreeSet::new(),
                    }),
                }
            }
            ("child_hash", 4) => {
                let (child, child_hash) = (a.text(2)?, a.text(3)?);
                match spec.dependencies.iter_mut().find(|d| d.package == child) {
                    Some(dep) => dep.hash = child_hash,
                    None => spec.dependencies.push(InstalledDependency {
                        package: child,
                        hash: child_hash,
                        types: DepTypes::NONE,
                        virtuals: BTreeSet::new(),
                    }),
                }
            }
            ("virtual_on_edge", 5) => {
                let (child, virtual_name) = (a.text(3)?, a.text(4)?);
                if let Some(dep) = spec.dependencies.iter_mut().find(|d| d.package == child) {
                    dep.virtuals.insert(virtual_name);
                }
            }
            _ => return Err(malformed(fact, "unknown installed attribute")),
        }
        Ok(())
    }

    fn compiler_mut(&mut self, name: &str, version: &str) -> Option<&mut CompilerInfo> {
        self.compilers
            .iter_mut()
            .find(|c| c.name.as_ref() == name && c.version.as_ref() == version)
    }

    fn variant_def(&mut self, id: i64) -> &mut VariantDef {
        self.variant_defs.entry(id).or_default()
    }

    /// Resolves cross references once all facts have been read.
    fn finish(&mut self) -> Result<(), EngineError> {
        let mut conditions = HashMap::new();
        for (&condition, &trigger) in &self.condition_triggers {
            let effect = self
                .condition_effects
                .get(&condition)
                .and_then(|e| self.effects.get(e))
                .cloned()
                .unwrap_or_default();
            conditions.insert(
                condition,
                Condition {
                    trigger: self.triggers.get(&trigger).cloned().unwrap_or_default(),
                    effect,
                    ..Default::default()
                },
            );
        }
        for (&condition, &effect) in &self.condition_effects {
            conditions.entry(condition).or_insert_with(|| Condition {
                effect: self.effects.get(&effect).cloned().unwrap_or_default(),
                ..Default::default()
            });
        }
        self.conditions = conditions;

        // Assign owners to conditions and split their triggers accordingly.
        let mut owners: Vec<(i64, Name)> = Vec::new();
        for (name, info) in &self.packages {
            let conditions = info
                .dependencies
                .iter()
                .map(|d| d.condition)
                .chain(info.conflicts.iter().flat_map(|c| [c.trigger, c.constraint]))
                .chain(info.provider_conditions.iter().map(|(c, _)| *c))
                .chain(info.variant_conditions.values().copied())
                .chain(info.externals.iter().map(|e| e.condition))
                .chain(info.requirements.iter().flat_map(|g| {
                    g.members.iter().map(|(c, _)| *c).chain(g.trigger)
                }));
            owners.extend(conditions.map(|c| (c, name.clone())));
        }
        for (condition, owner) in owners {
            if let Some(cond) = self.conditions.get_mut(&condition) {
                let (local, nonlocal) = split_clauses(&cond.trigger, &owner);
                cond.local = local;
                cond.nonlocal = nonlocal;
            }
        }

        for literal in &mut self.literals {
            let effect = self
                .conditions
                .get(&literal.condition)
                .map(|c| c.effect.as_slice())
                .unwrap_or_default();
            let root = effect
                .iter()
                .find(|clause| clause.is("root", 1) || clause.is("virtual_root", 1));
            let Some(root) = root else {
                return Err(EngineError::MalformedFact {
                    fact: format!("literal({},{})", literal.index, literal.condition),
                    reason: "the literal does not name a root".to_string(),
                });
            };
            literal.is_virtual = root.is("virtual_root", 1);
            literal.package = Name::from(root.str_arg(0).unwrap_or_default());
        }
        self.literals.sort_by_key(|l| l.index);

        for runtime in &mut self.runtimes {
            let package = self
                .conditions
                .get(&runtime.condition)
                .and_then(|c| c.effect.iter().find(|clause| clause.is("node", 1)))
                .and_then(|clause| clause.str_arg(0));
            if let Some(package) = package {
                runtime.package = Name::from(package);
            }
        }

        for info in self.packages.values_mut() {
            info.versions
                .sort_by(|a, b| a.weight.cmp(&b.weight).then_with(|| a.version.cmp(&b.version)));
            for dependency in &mut info.dependencies {
                let types = self
                    .conditions
                    .get(&dependency.condition)
                    .and_then(|c| c.effect.iter().find(|clause| clause.is("depends_on", 3)))
                    .and_then(|clause| clause.str_arg(2))
                    .map(DepTypes::from_str)
                    .transpose()
                    .map_err(|e| EngineError::MalformedFact {
                        fact: format!("dependency_condition({})", dependency.condition),
                        reason: e.to_string(),
                    })?;
                dependency.types = types.unwrap_or(DepTypes::BUILD_LINK);
            }
            for defs in info.variant_defs.values_mut() {
                defs.sort_unstable();
            }
            for group in &mut info.requirements {
                group.members.sort_by_key(|(condition, weight)| (*weight, *condition));
            }
            info.requirements.sort_by_key(|g| g.id);
        }
        self.compute_variant_order();

        for (virtual_name, providers) in &mut self.providers {
            for (provider, weight) in providers.iter_mut() {
                *weight = self
                    .provider_weights
                    .get(&(provider.clone(), virtual_name.clone()))
                    .copied()
                    .unwrap_or(i64::MAX);
            }
            providers.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
            providers.dedup_by(|a, b| a.0 == b.0);
        }

        self.os.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        self.targets
            .sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        self.compilers.sort_by(|a, b| {
            a.weight
                .cmp(&b.weight)
                .then_with(|| a.name.cmp(&b.name))
                .then_with(|| a.version.cmp(&b.version))
        });
        self.origin_preference.sort_by_key(|(_, weight)| *weight);
        self.compute_step_order()?;
        Ok(())
    }

    /// Orders the per-node decisions by their `heuristic_step` facts. Every decision must be
    /// named exactly once and the order must respect [`STEP_PRECEDENCE`].
    fn compute_step_order(&mut self) -> Result<(), EngineError> {
        if self.heuristic_steps.is_empty() {
            self.step_order = DEFAULT_STEP_ORDER.to_vec();
            return Ok(());
        }
        let invalid = |reason: String| EngineError::MalformedFact {
            fact: "heuristic_step/2".to_string(),
            reason,
        };
        self.heuristic_steps.sort_by_key(|(position, _)| *position);
        let order: Vec<StepKind> = self.heuristic_steps.iter().map(|(_, step)| *step).collect();
        let position = |step: StepKind| order.iter().position(|s| *s == step);
        for step in DEFAULT_STEP_ORDER {
            if order.iter().filter(|s| **s == step).count() != 1 {
                return Err(invalid(format!("{step:?} must be ordered exactly once")));
            }
        }
        for (before, after) in STEP_PRECEDENCE {
            if position(before) > position(after) {
                return Err(invalid(format!("{before:?} must be decided before {after:?}")));
            }
        }
        self.step_order = order;
        Ok(())
    }

    /// Orders the variants of every package so that a variant is decided after the variants its
    /// conditions refer to.
    fn compute_variant_order(&mut self) {
        let mut orders = Vec::new();
        for (package, info) in &self.packages {
            let references: BTreeMap<&Name, BTreeSet<Name>> = info
                .variant_defs
                .iter()
                .map(|(name, defs)| {
                    let referenced = defs
                        .iter()
                        .filter_map(|def| info.variant_conditions.get(def))
                        .filter_map(|c| self.conditions.get(c))
                        .flat_map(|c| c.local.iter())
                        .filter(|clause| clause.is("variant_value", 3))
                        .filter_map(|clause| clause.str_arg(1))
                        .filter(|referenced| referenced != &name.as_ref())
                        .map(Name::from)
                        .collect();
                    (name, referenced)
                })
                .collect();

            fn visit(
                name: &Name,
                references: &BTreeMap<&Name, BTreeSet<Name>>,
                visiting: &mut BTreeSet<Name>,
                order: &mut Vec<Name>,
            ) {
                if order.contains(name) || !visiting.insert(name.clone()) {
                    return;
                }
                for dependency in references.get(name).into_iter().flatten() {
                    if references.contains_key(dependency) {
                        visit(dependency, references, visiting, order);
                    }
                }
                order.push(name.clone());
            }

            let mut order = Vec::new();
            let mut visiting = BTreeSet::new();
            for name in references.keys() {
                visit(name, &references, &mut visiting, &mut order);
            }
            orders.push((package.clone(), order));
        }
        for (package, order) in orders {
            if let Some(info) = self.packages.get_mut(&package) {
                info.variant_order = order;
            }
        }
    }

    pub fn is_virtual(&self, name: &str) -> bool {
        self.virtuals.contains(name)
    }

    pub fn condition(&self, id: i64) -> Option<&Condition> {
        self.conditions.get(&id)
    }

    pub fn error_kind(&self, kind: &str) -> (i64, Name) {
        self.error_messages
            .get(kind)
            .cloned()
            .unwrap_or_else(|| (UNKNOWN_ERROR_PRIORITY, Name::from(kind)))
    }

    pub fn default_os(&self) -> Option<&Name> {
        self.os.first().map(|(os, _)| os)
    }

    pub fn default_target(&self) -> Option<&Name> {
        self.targets.first().map(|(target, _)| target)
    }

    pub fn os_compatible(&self, parent: &str, child: &str) -> bool {
        parent == child
            || self
                .os_compatible
                .contains(&(Name::from(parent), Name::from(child)))
    }

    /// Returns true if code for `child` runs on `parent`.
    pub fn target_compatible(&self, parent: &str, child: &str) -> bool {
        parent == child
            || self
                .target_compatible
                .contains(&(Name::from(parent), Name::from(child)))
    }

    pub fn compiler_satisfies(&self, name: &str, constraint: &str, version: &str) -> bool {
        self.compiler_version_satisfies.contains(&(
            Name::from(name),
            Name::from(constraint),
            Name::from(version),
        ))
    }

    pub fn provider_weight(&self, virtual_name: &str, provider: &str) -> i64 {
        self.providers
            .get(virtual_name)
            .and_then(|providers| providers.iter().find(|(p, _)| p.as_ref() == provider))
            .map_or(0, |(_, weight)| if *weight == i64::MAX { 0 } else { *weight })
    }

    /// The priority at which `criterion` is charged, or `None` if the rule base does not declare
    /// it. Per-node criteria of nodes that are built move up by [`BUILD_OFFSET`].
    pub fn criterion_priority(&self, criterion: Criterion, built: bool) -> Option<i64> {
        match self.slots.get(&criterion)? {
            CriterionSlot::Fixed(priority) => Some(*priority),
            CriterionSlot::PerNode(priority) if built => Some(priority + BUILD_OFFSET),
            CriterionSlot::PerNode(priority) => Some(*priority),
        }
    }

    fn declare_criterion(&mut self, name: &str, slot: CriterionSlot) {
        match Criterion::from_str(name) {
            Ok(criterion) => {
                self.slots.insert(criterion, slot);
            }
            Err(_) => tracing::trace!("criterion '{name}' is reported but never charged"),
        }
    }

    pub fn origin_rank(&self, origin: &str) -> i64 {
        self.origin_preference
            .iter()
            .find(|(name, _)| name.as_ref() == origin)
            .map_or(i64::MAX, |(_, weight)| *weight)
    }
}

fn requirement_group<'a>(
    info: &'a mut PackageInfo,
    id: i64,
    fact: &Symbol,
) -> Result<&'a mut RequirementGroup, EngineError> {
    info.requirements
        .iter_mut()
        .find(|g| g.id == id)
        .ok_or_else(|| malformed(fact, format!("unknown requirement group {id}")))
}
