//! Turns the atoms of a model back into concrete specs.
//!
//! Attributes are applied in a fixed order. `hash` comes first so that a reused node is taken
//! as a whole and every later attribute of that node is ignored. `node` creates the remaining
//! nodes, the scalar attributes fill them in, flags are ordered once all nodes are known and
//! `external_spec_selected` comes last because it refers to the finished node.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    str::FromStr,
    sync::Arc,
};

use spackle_config::{ConfigurationError, SiteConfig};
use spackle_types::{
    parse_spec, CompilerFlag, CompilerSpec, DepType, DepTypes, DependencySpec, FlagSource,
    FlagType, PackageRepository, Spec, SpecError, VariantValue, Version, VersionList,
};

use crate::{
    engine::{Model, Symbol},
    error::SolveError,
    setup::SolverProblem,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumString, strum::Display)]
#[strum(serialize_all = "snake_case")]
enum AttributeKind {
    Hash,
    Node,
    Root,
    Namespace,
    Version,
    Deprecated,
    NodePlatform,
    NodeOs,
    NodeTarget,
    NodeCompilerVersion,
    VariantValue,
    DependsOn,
    VirtualOnEdge,
    Build,
    NodeFlag,
    NodeFlagPropagate,
    ExternalSpecSelected,
}

impl AttributeKind {
    fn order(self) -> u8 {
        match self {
            AttributeKind::Hash => 0,
            AttributeKind::Node => 1,
            AttributeKind::NodeFlag | AttributeKind::NodeFlagPropagate => 3,
            AttributeKind::ExternalSpecSelected => 4,
            _ => 2,
        }
    }
}

/// A node of the model. Ordered by package name first so that ties between unrelated nodes
/// are broken alphabetically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct NodeId {
    package: String,
    dup: i64,
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.package, self.dup)
    }
}

#[derive(Debug)]
struct ModelFlag {
    ty: FlagType,
    flag: String,
    source: FlagSource,
}

#[derive(Debug, Default)]
struct NodeBuild {
    spec: Spec,
    reused: Option<Arc<Spec>>,
    variants: BTreeMap<String, Vec<String>>,
    flags: Vec<ModelFlag>,
    propagated: BTreeSet<(FlagType, String)>,
    deprecated: Option<String>,
}

#[derive(Debug, Default)]
struct EdgeBuild {
    deptypes: DepTypes,
    virtuals: Vec<String>,
}

/// The concrete specs of a model by literal index.
#[derive(Debug, Default)]
pub(crate) struct Reconstruction {
    pub roots: BTreeMap<usize, Arc<Spec>>,
    pub unsolved: Vec<usize>,
    pub nodes: usize,
}

fn malformed(atom: &Symbol) -> SolveError {
    SolveError::internal(
        "cannot build specs from the solver model",
        format!("malformed atom {atom}"),
    )
}

fn node_id(symbol: &Symbol) -> Option<NodeId> {
    if !symbol.is("node", 2) {
        return None;
    }
    Some(NodeId {
        dup: symbol.num_arg(0)?,
        package: symbol.str_arg(1)?.to_string(),
    })
}

fn spec_error(err: SpecError) -> SolveError {
    SolveError::internal("cannot assemble a concrete spec", err.to_string())
}

pub(crate) struct SpecBuilder<'a, R: ?Sized> {
    repository: &'a R,
    config: &'a SiteConfig,
    problem: &'a SolverProblem,
    nodes: BTreeMap<NodeId, NodeBuild>,
    edges: BTreeMap<(NodeId, NodeId), EdgeBuild>,
}

impl<'a, R: PackageRepository + ?Sized> SpecBuilder<'a, R> {
    pub fn new(repository: &'a R, config: &'a SiteConfig, problem: &'a SolverProblem) -> Self {
        Self {
            repository,
            config,
            problem,
            nodes: BTreeMap::new(),
            edges: BTreeMap::new(),
        }
    }

    /// Builds the specs of every solved literal. `splice_pool` holds the concrete specs a
    /// configured splice may take its replacement from.
    pub fn build(
        mut self,
        model: &Model,
        splice_pool: &[Arc<Spec>],
    ) -> Result<Reconstruction, SolveError> {
        let span = tracing::debug_span!("build_specs", atoms = model.atoms.len());
        let _enter = span.enter();

        let mut attributes = Vec::new();
        for atom in model.atoms.iter().filter(|a| a.name() == Some("attr")) {
            let Some(name) = atom.str_arg(0) else {
                return Err(malformed(atom));
            };
            match AttributeKind::from_str(name) {
                Ok(kind) => attributes.push((kind, atom)),
                Err(_) => tracing::warn!("ignoring unknown solver attribute '{name}'"),
            }
        }
        attributes.sort_by_key(|(kind, _)| kind.order());

        for (kind, atom) in attributes {
            self.apply(kind, atom)?;
        }

        let order = self.topological_order()?;
        self.finish_variants();
        self.order_flags(&order);
        let built = self.assemble(&order)?;
        self.check_deprecated()?;

        let mut reconstruction = self.roots(model, &built)?;
        reconstruction.nodes = built.len();
        apply_splices(self.config, &mut reconstruction.roots, splice_pool)?;
        Ok(reconstruction)
    }

    fn node_mut(&mut self, id: &NodeId, atom: &Symbol) -> Result<&mut NodeBuild, SolveError> {
        self.nodes.get_mut(id).ok_or_else(|| {
            SolveError::internal(
                "cannot build specs from the solver model",
                format!("{atom} refers to a node that does not exist"),
            )
        })
    }

    fn apply(&mut self, kind: AttributeKind, atom: &Symbol) -> Result<(), SolveError> {
        let args = &atom.args()[1..];
        let id = args.first().and_then(node_id).ok_or_else(|| malformed(atom))?;
        let text = |idx: usize| {
            args.get(idx)
                .and_then(Symbol::as_str)
                .ok_or_else(|| malformed(atom))
        };

        match kind {
            AttributeKind::Hash => {
                let hash = text(1)?;
                let reused = self.problem.reusable.get(hash).ok_or_else(|| {
                    SolveError::internal(
                        "cannot build specs from the solver model",
                        format!("the model reuses an unknown hash {hash}"),
                    )
                })?;
                tracing::trace!("{id} is reused from {hash}");
                self.nodes.insert(
                    id.clone(),
                    NodeBuild {
                        reused: Some(reused.clone()),
                        ..NodeBuild::default()
                    },
                );
                return Ok(());
            }
            AttributeKind::Node => {
                self.nodes.entry(id.clone()).or_insert_with(|| NodeBuild {
                    spec: Spec::named(id.package.as_str()),
                    ..NodeBuild::default()
                });
                return Ok(());
            }
            AttributeKind::DependsOn | AttributeKind::VirtualOnEdge => {
                let child = args.get(1).and_then(node_id).ok_or_else(|| malformed(atom))?;
                if self.node_mut(&id, atom)?.reused.is_some() {
                    return Ok(());
                }
                let value = text(2)?;
                let edge = self.edges.entry((id, child)).or_default();
                if kind == AttributeKind::DependsOn {
                    let deptype = DepType::from_str(value).map_err(|_| malformed(atom))?;
                    edge.deptypes |= DepTypes::from(deptype);
                } else if !edge.virtuals.iter().any(|v| v == value) {
                    edge.virtuals.push(value.to_string());
                }
                return Ok(());
            }
            AttributeKind::Deprecated => {
                let version = text(1)?.to_string();
                self.node_mut(&id, atom)?.deprecated = Some(version);
                return Ok(());
            }
            _ => {}
        }

        let problem = self.problem;
        let node = self.node_mut(&id, atom)?;
        if node.reused.is_some() {
            return Ok(());
        }
        match kind {
            AttributeKind::Namespace => node.spec.namespace = Some(text(1)?.to_string()),
            AttributeKind::Version => {
                let version = Version::from_str(text(1)?).map_err(|_| malformed(atom))?;
                node.spec.versions = VersionList::exact(version);
            }
            AttributeKind::NodePlatform => node.spec.arch.platform = Some(text(1)?.to_string()),
            AttributeKind::NodeOs => node.spec.arch.os = Some(text(1)?.to_string()),
            AttributeKind::NodeTarget => node.spec.arch.target = Some(text(1)?.to_string()),
            AttributeKind::NodeCompilerVersion => {
                let version = Version::from_str(text(2)?).map_err(|_| malformed(atom))?;
                node.spec.compiler = Some(CompilerSpec {
                    name: text(1)?.to_string(),
                    versions: VersionList::exact(version),
                });
            }
            AttributeKind::VariantValue => node
                .variants
                .entry(text(1)?.to_string())
                .or_default()
                .push(text(2)?.to_string()),
            AttributeKind::NodeFlag => {
                let ty = FlagType::from_str(text(1)?).map_err(|_| malformed(atom))?;
                node.flags.push(ModelFlag {
                    ty,
                    flag: text(2)?.to_string(),
                    source: FlagSource::from_tag(text(3)?),
                });
            }
            AttributeKind::NodeFlagPropagate => {
                let ty = FlagType::from_str(text(1)?).map_err(|_| malformed(atom))?;
                node.propagated.insert((ty, text(2)?.to_string()));
            }
            AttributeKind::ExternalSpecSelected => {
                let idx = args.get(1).and_then(Symbol::as_number).ok_or_else(|| malformed(atom))?;
                let external = problem
                    .externals
                    .get(&(id.package.clone(), idx))
                    .ok_or_else(|| malformed(atom))?;
                node.spec.external = Some(external.clone());
            }
            _ => {}
        }
        Ok(())
    }

    /// Parents before children. Nodes that become ready at the same time are taken in name
    /// order.
    fn topological_order(&self) -> Result<Vec<NodeId>, SolveError> {
        let mut parents: BTreeMap<&NodeId, usize> = self.nodes.keys().map(|id| (id, 0)).collect();
        let mut children: BTreeMap<&NodeId, Vec<&NodeId>> = BTreeMap::new();
        for (parent, child) in self.edges.keys() {
            *parents.entry(child).or_default() += 1;
            children.entry(parent).or_default().push(child);
        }
        let mut ready: BTreeSet<&NodeId> = parents
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop_first() {
            order.push(id.clone());
            for child in children.get(id).into_iter().flatten() {
                let count = parents.entry(child).or_default();
                *count -= 1;
                if *count == 0 {
                    ready.insert(child);
                }
            }
        }
        if order.len() != parents.len() {
            let stuck = parents
                .iter()
                .filter(|(_, count)| **count > 0)
                .map(|(id, _)| id.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(SolveError::internal(
                "the solver produced a dependency cycle",
                format!("involving {stuck}"),
            ));
        }
        Ok(order)
    }

    fn finish_variants(&mut self) {
        for (id, node) in &mut self.nodes {
            if node.reused.is_some() {
                continue;
            }
            let package = self.repository.get(None, &id.package).ok();
            for (name, values) in std::mem::take(&mut node.variants) {
                let definition = package.and_then(|p| p.variant_definitions(&name).last());
                let value = match definition {
                    Some(definition) => definition.value_from_strings(&values),
                    None => VariantValue::from_assignment(&values.join(",")),
                };
                node.spec.variants.insert(name, value);
            }
        }
    }

    /// Puts the flags of every node in their final order: compiler flags first, then flags
    /// from dependents and requirements with the topologically earlier source first, then the
    /// flags written on the command line.
    fn order_flags(&mut self, order: &[NodeId]) {
        let mut rank: BTreeMap<&str, usize> = BTreeMap::new();
        for (idx, id) in order.iter().enumerate() {
            rank.entry(id.package.as_str()).or_insert(idx);
        }

        let mut sorted: Vec<(NodeId, Vec<(FlagType, Vec<CompilerFlag>)>)> = Vec::new();
        for (id, node) in &self.nodes {
            if node.reused.is_some() || node.flags.is_empty() {
                continue;
            }
            let mut by_type: BTreeMap<FlagType, Vec<(FlagKey, &ModelFlag)>> = BTreeMap::new();
            for flag in &node.flags {
                let key = self.flag_key(id, node, flag, &rank);
                by_type.entry(flag.ty).or_default().push((key, flag));
            }
            let flags = by_type
                .into_iter()
                .map(|(ty, mut flags)| {
                    flags.sort_by(|a, b| a.0.cmp(&b.0));
                    let flags = flags
                        .into_iter()
                        .map(|(_, flag)| CompilerFlag {
                            flag: flag.flag.clone(),
                            propagate: node.propagated.contains(&(ty, flag.flag.clone())),
                            source: flag.source.clone(),
                        })
                        .collect();
                    (ty, flags)
                })
                .collect();
            sorted.push((id.clone(), flags));
        }

        for (id, flags) in sorted {
            if let Some(node) = self.nodes.get_mut(&id) {
                for (ty, flags) in flags {
                    node.spec.compiler_flags.set(ty, flags);
                }
            }
        }
    }

    fn flag_key(
        &self,
        id: &NodeId,
        node: &NodeBuild,
        flag: &ModelFlag,
        rank: &BTreeMap<&str, usize>,
    ) -> FlagKey {
        let position = |flags: &[CompilerFlag]| flags.iter().position(|f| f.flag == flag.flag);
        match &flag.source {
            FlagSource::Compiler => FlagKey {
                group: 0,
                rank: 0,
                source: String::new(),
                position: self.compiler_flag_position(node, flag),
                flag: flag.flag.clone(),
            },
            FlagSource::Dependent(parent) => FlagKey {
                group: 1,
                rank: rank.get(parent.as_str()).copied().unwrap_or(usize::MAX),
                source: parent.clone(),
                position: self
                    .repository
                    .get(None, parent)
                    .ok()
                    .and_then(|p| {
                        p.dependencies
                            .iter()
                            .filter(|d| d.spec.name.as_deref() == Some(id.package.as_str()))
                            .find_map(|d| position(d.spec.compiler_flags.get(flag.ty)))
                    }),
                flag: flag.flag.clone(),
            },
            FlagSource::Requirement => FlagKey {
                group: 1,
                rank: rank.get(id.package.as_str()).copied().unwrap_or(usize::MAX),
                source: FlagSource::Requirement.tag(),
                position: None,
                flag: flag.flag.clone(),
            },
            FlagSource::Literal => FlagKey {
                group: 2,
                rank: 0,
                source: String::new(),
                position: self
                    .problem
                    .literals
                    .iter()
                    .flat_map(|literal| literal.traverse())
                    .filter(|n| n.name.as_deref() == Some(id.package.as_str()))
                    .find_map(|n| position(n.compiler_flags.get(flag.ty))),
                flag: flag.flag.clone(),
            },
        }
    }

    fn compiler_flag_position(&self, node: &NodeBuild, flag: &ModelFlag) -> Option<usize> {
        let compiler = node.spec.compiler.as_ref()?;
        let version = compiler.versions.concrete()?;
        self.config.compilers.iter().find_map(|entry| {
            let (name, entry_version) = entry.name_and_version().ok()?;
            if name != compiler.name || &entry_version != version {
                return None;
            }
            let flags = entry.parsed_flags().ok()?;
            flags
                .iter()
                .filter(|(ty, _)| *ty == flag.ty)
                .find_map(|(_, values)| values.iter().position(|v| *v == flag.flag))
        })
    }

    /// Builds the specs bottom-up so that every dependency is final before its dependents.
    fn assemble(&mut self, order: &[NodeId]) -> Result<BTreeMap<NodeId, Arc<Spec>>, SolveError> {
        let mut built: BTreeMap<NodeId, Arc<Spec>> = BTreeMap::new();
        for id in order.iter().rev() {
            let Some(node) = self.nodes.get_mut(id) else {
                continue;
            };
            if let Some(reused) = &node.reused {
                built.insert(id.clone(), reused.clone());
                continue;
            }
            let mut spec = std::mem::take(&mut node.spec);
            for ((_, child), edge) in self.edges.iter().filter(|((parent, _), _)| parent == id) {
                let Some(dependency) = built.get(child) else {
                    return Err(SolveError::internal(
                        "cannot assemble a concrete spec",
                        format!("{child} was not built before its dependent {id}"),
                    ));
                };
                spec.add_dependency(DependencySpec {
                    spec: dependency.clone(),
                    deptypes: edge.deptypes,
                    virtuals: edge.virtuals.clone(),
                })
                .map_err(spec_error)?;
            }
            spec.finalize().map_err(spec_error)?;
            built.insert(id.clone(), Arc::new(spec));
        }
        tracing::debug!("assembled {} concrete nodes", built.len());
        Ok(built)
    }

    fn check_deprecated(&self) -> Result<(), SolveError> {
        let deprecated: Vec<String> = self
            .nodes
            .iter()
            .filter_map(|(id, node)| {
                let version = node.deprecated.as_ref()?;
                Some(format!("{}@{version}", id.package))
            })
            .collect();
        for spec in &deprecated {
            tracing::warn!("using deprecated version {spec}");
        }
        if deprecated.is_empty() || self.config.concretizer.allow_deprecated() {
            return Ok(());
        }
        Err(SolveError::input(
            "cannot use deprecated versions",
            format!(
                "{} are deprecated; set concretizer.deprecated = true to allow them",
                deprecated.join(", ")
            ),
        ))
    }

    fn roots(
        &self,
        model: &Model,
        built: &BTreeMap<NodeId, Arc<Spec>>,
    ) -> Result<Reconstruction, SolveError> {
        let mut reconstruction = Reconstruction::default();
        let mut root_nodes: BTreeMap<i64, NodeId> = BTreeMap::new();
        for atom in model.atoms_named("literal_root", 2) {
            let idx = atom.num_arg(0).ok_or_else(|| malformed(atom))?;
            let id = atom.args().get(1).and_then(node_id).ok_or_else(|| malformed(atom))?;
            root_nodes.insert(idx, id);
        }
        let solved: BTreeSet<i64> = model
            .atoms_named("solved_literal", 1)
            .filter_map(|atom| atom.num_arg(0))
            .collect();

        for (idx, literal) in self.problem.literals.iter().enumerate() {
            let key = idx as i64;
            if !solved.contains(&key) {
                reconstruction.unsolved.push(idx);
                continue;
            }
            let root = root_nodes.get(&key).and_then(|id| built.get(id).map(|s| (id, s)));
            let Some((id, spec)) = root else {
                return Err(SolveError::internal(
                    format!("'{literal}' was solved but has no root node"),
                    "the model does not name a node for the request",
                ));
            };
            let name = literal.name_or_empty();
            if !self.problem.graph.virtuals.contains(name) && id.package != name {
                return Err(SolveError::internal(
                    format!("'{literal}' was solved as '{}'", id.package),
                    "the root node does not match the request",
                ));
            }
            reconstruction.roots.insert(idx, spec.clone());
        }
        Ok(reconstruction)
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct FlagKey {
    group: u8,
    rank: usize,
    source: String,
    position: Option<usize>,
    flag: String,
}

/// Picks the concrete spec that replaces splice targets: the one with the smallest hash among
/// those that satisfy the configured replacement.
fn splice_replacement(
    idx: usize,
    text: &str,
    pool: &[Arc<Spec>],
) -> Result<Arc<Spec>, ConfigurationError> {
    let path = format!("concretizer.splice.explicit[{idx}].replacement");
    let wanted = parse_spec(text).map_err(|e| ConfigurationError::new(&path, e.to_string()))?;
    let mut candidates: Vec<&Arc<Spec>> = pool
        .iter()
        .flat_map(|spec| spec.traverse_edges().into_iter().map(|(_, edge)| &edge.spec))
        .chain(pool.iter())
        .filter(|spec| spec.satisfies(&wanted))
        .collect();
    candidates.sort_by(|a, b| a.dag_hash().cmp(&b.dag_hash()));
    candidates
        .first()
        .map(|spec| Arc::clone(spec))
        .ok_or_else(|| ConfigurationError::new(path, format!("no concrete spec matches '{text}'")))
}

fn apply_splices(
    config: &SiteConfig,
    roots: &mut BTreeMap<usize, Arc<Spec>>,
    pool: &[Arc<Spec>],
) -> Result<(), SolveError> {
    for (idx, splice) in config.concretizer.splice.explicit.iter().enumerate() {
        let target = parse_spec(&splice.target).map_err(|e| {
            ConfigurationError::new(
                format!("concretizer.splice.explicit[{idx}].target"),
                e.to_string(),
            )
        })?;
        if !roots
            .values()
            .any(|root| root.traverse().iter().skip(1).any(|n| n.satisfies(&target)))
        {
            continue;
        }
        let replacement = splice_replacement(idx, &splice.replacement, pool)?;
        tracing::debug!(
            "splicing {} in place of '{target}'",
            replacement.format_node()
        );
        let mut memo = HashMap::new();
        for root in roots.values_mut() {
            *root = splice_node(root, &target, &replacement, splice.transitive, &mut memo)
                .map_err(spec_error)?;
        }
    }
    Ok(())
}

/// Rewrites `node` so that every dependency matching `target` is `replacement`. A transitive
/// splice also swaps every dependency that the replacement shares by name. Rewritten nodes
/// keep the spec they were built as in their build spec.
fn splice_node(
    node: &Arc<Spec>,
    target: &Spec,
    replacement: &Arc<Spec>,
    transitive: bool,
    memo: &mut HashMap<*const Spec, Arc<Spec>>,
) -> Result<Arc<Spec>, SpecError> {
    if let Some(done) = memo.get(&Arc::as_ptr(node)) {
        return Ok(done.clone());
    }
    let mut changed = false;
    let mut dependencies = Vec::with_capacity(node.dependencies().len());
    for edge in node.dependencies() {
        let shared = if transitive {
            replacement
                .dependency(edge.spec.name_or_empty())
                .map(|d| d.spec.clone())
        } else {
            None
        };
        let child = if edge.spec.satisfies(target) {
            replacement.clone()
        } else if let Some(shared) = shared {
            shared
        } else {
            splice_node(&edge.spec, target, replacement, transitive, memo)?
        };
        changed |= child.dag_hash() != edge.spec.dag_hash();
        dependencies.push(DependencySpec {
            spec: child,
            deptypes: edge.deptypes,
            virtuals: edge.virtuals.clone(),
        });
    }

    let result = if changed {
        let mut spec = node.to_abstract_node();
        for dependency in dependencies {
            spec.add_dependency(dependency)?;
        }
        spec.set_build_spec(node.build_spec().cloned().unwrap_or_else(|| node.clone()))?;
        spec.finalize()?;
        Arc::new(spec)
    } else {
        node.clone()
    };
    memo.insert(Arc::as_ptr(node), result.clone());
    Ok(result)
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, str::FromStr, sync::Arc};

    use assert_matches::assert_matches;
    use spackle_config::{config::concretizer::ExplicitSplice, SiteConfig};
    use spackle_types::{
        DepTypes, DependencyDeclaration, FlagSource, FlagType, InMemoryRepository,
        PackageDefinition, Spec, VariantDefinition, VariantValue,
    };

    use super::{apply_splices, SpecBuilder};
    use crate::{
        counter::PossibleGraph,
        engine::{Model, Symbol},
        error::SolveError,
        setup::SolverProblem,
        sym,
    };

    fn node(package: &str) -> Symbol {
        sym!("node", 0i64, package)
    }

    fn attr(name: &str, args: Vec<Symbol>) -> Symbol {
        let mut all = vec![Symbol::from(name)];
        all.extend(args);
        Symbol::function("attr", all)
    }

    fn model(atoms: Vec<Symbol>) -> Model {
        Model {
            atoms,
            cost: Vec::new(),
            optimal: true,
            models_examined: 1,
        }
    }

    fn problem(literals: &[&str]) -> SolverProblem {
        SolverProblem {
            text: String::new(),
            facts: 0,
            literals: literals.iter().map(|s| Spec::from_str(s).unwrap()).collect(),
            graph: PossibleGraph::default(),
            reusable: BTreeMap::new(),
            externals: BTreeMap::new(),
            has_libc: false,
        }
    }

    fn repository() -> InMemoryRepository {
        let mut app = PackageDefinition::new("app");
        app.variants = vec![VariantDefinition::boolean("shared", true)];
        app.dependencies = vec![DependencyDeclaration {
            spec: Spec::from_str("zlib cflags='-O2 -g'").unwrap(),
            when: Spec::default(),
            deptypes: DepTypes::BUILD_LINK,
        }];
        [app, PackageDefinition::new("zlib")].into_iter().collect()
    }

    fn basic_atoms() -> Vec<Symbol> {
        vec![
            sym!("literal_root", 0i64, node("app")),
            sym!("solved_literal", 0i64),
            attr("node", vec![node("app")]),
            attr("node", vec![node("zlib")]),
            attr("version", vec![node("app"), Symbol::from("1.0")]),
            attr("version", vec![node("zlib"), Symbol::from("1.3")]),
            attr(
                "variant_value",
                vec![node("app"), Symbol::from("shared"), Symbol::from("False")],
            ),
            attr(
                "depends_on",
                vec![node("app"), node("zlib"), Symbol::from("build")],
            ),
            attr(
                "depends_on",
                vec![node("app"), node("zlib"), Symbol::from("link")],
            ),
        ]
    }

    #[test]
    fn test_builds_roots_with_edges() {
        let repo = repository();
        let config = SiteConfig::default();
        let problem = problem(&["app"]);
        let result = SpecBuilder::new(&repo, &config, &problem)
            .build(&model(basic_atoms()), &[])
            .unwrap();
        assert_eq!(result.nodes, 2);
        assert!(result.unsolved.is_empty());
        let app = &result.roots[&0];
        assert!(app.is_concrete());
        assert_eq!(app.variants.get("shared"), Some(&VariantValue::Bool(false)));
        let zlib = app.dependency("zlib").unwrap();
        assert_eq!(zlib.deptypes, DepTypes::BUILD_LINK);
        assert_eq!(zlib.spec.format_node(), "zlib@1.3");
    }

    #[test]
    fn test_unknown_attributes_are_skipped() {
        let repo = repository();
        let config = SiteConfig::default();
        let problem = problem(&["app"]);
        let mut atoms = basic_atoms();
        atoms.push(attr("mystery", vec![node("app")]));
        let result = SpecBuilder::new(&repo, &config, &problem)
            .build(&model(atoms), &[])
            .unwrap();
        assert_eq!(result.roots.len(), 1);
    }

    #[test]
    fn test_flag_order_follows_sources() {
        let repo = repository();
        let config = SiteConfig::default();
        let problem = problem(&["app ^zlib cflags=-Wall"]);
        let mut atoms = basic_atoms();
        let flag = |value: &str, source: FlagSource| {
            attr(
                "node_flag",
                vec![
                    node("zlib"),
                    Symbol::from("cflags"),
                    Symbol::from(value),
                    Symbol::from(source.tag()),
                ],
            )
        };
        atoms.push(flag("-Wall", FlagSource::Literal));
        atoms.push(flag("-g", FlagSource::Dependent("app".to_string())));
        atoms.push(flag("-fPIC", FlagSource::Requirement));
        atoms.push(flag("-O2", FlagSource::Dependent("app".to_string())));
        let result = SpecBuilder::new(&repo, &config, &problem)
            .build(&model(atoms), &[])
            .unwrap();
        let zlib = &result.roots[&0].dependency("zlib").unwrap().spec;
        let flags: Vec<&str> = zlib
            .compiler_flags
            .get(FlagType::Cflags)
            .iter()
            .map(|f| f.flag.as_str())
            .collect();
        assert_eq!(flags, vec!["-O2", "-g", "-fPIC", "-Wall"]);
    }

    #[test]
    fn test_reused_nodes_ignore_later_attributes() {
        let repo = repository();
        let config = SiteConfig::default();
        let mut stored = Spec::from_str("zlib@=1.2").unwrap();
        stored.finalize().unwrap();
        let stored = Arc::new(stored);
        let hash = stored.dag_hash().unwrap().to_string();

        let mut problem = problem(&["app"]);
        problem.reusable.insert(hash.clone(), stored.clone());
        let mut atoms = basic_atoms();
        atoms.push(attr("hash", vec![node("zlib"), Symbol::from(hash.as_str())]));
        let result = SpecBuilder::new(&repo, &config, &problem)
            .build(&model(atoms), &[])
            .unwrap();
        let zlib = &result.roots[&0].dependency("zlib").unwrap().spec;
        assert!(Arc::ptr_eq(zlib, &stored));
    }

    #[test]
    fn test_model_errors_are_internal() {
        let repo = repository();
        let config = SiteConfig::default();

        let problem = problem(&["app"]);
        let mut cyclic = basic_atoms();
        cyclic.push(attr(
            "depends_on",
            vec![node("zlib"), node("app"), Symbol::from("link")],
        ));
        assert_matches!(
            SpecBuilder::new(&repo, &config, &problem).build(&model(cyclic), &[]),
            Err(SolveError::Internal(_))
        );

        let mut wrong_root = basic_atoms();
        wrong_root[0] = sym!("literal_root", 0i64, node("zlib"));
        assert_matches!(
            SpecBuilder::new(&repo, &config, &problem).build(&model(wrong_root), &[]),
            Err(SolveError::Internal(_))
        );
    }

    #[test]
    fn test_deprecated_versions_need_permission() {
        let repo = repository();
        let problem = problem(&["app"]);
        let mut atoms = basic_atoms();
        atoms.push(attr("deprecated", vec![node("zlib"), Symbol::from("1.3")]));

        let config = SiteConfig::default();
        assert_matches!(
            SpecBuilder::new(&repo, &config, &problem).build(&model(atoms.clone()), &[]),
            Err(SolveError::Input(_))
        );

        let mut config = SiteConfig::default();
        config.concretizer.deprecated = Some(true);
        let result = SpecBuilder::new(&repo, &config, &problem)
            .build(&model(atoms), &[])
            .unwrap();
        assert_eq!(result.roots.len(), 1);
    }

    #[test]
    fn test_splice_keeps_build_spec() {
        let repo = repository();
        let problem = problem(&["app"]);
        let built = SpecBuilder::new(&repo, &SiteConfig::default(), &problem)
            .build(&model(basic_atoms()), &[])
            .unwrap();
        let original = built.roots[&0].clone();

        let mut replacement = Spec::from_str("zlib@=1.3.1").unwrap();
        replacement.finalize().unwrap();
        let replacement = Arc::new(replacement);

        let mut config = SiteConfig::default();
        config.concretizer.splice.explicit = vec![ExplicitSplice {
            target: "zlib@1.3".to_string(),
            replacement: "zlib@1.3.1".to_string(),
            transitive: false,
        }];
        let mut roots = built.roots;
        apply_splices(&config, &mut roots, &[replacement.clone()]).unwrap();

        let spliced = &roots[&0];
        assert_ne!(spliced.dag_hash(), original.dag_hash());
        assert!(Arc::ptr_eq(
            &spliced.dependency("zlib").unwrap().spec,
            &replacement
        ));
        assert_eq!(
            spliced.build_spec().and_then(|s| s.dag_hash()),
            original.dag_hash()
        );
    }
}
