//! Depth first branch and bound over partial assignments.
//!
//! Every node of the dependency graph is decided in a fixed sequence of steps: requirement
//! alternatives, origin (reuse, external or build), version, operating system, target, compiler,
//! variants and finally its dependencies. A step that admits several values branches the search
//! by cloning the state. Anything that would make a solution unusable is recorded as a
//! high-priority error instead of failing the branch, so that the best model doubles as an
//! explanation when no error-free model exists. Only structural problems, like cycles or two
//! nodes of the same package in one configuration, fail a branch outright.

use std::collections::{BTreeMap, BTreeSet};

use spackle_types::DepTypes;

use super::{
    problem::{
        clause_subject, CompilerInfo, Conflict, Criterion, Name, PackageInfo, Policy, Problem,
        RequirementGroup, RequirementKind, StepKind, VersionInfo,
    },
    state::{
        node_satisfies, Cause, Cost, Deferred, EdgeRequest, HardFail, Imposition, Node, NodeFlag,
        NodeId, Origin, SetKey, State, Step, Task,
    },
};
use crate::engine::Symbol;

/// Upper bound on expanded states when no model has been found yet.
const MAX_EXPANSIONS: u64 = 2_000_000;

#[derive(Debug, Clone, Copy)]
enum Placement {
    Existing(NodeId),
    New,
}

#[derive(Debug, Clone)]
enum Choice {
    Continue(NodeId, Step),
    Root {
        literal: usize,
        package: Name,
        placement: Placement,
    },
    DropLiteral,
    Attach {
        request: Box<EdgeRequest>,
        package: Name,
        placement: Placement,
    },
    Requirement {
        node: NodeId,
        index: usize,
        group: i64,
        condition: i64,
        weight: i64,
    },
    Origin {
        node: NodeId,
        origin: Origin,
        not_buildable: bool,
    },
    Version {
        node: NodeId,
        version: Option<Name>,
        weight: i64,
    },
    Os {
        node: NodeId,
        os: Option<Name>,
        weight: i64,
    },
    Target {
        node: NodeId,
        target: Option<Name>,
        weight: i64,
    },
    Compiler {
        node: NodeId,
        compiler: Option<(Name, Name)>,
        weight: i64,
    },
    Variant {
        node: NodeId,
        index: usize,
        name: Name,
        definition: i64,
        values: BTreeSet<Name>,
        cost: i64,
    },
    Finalize(NodeId),
}

enum Advance {
    Branch(Vec<State>),
    Leaf,
}

/// The outcome of a search.
pub(crate) struct SearchResult {
    pub best: Option<State>,
    pub models: u64,
    pub optimal: bool,
    pub expansions: u64,
}

pub(crate) struct Search<'p> {
    problem: &'p Problem,
    active: BTreeSet<i64>,
    model_limit: Option<u64>,
}

fn imposed_values<'a>(node: &'a Node, name: &'a str, arity: usize) -> impl Iterator<Item = &'a Symbol> + 'a {
    node.impositions
        .iter()
        .map(|imp| &imp.clause)
        .filter(move |clause| {
            clause.is(name, arity) && clause.str_arg(0) == Some(node.package.as_ref())
        })
}

/// A short human readable form of a clause, used in error messages.
fn describe_clause(clause: &Symbol) -> String {
    let arg = |idx: usize| clause.str_arg(idx).unwrap_or_default();
    let subject = arg(0);
    match clause.signature() {
        Some(("node_version_satisfies", 2)) => format!("{subject}@{}", arg(1)),
        Some(("variant_value", 3)) => match arg(2) {
            "True" => format!("{subject}+{}", arg(1)),
            "False" => format!("{subject}~{}", arg(1)),
            value => format!("{subject} {}={value}", arg(1)),
        },
        Some(("node_compiler", 2)) => format!("{subject}%{}", arg(1)),
        Some(("node_compiler_version_satisfies", 3)) => {
            format!("{subject}%{}@{}", arg(1), arg(2))
        }
        Some(("node_platform", 2)) => format!("{subject} platform={}", arg(1)),
        Some(("node_os", 2)) => format!("{subject} os={}", arg(1)),
        Some(("node_target", 2)) => format!("{subject} target={}", arg(1)),
        Some(("node_flag" | "node_flag_propagate", _)) => {
            format!("{subject} {}=\"{}\"", arg(1), arg(2))
        }
        Some(("namespace", 2)) => format!("{}.{subject}", arg(1)),
        Some(("hash", 2)) => format!("{subject}/{}", arg(1)),
        _ => subject.to_string(),
    }
}

/// A short human readable form of a decided node.
fn describe_node(node: &Node) -> String {
    let mut text = node.package.to_string();
    if let Some(version) = &node.version {
        text.push('@');
        text.push_str(version);
    }
    for (name, values) in &node.variants {
        match values.iter().map(|v| v.as_ref()).collect::<Vec<&str>>().as_slice() {
            ["True"] => text.push_str(&format!("+{name}")),
            ["False"] => text.push_str(&format!("~{name}")),
            values => text.push_str(&format!(" {name}={}", values.join(","))),
        }
    }
    text
}

impl<'p> Search<'p> {
    pub fn new(problem: &'p Problem, active: BTreeSet<i64>, model_limit: Option<u64>) -> Self {
        Self {
            problem,
            active,
            model_limit,
        }
    }

    fn package(&self, name: &str) -> Option<&'p PackageInfo> {
        self.problem.packages.get(name)
    }

    /// The decision that follows `done` for a node in the program's step order. Versions and
    /// compilers are only decided for nodes that are built.
    fn next_step(&self, state: &State, id: NodeId, done: StepKind) -> Step {
        let built = state.nodes[id].is_built();
        let order = &self.problem.step_order;
        let start = order.iter().position(|step| *step == done).map_or(order.len(), |p| p + 1);
        for step in &order[start..] {
            match step {
                StepKind::Version | StepKind::Compiler if !built => continue,
                StepKind::Requirement => return Step::Requirement(0),
                StepKind::Origin => return Step::Origin,
                StepKind::Version => return Step::Version,
                StepKind::Os => return Step::Os,
                StepKind::Target => return Step::Target,
                StepKind::Compiler => return Step::Compiler,
                StepKind::Variant => return Step::Variant(0),
                StepKind::Dependencies => return Step::Finalize,
            }
        }
        Step::Finalize
    }

    fn charge(&self, state: &mut State, criterion: Criterion, value: i64) {
        if let Some(priority) = self.problem.criterion_priority(criterion, false) {
            state.cost.add(priority, value);
        }
    }

    /// Charges a per-node criterion, in the build band if the node is built.
    fn charge_node(&self, state: &mut State, id: NodeId, criterion: Criterion, value: i64) {
        let built = state.nodes[id].is_built();
        if let Some(priority) = self.problem.criterion_priority(criterion, built) {
            state.cost.add(priority, value);
        }
    }

    pub fn run(&self) -> SearchResult {
        let mut initial = State::default();
        for (idx, literal) in self.problem.literals.iter().enumerate() {
            if self.active.contains(&literal.index) {
                initial.tasks.push_back(Task::Literal(idx));
            }
        }

        let mut stack = vec![initial];
        let mut best: Option<State> = None;
        let mut models = 0;
        let mut expansions = 0;
        let mut optimal = true;
        while let Some(mut state) = stack.pop() {
            if self.model_limit.is_some_and(|limit| models >= limit) {
                optimal = false;
                break;
            }
            if best.is_none() && expansions >= MAX_EXPANSIONS {
                optimal = false;
                break;
            }
            expansions += 1;
            let bound = best.as_ref().map(|b| &b.cost);
            match self.advance(&mut state, bound) {
                Err(fail) => tracing::trace!("branch failed: {}", fail.0),
                Ok(Advance::Branch(children)) => stack.extend(children.into_iter().rev()),
                Ok(Advance::Leaf) => {
                    models += 1;
                    if best.as_ref().is_none_or(|b| state.cost < b.cost) {
                        tracing::debug!("found a model with cost {:?}", state.cost);
                        best = Some(state);
                    }
                }
            }
        }
        SearchResult {
            best,
            models,
            optimal,
            expansions,
        }
    }

    fn advance(&self, state: &mut State, bound: Option<&Cost>) -> Result<Advance, HardFail> {
        loop {
            while let Some(task) = state.tasks.pop_front() {
                if bound.is_some_and(|b| state.cost >= *b) {
                    return Err(HardFail::new("bounded"));
                }
                let mut choices = self.expand(state, task)?;
                if choices.len() == 1 {
                    if let Some(choice) = choices.pop() {
                        self.apply(state, choice)?;
                    }
                    continue;
                }
                if choices.is_empty() {
                    return Err(HardFail::new("no alternatives left"));
                }
                let children = choices
                    .into_iter()
                    .filter_map(|choice| {
                        let mut child = state.clone();
                        match self.apply(&mut child, choice) {
                            Ok(()) => Some(child),
                            Err(fail) => {
                                tracing::trace!("choice failed: {}", fail.0);
                                None
                            }
                        }
                    })
                    .collect();
                return Ok(Advance::Branch(children));
            }
            if self.fire_nonlocal_dependencies(state) {
                continue;
            }
            if bound.is_some_and(|b| state.cost >= *b) {
                return Err(HardFail::new("bounded"));
            }
            self.final_checks(state);
            return Ok(Advance::Leaf);
        }
    }

    fn expand(&self, state: &State, task: Task) -> Result<Vec<Choice>, HardFail> {
        match task {
            Task::Literal(idx) => self.expand_literal(state, idx),
            Task::Edge(request) => self.expand_edge(state, request),
            Task::Decide(node, step) => Ok(match step {
                Step::Requirement(index) => self.expand_requirement(state, node, index),
                Step::Origin => self.expand_origin(state, node),
                Step::Version => self.expand_version(state, node),
                Step::Os => self.expand_os(state, node),
                Step::Target => self.expand_target(state, node),
                Step::Compiler => self.expand_compiler(state, node),
                Step::Variant(index) => self.expand_variant(state, node, index),
                Step::Finalize => vec![Choice::Finalize(node)],
            }),
        }
    }

    fn apply(&self, state: &mut State, choice: Choice) -> Result<(), HardFail> {
        match choice {
            Choice::Continue(node, step) => {
                state.tasks.push_front(Task::Decide(node, step));
            }
            Choice::DropLiteral => self.charge(state, Criterion::UnsolvedLiterals, 1),
            Choice::Root {
                literal,
                package,
                placement,
            } => self.attach_root(state, literal, package, placement)?,
            Choice::Attach {
                request,
                package,
                placement,
            } => self.attach_edge(state, *request, package, placement)?,
            Choice::Requirement {
                node,
                index,
                group,
                condition,
                weight,
            } => {
                self.charge(state, Criterion::RequirementWeight, weight);
                state.nodes[node].chosen_requirements.insert(group, condition);
                let effect = self
                    .problem
                    .condition(condition)
                    .map(|c| c.effect.clone())
                    .unwrap_or_default();
                let own = state.nodes[node].package.clone();
                self.impose_effect(state, node, &own, &effect, Some(Cause { condition, node }))?;
                state
                    .tasks
                    .push_front(Task::Decide(node, Step::Requirement(index + 1)));
            }
            Choice::Origin {
                node,
                origin,
                not_buildable,
            } => self.apply_origin(state, node, origin, not_buildable)?,
            Choice::Version {
                node,
                version,
                weight,
            } => {
                let deprecated = version.as_ref().is_some_and(|v| self.is_deprecated(state, node, v));
                state.nodes[node].version = version;
                self.charge_node(state, node, Criterion::VersionBadness, weight);
                if deprecated {
                    self.charge(state, Criterion::DeprecatedVersions, 1);
                }
                let next = self.next_step(state, node, StepKind::Version);
                state.tasks.push_front(Task::Decide(node, next));
            }
            Choice::Os { node, os, weight } => {
                state.nodes[node].os = os;
                self.charge_node(state, node, Criterion::OsWeight, weight);
                let next = self.next_step(state, node, StepKind::Os);
                state.tasks.push_front(Task::Decide(node, next));
            }
            Choice::Target {
                node,
                target,
                weight,
            } => {
                state.nodes[node].target = target;
                self.charge_node(state, node, Criterion::TargetWeight, weight);
                let next = self.next_step(state, node, StepKind::Target);
                state.tasks.push_front(Task::Decide(node, next));
            }
            Choice::Compiler {
                node,
                compiler,
                weight,
            } => {
                state.nodes[node].compiler = compiler;
                self.charge_node(state, node, Criterion::CompilerWeight, weight);
                let next = self.next_step(state, node, StepKind::Compiler);
                state.tasks.push_front(Task::Decide(node, next));
            }
            Choice::Variant {
                node,
                index,
                name,
                definition,
                values,
                cost,
            } => {
                let n = &mut state.nodes[node];
                n.active_variants.insert(name.clone(), definition);
                n.variants.insert(name, values);
                self.charge_node(state, node, Criterion::NonDefaultVariants, cost);
                state
                    .tasks
                    .push_front(Task::Decide(node, Step::Variant(index + 1)));
            }
            Choice::Finalize(node) => self.finalize(state, node)?,
        }
        Ok(())
    }

    // ---------------------------------------------------------------------------------------
    // Placing nodes
    // ---------------------------------------------------------------------------------------

    /// The nodes of `package` that may satisfy a dependency in the given sets.
    fn placements(&self, state: &State, package: &str, sets: &BTreeSet<SetKey>) -> Result<Vec<Placement>, HardFail> {
        if let Some(id) = state.member_of(package, sets)? {
            return Ok(vec![Placement::Existing(id)]);
        }
        let existing: Vec<NodeId> = state
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.package.as_ref() == package)
            .map(|(id, _)| id)
            .collect();
        let max_dupes = self.package(package).map_or(1, |p| p.max_dupes);
        let mut placements: Vec<Placement> =
            existing.iter().map(|&id| Placement::Existing(id)).collect();
        if existing.len() < max_dupes {
            placements.push(Placement::New);
        }
        Ok(placements)
    }

    fn provider_placements(&self, state: &State, virtual_name: &str, sets: &BTreeSet<SetKey>) -> Result<Vec<(Name, Placement)>, HardFail> {
        if let Some(id) = state.provider_in(virtual_name, sets)? {
            return Ok(vec![(state.nodes[id].package.clone(), Placement::Existing(id))]);
        }
        let mut placements = Vec::new();
        for (provider, _) in self.problem.providers.get(virtual_name).into_iter().flatten() {
            for placement in self.placements(state, provider, sets)? {
                placements.push((provider.clone(), placement));
            }
        }
        Ok(placements)
    }

    fn place(&self, state: &mut State, package: Name, placement: Placement) -> NodeId {
        match placement {
            Placement::Existing(id) => id,
            Placement::New => {
                let id = state.new_node(package);
                if state.nodes[id].dup > 0 {
                    self.charge(state, Criterion::DuplicateNodes, 1);
                }
                id
            }
        }
    }

    fn expand_literal(&self, state: &State, idx: usize) -> Result<Vec<Choice>, HardFail> {
        let literal = &self.problem.literals[idx];
        let roots = BTreeSet::from([SetKey::Root]);
        let mut choices: Vec<Choice> = if literal.is_virtual {
            self.provider_placements(state, &literal.package, &roots)?
                .into_iter()
                .map(|(package, placement)| Choice::Root {
                    literal: idx,
                    package,
                    placement,
                })
                .collect()
        } else {
            self.placements(state, &literal.package, &roots)?
                .into_iter()
                .map(|placement| Choice::Root {
                    literal: idx,
                    package: literal.package.clone(),
                    placement,
                })
                .collect()
        };
        if self.problem.optional_literals {
            choices.push(Choice::DropLiteral);
        }
        Ok(choices)
    }

    fn attach_root(&self, state: &mut State, idx: usize, package: Name, placement: Placement) -> Result<(), HardFail> {
        let literal = &self.problem.literals[idx];
        let id = self.place(state, package, placement);
        state.nodes[id].root = true;
        let cause = Cause {
            condition: literal.condition,
            node: id,
        };
        if literal.is_virtual {
            state.add_provider(id, &literal.package, Some(cause))?;
        }
        state.join_set(id, &SetKey::Root)?;
        state.literal_roots.insert(literal.index, id);
        state.holds.insert((literal.condition, id));
        let effect = self
            .problem
            .condition(literal.condition)
            .map(|c| c.effect.clone())
            .unwrap_or_default();
        self.impose_effect(state, id, &literal.package, &effect, Some(cause))
    }

    fn edge_sets(state: &State, parent: NodeId, types: DepTypes) -> BTreeSet<SetKey> {
        if types.intersects(DepTypes::LINK_RUN) {
            state.nodes[parent].sets.clone()
        } else {
            BTreeSet::from([SetKey::Build(parent)])
        }
    }

    fn expand_edge(&self, state: &State, request: Box<EdgeRequest>) -> Result<Vec<Choice>, HardFail> {
        let sets = Self::edge_sets(state, request.parent, request.types);
        let existing = state.children(request.parent).find(|edge| {
            if request.is_virtual {
                edge.virtuals.contains(&request.package)
            } else {
                state.nodes[edge.child].package == request.package
            }
        });
        let placements: Vec<(Name, Placement)> = match existing {
            Some(edge) => vec![(
                state.nodes[edge.child].package.clone(),
                Placement::Existing(edge.child),
            )],
            None if request.is_virtual => {
                self.provider_placements(state, &request.package, &sets)?
            }
            None => {
                let placements = self.placements(state, &request.package, &sets)?;
                let placements = match &request.hash {
                    Some(hash) => placements
                        .into_iter()
                        .filter(|placement| match placement {
                            Placement::Existing(id) => matches!(
                                &state.nodes[*id].origin,
                                Origin::Undecided
                            ) || state.nodes[*id].origin == Origin::Reuse(hash.clone()),
                            Placement::New => true,
                        })
                        .collect(),
                    None => placements,
                };
                placements
                    .into_iter()
                    .map(|placement| (request.package.clone(), placement))
                    .collect()
            }
        };
        Ok(placements
            .into_iter()
            .map(|(package, placement)| Choice::Attach {
                request: request.clone(),
                package,
                placement,
            })
            .collect())
    }

    fn attach_edge(&self, state: &mut State, request: EdgeRequest, package: Name, placement: Placement) -> Result<(), HardFail> {
        let parent = request.parent;
        let child = self.place(state, package.clone(), placement);
        if state
            .children(parent)
            .any(|edge| edge.child != child && state.nodes[edge.child].package == package)
        {
            return Err(HardFail::new(format!(
                "'{}' would depend on two nodes of '{package}'",
                state.nodes[parent].package
            )));
        }
        let added = state.link_ancestry(parent, child)?;

        let mut virtuals = request.virtuals.clone();
        if request.is_virtual {
            virtuals.insert(request.package.clone());
        }
        match state
            .edges
            .iter_mut()
            .find(|edge| edge.parent == parent && edge.child == child)
        {
            Some(edge) => {
                edge.types |= request.types;
                edge.virtuals.extend(virtuals.iter().cloned());
            }
            None => state.edges.push(super::state::Edge {
                parent,
                child,
                types: request.types,
                virtuals: virtuals.clone(),
            }),
        }
        for virtual_name in &virtuals {
            state.add_provider(child, virtual_name, request.cause)?;
        }
        for key in Self::edge_sets(state, parent, request.types) {
            state.join_set(child, &key)?;
        }

        for (node, ancestor) in added {
            let pending: Vec<Deferred> = state
                .deferred
                .iter()
                .filter(|d| d.anchor == ancestor && state.nodes[node].answers_to(&d.package))
                .cloned()
                .collect();
            for deferred in pending {
                for clause in deferred.clauses {
                    self.add_imposition(state, node, Imposition {
                        clause,
                        cause: deferred.cause,
                    })?;
                }
            }
        }

        self.impose_effect(state, child, &request.package, &request.effect, request.cause)?;
        if let Some(hash) = &request.hash {
            let clause = crate::sym!("hash", package.as_ref(), hash.as_ref());
            self.add_imposition(state, child, Imposition { clause, cause: None })?;
        }
        if request.types.intersects(DepTypes::LINK_RUN) {
            let propagated: Vec<NodeFlag> = state.nodes[parent]
                .flags
                .iter()
                .filter(|flag| flag.propagate)
                .cloned()
                .collect();
            for flag in propagated {
                let clause = crate::sym!(
                    "node_flag_propagate",
                    package.as_ref(),
                    flag.ty.as_ref(),
                    flag.flag.as_ref(),
                    flag.source.as_ref(),
                    0i64
                );
                self.add_imposition(state, child, Imposition { clause, cause: None })?;
            }
        }
        if state.nodes[child].finalized && state.nodes[parent].finalized {
            self.check_edge(state, parent, child);
        }
        Ok(())
    }

    // ---------------------------------------------------------------------------------------
    // Impositions
    // ---------------------------------------------------------------------------------------

    /// Imposes the clauses of an effect on `node`. Clauses about other packages are deferred to
    /// the dependencies of `node`.
    fn impose_effect(&self, state: &mut State, node: NodeId, own: &str, effect: &[Symbol], cause: Option<Cause>) -> Result<(), HardFail> {
        let mut nonlocal: BTreeMap<Name, Vec<Symbol>> = BTreeMap::new();
        for clause in effect {
            match clause_subject(clause) {
                None => {}
                Some(subject) if subject == own => {
                    self.add_imposition(state, node, Imposition {
                        clause: clause.clone(),
                        cause,
                    })?;
                }
                Some(subject) => nonlocal
                    .entry(Name::from(subject))
                    .or_default()
                    .push(clause.clone()),
            }
        }
        for (package, clauses) in nonlocal {
            let targets: Vec<NodeId> = state
                .descendants(node)
                .filter(|&d| state.nodes[d].answers_to(&package))
                .collect();
            for target in targets {
                for clause in &clauses {
                    self.add_imposition(state, target, Imposition {
                        clause: clause.clone(),
                        cause,
                    })?;
                }
            }
            state.deferred.push(Deferred {
                anchor: node,
                package,
                clauses,
                cause,
            });
        }
        Ok(())
    }

    fn add_imposition(&self, state: &mut State, node: NodeId, imposition: Imposition) -> Result<(), HardFail> {
        if state.nodes[node].finalized {
            self.check_imposition(state, node, &imposition)?;
        }
        state.nodes[node].impositions.push(imposition);
        Ok(())
    }

    fn check_imposition(&self, state: &mut State, node: NodeId, imposition: &Imposition) -> Result<(), HardFail> {
        let n = &state.nodes[node];
        if node_satisfies(self.problem, n, &imposition.clause) {
            return Ok(());
        }
        let causes: Vec<Cause> = imposition.cause.into_iter().collect();
        let clause = &imposition.clause;
        if clause.is("hash", 2) {
            return Err(HardFail::new(format!(
                "'{}' must be reused from {}",
                n.package,
                clause.str_arg(1).unwrap_or_default()
            )));
        }
        if clause.is("variant_value", 3)
            && clause.str_arg(0) == Some(n.package.as_ref())
            && !n.variants.contains_key(clause.str_arg(1).unwrap_or_default())
        {
            let args = vec![
                clause.str_arg(1).unwrap_or_default().to_string(),
                n.package.to_string(),
            ];
            state.error(self.problem, "variant_undefined", args, causes);
            return Ok(());
        }
        let args = vec![describe_node(n), describe_clause(clause)];
        state.error(self.problem, "imposition", args, causes);
        Ok(())
    }

    /// Returns true if the local impositions on a node would hold with the given attributes.
    fn fits(&self, node: &Node) -> bool {
        node.impositions
            .iter()
            .filter(|imp| !self.problem.is_virtual(imp.clause.str_arg(0).unwrap_or_default()))
            .all(|imp| node_satisfies(self.problem, node, &imp.clause))
    }

    fn is_deprecated(&self, state: &State, node: NodeId, version: &str) -> bool {
        self.package(&state.nodes[node].package)
            .is_some_and(|p| p.deprecated.contains(version))
    }

    // ---------------------------------------------------------------------------------------
    // Deciding nodes
    // ---------------------------------------------------------------------------------------

    /// Requirement groups that are decided by branching: unconditional `require` groups whose
    /// members only talk about the package itself.
    fn branching_groups(&self, pkg: &'p PackageInfo) -> impl Iterator<Item = &'p RequirementGroup> + 'p {
        let problem = self.problem;
        pkg.requirements.iter().filter(move |group| {
            group.kind == RequirementKind::Require
                && group.trigger.is_none()
                && group.members.iter().all(|(condition, _)| {
                    problem.condition(*condition).is_some_and(|c| c.is_local())
                })
        })
    }

    fn expand_requirement(&self, state: &State, node: NodeId, index: usize) -> Vec<Choice> {
        let group = self
            .package(&state.nodes[node].package)
            .and_then(|pkg| self.branching_groups(pkg).nth(index));
        let Some(group) = group else {
            return vec![Choice::Continue(
                node,
                self.next_step(state, node, StepKind::Requirement),
            )];
        };
        group
            .members
            .iter()
            .map(|&(condition, weight)| Choice::Requirement {
                node,
                index,
                group: group.id,
                condition,
                weight,
            })
            .collect()
    }

    fn expand_origin(&self, state: &State, id: NodeId) -> Vec<Choice> {
        let node = &state.nodes[id];
        let Some(pkg) = self.package(&node.package) else {
            return vec![Choice::Origin {
                node: id,
                origin: Origin::Build,
                not_buildable: false,
            }];
        };
        let hash: Option<&str> = imposed_values(node, "hash", 2)
            .next()
            .and_then(|clause| clause.str_arg(1));

        let mut candidates: Vec<(i64, Origin)> = Vec::new();
        if !(node.root && self.problem.no_root_reuse) {
            for installed in &pkg.installed {
                if hash.is_some_and(|h| h != installed.as_ref()) {
                    continue;
                }
                let Some(spec) = self.problem.installed.get(installed) else {
                    continue;
                };
                let mut probe = node.clone();
                self.assign_installed(&mut probe, installed);
                let host_compatible = spec
                    .os
                    .as_ref()
                    .is_none_or(|os| self.problem.os.iter().any(|(o, _)| o == os))
                    && spec
                        .target
                        .as_ref()
                        .is_none_or(|t| self.problem.targets.iter().any(|(o, _)| o == t));
                let deprecated = spec
                    .version
                    .as_ref()
                    .is_some_and(|v| pkg.deprecated.contains(v));
                if host_compatible
                    && (!deprecated || self.problem.deprecated_allowed)
                    && self.fits(&probe)
                {
                    candidates.push((
                        self.problem.origin_rank("reuse"),
                        Origin::Reuse(installed.clone()),
                    ));
                }
            }
        }
        if hash.is_none() {
            for external in &pkg.externals {
                let mut probe = node.clone();
                probe.version = Some(external.version.clone());
                if let Some(condition) = self.problem.condition(external.condition) {
                    for clause in &condition.effect {
                        assign_clause(&mut probe, clause);
                    }
                }
                if self.fits(&probe) {
                    candidates.push((
                        self.problem.origin_rank("external"),
                        Origin::External(external.index),
                    ));
                }
            }
            if !pkg.external_only {
                candidates.push((self.problem.origin_rank("build"), Origin::Build));
            }
        }
        candidates.sort_by_key(|(rank, _)| *rank);

        if candidates.is_empty() {
            return vec![Choice::Origin {
                node: id,
                origin: Origin::Build,
                not_buildable: hash.is_none(),
            }];
        }
        candidates
            .into_iter()
            .map(|(_, origin)| Choice::Origin {
                node: id,
                origin,
                not_buildable: false,
            })
            .collect()
    }

    fn assign_installed(&self, node: &mut Node, hash: &Name) {
        let Some(spec) = self.problem.installed.get(hash) else {
            return;
        };
        node.origin = Origin::Reuse(hash.clone());
        node.version = spec.version.clone();
        node.platform = spec.platform.clone();
        node.os = spec.os.clone();
        node.target = spec.target.clone();
        node.compiler = spec.compiler.clone();
        node.variants = spec.variants.clone();
        node.flags = spec
            .flags
            .iter()
            .map(|(ty, flag, source, _)| NodeFlag {
                ty: ty.clone(),
                flag: flag.clone(),
                source: source.clone(),
                propagate: false,
            })
            .collect();
    }

    fn apply_origin(&self, state: &mut State, id: NodeId, origin: Origin, not_buildable: bool) -> Result<(), HardFail> {
        let package = state.nodes[id].package.clone();
        let pkg = self.package(&package);
        if not_buildable {
            state.error(
                self.problem,
                "not_buildable",
                vec![package.to_string()],
                Vec::new(),
            );
        }
        let version_weight = |version: Option<&Name>| {
            version
                .and_then(|v| pkg.and_then(|p| p.version(v)))
                .map_or(0, |v| v.weight)
        };
        match origin {
            Origin::Reuse(hash) => {
                let mut node = state.nodes[id].clone();
                self.assign_installed(&mut node, &hash);
                let weight = version_weight(node.version.as_ref());
                let deprecated = node
                    .version
                    .as_ref()
                    .is_some_and(|v| pkg.is_some_and(|p| p.deprecated.contains(v)));
                state.nodes[id] = node;
                self.charge_node(state, id, Criterion::VersionBadness, weight);
                if deprecated {
                    self.charge(state, Criterion::DeprecatedVersions, 1);
                }
                state.tasks.push_front(Task::Decide(id, Step::Finalize));
            }
            Origin::External(index) => {
                let external = pkg.and_then(|p| p.externals.iter().find(|e| e.index == index));
                state.nodes[id].origin = Origin::External(index);
                if let Some(external) = external {
                    state.nodes[id].version = Some(external.version.clone());
                    let weight = version_weight(Some(&external.version));
                    self.charge_node(state, id, Criterion::VersionBadness, weight);
                    let effect = self
                        .problem
                        .condition(external.condition)
                        .map(|c| c.effect.clone())
                        .unwrap_or_default();
                    let cause = Cause {
                        condition: external.condition,
                        node: id,
                    };
                    state.holds.insert((external.condition, id));
                    self.impose_effect(state, id, &package, &effect, Some(cause))?;
                }
                let next = self.next_step(state, id, StepKind::Origin);
                state.tasks.push_front(Task::Decide(id, next));
            }
            Origin::Build | Origin::Undecided => {
                state.nodes[id].origin = Origin::Build;
                self.charge(state, Criterion::BuiltPackages, 1);
                let next = self.next_step(state, id, StepKind::Origin);
                state.tasks.push_front(Task::Decide(id, next));
            }
        }
        Ok(())
    }

    fn expand_version(&self, state: &State, id: NodeId) -> Vec<Choice> {
        let node = &state.nodes[id];
        let Some(pkg) = self.package(&node.package) else {
            return vec![Choice::Version {
                node: id,
                version: None,
                weight: 0,
            }];
        };
        let constraints: Vec<&str> = imposed_values(node, "node_version_satisfies", 2)
            .filter_map(|clause| clause.str_arg(1))
            .collect();
        let allowed = |v: &&VersionInfo| {
            v.buildable() && (self.problem.deprecated_allowed || !pkg.deprecated.contains(&v.version))
        };
        let choices: Vec<Choice> = pkg
            .versions
            .iter()
            .filter(allowed)
            .filter(|v| constraints.iter().all(|c| pkg.satisfies(c, &v.version)))
            .map(|v| Choice::Version {
                node: id,
                version: Some(v.version.clone()),
                weight: v.weight,
            })
            .collect();
        if !choices.is_empty() {
            return choices;
        }
        // Nothing fits: pick a version anyway and let the checks report why.
        let fallback = pkg
            .versions
            .iter()
            .filter(|v| v.buildable())
            .find(|v| constraints.iter().all(|c| pkg.satisfies(c, &v.version)))
            .or_else(|| pkg.versions.iter().find(allowed))
            .or_else(|| pkg.versions.first());
        vec![Choice::Version {
            node: id,
            version: fallback.map(|v| v.version.clone()),
            weight: fallback.map_or(0, |v| v.weight),
        }]
    }

    fn parent_value<T>(&self, state: &State, id: NodeId, get: impl Fn(&Node) -> Option<T>) -> Option<T> {
        state
            .parents(id)
            .map(|edge| &state.nodes[edge.parent])
            .filter(|parent| parent.finalized)
            .find_map(get)
    }

    fn expand_os(&self, state: &State, id: NodeId) -> Vec<Choice> {
        let node = &state.nodes[id];
        let imposed: Vec<&str> = imposed_values(node, "node_os", 2)
            .filter_map(|clause| clause.str_arg(1))
            .collect();
        let parent = self.parent_value(state, id, |p| p.os.clone());
        let mut candidates: Vec<(Name, i64)> = self
            .problem
            .os
            .iter()
            .filter(|(os, _)| imposed.iter().all(|i| *i == os.as_ref()))
            .cloned()
            .collect();
        candidates.sort_by_key(|(os, _)| Some(os) != parent.as_ref());
        if candidates.is_empty() {
            let os = imposed
                .first()
                .map(|os| Name::from(*os))
                .or_else(|| self.problem.default_os().cloned());
            return vec![Choice::Os {
                node: id,
                os,
                weight: 0,
            }];
        }
        candidates
            .into_iter()
            .map(|(os, weight)| Choice::Os {
                node: id,
                os: Some(os),
                weight,
            })
            .collect()
    }

    fn expand_target(&self, state: &State, id: NodeId) -> Vec<Choice> {
        let node = &state.nodes[id];
        let imposed: Vec<&str> = imposed_values(node, "node_target", 2)
            .filter_map(|clause| clause.str_arg(1))
            .collect();
        let parent = self.parent_value(state, id, |p| p.target.clone());
        let preferences = self
            .package(&node.package)
            .map(|p| &p.target_weights)
            .filter(|weights| !weights.is_empty());
        let offset = preferences.map_or(0, |w| w.len() as i64);
        let mut candidates: Vec<(Name, i64)> = self
            .problem
            .targets
            .iter()
            .filter(|(target, _)| imposed.iter().all(|i| *i == target.as_ref()))
            .map(|(target, weight)| {
                let weight = preferences
                    .and_then(|w| w.get(target).copied())
                    .unwrap_or(offset + weight);
                (target.clone(), weight)
            })
            .collect();
        candidates.sort_by(|a, b| {
            (Some(&a.0) != parent.as_ref(), a.1, &a.0).cmp(&(Some(&b.0) != parent.as_ref(), b.1, &b.0))
        });
        if candidates.is_empty() {
            let target = imposed
                .first()
                .map(|t| Name::from(*t))
                .or_else(|| self.problem.default_target().cloned());
            return vec![Choice::Target {
                node: id,
                target,
                weight: 0,
            }];
        }
        candidates
            .into_iter()
            .map(|(target, weight)| Choice::Target {
                node: id,
                target: Some(target),
                weight,
            })
            .collect()
    }

    fn expand_compiler(&self, state: &State, id: NodeId) -> Vec<Choice> {
        let node = &state.nodes[id];
        let names: Vec<&str> = imposed_values(node, "node_compiler", 2)
            .filter_map(|clause| clause.str_arg(1))
            .collect();
        let versions: Vec<(&str, &str)> = imposed_values(node, "node_compiler_version_satisfies", 3)
            .filter_map(|clause| Some((clause.str_arg(1)?, clause.str_arg(2)?)))
            .collect();
        let preferences = self.package(&node.package).map(|p| &p.compiler_preferences);
        let offset = preferences.map_or(0, |p| p.len() as i64);
        let parent = self.parent_value(state, id, |p| p.compiler.clone());

        let usable: Vec<&CompilerInfo> = self
            .problem
            .compilers
            .iter()
            .filter(|c| c.available)
            .filter(|c| match (&c.os, &node.os) {
                (Some(compiler_os), Some(os)) => compiler_os == os,
                _ => true,
            })
            .collect();
        let mut candidates: Vec<(Name, Name, i64)> = usable
            .iter()
            .filter(|c| names.iter().all(|n| *n == c.name.as_ref()))
            .filter(|c| {
                versions.iter().all(|(name, constraint)| {
                    *name == c.name.as_ref() && self.problem.compiler_satisfies(name, constraint, &c.version)
                })
            })
            .map(|c| {
                let weight = preferences
                    .and_then(|p| p.get(&(c.name.clone(), c.version.clone())).copied())
                    .unwrap_or(offset + c.weight);
                (c.name.clone(), c.version.clone(), weight)
            })
            .collect();
        candidates.sort_by(|a, b| {
            let a_key = (parent.as_ref() != Some(&(a.0.clone(), a.1.clone())), a.2);
            let b_key = (parent.as_ref() != Some(&(b.0.clone(), b.1.clone())), b.2);
            a_key.cmp(&b_key)
        });
        if candidates.is_empty() {
            let compiler = usable.first().map(|c| (c.name.clone(), c.version.clone()));
            return vec![Choice::Compiler {
                node: id,
                compiler,
                weight: 0,
            }];
        }
        candidates
            .into_iter()
            .map(|(name, version, weight)| Choice::Compiler {
                node: id,
                compiler: Some((name, version)),
                weight,
            })
            .collect()
    }

    fn expand_variant(&self, state: &State, id: NodeId, index: usize) -> Vec<Choice> {
        let node = &state.nodes[id];
        let done = || Choice::Continue(id, self.next_step(state, id, StepKind::Variant));
        let Some(pkg) = self.package(&node.package) else {
            return vec![done()];
        };
        let Some(name) = pkg.variant_order.get(index) else {
            return vec![done()];
        };
        let active = pkg.variant_defs.get(name).and_then(|defs| {
            defs.iter().rev().copied().find(|def| {
                match pkg.variant_conditions.get(def) {
                    None => true,
                    Some(condition) => self.problem.condition(*condition).is_some_and(|c| {
                        c.is_local() && c.local.iter().all(|clause| node_satisfies(self.problem, node, clause))
                    }),
                }
            })
        });
        let Some(definition) = active else {
            return vec![Choice::Continue(id, Step::Variant(index + 1))];
        };
        let Some(def) = self.problem.variant_defs.get(&definition) else {
            return vec![Choice::Continue(id, Step::Variant(index + 1))];
        };

        let imposed: BTreeSet<Name> = imposed_values(node, "variant_value", 3)
            .filter(|clause| clause.str_arg(1) == Some(name.as_ref()))
            .filter_map(|clause| clause.str_arg(2))
            .map(Name::from)
            .collect();
        let defaults: BTreeSet<Name> = match pkg.variant_preferred.get(name) {
            Some(preferred) if preferred.iter().all(|v| def.accepts(v)) => {
                preferred.iter().cloned().collect()
            }
            _ => def.defaults.iter().cloned().collect(),
        };
        let choice = |values: BTreeSet<Name>| Choice::Variant {
            node: id,
            index,
            name: name.clone(),
            definition,
            cost: values.difference(&defaults).count() as i64,
            values,
        };

        if !imposed.is_empty() {
            return vec![choice(imposed)];
        }
        if def.is_multi() || def.sticky || (def.open && def.values.is_empty()) {
            return vec![choice(defaults.clone())];
        }
        let mut choices = vec![choice(defaults.clone())];
        for value in &def.values {
            if !(defaults.len() == 1 && defaults.contains(value)) {
                choices.push(choice(BTreeSet::from([value.clone()])));
            }
        }
        choices
    }

    // ---------------------------------------------------------------------------------------
    // Finalizing nodes
    // ---------------------------------------------------------------------------------------

    fn finalize(&self, state: &mut State, id: NodeId) -> Result<(), HardFail> {
        let problem = self.problem;
        let package = state.nodes[id].package.clone();
        let pkg = self.package(&package);

        if state.nodes[id].platform.is_none() {
            state.nodes[id].platform = problem.host_platform.clone();
        }
        self.collect_flags(state, id);

        // Providers
        let provides: Vec<(Name, Option<Cause>)> = state.nodes[id]
            .provides
            .iter()
            .map(|(v, c)| (v.clone(), *c))
            .collect();
        for (virtual_name, cause) in provides {
            let conditions: Vec<i64> = pkg
                .map(|p| {
                    p.provider_conditions
                        .iter()
                        .filter(|(_, v)| *v == virtual_name)
                        .map(|(c, _)| *c)
                        .collect()
                })
                .unwrap_or_default();
            let mut held = false;
            let mut pending = false;
            for condition in conditions {
                match problem.condition(condition) {
                    Some(c) if c.is_local() => {
                        if state.condition_holds(problem, condition, id) == Some(true) {
                            state.nodes[id]
                                .held_providers
                                .insert((virtual_name.clone(), condition));
                            state.holds.insert((condition, id));
                            held = true;
                        }
                    }
                    Some(_) => pending = true,
                    None => {}
                }
            }
            if !held && !pending {
                state.error(
                    problem,
                    "provider",
                    vec![package.to_string(), virtual_name.to_string()],
                    cause.into_iter().collect(),
                );
            }
            let weight = problem.provider_weight(&virtual_name, &package);
            self.charge_node(state, id, Criterion::ProviderWeight, weight);
        }

        if let Some(pkg) = pkg {
            for definition in state.nodes[id].active_variants.values().copied().collect::<Vec<_>>() {
                if let Some(condition) = pkg.variant_conditions.get(&definition) {
                    state.holds.insert((*condition, id));
                }
            }
        }

        for imposition in state.nodes[id].impositions.clone() {
            self.check_imposition(state, id, &imposition)?;
        }
        self.check_variant_values(state, id);

        if let Some(pkg) = pkg {
            for group in &pkg.requirements {
                if self.requirement_is_local(group) {
                    self.check_requirement(state, id, group);
                }
            }
            if state.nodes[id].is_built() {
                for conflict in &pkg.conflicts {
                    let local = [conflict.trigger, conflict.constraint]
                        .iter()
                        .all(|c| problem.condition(*c).is_some_and(|c| c.is_local()));
                    if local {
                        self.check_conflict(state, id, conflict);
                    }
                }
            }
        }

        state.nodes[id].finalized = true;
        let parents: Vec<NodeId> = state
            .parents(id)
            .map(|edge| edge.parent)
            .filter(|&p| state.nodes[p].finalized)
            .collect();
        for parent in parents {
            self.check_edge(state, parent, id);
        }
        let children: Vec<NodeId> = state
            .children(id)
            .map(|edge| edge.child)
            .filter(|&c| state.nodes[c].finalized)
            .collect();
        for child in children {
            self.check_edge(state, id, child);
        }

        self.push_dependencies(state, id);
        Ok(())
    }

    fn collect_flags(&self, state: &mut State, id: NodeId) {
        let node = &state.nodes[id];
        if matches!(node.origin, Origin::Reuse(_)) {
            return;
        }
        let mut flags: Vec<NodeFlag> = Vec::new();
        if node.is_built() {
            if let Some((name, version)) = &node.compiler {
                let compiler = self
                    .problem
                    .compilers
                    .iter()
                    .find(|c| &c.name == name && &c.version == version);
                for (ty, flag, _) in compiler.into_iter().flat_map(|c| c.flags.iter()) {
                    flags.push(NodeFlag {
                        ty: ty.clone(),
                        flag: flag.clone(),
                        source: Name::from("compiler"),
                        propagate: false,
                    });
                }
            }
        }
        for imposition in &node.impositions {
            let clause = &imposition.clause;
            let propagate = clause.is("node_flag_propagate", 5);
            if !(propagate || clause.is("node_flag", 5)) {
                continue;
            }
            let (Some(ty), Some(flag), Some(source)) =
                (clause.str_arg(1), clause.str_arg(2), clause.str_arg(3))
            else {
                continue;
            };
            match flags
                .iter_mut()
                .find(|f| f.ty.as_ref() == ty && f.flag.as_ref() == flag)
            {
                Some(existing) => existing.propagate |= propagate,
                None => flags.push(NodeFlag {
                    ty: Name::from(ty),
                    flag: Name::from(flag),
                    source: Name::from(source),
                    propagate,
                }),
            }
        }
        state.nodes[id].flags = flags;
    }

    fn check_variant_values(&self, state: &mut State, id: NodeId) {
        let node = &state.nodes[id];
        let mut errors = Vec::new();
        for (name, values) in &node.variants {
            let Some(def) = node
                .active_variants
                .get(name)
                .and_then(|d| self.problem.variant_defs.get(d))
            else {
                continue;
            };
            let causes: Vec<Cause> = node
                .impositions
                .iter()
                .filter(|imp| {
                    imp.clause.is("variant_value", 3) && imp.clause.str_arg(1) == Some(name.as_ref())
                })
                .filter_map(|imp| imp.cause)
                .collect();
            for value in values {
                if !def.accepts(value) {
                    errors.push((
                        "variant_value",
                        vec![node.package.to_string(), name.to_string(), value.to_string()],
                        causes.clone(),
                    ));
                }
            }
            if !def.is_multi() && values.len() > 1 {
                errors.push((
                    "variant_single_value",
                    vec![node.package.to_string(), name.to_string()],
                    causes.clone(),
                ));
            }
        }
        for (kind, args, causes) in errors {
            state.error(self.problem, kind, args, causes);
        }
    }

    fn requirement_is_local(&self, group: &RequirementGroup) -> bool {
        let local = |condition: i64| self.problem.condition(condition).is_some_and(|c| c.is_local());
        group.trigger.is_none_or(local) && group.members.iter().all(|(c, _)| local(*c))
    }

    fn check_requirement(&self, state: &mut State, id: NodeId, group: &RequirementGroup) {
        let problem = self.problem;
        if let Some(trigger) = group.trigger {
            if state.condition_holds(problem, trigger, id) != Some(true) {
                return;
            }
            state.holds.insert((trigger, id));
        }
        let holding: Vec<(i64, i64)> = group
            .members
            .iter()
            .copied()
            .filter(|(condition, _)| state.condition_holds(problem, *condition, id) == Some(true))
            .collect();
        let package = state.nodes[id].package.to_string();
        let chosen = state.nodes[id].chosen_requirements.contains_key(&group.id);
        let trigger_cause: Vec<Cause> = group
            .trigger
            .map(|condition| Cause { condition, node: id })
            .into_iter()
            .collect();
        match group.kind {
            RequirementKind::Require => {
                let satisfied = match group.policy {
                    Policy::OneOf => holding.len() == 1,
                    Policy::AnyOf => !holding.is_empty(),
                };
                if satisfied {
                    for (condition, _) in &holding {
                        state.holds.insert((*condition, id));
                    }
                    if !chosen {
                        self.charge(state, Criterion::RequirementWeight, holding[0].1);
                    }
                } else {
                    let causes = if holding.is_empty() {
                        trigger_cause
                    } else {
                        holding
                            .iter()
                            .map(|(condition, _)| Cause {
                                condition: *condition,
                                node: id,
                            })
                            .collect()
                    };
                    state.error(
                        problem,
                        "requirement",
                        vec![package, group.message.to_string()],
                        causes,
                    );
                }
            }
            RequirementKind::Prefer => {
                if holding.is_empty() {
                    self.charge_node(state, id, Criterion::UnmetPreferences, 1);
                } else {
                    for (condition, _) in &holding {
                        state.holds.insert((*condition, id));
                    }
                }
            }
            RequirementKind::Conflict => {
                if !holding.is_empty() {
                    let causes = holding
                        .iter()
                        .map(|(condition, _)| Cause {
                            condition: *condition,
                            node: id,
                        })
                        .collect();
                    for (condition, _) in &holding {
                        state.holds.insert((*condition, id));
                    }
                    state.error(
                        problem,
                        "requirement",
                        vec![package, group.message.to_string()],
                        causes,
                    );
                }
            }
        }
    }

    fn check_conflict(&self, state: &mut State, id: NodeId, conflict: &Conflict) {
        let problem = self.problem;
        let holds = |condition| state.condition_holds(problem, condition, id) == Some(true);
        if holds(conflict.trigger) && holds(conflict.constraint) {
            state.holds.insert((conflict.trigger, id));
            state.holds.insert((conflict.constraint, id));
            let causes = vec![
                Cause {
                    condition: conflict.trigger,
                    node: id,
                },
                Cause {
                    condition: conflict.constraint,
                    node: id,
                },
            ];
            let args = vec![
                state.nodes[id].package.to_string(),
                conflict.message.to_string(),
            ];
            state.error(problem, "conflict", args, causes);
        }
    }

    /// Costs and compatibility errors between a parent and one of its dependencies.
    fn check_edge(&self, state: &mut State, parent: NodeId, child: NodeId) {
        let problem = self.problem;
        let types = state
            .edges
            .iter()
            .filter(|e| e.parent == parent && e.child == child)
            .fold(DepTypes::NONE, |acc, e| acc | e.types);
        let strict = types.intersects(DepTypes::LINK_RUN);
        let (p, c) = (&state.nodes[parent], &state.nodes[child]);
        let mut costs = Vec::new();
        let mut errors = Vec::new();

        if let (Some(parent_os), Some(child_os)) = (&p.os, &c.os) {
            if parent_os != child_os {
                costs.push(Criterion::OsMismatch);
                if strict && !problem.os_compatible(parent_os, child_os) {
                    errors.push((
                        "os_incompatible",
                        vec![
                            c.package.to_string(),
                            child_os.to_string(),
                            p.package.to_string(),
                            parent_os.to_string(),
                        ],
                    ));
                }
            }
        }
        if let (Some(parent_target), Some(child_target)) = (&p.target, &c.target) {
            if parent_target != child_target {
                costs.push(Criterion::TargetMismatch);
                if strict && !problem.target_compatible(parent_target, child_target) {
                    errors.push((
                        "target_incompatible",
                        vec![
                            c.package.to_string(),
                            child_target.to_string(),
                            p.package.to_string(),
                            parent_target.to_string(),
                        ],
                    ));
                }
            }
        }
        if c.is_built() && p.compiler.is_some() && c.compiler.is_some() && p.compiler != c.compiler {
            costs.push(Criterion::CompilerMismatch);
        }
        for criterion in costs {
            self.charge_node(state, child, criterion, 1);
        }
        for (kind, args) in errors {
            state.error(problem, kind, args, Vec::new());
        }
    }

    fn fire_dependency(&self, state: &mut State, id: NodeId, condition: i64, child: &Name, types: DepTypes) {
        state.fired.insert((condition, id));
        state.holds.insert((condition, id));
        let effect: Vec<Symbol> = self
            .problem
            .condition(condition)
            .map(|c| c.effect.clone())
            .unwrap_or_default();
        state.tasks.push_back(Task::Edge(Box::new(EdgeRequest {
            parent: id,
            package: child.clone(),
            is_virtual: self.problem.is_virtual(child),
            types,
            cause: Some(Cause {
                condition,
                node: id,
            }),
            effect,
            hash: None,
            virtuals: BTreeSet::new(),
        })));
    }

    fn push_dependencies(&self, state: &mut State, id: NodeId) {
        let problem = self.problem;
        let package = state.nodes[id].package.clone();
        match state.nodes[id].origin.clone() {
            Origin::Build => {
                let Some(pkg) = self.package(&package) else {
                    return;
                };
                for dependency in &pkg.dependencies {
                    let local = problem
                        .condition(dependency.condition)
                        .is_some_and(|c| c.is_local());
                    if local && state.condition_holds(problem, dependency.condition, id) == Some(true) {
                        self.fire_dependency(state, id, dependency.condition, &dependency.child, dependency.types);
                    }
                }
                if problem.runtime_packages.contains(&package) {
                    return;
                }
                let Some(compiler) = state.nodes[id].compiler.clone() else {
                    return;
                };
                for runtime in problem.runtimes.iter().filter(|r| r.compiler == compiler) {
                    if !runtime.package.is_empty() && runtime.package != package {
                        self.fire_dependency(state, id, runtime.condition, &runtime.package, DepTypes::LINK);
                    }
                }
            }
            Origin::Reuse(hash) => {
                let Some(spec) = problem.installed.get(&hash) else {
                    return;
                };
                for dependency in &spec.dependencies {
                    state.tasks.push_back(Task::Edge(Box::new(EdgeRequest {
                        parent: id,
                        package: dependency.package.clone(),
                        is_virtual: false,
                        types: dependency.types,
                        cause: None,
                        effect: Vec::new(),
                        hash: Some(dependency.hash.clone()),
                        virtuals: dependency.virtuals.clone(),
                    })));
                }
            }
            Origin::External(_) | Origin::Undecided => {}
        }
    }

    // ---------------------------------------------------------------------------------------
    // Complete assignments
    // ---------------------------------------------------------------------------------------

    /// Fires dependency conditions that refer to other packages. Returns true if any fired.
    fn fire_nonlocal_dependencies(&self, state: &mut State) -> bool {
        let problem = self.problem;
        let mut pending = Vec::new();
        for (id, node) in state.nodes.iter().enumerate() {
            if !node.is_built() || !node.finalized {
                continue;
            }
            let Some(pkg) = self.package(&node.package) else {
                continue;
            };
            for dependency in &pkg.dependencies {
                let nonlocal = problem
                    .condition(dependency.condition)
                    .is_some_and(|c| !c.is_local());
                if nonlocal
                    && !state.fired.contains(&(dependency.condition, id))
                    && state.condition_holds(problem, dependency.condition, id) == Some(true)
                {
                    pending.push((id, dependency));
                }
            }
        }
        let fired = !pending.is_empty();
        for (id, dependency) in pending {
            self.fire_dependency(state, id, dependency.condition, &dependency.child, dependency.types);
        }
        fired
    }

    fn final_checks(&self, state: &mut State) {
        let problem = self.problem;
        for id in 0..state.nodes.len() {
            let package = state.nodes[id].package.clone();
            let Some(pkg) = self.package(&package) else {
                continue;
            };

            let unresolved: Vec<(Name, Option<Cause>)> = state.nodes[id]
                .provides
                .iter()
                .filter(|(v, _)| !state.nodes[id].held_providers.iter().any(|(h, _)| h == *v))
                .map(|(v, c)| (v.clone(), *c))
                .collect();
            for (virtual_name, cause) in unresolved {
                let held: Vec<i64> = pkg
                    .provider_conditions
                    .iter()
                    .filter(|(_, v)| *v == virtual_name)
                    .map(|(c, _)| *c)
                    .filter(|c| state.condition_holds(problem, *c, id) == Some(true))
                    .collect();
                if held.is_empty() {
                    state.error(
                        problem,
                        "provider",
                        vec![package.to_string(), virtual_name.to_string()],
                        cause.into_iter().collect(),
                    );
                }
                for condition in held {
                    state.holds.insert((condition, id));
                    state.nodes[id]
                        .held_providers
                        .insert((virtual_name.clone(), condition));
                }
            }

            for group in &pkg.requirements {
                if !self.requirement_is_local(group) {
                    self.check_requirement(state, id, group);
                }
            }
            if state.nodes[id].is_built() {
                for conflict in &pkg.conflicts {
                    let local = [conflict.trigger, conflict.constraint]
                        .iter()
                        .all(|c| problem.condition(*c).is_some_and(|c| c.is_local()));
                    if !local {
                        self.check_conflict(state, id, conflict);
                    }
                }
            }
        }

        for deferred in state.deferred.clone() {
            let found = state
                .descendants(deferred.anchor)
                .any(|d| state.nodes[d].answers_to(&deferred.package));
            if !found {
                let args = vec![
                    state.nodes[deferred.anchor].package.to_string(),
                    deferred.package.to_string(),
                ];
                state.error(
                    problem,
                    "missing_dependency",
                    args,
                    deferred.cause.into_iter().collect(),
                );
            }
        }
    }
}

/// Copies the attribute a clause describes onto a probe node.
fn assign_clause(node: &mut Node, clause: &Symbol) {
    if clause.str_arg(0) != Some(node.package.as_ref()) {
        return;
    }
    let arg = |idx: usize| clause.str_arg(idx).map(Name::from);
    match clause.signature() {
        Some(("node_os", 2)) => node.os = arg(1),
        Some(("node_target", 2)) => node.target = arg(1),
        Some(("node_platform", 2)) => node.platform = arg(1),
        Some(("variant_value", 3)) => {
            if let (Some(name), Some(value)) = (arg(1), arg(2)) {
                node.variants.entry(name).or_default().insert(value);
            }
        }
        _ => {}
    }
}
