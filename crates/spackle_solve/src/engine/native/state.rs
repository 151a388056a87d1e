//! The partial assignment explored by the search.

use std::{
    cmp::Ordering,
    collections::{BTreeMap, BTreeSet, VecDeque},
};

use spackle_types::DepTypes;

use super::problem::{Name, Problem};
use crate::engine::Symbol;

pub(crate) type NodeId = usize;

/// A failure that rules out the current branch entirely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HardFail(pub String);

impl HardFail {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// A group of nodes that must agree on one node per package and one provider per virtual.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum SetKey {
    /// The link-run closure of the roots.
    Root,
    /// The build dependencies of a node and their link-run closure.
    Build(NodeId),
}

#[derive(Debug, Clone, Default)]
pub(crate) struct UnifySet {
    pub members: BTreeMap<Name, NodeId>,
    pub providers: BTreeMap<Name, NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Origin {
    Undecided,
    Build,
    Reuse(Name),
    External(i64),
}

/// The condition that led to a fact, and the node it held on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Cause {
    pub condition: i64,
    pub node: NodeId,
}

#[derive(Debug, Clone)]
pub(crate) struct Imposition {
    pub clause: Symbol,
    pub cause: Option<Cause>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct NodeFlag {
    pub ty: Name,
    pub flag: Name,
    pub source: Name,
    pub propagate: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct Node {
    pub package: Name,
    pub dup: usize,
    pub origin: Origin,
    pub version: Option<Name>,
    pub platform: Option<Name>,
    pub os: Option<Name>,
    pub target: Option<Name>,
    pub compiler: Option<(Name, Name)>,
    pub variants: BTreeMap<Name, BTreeSet<Name>>,
    pub active_variants: BTreeMap<Name, i64>,
    pub flags: Vec<NodeFlag>,
    pub impositions: Vec<Imposition>,
    pub root: bool,
    pub finalized: bool,
    pub sets: BTreeSet<SetKey>,
    pub ancestors: BTreeSet<NodeId>,
    pub provides: BTreeMap<Name, Option<Cause>>,
    pub held_providers: BTreeSet<(Name, i64)>,
    pub chosen_requirements: BTreeMap<i64, i64>,
}

impl Node {
    fn new(package: Name, dup: usize) -> Self {
        Self {
            package,
            dup,
            origin: Origin::Undecided,
            version: None,
            platform: None,
            os: None,
            target: None,
            compiler: None,
            variants: BTreeMap::new(),
            active_variants: BTreeMap::new(),
            flags: Vec::new(),
            impositions: Vec::new(),
            root: false,
            finalized: false,
            sets: BTreeSet::new(),
            ancestors: BTreeSet::new(),
            provides: BTreeMap::new(),
            held_providers: BTreeSet::new(),
            chosen_requirements: BTreeMap::new(),
        }
    }

    pub fn is_built(&self) -> bool {
        self.origin == Origin::Build
    }

    /// Returns true if the node is the package or provides the virtual.
    pub fn answers_to(&self, name: &str) -> bool {
        self.package.as_ref() == name || self.provides.contains_key(name)
    }

    pub fn has_flag(&self, ty: &str, flag: &str) -> bool {
        self.flags
            .iter()
            .any(|f| f.ty.as_ref() == ty && f.flag.as_ref() == flag)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Edge {
    pub parent: NodeId,
    pub child: NodeId,
    pub types: DepTypes,
    pub virtuals: BTreeSet<Name>,
}

/// Constraints on a package that must hold on some dependency of `anchor`.
#[derive(Debug, Clone)]
pub(crate) struct Deferred {
    pub anchor: NodeId,
    pub package: Name,
    pub clauses: Vec<Symbol>,
    pub cause: Option<Cause>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ErrorAtom {
    pub kind: Name,
    pub args: Vec<String>,
    pub causes: Vec<Cause>,
}

/// A request to connect a parent to a dependency.
#[derive(Debug, Clone)]
pub(crate) struct EdgeRequest {
    pub parent: NodeId,
    pub package: Name,
    pub is_virtual: bool,
    pub types: DepTypes,
    pub cause: Option<Cause>,
    pub effect: Vec<Symbol>,
    pub hash: Option<Name>,
    pub virtuals: BTreeSet<Name>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Requirement(usize),
    Origin,
    Version,
    Os,
    Target,
    Compiler,
    Variant(usize),
    Finalize,
}

#[derive(Debug, Clone)]
pub(crate) enum Task {
    Literal(usize),
    Decide(NodeId, Step),
    Edge(Box<EdgeRequest>),
}

/// Accumulated optimization cost, compared from the highest priority down.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Cost(BTreeMap<i64, i64>);

impl Cost {
    pub fn add(&mut self, priority: i64, value: i64) {
        if value != 0 {
            *self.0.entry(priority).or_default() += value;
        }
    }

    pub fn get(&self, priority: i64) -> i64 {
        self.0.get(&priority).copied().unwrap_or_default()
    }

    pub fn priorities(&self) -> impl Iterator<Item = i64> + '_ {
        self.0.keys().copied()
    }
}

impl Ord for Cost {
    fn cmp(&self, other: &Self) -> Ordering {
        let priorities: BTreeSet<i64> = self.priorities().chain(other.priorities()).collect();
        priorities
            .into_iter()
            .rev()
            .map(|p| self.get(p).cmp(&other.get(p)))
            .find(|ordering| ordering.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for Cost {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct State {
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub sets: BTreeMap<SetKey, UnifySet>,
    pub tasks: VecDeque<Task>,
    pub cost: Cost,
    pub errors: Vec<ErrorAtom>,
    pub literal_roots: BTreeMap<i64, NodeId>,
    pub deferred: Vec<Deferred>,
    pub holds: BTreeSet<(i64, NodeId)>,
    pub fired: BTreeSet<(i64, NodeId)>,
}

impl State {
    pub fn new_node(&mut self, package: Name) -> NodeId {
        let dup = self.nodes.iter().filter(|n| n.package == package).count();
        self.nodes.push(Node::new(package, dup));
        let id = self.nodes.len() - 1;
        self.tasks.push_back(Task::Decide(id, Step::Requirement(0)));
        id
    }

    pub fn error(&mut self, problem: &Problem, kind: &str, args: Vec<String>, causes: Vec<Cause>) {
        let atom = ErrorAtom {
            kind: Name::from(kind),
            args,
            causes,
        };
        if self.errors.contains(&atom) {
            return;
        }
        let (priority, _) = problem.error_kind(kind);
        self.cost.add(super::ERROR_OFFSET + priority, 1);
        self.errors.push(atom);
    }

    pub fn children(&self, id: NodeId) -> impl Iterator<Item = &Edge> + '_ {
        self.edges.iter().filter(move |e| e.parent == id)
    }

    pub fn parents(&self, id: NodeId) -> impl Iterator<Item = &Edge> + '_ {
        self.edges.iter().filter(move |e| e.child == id)
    }

    pub fn descendants(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(move |(_, node)| node.ancestors.contains(&id))
            .map(|(idx, _)| idx)
    }

    /// The node of `package` in any of the given sets.
    pub fn member_of(&self, package: &str, sets: &BTreeSet<SetKey>) -> Result<Option<NodeId>, HardFail> {
        let found: BTreeSet<NodeId> = sets
            .iter()
            .filter_map(|key| self.sets.get(key)?.members.get(package).copied())
            .collect();
        match found.len() {
            0 => Ok(None),
            1 => Ok(found.into_iter().next()),
            _ => Err(HardFail::new(format!("two nodes of '{package}' must be unified"))),
        }
    }

    /// The provider of `virtual_name` in any of the given sets.
    pub fn provider_in(&self, virtual_name: &str, sets: &BTreeSet<SetKey>) -> Result<Option<NodeId>, HardFail> {
        let found: BTreeSet<NodeId> = sets
            .iter()
            .filter_map(|key| self.sets.get(key)?.providers.get(virtual_name).copied())
            .collect();
        match found.len() {
            0 => Ok(None),
            1 => Ok(found.into_iter().next()),
            _ => Err(HardFail::new(format!(
                "two providers of '{virtual_name}' must be unified"
            ))),
        }
    }

    /// Adds a node, and everything it links or runs, to a unification set.
    pub fn join_set(&mut self, id: NodeId, key: &SetKey) -> Result<(), HardFail> {
        let mut pending = vec![id];
        while let Some(current) = pending.pop() {
            if !self.nodes[current].sets.insert(key.clone()) {
                continue;
            }
            let package = self.nodes[current].package.clone();
            let provides: Vec<Name> = self.nodes[current].provides.keys().cloned().collect();
            let set = self.sets.entry(key.clone()).or_default();
            match set.members.get(&package) {
                Some(&other) if other != current => {
                    return Err(HardFail::new(format!(
                        "'{package}' appears twice in one configuration"
                    )))
                }
                _ => {
                    set.members.insert(package, current);
                }
            }
            for virtual_name in provides {
                match set.providers.get(&virtual_name) {
                    Some(&other) if other != current => {
                        return Err(HardFail::new(format!(
                            "'{virtual_name}' has two providers in one configuration"
                        )))
                    }
                    _ => {
                        set.providers.insert(virtual_name, current);
                    }
                }
            }
            pending.extend(
                self.children(current)
                    .filter(|e| e.types.intersects(DepTypes::LINK_RUN))
                    .map(|e| e.child),
            );
        }
        Ok(())
    }

    /// Records that `child` provides `virtual_name` in all of its sets.
    pub fn add_provider(&mut self, child: NodeId, virtual_name: &Name, cause: Option<Cause>) -> Result<(), HardFail> {
        self.nodes[child]
            .provides
            .entry(virtual_name.clone())
            .or_insert(cause);
        let keys: Vec<SetKey> = self.nodes[child].sets.iter().cloned().collect();
        for key in keys {
            let set = self.sets.entry(key).or_default();
            match set.providers.get(virtual_name) {
                Some(&other) if other != child => {
                    return Err(HardFail::new(format!(
                        "'{virtual_name}' has two providers in one configuration"
                    )))
                }
                _ => {
                    set.providers.insert(virtual_name.clone(), child);
                }
            }
        }
        Ok(())
    }

    /// Makes `parent` and its ancestors ancestors of `child` and its descendants. Returns the
    /// `(node, ancestor)` pairs that are new.
    pub fn link_ancestry(&mut self, parent: NodeId, child: NodeId) -> Result<Vec<(NodeId, NodeId)>, HardFail> {
        if parent == child || self.nodes[parent].ancestors.contains(&child) {
            return Err(HardFail::new(format!(
                "'{}' would depend on itself",
                self.nodes[child].package
            )));
        }
        let mut upper: BTreeSet<NodeId> = self.nodes[parent].ancestors.clone();
        upper.insert(parent);
        let mut lower: Vec<NodeId> = self.descendants(child).collect();
        lower.push(child);

        let mut added = Vec::new();
        for &node in &lower {
            for &ancestor in &upper {
                if self.nodes[node].ancestors.insert(ancestor) {
                    added.push((node, ancestor));
                }
            }
        }
        Ok(added)
    }

    pub fn clause_holds(&self, problem: &Problem, id: NodeId, clause: &Symbol) -> bool {
        node_satisfies(problem, &self.nodes[id], clause)
    }

    /// Returns true if all clauses hold on some node below `anchor` that answers to `package`.
    pub fn group_holds_below(&self, problem: &Problem, anchor: NodeId, package: &str, clauses: &[Symbol]) -> bool {
        self.descendants(anchor).any(|d| {
            self.nodes[d].answers_to(package)
                && clauses.iter().all(|c| self.clause_holds(problem, d, c))
        })
    }

    /// Evaluates the trigger of a condition owned by the package of `id`. Returns `None` if the
    /// condition is unknown.
    pub fn condition_holds(&self, problem: &Problem, condition: i64, id: NodeId) -> Option<bool> {
        let cond = problem.condition(condition)?;
        Some(
            cond.local.iter().all(|c| self.clause_holds(problem, id, c))
                && cond
                    .nonlocal
                    .iter()
                    .all(|(package, clauses)| self.group_holds_below(problem, id, package, clauses)),
        )
    }
}

/// Evaluates a single clause on a node. Clauses about another package never hold.
pub(crate) fn node_satisfies(problem: &Problem, node: &Node, clause: &Symbol) -> bool {
    let Some((name, arity)) = clause.signature() else {
        return false;
    };
    let Some(subject) = clause.str_arg(0) else {
        return false;
    };
    if name == "depends_on" {
        return true;
    }
    if problem.is_virtual(subject) {
        return match name {
            "node" | "virtual_node" | "virtual_root" => node.provides.contains_key(subject),
            "node_version_satisfies" => clause.str_arg(1).is_some_and(|constraint| {
                provided_version_satisfies(problem, node, subject, constraint)
            }),
            _ => false,
        };
    }
    if node.package.as_ref() != subject {
        return false;
    }
    let arg = |idx: usize| clause.str_arg(idx).unwrap_or_default();
    let pkg = problem.packages.get(subject);
    match (name, arity) {
        ("node", 1) => true,
        ("root", 1) => node.root,
        ("namespace", 2) => pkg
            .and_then(|p| p.namespace.as_deref())
            .is_some_and(|ns| ns == arg(1)),
        ("node_version_satisfies", 2) => match (&node.version, pkg) {
            (Some(version), Some(pkg)) => pkg.satisfies(arg(1), version),
            _ => false,
        },
        ("variant_value", 3) => node
            .variants
            .get(arg(1))
            .is_some_and(|values| values.iter().any(|v| v.as_ref() == arg(2))),
        ("node_compiler", 2) => node
            .compiler
            .as_ref()
            .is_some_and(|(n, _)| n.as_ref() == arg(1)),
        ("node_compiler_version_satisfies", 3) => node.compiler.as_ref().is_some_and(|(n, v)| {
            n.as_ref() == arg(1) && problem.compiler_satisfies(n, arg(2), v)
        }),
        ("node_platform", 2) => node.platform.as_deref() == Some(arg(1)),
        ("node_os", 2) => node.os.as_deref() == Some(arg(1)),
        ("node_target", 2) => node.target.as_deref() == Some(arg(1)),
        ("node_flag", 3 | 5) => node.has_flag(arg(1), arg(2)),
        ("node_flag_propagate", 3 | 5) => node
            .flags
            .iter()
            .any(|f| f.propagate && f.ty.as_ref() == arg(1) && f.flag.as_ref() == arg(2)),
        ("hash", 2) => node.origin == Origin::Reuse(Name::from(arg(1))),
        _ => false,
    }
}

fn provided_version_satisfies(problem: &Problem, node: &Node, virtual_name: &str, constraint: &str) -> bool {
    let Some(pkg) = problem.packages.get(&node.package) else {
        return false;
    };
    node.held_providers
        .iter()
        .filter(|(v, _)| v.as_ref() == virtual_name)
        .any(|(_, condition)| {
            pkg.virtual_satisfies
                .contains(&(*condition, Name::from(constraint)))
        })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::Cost;

    fn cost(entries: &[(i64, i64)]) -> Cost {
        let mut cost = Cost(BTreeMap::new());
        for &(priority, value) in entries {
            cost.add(priority, value);
        }
        cost
    }

    #[test]
    fn test_cost_is_lexicographic() {
        assert!(cost(&[(100, 1)]) > cost(&[(50, 7), (10, 3)]));
        assert!(cost(&[(100, 1), (10, 1)]) < cost(&[(100, 1), (20, 1)]));
        assert_eq!(cost(&[(5, 0)]), cost(&[]));
    }
}
