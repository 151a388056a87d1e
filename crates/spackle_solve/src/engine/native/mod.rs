//! A logic engine specialized to concretization programs.
//!
//! Rules are grounded bottom-up. If the grounded facts contain input literals, the concretization
//! tables are compiled from them and searched for the cheapest model. Otherwise the program is a
//! plain query and its single model consists of the grounded facts.

use std::collections::{BTreeSet, HashSet};

use super::{
    datalog::{self, FactBase},
    program::{parse_program, Rule, Statement},
    EngineError, GroundingStats, LogicEngine, Model, SolveOutcome, Symbol,
};
use crate::sym;

mod problem;
mod search;
mod state;

use problem::Problem;
use search::Search;
use state::{Cause, NodeId, State};

/// Cost priorities of attributes of built nodes are shifted by this amount so that they are
/// always compared before those of reused nodes.
pub(crate) const BUILD_OFFSET: i64 = 200;

/// Cost priorities of errors are shifted by this amount so that any error outweighs every
/// optimization criterion.
pub(crate) const ERROR_OFFSET: i64 = 10_000;

/// The engine that ships with the crate.
#[derive(Debug, Default)]
pub struct NativeEngine {
    facts: FactBase,
    rules: Vec<Rule>,
    shows: Option<HashSet<(String, usize)>>,
    assumptions: BTreeSet<Symbol>,
    grounded: bool,
    model_limit: Option<u64>,
    problem: Option<Problem>,
}

impl NativeEngine {
    /// Creates an engine that stops after examining `limit` complete models.
    pub fn with_search_limit(limit: Option<u64>) -> Self {
        Self {
            model_limit: limit,
            ..Default::default()
        }
    }

    fn is_shown(&self, atom: &Symbol) -> bool {
        match (&self.shows, atom.signature()) {
            (None, _) => true,
            (Some(shows), Some((name, arity))) => shows.contains(&(name.to_string(), arity)),
            (Some(_), None) => false,
        }
    }

    fn shown_facts(&self) -> Vec<Symbol> {
        self.facts
            .iter()
            .filter(|atom| self.is_shown(atom))
            .cloned()
            .collect()
    }
}

impl LogicEngine for NativeEngine {
    fn add_program(&mut self, name: &str, text: &str) -> Result<(), EngineError> {
        if self.grounded {
            return Err(EngineError::AlreadyGrounded(name.to_string()));
        }
        for statement in parse_program(name, text)? {
            match statement {
                Statement::Fact(fact) => {
                    self.facts.insert(fact);
                }
                Statement::Rule(rule) => self.rules.push(rule),
                Statement::Show(predicate, arity) => {
                    self.shows
                        .get_or_insert_with(HashSet::new)
                        .insert((predicate, arity));
                }
            }
        }
        Ok(())
    }

    fn declare_assumption(&mut self, assumption: Symbol) -> Result<(), EngineError> {
        self.assumptions.insert(assumption);
        Ok(())
    }

    fn ground(&mut self) -> Result<GroundingStats, EngineError> {
        if self.grounded {
            return Err(EngineError::AlreadyGrounded("<ground>".to_string()));
        }
        let facts = self.facts.len();
        let derived = datalog::ground(&mut self.facts, &self.rules);
        self.grounded = true;
        tracing::debug!("grounded {facts} facts into {} atoms", facts + derived);
        Ok(GroundingStats { facts, derived })
    }

    fn solve(&mut self, assumptions: &[Symbol]) -> Result<SolveOutcome, EngineError> {
        if !self.grounded {
            return Err(EngineError::NotGrounded);
        }
        if let Some(undeclared) = assumptions.iter().find(|a| !self.assumptions.contains(*a)) {
            return Err(EngineError::UndeclaredAssumption(undeclared.to_string()));
        }
        if !Problem::is_concretization(&self.facts) {
            return Ok(SolveOutcome::Satisfiable(Model {
                atoms: self.shown_facts(),
                cost: Vec::new(),
                optimal: true,
                models_examined: 1,
            }));
        }

        if self.problem.is_none() {
            self.problem = Some(Problem::compile(&self.facts)?);
        }
        let Some(problem) = self.problem.as_ref() else {
            return Err(EngineError::NotGrounded);
        };

        let active: BTreeSet<i64> = assumptions
            .iter()
            .filter(|a| a.is("literal", 1))
            .filter_map(|a| a.num_arg(0))
            .collect();
        let result = Search::new(problem, active, self.model_limit).run();
        tracing::debug!(
            "examined {} models in {} steps",
            result.models,
            result.expansions
        );
        match result.best {
            Some(state) => {
                let mut atoms = self.shown_facts();
                atoms.extend(model_atoms(problem, &state).into_iter().filter(|a| self.is_shown(a)));
                Ok(SolveOutcome::Satisfiable(Model {
                    atoms,
                    cost: model_cost(problem, &state),
                    optimal: result.optimal,
                    models_examined: result.models,
                }))
            }
            None if !result.optimal => Err(EngineError::SearchLimit(result.expansions)),
            None => Ok(SolveOutcome::Unsatisfiable {
                core: assumptions.to_vec(),
            }),
        }
    }
}

fn node_symbol(state: &State, id: NodeId) -> Symbol {
    let node = &state.nodes[id];
    sym!("node", node.dup, node.package.as_ref())
}

fn cause_symbol(state: &State, cause: &Cause) -> Symbol {
    Symbol::tuple(vec![
        Symbol::from(cause.condition),
        node_symbol(state, cause.node),
    ])
}

/// The atoms describing a complete assignment.
fn model_atoms(problem: &Problem, state: &State) -> Vec<Symbol> {
    let mut atoms = Vec::new();
    let attr = |name: &str, args: Vec<Symbol>| {
        let mut all = vec![Symbol::from(name)];
        all.extend(args);
        Symbol::function("attr", all)
    };

    for (id, node) in state.nodes.iter().enumerate() {
        let n = node_symbol(state, id);
        atoms.push(attr("node", vec![n.clone()]));
        if node.root {
            atoms.push(attr("root", vec![n.clone()]));
        }
        let pkg = problem.packages.get(&node.package);
        if let Some(namespace) = pkg.and_then(|p| p.namespace.as_ref()) {
            atoms.push(attr("namespace", vec![n.clone(), Symbol::from(namespace.as_ref())]));
        }
        if let Some(version) = &node.version {
            atoms.push(attr("version", vec![n.clone(), Symbol::from(version.as_ref())]));
            if pkg.is_some_and(|p| p.deprecated.contains(version)) {
                atoms.push(attr("deprecated", vec![n.clone(), Symbol::from(version.as_ref())]));
            }
        }
        for (key, value) in [
            ("node_platform", &node.platform),
            ("node_os", &node.os),
            ("node_target", &node.target),
        ] {
            if let Some(value) = value {
                atoms.push(attr(key, vec![n.clone(), Symbol::from(value.as_ref())]));
            }
        }
        if let Some((name, version)) = &node.compiler {
            atoms.push(attr(
                "node_compiler_version",
                vec![n.clone(), Symbol::from(name.as_ref()), Symbol::from(version.as_ref())],
            ));
        }
        for (name, values) in &node.variants {
            for value in values {
                atoms.push(attr(
                    "variant_value",
                    vec![n.clone(), Symbol::from(name.as_ref()), Symbol::from(value.as_ref())],
                ));
            }
        }
        for flag in &node.flags {
            atoms.push(attr(
                "node_flag",
                vec![
                    n.clone(),
                    Symbol::from(flag.ty.as_ref()),
                    Symbol::from(flag.flag.as_ref()),
                    Symbol::from(flag.source.as_ref()),
                ],
            ));
            if flag.propagate {
                atoms.push(attr(
                    "node_flag_propagate",
                    vec![n.clone(), Symbol::from(flag.ty.as_ref()), Symbol::from(flag.flag.as_ref())],
                ));
            }
        }
        match &node.origin {
            state::Origin::Build => atoms.push(attr("build", vec![n.clone()])),
            state::Origin::Reuse(hash) => {
                atoms.push(attr("hash", vec![n.clone(), Symbol::from(hash.as_ref())]));
            }
            state::Origin::External(index) => {
                atoms.push(attr("external_spec_selected", vec![n.clone(), Symbol::from(*index)]));
            }
            state::Origin::Undecided => {}
        }
        for imposition in &node.impositions {
            if let Some(cause) = &imposition.cause {
                atoms.push(sym!(
                    "imposed_on",
                    cause.condition,
                    node_symbol(state, cause.node),
                    n.clone(),
                    imposition.clause.clone()
                ));
            }
        }
    }

    for edge in &state.edges {
        let parent = node_symbol(state, edge.parent);
        let child = node_symbol(state, edge.child);
        for ty in edge.types.iter() {
            atoms.push(attr(
                "depends_on",
                vec![parent.clone(), child.clone(), Symbol::from(ty.as_ref())],
            ));
        }
        for virtual_name in &edge.virtuals {
            atoms.push(attr(
                "virtual_on_edge",
                vec![parent.clone(), child.clone(), Symbol::from(virtual_name.as_ref())],
            ));
        }
    }

    for (index, id) in &state.literal_roots {
        atoms.push(sym!("literal_root", *index, node_symbol(state, *id)));
        atoms.push(sym!("solved_literal", *index));
    }
    for (condition, id) in &state.holds {
        atoms.push(sym!("condition_holds", *condition, node_symbol(state, *id)));
    }
    for error in &state.errors {
        atoms.push(error_symbol(problem, state, error));
    }
    atoms
}

/// `error(Priority, Template, Args, Causes)` where causes are `(Condition, Node)` pairs.
fn error_symbol(problem: &Problem, state: &State, error: &state::ErrorAtom) -> Symbol {
    let (priority, template) = problem.error_kind(&error.kind);
    let args = Symbol::tuple(
        error
            .args
            .iter()
            .map(|arg| Symbol::from(arg.as_str()))
            .collect::<Vec<_>>(),
    );
    let causes = Symbol::tuple(
        error
            .causes
            .iter()
            .map(|cause| cause_symbol(state, cause))
            .collect::<Vec<_>>(),
    );
    sym!("error", priority, template.as_ref(), args, causes)
}

/// The cost vector of a model: every declared criterion, highest priority first, followed by
/// the error priorities in use.
fn model_cost(problem: &Problem, state: &State) -> Vec<(i64, i64)> {
    let mut priorities: BTreeSet<i64> = problem.criteria.iter().map(|(p, _)| *p).collect();
    for (priority, _) in &problem.build_criteria {
        priorities.insert(*priority);
        priorities.insert(priority + BUILD_OFFSET);
    }
    priorities.extend(state.cost.priorities());
    priorities
        .into_iter()
        .rev()
        .map(|priority| (priority, state.cost.get(priority)))
        .collect()
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::NativeEngine;
    use crate::engine::{EngineError, LogicEngine, SolveOutcome};

    #[test]
    fn test_plain_query() {
        let mut engine = NativeEngine::default();
        engine
            .add_program(
                "query",
                r#"
                edge("a", "b"). edge("b", "c").
                path(X, Y) :- edge(X, Y).
                path(X, Z) :- path(X, Y), edge(Y, Z).
                #show path/2.
                "#,
            )
            .unwrap();
        assert_matches!(engine.solve(&[]), Err(EngineError::NotGrounded));
        let stats = engine.ground().unwrap();
        assert_eq!(stats.facts, 2);
        assert_eq!(stats.derived, 3);
        let SolveOutcome::Satisfiable(model) = engine.solve(&[]).unwrap() else {
            panic!("expected a model");
        };
        assert_eq!(model.atoms_named("path", 2).count(), 3);
        assert_eq!(model.atoms_named("edge", 2).count(), 0);
    }

    #[test]
    fn test_assumptions_must_be_declared() {
        let mut engine = NativeEngine::default();
        engine.add_program("empty", "a.").unwrap();
        engine.ground().unwrap();
        let literal = crate::sym!("literal", 0i64);
        assert_matches!(
            engine.solve(&[literal.clone()]),
            Err(EngineError::UndeclaredAssumption(_))
        );
        engine.declare_assumption(literal.clone()).unwrap();
        assert_matches!(engine.solve(&[literal]), Ok(SolveOutcome::Satisfiable(_)));
        assert_matches!(
            engine.add_program("late", "b."),
            Err(EngineError::AlreadyGrounded(_))
        );
    }

    #[test]
    fn test_concretization_program() {
        let mut engine = NativeEngine::default();
        engine
            .add_program(
                "problem",
                r#"
                error_message("imposition", 20, "'{0}' cannot satisfy '{1}'").
                opt_criterion(105, "number of packages to build (vs. reuse)").
                build_criterion(20, "version badness").
                origin_preference("reuse", 0). origin_preference("external", 1).
                origin_preference("build", 2).
                os("linux", 0). target("x86_64", 0). host_platform("linux").

                pkg_fact("app", version_declared("1.0", 0, "package_py")).
                pkg_fact("zlib", version_declared("1.3", 0, "package_py")).
                pkg_fact("zlib", version_declared("1.2", 1, "package_py")).
                pkg_fact("zlib", version_satisfies("1.2", "1.2")).
                pkg_fact("app", dependency_condition(1, "zlib")).
                condition_trigger(1, 1). trigger_clause(1, node("app")).
                condition_effect(1, 1). effect_clause(1, node("zlib")).
                effect_clause(1, node_version_satisfies("zlib", "1.2")).
                effect_clause(1, depends_on("app", "zlib", "build,link")).

                literal(0, 2).
                condition_trigger(2, 2). trigger_clause(2, node("app")).
                condition_effect(2, 2). effect_clause(2, root("app")). effect_clause(2, node("app")).
                "#,
            )
            .unwrap();
        let literal = crate::sym!("literal", 0i64);
        engine.declare_assumption(literal.clone()).unwrap();
        engine.ground().unwrap();
        let SolveOutcome::Satisfiable(model) = engine.solve(&[literal]).unwrap() else {
            panic!("expected a model");
        };
        let versions: Vec<String> = model
            .atoms_named("attr", 3)
            .filter(|a| a.str_arg(0) == Some("version"))
            .map(ToString::to_string)
            .collect();
        assert_eq!(
            versions,
            vec![
                r#"attr("version",node(0,"app"),"1.0")"#,
                r#"attr("version",node(0,"zlib"),"1.2")"#,
            ]
        );
        assert!(model.optimal);
        assert_eq!(model.atoms_named("error", 4).count(), 0);
        // Two built packages; zlib uses its second best version.
        assert!(model.cost.contains(&(105, 2)));
        assert!(model.cost.contains(&(220, 1)));
    }
}
