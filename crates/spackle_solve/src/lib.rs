#![deny(missing_docs)]

//! `spackle_solve` turns abstract package specs into concrete dependency graphs.
//!
//! A [`Solver`] combines a [`PackageRepository`], the merged [`SiteConfig`] and any number of
//! [`SpecSource`]s holding already concrete specs. Every solve generates a fresh logic program
//! from these inputs, hands it to a [`LogicEngine`](engine::LogicEngine) together with the fixed
//! rule base and builds concrete specs from the best model. When no valid model exists the
//! failure is explained as a [`SolveError::Unsatisfiable`] listing the violated constraints and
//! their causes.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Write,
    sync::Arc,
};

use spackle_config::{config::concretizer::UnifyMode, SiteConfig};
use spackle_types::{PackageRepository, Spec};

pub mod engine;
pub mod error;
pub mod reuse;
pub mod rules;

mod builder;
mod counter;
mod driver;
mod explain;
mod setup;

pub use counter::BUILD_TOOLS_TAG;
pub use error::{
    InputError, InternalSolverError, SolveError, UnsatisfiableSpecError, BUG_REPORT_URL,
};
pub use reuse::{InMemoryStore, SpecSource};

use crate::{
    builder::SpecBuilder,
    counter::TestScope,
    driver::{Driver, DriverOutcome},
    engine::{
        native::{BUILD_OFFSET, ERROR_OFFSET},
        LogicEngine, Model, NativeEngine,
    },
    setup::SetupInput,
};

/// Which test dependencies take part in a solve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TestDependencies {
    /// Test dependencies are ignored.
    #[default]
    None,
    /// Test dependencies of the requested specs are solved for.
    Roots,
    /// Test dependencies of every package are solved for.
    All,
}

impl TestDependencies {
    fn scope(self, specs: &[Spec]) -> TestScope {
        match self {
            TestDependencies::None => TestScope::default(),
            TestDependencies::Roots => TestScope {
                all: false,
                packages: specs.iter().filter_map(|s| s.name.clone()).collect(),
            },
            TestDependencies::All => TestScope {
                all: true,
                packages: BTreeSet::new(),
            },
        }
    }
}

/// Options for a single call into the [`Solver`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SolveOptions {
    /// Which test dependencies to include.
    pub tests: TestDependencies,
}

/// Whether a criterion is compared for every node or only for nodes of a given origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum CriterionKind {
    /// A criterion that applies to the whole solution.
    Fixed,
    /// The part of a per-node criterion contributed by nodes that are built.
    Built,
    /// The part of a per-node criterion contributed by reused nodes.
    Reused,
}

/// One entry of the cost vector of a solution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Criterion {
    /// The priority. Higher priorities are minimized first.
    pub priority: i64,
    /// What is being minimized.
    pub name: String,
    /// The cost of the solution for this criterion.
    pub value: i64,
    /// Which nodes the criterion was evaluated on.
    pub kind: CriterionKind,
}

/// The result of a successful solve.
#[derive(Debug, Clone, Default)]
pub struct SolveResult {
    /// Every solved request together with its concrete spec, in request order.
    pub specs: Vec<(Spec, Arc<Spec>)>,
    /// Requests that were left unsolved. Only a round of [`Solver::solve_in_rounds`] leaves
    /// requests unsolved.
    pub unsolved: Vec<Spec>,
    /// The cost vector of the solution, highest priority first.
    pub criteria: Vec<Criterion>,
    /// The number of models the engine looked at.
    pub models_examined: u64,
    /// False if the search stopped at the configured limit before it could prove optimality.
    pub optimal: bool,
}

impl SolveResult {
    /// Iterates over the concrete specs in request order.
    pub fn concrete_specs(&self) -> impl Iterator<Item = &Arc<Spec>> + '_ {
        self.specs.iter().map(|(_, concrete)| concrete)
    }

    /// Returns the concrete spec of a request.
    pub fn get(&self, request: &Spec) -> Option<&Arc<Spec>> {
        self.specs
            .iter()
            .find(|(spec, _)| spec == request)
            .map(|(_, concrete)| concrete)
    }

    /// Formats the cost vector as a table.
    pub fn format_costs(&self) -> String {
        let rows: Vec<(i64, String, i64)> = self
            .criteria
            .iter()
            .map(|criterion| {
                let name = match criterion.kind {
                    CriterionKind::Fixed => criterion.name.clone(),
                    kind => format!("{} ({kind})", criterion.name),
                };
                (criterion.priority, name, criterion.value)
            })
            .collect();
        let width = rows
            .iter()
            .map(|(_, name, _)| name.len())
            .max()
            .unwrap_or(0)
            .max("Criterion".len());
        let mut table = format!("{:>8}  {:<width$}  {:>5}\n", "Priority", "Criterion", "Value");
        for (priority, name, value) in rows {
            let _ = writeln!(table, "{priority:>8}  {name:<width$}  {value:>5}");
        }
        table
    }
}

/// Names the entries of the cost vector of a model. Error priorities are left out.
fn criteria(model: &Model) -> Vec<Criterion> {
    let mut names = BTreeMap::new();
    for atom in model.atoms_named("opt_criterion", 2) {
        if let (Some(priority), Some(name)) = (atom.num_arg(0), atom.str_arg(1)) {
            names.insert(priority, (name.to_string(), CriterionKind::Fixed));
        }
    }
    for atom in model.atoms_named("build_criterion", 2) {
        if let (Some(priority), Some(name)) = (atom.num_arg(0), atom.str_arg(1)) {
            names.insert(priority + BUILD_OFFSET, (name.to_string(), CriterionKind::Built));
            names.insert(priority, (name.to_string(), CriterionKind::Reused));
        }
    }
    model
        .cost
        .iter()
        .filter(|(priority, _)| *priority < ERROR_OFFSET)
        .filter_map(|(priority, value)| {
            let (name, kind) = names.get(priority)?;
            Some(Criterion {
                priority: *priority,
                name: name.clone(),
                value: *value,
                kind: *kind,
            })
        })
        .collect()
}

type EngineFactory<'a> = Box<dyn Fn() -> Box<dyn LogicEngine> + 'a>;

/// Concretizes abstract specs against a package repository and a site configuration.
///
/// A solver holds no state between solves. Every call builds a new problem and a new engine,
/// so the same solver can be used for any number of independent requests.
pub struct Solver<'a, R: ?Sized> {
    repository: &'a R,
    config: &'a SiteConfig,
    sources: Vec<Arc<dyn SpecSource>>,
    engine: EngineFactory<'a>,
}

impl<'a, R: PackageRepository + ?Sized> Solver<'a, R> {
    /// Creates a solver that uses the built-in [`NativeEngine`].
    pub fn new(repository: &'a R, config: &'a SiteConfig) -> Self {
        let limit = config.concretizer.search_limit;
        Self {
            repository,
            config,
            sources: Vec::new(),
            engine: Box::new(move || Box::new(NativeEngine::with_search_limit(limit))),
        }
    }

    /// Adds a source of concrete specs that may be reused.
    pub fn with_source(mut self, source: Arc<dyn SpecSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Replaces the logic engine. The factory is called once per solve.
    pub fn with_engine(mut self, factory: impl Fn() -> Box<dyn LogicEngine> + 'a) -> Self {
        self.engine = Box::new(factory);
        self
    }

    /// Concretizes all specs together. Every package appears at most once in the solution
    /// unless the duplicate strategy allows otherwise.
    pub fn solve(&self, specs: &[Spec], options: &SolveOptions) -> Result<SolveResult, SolveError> {
        self.solve_with(specs, options, &[], false)
    }

    /// Concretizes as many of the specs together as possible, then solves the remaining ones in
    /// further rounds that may reuse the results of the earlier rounds. Returns one result per
    /// round.
    pub fn solve_in_rounds(
        &self,
        specs: &[Spec],
        options: &SolveOptions,
    ) -> Result<Vec<SolveResult>, SolveError> {
        let span = tracing::info_span!("solve_in_rounds", specs = specs.len());
        let _enter = span.enter();

        let mut remaining = specs.to_vec();
        let mut solved: Vec<Arc<Spec>> = Vec::new();
        let mut rounds = Vec::new();
        while !remaining.is_empty() {
            let result = self.solve_with(&remaining, options, &solved, true)?;
            if result.specs.is_empty() {
                let unsolved = remaining.iter().map(ToString::to_string).collect::<Vec<_>>();
                tracing::error!(
                    "round {} made no progress on {}",
                    rounds.len(),
                    unsolved.join(", ")
                );
                return Err(SolveError::Internal(
                    InternalSolverError::new("the concretizer made no progress in a round")
                        .with_reason(format!("unsolved: {}", unsolved.join(", "))),
                ));
            }
            tracing::debug!(
                "round {} solved {} specs, {} remain",
                rounds.len(),
                result.specs.len(),
                result.unsolved.len()
            );
            solved.extend(result.concrete_specs().cloned());
            remaining = result.unsolved.clone();
            rounds.push(result);
        }
        Ok(rounds)
    }

    /// Concretizes the specs according to `concretizer.unify`.
    pub fn concretize(
        &self,
        specs: &[Spec],
        options: &SolveOptions,
    ) -> Result<Vec<SolveResult>, SolveError> {
        match self.config.concretizer.unify() {
            UnifyMode::Together => Ok(vec![self.solve(specs, options)?]),
            UnifyMode::Separately => specs
                .iter()
                .map(|spec| self.solve(std::slice::from_ref(spec), options))
                .collect(),
            UnifyMode::WhenPossible => self.solve_in_rounds(specs, options),
        }
    }

    fn solve_with(
        &self,
        specs: &[Spec],
        options: &SolveOptions,
        extra_reusable: &[Arc<Spec>],
        optional_literals: bool,
    ) -> Result<SolveResult, SolveError> {
        let span = tracing::info_span!("solve", specs = specs.len());
        let _enter = span.enter();

        let mut reusable = reuse::reusable_specs(self.config, &self.sources)?;
        let mut hashes: BTreeSet<String> = reusable
            .iter()
            .filter_map(|s| s.dag_hash().map(str::to_string))
            .collect();
        for spec in extra_reusable {
            if let Some(hash) = spec.dag_hash() {
                if hashes.insert(hash.to_string()) {
                    reusable.push(spec.clone());
                }
            }
        }

        let tests = options.tests.scope(specs);
        let runtimes: Vec<String> = self
            .config
            .compilers
            .iter()
            .filter_map(|c| c.runtime.clone())
            .collect();
        let graph = counter::possible_graph(self.repository, self.config, specs, &runtimes, &tests)?;

        let mut driver = Driver::new((self.engine)());
        driver.begin_setup()?;
        let problem = setup::setup(SetupInput {
            repository: self.repository,
            config: self.config,
            specs,
            reusable: &reusable,
            graph,
            tests: &tests,
            optional_literals,
        })?;
        driver.load(&problem, optional_literals)?;
        driver.ground()?;

        let header = format!(
            "cannot concretize {}",
            specs.iter().map(|s| format!("'{s}'")).collect::<Vec<_>>().join(", ")
        );
        let model = match driver.search()? {
            DriverOutcome::Satisfiable(model) => model,
            DriverOutcome::Unsatisfiable {
                model: Some(model), ..
            } => return Err(explain::explain_model(&model, &header)),
            DriverOutcome::Unsatisfiable { model: None, core } => {
                let core = driver.minimize_core(&core)?;
                return Err(explain::explain_core(&core, &problem.literals, &header));
            }
        };

        let reconstruction =
            SpecBuilder::new(self.repository, self.config, &problem).build(&model, &reusable)?;
        if !optional_literals && !reconstruction.unsolved.is_empty() {
            return Err(SolveError::internal(
                "the solver returned a model that leaves requests unsolved",
                format!("{} requests have no root", reconstruction.unsolved.len()),
            ));
        }

        let mut result = SolveResult {
            criteria: criteria(&model),
            models_examined: model.models_examined,
            optimal: model.optimal,
            ..SolveResult::default()
        };
        for (idx, literal) in problem.literals.iter().enumerate() {
            match reconstruction.roots.get(&idx) {
                Some(concrete) => result.specs.push((literal.clone(), concrete.clone())),
                None => result.unsolved.push(literal.clone()),
            }
        }
        tracing::debug!(
            "concretized {} specs into {} nodes",
            result.specs.len(),
            reconstruction.nodes
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::{criteria, Criterion, CriterionKind, SolveResult};
    use crate::{engine::Model, sym};

    #[test]
    fn test_criteria_names_and_offsets() {
        let model = Model {
            atoms: vec![
                sym!("opt_criterion", 105i64, "number of packages to build (vs. reuse)"),
                sym!("build_criterion", 20i64, "version badness"),
            ],
            cost: vec![(10_070, 1), (220, 2), (105, 3), (20, 0)],
            optimal: true,
            models_examined: 4,
        };
        let names: Vec<(i64, CriterionKind)> =
            criteria(&model).iter().map(|c| (c.priority, c.kind)).collect();
        assert_eq!(
            names,
            vec![
                (220, CriterionKind::Built),
                (105, CriterionKind::Fixed),
                (20, CriterionKind::Reused)
            ]
        );
    }

    #[test]
    fn test_format_costs() {
        let criterion = |priority, name: &str, value, kind| Criterion {
            priority,
            name: name.to_string(),
            value,
            kind,
        };
        let result = SolveResult {
            criteria: vec![
                criterion(320, "number of input specs not concretized", 0, CriterionKind::Fixed),
                criterion(220, "version badness", 1, CriterionKind::Built),
                criterion(20, "version badness", 0, CriterionKind::Reused),
            ],
            ..SolveResult::default()
        };
        insta::assert_snapshot!(result.format_costs(), @r###"
        Priority  Criterion                              Value
             320  number of input specs not concretized      0
             220  version badness (built)                    1
              20  version badness (reused)                   0
        "###);
    }
}
