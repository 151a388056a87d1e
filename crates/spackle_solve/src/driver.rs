//! Runs a generated problem through a [`LogicEngine`].
//!
//! A [`Driver`] is used for exactly one solve and moves through [`DriverState`] strictly in
//! order. After an unsatisfiable search it keeps the grounded engine so that the core can be
//! minimized on demand.

use crate::{
    engine::{EngineError, LogicEngine, Model, SolveOutcome, Symbol},
    error::SolveError,
    rules::solve_programs,
    setup::SolverProblem,
};

/// The phases of a single solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub(crate) enum DriverState {
    Idle,
    Setup,
    Loaded,
    Grounded,
    Searching,
    Satisfiable,
    Unsatisfiable,
}

/// What a search produced.
#[derive(Debug)]
pub(crate) enum DriverOutcome {
    /// A model without errors.
    Satisfiable(Model),
    /// Either the best model still carries errors, or no model exists at all. `core` holds the
    /// assumptions that were active.
    Unsatisfiable {
        model: Option<Model>,
        core: Vec<Symbol>,
    },
}

pub(crate) struct Driver {
    engine: Box<dyn LogicEngine>,
    state: DriverState,
    assumptions: Vec<Symbol>,
}

fn has_errors(model: &Model) -> bool {
    model.atoms_named("error", 4).next().is_some()
}

impl Driver {
    pub fn new(engine: Box<dyn LogicEngine>) -> Self {
        Self {
            engine,
            state: DriverState::Idle,
            assumptions: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> DriverState {
        self.state
    }

    fn transition(&mut self, from: DriverState, to: DriverState) -> Result<(), SolveError> {
        if self.state != from {
            return Err(SolveError::internal(
                "the solver driver was used out of order",
                format!("expected the driver to be {from} but it is {}", self.state),
            ));
        }
        tracing::trace!("driver {from} -> {to}");
        self.state = to;
        Ok(())
    }

    /// Marks the start of fact generation.
    pub fn begin_setup(&mut self) -> Result<(), SolveError> {
        self.transition(DriverState::Idle, DriverState::Setup)
    }

    /// Adds the generated facts together with the fixed rule files and declares the literals as
    /// assumptions.
    pub fn load(
        &mut self,
        problem: &SolverProblem,
        optional_literals: bool,
    ) -> Result<(), SolveError> {
        self.transition(DriverState::Setup, DriverState::Loaded)?;
        self.engine.add_program("problem.lp", &problem.text)?;
        for file in solve_programs(problem.has_libc, optional_literals) {
            self.engine.add_program(file.name, file.text)?;
        }
        self.assumptions = problem.assumptions();
        for assumption in &self.assumptions {
            self.engine.declare_assumption(assumption.clone())?;
        }
        tracing::debug!(
            "loaded {} facts and {} literals",
            problem.facts,
            self.assumptions.len()
        );
        Ok(())
    }

    pub fn ground(&mut self) -> Result<(), SolveError> {
        self.transition(DriverState::Loaded, DriverState::Grounded)?;
        let stats = self.engine.ground()?;
        tracing::debug!(
            "grounding derived {} atoms from {} facts",
            stats.derived,
            stats.facts
        );
        Ok(())
    }

    /// Searches for the best model with every literal active.
    pub fn search(&mut self) -> Result<DriverOutcome, SolveError> {
        self.transition(DriverState::Grounded, DriverState::Searching)?;
        let span = tracing::debug_span!("search", literals = self.assumptions.len());
        let _enter = span.enter();

        let assumptions = self.assumptions.clone();
        match self.engine.solve(&assumptions)? {
            SolveOutcome::Satisfiable(model) if !has_errors(&model) => {
                tracing::debug!(
                    "found a model with {} atoms after {} models (optimal: {})",
                    model.atoms.len(),
                    model.models_examined,
                    model.optimal
                );
                self.state = DriverState::Satisfiable;
                Ok(DriverOutcome::Satisfiable(model))
            }
            SolveOutcome::Satisfiable(model) => {
                tracing::debug!(
                    "the best model has {} errors",
                    model.atoms_named("error", 4).count()
                );
                self.state = DriverState::Unsatisfiable;
                Ok(DriverOutcome::Unsatisfiable {
                    model: Some(model),
                    core: assumptions,
                })
            }
            SolveOutcome::Unsatisfiable { core } => {
                tracing::debug!("no model exists, the core has {} assumptions", core.len());
                self.state = DriverState::Unsatisfiable;
                Ok(DriverOutcome::Unsatisfiable { model: None, core })
            }
        }
    }

    /// Returns true if the assumptions alone fail. A check that hits the search limit does not
    /// count as failing, so the assumption it tried to drop stays in the core.
    fn probe_fails(&mut self, assumptions: &[Symbol]) -> Result<bool, SolveError> {
        match self.engine.solve(assumptions) {
            Ok(SolveOutcome::Satisfiable(model)) => Ok(has_errors(&model)),
            Ok(SolveOutcome::Unsatisfiable { .. }) => Ok(true),
            Err(EngineError::SearchLimit(steps)) => {
                tracing::trace!("core probe stopped after {steps} steps");
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Shrinks an unsatisfiable core. An assumption is kept only if the core without it
    /// becomes satisfiable.
    pub fn minimize_core(&mut self, core: &[Symbol]) -> Result<Vec<Symbol>, SolveError> {
        if self.state != DriverState::Unsatisfiable {
            return Err(SolveError::internal(
                "cannot minimize a core",
                format!("the driver is {}", self.state),
            ));
        }
        let mut minimal = core.to_vec();
        let mut idx = 0;
        while idx < minimal.len() {
            let mut candidate = minimal.clone();
            let removed = candidate.remove(idx);
            if self.probe_fails(&candidate)? {
                tracing::trace!("{removed} is not needed in the core");
                minimal = candidate;
            } else {
                idx += 1;
            }
        }
        tracing::debug!("minimized a core of {} to {}", core.len(), minimal.len());
        Ok(minimal)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::{Driver, DriverOutcome, DriverState};
    use crate::{
        engine::{
            EngineError, GroundingStats, LogicEngine, Model, NativeEngine, SolveOutcome, Symbol,
        },
        error::SolveError,
        sym,
    };

    /// Fails whenever both `literal(0)` and `literal(1)` are active.
    #[derive(Default)]
    struct PairEngine;

    impl LogicEngine for PairEngine {
        fn add_program(&mut self, _name: &str, _text: &str) -> Result<(), EngineError> {
            Ok(())
        }

        fn declare_assumption(&mut self, _assumption: Symbol) -> Result<(), EngineError> {
            Ok(())
        }

        fn ground(&mut self) -> Result<GroundingStats, EngineError> {
            Ok(GroundingStats::default())
        }

        fn solve(&mut self, assumptions: &[Symbol]) -> Result<SolveOutcome, EngineError> {
            let active = |idx: usize| assumptions.contains(&sym!("literal", idx));
            if active(0) && active(1) {
                Ok(SolveOutcome::Unsatisfiable {
                    core: assumptions.to_vec(),
                })
            } else {
                Ok(SolveOutcome::Satisfiable(Model {
                    atoms: Vec::new(),
                    cost: Vec::new(),
                    optimal: true,
                    models_examined: 1,
                }))
            }
        }
    }

    #[test]
    fn test_states_are_sequential() {
        let mut driver = Driver::new(Box::new(NativeEngine::default()));
        assert_matches!(driver.ground(), Err(SolveError::Internal(_)));
        assert_eq!(driver.state(), DriverState::Idle);
        driver.begin_setup().unwrap();
        assert_eq!(driver.state(), DriverState::Setup);
        assert_matches!(driver.search(), Err(SolveError::Internal(_)));
    }

    #[test]
    fn test_minimize_core_keeps_only_needed_assumptions() {
        let mut driver = Driver::new(Box::new(PairEngine));
        driver.state = DriverState::Grounded;
        driver.assumptions = (0..4usize).map(|idx| sym!("literal", idx)).collect();
        let DriverOutcome::Unsatisfiable { model, core } = driver.search().unwrap() else {
            panic!("expected the search to fail");
        };
        assert!(model.is_none());
        let minimal = driver.minimize_core(&core).unwrap();
        assert_eq!(minimal, vec![sym!("literal", 0usize), sym!("literal", 1usize)]);
    }

    /// Reports the first assumption set as unsatisfiable and gives up on every later one.
    #[derive(Default)]
    struct ExhaustedEngine {
        calls: u64,
    }

    impl LogicEngine for ExhaustedEngine {
        fn add_program(&mut self, _name: &str, _text: &str) -> Result<(), EngineError> {
            Ok(())
        }

        fn declare_assumption(&mut self, _assumption: Symbol) -> Result<(), EngineError> {
            Ok(())
        }

        fn ground(&mut self) -> Result<GroundingStats, EngineError> {
            Ok(GroundingStats::default())
        }

        fn solve(&mut self, assumptions: &[Symbol]) -> Result<SolveOutcome, EngineError> {
            self.calls += 1;
            if self.calls == 1 {
                Ok(SolveOutcome::Unsatisfiable {
                    core: assumptions.to_vec(),
                })
            } else {
                Err(EngineError::SearchLimit(self.calls))
            }
        }
    }

    #[test]
    fn test_minimize_core_keeps_assumptions_when_the_search_stops() {
        let mut driver = Driver::new(Box::<ExhaustedEngine>::default());
        driver.state = DriverState::Grounded;
        driver.assumptions = (0..3usize).map(|idx| sym!("literal", idx)).collect();
        let DriverOutcome::Unsatisfiable { core, .. } = driver.search().unwrap() else {
            panic!("expected the search to fail");
        };
        let minimal = driver.minimize_core(&core).unwrap();
        assert_eq!(minimal, core);
    }
}
