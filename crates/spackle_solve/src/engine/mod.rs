//! The protocol between the concretizer and a logic engine.
//!
//! A problem is handed to an engine as program text: ground facts, Datalog rules without
//! negation and `#show` directives. The engine grounds the rules to a fixpoint, searches for the
//! best model under the optimization criteria the program declares and reports either a model or
//! an unsatisfiable core over the declared assumptions.

use thiserror::Error;

pub mod datalog;
pub mod native;
pub mod program;
mod symbol;

pub use native::NativeEngine;
pub use symbol::Symbol;

/// An error raised by a [`LogicEngine`]. These always indicate a bug in the program text or in
/// the engine, never a problem with the user's request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The program text could not be parsed.
    #[error("syntax error in '{program}' at line {line}: {message}")]
    Syntax {
        /// The name the program was added under.
        program: String,
        /// The 1-based line of the error.
        line: usize,
        /// What was expected.
        message: String,
    },

    /// A variable of a rule head does not occur in the rule body.
    #[error("unsafe rule in '{program}': variable {variable} does not occur in the body")]
    UnsafeRule {
        /// The name the program was added under.
        program: String,
        /// The offending variable.
        variable: String,
    },

    /// A fact does not have the shape its predicate requires.
    #[error("malformed fact '{fact}': {reason}")]
    MalformedFact {
        /// The fact as written.
        fact: String,
        /// What is wrong with it.
        reason: String,
    },

    /// An assumption was used in `solve` without being declared first.
    #[error("'{0}' was not declared as an assumption")]
    UndeclaredAssumption(String),

    /// `solve` was called before `ground`.
    #[error("the program must be grounded before solving")]
    NotGrounded,

    /// Programs were added after grounding.
    #[error("cannot add program '{0}' after grounding")]
    AlreadyGrounded(String),

    /// The search gave up before any model was found.
    #[error("the search stopped after {0} steps without finding a model")]
    SearchLimit(u64),
}

/// A model returned by [`LogicEngine::solve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Model {
    /// The shown atoms of the model, in a deterministic order.
    pub atoms: Vec<Symbol>,
    /// The cost of the model as `(priority, value)` pairs, highest priority first.
    pub cost: Vec<(i64, i64)>,
    /// True if the search proved that no better model exists.
    pub optimal: bool,
    /// The number of complete models the search examined.
    pub models_examined: u64,
}

impl Model {
    /// Iterates over the atoms with the given name and arity.
    pub fn atoms_named<'a>(
        &'a self,
        name: &'a str,
        arity: usize,
    ) -> impl Iterator<Item = &'a Symbol> + 'a {
        self.atoms.iter().filter(move |atom| atom.is(name, arity))
    }
}

/// The result of [`LogicEngine::solve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SolveOutcome {
    /// The best model found.
    Satisfiable(Model),
    /// No model exists under the given assumptions. `core` is a subset of the assumptions that
    /// is already unsatisfiable on its own. It is not necessarily minimal.
    Unsatisfiable {
        /// The assumptions involved in the failure.
        core: Vec<Symbol>,
    },
}

/// Statistics about a grounding run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroundingStats {
    /// The number of facts given in the programs.
    pub facts: usize,
    /// The number of atoms derived by rules.
    pub derived: usize,
}

/// A logic engine that can ground and solve concretization programs.
pub trait LogicEngine {
    /// Adds program text under a name that is used in error messages.
    fn add_program(&mut self, name: &str, text: &str) -> Result<(), EngineError>;

    /// Declares an atom that may be passed as an assumption to [`LogicEngine::solve`].
    fn declare_assumption(&mut self, assumption: Symbol) -> Result<(), EngineError>;

    /// Grounds all programs added so far.
    fn ground(&mut self) -> Result<GroundingStats, EngineError>;

    /// Searches for the best model in which all given assumptions hold.
    fn solve(&mut self, assumptions: &[Symbol]) -> Result<SolveOutcome, EngineError>;
}
