//! Bottom-up grounding of Datalog rules.

use std::{collections::HashMap, sync::Arc};

use indexmap::{IndexMap, IndexSet};

use super::{
    program::{Rule, Term},
    Symbol,
};

type Signature = (Arc<str>, usize);

/// A set of ground atoms indexed by predicate and by first argument.
#[derive(Debug, Clone, Default)]
pub struct FactBase {
    by_signature: IndexMap<Signature, IndexSet<Symbol>>,
    by_first_arg: HashMap<(Signature, Symbol), Vec<Symbol>>,
    len: usize,
}

impl FactBase {
    /// Adds an atom. Returns false if it was already present or is not a function term.
    pub fn insert(&mut self, atom: Symbol) -> bool {
        let Some((name, arity)) = atom.signature() else {
            return false;
        };
        let signature: Signature = (Arc::from(name), arity);
        if !self
            .by_signature
            .entry(signature.clone())
            .or_default()
            .insert(atom.clone())
        {
            return false;
        }
        if let Some(first) = atom.args().first() {
            self.by_first_arg
                .entry((signature, first.clone()))
                .or_default()
                .push(atom);
        }
        self.len += 1;
        true
    }

    /// Returns true if the atom is present.
    pub fn contains(&self, atom: &Symbol) -> bool {
        atom.signature().is_some_and(|(name, arity)| {
            self.by_signature
                .get(&(Arc::from(name), arity) as &Signature)
                .is_some_and(|atoms| atoms.contains(atom))
        })
    }

    /// Iterates over the atoms with the given name and arity in insertion order.
    pub fn atoms<'a>(&'a self, name: &str, arity: usize) -> impl Iterator<Item = &'a Symbol> + 'a {
        self.by_signature
            .get(&(Arc::from(name), arity) as &Signature)
            .into_iter()
            .flatten()
    }

    /// Returns the atoms with the given name and arity whose first argument is `first`.
    pub fn atoms_with_first(&self, name: &str, arity: usize, first: &Symbol) -> &[Symbol] {
        self.by_first_arg
            .get(&((Arc::from(name), arity), first.clone()))
            .map_or(&[][..], Vec::as_slice)
    }

    /// Iterates over all atoms, grouped by predicate in the order predicates were first seen.
    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.by_signature.values().flatten()
    }

    /// The number of atoms.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if there are no atoms.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

type Bindings = Vec<(Arc<str>, Symbol)>;

fn lookup<'a>(bindings: &'a Bindings, var: &str) -> Option<&'a Symbol> {
    bindings
        .iter()
        .find(|(name, _)| name.as_ref() == var)
        .map(|(_, value)| value)
}

/// Matches a pattern against a ground atom, extending the bindings. On failure the bindings are
/// left as they were.
fn unify(pattern: &Term, atom: &Symbol, bindings: &mut Bindings) -> bool {
    let mark = bindings.len();
    if unify_inner(pattern, atom, bindings) {
        true
    } else {
        bindings.truncate(mark);
        false
    }
}

fn unify_inner(pattern: &Term, atom: &Symbol, bindings: &mut Bindings) -> bool {
    match (pattern, atom) {
        (Term::Var(var), _) => match lookup(bindings, var) {
            Some(bound) => bound == atom,
            None => {
                bindings.push((var.clone(), atom.clone()));
                true
            }
        },
        (Term::Number(a), Symbol::Number(b)) => a == b,
        (Term::String(a), Symbol::String(b)) => a == b,
        (Term::Function(name, args), Symbol::Function(atom_name, atom_args)) => {
            name == atom_name
                && args.len() == atom_args.len()
                && args
                    .iter()
                    .zip(atom_args.iter())
                    .all(|(p, a)| unify_inner(p, a, bindings))
        }
        _ => false,
    }
}

/// Substitutes bound variables. Returns `None` if a variable is unbound.
fn instantiate(term: &Term, bindings: &Bindings) -> Option<Symbol> {
    match term {
        Term::Var(var) => lookup(bindings, var).cloned(),
        Term::Number(n) => Some(Symbol::Number(*n)),
        Term::String(s) => Some(Symbol::String(s.clone())),
        Term::Function(name, args) => {
            let args = args
                .iter()
                .map(|arg| instantiate(arg, bindings))
                .collect::<Option<Vec<_>>>()?;
            Some(Symbol::Function(name.clone(), Arc::from(args)))
        }
    }
}

/// Candidate atoms for a body literal. Uses the first-argument index when the first argument is
/// already bound.
fn candidates<'a>(base: &'a FactBase, literal: &Term, bindings: &Bindings) -> Vec<&'a Symbol> {
    let Term::Function(name, args) = literal else {
        return Vec::new();
    };
    if let Some(first) = args.first().and_then(|arg| instantiate(arg, bindings)) {
        return base
            .atoms_with_first(name, args.len(), &first)
            .iter()
            .collect();
    }
    base.atoms(name, args.len()).collect()
}

struct Join<'a> {
    rule: &'a Rule,
    delta_position: usize,
    all: &'a FactBase,
    delta: &'a FactBase,
}

impl Join<'_> {
    fn run(&self, position: usize, bindings: &mut Bindings, out: &mut Vec<Symbol>) {
        if position == self.rule.body.len() {
            if let Some(head) = instantiate(&self.rule.head, bindings) {
                out.push(head);
            }
            return;
        }
        let literal = &self.rule.body[position];
        let source = if position == self.delta_position {
            self.delta
        } else {
            self.all
        };
        for atom in candidates(source, literal, bindings) {
            let mark = bindings.len();
            if unify(literal, atom, bindings) {
                self.run(position + 1, bindings, out);
                bindings.truncate(mark);
            }
        }
    }
}

/// Applies the rules to the facts until no new atom can be derived. Returns the number of
/// derived atoms.
///
/// Evaluation is semi-naive: in every round each rule is joined once per body literal, with that
/// literal restricted to the atoms derived in the previous round.
pub fn ground(facts: &mut FactBase, rules: &[Rule]) -> usize {
    let mut delta = facts.clone();
    let mut derived = 0;
    while !delta.is_empty() && !rules.is_empty() {
        let mut produced = Vec::new();
        for rule in rules {
            for delta_position in 0..rule.body.len() {
                let join = Join {
                    rule,
                    delta_position,
                    all: facts,
                    delta: &delta,
                };
                join.run(0, &mut Vec::new(), &mut produced);
            }
        }
        delta = FactBase::default();
        for atom in produced {
            if facts.insert(atom.clone()) {
                delta.insert(atom);
                derived += 1;
            }
        }
    }
    tracing::trace!("derived {derived} atoms");
    derived
}

#[cfg(test)]
mod tests {
    use super::{ground, FactBase};
    use crate::engine::program::{parse_program, Statement};

    fn run(text: &str) -> FactBase {
        let mut facts = FactBase::default();
        let mut rules = Vec::new();
        for statement in parse_program("test", text).unwrap() {
            match statement {
                Statement::Fact(fact) => {
                    facts.insert(fact);
                }
                Statement::Rule(rule) => rules.push(rule),
                Statement::Show(..) => {}
            }
        }
        ground(&mut facts, &rules);
        facts
    }

    #[test]
    fn test_transitive_closure() {
        let facts = run(r#"
            parent("a", "b"). parent("b", "c"). parent("c", "d").
            ancestor(X, Y) :- parent(X, Y).
            ancestor(X, Z) :- ancestor(X, Y), parent(Y, Z).
        "#);
        let mut ancestors: Vec<String> = facts
            .atoms("ancestor", 2)
            .map(ToString::to_string)
            .collect();
        ancestors.sort();
        assert_eq!(ancestors.len(), 6);
        assert!(ancestors.contains(&r#"ancestor("a","d")"#.to_string()));
    }

    #[test]
    fn test_nested_terms_and_constants() {
        let facts = run(r#"
            pkg_fact("zlib", provider_condition(3, "libz")).
            enabled.
            possible_provider(P, V) :- pkg_fact(P, provider_condition(_, V)), enabled.
        "#);
        let providers: Vec<String> = facts
            .atoms("possible_provider", 2)
            .map(ToString::to_string)
            .collect();
        assert_eq!(providers, vec![r#"possible_provider("zlib","libz")"#]);
    }
}
