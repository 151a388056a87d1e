//! Turns a failed solve into a readable explanation.
//!
//! Every `error/4` atom of the best model becomes one reason. The conditions an error refers to
//! are traced back through the impositions that made them hold, which gives a cause tree per
//! error. The tree is computed by running the causation rules over the atoms of the model only.

use std::collections::{BTreeMap, BTreeSet};

use itertools::Itertools;
use spackle_types::Spec;

use crate::{
    engine::{EngineError, LogicEngine, Model, NativeEngine, SolveOutcome, Symbol},
    error::{InternalSolverError, SolveError, UnsatisfiableSpecError},
    rules::CAUSATION,
};

/// A condition holding on a node.
type Cause = (i64, Symbol);

#[derive(Debug)]
struct ErrorEntry {
    priority: i64,
    message: String,
    causes: Vec<Cause>,
}

/// Replaces `{0}`, `{1}`, ... with the arguments.
fn fill_template(template: &str, args: &[Symbol]) -> String {
    args.iter()
        .enumerate()
        .fold(template.to_string(), |text, (idx, arg)| {
            let value = arg.as_str().map_or_else(|| arg.to_string(), str::to_string);
            text.replace(&format!("{{{idx}}}"), &value)
        })
}

fn parse_cause(cause: &Symbol) -> Option<Cause> {
    match cause.args() {
        [condition, node] => Some((condition.as_number()?, node.clone())),
        _ => None,
    }
}

fn error_entries(model: &Model) -> Result<Vec<ErrorEntry>, String> {
    let mut entries = Vec::new();
    for atom in model.atoms_named("error", 4) {
        let malformed = || format!("malformed error atom {atom}");
        let priority = atom.num_arg(0).ok_or_else(malformed)?;
        let template = atom.str_arg(1).ok_or_else(malformed)?;
        let args = atom.args()[2].args();
        let causes = atom.args()[3]
            .args()
            .iter()
            .map(|cause| parse_cause(cause).ok_or_else(malformed))
            .collect::<Result<Vec<_>, _>>()?;
        entries.push(ErrorEntry {
            priority,
            message: fill_template(template, args),
            causes,
        });
    }
    entries.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.message.cmp(&b.message))
    });
    entries.dedup_by(|a, b| a.message == b.message && a.causes == b.causes);
    Ok(entries)
}

/// Runs the causation rules over the model and returns, for every condition holding on a node,
/// the conditions that imposed its trigger.
fn causal_links(model: &Model) -> Result<BTreeMap<Cause, Vec<Cause>>, EngineError> {
    let facts: String = model
        .atoms
        .iter()
        .filter(|atom| {
            atom.is("condition_holds", 2)
                || atom.is("condition_trigger", 2)
                || atom.is("trigger_clause", 2)
                || atom.is("imposed_on", 4)
        })
        .map(|atom| format!("{atom}.\n"))
        .collect();

    let mut engine = NativeEngine::default();
    engine.add_program("model.lp", &facts)?;
    engine.add_program("causation.lp", CAUSATION)?;
    engine.ground()?;
    let SolveOutcome::Satisfiable(result) = engine.solve(&[])? else {
        return Ok(BTreeMap::new());
    };

    let mut links: BTreeMap<Cause, Vec<Cause>> = BTreeMap::new();
    for atom in result.atoms_named("condition_cause", 4) {
        let (Some(effect), Some(cause)) = (atom.num_arg(0), atom.num_arg(2)) else {
            continue;
        };
        let args = atom.args();
        links
            .entry((effect, args[1].clone()))
            .or_default()
            .push((cause, args[3].clone()));
    }
    Ok(links)
}

fn format_node(node: &Symbol) -> String {
    match (node.num_arg(0), node.str_arg(1)) {
        (Some(0), Some(package)) => package.to_string(),
        (Some(dup), Some(package)) => format!("{package} (node {dup})"),
        _ => node.to_string(),
    }
}

struct CauseTree<'a> {
    links: &'a BTreeMap<Cause, Vec<Cause>>,
    descriptions: &'a BTreeMap<i64, String>,
}

impl CauseTree<'_> {
    fn render(
        &self,
        causes: &[Cause],
        depth: usize,
        visited: &mut BTreeSet<Cause>,
        out: &mut Vec<String>,
    ) {
        for cause in causes {
            if !visited.insert(cause.clone()) {
                continue;
            }
            let (condition, node) = cause;
            let description = self
                .descriptions
                .get(condition)
                .cloned()
                .unwrap_or_else(|| format!("condition {condition} on {}", format_node(node)));
            out.push(format!(
                "{}required because {description}",
                "  ".repeat(depth + 1)
            ));
            if let Some(children) = self.links.get(cause) {
                self.render(children, depth + 1, visited, out);
            }
        }
    }
}

fn explained_reasons(model: &Model, entries: &[ErrorEntry]) -> Result<Vec<String>, EngineError> {
    let links = causal_links(model)?;
    let descriptions: BTreeMap<i64, String> = model
        .atoms_named("condition_desc", 2)
        .filter_map(|atom| Some((atom.num_arg(0)?, atom.str_arg(1)?.to_string())))
        .collect();
    let tree = CauseTree {
        links: &links,
        descriptions: &descriptions,
    };
    Ok(entries
        .iter()
        .map(|entry| {
            let mut lines = vec![entry.message.clone()];
            tree.render(&entry.causes, 0, &mut BTreeSet::new(), &mut lines);
            lines.join("\n")
        })
        .collect())
}

/// Explains a model that still carries errors. Never fails: problems while building the
/// explanation turn into an internal error that keeps the plain error messages.
pub(crate) fn explain_model(model: &Model, header: &str) -> SolveError {
    let span = tracing::debug_span!("explain");
    let _enter = span.enter();

    let entries = match error_entries(model) {
        Ok(entries) => entries,
        Err(reason) => {
            return SolveError::Internal(
                InternalSolverError::new(header)
                    .with_reason(format!("cannot explain the failure: {reason}")),
            )
        }
    };
    if entries.is_empty() {
        return SolveError::internal(header, "the solve failed without reporting an error");
    }
    tracing::debug!("explaining {} errors", entries.len());

    match explained_reasons(model, &entries) {
        Ok(reasons) => SolveError::Unsatisfiable(UnsatisfiableSpecError {
            header: header.to_string(),
            reasons,
        }),
        Err(err) => {
            tracing::warn!("cannot build the cause tree: {err}");
            let error = entries
                .iter()
                .fold(InternalSolverError::new(header), |error, entry| {
                    error.with_reason(entry.message.clone())
                })
                .with_reason(format!("the explanation could not be built: {err}"));
            SolveError::Internal(error)
        }
    }
}

/// Explains a search that found no model at all from its minimized core.
pub(crate) fn explain_core(core: &[Symbol], literals: &[Spec], header: &str) -> SolveError {
    let specs: Vec<String> = core
        .iter()
        .filter(|assumption| assumption.is("literal", 1))
        .filter_map(|assumption| assumption.num_arg(0))
        .filter_map(|idx| literals.get(usize::try_from(idx).ok()?))
        .map(|spec| format!("'{spec}'"))
        .collect();
    let reason = match specs.as_slice() {
        [] => "the request cannot be satisfied".to_string(),
        [single] => format!("{single} cannot be satisfied"),
        many => format!("{} cannot be satisfied together", many.iter().join(", ")),
    };
    SolveError::Unsatisfiable(UnsatisfiableSpecError {
        header: header.to_string(),
        reasons: vec![reason],
    })
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use assert_matches::assert_matches;
    use spackle_types::Spec;

    use super::{explain_core, explain_model, fill_template};
    use crate::{
        engine::{Model, Symbol},
        error::SolveError,
        sym,
    };

    fn model(atoms: Vec<Symbol>) -> Model {
        Model {
            atoms,
            cost: Vec::new(),
            optimal: true,
            models_examined: 1,
        }
    }

    fn node() -> Symbol {
        sym!("node", 0i64, "pkg-a")
    }

    fn conflict_error() -> Symbol {
        sym!(
            "error",
            70i64,
            "{1}",
            Symbol::tuple(vec![
                Symbol::from("pkg-a"),
                Symbol::from("'pkg-a+X' conflicts with 'pkg-a+Y'"),
            ]),
            Symbol::tuple(vec![
                Symbol::tuple(vec![Symbol::from(3i64), node()]),
                Symbol::tuple(vec![Symbol::from(4i64), node()]),
            ])
        )
    }

    #[test]
    fn test_fill_template() {
        let args = [Symbol::from("zlib"), Symbol::from(3i64)];
        assert_eq!(fill_template("'{0}' needs {1} ({0})", &args), "'zlib' needs 3 (zlib)");
    }

    #[test]
    fn test_conflict_is_traced_to_the_request() {
        let y = sym!("variant_value", "pkg-a", "Y", "True");
        let x = sym!("variant_value", "pkg-a", "X", "True");
        let model = model(vec![
            conflict_error(),
            sym!("condition_holds", 3i64, node()),
            sym!("condition_holds", 4i64, node()),
            sym!("condition_holds", 9i64, node()),
            sym!("condition_trigger", 3i64, 1i64),
            sym!("condition_trigger", 4i64, 2i64),
            sym!("trigger_clause", 1i64, y.clone()),
            sym!("trigger_clause", 2i64, x.clone()),
            sym!("imposed_on", 9i64, node(), node(), y),
            sym!("imposed_on", 9i64, node(), node(), x),
            sym!("condition_desc", 3i64, "pkg-a+Y"),
            sym!("condition_desc", 4i64, "pkg-a+X"),
            sym!("condition_desc", 9i64, "pkg-a+X+Y"),
        ]);
        let err = explain_model(&model, "cannot concretize 'pkg-a+X+Y'");
        let SolveError::Unsatisfiable(err) = err else {
            panic!("expected an unsatisfiable error, got {err:?}");
        };
        assert_eq!(err.reasons.len(), 1);
        similar_asserts::assert_eq!(
            err.reasons[0],
            "'pkg-a+X' conflicts with 'pkg-a+Y'\n  required because pkg-a+Y\n    required because pkg-a+X+Y\n  required because pkg-a+X"
        );
    }

    #[test]
    fn test_cyclic_causes_terminate() {
        let clause = sym!("node", "pkg-a");
        let model = model(vec![
            sym!(
                "error",
                90i64,
                "{0}: {1}",
                Symbol::tuple(vec![Symbol::from("pkg-a"), Symbol::from("'+X' is required")]),
                Symbol::tuple(vec![Symbol::tuple(vec![Symbol::from(1i64), node()])])
            ),
            sym!("condition_holds", 1i64, node()),
            sym!("condition_holds", 2i64, node()),
            sym!("condition_trigger", 1i64, 5i64),
            sym!("condition_trigger", 2i64, 5i64),
            sym!("trigger_clause", 5i64, clause.clone()),
            sym!("imposed_on", 1i64, node(), node(), clause.clone()),
            sym!("imposed_on", 2i64, node(), node(), clause),
        ]);
        let err = explain_model(&model, "cannot concretize 'pkg-a'");
        assert_matches!(&err, SolveError::Unsatisfiable(_));
        let reasons = err.reasons();
        assert!(reasons[0].starts_with("pkg-a: '+X' is required"));
        assert!(reasons[0].lines().count() <= 4);
    }

    #[test]
    fn test_errors_are_sorted_by_priority() {
        let low = sym!(
            "error",
            10i64,
            "low {0}",
            Symbol::tuple(vec![Symbol::from("a")]),
            Symbol::tuple(Vec::new())
        );
        let model = model(vec![low, conflict_error()]);
        let reasons = explain_model(&model, "header").reasons();
        assert_eq!(reasons.len(), 2);
        assert!(reasons[0].starts_with("'pkg-a+X' conflicts"));
        assert!(reasons[1].starts_with("low a"));
    }

    #[test]
    fn test_model_without_errors_is_internal() {
        assert_matches!(explain_model(&model(Vec::new()), "h"), SolveError::Internal(_));
    }

    #[test]
    fn test_core_names_the_requests() {
        let literals = vec![
            Spec::from_str("pkg-a").unwrap(),
            Spec::from_str("pkg-b").unwrap(),
        ];
        let core = vec![sym!("literal", 0usize), sym!("literal", 1usize)];
        let err = explain_core(&core, &literals, "cannot concretize");
        assert_eq!(
            err.reasons(),
            vec!["'pkg-a', 'pkg-b' cannot be satisfied together".to_string()]
        );
    }
}
