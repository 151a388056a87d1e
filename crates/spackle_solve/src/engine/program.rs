//! Parsing of program text.
//!
//! The accepted language is a small subset of the usual answer set programming syntax:
//!
//! ```text
//! % a comment
//! pkg_fact("zlib", version_declared("1.3", 0, "package_py")).
//! os_compatible(A, C) :- os_compatible(A, B), os_compatible(B, C).
//! #show attr/2.
//! ```

use std::sync::Arc;

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while},
    character::complete::{char, digit1, multispace1, not_line_ending, satisfy},
    combinator::{map, map_res, opt, recognize, value},
    multi::{many0, separated_list0, separated_list1},
    sequence::{delimited, preceded, terminated},
    IResult, Parser,
};

use super::{EngineError, Symbol};

/// A possibly non-ground term.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    /// A variable such as `X`.
    Var(Arc<str>),
    /// A number.
    Number(i64),
    /// A string.
    String(Arc<str>),
    /// A function term or tuple with possibly non-ground arguments.
    Function(Arc<str>, Vec<Term>),
}

impl Term {
    /// Converts a ground term into a symbol.
    pub fn to_symbol(&self) -> Option<Symbol> {
        match self {
            Term::Var(_) => None,
            Term::Number(n) => Some(Symbol::Number(*n)),
            Term::String(s) => Some(Symbol::String(s.clone())),
            Term::Function(name, args) => {
                let args = args.iter().map(Term::to_symbol).collect::<Option<Vec<_>>>()?;
                Some(Symbol::Function(name.clone(), Arc::from(args)))
            }
        }
    }

    /// Calls `f` for every variable in the term.
    pub fn for_each_var(&self, f: &mut impl FnMut(&Arc<str>)) {
        match self {
            Term::Var(name) => f(name),
            Term::Function(_, args) => args.iter().for_each(|arg| arg.for_each_var(f)),
            Term::Number(_) | Term::String(_) => {}
        }
    }

    /// Returns the name and arity of a function term.
    pub fn signature(&self) -> Option<(&str, usize)> {
        match self {
            Term::Function(name, args) => Some((name, args.len())),
            _ => None,
        }
    }
}

/// A rule `head :- body_1, ..., body_n.`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    /// The derived atom.
    pub head: Term,
    /// The atoms that must all hold.
    pub body: Vec<Term>,
}

/// A statement of a program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// A ground fact.
    Fact(Symbol),
    /// A rule.
    Rule(Rule),
    /// `#show name/arity.`
    Show(String, usize),
}

/// Skips whitespace and `%` comments.
fn ws(input: &str) -> IResult<&str, ()> {
    value(
        (),
        many0(alt((
            value((), multispace1),
            value((), preceded(char('%'), not_line_ending)),
        ))),
    )
    .parse(input)
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize((
        satisfy(|c| c.is_ascii_lowercase()),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))
    .parse(input)
}

fn variable(input: &str) -> IResult<&str, &str> {
    recognize((
        satisfy(|c| c.is_ascii_uppercase() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))
    .parse(input)
}

fn number(input: &str) -> IResult<&str, i64> {
    map_res(recognize((opt(char('-')), digit1)), str::parse).parse(input)
}

fn string_literal(input: &str) -> IResult<&str, String> {
    let (mut rest, _) = char('"').parse(input)?;
    let mut result = String::new();
    loop {
        let mut chars = rest.chars();
        match chars.next() {
            Some('"') => return Ok((chars.as_str(), result)),
            Some('\\') => {
                match chars.next() {
                    Some('n') => result.push('\n'),
                    Some(c @ ('"' | '\\')) => result.push(c),
                    _ => {
                        return Err(nom::Err::Error(nom::error::Error::new(
                            rest,
                            nom::error::ErrorKind::Escaped,
                        )))
                    }
                }
                rest = chars.as_str();
            }
            Some(c) => {
                result.push(c);
                rest = chars.as_str();
            }
            None => {
                return Err(nom::Err::Error(nom::error::Error::new(
                    rest,
                    nom::error::ErrorKind::Char,
                )))
            }
        }
    }
}

fn arguments(input: &str) -> IResult<&str, Vec<Term>> {
    delimited(
        char('('),
        terminated(
            separated_list0(preceded(ws, char(',')), term),
            opt(preceded(ws, char(','))),
        ),
        preceded(ws, char(')')),
    )
    .parse(input)
}

fn term(input: &str) -> IResult<&str, Term> {
    preceded(
        ws,
        alt((
            map(number, Term::Number),
            map(string_literal, |s| Term::String(Arc::from(s))),
            map(variable, |v| Term::Var(Arc::from(v))),
            map(arguments, |args| Term::Function(Arc::from(""), args)),
            map((identifier, opt(arguments)), |(name, args)| {
                Term::Function(Arc::from(name), args.unwrap_or_default())
            }),
        )),
    )
    .parse(input)
}

fn atom(input: &str) -> IResult<&str, Term> {
    preceded(
        ws,
        map((identifier, opt(arguments)), |(name, args)| {
            Term::Function(Arc::from(name), args.unwrap_or_default())
        }),
    )
    .parse(input)
}

fn show(input: &str) -> IResult<&str, (String, usize)> {
    preceded(
        (ws, tag("#show"), ws),
        map(
            (identifier, char('/'), map_res(digit1, str::parse::<usize>)),
            |(name, _, arity)| (name.to_string(), arity),
        ),
    )
    .parse(input)
}

enum RawStatement {
    Atom(Term),
    Rule(Term, Vec<Term>),
    Show(String, usize),
}

fn statement(input: &str) -> IResult<&str, RawStatement> {
    terminated(
        alt((
            map(show, |(name, arity)| RawStatement::Show(name, arity)),
            map(
                (
                    atom,
                    opt(preceded(
                        (ws, tag(":-")),
                        separated_list1(preceded(ws, char(',')), atom),
                    )),
                ),
                |(head, body)| match body {
                    Some(body) => RawStatement::Rule(head, body),
                    None => RawStatement::Atom(head),
                },
            ),
        )),
        preceded(ws, char('.')),
    )
    .parse(input)
}

/// Renames every anonymous variable `_` to a fresh name so that each occurrence is distinct.
fn rename_anonymous(term: &mut Term, counter: &mut usize) {
    match term {
        Term::Var(name) if name.as_ref() == "_" => {
            *name = Arc::from(format!("_{counter}"));
            *counter += 1;
        }
        Term::Function(_, args) => {
            for arg in args {
                rename_anonymous(arg, counter);
            }
        }
        _ => {}
    }
}

/// Parses program text into statements. `name` is only used for error messages.
pub fn parse_program(name: &str, text: &str) -> Result<Vec<Statement>, EngineError> {
    let line_of = |rest: &str| text[..text.len() - rest.len()].matches('\n').count() + 1;
    let mut statements = Vec::new();
    let mut rest = text;
    loop {
        let (remaining, ()) = ws(rest).map_err(|_| EngineError::Syntax {
            program: name.to_string(),
            line: line_of(rest),
            message: "invalid comment".to_string(),
        })?;
        if remaining.is_empty() {
            return Ok(statements);
        }
        let (remaining, raw) = statement(remaining).map_err(|_| EngineError::Syntax {
            program: name.to_string(),
            line: line_of(remaining),
            message: "expected a fact, a rule or a #show directive".to_string(),
        })?;
        rest = remaining;

        match raw {
            RawStatement::Show(predicate, arity) => {
                statements.push(Statement::Show(predicate, arity));
            }
            RawStatement::Atom(head) => {
                let fact = head.to_symbol().ok_or_else(|| EngineError::Syntax {
                    program: name.to_string(),
                    line: line_of(rest),
                    message: "facts must not contain variables".to_string(),
                })?;
                statements.push(Statement::Fact(fact));
            }
            RawStatement::Rule(head, mut body) => {
                let mut counter = 0;
                for literal in &mut body {
                    rename_anonymous(literal, &mut counter);
                }
                let mut bound = Vec::new();
                for literal in &body {
                    literal.for_each_var(&mut |v| bound.push(v.clone()));
                }
                let mut unsafe_var = None;
                head.for_each_var(&mut |v| {
                    if unsafe_var.is_none() && !bound.contains(v) {
                        unsafe_var = Some(v.to_string());
                    }
                });
                if let Some(variable) = unsafe_var {
                    return Err(EngineError::UnsafeRule {
                        program: name.to_string(),
                        variable,
                    });
                }
                statements.push(Statement::Rule(Rule { head, body }));
            }
        }
    }
}
