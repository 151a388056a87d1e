//! Parsing of spec strings such as `builtin.hdf5@1.12: +mpi ~fortran %gcc@12 ^openmpi@4`.

use std::{str::FromStr, sync::Arc};

use nom::{
    branch::alt,
    bytes::complete::{tag, take_till, take_while1},
    character::complete::{char, multispace0},
    combinator::{map, opt, value},
    sequence::{delimited, preceded},
    IResult, Parser,
};
use thiserror::Error;

use super::{DependencySpec, Spec, SpecError};
use crate::{
    ArchSpec, CompilerFlag, CompilerSpec, DepTypes, FlagSource, FlagType, ParseVersionListError,
    VariantValue, VersionList,
};

/// An error that occurred while parsing a spec string.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseSpecError {
    /// The input contains something that is not part of the spec syntax.
    #[error("unexpected input at position {position} in '{input}'")]
    UnexpectedInput {
        /// The full input.
        input: String,
        /// Byte offset of the first character that could not be parsed.
        position: usize,
    },

    /// A version list could not be parsed.
    #[error("invalid version constraint in '{input}'")]
    InvalidVersion {
        /// The full input.
        input: String,
        /// The underlying error.
        #[source]
        source: ParseVersionListError,
    },

    /// The same attribute was given twice.
    #[error("'{attribute}' is specified more than once in '{input}'")]
    DuplicateAttribute {
        /// The full input.
        input: String,
        /// The attribute.
        attribute: String,
    },

    /// A flag string could not be split into flags.
    #[error("unbalanced quotes in flags '{0}'")]
    InvalidFlags(String),

    /// A `^dependency` without a package name.
    #[error("dependency constraints must name a package in '{0}'")]
    AnonymousDependency(String),

    /// Exactly one spec was expected.
    #[error("expected a single spec in '{input}' but found {count}")]
    ExpectedSingleSpec {
        /// The full input.
        input: String,
        /// The number of specs found.
        count: usize,
    },

    /// Combining constraints on the same dependency failed.
    #[error(transparent)]
    Spec(#[from] SpecError),
}

#[derive(Debug, Clone, PartialEq)]
enum Token<'a> {
    Name(&'a str),
    Version(&'a str),
    BoolVariant(bool, &'a str),
    KeyValue {
        key: &'a str,
        propagate: bool,
        value: &'a str,
    },
    Compiler(&'a str, Option<&'a str>),
    Hash(&'a str),
    Dependency,
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-')
}

fn is_version_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':' | ',' | '=')
}

fn version(input: &str) -> IResult<&str, &str> {
    preceded(char('@'), take_while1(is_version_char)).parse(input)
}

fn quoted(input: &str) -> IResult<&str, &str> {
    alt((
        delimited(char('"'), take_till(|c| c == '"'), char('"')),
        delimited(char('\''), take_till(|c| c == '\''), char('\'')),
    ))
    .parse(input)
}

fn key_value(input: &str) -> IResult<&str, Token<'_>> {
    let (rest, key) = take_while1(is_key_char).parse(input)?;
    let (rest, propagate) = alt((value(true, tag("==")), value(false, tag("=")))).parse(rest)?;
    let (rest, value) = alt((
        quoted,
        take_while1(|c: char| !c.is_whitespace() && c != '^'),
    ))
    .parse(rest)?;
    Ok((
        rest,
        Token::KeyValue {
            key,
            propagate,
            value,
        },
    ))
}

fn token(input: &str) -> IResult<&str, Token<'_>> {
    preceded(
        multispace0,
        alt((
            value(Token::Dependency, char('^')),
            map(version, Token::Version),
            map(preceded(char('+'), take_while1(is_key_char)), |name| {
                Token::BoolVariant(true, name)
            }),
            map(preceded(char('~'), take_while1(is_key_char)), |name| {
                Token::BoolVariant(false, name)
            }),
            map(
                (preceded(char('%'), take_while1(is_key_char)), opt(version)),
                |(name, versions)| Token::Compiler(name, versions),
            ),
            map(
                preceded(char('/'), take_while1(|c: char| c.is_ascii_alphanumeric())),
                Token::Hash,
            ),
            key_value,
            map(take_while1(is_name_char), Token::Name),
        )),
    )
    .parse(input)
}

fn tokenize(input: &str) -> Result<Vec<Token<'_>>, ParseSpecError> {
    let mut tokens = Vec::new();
    let mut rest = input;
    loop {
        let trimmed = rest.trim_start();
        if trimmed.is_empty() {
            return Ok(tokens);
        }
        match token(rest) {
            Ok((remaining, token)) => {
                tokens.push(token);
                rest = remaining;
            }
            Err(_) => {
                return Err(ParseSpecError::UnexpectedInput {
                    input: input.to_string(),
                    position: input.len() - trimmed.len(),
                })
            }
        }
    }
}

/// Accumulates tokens into the specs of the input.
struct SpecsBuilder<'i> {
    input: &'i str,
    roots: Vec<Spec>,
    root: Option<Spec>,
    dependencies: Vec<Spec>,
    current: Spec,
    in_dependency: bool,
}

impl<'i> SpecsBuilder<'i> {
    fn new(input: &'i str) -> Self {
        Self {
            input,
            roots: Vec::new(),
            root: None,
            dependencies: Vec::new(),
            current: Spec::default(),
            in_dependency: false,
        }
    }

    fn duplicate(&self, attribute: &str) -> ParseSpecError {
        ParseSpecError::DuplicateAttribute {
            input: self.input.to_string(),
            attribute: attribute.to_string(),
        }
    }

    /// Moves the spec under construction to either the root or the pending dependencies.
    fn close_current(&mut self) -> Result<(), ParseSpecError> {
        let current = std::mem::take(&mut self.current);
        if self.in_dependency {
            if current.name.is_none() {
                return Err(ParseSpecError::AnonymousDependency(self.input.to_string()));
            }
            self.dependencies.push(current);
        } else {
            self.root = Some(current);
        }
        Ok(())
    }

    fn close_root(&mut self) -> Result<(), ParseSpecError> {
        self.close_current()?;
        let Some(mut root) = self.root.take() else {
            return Ok(());
        };
        let mut merged: Vec<Spec> = Vec::new();
        for dependency in self.dependencies.drain(..) {
            match merged.iter_mut().find(|d| d.name == dependency.name) {
                Some(existing) => existing.constrain(&dependency)?,
                None => merged.push(dependency),
            }
        }
        for dependency in merged {
            root.add_dependency(DependencySpec {
                spec: Arc::new(dependency),
                deptypes: DepTypes::NONE,
                virtuals: Vec::new(),
            })?;
        }
        self.roots.push(root);
        self.in_dependency = false;
        Ok(())
    }

    fn push(&mut self, token: Token<'_>) -> Result<(), ParseSpecError> {
        match token {
            Token::Dependency => {
                self.close_current()?;
                self.in_dependency = true;
            }
            Token::Name(name) => {
                if self.current.name.is_some() {
                    self.close_root()?;
                }
                match name.rsplit_once('.') {
                    Some((namespace, name)) if !namespace.is_empty() && !name.is_empty() => {
                        self.current.namespace = Some(namespace.to_string());
                        self.current.name = Some(name.to_string());
                    }
                    _ => self.current.name = Some(name.to_string()),
                }
            }
            Token::Version(text) => {
                if !self.current.versions.is_any() {
                    return Err(self.duplicate("version"));
                }
                self.current.versions = self.parse_versions(text)?;
            }
            Token::BoolVariant(enabled, name) => {
                if self.current.variants.contains_key(name) {
                    return Err(self.duplicate(name));
                }
                self.current
                    .variants
                    .insert(name.to_string(), VariantValue::Bool(enabled));
            }
            Token::Compiler(name, versions) => {
                if self.current.compiler.is_some() {
                    return Err(self.duplicate("compiler"));
                }
                let mut compiler = CompilerSpec::new(name);
                if let Some(versions) = versions {
                    compiler.versions = self.parse_versions(versions)?;
                }
                self.current.compiler = Some(compiler);
            }
            Token::Hash(hash) => {
                if self.current.abstract_hash.is_some() {
                    return Err(self.duplicate("hash"));
                }
                self.current.abstract_hash = Some(hash.to_string());
            }
            Token::KeyValue {
                key,
                propagate,
                value,
            } => self.push_key_value(key, propagate, value)?,
        }
        Ok(())
    }

    fn push_key_value(
        &mut self,
        key: &str,
        propagate: bool,
        value: &str,
    ) -> Result<(), ParseSpecError> {
        let duplicate = self.duplicate(key);
        let arch = &mut self.current.arch;
        let part = match key {
            "arch" | "architecture" => {
                let parsed = ArchSpec::from_triplet(value);
                if !arch.intersects(&parsed) {
                    return Err(duplicate);
                }
                arch.constrain(&parsed);
                return Ok(());
            }
            "platform" => &mut arch.platform,
            "os" | "operating_system" => &mut arch.os,
            "target" => &mut arch.target,
            _ => return self.push_flag_or_variant(key, propagate, value),
        };
        if part.is_some() {
            return Err(duplicate);
        }
        *part = Some(value.to_string());
        Ok(())
    }

    fn push_flag_or_variant(
        &mut self,
        key: &str,
        propagate: bool,
        value: &str,
    ) -> Result<(), ParseSpecError> {
        if let Ok(flag_type) = FlagType::from_str(key) {
            let flags = shlex::split(value)
                .ok_or_else(|| ParseSpecError::InvalidFlags(value.to_string()))?;
            for flag in flags {
                self.current.compiler_flags.push(
                    flag_type,
                    CompilerFlag {
                        flag,
                        propagate,
                        source: FlagSource::Literal,
                    },
                );
            }
            return Ok(());
        }
        if self.current.variants.contains_key(key) {
            return Err(self.duplicate(key));
        }
        self.current
            .variants
            .insert(key.to_string(), VariantValue::from_assignment(value));
        Ok(())
    }

    fn parse_versions(&self, text: &str) -> Result<VersionList, ParseSpecError> {
        VersionList::from_str(text).map_err(|source| ParseSpecError::InvalidVersion {
            input: self.input.to_string(),
            source,
        })
    }

    fn finish(mut self) -> Result<Vec<Spec>, ParseSpecError> {
        self.close_root()?;
        Ok(self.roots)
    }
}

/// Parses a string that contains any number of root specs, each optionally followed by its
/// `^dependency` constraints.
pub fn parse_specs(input: &str) -> Result<Vec<Spec>, ParseSpecError> {
    let mut builder = SpecsBuilder::new(input);
    for token in tokenize(input)? {
        builder.push(token)?;
    }
    let roots = builder.finish()?;
    Ok(roots
        .into_iter()
        .filter(|spec| *spec != Spec::default())
        .collect())
}

/// Parses a string that contains exactly one spec. The empty string is the anonymous spec
/// without constraints.
pub fn parse_spec(input: &str) -> Result<Spec, ParseSpecError> {
    let mut specs = parse_specs(input)?;
    match specs.len() {
        0 => Ok(Spec::default()),
        1 => Ok(specs.remove(0)),
        count => Err(ParseSpecError::ExpectedSingleSpec {
            input: input.to_string(),
            count,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use assert_matches::assert_matches;
    use rstest::rstest;

    use super::{parse_spec, parse_specs, ParseSpecError};
    use crate::{CompilerSpec, FlagType, VariantValue, VersionList};

    #[test]
    fn test_full_spec() {
        let spec = parse_spec(
            "builtin.hdf5@1.12: +mpi ~fortran api=v18 %gcc@12 arch=linux-ubuntu22.04-x86_64 \
             cflags==\"-O3 -g\" ^openmpi@4 +cuda ^zlib",
        )
        .unwrap();
        assert_eq!(spec.namespace.as_deref(), Some("builtin"));
        assert_eq!(spec.name.as_deref(), Some("hdf5"));
        assert_eq!(spec.versions, VersionList::from_str("1.12:").unwrap());
        assert_eq!(spec.variants["mpi"], VariantValue::Bool(true));
        assert_eq!(spec.variants["fortran"], VariantValue::Bool(false));
        assert_eq!(spec.variants["api"], VariantValue::Single("v18".into()));
        assert_eq!(
            spec.compiler,
            Some(CompilerSpec {
                name: "gcc".into(),
                versions: VersionList::from_str("12").unwrap()
            })
        );
        assert_eq!(spec.arch.os.as_deref(), Some("ubuntu22.04"));
        let cflags = spec.compiler_flags.get(FlagType::Cflags);
        assert_eq!(cflags.len(), 2);
        assert!(cflags.iter().all(|f| f.propagate));

        let openmpi = &spec.dependency("openmpi").unwrap().spec;
        assert_eq!(openmpi.variants["cuda"], VariantValue::Bool(true));
        assert!(spec.dependency("zlib").is_some());
    }

    #[test]
    fn test_anonymous_spec() {
        let spec = parse_spec("+shared target=x86_64").unwrap();
        assert!(spec.name.is_none());
        assert_eq!(spec.arch.target.as_deref(), Some("x86_64"));
        assert!(parse_spec("").unwrap().name.is_none());
    }

    #[test]
    fn test_multiple_roots() {
        let specs = parse_specs("pkg-a +x ^pkg-b@1 pkg-c").unwrap();
        assert_eq!(specs.len(), 2);
        assert!(specs[0].dependency("pkg-b").is_some());
        assert_eq!(specs[1].name.as_deref(), Some("pkg-c"));
        assert_matches!(
            parse_spec("pkg-a pkg-c"),
            Err(ParseSpecError::ExpectedSingleSpec { count: 2, .. })
        );
    }

    #[test]
    fn test_hash() {
        let spec = parse_spec("zlib/abcdef12").unwrap();
        assert_eq!(spec.abstract_hash.as_deref(), Some("abcdef12"));
    }

    #[rstest]
    #[case("zlib@1 @2")]
    #[case("zlib +shared ~shared")]
    #[case("zlib %gcc %clang")]
    #[case("zlib os=a os=b")]
    fn test_duplicate_attribute(#[case] input: &str) {
        assert_matches!(
            parse_spec(input),
            Err(ParseSpecError::DuplicateAttribute { .. })
        );
    }

    #[rstest]
    #[case("zlib ^")]
    #[case("zlib ^+shared")]
    fn test_anonymous_dependency(#[case] input: &str) {
        assert_matches!(parse_spec(input), Err(ParseSpecError::AnonymousDependency(_)));
    }

    #[test]
    fn test_errors() {
        assert_matches!(
            parse_spec("zlib @1:2:3"),
            Err(ParseSpecError::InvalidVersion { .. })
        );
        assert_matches!(
            parse_spec("zlib !x"),
            Err(ParseSpecError::UnexpectedInput { position: 5, .. })
        );
        assert_matches!(
            parse_spec("zlib cflags=\"-O3"),
            Err(ParseSpecError::UnexpectedInput { .. }) | Err(ParseSpecError::InvalidFlags(_))
        );
    }
}
