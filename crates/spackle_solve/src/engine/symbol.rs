use std::{
    fmt::{self, Display, Formatter},
    sync::Arc,
};

/// A ground term of the logic protocol: a number, a quoted string, a function term such as
/// `node(0,"zlib")` or a tuple. A constant like `deprecated_allowed` is a function without
/// arguments; a tuple is a function with an empty name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Symbol {
    /// An integer.
    Number(i64),
    /// A string.
    String(Arc<str>),
    /// A function term or, with an empty name, a tuple.
    Function(Arc<str>, Arc<[Symbol]>),
}

impl Symbol {
    /// Creates a string symbol.
    pub fn string(value: impl AsRef<str>) -> Self {
        Symbol::String(Arc::from(value.as_ref()))
    }

    /// Creates a number symbol.
    pub fn number(value: impl Into<i64>) -> Self {
        Symbol::Number(value.into())
    }

    /// Creates a function term.
    pub fn function(name: &str, args: impl Into<Vec<Symbol>>) -> Self {
        Symbol::Function(Arc::from(name), Arc::from(args.into()))
    }

    /// Creates a function term without arguments.
    pub fn constant(name: &str) -> Self {
        Symbol::function(name, Vec::new())
    }

    /// Creates a tuple.
    pub fn tuple(args: impl Into<Vec<Symbol>>) -> Self {
        Symbol::function("", args)
    }

    /// Returns the value of a number symbol.
    pub fn as_number(&self) -> Option<i64> {
        match self {
            Symbol::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the value of a string symbol.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Symbol::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the name of a function term.
    pub fn name(&self) -> Option<&str> {
        match self {
            Symbol::Function(name, _) => Some(name),
            _ => None,
        }
    }

    /// Returns the arguments of a function term, or an empty slice.
    pub fn args(&self) -> &[Symbol] {
        match self {
            Symbol::Function(_, args) => args,
            _ => &[],
        }
    }

    /// Returns the name and arity of a function term.
    pub fn signature(&self) -> Option<(&str, usize)> {
        match self {
            Symbol::Function(name, args) => Some((name, args.len())),
            _ => None,
        }
    }

    /// Returns true for a function term with the given name and arity.
    pub fn is(&self, name: &str, arity: usize) -> bool {
        self.signature() == Some((name, arity))
    }

    /// Returns the `idx`-th argument as a string.
    pub fn str_arg(&self, idx: usize) -> Option<&str> {
        self.args().get(idx).and_then(Symbol::as_str)
    }

    /// Returns the `idx`-th argument as a number.
    pub fn num_arg(&self, idx: usize) -> Option<i64> {
        self.args().get(idx).and_then(Symbol::as_number)
    }
}

fn write_escaped(f: &mut Formatter<'_>, value: &str) -> fmt::Result {
    f.write_str("\"")?;
    for c in value.chars() {
        match c {
            '"' => f.write_str("\\\"")?,
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            c => write!(f, "{c}")?,
        }
    }
    f.write_str("\"")
}

impl Display for Symbol {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Symbol::Number(n) => write!(f, "{n}"),
            Symbol::String(s) => write_escaped(f, s),
            Symbol::Function(name, args) if args.is_empty() && !name.is_empty() => {
                write!(f, "{name}")
            }
            Symbol::Function(name, args) => {
                write!(f, "{name}(")?;
                for (idx, arg) in args.iter().enumerate() {
                    if idx > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{arg}")?;
                }
                if name.is_empty() && args.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
        }
    }
}

impl From<&str> for Symbol {
    fn from(value: &str) -> Self {
        Symbol::string(value)
    }
}

impl From<String> for Symbol {
    fn from(value: String) -> Self {
        Symbol::String(Arc::from(value))
    }
}

impl From<i64> for Symbol {
    fn from(value: i64) -> Self {
        Symbol::Number(value)
    }
}

impl From<usize> for Symbol {
    fn from(value: usize) -> Self {
        Symbol::Number(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

/// Builds a function term from a name and a list of arguments convertible to symbols.
#[macro_export]
macro_rules! sym {
    ($name:expr) => {
        $crate::engine::Symbol::constant($name)
    };
    ($name:expr, $($arg:expr),+ $(,)?) => {
        $crate::engine::Symbol::function($name, vec![$($crate::engine::Symbol::from($arg)),+])
    };
}
