use std::{
    collections::BTreeMap,
    fmt::{self, Display, Formatter},
};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// The categories of compiler flags a spec can carry.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FlagType {
    /// Flags for the C compiler.
    Cflags,
    /// Flags for the C++ compiler.
    Cxxflags,
    /// Flags for the Fortran compiler.
    Fflags,
    /// Flags for the preprocessor.
    Cppflags,
    /// Flags for the linker.
    Ldflags,
    /// Libraries to link.
    Ldlibs,
}

/// Where a flag came from. Used to put flags in a deterministic order after solving.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagSource {
    /// Declared on the compiler.
    Compiler,
    /// Imposed by a dependent package with the given name.
    Dependent(String),
    /// Imposed by a configuration requirement.
    Requirement,
    /// Written on the command line.
    Literal,
}

impl FlagSource {
    /// The tag used for this source in solver facts.
    pub fn tag(&self) -> String {
        match self {
            FlagSource::Compiler => "compiler".to_string(),
            FlagSource::Dependent(name) => name.clone(),
            FlagSource::Requirement => "requirement".to_string(),
            FlagSource::Literal => "literal".to_string(),
        }
    }

    /// The inverse of [`FlagSource::tag`].
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "compiler" => FlagSource::Compiler,
            "requirement" => FlagSource::Requirement,
            "literal" => FlagSource::Literal,
            name => FlagSource::Dependent(name.to_string()),
        }
    }
}

/// A single compiler flag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompilerFlag {
    /// The flag text, e.g. `-O3`.
    pub flag: String,
    /// Whether the flag propagates to link and run dependencies (`cflags==-O3`).
    pub propagate: bool,
    /// Where the flag came from.
    pub source: FlagSource,
}

/// The flags of a spec by category. Within a category the order is significant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlagMap(BTreeMap<FlagType, Vec<CompilerFlag>>);

impl FlagMap {
    /// Returns true if no flags are set.
    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }

    /// Returns the flags of one category.
    pub fn get(&self, flag_type: FlagType) -> &[CompilerFlag] {
        self.0.get(&flag_type).map_or(&[][..], Vec::as_slice)
    }

    /// Iterates over the categories that have flags.
    pub fn iter(&self) -> impl Iterator<Item = (FlagType, &[CompilerFlag])> + '_ {
        self.0
            .iter()
            .filter(|(_, flags)| !flags.is_empty())
            .map(|(ty, flags)| (*ty, flags.as_slice()))
    }

    /// Appends a flag unless the same flag text is already present in the category.
    pub fn push(&mut self, flag_type: FlagType, flag: CompilerFlag) {
        let flags = self.0.entry(flag_type).or_default();
        if !flags.iter().any(|f| f.flag == flag.flag) {
            flags.push(flag);
        }
    }

    /// Replaces all flags of a category.
    pub fn set(&mut self, flag_type: FlagType, flags: Vec<CompilerFlag>) {
        self.0.insert(flag_type, flags);
    }

    /// Returns true if every flag in `other` is present in `self`.
    pub fn satisfies(&self, other: &FlagMap) -> bool {
        other.iter().all(|(ty, flags)| {
            let ours = self.get(ty);
            flags
                .iter()
                .all(|flag| ours.iter().any(|f| f.flag == flag.flag))
        })
    }

    /// Adds the flags of `other` that are not yet present.
    pub fn constrain(&mut self, other: &FlagMap) {
        for (ty, flags) in other.iter() {
            for flag in flags {
                self.push(ty, flag.clone());
            }
        }
    }
}

/// Formats the flags the way they are written in a spec string.
impl Display for FlagMap {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (ty, flags) in self.iter() {
            let propagate = flags.iter().all(|flag| flag.propagate);
            if !first {
                write!(f, " ")?;
            }
            first = false;
            write!(
                f,
                "{ty}{}\"{}\"",
                if propagate { "==" } else { "=" },
                flags.iter().map(|flag| flag.flag.as_str()).format(" ")
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::{CompilerFlag, FlagMap, FlagSource, FlagType};

    fn flag(text: &str) -> CompilerFlag {
        CompilerFlag {
            flag: text.to_string(),
            propagate: false,
            source: FlagSource::Literal,
        }
    }

    #[test]
    fn test_flag_type_names() {
        assert_eq!(FlagType::from_str("cflags").unwrap(), FlagType::Cflags);
        assert_eq!(FlagType::Ldlibs.to_string(), "ldlibs");
        assert!(FlagType::from_str("rustflags").is_err());
    }

    #[test]
    fn test_push_dedups() {
        let mut flags = FlagMap::default();
        flags.push(FlagType::Cflags, flag("-O3"));
        flags.push(FlagType::Cflags, flag("-g"));
        flags.push(FlagType::Cflags, flag("-O3"));
        assert_eq!(flags.get(FlagType::Cflags).len(), 2);
        assert_eq!(flags.to_string(), "cflags=\"-O3 -g\"");

        let mut required = FlagMap::default();
        required.push(FlagType::Cflags, flag("-g"));
        assert!(flags.satisfies(&required));
        assert!(!required.satisfies(&flags));
    }

    #[test]
    fn test_source_tags() {
        for source in [
            FlagSource::Compiler,
            FlagSource::Literal,
            FlagSource::Requirement,
            FlagSource::Dependent("zlib".to_string()),
        ] {
            assert_eq!(FlagSource::from_tag(&source.tag()), source);
        }
    }
}
