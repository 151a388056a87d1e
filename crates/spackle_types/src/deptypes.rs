use std::{
    fmt::{self, Display, Formatter},
    ops::{BitOr, BitOrAssign},
    str::FromStr,
};

use itertools::Itertools;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use strum::IntoEnumIterator;
use thiserror::Error;

/// A single kind of dependency.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[strum(serialize_all = "lowercase")]
pub enum DepType {
    /// Needed while building the dependent.
    Build,
    /// Linked into the dependent.
    Link,
    /// Needed at runtime.
    Run,
    /// Needed to run the tests of the dependent.
    Test,
}

impl DepType {
    const fn bit(self) -> u8 {
        match self {
            DepType::Build => 0b0001,
            DepType::Link => 0b0010,
            DepType::Run => 0b0100,
            DepType::Test => 0b1000,
        }
    }
}

/// A set of [`DepType`]s. An edge can be of several types at once.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DepTypes(u8);

/// Error returned when a dependency type is not recognized.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown dependency type '{0}'")]
pub struct ParseDepTypeError(pub String);

impl DepTypes {
    /// No types.
    pub const NONE: DepTypes = DepTypes(0);
    /// Build only.
    pub const BUILD: DepTypes = DepTypes(DepType::Build.bit());
    /// Link only.
    pub const LINK: DepTypes = DepTypes(DepType::Link.bit());
    /// Run only.
    pub const RUN: DepTypes = DepTypes(DepType::Run.bit());
    /// Test only.
    pub const TEST: DepTypes = DepTypes(DepType::Test.bit());
    /// The default for declared dependencies: build and link.
    pub const BUILD_LINK: DepTypes = DepTypes(DepType::Build.bit() | DepType::Link.bit());
    /// Link and run, the types that tie two nodes into the same configuration.
    pub const LINK_RUN: DepTypes = DepTypes(DepType::Link.bit() | DepType::Run.bit());
    /// Every type.
    pub const ALL: DepTypes = DepTypes(0b1111);

    /// Returns true if the set contains the type.
    pub fn contains(self, ty: DepType) -> bool {
        self.0 & ty.bit() != 0
    }

    /// Returns true if the two sets share a type.
    pub fn intersects(self, other: DepTypes) -> bool {
        self.0 & other.0 != 0
    }

    /// Returns true if the set is empty.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns the set without the given types.
    pub fn without(self, other: DepTypes) -> DepTypes {
        DepTypes(self.0 & !other.0)
    }

    /// Returns the raw bits.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Builds a set from raw bits, ignoring unknown bits.
    pub fn from_bits(bits: u8) -> DepTypes {
        DepTypes(bits & Self::ALL.0)
    }

    /// Iterates over the types in the set in a fixed order.
    pub fn iter(self) -> impl Iterator<Item = DepType> {
        DepType::iter().filter(move |ty| self.contains(*ty))
    }
}

impl From<DepType> for DepTypes {
    fn from(ty: DepType) -> Self {
        DepTypes(ty.bit())
    }
}

impl FromIterator<DepType> for DepTypes {
    fn from_iter<T: IntoIterator<Item = DepType>>(iter: T) -> Self {
        iter.into_iter().fold(DepTypes::NONE, |acc, ty| acc | ty.into())
    }
}

impl BitOr for DepTypes {
    type Output = DepTypes;

    fn bitor(self, rhs: Self) -> Self::Output {
        DepTypes(self.0 | rhs.0)
    }
}

impl BitOrAssign for DepTypes {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl FromStr for DepTypes {
    type Err = ParseDepTypeError;

    /// Parses a comma separated list such as `build,link`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| DepType::from_str(s).map_err(|_| ParseDepTypeError(s.to_string())))
            .collect()
    }
}

impl Display for DepTypes {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.iter().format(","))
    }
}

impl Serialize for DepTypes {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter().map(|ty| ty.to_string()))
    }
}

impl<'de> Deserialize<'de> for DepTypes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let types = Vec::<String>::deserialize(deserializer)?;
        types
            .iter()
            .map(|s| DepType::from_str(s).map_err(serde::de::Error::custom))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::{DepType, DepTypes};

    #[test]
    fn test_parse_and_display() {
        let types = DepTypes::from_str("link,build").unwrap();
        assert_eq!(types, DepTypes::BUILD_LINK);
        assert_eq!(types.to_string(), "build,link");
        assert!(types.contains(DepType::Link));
        assert!(!types.contains(DepType::Run));
        assert!(DepTypes::from_str("install").is_err());
    }

    #[test]
    fn test_set_operations() {
        let types = DepTypes::BUILD | DepTypes::TEST;
        assert!(!types.intersects(DepTypes::LINK_RUN));
        assert_eq!(types.without(DepTypes::TEST), DepTypes::BUILD);
        assert!(types.without(DepTypes::ALL).is_empty());
    }
}
