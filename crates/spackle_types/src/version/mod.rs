use std::{
    cmp::Ordering,
    fmt::{self, Display, Formatter},
    hash::{Hash, Hasher},
    str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use smallvec::SmallVec;
use thiserror::Error;

pub use list::{ParseVersionListError, VersionItem, VersionList, VersionRange};

mod list;

/// Version names that compare greater than any numeric version. Later entries compare greater
/// than earlier ones, so `develop` is the newest version of all.
const INFINITY_VERSIONS: [&str; 6] = ["stable", "trunk", "head", "master", "main", "develop"];

/// A single piece of a [`Version`]. Versions are split at separators (`.`, `-`, `_`) and at every
/// boundary between digits and letters, so `1.2rc3` becomes `[1, 2, "rc", 3]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Component {
    /// A run of digits.
    Numeric(u64),

    /// A run of letters.
    Alpha(String),
}

impl Component {
    /// Returns the rank of this component among the infinity versions, if it is one.
    fn infinity_rank(&self) -> Option<usize> {
        match self {
            Component::Alpha(s) => INFINITY_VERSIONS.iter().position(|inf| *inf == s.as_str()),
            Component::Numeric(_) => None,
        }
    }
}

impl Ord for Component {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Component::Numeric(a), Component::Numeric(b)) => a.cmp(b),
            (Component::Alpha(a), Component::Alpha(b)) => {
                match (self.infinity_rank(), other.infinity_rank()) {
                    (Some(a), Some(b)) => a.cmp(&b),
                    (Some(_), None) => Ordering::Greater,
                    (None, Some(_)) => Ordering::Less,
                    (None, None) => a.cmp(b),
                }
            }
            (Component::Alpha(_), Component::Numeric(_)) => {
                if self.infinity_rank().is_some() {
                    Ordering::Greater
                } else {
                    Ordering::Less
                }
            }
            (Component::Numeric(_), Component::Alpha(_)) => other.cmp(self).reverse(),
        }
    }
}

impl PartialOrd for Component {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for Component {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Component::Numeric(n) => write!(f, "{n}"),
            Component::Alpha(s) => write!(f, "{s}"),
        }
    }
}

/// A concrete version of a package such as `1.2.3`, `2.0rc1` or `develop`.
///
/// Versions compare component-wise. Digits compare numerically, letters lexicographically and
/// letters sort before digits, except for the well-known development branch names (`develop`,
/// `main`, `master`, `head`, `trunk`, `stable`) which sort after every numeric version. When one
/// version is a prefix of the other, the shorter one is smaller: `1.2 < 1.2.0 < 1.2.1`.
///
/// Separators are not significant for comparison, `1.2-3` and `1.2.3` are equal, but the
/// original text is kept for display.
#[derive(Clone)]
pub struct Version {
    source: Box<str>,
    components: SmallVec<[Component; 4]>,
}

/// An error that occurred while parsing a [`Version`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseVersionError {
    /// The version string was empty.
    #[error("empty version string")]
    Empty,

    /// The version contained a character that is not allowed.
    #[error("invalid character '{1}' in version '{0}'")]
    InvalidCharacter(String, char),

    /// A numeric component did not fit in 64 bits.
    #[error("numeric component of '{0}' is too large")]
    Overflow(String),
}

impl Version {
    /// Returns the components this version consists of.
    pub fn components(&self) -> &[Component] {
        &self.components
    }

    /// Returns the original text of the version.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Returns true if `self` is a component-wise prefix of `other`. Every version is a prefix
    /// of itself.
    pub fn is_prefix_of(&self, other: &Version) -> bool {
        self.components.len() <= other.components.len()
            && self
                .components
                .iter()
                .zip(other.components.iter())
                .all(|(a, b)| a == b)
    }

    /// Returns true if this version refers to a development branch rather than a release.
    pub fn is_develop(&self) -> bool {
        self.components.iter().any(|c| c.infinity_rank().is_some())
    }

    /// Returns the version truncated to the first `n` components, e.g. `1.2` for `1.2.3`.
    pub fn up_to(&self, n: usize) -> Option<Version> {
        if n == 0 || n > self.components.len() {
            return None;
        }
        let text = self
            .components
            .iter()
            .take(n)
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(".");
        Version::from_str(&text).ok()
    }
}

impl FromStr for Version {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseVersionError::Empty);
        }

        let mut components = SmallVec::new();
        let mut current = String::new();
        let mut current_is_digit = false;

        let mut flush = |current: &mut String, is_digit: bool| -> Result<(), ParseVersionError> {
            if current.is_empty() {
                return Ok(());
            }
            let component = if is_digit {
                Component::Numeric(
                    current
                        .parse()
                        .map_err(|_| ParseVersionError::Overflow(s.to_string()))?,
                )
            } else {
                Component::Alpha(current.to_ascii_lowercase())
            };
            components.push(component);
            current.clear();
            Ok(())
        };

        for c in s.chars() {
            match c {
                '.' | '-' | '_' => flush(&mut current, current_is_digit)?,
                c if c.is_ascii_alphanumeric() => {
                    let is_digit = c.is_ascii_digit();
                    if !current.is_empty() && is_digit != current_is_digit {
                        flush(&mut current, current_is_digit)?;
                    }
                    current_is_digit = is_digit;
                    current.push(c);
                }
                c => return Err(ParseVersionError::InvalidCharacter(s.to_string(), c)),
            }
        }
        flush(&mut current, current_is_digit)?;

        if components.is_empty() {
            return Err(ParseVersionError::Empty);
        }

        Ok(Version {
            source: s.into(),
            components,
        })
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.components == other.components
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.components.hash(state);
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.components.iter().cmp(other.components.iter())
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Version({})", self.source)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Version::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use rstest::rstest;

    use super::Version;

    #[rstest]
    #[case("1.2", "1.10")]
    #[case("1.2", "1.2.0")]
    #[case("1.2rc1", "1.2.0")]
    #[case("1.2a", "1.2.1")]
    #[case("2.0", "develop")]
    #[case("master", "develop")]
    #[case("main", "develop")]
    #[case("1.0.0", "1.0.1")]
    fn test_ordering(#[case] smaller: &str, #[case] larger: &str) {
        let smaller = Version::from_str(smaller).unwrap();
        let larger = Version::from_str(larger).unwrap();
        assert!(smaller < larger, "{smaller} should be smaller than {larger}");
    }

    #[test]
    fn test_separators_are_not_significant() {
        assert_eq!(
            Version::from_str("1.2-3").unwrap(),
            Version::from_str("1_2.3").unwrap()
        );
        assert_eq!(Version::from_str("1.2-3").unwrap().to_string(), "1.2-3");
    }

    #[test]
    fn test_prefix() {
        let short = Version::from_str("1.2").unwrap();
        let long = Version::from_str("1.2.7").unwrap();
        assert!(short.is_prefix_of(&long));
        assert!(!long.is_prefix_of(&short));
        assert!(short.is_prefix_of(&short));
        assert!(!Version::from_str("1.20").unwrap().is_prefix_of(&long));
    }

    #[test]
    fn test_develop() {
        assert!(Version::from_str("develop").unwrap().is_develop());
        assert!(!Version::from_str("1.2.3").unwrap().is_develop());
        assert_eq!(
            Version::from_str("1.2.3").unwrap().up_to(2).unwrap(),
            Version::from_str("1.2").unwrap()
        );
    }

    #[test]
    fn test_invalid() {
        assert!(Version::from_str("").is_err());
        assert!(Version::from_str("1.2+local").is_err());
        assert!(Version::from_str("...").is_err());
    }
}
