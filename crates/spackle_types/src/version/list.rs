use std::{
    cmp::Ordering,
    fmt::{self, Display, Formatter},
    str::FromStr,
};

use itertools::Itertools;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use super::{ParseVersionError, Version};

/// An inclusive range of versions. A missing bound is unbounded. The upper bound is matched as
/// a prefix, so `1.0:1.5` contains `1.5.3`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionRange {
    /// The lowest version in the range.
    pub lo: Option<Version>,
    /// The highest version (or version prefix) in the range.
    pub hi: Option<Version>,
}

impl VersionRange {
    /// A range that contains every version.
    pub fn any() -> Self {
        Self { lo: None, hi: None }
    }

    /// A range that contains all versions that start with the given version.
    pub fn prefix(version: Version) -> Self {
        Self {
            lo: Some(version.clone()),
            hi: Some(version),
        }
    }

    /// Returns true if the range contains the given version.
    pub fn contains(&self, version: &Version) -> bool {
        let above_lo = self.lo.as_ref().is_none_or(|lo| lo <= version);
        let below_hi = self
            .hi
            .as_ref()
            .is_none_or(|hi| version <= hi || hi.is_prefix_of(version));
        above_lo && below_hi
    }

    /// Returns true if every version in `self` is also in `other`.
    pub fn is_subset_of(&self, other: &VersionRange) -> bool {
        let lo_ok = match (&self.lo, &other.lo) {
            (_, None) => true,
            (None, Some(_)) => false,
            (Some(a), Some(b)) => b <= a,
        };
        lo_ok && cmp_upper(self.hi.as_ref(), other.hi.as_ref()) != Ordering::Greater
    }

    /// Returns true if there is at least one version in both ranges.
    pub fn intersects(&self, other: &VersionRange) -> bool {
        self.intersection(other).is_some()
    }

    /// Returns the range of versions in both ranges.
    pub fn intersection(&self, other: &VersionRange) -> Option<VersionRange> {
        let lo = match (&self.lo, &other.lo) {
            (None, lo) | (lo, None) => lo.clone(),
            (Some(a), Some(b)) => Some(a.max(b).clone()),
        };
        let hi = match cmp_upper(self.hi.as_ref(), other.hi.as_ref()) {
            Ordering::Greater => other.hi.clone(),
            _ => self.hi.clone(),
        };
        let range = VersionRange { lo, hi };
        match (&range.lo, &range.hi) {
            (Some(lo), Some(hi)) if lo > hi && !hi.is_prefix_of(lo) => None,
            _ => Some(range),
        }
    }
}

/// Compares two upper bounds. An upper bound that is a prefix of another bound covers more
/// versions, so it compares greater.
fn cmp_upper(a: Option<&Version>, b: Option<&Version>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) if a == b => Ordering::Equal,
        (Some(a), Some(b)) if a.is_prefix_of(b) => Ordering::Greater,
        (Some(a), Some(b)) if b.is_prefix_of(a) => Ordering::Less,
        (Some(a), Some(b)) => a.cmp(b),
    }
}

impl Display for VersionRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match (&self.lo, &self.hi) {
            (Some(lo), Some(hi)) if lo == hi => write!(f, "{lo}"),
            (lo, hi) => {
                if let Some(lo) = lo {
                    write!(f, "{lo}")?;
                }
                write!(f, ":")?;
                if let Some(hi) = hi {
                    write!(f, "{hi}")?;
                }
                Ok(())
            }
        }
    }
}

/// One element of a [`VersionList`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VersionItem {
    /// Exactly this version, written `=1.2`. Unlike a plain `1.2` it does not match `1.2.1`.
    Exact(Version),

    /// A range of versions.
    Range(VersionRange),
}

impl VersionItem {
    /// Returns true if the item contains the version.
    pub fn contains(&self, version: &Version) -> bool {
        match self {
            VersionItem::Exact(v) => v == version,
            VersionItem::Range(r) => r.contains(version),
        }
    }

    fn is_subset_of(&self, other: &VersionItem) -> bool {
        match (self, other) {
            (VersionItem::Exact(v), other) => other.contains(v),
            (VersionItem::Range(_), VersionItem::Exact(_)) => false,
            (VersionItem::Range(a), VersionItem::Range(b)) => a.is_subset_of(b),
        }
    }

    fn intersection(&self, other: &VersionItem) -> Option<VersionItem> {
        match (self, other) {
            (VersionItem::Exact(v), other) | (other, VersionItem::Exact(v)) => {
                other.contains(v).then(|| VersionItem::Exact(v.clone()))
            }
            (VersionItem::Range(a), VersionItem::Range(b)) => {
                a.intersection(b).map(VersionItem::Range)
            }
        }
    }
}

impl Display for VersionItem {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            VersionItem::Exact(v) => write!(f, "={v}"),
            VersionItem::Range(r) => write!(f, "{r}"),
        }
    }
}

/// A union of versions and version ranges, e.g. `1.2:1.4,=2.0.1`. This is the version constraint
/// of an abstract spec. A list without items contains no version at all; use
/// [`VersionList::any`] for the unconstrained list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VersionList {
    items: Vec<VersionItem>,
}

/// An error that occurred while parsing a [`VersionList`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseVersionListError {
    /// One of the versions in the list is invalid.
    #[error(transparent)]
    InvalidVersion(#[from] ParseVersionError),

    /// The list contained an empty element.
    #[error("empty element in version list '{0}'")]
    EmptyElement(String),

    /// A range had more than one `:`.
    #[error("invalid version range '{0}'")]
    InvalidRange(String),
}

impl Default for VersionList {
    fn default() -> Self {
        Self::any()
    }
}

impl VersionList {
    /// The list that contains every version.
    pub fn any() -> Self {
        Self {
            items: vec![VersionItem::Range(VersionRange::any())],
        }
    }

    /// A list with a single exact version.
    pub fn exact(version: Version) -> Self {
        Self {
            items: vec![VersionItem::Exact(version)],
        }
    }

    /// Returns the items of the list.
    pub fn items(&self) -> &[VersionItem] {
        &self.items
    }

    /// Returns true if the list places no restriction on the version.
    pub fn is_any(&self) -> bool {
        self.items
            .iter()
            .any(|item| matches!(item, VersionItem::Range(r) if r.lo.is_none() && r.hi.is_none()))
    }

    /// Returns true if no version satisfies the list.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns the version if this list pins exactly one version.
    pub fn concrete(&self) -> Option<&Version> {
        match self.items.as_slice() {
            [VersionItem::Exact(v)] => Some(v),
            _ => None,
        }
    }

    /// Returns true if the version is in the list.
    pub fn contains(&self, version: &Version) -> bool {
        self.items.iter().any(|item| item.contains(version))
    }

    /// Returns true if every version in `self` is also in `other`.
    pub fn satisfies(&self, other: &VersionList) -> bool {
        other.is_any()
            || self
                .items
                .iter()
                .all(|item| other.items.iter().any(|o| item.is_subset_of(o)))
    }

    /// Returns true if some version is in both lists.
    pub fn intersects(&self, other: &VersionList) -> bool {
        self.items
            .iter()
            .cartesian_product(other.items.iter())
            .any(|(a, b)| a.intersection(b).is_some())
    }

    /// Returns the list of versions contained in both lists.
    pub fn intersection(&self, other: &VersionList) -> VersionList {
        if other.is_any() {
            return self.clone();
        }
        if self.is_any() {
            return other.clone();
        }
        let mut items: Vec<VersionItem> = Vec::new();
        for item in self
            .items
            .iter()
            .cartesian_product(other.items.iter())
            .filter_map(|(a, b)| a.intersection(b))
        {
            if !items.contains(&item) {
                items.push(item);
            }
        }
        VersionList { items }
    }
}

impl FromStr for VersionList {
    type Err = ParseVersionListError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ParseVersionListError::EmptyElement(s.to_string()));
        }
        let items = s
            .split(',')
            .map(|element| parse_item(s, element.trim()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(VersionList { items })
    }
}

fn parse_item(list: &str, element: &str) -> Result<VersionItem, ParseVersionListError> {
    if element.is_empty() {
        return Err(ParseVersionListError::EmptyElement(list.to_string()));
    }
    if let Some(exact) = element.strip_prefix('=') {
        return Ok(VersionItem::Exact(Version::from_str(exact)?));
    }
    let bound = |text: &str| -> Result<Option<Version>, ParseVersionListError> {
        if text.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Version::from_str(text)?))
        }
    };
    match element.split(':').collect::<Vec<_>>().as_slice() {
        [single] => Ok(VersionItem::Range(VersionRange::prefix(Version::from_str(
            single,
        )?))),
        [lo, hi] => Ok(VersionItem::Range(VersionRange {
            lo: bound(lo)?,
            hi: bound(hi)?,
        })),
        _ => Err(ParseVersionListError::InvalidRange(element.to_string())),
    }
}

impl Display for VersionList {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.items.iter().format(","))
    }
}

impl Serialize for VersionList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VersionList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        VersionList::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use rstest::rstest;

    use super::VersionList;
    use crate::Version;

    fn v(s: &str) -> Version {
        Version::from_str(s).unwrap()
    }

    fn l(s: &str) -> VersionList {
        VersionList::from_str(s).unwrap()
    }

    #[rstest]
    #[case("1.0:1.5", "1.2", true)]
    #[case("1.0:1.5", "1.6", false)]
    #[case("1.0:1.5", "1.5.9", true)]
    #[case(":1.5", "0.1", true)]
    #[case("2:", "10.0", true)]
    #[case("1.2", "1.2.3", true)]
    #[case("=1.2", "1.2.3", false)]
    #[case("=1.2", "1.2", true)]
    #[case("1.0,2.0", "2.0.1", true)]
    #[case(":", "develop", true)]
    fn test_contains(#[case] list: &str, #[case] version: &str, #[case] expected: bool) {
        assert_eq!(l(list).contains(&v(version)), expected);
    }

    #[rstest]
    #[case("1.2:1.3", "1.0:1.5", true)]
    #[case("1.0:1.5", "1.2:1.3", false)]
    #[case("=1.2", "1.2", true)]
    #[case("1.2", "=1.2", false)]
    #[case("1.2.3", "1.2", true)]
    #[case("1.2:", ":", true)]
    fn test_satisfies(#[case] a: &str, #[case] b: &str, #[case] expected: bool) {
        assert_eq!(l(a).satisfies(&l(b)), expected);
    }

    #[test]
    fn test_intersection() {
        assert_eq!(l("1.0:1.5").intersection(&l("1.3:2.0")), l("1.3:1.5"));
        assert_eq!(l("1.2").intersection(&l("1.2.4")), l("1.2.4"));
        assert!(l("1.0:1.2").intersection(&l("1.4:")).is_empty());
        assert!(!l("1.0:1.2").intersects(&l("1.4:")));
        assert!(l("1.0:1.2").intersects(&l("=1.1")));
        assert_eq!(l("=1.1").intersection(&l(":")).concrete(), Some(&v("1.1")));
    }

    #[test]
    fn test_display() {
        assert_eq!(l("1.0:1.5,=2.0").to_string(), "1.0:1.5,=2.0");
        assert_eq!(l(":1.5").to_string(), ":1.5");
        assert_eq!(l("1.2").to_string(), "1.2");
        assert_eq!(VersionList::any().to_string(), ":");
    }
}
