use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::VersionList;

/// A compiler constraint or a concrete compiler, written `%gcc@12.1.0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompilerSpec {
    /// The name of the compiler.
    pub name: String,
    /// The acceptable versions.
    pub versions: VersionList,
}

impl CompilerSpec {
    /// A compiler constraint that accepts any version.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            versions: VersionList::any(),
        }
    }

    /// Returns true if `self` is at least as constrained as `other`.
    pub fn satisfies(&self, other: &CompilerSpec) -> bool {
        self.name == other.name && self.versions.satisfies(&other.versions)
    }

    /// Returns true if some compiler could match both.
    pub fn intersects(&self, other: &CompilerSpec) -> bool {
        self.name == other.name && self.versions.intersects(&other.versions)
    }

    /// Returns true if the version is pinned.
    pub fn is_concrete(&self) -> bool {
        self.versions.concrete().is_some()
    }
}

impl Display for CompilerSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.name)?;
        if let Some(version) = self.versions.concrete() {
            write!(f, "@{version}")
        } else if !self.versions.is_any() {
            write!(f, "@{}", self.versions)
        } else {
            Ok(())
        }
    }
}
