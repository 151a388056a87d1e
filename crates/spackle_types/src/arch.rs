use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// The architecture of a spec: platform, operating system and microarchitecture target. Each
/// part is unset until concretized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArchSpec {
    /// The platform, e.g. `linux`.
    pub platform: Option<String>,
    /// The operating system, e.g. `ubuntu22.04`.
    pub os: Option<String>,
    /// The microarchitecture target, e.g. `x86_64_v3`.
    pub target: Option<String>,
}

impl ArchSpec {
    /// Parses the value of `arch=platform-os-target`. Empty parts (or `None`) are left unset.
    pub fn from_triplet(triplet: &str) -> Self {
        let mut parts = triplet.splitn(3, '-').map(|part| match part {
            "" | "None" => None,
            part => Some(part.to_string()),
        });
        Self {
            platform: parts.next().flatten(),
            os: parts.next().flatten(),
            target: parts.next().flatten(),
        }
    }

    /// Returns true if no part is set.
    pub fn is_empty(&self) -> bool {
        self.platform.is_none() && self.os.is_none() && self.target.is_none()
    }

    /// Returns true if every part is set.
    pub fn is_concrete(&self) -> bool {
        self.platform.is_some() && self.os.is_some() && self.target.is_some()
    }

    /// Returns true if every part set in `other` has the same value in `self`.
    pub fn satisfies(&self, other: &ArchSpec) -> bool {
        fn part(ours: &Option<String>, theirs: &Option<String>) -> bool {
            theirs.is_none() || ours == theirs
        }
        part(&self.platform, &other.platform)
            && part(&self.os, &other.os)
            && part(&self.target, &other.target)
    }

    /// Returns true if no part is set to different values in both.
    pub fn intersects(&self, other: &ArchSpec) -> bool {
        fn part(ours: &Option<String>, theirs: &Option<String>) -> bool {
            match (ours, theirs) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
        }
        part(&self.platform, &other.platform)
            && part(&self.os, &other.os)
            && part(&self.target, &other.target)
    }

    /// Fills the parts of `self` that are unset with the parts of `other`.
    pub fn constrain(&mut self, other: &ArchSpec) {
        if self.platform.is_none() {
            self.platform.clone_from(&other.platform);
        }
        if self.os.is_none() {
            self.os.clone_from(&other.os);
        }
        if self.target.is_none() {
            self.target.clone_from(&other.target);
        }
    }
}

impl Display for ArchSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let part = |p: &Option<String>| p.clone().unwrap_or_else(|| "None".to_string());
        write!(
            f,
            "{}-{}-{}",
            part(&self.platform),
            part(&self.os),
            part(&self.target)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::ArchSpec;

    #[test]
    fn test_triplet() {
        let arch = ArchSpec::from_triplet("linux-ubuntu22.04-x86_64");
        assert_eq!(arch.platform.as_deref(), Some("linux"));
        assert_eq!(arch.os.as_deref(), Some("ubuntu22.04"));
        assert_eq!(arch.target.as_deref(), Some("x86_64"));
        assert_eq!(arch.to_string(), "linux-ubuntu22.04-x86_64");

        let partial = ArchSpec::from_triplet("linux-None-x86_64");
        assert!(partial.os.is_none());
        assert!(arch.satisfies(&partial));
        assert!(!partial.satisfies(&arch));
        assert!(partial.intersects(&arch));
    }
}
