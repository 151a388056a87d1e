use std::str::FromStr;

use spackle_types::{
    ConflictDeclaration, DeclaredVersion, DepTypes, DependencyDeclaration, PackageDefinition,
    ProvidesDeclaration, Spec, VariantDefinition, Version,
};

/// Builds package metadata for tests without spelling out every field.
#[derive(Clone)]
pub struct PackageBuilder {
    package: PackageDefinition,
}

fn spec(text: &str) -> Spec {
    Spec::from_str(text).unwrap_or_else(|err| panic!("invalid spec '{text}': {err}"))
}

impl PackageBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            package: PackageDefinition::new(name),
        }
    }

    /// Declares plain versions. The newest one is preferred by default.
    pub fn versions<'a>(mut self, versions: impl IntoIterator<Item = &'a str>) -> Self {
        self.package.versions.extend(
            versions
                .into_iter()
                .map(|v| DeclaredVersion::from(Version::from_str(v).unwrap())),
        );
        self
    }

    pub fn preferred_version(mut self, version: &str) -> Self {
        self.package.versions.push(DeclaredVersion {
            version: Version::from_str(version).unwrap(),
            preferred: true,
            deprecated: false,
        });
        self
    }

    pub fn deprecated_version(mut self, version: &str) -> Self {
        self.package.versions.push(DeclaredVersion {
            version: Version::from_str(version).unwrap(),
            preferred: false,
            deprecated: true,
        });
        self
    }

    pub fn variant(mut self, variant: VariantDefinition) -> Self {
        self.package.variants.push(variant);
        self
    }

    pub fn bool_variant(self, name: &str, default: bool) -> Self {
        self.variant(VariantDefinition::boolean(name, default))
    }

    /// A build and link dependency.
    pub fn depends_on(self, dependency: &str) -> Self {
        self.depends_on_when(dependency, "", DepTypes::BUILD_LINK)
    }

    pub fn depends_on_when(mut self, dependency: &str, when: &str, deptypes: DepTypes) -> Self {
        self.package.dependencies.push(DependencyDeclaration {
            spec: spec(dependency),
            when: if when.is_empty() { Spec::default() } else { spec(when) },
            deptypes,
        });
        self
    }

    pub fn conflicts(mut self, conflict: &str, when: &str) -> Self {
        self.package.conflicts.push(ConflictDeclaration {
            conflict: spec(conflict),
            when: spec(when),
            message: None,
        });
        self
    }

    pub fn provides(mut self, virtual_spec: &str) -> Self {
        self.package.provides.push(ProvidesDeclaration {
            virtual_spec: spec(virtual_spec),
            when: Spec::default(),
        });
        self
    }

    pub fn tag(mut self, tag: &str) -> Self {
        self.package.tags.push(tag.to_string());
        self
    }

    pub fn build(self) -> PackageDefinition {
        self.package
    }
}

impl From<PackageBuilder> for PackageDefinition {
    fn from(builder: PackageBuilder) -> Self {
        builder.build()
    }
}
