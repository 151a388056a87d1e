//! Computes the packages that may appear in a solution and how many nodes each may have.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use spackle_config::{config::concretizer::DuplicateStrategy, SiteConfig};
use spackle_types::{DepType, DepTypes, PackageRepository, RepositoryError, Spec};

use crate::error::SolveError;

/// The tag that marks packages that may be built twice under the minimal duplicate strategy.
pub const BUILD_TOOLS_TAG: &str = "build-tools";

/// Whether test dependencies of a package are part of the solve.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct TestScope {
    pub all: bool,
    pub packages: BTreeSet<String>,
}

impl TestScope {
    pub fn deptypes(&self, package: &str, declared: DepTypes) -> DepTypes {
        if self.all || self.packages.contains(package) {
            declared
        } else {
            declared.without(DepTypes::TEST)
        }
    }
}

/// Every package and virtual that can be reached from the requested specs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct PossibleGraph {
    pub packages: BTreeSet<String>,
    pub virtuals: BTreeSet<String>,
    /// Packages that may have more than one node, with their cap.
    pub max_dupes: BTreeMap<String, usize>,
}

impl PossibleGraph {
    pub fn contains(&self, name: &str) -> bool {
        self.packages.contains(name) || self.virtuals.contains(name)
    }
}

fn unknown(spec: &Spec, err: RepositoryError) -> SolveError {
    let reason = match err {
        RepositoryError::UnknownPackage(name) => format!("package '{name}' does not exist"),
        RepositoryError::UnknownNamespace { namespace, name } => {
            format!("namespace '{namespace}' of package '{name}' does not exist")
        }
    };
    SolveError::input(format!("cannot concretize '{spec}'"), reason)
}

/// Checks that every node of a requested spec names a known package or virtual.
pub(crate) fn check_names<R: PackageRepository + ?Sized>(
    repository: &R,
    spec: &Spec,
) -> Result<(), SolveError> {
    for node in spec.traverse() {
        let Some(name) = node.name.as_deref() else {
            if std::ptr::eq(node, spec) {
                return Err(SolveError::input(
                    format!("cannot concretize '{spec}'"),
                    "a requested spec must name a package",
                ));
            }
            continue;
        };
        if repository.is_virtual(name) {
            if let Some(namespace) = &node.namespace {
                return Err(unknown(
                    spec,
                    RepositoryError::UnknownNamespace {
                        namespace: namespace.clone(),
                        name: name.to_string(),
                    },
                ));
            }
            continue;
        }
        repository
            .get(node.namespace.as_deref(), name)
            .map_err(|err| unknown(spec, err))?;
    }
    Ok(())
}

/// Walks the dependency declarations from the requested specs and the compiler runtimes.
pub(crate) fn possible_graph<R: PackageRepository + ?Sized>(
    repository: &R,
    config: &SiteConfig,
    specs: &[Spec],
    runtimes: &[String],
    tests: &TestScope,
) -> Result<PossibleGraph, SolveError> {
    let mut graph = PossibleGraph::default();
    let mut queue: VecDeque<String> = VecDeque::new();
    for spec in specs {
        check_names(repository, spec)?;
        queue.extend(spec.traverse().into_iter().filter_map(|s| s.name.clone()));
    }
    queue.extend(runtimes.iter().cloned());

    // Edges between packages, used to count duplicates.
    let mut edges: BTreeMap<String, Vec<(String, DepTypes)>> = BTreeMap::new();
    while let Some(name) = queue.pop_front() {
        if graph.contains(&name) {
            continue;
        }
        if repository.is_virtual(&name) {
            graph.virtuals.insert(name.clone());
            queue.extend(repository.providers_for(&name).into_iter().map(str::to_string));
            continue;
        }
        let package = match repository.get(None, &name) {
            Ok(package) => package,
            Err(RepositoryError::UnknownPackage(_)) => {
                tracing::trace!("'{name}' is not a known package, skipping");
                continue;
            }
            Err(err) => {
                return Err(SolveError::input(
                    format!("cannot load '{name}'"),
                    err.to_string(),
                ))
            }
        };
        graph.packages.insert(name.clone());
        for dependency in &package.dependencies {
            let Some(child) = dependency.spec.name.as_deref() else {
                continue;
            };
            let types = tests.deptypes(&name, dependency.deptypes);
            if types.is_empty() {
                continue;
            }
            let children: Vec<String> = if repository.is_virtual(child) {
                repository
                    .providers_for(child)
                    .into_iter()
                    .map(str::to_string)
                    .collect()
            } else {
                vec![child.to_string()]
            };
            for resolved in children {
                edges.entry(name.clone()).or_default().push((resolved, types));
            }
            queue.push_back(child.to_string());
        }
    }

    graph.max_dupes = match config.concretizer.duplicate_strategy() {
        DuplicateStrategy::None => BTreeMap::new(),
        DuplicateStrategy::Minimal => graph
            .packages
            .iter()
            .filter(|name| {
                repository
                    .get(None, name)
                    .is_ok_and(|p| p.has_tag(BUILD_TOOLS_TAG))
            })
            .map(|name| (name.clone(), config.concretizer.max_dupes(name)))
            .filter(|(_, cap)| *cap > 1)
            .collect(),
        DuplicateStrategy::Full => {
            let roots: Vec<String> = specs.iter().filter_map(|s| s.name.clone()).collect();
            count_duplicates(&roots, &edges)
                .into_iter()
                .map(|(name, count)| {
                    let cap = count.min(config.concretizer.max_dupes(&name));
                    (name, cap)
                })
                .filter(|(_, cap)| *cap > 1)
                .collect()
        }
    };
    tracing::debug!(
        "possible graph has {} packages, {} virtuals and {} duplicable packages",
        graph.packages.len(),
        graph.virtuals.len(),
        graph.max_dupes.len()
    );
    Ok(graph)
}

/// Counts in how many of the link/run subgraph and the pure build subgraphs a package occurs.
fn count_duplicates(
    roots: &[String],
    edges: &BTreeMap<String, Vec<(String, DepTypes)>>,
) -> BTreeMap<String, usize> {
    let walk = |start: Vec<String>, follow: DepTypes| {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<String> = start.into();
        while let Some(name) = queue.pop_front() {
            if !seen.insert(name.clone()) {
                continue;
            }
            for (child, types) in edges.get(&name).into_iter().flatten() {
                if types.intersects(follow) {
                    queue.push_back(child.clone());
                }
            }
        }
        seen
    };

    let link_run = walk(roots.to_vec(), DepTypes::LINK_RUN);
    let build_roots: Vec<String> = edges
        .values()
        .flatten()
        .filter(|(_, types)| {
            types.contains(DepType::Build) && !types.intersects(DepTypes::LINK_RUN)
        })
        .map(|(child, _)| child.clone())
        .collect();
    let build = walk(build_roots, DepTypes::ALL);

    let mut counts = BTreeMap::new();
    for name in link_run.iter().chain(build.iter()) {
        *counts.entry(name.clone()).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use assert_matches::assert_matches;
    use spackle_config::{config::concretizer::DuplicateStrategy, SiteConfig};
    use spackle_types::{
        DepTypes, DependencyDeclaration, InMemoryRepository, PackageDefinition,
        ProvidesDeclaration, Spec,
    };

    use super::{possible_graph, TestScope};
    use crate::error::SolveError;

    fn depends(spec: &str, deptypes: DepTypes) -> DependencyDeclaration {
        DependencyDeclaration {
            spec: Spec::from_str(spec).unwrap(),
            when: Spec::default(),
            deptypes,
        }
    }

    fn repository() -> InMemoryRepository {
        let mut app = PackageDefinition::new("app");
        app.dependencies = vec![
            depends("mpi", DepTypes::BUILD_LINK),
            depends("cmake", DepTypes::BUILD),
            depends("check", DepTypes::TEST),
        ];
        let mut openmpi = PackageDefinition::new("openmpi");
        openmpi.provides = vec![ProvidesDeclaration {
            virtual_spec: Spec::from_str("mpi").unwrap(),
            when: Spec::default(),
        }];
        openmpi.dependencies = vec![depends("cmake", DepTypes::BUILD_LINK)];
        let mut cmake = PackageDefinition::new("cmake");
        cmake.tags = vec!["build-tools".to_string()];
        [app, openmpi, cmake, PackageDefinition::new("check")]
            .into_iter()
            .collect()
    }

    fn config(strategy: DuplicateStrategy) -> SiteConfig {
        let mut config = SiteConfig::default();
        config.concretizer.duplicates.strategy = Some(strategy);
        config
    }

    #[test]
    fn test_closure_follows_virtuals_and_skips_tests() {
        let repo = repository();
        let specs = vec![Spec::from_str("app").unwrap()];
        let graph = possible_graph(
            &repo,
            &config(DuplicateStrategy::None),
            &specs,
            &[],
            &TestScope::default(),
        )
        .unwrap();
        assert_eq!(
            graph.packages.iter().map(String::as_str).collect::<Vec<_>>(),
            vec!["app", "cmake", "openmpi"]
        );
        assert!(graph.virtuals.contains("mpi"));
        assert!(graph.max_dupes.is_empty());

        let tests = TestScope {
            all: false,
            packages: ["app".to_string()].into(),
        };
        let graph =
            possible_graph(&repo, &config(DuplicateStrategy::None), &specs, &[], &tests).unwrap();
        assert!(graph.packages.contains("check"));
    }

    #[test]
    fn test_duplicate_strategies() {
        let repo = repository();
        let specs = vec![Spec::from_str("app").unwrap()];
        let scope = TestScope::default();
        let minimal =
            possible_graph(&repo, &config(DuplicateStrategy::Minimal), &specs, &[], &scope)
                .unwrap();
        assert_eq!(minimal.max_dupes.get("cmake"), Some(&2));
        assert_eq!(minimal.max_dupes.len(), 1);

        let full =
            possible_graph(&repo, &config(DuplicateStrategy::Full), &specs, &[], &scope).unwrap();
        assert_eq!(full.max_dupes.get("cmake"), Some(&2));
        assert!(!full.max_dupes.contains_key("app"));
    }

    #[test]
    fn test_unknown_names_are_input_errors() {
        let repo = repository();
        let scope = TestScope::default();
        let config = config(DuplicateStrategy::None);
        for text in ["nope", "app ^nope", "other.app"] {
            let specs = vec![Spec::from_str(text).unwrap()];
            let err = possible_graph(&repo, &config, &specs, &[], &scope).unwrap_err();
            assert_matches!(err, SolveError::Input(_), "{text}");
        }
    }
}
