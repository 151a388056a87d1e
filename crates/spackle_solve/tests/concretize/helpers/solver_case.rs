use std::{str::FromStr, sync::Arc};

use spackle_config::SiteConfig;
use spackle_solve::{
    InMemoryStore, SolveError, SolveOptions, SolveResult, Solver, TestDependencies,
};
use spackle_types::{InMemoryRepository, PackageDefinition, Spec};

/// The site every case starts from: a single compiler and the default platform.
const BASE_CONFIG: &str = r#"
[[compilers]]
spec = "gcc@12.3.0"
"#;

/// A declarative concretization scenario.
///
/// A case names the packages in the repository, the site configuration, the specs that are
/// already installed and the specs to concretize. Expectations are spec constraints that some
/// node of the solution must (or must not) satisfy. Failures report the name of the case
/// together with the solution tree.
#[derive(Clone)]
pub struct SolverCase<'a> {
    name: &'a str,
    packages: Vec<PackageDefinition>,
    config: String,
    installed: Vec<&'a str>,
    specs: Vec<&'a str>,
    tests: TestDependencies,
    expect_present: Vec<&'a str>,
    expect_absent: Vec<&'a str>,
}

impl<'a> SolverCase<'a> {
    pub fn new(name: &'a str) -> Self {
        Self {
            name,
            packages: Vec::new(),
            config: BASE_CONFIG.to_string(),
            installed: Vec::new(),
            specs: Vec::new(),
            tests: TestDependencies::None,
            expect_present: Vec::new(),
            expect_absent: Vec::new(),
        }
    }

    pub fn packages<P: Into<PackageDefinition>>(mut self, packages: impl IntoIterator<Item = P>) -> Self {
        self.packages.extend(packages.into_iter().map(Into::into));
        self
    }

    /// Appends TOML to the site configuration.
    pub fn config(mut self, toml: &str) -> Self {
        self.config.push('\n');
        self.config.push_str(toml);
        self
    }

    /// Specs that are concretized from scratch and stored before the case is solved.
    pub fn installed(mut self, specs: impl IntoIterator<Item = &'a str>) -> Self {
        self.installed.extend(specs);
        self
    }

    pub fn specs(mut self, specs: impl IntoIterator<Item = &'a str>) -> Self {
        self.specs = specs.into_iter().collect();
        self
    }

    pub fn tests(mut self, tests: TestDependencies) -> Self {
        self.tests = tests;
        self
    }

    pub fn expect_present(mut self, specs: impl IntoIterator<Item = &'a str>) -> Self {
        self.expect_present.extend(specs);
        self
    }

    pub fn expect_absent(mut self, specs: impl IntoIterator<Item = &'a str>) -> Self {
        self.expect_absent.extend(specs);
        self
    }

    pub fn repository(&self) -> InMemoryRepository {
        self.packages.iter().cloned().collect()
    }

    pub fn site_config(&self) -> SiteConfig {
        SiteConfig::from_toml_str(&self.config)
            .unwrap_or_else(|err| panic!("solver case '{}' has an invalid config: {err}", self.name))
    }

    fn parsed_specs(&self) -> Vec<Spec> {
        self.specs.iter().map(|s| Spec::from_str(s).unwrap()).collect()
    }

    /// Concretizes the installed specs without reuse and puts them in a store.
    pub fn store(&self, repository: &InMemoryRepository, config: &SiteConfig) -> Arc<InMemoryStore> {
        let store = Arc::new(InMemoryStore::new("local"));
        for text in &self.installed {
            let spec = Spec::from_str(text).unwrap();
            let result = Solver::new(repository, config)
                .solve(&[spec], &SolveOptions::default())
                .unwrap_or_else(|err| panic!("cannot install '{text}': {err}"));
            for concrete in result.concrete_specs() {
                store.insert(concrete.clone()).unwrap();
            }
        }
        store
    }

    pub fn solve(&self) -> Result<SolveResult, SolveError> {
        let repository = self.repository();
        let config = self.site_config();
        let store = self.store(&repository, &config);
        let options = SolveOptions { tests: self.tests };
        let result = Solver::new(&repository, &config)
            .with_source(store)
            .solve(&self.parsed_specs(), &options);
        result
    }

    /// Solves the case and checks the expectations.
    pub fn run(&self) -> SolveResult {
        let result = self
            .solve()
            .unwrap_or_else(|err| panic!("solver case '{}' failed: {err}", self.name));
        let trees = result
            .concrete_specs()
            .map(|s| s.tree())
            .collect::<Vec<_>>()
            .join("\n");
        for text in &self.expect_present {
            assert!(
                contains_match(&result, text),
                "solver case '{}': expected a node matching '{text}' in\n{trees}",
                self.name
            );
        }
        for text in &self.expect_absent {
            assert!(
                !contains_match(&result, text),
                "solver case '{}': expected no node matching '{text}' in\n{trees}",
                self.name
            );
        }
        result
    }

    /// Solves the case and returns the error it must fail with.
    pub fn run_err(&self) -> SolveError {
        match self.solve() {
            Ok(result) => panic!(
                "solver case '{}' succeeded unexpectedly:\n{}",
                self.name,
                result.concrete_specs().map(|s| s.tree()).collect::<Vec<_>>().join("\n")
            ),
            Err(err) => err,
        }
    }
}

fn contains_match(result: &SolveResult, text: &str) -> bool {
    let wanted = Spec::from_str(text).unwrap();
    result
        .concrete_specs()
        .flat_map(|root| root.traverse())
        .any(|node| node.satisfies(&wanted))
}

/// Returns every node of the solution named `name`, deduplicated by hash.
pub fn nodes_named<'r>(result: &'r SolveResult, name: &str) -> Vec<&'r Spec> {
    let mut nodes: Vec<&Spec> = result
        .concrete_specs()
        .flat_map(|root| root.traverse())
        .filter(|node| node.name.as_deref() == Some(name))
        .collect();
    nodes.sort_by(|a, b| a.dag_hash().cmp(&b.dag_hash()));
    nodes.dedup_by(|a, b| a.dag_hash() == b.dag_hash());
    nodes
}
