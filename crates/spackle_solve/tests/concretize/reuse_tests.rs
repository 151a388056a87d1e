use std::{str::FromStr, sync::Arc};

use similar_asserts::assert_eq;
use spackle_config::SiteConfig;
use spackle_solve::{InMemoryStore, SolveOptions, Solver};
use spackle_types::{InMemoryRepository, PackageDefinition, Spec, VariantValue};

use crate::helpers::{PackageBuilder, SolverCase};

fn packages() -> Vec<PackageBuilder> {
    vec![
        PackageBuilder::new("pkg-a")
            .versions(["1.0", "2.0"])
            .bool_variant("feature", false)
            .depends_on("pkg-b"),
        PackageBuilder::new("pkg-b").versions(["1.2", "1.6"]),
    ]
}

#[test_log::test]
fn test_installed_spec_is_reused() {
    let case = SolverCase::new("reuse")
        .packages(packages())
        .installed(["pkg-a@1.0 +feature"])
        .specs(["pkg-a@1.0"]);
    let repository = case.repository();
    let config = case.site_config();
    let store = case.store(&repository, &config);
    let installed = store.read_transaction()[0].clone();

    let result = case.run();
    let concrete = &result.specs[0].1;
    assert_eq!(concrete.dag_hash(), installed.dag_hash());
    assert_eq!(
        concrete.variants.get("feature"),
        Some(&VariantValue::Bool(true))
    );
}

#[test_log::test]
fn test_reuse_can_be_disabled() {
    let result = SolverCase::new("no reuse")
        .packages(packages())
        .installed(["pkg-a@1.0 +feature"])
        .config("[concretizer]\nreuse = false\n")
        .specs(["pkg-a@1.0"])
        .run();
    assert_eq!(
        result.specs[0].1.variants.get("feature"),
        Some(&VariantValue::Bool(false))
    );
}

#[test_log::test]
fn test_reuse_is_idempotent() {
    let repository: InMemoryRepository = packages().into_iter().map(PackageDefinition::from).collect();
    let config = SiteConfig::default();
    let request = vec![Spec::from_str("pkg-a").unwrap()];

    let store = Arc::new(InMemoryStore::new("local"));
    let first = Solver::new(&repository, &config)
        .with_source(store.clone())
        .solve(&request, &SolveOptions::default())
        .unwrap();
    for concrete in first.concrete_specs() {
        store.insert(concrete.clone()).unwrap();
    }

    let second = Solver::new(&repository, &config)
        .with_source(store.clone())
        .solve(&request, &SolveOptions::default())
        .unwrap();
    assert_eq!(
        first.specs[0].1.dag_hash(),
        second.specs[0].1.dag_hash()
    );
    let built = second
        .criteria
        .iter()
        .find(|c| c.name == "number of packages to build (vs. reuse)")
        .map(|c| c.value);
    assert_eq!(built, Some(0));
}

#[test_log::test]
fn test_reused_dependency_with_new_root() {
    SolverCase::new("reuse dependency")
        .packages(packages())
        .installed(["pkg-b@1.2"])
        .specs(["pkg-a@2.0"])
        .expect_present(["pkg-a@=2.0", "pkg-b@=1.2"])
        .run();
}

fn cuda_config(modules: &str) -> String {
    format!(
        r#"
        [[packages.cuda.externals]]
        spec = "cuda@=12.0"
        prefix = "/opt/cuda"
        modules = ["{modules}"]
        "#
    )
}

fn cuda_case(modules: &str) -> SolverCase<'static> {
    SolverCase::new("cuda external")
        .packages([
            PackageBuilder::new("app").versions(["1.0"]).depends_on("cuda"),
            PackageBuilder::new("cuda").versions(["12.0", "12.4"]),
        ])
        .config(&cuda_config(modules))
}

#[test_log::test]
fn test_stale_external_is_not_reused() {
    let installed = cuda_case("cuda/12.0-old").installed(["app"]);
    let repository = installed.repository();
    let store = installed.store(&repository, &installed.site_config());
    let old = store.read_transaction()[0].clone();

    let config = cuda_case("cuda/12.0-new").site_config();
    let result = Solver::new(&repository, &config)
        .with_source(store)
        .solve(&[Spec::from_str("app").unwrap()], &SolveOptions::default())
        .unwrap();
    let app = &result.specs[0].1;
    assert_ne!(app.dag_hash(), old.dag_hash());
    let cuda = app.dependency("cuda").unwrap();
    let external = cuda.spec.external.as_ref().expect("cuda is external");
    assert_eq!(external.modules, vec!["cuda/12.0-new".to_string()]);
}
