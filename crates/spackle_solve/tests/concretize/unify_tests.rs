use std::str::FromStr;

use assert_matches::assert_matches;
use similar_asserts::assert_eq;
use spackle_solve::{SolveError, SolveOptions, Solver, TestDependencies};
use spackle_types::{DepTypes, Spec};

use crate::helpers::{nodes_named, PackageBuilder, SolverCase};

fn two_versions() -> SolverCase<'static> {
    SolverCase::new("two versions")
        .packages([
            PackageBuilder::new("pkg-a")
                .versions(["1.0", "2.0"])
                .depends_on("pkg-b"),
            PackageBuilder::new("pkg-b").versions(["1.2", "1.6"]),
        ])
        .specs(["pkg-a@1.0", "pkg-a@2.0"])
}

fn concretize(case: &SolverCase<'_>, unify: &str, specs: &[&str]) -> Vec<Vec<String>> {
    let case = case.clone().config(&format!("[concretizer]\nunify = {unify}\n"));
    let repository = case.repository();
    let config = case.site_config();
    let specs: Vec<Spec> = specs.iter().map(|s| Spec::from_str(s).unwrap()).collect();
    let rounds = Solver::new(&repository, &config)
        .concretize(&specs, &SolveOptions::default())
        .unwrap();
    rounds
        .iter()
        .map(|round| round.concrete_specs().map(|s| s.format_node()).collect())
        .collect()
}

#[test_log::test]
fn test_unify_together_rejects_two_versions() {
    let err = two_versions().run_err();
    assert_matches!(err, SolveError::Input(_));
}

#[test_log::test]
fn test_unify_false_solves_each_spec_alone() {
    let rounds = concretize(&two_versions(), "false", &["pkg-a@1.0", "pkg-a@2.0"]);
    assert_eq!(rounds.len(), 2);
    assert!(rounds[0][0].starts_with("pkg-a@1.0"), "{rounds:?}");
    assert!(rounds[1][0].starts_with("pkg-a@2.0"), "{rounds:?}");
}

#[test_log::test]
fn test_unify_when_possible_takes_two_rounds() {
    let rounds = concretize(
        &two_versions(),
        "\"when_possible\"",
        &["pkg-a@1.0", "pkg-a@2.0"],
    );
    assert_eq!(rounds.len(), 2);
    assert_eq!(rounds[0].len(), 1);
    assert_eq!(rounds[1].len(), 1);
}

#[test_log::test]
fn test_unify_when_possible_single_round_when_compatible() {
    let rounds = concretize(&two_versions(), "\"when_possible\"", &["pkg-a", "pkg-b"]);
    assert_eq!(rounds.len(), 1);
    assert_eq!(rounds[0].len(), 2);
}

fn with_test_dependency(tests: TestDependencies) -> SolverCase<'static> {
    SolverCase::new("test dependencies")
        .packages([
            PackageBuilder::new("pkg-a")
                .versions(["1.0"])
                .depends_on("pkg-b")
                .depends_on_when("pytest", "", DepTypes::TEST),
            PackageBuilder::new("pkg-b")
                .versions(["1.2"])
                .depends_on_when("pytest", "", DepTypes::TEST),
            PackageBuilder::new("pytest").versions(["7.4"]),
        ])
        .specs(["pkg-a"])
        .tests(tests)
}

#[test_log::test]
fn test_test_dependencies_off_by_default() {
    with_test_dependency(TestDependencies::None)
        .expect_absent(["pytest"])
        .run();
}

#[test_log::test]
fn test_test_dependencies_for_roots_only() {
    let result = with_test_dependency(TestDependencies::Roots)
        .expect_present(["pytest@=7.4"])
        .run();
    let root = &result.specs[0].1;
    assert!(root.dependency("pytest").is_some());
    let pkg_b = root.dependency("pkg-b").unwrap();
    assert!(pkg_b.spec.dependency("pytest").is_none());
}

#[test_log::test]
fn test_test_dependencies_everywhere() {
    let result = with_test_dependency(TestDependencies::All).run();
    let root = &result.specs[0].1;
    let pkg_b = root.dependency("pkg-b").unwrap();
    assert!(pkg_b.spec.dependency("pytest").is_some());
    assert_eq!(nodes_named(&result, "pytest").len(), 1);
}

#[test_log::test]
fn test_unbuildable_package_uses_external() {
    let result = SolverCase::new("external")
        .packages([
            PackageBuilder::new("pkg-a").versions(["1.0"]).depends_on("zlib"),
            PackageBuilder::new("zlib").versions(["1.2.13", "1.3"]),
        ])
        .config(
            r#"
            [packages.zlib]
            buildable = false

            [[packages.zlib.externals]]
            spec = "zlib@1.2.13"
            prefix = "/usr"
            "#,
        )
        .specs(["pkg-a"])
        .expect_present(["zlib@=1.2.13"])
        .run();
    let zlib = nodes_named(&result, "zlib");
    assert_eq!(zlib.len(), 1);
    let external = zlib[0].external.as_ref().expect("zlib is external");
    assert_eq!(external.prefix.as_deref(), Some("/usr"));
    assert!(zlib[0].compiler.is_none());
}

#[test_log::test]
fn test_external_is_preferred_over_building() {
    SolverCase::new("external preferred")
        .packages([
            PackageBuilder::new("pkg-a").versions(["1.0"]).depends_on("zlib"),
            PackageBuilder::new("zlib").versions(["1.2.13", "1.3"]),
        ])
        .config(
            r#"
            [[packages.zlib.externals]]
            spec = "zlib@1.2.13"
            prefix = "/usr"
            "#,
        )
        .specs(["pkg-a"])
        .expect_present(["zlib@=1.2.13"])
        .run();
}

#[test_log::test]
fn test_rounds_solve_a_satisfiable_spec_at_once() {
    let case = two_versions();
    let repository = case.repository();
    let config = case.site_config();
    let rounds = Solver::new(&repository, &config)
        .solve_in_rounds(&[Spec::from_str("pkg-a@1.0").unwrap()], &SolveOptions::default())
        .unwrap();
    assert_eq!(rounds.len(), 1);
    let names: Vec<String> = rounds[0].concrete_specs().map(|s| s.format_node()).collect();
    assert_eq!(names.len(), 1);
    assert!(names[0].starts_with("pkg-a@1.0"), "{names:?}");
    assert!(rounds[0].unsolved.is_empty());
}
