use assert_matches::assert_matches;
use rstest::rstest;
use spackle_solve::SolveError;

use crate::helpers::{PackageBuilder, SolverCase};

fn conflicting_package() -> PackageBuilder {
    PackageBuilder::new("pkg-a")
        .versions(["1.0"])
        .bool_variant("X", false)
        .bool_variant("Y", false)
        .conflicts("+X", "+Y")
}

#[test_log::test]
fn test_conflict_is_explained() {
    let err = SolverCase::new("conflict")
        .packages([conflicting_package()])
        .specs(["pkg-a +X +Y"])
        .run_err();
    assert_matches!(&err, SolveError::Unsatisfiable(_));
    let text = err.to_string();
    assert!(text.contains("pkg-a+X"), "{text}");
    assert!(text.contains("pkg-a+Y"), "{text}");
}

#[test_log::test]
fn test_conflict_without_trigger_is_fine() {
    SolverCase::new("conflict not triggered")
        .packages([conflicting_package()])
        .specs(["pkg-a +X"])
        .expect_present(["pkg-a+X~Y"])
        .run();
}

#[rstest]
#[case::unknown_package(&["does-not-exist"])]
#[case::unknown_dependency(&["pkg-a ^does-not-exist"])]
#[case::unknown_namespace(&["other.pkg-a"])]
#[case::unknown_variant(&["pkg-a +nope"])]
#[case::incompatible_literals(&["pkg-a@1.0", "pkg-a@2.0"])]
fn test_invalid_requests(#[case] specs: &[&str]) {
    let err = SolverCase::new("invalid request")
        .packages([PackageBuilder::new("pkg-a").versions(["1.0", "2.0"])])
        .specs(specs.iter().copied())
        .run_err();
    assert_matches!(err, SolveError::Input(_), "{specs:?}");
}

#[test_log::test]
fn test_deprecated_versions_are_avoided() {
    SolverCase::new("deprecated")
        .packages([PackageBuilder::new("pkg-b")
            .versions(["0.9"])
            .deprecated_version("1.0")])
        .config("[concretizer]\ndeprecated = true\n")
        .specs(["pkg-b"])
        .expect_present(["pkg-b@=0.9"])
        .run();
}

#[test_log::test]
fn test_deprecated_versions_when_allowed() {
    SolverCase::new("deprecated allowed")
        .packages([PackageBuilder::new("pkg-b").deprecated_version("1.0")])
        .config("[concretizer]\ndeprecated = true\n")
        .specs(["pkg-b"])
        .expect_present(["pkg-b@=1.0"])
        .run();
}

#[test_log::test]
fn test_external_needs_a_concrete_version() {
    let err = SolverCase::new("bad external")
        .packages([
            PackageBuilder::new("pkg-a").versions(["1.0"]).depends_on("zlib"),
            PackageBuilder::new("zlib").versions(["1.2.13", "1.3"]),
        ])
        .config("[[packages.zlib.externals]]\nspec = \"zlib@1.2:\"\n")
        .specs(["pkg-a"])
        .run_err();
    assert_matches!(
        err,
        SolveError::Configuration(e) if e.path == "packages.zlib.externals[0].spec"
    );
}
