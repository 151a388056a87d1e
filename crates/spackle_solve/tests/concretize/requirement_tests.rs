use assert_matches::assert_matches;
use rstest::rstest;
use spackle_solve::{SolveError, SolveResult};
use spackle_types::VariantValue;

use crate::helpers::{nodes_named, PackageBuilder, SolverCase};

fn packages() -> Vec<PackageBuilder> {
    vec![
        PackageBuilder::new("pkg-a")
            .versions(["1.0", "2.0"])
            .bool_variant("X", false)
            .bool_variant("Y", false)
            .depends_on("pkg-b"),
        PackageBuilder::new("pkg-b").versions(["1.2", "1.6"]),
    ]
}

fn case(config: &str, spec: &'static str) -> SolverCase<'static> {
    SolverCase::new("requirements")
        .packages(packages())
        .config(config)
        .specs([spec])
}

fn enabled(result: &SolveResult, variant: &str) -> bool {
    nodes_named(result, "pkg-a")[0].variants.get(variant) == Some(&VariantValue::Bool(true))
}

#[test_log::test]
fn test_single_requirement_is_imposed() {
    case("[packages.pkg-a]\nrequire = \"+X\"\n", "pkg-a")
        .expect_present(["pkg-a+X~Y"])
        .run();
}

#[test_log::test]
fn test_single_requirement_rejects_the_opposite() {
    let err = case("[packages.pkg-a]\nrequire = \"+X\"\n", "pkg-a ~X").run_err();
    assert_matches!(&err, SolveError::Unsatisfiable(_));
    let text = err.to_string();
    assert!(text.contains("is required"), "{text}");
}

const ONE_OF: &str = r#"
[[packages.pkg-a.require]]
one-of = ["+X", "+Y"]
"#;

const ANY_OF: &str = r#"
[[packages.pkg-a.require]]
any-of = ["+X", "+Y"]
"#;

#[test_log::test]
fn test_one_of_picks_exactly_one() {
    let result = case(ONE_OF, "pkg-a").run();
    assert!(enabled(&result, "X") != enabled(&result, "Y"));
}

#[test_log::test]
fn test_one_of_rejects_both() {
    let err = case(ONE_OF, "pkg-a +X +Y").run_err();
    assert_matches!(&err, SolveError::Unsatisfiable(_));
    let text = err.to_string();
    assert!(text.contains("exactly one of"), "{text}");
}

#[rstest]
#[case::first("pkg-a +X", true, false)]
#[case::second("pkg-a +Y", false, true)]
#[case::both("pkg-a +X +Y", true, true)]
fn test_any_of_accepts_at_least_one(#[case] spec: &'static str, #[case] x: bool, #[case] y: bool) {
    let result = case(ANY_OF, spec).run();
    assert_eq!((enabled(&result, "X"), enabled(&result, "Y")), (x, y));
}

#[test_log::test]
fn test_any_of_rejects_none() {
    let err = case(ANY_OF, "pkg-a ~X ~Y").run_err();
    assert_matches!(err, SolveError::Unsatisfiable(_));
}

#[test_log::test]
fn test_preference_beats_newer_version() {
    case("[packages.pkg-b]\nprefer = [\"@1.2\"]\n", "pkg-a")
        .expect_present(["pkg-b@=1.2"])
        .expect_absent(["pkg-b@=1.6"])
        .run();
}

#[test_log::test]
fn test_preference_yields_to_the_request() {
    case("[packages.pkg-b]\nprefer = [\"@1.2\"]\n", "pkg-a ^pkg-b@1.6")
        .expect_present(["pkg-b@=1.6"])
        .run();
}

#[test_log::test]
fn test_configured_conflict() {
    let config = "[packages.pkg-a]\nconflict = [\"+X\"]\n";
    case(config, "pkg-a").expect_present(["pkg-a~X"]).run();

    let err = case(config, "pkg-a +X").run_err();
    assert_matches!(&err, SolveError::Unsatisfiable(_));
    let text = err.to_string();
    assert!(text.contains("is not allowed"), "{text}");
}

const WHEN_NEW: &str = r#"
[[packages.pkg-a.require]]
spec = "+X"
when = "@2.0"
"#;

#[rstest]
#[case::triggered("pkg-a@2.0", "pkg-a@=2.0+X")]
#[case::not_triggered("pkg-a@1.0", "pkg-a@=1.0~X")]
fn test_conditional_requirement(#[case] spec: &'static str, #[case] expected: &'static str) {
    case(WHEN_NEW, spec).expect_present([expected]).run();
}

#[test_log::test]
fn test_conditional_requirement_rejects_the_opposite() {
    let err = case(WHEN_NEW, "pkg-a@2.0 ~X").run_err();
    assert_matches!(err, SolveError::Unsatisfiable(_));
}
