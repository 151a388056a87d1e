use assert_matches::assert_matches;
use spackle_solve::{SolveError, BUILD_TOOLS_TAG};
use spackle_types::DepTypes;

use crate::helpers::{nodes_named, PackageBuilder, SolverCase};

/// `app` needs a new cmake to build while its dependency `lib` needs an old one.
fn case(strategy: &str, tagged: bool) -> SolverCase<'static> {
    let mut cmake = PackageBuilder::new("cmake").versions(["3.10", "3.27"]);
    if tagged {
        cmake = cmake.tag(BUILD_TOOLS_TAG);
    }
    SolverCase::new("build tool duplicates")
        .packages([
            PackageBuilder::new("app")
                .versions(["1.0"])
                .depends_on("lib")
                .depends_on_when("cmake@3.20:", "", DepTypes::BUILD),
            PackageBuilder::new("lib")
                .versions(["1.0"])
                .depends_on_when("cmake@:3.15", "", DepTypes::BUILD),
            cmake,
        ])
        .config(match strategy {
            "none" => "[concretizer.duplicates]\nstrategy = \"none\"\n",
            "minimal" => "[concretizer.duplicates]\nstrategy = \"minimal\"\n",
            _ => "[concretizer.duplicates]\nstrategy = \"full\"\n",
        })
        .specs(["app"])
}

#[test_log::test]
fn test_no_duplicates_is_unsatisfiable() {
    let err = case("none", true).run_err();
    assert_matches!(err, SolveError::Unsatisfiable(_));
}

#[test_log::test]
fn test_minimal_duplicates_build_tools() {
    let result = case("minimal", true)
        .expect_present(["cmake@=3.27", "cmake@=3.10"])
        .run();
    assert_eq!(nodes_named(&result, "cmake").len(), 2);
}

#[test_log::test]
fn test_minimal_needs_the_tag() {
    let err = case("minimal", false).run_err();
    assert_matches!(err, SolveError::Unsatisfiable(_));
}

#[test_log::test]
fn test_single_node_when_compatible() {
    let result = SolverCase::new("one cmake")
        .packages([
            PackageBuilder::new("app")
                .versions(["1.0"])
                .depends_on("lib")
                .depends_on_when("cmake", "", DepTypes::BUILD),
            PackageBuilder::new("lib")
                .versions(["1.0"])
                .depends_on_when("cmake", "", DepTypes::BUILD),
            PackageBuilder::new("cmake")
                .versions(["3.27"])
                .tag(BUILD_TOOLS_TAG),
        ])
        .specs(["app"])
        .run();
    assert_eq!(nodes_named(&result, "cmake").len(), 1);
}
