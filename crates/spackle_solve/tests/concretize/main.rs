use std::{io::Write, str::FromStr};

use rstest::rstest;
use similar_asserts::assert_eq;
use spackle_config::SiteConfig;
use spackle_solve::{SolveOptions, SolveResult, Solver};
use spackle_types::{
    FlagType, InMemoryRepository, PackageDefinition, Spec, VariantDefinition, VariantValue,
};
use tempfile::NamedTempFile;

mod duplicate_tests;
mod error_tests;
mod helpers;
mod requirement_tests;
mod reuse_tests;
mod unify_tests;

use helpers::{nodes_named, PackageBuilder, SolverCase};

fn root(result: &SolveResult) -> &Spec {
    result.specs[0].1.as_ref()
}

fn mpi_packages() -> Vec<PackageBuilder> {
    vec![
        PackageBuilder::new("pkg-x").versions(["1.0"]).depends_on("mpi"),
        PackageBuilder::new("pkg-y").versions(["1.0"]).depends_on("mpi"),
        PackageBuilder::new("openmpi").versions(["4.1.5"]).provides("mpi"),
    ]
}

#[test_log::test]
fn test_version_range_picks_newest_allowed() {
    SolverCase::new("version range")
        .packages([
            PackageBuilder::new("pkg-a")
                .versions(["1.0"])
                .depends_on("pkg-b@1.0:1.5"),
            PackageBuilder::new("pkg-b").versions(["1.2", "1.6", "2.0"]),
        ])
        .specs(["pkg-a"])
        .expect_present(["pkg-a@=1.0", "pkg-b@=1.2"])
        .expect_absent(["pkg-b@1.6:"])
        .run();
}

#[rstest]
#[case::requested("pkg-a +feature", true)]
#[case::default("pkg-a", false)]
fn test_variant_values(#[case] request: &str, #[case] expected: bool) {
    let result = SolverCase::new("variant")
        .packages([PackageBuilder::new("pkg-a")
            .versions(["1.0"])
            .bool_variant("feature", false)])
        .specs([request])
        .run();
    assert_eq!(
        root(&result).variants.get("feature"),
        Some(&VariantValue::Bool(expected))
    );
}

#[test_log::test]
fn test_shared_virtual_has_one_provider_node() {
    let result = SolverCase::new("shared mpi")
        .packages(mpi_packages())
        .specs(["pkg-x", "pkg-y"])
        .expect_present(["openmpi@=4.1.5"])
        .run();
    assert_eq!(nodes_named(&result, "openmpi").len(), 1);
    let edge = result.specs[0].1.dependency("openmpi").unwrap();
    assert_eq!(edge.virtuals, vec!["mpi".to_string()]);
}

#[test_log::test]
fn test_preferred_version_beats_newer() {
    SolverCase::new("preferred version")
        .packages([PackageBuilder::new("pkg-b")
            .versions(["2.0", "1.6"])
            .preferred_version("1.2")])
        .specs(["pkg-b"])
        .expect_present(["pkg-b@=1.2"])
        .run();
}

#[test_log::test]
fn test_develop_is_never_preferred() {
    SolverCase::new("develop")
        .packages([PackageBuilder::new("pkg-b").versions(["develop", "1.6"])])
        .specs(["pkg-b"])
        .expect_present(["pkg-b@=1.6"])
        .run();
}

#[rstest]
#[case::openmpi("openmpi")]
#[case::mpich("mpich")]
fn test_provider_preference(#[case] preferred: &str) {
    let mut packages = mpi_packages();
    packages.push(PackageBuilder::new("mpich").versions(["4.1"]).provides("mpi"));
    let config = format!("[packages.all.providers]\nmpi = [\"{preferred}\"]\n");
    let result = SolverCase::new("provider preference")
        .packages(packages)
        .config(&config)
        .specs(["pkg-x"])
        .run();
    let providers: Vec<&str> = ["openmpi", "mpich"]
        .into_iter()
        .filter(|name| !nodes_named(&result, name).is_empty())
        .collect();
    assert_eq!(providers, vec![preferred]);
}

#[test_log::test]
fn test_results_are_deterministic() {
    let mut packages = mpi_packages();
    packages.push(PackageBuilder::new("mpich").versions(["4.1"]).provides("mpi"));
    let case = SolverCase::new("determinism")
        .packages(packages)
        .specs(["pkg-x", "pkg-y"]);
    let first = case.run();
    let second = case.run();
    let hashes = |result: &SolveResult| {
        result
            .concrete_specs()
            .map(|s| s.dag_hash().map(str::to_string))
            .collect::<Vec<_>>()
    };
    assert_eq!(hashes(&first), hashes(&second));
}

#[test_log::test]
fn test_solutions_satisfy_requests() {
    let result = SolverCase::new("soundness")
        .packages([
            PackageBuilder::new("pkg-a")
                .versions(["1.0", "2.0"])
                .bool_variant("feature", false)
                .depends_on("pkg-b"),
            PackageBuilder::new("pkg-b").versions(["1.2", "1.6"]),
        ])
        .specs(["pkg-a@1.0 +feature ^pkg-b@1.2"])
        .run();
    for (request, concrete) in &result.specs {
        assert!(concrete.is_concrete());
        assert!(concrete.satisfies(request), "{concrete} does not satisfy {request}");
    }
}

#[test_log::test]
fn test_flags_are_ordered_by_source() {
    let result = SolverCase::new("flags")
        .packages([PackageBuilder::new("pkg-a").versions(["1.0"])])
        .config(
            r#"
            [compilers.flags]
            cflags = "-g -pipe"
            "#,
        )
        .specs(["pkg-a cflags=-O3"])
        .run();
    let flags: Vec<&str> = root(&result)
        .compiler_flags
        .get(FlagType::Cflags)
        .iter()
        .map(|f| f.flag.as_str())
        .collect();
    assert_eq!(flags, vec!["-g", "-pipe", "-O3"]);
}

#[test_log::test]
fn test_criteria_are_reported() {
    let result = SolverCase::new("criteria")
        .packages([PackageBuilder::new("pkg-b").versions(["1.2", "1.6"])])
        .specs(["pkg-b@1.2"])
        .run();
    assert!(result.optimal);
    assert!(result.models_examined >= 1);
    let table = result.format_costs();
    assert!(table.contains("version badness (built)"), "{table}");
    assert!(result.criteria.windows(2).all(|w| w[0].priority > w[1].priority));
}

#[test_log::test]
fn test_layered_configuration_scopes() {
    let scope = |content: &str| {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    };
    let site = scope(
        r#"
        [[compilers]]
        spec = "gcc@12.3.0"

        [packages.pkg-b]
        version = ["1.2"]
        "#,
    );
    let user = scope(
        r#"
        [packages.pkg-b]
        version = ["1.6"]
        "#,
    );
    let config = SiteConfig::load_from_files([site.path(), user.path()]).unwrap();
    let repository: InMemoryRepository = [PackageBuilder::new("pkg-b").versions(["1.2", "1.6", "2.0"])]
        .into_iter()
        .map(PackageDefinition::from)
        .collect();

    let result = Solver::new(&repository, &config)
        .solve(&[Spec::from_str("pkg-b").unwrap()], &SolveOptions::default())
        .unwrap();
    assert_eq!(
        root(&result).version().map(ToString::to_string),
        Some("1.6".to_string())
    );
}

#[test_log::test]
fn test_multi_valued_variant_keeps_its_defaults() {
    let result = SolverCase::new("multi-valued variant")
        .packages([PackageBuilder::new("pkg-a")
            .versions(["1.0"])
            .variant(VariantDefinition::multi(
                "languages",
                ["c", "cxx"],
                ["c", "cxx", "fortran"],
            ))])
        .specs(["pkg-a"])
        .run();
    let expected = VariantValue::Multi(["c", "cxx"].into_iter().map(String::from).collect());
    assert_eq!(root(&result).variants.get("languages"), Some(&expected));
}
