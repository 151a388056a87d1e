use std::collections::BTreeMap;

use serde::Serialize;
use sha2::{Digest, Sha256};

use super::Spec;
use crate::{DepTypes, FlagType};

/// Number of hex characters of the digest that make up a spec hash.
const HASH_LENGTH: usize = 32;

/// The part of a spec that contributes to its hash. Field order is fixed so the serialized form
/// is canonical.
#[derive(Serialize)]
struct HashRecord<'a> {
    name: &'a str,
    namespace: Option<&'a str>,
    version: String,
    variants: BTreeMap<&'a str, Vec<String>>,
    compiler: Option<String>,
    arch: String,
    flags: BTreeMap<FlagType, Vec<&'a str>>,
    external: Option<(&'a Option<String>, &'a [String])>,
    dependencies: Vec<DependencyRecord<'a>>,
}

#[derive(Serialize)]
struct DependencyRecord<'a> {
    name: &'a str,
    hash: &'a str,
    deptypes: DepTypes,
    virtuals: Vec<&'a str>,
}

/// Computes the hash of a spec whose dependencies are already concrete.
pub(super) fn compute_dag_hash(spec: &Spec) -> String {
    let mut dependencies: Vec<DependencyRecord<'_>> = spec
        .dependencies
        .iter()
        .map(|dep| {
            let mut virtuals: Vec<&str> = dep.virtuals.iter().map(String::as_str).collect();
            virtuals.sort_unstable();
            DependencyRecord {
                name: dep.spec.name_or_empty(),
                hash: dep.spec.dag_hash().unwrap_or_default(),
                deptypes: dep.deptypes,
                virtuals,
            }
        })
        .collect();
    dependencies.sort_by(|a, b| a.name.cmp(b.name));

    let record = HashRecord {
        name: spec.name_or_empty(),
        namespace: spec.namespace.as_deref(),
        version: spec.versions.to_string(),
        variants: spec
            .variants
            .iter()
            .map(|(name, value)| (name.as_str(), value.values()))
            .collect(),
        compiler: spec.compiler.as_ref().map(ToString::to_string),
        arch: spec.arch.to_string(),
        flags: spec
            .compiler_flags
            .iter()
            .map(|(ty, flags)| (ty, flags.iter().map(|f| f.flag.as_str()).collect()))
            .collect(),
        external: spec
            .external
            .as_ref()
            .map(|ext| (&ext.prefix, ext.modules.as_slice())),
        dependencies,
    };

    // Serializing plain data into memory cannot fail.
    let bytes = serde_json::to_vec(&record).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    let mut hash = hex::encode(digest);
    hash.truncate(HASH_LENGTH);
    hash
}
