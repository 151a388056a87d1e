pub mod package_builder;
pub mod solver_case;

pub use package_builder::PackageBuilder;
pub use solver_case::{nodes_named, SolverCase};
