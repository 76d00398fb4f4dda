//! Release compilation: dependency ordering, package builds and the
//! fingerprint-keyed cache that lets re-runs skip unchanged packages.

pub mod dependency;
pub mod error;
pub mod package_compiler;
pub mod packages;
pub mod release_compiler;
pub mod repo;

pub use dependency::DependencyAnalyzer;
pub use error::CompileError;
pub use package_compiler::{CompiledDependency, PackageCompiler, ScriptPackageCompiler};
pub use packages::ReleasePackagesCompiler;
pub use release_compiler::{CompiledJob, CompiledPackageRef, CompiledRelease, ReleaseCompiler};
pub use repo::{
    dependency_fingerprint, CompiledPackageRecord, CompiledPackageRepo, IndexCompiledPackageRepo,
};
