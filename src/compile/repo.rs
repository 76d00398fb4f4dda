use crate::blobstore::BlobRef;
use crate::index::{fingerprint, Index, IndexError, IndexExt};
use crate::release::Package;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Where the compiled artifact for one (package, dependency fingerprint) lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledPackageRecord {
    pub blob: BlobRef,
}

#[derive(Serialize)]
struct CompiledPackageKey<'a> {
    name: &'a str,
    version: &'a str,
    fingerprint: &'a str,
    dependency_fingerprint: &'a str,
}

pub trait CompiledPackageRepo: Send + Sync {
    fn save(
        &self,
        package: &Package,
        dependency_fingerprint: &str,
        record: &CompiledPackageRecord,
    ) -> Result<(), IndexError>;

    fn find(
        &self,
        package: &Package,
        dependency_fingerprint: &str,
    ) -> Result<Option<CompiledPackageRecord>, IndexError>;
}

pub struct IndexCompiledPackageRepo {
    index: Arc<dyn Index>,
}

impl IndexCompiledPackageRepo {
    pub fn new(index: Arc<dyn Index>) -> Self {
        Self { index }
    }
}

impl CompiledPackageRepo for IndexCompiledPackageRepo {
    fn save(
        &self,
        package: &Package,
        dependency_fingerprint: &str,
        record: &CompiledPackageRecord,
    ) -> Result<(), IndexError> {
        self.index.add(&key(package, dependency_fingerprint), record)
    }

    fn find(
        &self,
        package: &Package,
        dependency_fingerprint: &str,
    ) -> Result<Option<CompiledPackageRecord>, IndexError> {
        self.index.find(&key(package, dependency_fingerprint))
    }
}

fn key<'a>(package: &'a Package, dependency_fingerprint: &'a str) -> CompiledPackageKey<'a> {
    CompiledPackageKey {
        name: &package.name,
        version: &package.version,
        fingerprint: &package.fingerprint,
        dependency_fingerprint,
    }
}

/// Digest over the compiled blobs of a package's direct dependencies.
///
/// Each dependency's own record was keyed on its dependencies, so the digest
/// changes whenever anything below the package is recompiled.
pub fn dependency_fingerprint(
    package: &Package,
    compiled: &BTreeMap<String, CompiledPackageRecord>,
) -> Result<String, IndexError> {
    let mut dependencies: BTreeMap<&str, &BlobRef> = BTreeMap::new();
    for name in &package.dependencies {
        if let Some(record) = compiled.get(name) {
            dependencies.insert(name.as_str(), &record.blob);
        }
    }
    fingerprint(&dependencies)
}
