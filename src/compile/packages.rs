use super::{
    dependency_fingerprint, CompileError, CompiledDependency, CompiledPackageRecord,
    CompiledPackageRepo, DependencyAnalyzer, PackageCompiler,
};
use crate::eventlog::{failure_message, EventLogger, Stage};
use crate::release::{Package, Release};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Compiles every package of a release in dependency order, reusing any
/// package whose (fingerprint, dependency fingerprint) is already recorded.
///
/// The first failure aborts the whole release build.
pub struct ReleasePackagesCompiler {
    analyzer: DependencyAnalyzer,
    compiler: Arc<dyn PackageCompiler>,
    repo: Arc<dyn CompiledPackageRepo>,
    event_logger: Arc<dyn EventLogger>,
}

impl ReleasePackagesCompiler {
    pub fn new(
        analyzer: DependencyAnalyzer,
        compiler: Arc<dyn PackageCompiler>,
        repo: Arc<dyn CompiledPackageRepo>,
        event_logger: Arc<dyn EventLogger>,
    ) -> Self {
        Self {
            analyzer,
            compiler,
            repo,
            event_logger,
        }
    }

    pub async fn compile(
        &self,
        release: &Release,
    ) -> Result<BTreeMap<String, CompiledPackageRecord>, CompileError> {
        let order = self.analyzer.compilation_order(&release.packages)?;

        let stage = Stage::new(self.event_logger.clone(), "compiling packages");
        stage.start();

        let mut compiled: BTreeMap<String, CompiledPackageRecord> = BTreeMap::new();
        for package in order {
            let step = stage.new_step(format!("{}/{}", package.name, package.version));

            let dep_fingerprint = dependency_fingerprint(package, &compiled)
                .map_err(|e| CompileError::cache("Computing dependency fingerprint", e));
            let dep_fingerprint = match dep_fingerprint {
                Ok(fp) => fp,
                Err(e) => {
                    step.fail(failure_message(&e));
                    stage.fail(failure_message(&e));
                    return Err(e);
                }
            };

            let found = self.repo.find(package, &dep_fingerprint).map_err(|e| {
                CompileError::cache(format!("Finding compiled package '{}'", package.name), e)
            });
            match found {
                Ok(Some(record)) => {
                    debug!("Package {} already compiled as {}", package.name, record.blob.blob_id);
                    step.skip("Package already compiled");
                    compiled.insert(package.name.clone(), record);
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    step.fail(failure_message(&e));
                    stage.fail(failure_message(&e));
                    return Err(e);
                }
            }

            step.start();
            let dependencies: Vec<CompiledDependency> = dependency_closure(release, package)
                .into_iter()
                .filter_map(|name| {
                    compiled.get(name).map(|record| CompiledDependency {
                        name: name.to_string(),
                        record: record.clone(),
                    })
                })
                .collect();

            let result = match self.compiler.compile(package, &dependencies).await {
                Ok(record) => self
                    .repo
                    .save(package, &dep_fingerprint, &record)
                    .map(|_| record)
                    .map_err(|e| {
                        CompileError::cache(
                            format!("Saving compiled package '{}'", package.name),
                            e,
                        )
                    }),
                Err(e) => Err(e),
            };

            match result {
                Ok(record) => {
                    step.finish();
                    compiled.insert(package.name.clone(), record);
                }
                Err(e) => {
                    step.fail(failure_message(&e));
                    stage.fail(failure_message(&e));
                    return Err(e);
                }
            }
        }

        stage.finish();
        info!(
            "Release {}/{}: {} packages ready",
            release.name,
            release.version,
            compiled.len()
        );
        Ok(compiled)
    }
}

/// Names of every package `package` depends on, directly or transitively.
fn dependency_closure<'a>(release: &'a Release, package: &'a Package) -> BTreeSet<&'a str> {
    let mut closure = BTreeSet::new();
    let mut pending: Vec<&str> = package.dependencies.iter().map(String::as_str).collect();
    while let Some(name) = pending.pop() {
        if !closure.insert(name) {
            continue;
        }
        if let Some(dependency) = release.find_package(name) {
            pending.extend(dependency.dependencies.iter().map(String::as_str));
        }
    }
    closure
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobstore::BlobRef;
    use crate::compile::IndexCompiledPackageRepo;
    use crate::eventlog::{EventState, RecordingEventLogger};
    use crate::index::InMemoryIndex;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeCompiler {
        calls: Mutex<Vec<(String, Vec<String>)>>,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl PackageCompiler for FakeCompiler {
        async fn compile(
            &self,
            package: &Package,
            dependencies: &[CompiledDependency],
        ) -> Result<CompiledPackageRecord, CompileError> {
            self.calls.lock().unwrap().push((
                package.name.clone(),
                dependencies.iter().map(|d| d.record.blob.blob_id.clone()).collect(),
            ));
            if self.fail_on.as_deref() == Some(package.name.as_str()) {
                return Err(CompileError::BuildFailed {
                    package: package.name.clone(),
                    reason: "fake-build-error".to_string(),
                });
            }
            Ok(CompiledPackageRecord {
                blob: BlobRef {
                    blob_id: format!("blob-{}", package.name),
                    sha1: format!("sha-{}", package.name),
                },
            })
        }
    }

    fn package(name: &str, deps: &[&str]) -> Package {
        Package {
            name: name.to_string(),
            version: "1".to_string(),
            fingerprint: format!("fp-{name}"),
            sha1: String::new(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            archive_path: Default::default(),
        }
    }

    fn setup(
        compiler: Arc<FakeCompiler>,
    ) -> (ReleasePackagesCompiler, Arc<RecordingEventLogger>) {
        let logger = Arc::new(RecordingEventLogger::new());
        let repo = Arc::new(IndexCompiledPackageRepo::new(Arc::new(InMemoryIndex::new())));
        let packages_compiler =
            ReleasePackagesCompiler::new(DependencyAnalyzer::new(), compiler, repo, logger.clone());
        (packages_compiler, logger)
    }

    #[tokio::test]
    async fn test_passes_dependency_blobs_to_compiler() {
        let compiler = Arc::new(FakeCompiler::default());
        let (packages_compiler, _) = setup(compiler.clone());
        let release = Release::new("r", "1", vec![package("b", &["a"]), package("a", &[])], vec![]);

        let compiled = packages_compiler.compile(&release).await.unwrap();

        assert_eq!(compiled["b"].blob.blob_id, "blob-b");
        let calls = compiler.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                ("a".to_string(), vec![]),
                ("b".to_string(), vec!["blob-a".to_string()]),
            ]
        );
    }

    #[tokio::test]
    async fn test_transitive_dependencies_are_staged() {
        let compiler = Arc::new(FakeCompiler::default());
        let (packages_compiler, _) = setup(compiler.clone());
        let release = Release::new(
            "r",
            "1",
            vec![package("c", &["b"]), package("b", &["a"]), package("a", &[])],
            vec![],
        );

        packages_compiler.compile(&release).await.unwrap();

        let calls = compiler.calls.lock().unwrap().clone();
        assert_eq!(
            calls.last(),
            Some(&("c".to_string(), vec!["blob-a".to_string(), "blob-b".to_string()]))
        );
    }

    #[tokio::test]
    async fn test_second_compile_is_served_from_cache() {
        let compiler = Arc::new(FakeCompiler::default());
        let (packages_compiler, logger) = setup(compiler.clone());
        let release = Release::new("r", "1", vec![package("a", &[])], vec![]);

        packages_compiler.compile(&release).await.unwrap();
        packages_compiler.compile(&release).await.unwrap();

        assert_eq!(compiler.calls.lock().unwrap().len(), 1);
        assert_eq!(
            logger.step_states("compiling packages", "a/1"),
            vec![EventState::Started, EventState::Finished, EventState::Skipped]
        );
        assert_eq!(
            logger.step_message("compiling packages", "a/1"),
            Some("Package already compiled".to_string())
        );
    }

    #[tokio::test]
    async fn test_first_failure_aborts_release() {
        let compiler = Arc::new(FakeCompiler {
            fail_on: Some("a".to_string()),
            ..Default::default()
        });
        let (packages_compiler, logger) = setup(compiler.clone());
        let release = Release::new("r", "1", vec![package("a", &[]), package("b", &["a"])], vec![]);

        let err = packages_compiler.compile(&release).await.unwrap_err();
        assert!(err.to_string().contains("fake-build-error"));
        assert_eq!(compiler.calls.lock().unwrap().len(), 1);
        assert_eq!(
            logger.step_states("compiling packages", "a/1"),
            vec![EventState::Started, EventState::Failed]
        );
        assert_eq!(
            logger.step_message("compiling packages", "a/1").as_deref(),
            Some("Compiling package 'a': fake-build-error")
        );
        assert!(logger.step_states("compiling packages", "b/1").is_empty());
    }

    #[tokio::test]
    async fn test_cycle_fails_before_any_compilation() {
        let compiler = Arc::new(FakeCompiler::default());
        let (packages_compiler, logger) = setup(compiler.clone());
        let release = Release::new("r", "1", vec![package("a", &["b"]), package("b", &["a"])], vec![]);

        let err = packages_compiler.compile(&release).await.unwrap_err();
        assert!(matches!(err, CompileError::DependencyCycle { .. }));
        assert!(compiler.calls.lock().unwrap().is_empty());
        assert!(logger.events().is_empty());
    }
}
