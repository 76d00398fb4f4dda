//! Fixtures shared by the integration tests: on-disk releases, stemcells
//! and a package compiler that records what it builds.

#![allow(dead_code)]

use async_trait::async_trait;
use solo_deploy::archive::compress_dir;
use solo_deploy::blobstore::{sha1_file, Blobstore};
use solo_deploy::compile::{
    CompileError, CompiledDependency, CompiledPackageRecord, DependencyAnalyzer,
    IndexCompiledPackageRepo, PackageCompiler, ReleaseCompiler, ReleasePackagesCompiler,
};
use solo_deploy::eventlog::EventLogger;
use solo_deploy::index::FileIndex;
use solo_deploy::release::Package;
use solo_deploy::templates::{HandlebarsJobRenderer, IndexTemplatesRepo, TemplatesCompiler};
use std::path::Path;
use std::sync::{Arc, Mutex};

pub struct FixturePackage<'a> {
    pub name: &'a str,
    pub dependencies: &'a [&'a str],
}

pub struct FixtureJob<'a> {
    pub name: &'a str,
    /// Template source name -> destination path.
    pub templates: &'a [(&'a str, &'a str, &'a str)],
    pub packages: &'a [&'a str],
    /// Job manifest `properties` section, verbatim YAML.
    pub properties: &'a str,
}

/// Lay out an extracted release under `root`: `release.MF` plus gzipped
/// package and job archives with correct SHA-1s.
pub async fn write_release(
    root: &Path,
    name: &str,
    packages: &[FixturePackage<'_>],
    jobs: &[FixtureJob<'_>],
) {
    std::fs::create_dir_all(root.join("packages")).unwrap();
    std::fs::create_dir_all(root.join("jobs")).unwrap();
    let src = root.join("src");

    let mut manifest = format!("name: {name}\nversion: \"1\"\n");
    manifest.push_str(if packages.is_empty() { "packages: []\n" } else { "packages:\n" });
    for package in packages {
        let dir = src.join("packages").join(package.name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("packaging"), "#!/bin/sh\n").unwrap();
        let archive = root.join("packages").join(format!("{}.tgz", package.name));
        compress_dir(&dir, &archive).await.unwrap();

        let deps = package
            .dependencies
            .iter()
            .map(|d| format!("\"{d}\""))
            .collect::<Vec<_>>()
            .join(", ");
        manifest.push_str(&format!(
            "  - name: {n}\n    version: \"1\"\n    fingerprint: fp-{n}\n    sha1: {sha}\n    dependencies: [{deps}]\n",
            n = package.name,
            sha = sha1_file(&archive).unwrap(),
        ));
    }

    manifest.push_str(if jobs.is_empty() { "jobs: []\n" } else { "jobs:\n" });
    for job in jobs {
        let dir = src.join("jobs").join(job.name);
        std::fs::create_dir_all(dir.join("templates")).unwrap();
        let mut job_mf = String::from("templates:\n");
        for (source, dest, content) in job.templates {
            std::fs::write(dir.join("templates").join(source), content).unwrap();
            job_mf.push_str(&format!("  {source}: {dest}\n"));
        }
        let packages = job
            .packages
            .iter()
            .map(|p| format!("\"{p}\""))
            .collect::<Vec<_>>()
            .join(", ");
        job_mf.push_str(&format!("packages: [{packages}]\n"));
        if job.properties.is_empty() {
            job_mf.push_str("properties: {}\n");
        } else {
            job_mf.push_str(&format!("properties:\n{}\n", job.properties));
        }
        std::fs::write(dir.join("job.MF"), job_mf).unwrap();

        let archive = root.join("jobs").join(format!("{}.tgz", job.name));
        compress_dir(&dir, &archive).await.unwrap();
        manifest.push_str(&format!(
            "  - name: {n}\n    version: \"1\"\n    fingerprint: fp-{n}\n    sha1: {sha}\n",
            n = job.name,
            sha = sha1_file(&archive).unwrap(),
        ));
    }

    std::fs::write(root.join("release.MF"), manifest).unwrap();
}

/// Stores each package's source archive as its compiled blob and records
/// the order packages were built in.
pub struct RecordingPackageCompiler {
    blobstore: Arc<dyn Blobstore>,
    compiled: Mutex<Vec<String>>,
}

impl RecordingPackageCompiler {
    pub fn new(blobstore: Arc<dyn Blobstore>) -> Self {
        Self {
            blobstore,
            compiled: Mutex::new(Vec::new()),
        }
    }

    pub fn compiled(&self) -> Vec<String> {
        self.compiled.lock().unwrap().clone()
    }
}

#[async_trait]
impl PackageCompiler for RecordingPackageCompiler {
    async fn compile(
        &self,
        package: &Package,
        _dependencies: &[CompiledDependency],
    ) -> Result<CompiledPackageRecord, CompileError> {
        self.compiled.lock().unwrap().push(package.name.clone());
        let blob = self.blobstore.create(&package.archive_path)?;
        Ok(CompiledPackageRecord { blob })
    }
}

/// A release compiler over the file-backed caches in `workspace`, as a new
/// process would build it.
pub fn release_compiler(
    workspace: &Path,
    blobstore: Arc<dyn Blobstore>,
    packages: Arc<RecordingPackageCompiler>,
    event_logger: Arc<dyn EventLogger>,
) -> ReleaseCompiler {
    let packages_compiler = ReleasePackagesCompiler::new(
        DependencyAnalyzer::new(),
        packages,
        Arc::new(IndexCompiledPackageRepo::new(Arc::new(FileIndex::new(
            workspace.join("compiled_packages.json"),
        )))),
        event_logger.clone(),
    );
    let templates_compiler = TemplatesCompiler::new(
        Arc::new(HandlebarsJobRenderer::new()),
        blobstore,
        Arc::new(IndexTemplatesRepo::new(Arc::new(FileIndex::new(
            workspace.join("templates.json"),
        )))),
        event_logger,
    );
    ReleaseCompiler::new(packages_compiler, templates_compiler)
}
