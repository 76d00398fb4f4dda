use super::{Release, ReleaseError};
use crate::blobstore::sha1_file;
use std::collections::HashSet;
use std::path::Path;
use tracing::debug;

/// Structural checks every release must pass before compilation starts.
#[derive(Debug, Default)]
pub struct ReleaseValidator {
    verify_archives: bool,
}

impl ReleaseValidator {
    pub fn new() -> Self {
        Self {
            verify_archives: true,
        }
    }

    /// Skip the archive existence/SHA-1 checks (for releases built in memory).
    pub fn without_archive_checks() -> Self {
        Self {
            verify_archives: false,
        }
    }

    pub fn validate(&self, release: &Release) -> Result<(), ReleaseError> {
        let mut errors = Vec::new();

        if release.name.trim().is_empty() {
            errors.push("Release name is missing".to_string());
        }
        if release.version.trim().is_empty() {
            errors.push("Release version is missing".to_string());
        }

        let mut package_names = HashSet::new();
        for package in &release.packages {
            if !package_names.insert(package.name.as_str()) {
                errors.push(format!("Package '{}' is defined more than once", package.name));
            }
        }

        for package in &release.packages {
            if package.fingerprint.is_empty() {
                errors.push(format!("Package '{}' has no fingerprint", package.name));
            }
            for dependency in &package.dependencies {
                if !package_names.contains(dependency.as_str()) {
                    errors.push(format!(
                        "Package '{}' depends on missing package '{}'",
                        package.name, dependency
                    ));
                }
            }
            if self.verify_archives {
                errors.extend(check_archive(
                    "Package",
                    &package.name,
                    &package.archive_path,
                    &package.sha1,
                ));
            }
        }

        let mut job_names = HashSet::new();
        for job in &release.jobs {
            if !job_names.insert(job.name.as_str()) {
                errors.push(format!("Job '{}' is defined more than once", job.name));
            }
            for package in &job.packages {
                if !package_names.contains(package.as_str()) {
                    errors.push(format!(
                        "Job '{}' requires missing package '{}'",
                        job.name, package
                    ));
                }
            }
            if self.verify_archives {
                errors.extend(check_archive("Job", &job.name, &job.archive_path, &job.sha1));
            }
        }

        if errors.is_empty() {
            debug!("Release {}/{} is valid", release.name, release.version);
            Ok(())
        } else {
            Err(ReleaseError::Validation { errors })
        }
    }
}

fn check_archive(kind: &str, name: &str, path: &Path, expected: &str) -> Option<String> {
    match sha1_file(path) {
        Ok(actual) if actual != expected => Some(format!(
            "{kind} '{name}' archive sha1 '{actual}' does not match expected '{expected}'"
        )),
        Ok(_) => None,
        Err(_) => Some(format!("{kind} '{name}' archive is missing at {path:?}")),
    }
}

/// Extra rules for the release that supplies the cloud provider interface.
#[derive(Debug)]
pub struct CpiReleaseValidator {
    job_name: String,
    executable: String,
}

impl Default for CpiReleaseValidator {
    fn default() -> Self {
        Self {
            job_name: "cpi".to_string(),
            executable: "bin/cpi".to_string(),
        }
    }
}

impl CpiReleaseValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn validate(&self, release: &Release) -> Result<(), ReleaseError> {
        let Some(job) = release.find_job(&self.job_name) else {
            return Err(ReleaseError::Validation {
                errors: vec![format!(
                    "CPI release must contain a job named '{}'",
                    self.job_name
                )],
            });
        };

        if !job.templates.values().any(|dest| dest == &self.executable) {
            return Err(ReleaseError::Validation {
                errors: vec![format!(
                    "Job '{}' must render a template to '{}'",
                    job.name, self.executable
                )],
            });
        }
        Ok(())
    }
}
