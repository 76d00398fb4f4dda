use super::DeployError;
use crate::blobstore::BlobRef;
use crate::compile::CompiledRelease;
use crate::index::fingerprint;
use crate::manifest::DeploymentManifest;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Serialize)]
struct BlobSpec<'a> {
    name: &'a str,
    version: &'a str,
    sha1: &'a str,
    blobstore_id: &'a str,
}

impl<'a> BlobSpec<'a> {
    fn new(name: &'a str, version: &'a str, blob: &'a BlobRef) -> Self {
        Self {
            name,
            version,
            sha1: &blob.sha1,
            blobstore_id: &blob.blob_id,
        }
    }
}

#[derive(Debug, Serialize)]
struct JobSpec<'a> {
    name: &'a str,
    templates: Vec<BlobSpec<'a>>,
}

#[derive(Debug, Serialize)]
struct ResourcePoolSpec<'a> {
    name: &'a str,
    cloud_properties: &'a Value,
}

#[derive(Debug, Serialize)]
struct SpecBody<'a> {
    deployment: &'a str,
    index: u32,
    job: JobSpec<'a>,
    packages: BTreeMap<&'a str, BlobSpec<'a>>,
    networks: Value,
    resource_pool: ResourcePoolSpec<'a>,
    properties: &'a Value,
}

/// Builds the payload the agent realises on the VM: the manifest's job with
/// its rendered templates, every package those templates need, networking
/// and resource pool. Keys from the stemcell's apply spec are kept unless
/// overridden.
pub fn build_apply_spec(
    manifest: &DeploymentManifest,
    compiled: &CompiledRelease,
    stemcell_defaults: &Value,
) -> Result<Value, DeployError> {
    let job = manifest.job().ok_or_else(|| DeployError::MissingJob {
        job: "<none>".to_string(),
    })?;

    let mut templates = Vec::with_capacity(job.templates.len());
    let mut packages = BTreeMap::new();
    for name in &job.templates {
        let compiled_job = compiled
            .jobs
            .get(name)
            .ok_or_else(|| DeployError::MissingJob { job: name.clone() })?;
        templates.push(BlobSpec::new(
            &compiled_job.name,
            &compiled_job.version,
            &compiled_job.blob,
        ));
        let closure = compiled
            .package_closure(&compiled_job.packages)
            .map_err(|missing| DeployError::MissingPackage {
                job: name.clone(),
                package: missing.to_string(),
            })?;
        for package in closure {
            packages.insert(
                package.name.as_str(),
                BlobSpec::new(&package.name, &package.version, &package.blob),
            );
        }
    }

    let body = SpecBody {
        deployment: &manifest.name,
        index: 0,
        job: JobSpec {
            name: &job.name,
            templates,
        },
        packages,
        networks: manifest.network_settings(),
        resource_pool: ResourcePoolSpec {
            name: &manifest.resource_pool.name,
            cloud_properties: &manifest.resource_pool.cloud_properties,
        },
        properties: &manifest.properties,
    };
    let configuration_hash = fingerprint(&body)?;
    let body = serde_json::to_value(&body).map_err(crate::index::IndexError::from)?;

    let mut spec = match stemcell_defaults {
        Value::Object(defaults) => defaults.clone(),
        _ => Map::new(),
    };
    if let Value::Object(generated) = body {
        spec.extend(generated);
    }
    spec.insert("configuration_hash".to_string(), Value::String(configuration_hash));
    Ok(Value::Object(spec))
}
