use super::{
    build_apply_spec, DeployError, DeploymentRecord, DiskManager, RegistryServer, SshTunnel,
    SshTunnelHandle, SshTunnelOptions, Vm, VmManager,
};
use crate::agent::{AgentClient, RetryPolicy};
use crate::blobstore::{BlobRef, BlobUploader, Blobstore};
use crate::cloud::Cloud;
use crate::compile::CompiledRelease;
use crate::config::DeploymentStateService;
use crate::eventlog::{failure_message, EventLogger, Stage};
use crate::manifest::DeploymentManifest;
use crate::stemcell::{CloudStemcell, ExtractedStemcell, StateStemcellRepo, StemcellManager};
use std::collections::BTreeMap;
use std::error::Error;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct DeployerOptions {
    /// Budget for the agent to answer pings after the VM boots.
    pub agent_ready: RetryPolicy,
    /// Budget for the jobs to report `running` after `start`.
    pub agent_running: RetryPolicy,
}

/// Runs one forward-only convergence of the deployment. Nothing already
/// converged is rolled back when a later step fails.
pub struct Deployer {
    cloud: Arc<dyn Cloud>,
    agent: Arc<dyn AgentClient>,
    blobstore: Arc<dyn Blobstore>,
    blob_uploader: Arc<dyn BlobUploader>,
    state: Arc<dyn DeploymentStateService>,
    event_logger: Arc<dyn EventLogger>,
    options: DeployerOptions,
}

impl Deployer {
    pub fn new(
        cloud: Arc<dyn Cloud>,
        agent: Arc<dyn AgentClient>,
        blobstore: Arc<dyn Blobstore>,
        blob_uploader: Arc<dyn BlobUploader>,
        state: Arc<dyn DeploymentStateService>,
        event_logger: Arc<dyn EventLogger>,
    ) -> Self {
        Self {
            cloud,
            agent,
            blobstore,
            blob_uploader,
            state,
            event_logger,
            options: DeployerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: DeployerOptions) -> Self {
        self.options = options;
        self
    }

    pub async fn deploy(
        &self,
        manifest: &DeploymentManifest,
        compiled: &CompiledRelease,
        stemcell: &ExtractedStemcell,
    ) -> Result<(), DeployError> {
        manifest.validate().map_err(DeployError::InvalidManifest)?;

        let registry = RegistryServer::start(&manifest.cloud_provider.registry).await?;
        let tunnel = self.start_tunnel(manifest, registry.local_addr().port());

        let result = self.converge(manifest, compiled, stemcell).await;

        if let Some(tunnel) = tunnel {
            tunnel.stop().await;
        }
        if let Err(e) = registry.stop().await {
            warn!("Stopping registry server: {}", e);
        }

        match &result {
            Ok(()) => info!("Deployment {} converged", manifest.name),
            Err(e) => warn!("Deployment {} failed: {}", manifest.name, e),
        }
        result
    }

    fn start_tunnel(&self, manifest: &DeploymentManifest, local_port: u16) -> Option<SshTunnelHandle> {
        let settings = manifest.cloud_provider.ssh_tunnel.clone()?;
        let remote_port = match manifest.cloud_provider.registry.port {
            0 => local_port,
            port => port,
        };
        Some(SshTunnel::start(SshTunnelOptions::new(
            settings,
            remote_port,
            local_port,
        )))
    }

    async fn converge(
        &self,
        manifest: &DeploymentManifest,
        compiled: &CompiledRelease,
        extracted: &ExtractedStemcell,
    ) -> Result<(), DeployError> {
        let stemcell_manager = StemcellManager::new(
            Arc::new(StateStemcellRepo::new(self.state.clone())),
            self.cloud.clone(),
            self.event_logger.clone(),
        );
        let stemcell = stemcell_manager.upload(extracted).await?;

        self.converge_instance(manifest, compiled, extracted, &stemcell)
            .await
    }

    async fn converge_instance(
        &self,
        manifest: &DeploymentManifest,
        compiled: &CompiledRelease,
        extracted: &ExtractedStemcell,
        stemcell: &CloudStemcell,
    ) -> Result<(), DeployError> {
        let record = DeploymentRecord::new(self.state.clone());
        let vm_manager = VmManager::new(self.cloud.clone(), self.agent.clone(), self.state.clone());
        let disk_manager = DiskManager::new(self.cloud.clone(), self.state.clone());

        let manifest_digest = manifest.digest()?;
        let release_digest = compiled.digest()?;

        let current_vm = vm_manager.find_current()?;
        let vm_alive = match &current_vm {
            Some(vm) => vm.exists().await?,
            None => false,
        };

        if vm_alive && record.is_deployed(&manifest_digest, &release_digest, stemcell)? {
            let stage = self.start_stage("deploying");
            stage
                .new_step("Deploying")
                .skip("No deployment, stemcell or release changes");
            stage.finish();
            return Ok(());
        }

        // Only a release change can be applied to the running VM.
        let previous = self.state.load()?;
        let reuse_vm = vm_alive
            && previous.current_stemcell_id.as_deref() == Some(stemcell.id.as_str())
            && previous.current_manifest_digest.as_deref() == Some(manifest_digest.as_str());

        let stage = self.start_stage("creating VM");
        let vm = end_stage(
            &stage,
            self.ensure_vm(&stage, &vm_manager, current_vm, reuse_vm, manifest, stemcell)
                .await,
        )?;

        if let Some(pool) = &manifest.disk_pool {
            let stage = self.start_stage("converging disk");
            end_stage(&stage, disk_manager.converge(&stage, &vm, pool, reuse_vm).await)?;
        }

        let stage = self.start_stage("updating instance");
        end_stage(
            &stage,
            self.update_instance(&stage, &vm, manifest, compiled, extracted)
                .await,
        )?;

        record.update(&manifest_digest, &release_digest, stemcell)?;
        Ok(())
    }

    fn start_stage(&self, name: &str) -> Stage {
        let stage = Stage::new(self.event_logger.clone(), name);
        stage.start();
        stage
    }

    /// Return a VM running `stemcell` whose agent answers, replacing the
    /// current one unless `reuse` is set.
    async fn ensure_vm(
        &self,
        stage: &Stage,
        vm_manager: &VmManager,
        current: Option<Vm>,
        reuse: bool,
        manifest: &DeploymentManifest,
        stemcell: &CloudStemcell,
    ) -> Result<Vm, DeployError> {
        let create_step = format!("Creating VM from stemcell '{}'", stemcell.cid);
        let vm = match current {
            Some(vm) if reuse => {
                stage.new_step(create_step).skip("VM already exists");
                vm
            }
            current => {
                if let Some(old) = current {
                    let disk_cid = self.state.load()?.current_disk().map(|d| d.cid.clone());
                    stage
                        .perform(
                            format!("Deleting VM '{}'", old.cid()),
                            vm_manager.delete(&old, disk_cid.as_deref()),
                        )
                        .await?;
                }
                stage
                    .perform(create_step, vm_manager.create(stemcell, manifest, &[]))
                    .await?
            }
        };

        stage
            .perform(
                format!("Waiting for the agent on VM '{}'", vm.cid()),
                vm.wait_until_ready(self.options.agent_ready),
            )
            .await?;
        Ok(vm)
    }

    /// Ship the release to the agent and bring its jobs up.
    async fn update_instance(
        &self,
        stage: &Stage,
        vm: &Vm,
        manifest: &DeploymentManifest,
        compiled: &CompiledRelease,
        extracted: &ExtractedStemcell,
    ) -> Result<(), DeployError> {
        let spec = build_apply_spec(manifest, compiled, &extracted.manifest().apply_spec)?;
        stage
            .perform(
                "Uploading compiled artifacts to agent",
                self.upload_blobs(manifest, compiled),
            )
            .await?;
        stage
            .perform("Sending apply message to agent", vm.apply(&spec))
            .await?;
        stage.perform("Starting the agent", vm.start()).await?;
        stage
            .perform(
                "Waiting for the agent to be running",
                vm.wait_until_running(self.options.agent_running),
            )
            .await?;
        Ok(())
    }

    /// Push every blob the apply spec references to the agent's blobstore.
    async fn upload_blobs(
        &self,
        manifest: &DeploymentManifest,
        compiled: &CompiledRelease,
    ) -> Result<(), DeployError> {
        for blob in referenced_blobs(manifest, compiled)? {
            let path = self.blobstore.get(blob)?;
            self.blob_uploader.upload(&path, blob).await?;
        }
        Ok(())
    }
}

/// Close `stage` according to `result`.
fn end_stage<T, E: Error + 'static>(stage: &Stage, result: Result<T, E>) -> Result<T, E> {
    match &result {
        Ok(_) => stage.finish(),
        Err(e) => stage.fail(failure_message(e)),
    }
    result
}

fn referenced_blobs<'a>(
    manifest: &DeploymentManifest,
    compiled: &'a CompiledRelease,
) -> Result<Vec<&'a BlobRef>, DeployError> {
    let mut blobs: BTreeMap<&str, &BlobRef> = BTreeMap::new();
    let templates = manifest.job().map(|j| j.templates.as_slice()).unwrap_or_default();
    for name in templates {
        let job = compiled
            .jobs
            .get(name)
            .ok_or_else(|| DeployError::MissingJob { job: name.clone() })?;
        blobs.insert(&job.blob.blob_id, &job.blob);
        let closure = compiled
            .package_closure(&job.packages)
            .map_err(|missing| DeployError::MissingPackage {
                job: name.clone(),
                package: missing.to_string(),
            })?;
        for package in closure {
            blobs.insert(&package.blob.blob_id, &package.blob);
        }
    }
    Ok(blobs.into_values().collect())
}
