use super::vm::{Vm, VmError};
use crate::cloud::{Cloud, CloudError};
use crate::config::{ConfigError, DeploymentStateService, DiskRecord};
use crate::eventlog::Stage;
use crate::manifest::DiskPool;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DiskError {
    #[error("Managing persistent disk: {0}")]
    Cloud(#[from] CloudError),

    #[error("{0}")]
    Vm(#[from] VmError),

    #[error("Recording disk: {0}")]
    State(#[from] ConfigError),
}

/// Converges the deployment's persistent disk onto a VM. A disk whose size
/// or cloud properties changed is replaced by migrating its data to a new
/// disk; an unchanged one is reattached in place.
pub struct DiskManager {
    cloud: Arc<dyn Cloud>,
    state: Arc<dyn DeploymentStateService>,
}

impl DiskManager {
    pub fn new(cloud: Arc<dyn Cloud>, state: Arc<dyn DeploymentStateService>) -> Self {
        Self { cloud, state }
    }

    /// Bring `vm` to a state where the disk described by `pool` is attached
    /// and mounted. `attached` says whether the current disk is already
    /// attached to `vm` (a reused VM).
    ///
    /// Every created disk is recorded before it is attached. A first disk
    /// becomes current straight away; a replacement disk stays pending until
    /// its migration completes and is picked up again by the next run if the
    /// migration fails.
    pub async fn converge(
        &self,
        stage: &Stage,
        vm: &Vm,
        pool: &DiskPool,
        attached: bool,
    ) -> Result<DiskRecord, DiskError> {
        let state = self.state.load()?;
        let Some(current) = state.current_disk().cloned() else {
            let disk = stage
                .perform("Creating disk", self.create(vm, pool))
                .await?;
            self.update_current(&disk.id)?;
            self.attach(stage, vm, &disk).await?;
            return Ok(disk);
        };

        if attached {
            stage
                .new_step(attach_step_name(vm, &current))
                .skip("Disk already attached");
        } else {
            self.attach(stage, vm, &current).await?;
        }

        if fits_pool(&current, pool) {
            return Ok(current);
        }

        let pending = state
            .disks
            .iter()
            .find(|disk| disk.id != current.id && fits_pool(disk, pool))
            .cloned();
        let disk = match pending {
            Some(disk) => {
                stage
                    .new_step("Creating disk")
                    .skip(format!("Reusing disk '{}'", disk.cid));
                disk
            }
            None => {
                stage
                    .perform("Creating disk", self.create(vm, pool))
                    .await?
            }
        };
        self.attach(stage, vm, &disk).await?;
        stage
            .perform(
                format!("Migrating disk '{}' to '{}'", current.cid, disk.cid),
                self.migrate(vm, &current, &disk),
            )
            .await?;
        self.update_current(&disk.id)?;
        self.delete_unused(stage, &disk).await?;
        Ok(disk)
    }

    async fn attach(&self, stage: &Stage, vm: &Vm, disk: &DiskRecord) -> Result<(), DiskError> {
        stage
            .perform(attach_step_name(vm, disk), async {
                vm.attach_disk(&disk.cid).await.map_err(DiskError::from)
            })
            .await
    }

    /// Delete disks left pending by earlier failed migrations.
    async fn delete_unused(&self, stage: &Stage, current: &DiskRecord) -> Result<(), DiskError> {
        let unused: Vec<DiskRecord> = self
            .state
            .load()?
            .disks
            .into_iter()
            .filter(|disk| disk.id != current.id)
            .collect();
        for disk in unused {
            stage
                .perform(
                    format!("Deleting unused disk '{}'", disk.cid),
                    self.delete(&disk),
                )
                .await?;
        }
        Ok(())
    }

    async fn delete(&self, disk: &DiskRecord) -> Result<(), DiskError> {
        self.cloud.delete_disk(&disk.cid).await?;
        let id = disk.id.clone();
        self.state
            .update(&mut |state| state.disks.retain(|d| d.id != id))?;
        Ok(())
    }

    async fn create(&self, vm: &Vm, pool: &DiskPool) -> Result<DiskRecord, DiskError> {
        let cid = self
            .cloud
            .create_disk(pool.disk_size, &pool.cloud_properties, vm.cid())
            .await?;
        let record = DiskRecord {
            id: Uuid::new_v4().to_string(),
            cid,
            size_mb: pool.disk_size,
            cloud_properties: pool.cloud_properties.clone(),
        };
        let saved = record.clone();
        self.state
            .update(&mut |state| state.disks.push(saved.clone()))?;
        info!("Created disk {} ({} MB)", record.cid, record.size_mb);
        Ok(record)
    }

    /// Copy data from `old` onto `new`, then detach and delete `old`.
    async fn migrate(&self, vm: &Vm, old: &DiskRecord, new: &DiskRecord) -> Result<(), DiskError> {
        vm.migrate_disk().await?;
        vm.unmount_disk(&old.cid).await?;
        vm.detach_disk(&old.cid).await?;
        self.cloud.delete_disk(&old.cid).await?;

        let old_id = old.id.clone();
        self.state
            .update(&mut |state| state.disks.retain(|d| d.id != old_id))?;
        info!("Migrated disk {} to {}", old.cid, new.cid);
        Ok(())
    }

    fn update_current(&self, id: &str) -> Result<(), DiskError> {
        self.state
            .update(&mut |state| state.current_disk_id = Some(id.to_string()))?;
        Ok(())
    }
}

fn attach_step_name(vm: &Vm, disk: &DiskRecord) -> String {
    format!("Attaching disk '{}' to VM '{}'", disk.cid, vm.cid())
}

fn fits_pool(disk: &DiskRecord, pool: &DiskPool) -> bool {
    disk.size_mb == pool.disk_size && disk.cloud_properties == pool.cloud_properties
}
