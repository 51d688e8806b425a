//! Phase 1: clone the template and size the copy.

use tracing::{debug, info};

use crate::command::CommandRunner;
use crate::control::{ControlPlane, GuestChannel};
use crate::power::PowerController;

use super::{DeployError, DeploymentRunner};

impl<C, G, R> DeploymentRunner<'_, C, G, R>
where
    C: ControlPlane + ?Sized,
    G: GuestChannel + ?Sized,
    R: CommandRunner + ?Sized,
{
    pub(super) async fn run_clone(
        &self,
        power: &PowerController<'_, C, G>,
    ) -> Result<String, DeployError> {
        let vm = self.params.vm();
        if let Some(existing) = power
            .retry()
            .find(self.control, &vm.name, self.cancel)
            .await?
        {
            return Err(DeployError::NameCollision {
                vm: vm.name.clone(),
                power: existing.power,
            });
        }
        let Some(template) = vm
            .template
            .as_deref()
            .filter(|template| !template.trim().is_empty())
        else {
            return Err(DeployError::CloneSourceMissing {
                vm: vm.name.clone(),
            });
        };

        info!(vm = %vm.name, template, "cloning");
        self.control.clone_vm(vm)?;
        if vm.cpus.is_some() || vm.memory_mb.is_some() {
            self.control.set_compute(&vm.name, vm.cpus, vm.memory_mb)?;
        }

        let mut resized = 0_usize;
        for (index, disk) in self.params.disks().iter().enumerate() {
            let Some(size_gb) = disk.size_gb else {
                continue;
            };
            let label = disk.label(index);
            debug!(vm = %vm.name, disk = %label, size_gb, "resizing disk");
            self.control.resize_disk(&vm.name, &label, size_gb)?;
            resized += 1;
        }

        // The new VM must be visible before later phases resolve it by name.
        self.require_vm(power).await?;
        Ok(format!("cloned from {template}, {resized} disk(s) resized"))
    }
}
