//! Environment Provisioner: boot, wire up, and provision one container per
//! image, and tear it all down again.
use crate::command::{CommandRunner, Invocation};
use crate::config::HarnessConfig;
use crate::container::ContainerBackend;
use crate::error::{HarnessError, HarnessResult, TeardownError};
use crate::inventory::{detect_convention, Inventory, NamingConvention};
use crate::runtime::DockerRuntime;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::PathBuf;

/// A live, provisioned container. Released exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentHandle {
    pub image: String,
    pub container_id: String,
    pub ssh_port: u16,
    pub inventory_path: PathBuf,
}

pub struct Provisioner<'c, R: CommandRunner> {
    config: &'c HarnessConfig,
    runner: R,
}

impl<'c, R: CommandRunner> Provisioner<'c, R> {
    pub fn new(config: &'c HarnessConfig, runner: R) -> Self {
        Self { config, runner }
    }

    pub fn config(&self) -> &HarnessConfig {
        self.config
    }

    pub fn runtime(&self) -> DockerRuntime<'_, R> {
        DockerRuntime::new(&self.runner, self.config.runtime.as_str())
    }

    /// Boot `image`, authorize the harness key, and run the playbook against it.
    ///
    /// Anything created before a failing step is released before the error is
    /// returned.
    pub fn acquire(&self, image: &str) -> HarnessResult<EnvironmentHandle> {
        tracing::info!(image, "starting container");
        let runtime = self.runtime();
        let container_id = runtime
            .run_privileged(image)
            .map_err(|failure| HarnessError::Acquisition {
                image: image.to_string(),
                reason: failure.to_string(),
            })?;

        // The runtime only hands back ids that pass `is_container_ref`.
        let inventory_path = Inventory::path_in(&self.config.inventory_dir, &container_id)?;
        let mut partial = EnvironmentHandle {
            image: image.to_string(),
            container_id,
            ssh_port: 0,
            inventory_path,
        };
        match self.wire_up(&runtime, &mut partial) {
            Ok(()) => {
                tracing::info!(
                    image,
                    container = %partial.container_id,
                    ssh_port = partial.ssh_port,
                    "environment ready"
                );
                Ok(partial)
            }
            Err(err) => {
                tracing::warn!(image, container = %partial.container_id, "setup failed: {err}");
                if let Err(teardown) = self.release(&partial) {
                    tracing::warn!("{teardown}");
                }
                Err(err)
            }
        }
    }

    fn wire_up(
        &self,
        runtime: &DockerRuntime<'_, R>,
        handle: &mut EnvironmentHandle,
    ) -> HarnessResult<()> {
        handle.ssh_port = runtime
            .ssh_host_port(&handle.container_id)
            .map_err(|failure| HarnessError::Acquisition {
                image: handle.image.clone(),
                reason: failure.to_string(),
            })?;

        let convention = self.naming_convention()?;
        let inventory = Inventory {
            container_id: handle.container_id.clone(),
            port: handle.ssh_port,
            convention,
            group_header: self.config.inventory_group_header,
        };
        handle.inventory_path = inventory.write_to(&self.config.inventory_dir)?;
        tracing::debug!(path = %handle.inventory_path.display(), %convention, "wrote inventory");

        let backend = ContainerBackend::new(runtime, &self.runner, handle.container_id.as_str());
        let public_key = self.config.public_key_path()?;
        backend.set_authorized_keys(&public_key, self.config.verbose)?;
        backend.provision(self.config, &handle.inventory_path)?;
        Ok(())
    }

    /// The forced convention, or the one matching the installed Ansible.
    pub fn naming_convention(&self) -> HarnessResult<NamingConvention> {
        if let Some(convention) = self.config.convention {
            return Ok(convention);
        }
        let invocation = Invocation::new(self.config.ansible.as_str()).arg("--version");
        let command = invocation.command_line();
        let output = self
            .runner
            .run(&invocation)
            .map_err(|err| HarnessError::Config {
                field: "ansible".to_string(),
                reason: format!("`{command}` failed: {err}"),
            })?;
        if !output.success() {
            return Err(HarnessError::Config {
                field: "ansible".to_string(),
                reason: format!("`{command}` failed: {}", output.failure_summary()),
            });
        }
        detect_convention(&output.stdout)
    }

    /// Kill and remove the container, then delete its inventory file.
    ///
    /// Every step runs even when an earlier one fails; all failures are
    /// returned together. Only the descriptor `<inventory_dir>/<container id>`
    /// is ever deleted.
    pub fn release(&self, handle: &EnvironmentHandle) -> Result<(), TeardownError> {
        let runtime = self.runtime();
        let mut failures = Vec::new();
        if let Err(failure) = runtime.kill(&handle.container_id) {
            failures.push(format!("kill: {failure}"));
        }
        if let Err(failure) = runtime.remove(&handle.container_id) {
            failures.push(format!("rm: {failure}"));
        }
        if let Err(reason) = self.remove_inventory(handle) {
            failures.push(reason);
        }

        if failures.is_empty() {
            tracing::info!(
                image = %handle.image,
                container = %handle.container_id,
                "environment released"
            );
            Ok(())
        } else {
            Err(TeardownError {
                container_id: handle.container_id.clone(),
                failures,
            })
        }
    }

    fn remove_inventory(&self, handle: &EnvironmentHandle) -> Result<(), String> {
        let owned = Inventory::path_in(&self.config.inventory_dir, &handle.container_id)
            .map_err(|err| format!("keep inventory {}: {err}", handle.inventory_path.display()))?;
        if handle.inventory_path != owned {
            let found = handle.inventory_path.display();
            return Err(format!("keep inventory {found}: expected {}", owned.display()));
        }
        match fs::remove_file(&owned) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => {
                Err(format!("delete inventory {}: {err}", owned.display()))
            }
            _ => Ok(()),
        }
    }
}
