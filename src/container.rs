//! A running container plus the two operations the harness needs on top of
//! the runtime: authorizing the harness key and provisioning over SSH.
use crate::command::{CommandOutput, CommandRunner, Invocation};
use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::runtime::{DockerRuntime, RuntimeFailure};
use crate::util::{truncate_string, MAX_REPORTED_OUTPUT_BYTES};
use std::fs;
use std::path::Path;

pub const AUTHORIZED_KEYS_DIR: &str = "/root/.ssh";
pub const AUTHORIZED_KEYS_FILE: &str = "/root/.ssh/authorized_keys";

pub struct ContainerBackend<'a, 'r, R: CommandRunner> {
    runtime: &'a DockerRuntime<'r, R>,
    runner: &'r R,
    id: String,
}

impl<'a, 'r, R: CommandRunner> ContainerBackend<'a, 'r, R> {
    pub fn new(runtime: &'a DockerRuntime<'r, R>, runner: &'r R, id: impl Into<String>) -> Self {
        Self {
            runtime,
            runner,
            id: id.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run a shell snippet inside the container.
    pub fn run_shell(&self, script: &str) -> Result<CommandOutput, RuntimeFailure> {
        self.runtime.exec(&self.id, &["sh", "-c", script])
    }

    /// Append the public key to root's `authorized_keys`.
    ///
    /// Appends on every call; running it twice leaves a duplicate entry.
    pub fn set_authorized_keys(&self, public_key_path: &Path, verbose: bool) -> HarnessResult<()> {
        let key_path = public_key_path.display();
        let public_key = fs::read_to_string(public_key_path)
            .map_err(|err| self.injection_error(format!("read public key {key_path}: {err}")))?;
        let public_key = public_key.trim();
        if public_key.is_empty() {
            return Err(self.injection_error(format!("public key {key_path} is empty")));
        }

        self.exec_checked(&["mkdir", "-p", AUTHORIZED_KEYS_DIR])?;
        // The key travels as a positional argument so it is never re-parsed
        // by the shell.
        let append = format!("printf '%s\\n' \"$1\" >> {AUTHORIZED_KEYS_FILE}");
        self.exec_checked(&["sh", "-c", &append, "sh", public_key])?;

        if verbose {
            tracing::info!(container = %self.id, key = %public_key, "added public SSH key");
        } else {
            tracing::debug!(container = %self.id, "added public SSH key");
        }
        Ok(())
    }

    /// Apply the configured playbook to this container over SSH.
    pub fn provision(
        &self,
        config: &HarnessConfig,
        inventory_path: &Path,
    ) -> HarnessResult<CommandOutput> {
        let invocation = ansible_invocation(config, inventory_path)?;
        let command = invocation.command_line();
        if config.verbose {
            tracing::info!(container = %self.id, "ansible provision command:\n{command}");
        }

        // A playbook run that never started is a tooling problem, not a
        // provisioning result.
        let output = self
            .runner
            .run(&invocation)
            .map_err(|err| HarnessError::Config {
                field: "ansible_playbook".to_string(),
                reason: format!("`{command}` could not be started: {err}"),
            })?;

        if config.verbose {
            tracing::info!(container = %self.id, "ansible provision output:\n{}", output.stdout);
        }
        if !output.success() {
            return Err(HarnessError::Provision {
                container_id: self.id.clone(),
                command,
                exit_code: output.exit_code,
                stdout: truncate_string(&output.stdout, MAX_REPORTED_OUTPUT_BYTES),
                stderr: truncate_string(&output.stderr, MAX_REPORTED_OUTPUT_BYTES),
            });
        }
        Ok(output)
    }

    fn exec_checked(&self, argv: &[&str]) -> HarnessResult<()> {
        let output = self
            .runtime
            .exec(&self.id, argv)
            .map_err(|failure| self.injection_error(failure.to_string()))?;
        if !output.success() {
            let program = argv.first().copied().unwrap_or_default();
            let summary = output.failure_summary();
            return Err(self.injection_error(format!("`{program}` in container: {summary}")));
        }
        Ok(())
    }

    fn injection_error(&self, reason: String) -> HarnessError {
        HarnessError::CredentialInjection {
            container_id: self.id.clone(),
            reason,
        }
    }
}

/// `ansible-playbook` pointed at one container's inventory, connecting as root
/// with the harness private key and no host key checks.
pub fn ansible_invocation(
    config: &HarnessConfig,
    inventory_path: &Path,
) -> HarnessResult<Invocation> {
    let private_key = config.private_key_path()?.display().to_string();
    Ok(Invocation::new(config.ansible_playbook.as_str())
        .env("ANSIBLE_SSH_CONTROL_PATH", config.ssh_control_path.as_str())
        .env("ANSIBLE_PRIVATE_KEY_FILE", private_key)
        .env("ANSIBLE_REMOTE_USER", "root")
        .env("ANSIBLE_HOST_KEY_CHECKING", "False")
        .env("ANSIBLE_SSH_PIPELINING", "True")
        .env("ANSIBLE_ROLES_PATH", config.roles_path()?)
        .arg("-i")
        .arg(inventory_path.display().to_string())
        .arg(config.playbook.display().to_string())
        .args(config.extra_args.iter().cloned()))
}
