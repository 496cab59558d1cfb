//! Container runtime client over the runtime's CLI.
use crate::command::{CommandOutput, CommandRunner, Invocation};
use regex::Regex;
use std::fmt;

/// Go template resolving the host port published for the container's SSH port.
pub const SSH_PORT_TEMPLATE: &str =
    r#"{{ (index (index .NetworkSettings.Ports "22/tcp") 0).HostPort }}"#;

/// Why a runtime call failed. Callers map this into their own error kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeFailure {
    pub command: String,
    pub reason: String,
}

impl fmt::Display for RuntimeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{}` failed: {}", self.command, self.reason)
    }
}

impl std::error::Error for RuntimeFailure {}

/// Whether `reference` is a container id or name the runtime could have
/// issued: `[a-zA-Z0-9][a-zA-Z0-9_.-]*`.
pub fn is_container_ref(reference: &str) -> bool {
    let pattern = Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]*$").expect("regex for container refs");
    pattern.is_match(reference)
}

pub struct DockerRuntime<'r, R: CommandRunner> {
    runner: &'r R,
    binary: String,
}

impl<'r, R: CommandRunner> DockerRuntime<'r, R> {
    pub fn new(runner: &'r R, binary: impl Into<String>) -> Self {
        Self {
            runner,
            binary: binary.into(),
        }
    }

    /// Start `image` detached and privileged with every exposed port published.
    /// Returns the container id.
    pub fn run_privileged(&self, image: &str) -> Result<String, RuntimeFailure> {
        let invocation = self.invocation(["run", "--privileged", "-d", "-P", image]);
        let output = self.check(&invocation)?;
        let id = output.stdout.trim();
        if id.is_empty() {
            return Err(RuntimeFailure {
                command: invocation.command_line(),
                reason: "runtime returned no container id".to_string(),
            });
        }
        if !is_container_ref(id) {
            return Err(RuntimeFailure {
                command: invocation.command_line(),
                reason: format!("runtime returned an unexpected container id: {id:?}"),
            });
        }
        Ok(id.to_string())
    }

    pub fn ssh_host_port(&self, container_id: &str) -> Result<u16, RuntimeFailure> {
        let invocation = self.invocation(["inspect", "--format", SSH_PORT_TEMPLATE, container_id]);
        let output = self.check(&invocation)?;
        parse_host_port(&output.stdout).map_err(|reason| RuntimeFailure {
            command: invocation.command_line(),
            reason,
        })
    }

    /// Run `argv` inside the container. A non-zero exit is returned, not
    /// raised.
    pub fn exec(&self, container_id: &str, argv: &[&str]) -> Result<CommandOutput, RuntimeFailure> {
        let invocation = self
            .invocation(["exec", container_id])
            .args(argv.iter().copied());
        self.runner.run(&invocation).map_err(|err| RuntimeFailure {
            command: invocation.command_line(),
            reason: err.to_string(),
        })
    }

    pub fn kill(&self, container_id: &str) -> Result<(), RuntimeFailure> {
        self.check(&self.invocation(["kill", container_id]))?;
        Ok(())
    }

    pub fn remove(&self, container_id: &str) -> Result<(), RuntimeFailure> {
        self.check(&self.invocation(["rm", container_id]))?;
        Ok(())
    }

    fn invocation<'a>(&self, args: impl IntoIterator<Item = &'a str>) -> Invocation {
        Invocation::new(self.binary.as_str()).args(args)
    }

    fn check(&self, invocation: &Invocation) -> Result<CommandOutput, RuntimeFailure> {
        let output = self.runner.run(invocation).map_err(|err| RuntimeFailure {
            command: invocation.command_line(),
            reason: err.to_string(),
        })?;
        if !output.success() {
            return Err(RuntimeFailure {
                command: invocation.command_line(),
                reason: output.failure_summary(),
            });
        }
        Ok(output)
    }
}

/// Parse the inspect output for the SSH port mapping.
pub fn parse_host_port(raw: &str) -> Result<u16, String> {
    let value = raw.trim().trim_matches('\'');
    if value.is_empty() || value == "<no value>" {
        return Err("image publishes no host port for 22/tcp".to_string());
    }
    match value.parse::<u16>() {
        Ok(0) => Err("runtime reported host port 0 for 22/tcp".to_string()),
        Ok(port) => Ok(port),
        Err(_) => Err(format!("malformed host port for 22/tcp: {value:?}")),
    }
}
