//! Error taxonomy for environment acquisition, provisioning, and teardown.
//!
//! Setup failures (`Acquisition`, `CredentialInjection`, `Provision`) abort a
//! test group and are reported as setup failures, never as assertion failures.
//! Teardown failures are aggregated per container and reported alongside the
//! test results without replacing them.

use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum HarnessError {
    #[error("invalid harness configuration: {field} - {reason}")]
    Config { field: String, reason: String },

    #[error("failed to acquire environment for image {image}: {reason}")]
    Acquisition { image: String, reason: String },

    #[error("failed to inject credentials into container {container_id}: {reason}")]
    CredentialInjection {
        container_id: String,
        reason: String,
    },

    #[error(
        "provisioning failed for container {container_id} (exit={exit}): {command}\n--- stdout ---\n{stdout}\n--- stderr ---\n{stderr}",
        exit = exit_code_label(.exit_code)
    )]
    Provision {
        container_id: String,
        command: String,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error(transparent)]
    Teardown(#[from] TeardownError),

    #[error("environment for image {image} was already torn down")]
    ScopeClosed { image: String },
}

impl HarnessError {
    /// Whether this error happened while building an environment.
    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self,
            Self::Config { .. }
                | Self::Acquisition { .. }
                | Self::CredentialInjection { .. }
                | Self::Provision { .. }
        )
    }
}

/// Every cleanup step that failed for one container.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("teardown of container {container_id} failed: {}", .failures.join("; "))]
pub struct TeardownError {
    pub container_id: String,
    pub failures: Vec<String>,
}

pub type HarnessResult<T> = Result<T, HarnessError>;

fn exit_code_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => code.to_string(),
        None => "signal".to_string(),
    }
}
