//! Container-backed fixtures for testing Ansible roles.
//!
//! A [`Provisioner`] boots a privileged container, authorizes the harness SSH
//! key inside it, and applies a playbook to it with `ansible-playbook`. A
//! [`LifecycleController`] decides how long each environment lives and
//! guarantees it is released.

pub mod command;
pub mod config;
pub mod container;
pub mod error;
pub mod inventory;
pub mod lifecycle;
pub mod logging;
pub mod provision;
pub mod runtime;
mod util;

pub use command::{CommandOutput, CommandRunner, Invocation, LocalRunner};
pub use config::HarnessConfig;
pub use error::{HarnessError, HarnessResult, TeardownError};
pub use inventory::{Inventory, NamingConvention};
pub use lifecycle::{
    EnvironmentSource, GroupReport, GroupSpec, LifecycleController, Scope, ScopedEnvironment,
    TestCase, TestOutcome, TestRun, DEFAULT_IMAGE,
};
pub use provision::{EnvironmentHandle, Provisioner};
