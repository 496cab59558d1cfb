//! Shared test infrastructure for integration tests.
#![allow(dead_code)]

use role_harness::{
    CommandOutput, CommandRunner, EnvironmentHandle, EnvironmentSource, HarnessConfig,
    HarnessError, HarnessResult, Invocation, TeardownError,
};
use std::cell::RefCell;
use std::env;
use std::io;
use std::path::PathBuf;
use tempfile::TempDir;

/// Lifecycle event recorded by [`RecordingSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Acquired { image: String, container_id: String },
    Released { container_id: String },
}

impl Event {
    pub fn container_id(&self) -> &str {
        match self {
            Event::Acquired { container_id, .. } => container_id,
            Event::Released { container_id } => container_id,
        }
    }
}

/// In-memory environment source that hands out numbered containers and
/// records every acquire and release in order.
#[derive(Default)]
pub struct RecordingSource {
    pub events: RefCell<Vec<Event>>,
    /// Images whose acquisition fails.
    pub broken_images: Vec<String>,
    /// Containers whose release reports a failure.
    pub sticky_containers: Vec<String>,
    pub next_id: RefCell<usize>,
}

impl RecordingSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquired(&self) -> Vec<(String, String)> {
        self.events
            .borrow()
            .iter()
            .filter_map(|event| match event {
                Event::Acquired {
                    image,
                    container_id,
                } => Some((image.clone(), container_id.clone())),
                Event::Released { .. } => None,
            })
            .collect()
    }

    pub fn released(&self) -> Vec<String> {
        self.events
            .borrow()
            .iter()
            .filter_map(|event| match event {
                Event::Released { container_id } => Some(container_id.clone()),
                Event::Acquired { .. } => None,
            })
            .collect()
    }
}

impl EnvironmentSource for RecordingSource {
    fn acquire(&self, image: &str) -> HarnessResult<EnvironmentHandle> {
        if self.broken_images.iter().any(|broken| broken == image) {
            return Err(HarnessError::Acquisition {
                image: image.to_string(),
                reason: "image publishes no host port for 22/tcp".to_string(),
            });
        }
        let mut next_id = self.next_id.borrow_mut();
        let container_id = format!("{}-{}", image.replace([':', '/'], "_"), *next_id);
        *next_id += 1;
        self.events.borrow_mut().push(Event::Acquired {
            image: image.to_string(),
            container_id: container_id.clone(),
        });
        Ok(EnvironmentHandle {
            image: image.to_string(),
            inventory_path: PathBuf::from("/tmp").join(&container_id),
            container_id,
            ssh_port: 32768,
        })
    }

    fn release(&self, handle: &EnvironmentHandle) -> Result<(), TeardownError> {
        self.events.borrow_mut().push(Event::Released {
            container_id: handle.container_id.clone(),
        });
        if self.sticky_containers.contains(&handle.container_id) {
            return Err(TeardownError {
                container_id: handle.container_id.clone(),
                failures: vec!["kill: container is not running".to_string()],
            });
        }
        Ok(())
    }
}

/// Stand-in for `docker`, `ansible`, and `ansible-playbook` that succeeds at
/// everything and records each command line.
#[derive(Default)]
pub struct FakeToolchain {
    pub commands: RefCell<Vec<String>>,
    pub next_id: RefCell<usize>,
}

impl CommandRunner for FakeToolchain {
    fn run(&self, invocation: &Invocation) -> io::Result<CommandOutput> {
        self.commands.borrow_mut().push(invocation.command_line());
        let program = invocation.program.as_str();
        let stdout = match (program, invocation.args.first().map(String::as_str)) {
            ("docker", Some("run")) => {
                let mut next_id = self.next_id.borrow_mut();
                *next_id += 1;
                format!("container{next_id}\n")
            }
            ("docker", Some("inspect")) => "32768\n".to_string(),
            ("ansible", Some("--version")) => "ansible 2.9.1\n".to_string(),
            _ => String::new(),
        };
        Ok(CommandOutput {
            exit_code: Some(0),
            stdout,
            stderr: String::new(),
        })
    }
}

/// Config pointing the key paths and inventory directory at a temp dir.
pub struct TempConfig {
    pub dir: TempDir,
    pub config: HarnessConfig,
}

impl TempConfig {
    pub fn new() -> anyhow::Result<Self> {
        let dir = TempDir::new()?;
        let public_key = dir.path().join("id_rsa.pub");
        std::fs::write(&public_key, "ssh-rsa AAAAB3Nza harness@test\n")?;
        let inventory_dir = dir.path().join("inventory");
        std::fs::create_dir(&inventory_dir)?;
        let config = HarnessConfig {
            public_key_path: Some(public_key),
            private_key_path: Some(dir.path().join("id_rsa")),
            inventory_dir,
            roles_path: Some(dir.path().display().to_string()),
            ..HarnessConfig::default()
        };
        Ok(Self { dir, config })
    }
}

/// Gate for tests that need a real container runtime and Ansible.
pub fn e2e_config() -> Option<HarnessConfig> {
    if env::var("HARNESS_E2E").map(|v| v != "1").unwrap_or(true) {
        eprintln!("Skipping: set HARNESS_E2E=1 to run container tests");
        return None;
    }
    let config = match HarnessConfig::load(None) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Skipping: harness config unavailable: {err:#}");
            return None;
        }
    };
    if let Err(err) = config.preflight() {
        eprintln!("Skipping: {err}");
        return None;
    }
    Some(config)
}
