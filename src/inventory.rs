//! Single-host Ansible inventory descriptors.
//!
//! Ansible renamed its connection variables between 1.x (`ansible_ssh_port`,
//! `ansible_ssh_host`) and 2.x (`ansible_port`, `ansible_host`). Both spellings
//! are supported through [`NamingConvention`]; the convention is either forced
//! in configuration or detected from `ansible --version`.

use crate::error::{HarnessError, HarnessResult};
use crate::runtime::is_container_ref;
use crate::util::first_line;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub const INVENTORY_HOST: &str = "127.0.0.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamingConvention {
    /// Ansible 1.x: `ansible_ssh_*` variables.
    Legacy,
    /// Ansible 2.x and later: `ansible_*` variables.
    Modern,
}

impl NamingConvention {
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Legacy => "ansible_ssh",
            Self::Modern => "ansible",
        }
    }
}

impl fmt::Display for NamingConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Legacy => f.write_str("legacy"),
            Self::Modern => f.write_str("modern"),
        }
    }
}

impl FromStr for NamingConvention {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "legacy" | "ansible_ssh" => Ok(Self::Legacy),
            "modern" | "ansible" => Ok(Self::Modern),
            other => Err(format!(
                "unknown naming convention {other:?} (expected \"legacy\" or \"modern\")"
            )),
        }
    }
}

/// Pick the naming convention from `ansible --version` output.
pub fn detect_convention(version_output: &str) -> HarnessResult<NamingConvention> {
    let line = first_line(version_output);
    // Matches `ansible 2.9.1` and `ansible [core 2.14.1]`.
    let version = Regex::new(r"^ansible(?:-\w+)?\s+(?:\[core\s+)?(\d+)\.")
        .expect("regex for ansible version line");
    let major = version
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|major| major.as_str().parse::<u32>().ok())
        .ok_or_else(|| HarnessError::Config {
            field: "ansible version".to_string(),
            reason: format!("unrecognized `ansible --version` output: {line:?}"),
        })?;
    Ok(if major >= 2 {
        NamingConvention::Modern
    } else {
        NamingConvention::Legacy
    })
}

/// Connection parameters for one container, in the format `ansible-playbook -i`
/// reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inventory {
    pub container_id: String,
    pub port: u16,
    pub convention: NamingConvention,
    pub group_header: bool,
}

impl Inventory {
    pub fn host_line(&self) -> String {
        let prefix = self.convention.prefix();
        let (id, port) = (&self.container_id, self.port);
        format!("{id} {prefix}_port={port} {prefix}_host={INVENTORY_HOST}")
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        if self.group_header {
            out.push_str(&format!("[{}]\n", self.container_id));
        }
        out.push_str(&self.host_line());
        out.push('\n');
        out
    }

    /// The descriptor lives at `<dir>/<container id>` so readers can locate it
    /// from the id alone. Ids that could name a path outside `dir` are
    /// rejected.
    pub fn path_in(dir: &Path, container_id: &str) -> HarnessResult<PathBuf> {
        if !is_container_ref(container_id) {
            return Err(HarnessError::Config {
                field: "container id".to_string(),
                reason: format!("{container_id:?} is not a container id or name"),
            });
        }
        Ok(dir.join(container_id))
    }

    pub fn write_to(&self, dir: &Path) -> HarnessResult<PathBuf> {
        let path = Self::path_in(dir, &self.container_id)?;
        fs::write(&path, self.render()).map_err(|err| HarnessError::Config {
            field: "inventory_dir".to_string(),
            reason: format!("write {}: {err}", path.display()),
        })?;
        Ok(path)
    }
}
