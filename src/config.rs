//! Harness configuration.
//!
//! One [`HarnessConfig`] is built at process start and passed by reference to
//! every component. Sources are layered: built-in defaults, an optional JSON
//! file, then environment variables. The CLI applies its flags last.
use crate::error::{HarnessError, HarnessResult};
use crate::inventory::NamingConvention;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const ENV_PUBLIC_KEY_PATH: &str = "SSH_PUBLIC_KEY_PATH";
pub const ENV_PRIVATE_KEY_PATH: &str = "SSH_PRIVATE_KEY_PATH";
pub const ENV_RUNTIME: &str = "HARNESS_RUNTIME";
pub const ENV_ANSIBLE: &str = "HARNESS_ANSIBLE";
pub const ENV_ANSIBLE_PLAYBOOK: &str = "HARNESS_ANSIBLE_PLAYBOOK";
pub const ENV_PLAYBOOK: &str = "HARNESS_PLAYBOOK";
pub const ENV_INVENTORY_DIR: &str = "HARNESS_INVENTORY_DIR";
pub const ENV_CONVENTION: &str = "HARNESS_ANSIBLE_CONVENTION";
pub const ENV_ANSIBLE_ARGS: &str = "HARNESS_ANSIBLE_ARGS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HarnessConfig {
    /// Container runtime CLI.
    pub runtime: String,
    /// Binary queried with `--version` to pick the inventory naming convention.
    pub ansible: String,
    pub ansible_playbook: String,
    pub playbook: PathBuf,
    /// `ANSIBLE_ROLES_PATH`; derived from the working directory when unset.
    pub roles_path: Option<String>,
    pub ssh_control_path: String,
    pub inventory_dir: PathBuf,
    pub inventory_group_header: bool,
    /// Skips version detection when set.
    pub convention: Option<NamingConvention>,
    pub extra_args: Vec<String>,
    pub public_key_path: Option<PathBuf>,
    pub private_key_path: Option<PathBuf>,
    pub verbose: bool,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            runtime: "docker".to_string(),
            ansible: "ansible".to_string(),
            ansible_playbook: "ansible-playbook".to_string(),
            playbook: PathBuf::from("./testing_deployment.yml"),
            roles_path: None,
            ssh_control_path: "./%%h-%%r".to_string(),
            inventory_dir: PathBuf::from("/tmp"),
            inventory_group_header: true,
            convention: None,
            extra_args: Vec::new(),
            public_key_path: None,
            private_key_path: None,
            verbose: false,
        }
    }
}

impl HarnessConfig {
    /// Defaults, then `path` if given, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => load_config_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| env::var(key).ok())?;
        Ok(config)
    }

    /// Overlay values from `lookup`, which maps variable names to values.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        if let Some(value) = lookup(ENV_PUBLIC_KEY_PATH) {
            self.public_key_path = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup(ENV_PRIVATE_KEY_PATH) {
            self.private_key_path = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup(ENV_RUNTIME) {
            self.runtime = value;
        }
        if let Some(value) = lookup(ENV_ANSIBLE) {
            self.ansible = value;
        }
        if let Some(value) = lookup(ENV_ANSIBLE_PLAYBOOK) {
            self.ansible_playbook = value;
        }
        if let Some(value) = lookup(ENV_PLAYBOOK) {
            self.playbook = PathBuf::from(value);
        }
        if let Some(value) = lookup(ENV_INVENTORY_DIR) {
            self.inventory_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup(ENV_CONVENTION) {
            let convention = value
                .parse::<NamingConvention>()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("parse {ENV_CONVENTION}"))?;
            self.convention = Some(convention);
        }
        if let Some(value) = lookup(ENV_ANSIBLE_ARGS) {
            self.extra_args = shell_words::split(&value)
                .with_context(|| format!("parse {ENV_ANSIBLE_ARGS} as shell words"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> HarnessResult<()> {
        for (field, value) in [
            ("runtime", &self.runtime),
            ("ansible", &self.ansible),
            ("ansible_playbook", &self.ansible_playbook),
        ] {
            if value.trim().is_empty() {
                return Err(invalid(field, "must be non-empty"));
            }
        }
        if self.playbook.as_os_str().is_empty() {
            return Err(invalid("playbook", "must be non-empty"));
        }
        if self.inventory_dir.as_os_str().is_empty() {
            return Err(invalid("inventory_dir", "must be non-empty"));
        }
        Ok(())
    }

    /// Confirm the external tools resolve on `PATH`.
    ///
    /// The `ansible --version` check is skipped when the convention is forced.
    pub fn preflight(&self) -> HarnessResult<()> {
        let mut tools = vec![
            ("runtime", &self.runtime),
            ("ansible_playbook", &self.ansible_playbook),
        ];
        if self.convention.is_none() {
            tools.push(("ansible", &self.ansible));
        }
        for (field, tool) in tools {
            which::which(tool)
                .map_err(|err| invalid(field, &format!("{tool} not found on PATH: {err}")))?;
        }
        Ok(())
    }

    pub fn public_key_path(&self) -> HarnessResult<PathBuf> {
        resolve_key_path(
            self.public_key_path.as_deref(),
            ENV_PUBLIC_KEY_PATH,
            "id_rsa.pub",
        )
    }

    pub fn private_key_path(&self) -> HarnessResult<PathBuf> {
        resolve_key_path(
            self.private_key_path.as_deref(),
            ENV_PRIVATE_KEY_PATH,
            "id_rsa",
        )
    }

    /// `<parent>/../:<parent>:<cwd>` so a role checked out next to its test
    /// directory resolves by name.
    pub fn roles_path(&self) -> HarnessResult<String> {
        if let Some(roles_path) = &self.roles_path {
            return Ok(roles_path.clone());
        }
        let cwd = env::current_dir()
            .map_err(|err| invalid("roles_path", &format!("read working directory: {err}")))?;
        Ok(default_roles_path(&cwd))
    }
}

fn default_roles_path(cwd: &Path) -> String {
    let parent = cwd.parent().unwrap_or(cwd).display();
    let cwd = cwd.display();
    format!("{parent}/../:{parent}:{cwd}")
}

fn resolve_key_path(
    configured: Option<&Path>,
    env_key: &str,
    default_name: &str,
) -> HarnessResult<PathBuf> {
    if let Some(path) = configured {
        return Ok(path.to_path_buf());
    }
    dirs::home_dir()
        .map(|home| home.join(".ssh").join(default_name))
        .ok_or_else(|| invalid(env_key, "not set and no home directory to fall back to"))
}

fn invalid(field: &str, reason: &str) -> HarnessError {
    HarnessError::Config {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

/// Load a JSON config file; omitted fields keep their defaults.
pub fn load_config_file(path: &Path) -> Result<HarnessConfig> {
    let bytes = fs::read(path).with_context(|| format!("read config {}", path.display()))?;
    let config = serde_json::from_slice(&bytes).context("parse harness config JSON")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn env_overrides_defaults() {
        let mut config = HarnessConfig::default();
        config
            .apply_env(lookup_from(&[
                (ENV_PUBLIC_KEY_PATH, "/keys/test.pub"),
                (ENV_PRIVATE_KEY_PATH, "/keys/test"),
                (ENV_RUNTIME, "podman"),
                (ENV_CONVENTION, "legacy"),
                (ENV_ANSIBLE_ARGS, "--diff -e 'greeting=hello world'"),
            ]))
            .unwrap();
        assert_eq!(
            config.public_key_path().unwrap(),
            Path::new("/keys/test.pub")
        );
        assert_eq!(config.private_key_path().unwrap(), Path::new("/keys/test"));
        assert_eq!(config.runtime, "podman");
        assert_eq!(config.convention, Some(NamingConvention::Legacy));
        assert_eq!(
            config.extra_args,
            vec!["--diff", "-e", "greeting=hello world"]
        );
        assert_eq!(config.ansible_playbook, "ansible-playbook");
    }

    #[test]
    fn blank_env_values_are_ignored() {
        let mut config = HarnessConfig::default();
        config
            .apply_env(lookup_from(&[(ENV_RUNTIME, "  ")]))
            .unwrap();
        assert_eq!(config.runtime, "docker");
    }

    #[test]
    fn bad_convention_is_rejected() {
        let mut config = HarnessConfig::default();
        let err = config
            .apply_env(lookup_from(&[(ENV_CONVENTION, "v3")]))
            .unwrap_err();
        assert!(format!("{err:#}").contains(ENV_CONVENTION));
    }

    #[test]
    fn file_values_fill_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.json");
        fs::write(
            &path,
            r#"{"playbook": "site.yml", "inventory_group_header": false, "convention": "modern"}"#,
        )
        .unwrap();
        let config = load_config_file(&path).unwrap();
        assert_eq!(config.playbook, PathBuf::from("site.yml"));
        assert!(!config.inventory_group_header);
        assert_eq!(config.convention, Some(NamingConvention::Modern));
        assert_eq!(config.runtime, "docker");
    }

    #[test]
    fn unknown_file_fields_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.json");
        fs::write(&path, r#"{"docker_image": "debian:jessie"}"#).unwrap();
        assert!(load_config_file(&path).is_err());
    }

    #[test]
    fn validate_rejects_empty_binaries() {
        let config = HarnessConfig {
            runtime: String::new(),
            ..HarnessConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("runtime"));
        assert!(HarnessConfig::default().validate().is_ok());
    }

    #[test]
    fn preflight_names_missing_tool() {
        let config = HarnessConfig {
            runtime: "role-harness-missing-runtime".to_string(),
            ..HarnessConfig::default()
        };
        let err = config.preflight().unwrap_err();
        assert!(err.to_string().contains("role-harness-missing-runtime"));
    }

    #[test]
    fn default_roles_path_covers_parent_and_cwd() {
        assert_eq!(
            default_roles_path(Path::new("/work/role/tests")),
            "/work/role/../:/work/role:/work/role/tests"
        );
        let config = HarnessConfig {
            roles_path: Some("/roles".to_string()),
            ..HarnessConfig::default()
        };
        assert_eq!(config.roles_path().unwrap(), "/roles");
    }
}
