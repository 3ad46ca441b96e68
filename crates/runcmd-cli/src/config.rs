//! Configuration loading and types

use std::path::{Path, PathBuf};

use eyre::{WrapErr, bail, eyre};
use runcmd::{ConnectionInfo, Credential, KeySource, Timeouts};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the runcmd binary
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default)]
    pub log_level: Option<String>,
    /// Remote hosts commands can be sent to
    #[serde(default)]
    pub host: Vec<HostConfig>,
}

/// One remote host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Name used with `--host`
    pub name: String,
    /// Hostname or IP, optionally with `:port`
    pub addr: String,
    /// Port, overriding one given in `addr`
    pub port: Option<u16>,
    /// SSH user (defaults to root)
    #[serde(default = "default_user")]
    pub user: String,
    /// Path to SSH private key
    pub ssh_key: Option<PathBuf>,
    /// Environment variable holding a base64-encoded private key
    pub ssh_key_env: Option<String>,
    /// Environment variable holding the SSH password
    pub password_env: Option<String>,
    /// Transport timeouts
    #[serde(default)]
    pub timeouts: Timeouts,
}

fn default_user() -> String {
    "root".to_string()
}

impl HostConfig {
    /// Connection details for this host
    ///
    /// # Errors
    /// Returns error if `addr` is not a valid `host[:port]`
    pub fn connection_info(&self) -> eyre::Result<ConnectionInfo> {
        let info = ConnectionInfo::parse_address(&self.addr, self.user.clone())
            .wrap_err_with(|| format!("host `{}`", self.name))?;
        Ok(match self.port {
            Some(port) => info.with_port(port),
            None => info,
        })
    }

    /// Credential to authenticate with
    ///
    /// A password from `password_env` wins over `ssh_key_env`, which wins
    /// over `ssh_key`.
    ///
    /// # Errors
    /// Returns error if no credential is configured or the password
    /// variable is unset
    pub fn credential(&self) -> eyre::Result<Credential> {
        if let Some(var) = &self.password_env {
            let password = std::env::var(var)
                .wrap_err_with(|| format!("password variable {var} for host `{}`", self.name))?;
            return Ok(Credential::Password(password));
        }
        if let Some(var) = &self.ssh_key_env {
            return Ok(Credential::Key(KeySource::Env(var.clone())));
        }
        if let Some(path) = &self.ssh_key {
            return Ok(Credential::Key(KeySource::Path(expand_home(path))));
        }
        bail!(
            "host `{}` has no ssh_key, ssh_key_env or password_env",
            self.name
        )
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match (path.strip_prefix("~"), dirs::home_dir()) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("reading {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).wrap_err_with(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    /// Load from an explicit path, the default paths, or use defaults
    ///
    /// # Errors
    /// Returns error if a config file exists but cannot be loaded
    pub fn load_default(explicit: Option<&Path>) -> eyre::Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(path) = std::env::var("RUNCMD_CONFIG") {
            return Self::load(Path::new(&path));
        }

        let mut paths = vec![PathBuf::from("runcmd.toml")];
        if let Some(dir) = dirs::config_dir() {
            paths.push(dir.join("runcmd/runcmd.toml"));
        }

        for path in paths {
            if path.exists() {
                return Self::load(&path);
            }
        }

        Ok(Config::default())
    }

    /// Look up a host by name
    ///
    /// # Errors
    /// Returns error if no host has that name
    pub fn find_host(&self, name: &str) -> eyre::Result<&HostConfig> {
        self.host
            .iter()
            .find(|host| host.name == name)
            .ok_or_else(|| eyre!("unknown host `{name}`"))
    }
}
