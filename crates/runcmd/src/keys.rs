//! SSH credential and key resolution

use std::env;
use std::fmt;
use std::path::{Path, PathBuf};

use russh::keys::{PrivateKey, decode_secret_key, load_secret_key};
use tracing::debug;

use crate::error::RunError;

/// How a remote runner authenticates
#[derive(Clone)]
pub enum Credential {
    /// Password authentication
    Password(String),
    /// Public key authentication
    Key(KeySource),
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Password(..)"),
            Credential::Key(source) => f.debug_tuple("Key").field(source).finish(),
        }
    }
}

/// Where private key material comes from
#[derive(Clone)]
pub enum KeySource {
    /// Explicit path to key file
    Path(PathBuf),
    /// PEM/OpenSSH key text held in memory
    Raw(String),
    /// Base64-encoded key from environment
    Env(String),
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySource::Path(path) => f.debug_tuple("Path").field(path).finish(),
            KeySource::Raw(_) => f.write_str("Raw(..)"),
            KeySource::Env(var) => f.debug_tuple("Env").field(var).finish(),
        }
    }
}

impl KeySource {
    /// Load and parse the private key
    ///
    /// # Errors
    /// Returns `KeyError` if the key cannot be found, read or parsed
    pub fn load(&self) -> Result<PrivateKey, KeyError> {
        match self {
            KeySource::Path(path) => {
                if !path.exists() {
                    return Err(KeyError::NotFound(path.display().to_string()));
                }
                validate_key_permissions(path)?;
                debug!(path = %path.display(), "loading SSH key");
                load_secret_key(path, None).map_err(|e| KeyError::Parse(e.to_string()))
            }
            KeySource::Raw(pem) => {
                decode_secret_key(pem, None).map_err(|e| KeyError::Parse(e.to_string()))
            }
            KeySource::Env(var_name) => {
                let base64_key =
                    env::var(var_name).map_err(|_| KeyError::EnvNotSet(var_name.clone()))?;
                let key_data = base64_decode(&base64_key).map_err(|_| KeyError::InvalidBase64)?;
                let pem = String::from_utf8(key_data).map_err(|_| KeyError::InvalidBase64)?;
                debug!(var = %var_name, "loading SSH key from environment");
                decode_secret_key(&pem, None).map_err(|e| KeyError::Parse(e.to_string()))
            }
        }
    }
}

/// Credential with key material loaded
pub(crate) enum ResolvedCredential {
    Password(String),
    Key(PrivateKey),
}

impl Credential {
    pub(crate) fn resolve(&self) -> Result<ResolvedCredential, KeyError> {
        match self {
            Credential::Password(password) => Ok(ResolvedCredential::Password(password.clone())),
            Credential::Key(source) => source.load().map(ResolvedCredential::Key),
        }
    }
}

/// Key resolution errors
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("environment variable {0} not set")]
    EnvNotSet(String),

    #[error("invalid base64 encoding")]
    InvalidBase64,

    #[error("key file permissions too open: {0} (should be 600)")]
    BadPermissions(String),

    #[error("key file not found: {0}")]
    NotFound(String),

    #[error("can't parse key: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<KeyError> for RunError {
    fn from(err: KeyError) -> Self {
        RunError::SshKeyError(err.to_string())
    }
}

fn base64_decode(input: &str) -> Result<Vec<u8>, base64::DecodeError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.decode(input.trim())
}

#[cfg(unix)]
fn validate_key_permissions(path: &Path) -> Result<(), KeyError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = std::fs::metadata(path)?.permissions().mode();

    // Group and other bits must be clear
    if mode & 0o77 != 0 {
        return Err(KeyError::BadPermissions(path.display().to_string()));
    }

    Ok(())
}

#[cfg(not(unix))]
fn validate_key_permissions(_path: &Path) -> Result<(), KeyError> {
    Ok(())
}
