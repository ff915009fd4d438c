//! Service configuration, read from the TOML file passed as `--config`.
//!
//! The same file is handed to the `serv` subprocess, so both sides of the
//! exec contract agree on the data directory and the key registry.

use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("failed to read config file {path:?}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("failed to parse config file {path:?}")]
  Parse {
    path: PathBuf,
    #[source]
    source: toml::de::Error,
  },
  #[error("failed to locate the running executable")]
  CurrentExe(#[source] std::io::Error),
}

/// Everything the SSH front-end and `serv` read from the configuration file,
/// plus the two paths that are only known at runtime.
#[derive(Debug, Clone)]
pub struct Settings {
  /// Name used in messages shown to SSH clients.
  pub app_name: String,
  /// The service binary, re-executed as `serv` for every Git command.
  pub app_path: PathBuf,
  /// The configuration file these settings were loaded from.
  pub custom_conf: PathBuf,
  /// Root of persistent state; host keys live in `<app_data_path>/ssh`.
  pub app_data_path: PathBuf,
  /// Bare repositories live in `<repo_root_path>/<owner>/<repo>.git`.
  pub repo_root_path: PathBuf,
  pub ssh: SshSettings,
  pub public_keys: Vec<PublicKeyRecord>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SshSettings {
  pub listen_host: String,
  pub listen_port: u16,
  /// Username clients must connect as. Empty accepts any username.
  pub builtin_server_user: String,
  pub ciphers: Vec<String>,
  pub key_exchanges: Vec<String>,
  pub macs: Vec<String>,
  /// Drop connections idle for this long. `0` never does.
  pub inactivity_timeout_secs: u64,
}

impl Default for SshSettings {
  fn default() -> Self {
    Self {
      listen_host: "0.0.0.0".to_owned(),
      listen_port: 2222,
      builtin_server_user: "git".to_owned(),
      ciphers: Vec::new(),
      key_exchanges: Vec::new(),
      macs: Vec::new(),
      inactivity_timeout_secs: 0,
    }
  }
}

/// A registered public key, as the application's key table would hold it.
#[derive(Debug, Clone, Deserialize)]
pub struct PublicKeyRecord {
  pub id: i64,
  /// User owning the key. Owners may push to their own repositories.
  pub owner: String,
  /// An `authorized_keys` line; a trailing comment is allowed.
  pub content: String,
}

#[derive(Deserialize)]
struct SettingsFile {
  #[serde(default = "default_app_name")]
  app_name: String,
  #[serde(default = "default_app_data_path")]
  app_data_path: PathBuf,
  repo_root_path: Option<PathBuf>,
  #[serde(default)]
  ssh: SshSettings,
  #[serde(default)]
  public_keys: Vec<PublicKeyRecord>,
}

fn default_app_name() -> String {
  "Gitea".to_owned()
}

fn default_app_data_path() -> PathBuf {
  PathBuf::from("data")
}

impl Settings {
  /// Load settings from `path`. `app_path` is the running executable.
  pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let app_path = std::env::current_exe().map_err(ConfigError::CurrentExe)?;
    Self::load_with_app_path(path, app_path)
  }

  pub fn load_with_app_path(path: impl AsRef<Path>, app_path: PathBuf) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_owned(),
      source,
    })?;
    Self::from_toml(&text, path, app_path)
  }

  /// Parse `text` as if it had been read from `path`. Relative data paths are
  /// resolved against the directory containing `path`.
  pub fn from_toml(text: &str, path: &Path, app_path: PathBuf) -> Result<Self, ConfigError> {
    let file: SettingsFile = toml::from_str(text).map_err(|source| ConfigError::Parse {
      path: path.to_owned(),
      source,
    })?;

    let base = path.parent().unwrap_or_else(|| Path::new(""));
    let app_data_path = base.join(file.app_data_path);
    let repo_root_path = match file.repo_root_path {
      Some(p) => base.join(p),
      None => app_data_path.join("repositories"),
    };

    Ok(Self {
      app_name: file.app_name,
      app_path,
      custom_conf: path.to_owned(),
      app_data_path,
      repo_root_path,
      ssh: file.ssh,
      public_keys: file.public_keys,
    })
  }

  /// Directory holding the host keys.
  pub fn ssh_dir(&self) -> PathBuf {
    self.app_data_path.join("ssh")
  }

  pub fn listen_addr(&self) -> String {
    format!("{}:{}", self.ssh.listen_host, self.ssh.listen_port)
  }
}
