//! YAML configuration: listener, auth, sampling and provider toggles.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::hub::{MAX_RATE_MS, MIN_RATE_MS};

/// Top-level configuration for the agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Display theme exposed through `/api/config` ("dark" or "light").
    #[serde(default = "default_theme")]
    pub theme: String,
    /// Serve HTTPS with a self-signed certificate.
    #[serde(default)]
    pub tls: bool,
    /// Take the login rate-limit key from X-Forwarded-For / X-Real-IP.
    /// Only enable behind a reverse proxy that overwrites these headers.
    #[serde(default)]
    pub trust_proxy_headers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            theme: default_theme(),
            tls: false,
            trust_proxy_headers: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// bcrypt hash of the dashboard password. Empty means "generate one".
    #[serde(default)]
    pub password_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Initial broadcast interval; viewers may change it at runtime.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default = "enabled")]
    pub gpu: bool,
    #[serde(default = "enabled")]
    pub thermal: bool,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            gpu: true,
            thermal: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Mount point of the operating-system volume.
    #[serde(default = "default_os_mount")]
    pub os_mount: String,
    /// Mount point of the user data volume.
    #[serde(default = "default_data_mount")]
    pub data_mount: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            os_mount: default_os_mount(),
            data_mount: default_data_mount(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8745
}

fn default_theme() -> String {
    "dark".to_string()
}

fn default_interval_ms() -> u64 {
    1000
}

fn enabled() -> bool {
    true
}

fn default_os_mount() -> String {
    "/".to_string()
}

fn default_data_mount() -> String {
    if cfg!(target_os = "macos") {
        "/System/Volumes/Data".to_string()
    } else {
        "/home".to_string()
    }
}

impl Config {
    /// Load a config file. A missing file is replaced by the defaults, which are
    /// written back so the operator has something to edit.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if !path.exists() {
            let cfg = Config::default();
            cfg.write(path)
                .with_context(|| format!("writing default config to {}", path.display()))?;
            tracing::info!(path = %path.display(), "wrote default config");
            return Ok(cfg);
        }
        Self::load(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            bail!("server.host must not be empty");
        }
        if !matches!(self.server.theme.as_str(), "dark" | "light") {
            bail!("server.theme must be \"dark\" or \"light\"");
        }
        if !(MIN_RATE_MS..=MAX_RATE_MS).contains(&self.sampling.interval_ms) {
            bail!("sampling.interval_ms must be within {MIN_RATE_MS}..={MAX_RATE_MS}");
        }
        if !self.auth.password_hash.is_empty() && !self.auth.password_hash.starts_with("$2") {
            bail!("auth.password_hash is not a bcrypt hash (use --hash-password)");
        }
        Ok(())
    }

    fn write(&self, path: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }
}
