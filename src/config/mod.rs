//! Typed launcher settings and the on-disk layout under `~/.config/slink`.
//!
//! Everything slink persists lives under one directory:
//!
//! ```text
//! ~/.config/slink/
//!   config.json              user settings (this module)
//!   services.json            service registry document (registry module)
//!   services.json.lock       registry lock file
//!   bin/                     provisioned proxy binary + geo database
//!   proxy/                   generated proxy config files
//!   <identifier>/            one directory per submitted job
//!     SLURM_JOB_ID
//!     HOSTNAME
//!     script.sh
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

/// Directory names under the state dir that are not job directories.
const RESERVED_DIRS: &[&str] = &["bin", "proxy"];

/// User settings, persisted as JSON. Every field has an explicit default so
/// a missing or partial config file is always usable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Inclusive TCP port range the allocator draws from.
    pub port_range: (u16, u16),

    /// Scratch directory for port lock files. Deliberately host-local:
    /// port collisions are a per-host concern even when homes are shared.
    pub scratch_dir: PathBuf,

    /// Maximum number of per-job state directories to keep; 0 keeps all.
    pub log_space: usize,

    /// Base32 seed for time-based one-time codes, for clusters whose login
    /// hosts demand interactive verification.
    pub otp_seed: Option<String>,

    /// Login password, same purpose as `otp_seed`.
    pub password: Option<String>,

    /// User-supplied proxy configuration template (YAML). Its port-related
    /// keys are stripped and replaced with the allocated port.
    pub proxy_template: Option<PathBuf>,

    /// Reuse a user-managed proxy on this fixed port instead of spawning
    /// one. Consumer bookkeeping still applies.
    pub custom_port: Option<u16>,

    /// Mirror URLs for the proxy binary, tried in order.
    pub binary_mirrors: Vec<String>,

    /// Mirror URLs for the geo database, tried in order.
    pub geo_mirrors: Vec<String>,

    /// Use `--gpus=` instead of `--gres=gpu:` when requesting GPUs; newer
    /// SLURM deployments prefer the former.
    pub gpus_flag: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port_range: (20000, 30000),
            scratch_dir: PathBuf::from("/tmp/slink"),
            log_space: 0,
            otp_seed: None,
            password: None,
            proxy_template: None,
            custom_port: None,
            binary_mirrors: vec![
                "https://github.com/MetaCubeX/mihomo/releases/latest/download/mihomo-linux-amd64"
                    .to_string(),
                "https://fastly.jsdelivr.net/gh/MetaCubeX/mihomo@release/mihomo-linux-amd64"
                    .to_string(),
            ],
            geo_mirrors: vec![
                "https://github.com/Dreamacro/maxmind-geoip/releases/latest/download/Country.mmdb"
                    .to_string(),
                "https://fastly.jsdelivr.net/gh/Dreamacro/maxmind-geoip@release/Country.mmdb"
                    .to_string(),
            ],
            gpus_flag: false,
        }
    }
}

impl Settings {
    /// The state directory, `~/.config/slink`.
    pub fn state_dir() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;
        Ok(home.join(".config").join("slink"))
    }

    fn config_path() -> Result<PathBuf> {
        Ok(Self::state_dir()?.join("config.json"))
    }

    /// Load settings, falling back to defaults when no config file exists.
    pub fn load() -> Result<Settings> {
        let path = Self::config_path()?;
        match fs::read_to_string(&path) {
            Ok(text) => {
                let settings: Settings = serde_json::from_str(&text).map_err(|e| {
                    Error::Config(format!("Invalid config file {}: {}", path.display(), e))
                })?;
                settings.validate()?;
                Ok(settings)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Settings::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist settings with an atomic temp-file + rename write.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        let dir = Self::state_dir()?;
        fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut tmp, self)?;
        tmp.write_all(b"\n")?;
        tmp.persist(&path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let (low, high) = self.port_range;
        if low == 0 || low > high {
            return Err(Error::Config(format!(
                "port_range [{}, {}] is not a valid range",
                low, high
            )));
        }
        Ok(())
    }

    /// Directory holding per-job state for `identifier`.
    pub fn job_dir(identifier: &str) -> Result<PathBuf> {
        validate_identifier(identifier)?;
        Ok(Self::state_dir()?.join(identifier))
    }

    /// Provisioned binaries live here.
    pub fn bin_dir() -> Result<PathBuf> {
        Ok(Self::state_dir()?.join("bin"))
    }

    /// Generated proxy configs live here.
    pub fn proxy_dir() -> Result<PathBuf> {
        Ok(Self::state_dir()?.join("proxy"))
    }

    /// Remove the oldest job directories beyond `log_space`. Identifiers
    /// are timestamps, so lexicographic order is chronological order.
    pub fn prune_job_dirs(&self) -> Result<usize> {
        if self.log_space == 0 {
            return Ok(0);
        }
        let state_dir = Self::state_dir()?;
        let mut candidates: Vec<PathBuf> = match fs::read_dir(&state_dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .map(is_job_dir_name)
                        .unwrap_or(false)
                })
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        if candidates.len() <= self.log_space {
            return Ok(0);
        }
        candidates.sort();
        let excess = candidates.len() - self.log_space;
        let mut removed = 0;
        for dir in candidates.into_iter().take(excess) {
            match fs::remove_dir_all(&dir) {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!("Failed to prune job dir {}: {}", dir.display(), e),
            }
        }
        Ok(removed)
    }
}

/// A fresh job identifier: the submission timestamp, matching the naming of
/// the per-job state directories.
pub fn new_identifier() -> String {
    chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string()
}

fn is_job_dir_name(name: &str) -> bool {
    !name.starts_with('.')
        && !RESERVED_DIRS.contains(&name)
        && name.chars().next().is_some_and(|c| c.is_ascii_digit())
}

/// Identifiers end up in filesystem paths and job names; keep them tame.
pub fn validate_identifier(identifier: &str) -> Result<()> {
    if identifier.is_empty() {
        return Err(Error::Config("Job identifier cannot be empty".to_string()));
    }
    if !identifier
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(Error::Config(format!(
            "Job identifier '{}' contains invalid characters",
            identifier
        )));
    }
    if identifier.starts_with('.') {
        return Err(Error::Config(format!(
            "Job identifier '{}' cannot start with a dot",
            identifier
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.port_range, (20000, 30000));
        assert!(settings.otp_seed.is_none());
        assert!(!settings.binary_mirrors.is_empty());
    }

    #[test]
    fn partial_config_fills_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"log_space": 5}"#).unwrap();
        assert_eq!(settings.log_space, 5);
        assert_eq!(settings.port_range, (20000, 30000));
    }

    #[test]
    fn rejects_inverted_port_range() {
        let settings: Settings =
            serde_json::from_str(r#"{"port_range": [30000, 20000]}"#).unwrap();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn identifier_validation() {
        validate_identifier("2025-11-03_14-22-01").unwrap();
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("../escape").is_err());
        assert!(validate_identifier("a/b").is_err());
        assert!(validate_identifier(".hidden").is_err());
    }

    #[test]
    fn identifiers_sort_chronologically() {
        let a = "2025-11-03_14-22-01";
        let b = "2025-11-03_14-22-02";
        let c = "2025-12-01_00-00-00";
        assert!(a < b && b < c);
    }

    #[test]
    fn job_dir_name_filter() {
        assert!(is_job_dir_name("2025-11-03_14-22-01"));
        assert!(!is_job_dir_name("bin"));
        assert!(!is_job_dir_name("proxy"));
        assert!(!is_job_dir_name(".hidden"));
    }
}
