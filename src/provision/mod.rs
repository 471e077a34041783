//! Proxy asset provisioning.
//!
//! First use of the managed proxy needs two files under
//! `~/.config/slink/bin/`: the proxy binary itself and the geo database it
//! routes by. Both are fetched from a prioritized mirror list; a file that
//! is already present is never re-downloaded.

use crate::config::Settings;
use crate::error::{Error, Result};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

const HTTP_TIMEOUT: Duration = Duration::from_secs(120);

pub const PROXY_BINARY: &str = "mihomo";
pub const GEO_DATABASE: &str = "Country.mmdb";

pub struct Provisioner {
    bin_dir: PathBuf,
    client: reqwest::Client,
}

impl Provisioner {
    pub fn new(bin_dir: PathBuf) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { bin_dir, client })
    }

    pub fn proxy_binary_path(&self) -> PathBuf {
        self.bin_dir.join(PROXY_BINARY)
    }

    pub fn geo_database_path(&self) -> PathBuf {
        self.bin_dir.join(GEO_DATABASE)
    }

    /// Directory the proxy is pointed at for its data files.
    pub fn data_dir(&self) -> &Path {
        &self.bin_dir
    }

    /// Make sure both assets exist, downloading what is missing.
    pub async fn ensure_all(&self, settings: &Settings) -> Result<()> {
        self.ensure(&self.proxy_binary_path(), &settings.binary_mirrors, true)
            .await?;
        self.ensure(&self.geo_database_path(), &settings.geo_mirrors, false)
            .await?;
        Ok(())
    }

    async fn ensure(&self, target: &Path, mirrors: &[String], executable: bool) -> Result<()> {
        if target.exists() {
            return Ok(());
        }
        let asset = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| target.display().to_string());

        std::fs::create_dir_all(&self.bin_dir)?;

        let mut errors = Vec::new();
        for url in mirrors {
            tracing::info!(asset = %asset, url = %url, "fetching asset");
            match self.fetch(url).await {
                Ok(bytes) => {
                    self.install(target, &bytes, executable)?;
                    tracing::info!(asset = %asset, size = bytes.len(), "asset provisioned");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(asset = %asset, url = %url, "mirror failed: {}", e);
                    errors.push(format!("{}: {}", url, e));
                }
            }
        }
        if mirrors.is_empty() {
            errors.push("no mirrors configured".to_string());
        }
        Err(Error::AllProvisionMirrorsFailed { asset, errors })
    }

    async fn fetch(&self, url: &str) -> std::result::Result<Vec<u8>, String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())?;
        let bytes = response.bytes().await.map_err(|e| e.to_string())?;
        if bytes.is_empty() {
            return Err("empty response body".to_string());
        }
        Ok(bytes.to_vec())
    }

    /// Atomic install: a crashed download must never leave a truncated
    /// binary at the final path, or `ensure` would skip it forever after.
    fn install(&self, target: &Path, bytes: &[u8], executable: bool) -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.bin_dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        if executable {
            let mut perms = tmp.as_file().metadata()?.permissions();
            perms.set_mode(0o755);
            tmp.as_file().set_permissions(perms)?;
        }
        tmp.persist(target).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn present_asset_is_not_refetched() {
        let dir = TempDir::new().unwrap();
        let provisioner = Provisioner::new(dir.path().to_path_buf()).unwrap();
        std::fs::write(provisioner.proxy_binary_path(), b"fake-binary").unwrap();

        // No mirrors at all: would fail if a fetch were attempted.
        provisioner
            .ensure(&provisioner.proxy_binary_path(), &[], true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn all_mirrors_failing_is_fatal() {
        let dir = TempDir::new().unwrap();
        let provisioner = Provisioner::new(dir.path().to_path_buf()).unwrap();

        let mirrors = vec![
            "http://127.0.0.1:1/unreachable".to_string(),
            "http://127.0.0.1:1/also-unreachable".to_string(),
        ];
        match provisioner
            .ensure(&provisioner.geo_database_path(), &mirrors, false)
            .await
        {
            Err(Error::AllProvisionMirrorsFailed { asset, errors }) => {
                assert_eq!(asset, GEO_DATABASE);
                assert_eq!(errors.len(), 2);
            }
            other => panic!("expected AllProvisionMirrorsFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn empty_mirror_list_is_fatal() {
        let dir = TempDir::new().unwrap();
        let provisioner = Provisioner::new(dir.path().to_path_buf()).unwrap();
        assert!(matches!(
            provisioner
                .ensure(&provisioner.geo_database_path(), &[], false)
                .await,
            Err(Error::AllProvisionMirrorsFailed { .. })
        ));
    }

    #[test]
    fn install_sets_executable_bit() {
        let dir = TempDir::new().unwrap();
        let provisioner = Provisioner::new(dir.path().to_path_buf()).unwrap();
        let target = dir.path().join("tool");
        provisioner.install(&target, b"#!/bin/sh\n", true).unwrap();
        let mode = std::fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }
}
