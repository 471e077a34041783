//! Dedicated keypair provisioning for the forward tunnel.
//!
//! Compute nodes share the home directory with the login host, so a key
//! generated once and appended to `authorized_keys` lets every job ssh
//! back without prompts. The append is guarded by a file lock: jobs start
//! in bursts, and two concurrent appenders would otherwise interleave or
//! duplicate lines.

use crate::error::{Error, Result};
use crate::lock::FileLock;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

const KEY_FILE: &str = "slink_ed25519";
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

fn ssh_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;
    Ok(home.join(".ssh"))
}

/// Path of the dedicated private key.
pub fn key_path() -> Result<PathBuf> {
    Ok(ssh_dir()?.join(KEY_FILE))
}

/// Generate the dedicated keypair if absent and make sure its public half
/// is authorized for the current account. Idempotent; concurrent callers
/// serialize on a lock beside `authorized_keys`.
pub fn ensure_key_auth() -> Result<()> {
    let dir = ssh_dir()?;
    fs::create_dir_all(&dir)?;
    let key = dir.join(KEY_FILE);

    if !key.exists() {
        generate_keypair(&key)?;
    }

    let pubkey = fs::read_to_string(key.with_extension("pub"))
        .map_err(|e| Error::Tunnel(format!("Failed to read public key: {}", e)))?
        .trim()
        .to_string();

    let authorized = dir.join("authorized_keys");
    let _lock = FileLock::acquire(&dir.join(".authorized_keys.slink.lock"), LOCK_TIMEOUT)?;

    let existing = fs::read_to_string(&authorized).unwrap_or_default();
    if existing.lines().any(|line| line.trim() == pubkey) {
        tracing::debug!("tunnel key already authorized");
        return Ok(());
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o600)
        .open(&authorized)?;
    // Keep the file well-formed even if the previous writer left no
    // trailing newline.
    if !existing.is_empty() && !existing.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    writeln!(file, "{}", pubkey)?;
    tracing::info!("authorized tunnel key for this account");
    Ok(())
}

fn generate_keypair(key: &std::path::Path) -> Result<()> {
    let status = Command::new("ssh-keygen")
        .args(["-q", "-t", "ed25519", "-N", "", "-C", "slink-tunnel"])
        .arg("-f")
        .arg(key)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|source| Error::LaunchFailed {
            command: "ssh-keygen".to_string(),
            source,
        })?;
    if !status.success() {
        return Err(Error::Tunnel(format!(
            "ssh-keygen exited with {} while generating {}",
            status,
            key.display()
        )));
    }
    Ok(())
}
