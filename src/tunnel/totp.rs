//! Time-based one-time codes (RFC 6238) for login hosts that demand
//! interactive verification. The shared seed comes from the user's
//! settings, in the usual base32 form authenticator apps export.

use crate::error::{Error, Result};
use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha1 = Hmac<Sha1>;

const DIGITS: u32 = 6;
const STEP_SECS: u64 = 30;

/// The code for the current 30-second window.
pub fn code_now(seed: &str) -> Result<String> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    code_at(seed, now)
}

/// The code for an arbitrary unix time. Split out so the RFC test vectors
/// can pin the clock.
pub fn code_at(seed: &str, unix_secs: u64) -> Result<String> {
    let key = decode_seed(seed)?;
    let counter = unix_secs / STEP_SECS;

    let mut mac = HmacSha1::new_from_slice(&key)
        .map_err(|e| Error::Config(format!("OTP seed unusable as HMAC key: {}", e)))?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    // Dynamic truncation per RFC 4226 §5.3.
    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = u32::from_be_bytes([
        digest[offset] & 0x7f,
        digest[offset + 1],
        digest[offset + 2],
        digest[offset + 3],
    ]);
    let code = binary % 10u32.pow(DIGITS);
    Ok(format!("{:0width$}", code, width = DIGITS as usize))
}

fn decode_seed(seed: &str) -> Result<Vec<u8>> {
    // Tolerate the cosmetic variations seeds are copied around with:
    // whitespace groups, lowercase, trailing padding.
    let normalized: String = seed
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect();
    let normalized = normalized.trim_end_matches('=');

    BASE32_NOPAD
        .decode(normalized.as_bytes())
        .map_err(|e| Error::Config(format!("OTP seed is not valid base32: {}", e)))
}
