//! WireGuard key material
//!
//! Keys are Curve25519 points, base64-encoded in the canonical 44-character
//! form the `wg` tooling expects. Generation happens locally; private keys
//! never cross the SSH channel.

use base64::{engine::general_purpose::STANDARD, Engine};
use rand::rngs::OsRng;
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::{Error, Result};

/// Encoded length of a base64 Curve25519 key
pub const KEY_B64_LEN: usize = 44;

/// A WireGuard keypair, base64-encoded
#[derive(Debug, Clone)]
pub struct WgKeyPair {
    pub private_key: String,
    pub public_key: String,
}

/// Generate a fresh WireGuard keypair.
///
/// Each call draws new randomness from the OS. Fails only when the OS RNG
/// cannot be read.
pub fn generate() -> Result<WgKeyPair> {
    let mut private_key_bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut private_key_bytes)
        .map_err(|e| Error::KeyGenUnavailable(e.to_string()))?;

    clamp(&mut private_key_bytes);

    let secret = StaticSecret::from(private_key_bytes);
    let public = PublicKey::from(&secret);

    Ok(WgKeyPair {
        private_key: STANDARD.encode(private_key_bytes),
        public_key: STANDARD.encode(public.as_bytes()),
    })
}

/// Derive the base64 public key for an existing base64 private key.
///
/// Used to recover the gateway's identity from its configuration without the
/// private key ever leaving the caller's stack.
pub fn derive_public_key(private_b64: &str) -> Result<String> {
    let bytes = STANDARD
        .decode(private_b64.trim())
        .map_err(|e| Error::InvalidInput(format!("bad private key encoding: {}", e)))?;
    let mut key: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::InvalidInput("private key must be 32 bytes".to_string()))?;

    clamp(&mut key);

    let secret = StaticSecret::from(key);
    let public = PublicKey::from(&secret);
    Ok(STANDARD.encode(public.as_bytes()))
}

/// Check that a string looks like a base64 Curve25519 key
pub fn is_valid_key(key: &str) -> bool {
    key.len() == KEY_B64_LEN
        && STANDARD.decode(key).map(|b| b.len() == 32).unwrap_or(false)
}

// Curve25519 scalar clamping per the WireGuard key format
fn clamp(key: &mut [u8; 32]) {
    key[0] &= 248;
    key[31] &= 127;
    key[31] |= 64;
}
