//! WireGuard key material
//!
//! Key generation for provisioning and validation of client-reported keys.
//! Uses x25519-dalek for the base-point multiplication.

use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine};

/// WireGuard key pair, base64-encoded
#[derive(Debug, Clone)]
pub struct WgKeyPair {
    pub private_key: String,
    pub public_key: String,
}

/// Generate a WireGuard keypair using x25519
pub fn generate_keypair() -> WgKeyPair {
    use rand::RngCore;

    let mut private_key_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut private_key_bytes);

    // WireGuard key clamping
    private_key_bytes[0] &= 248;
    private_key_bytes[31] &= 127;
    private_key_bytes[31] |= 64;

    use x25519_dalek::{PublicKey, StaticSecret};

    let secret = StaticSecret::from(private_key_bytes);
    let public = PublicKey::from(&secret);

    WgKeyPair {
        private_key: STANDARD.encode(private_key_bytes),
        public_key: STANDARD.encode(public.as_bytes()),
    }
}

/// Validate that a string is a plausible WireGuard public key
/// (base64-encoded 32 bytes).
pub fn validate_public_key(key: &str) -> Result<()> {
    let bytes = STANDARD
        .decode(key)
        .map_err(|e| Error::Key(format!("invalid base64: {}", e)))?;
    if bytes.len() != 32 {
        return Err(Error::Key(format!(
            "expected 32 key bytes, got {}",
            bytes.len()
        )));
    }
    Ok(())
}
