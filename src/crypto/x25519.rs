//! X25519 key generation for WireGuard peers
//!
//! Produces the same base64 key text `wg genkey | wg pubkey` would.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use super::{KeyPair, KeyProvisioner};
use crate::error::CollaboratorError;

/// Key length for X25519 (both private and public keys are 32 bytes)
pub const KEY_LEN: usize = 32;

/// Generate a new X25519 keypair
///
/// Returns (private_key, public_key)
pub fn generate_keypair() -> ([u8; KEY_LEN], [u8; KEY_LEN]) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret.to_bytes(), public.to_bytes())
}

/// Derive public key from private key
pub fn public_key(private_key: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let secret = StaticSecret::from(*private_key);
    PublicKey::from(&secret).to_bytes()
}

/// Decode a base64 key, checking its length
pub fn decode_key(value: &str) -> Result<[u8; KEY_LEN], String> {
    let bytes = BASE64
        .decode(value.trim())
        .map_err(|e| format!("invalid base64 key: {}", e))?;

    bytes
        .try_into()
        .map_err(|b: Vec<u8>| format!("key must be {} bytes, got {}", KEY_LEN, b.len()))
}

/// Derive the base64 public key for a base64 private key
pub fn public_key_from_base64(private_key: &str) -> Result<String, String> {
    let private = decode_key(private_key)?;
    Ok(BASE64.encode(public_key(&private)))
}

/// Generates keys in-process from the OS random source
#[derive(Debug, Clone, Copy, Default)]
pub struct X25519Provisioner;

impl KeyProvisioner for X25519Provisioner {
    fn generate_keypair(&self) -> Result<KeyPair, CollaboratorError> {
        let (private, public) = generate_keypair();
        Ok(KeyPair {
            private_key: BASE64.encode(private),
            public_key: BASE64.encode(public),
        })
    }
}
