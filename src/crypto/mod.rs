//! Key material for provisioned peers
//!
//! Peers get a fresh WireGuard key pair when they are created. Where the keys
//! come from is pluggable:
//! - In-process X25519 generation (x25519), the default
//! - The `wg genkey` / `wg pubkey` tools (wg_tool)

pub mod wg_tool;
pub mod x25519;

use std::fmt;

use crate::error::CollaboratorError;

pub use wg_tool::WgToolProvisioner;
pub use x25519::X25519Provisioner;

/// A base64-encoded WireGuard key pair
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    pub private_key: String,
    pub public_key: String,
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key)
            .finish()
    }
}

/// Source of fresh key pairs
pub trait KeyProvisioner: Send + Sync {
    fn generate_keypair(&self) -> Result<KeyPair, CollaboratorError>;
}
