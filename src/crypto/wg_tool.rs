//! Key generation through wireguard-tools
//!
//! Runs `wg genkey`, then pipes the private key into `wg pubkey`.

use std::io::Write;
use std::process::{Command, Stdio};

use super::{KeyPair, KeyProvisioner};
use crate::error::CollaboratorError;

/// Shells out to the `wg` binary for every key pair
#[derive(Debug, Clone)]
pub struct WgToolProvisioner {
    program: String,
}

impl Default for WgToolProvisioner {
    fn default() -> Self {
        Self::new("wg")
    }
}

impl WgToolProvisioner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(&self, subcommand: &str, stdin: Option<&str>) -> Result<String, CollaboratorError> {
        let failed = |reason: String| CollaboratorError::KeyGeneration { reason };

        let mut child = Command::new(&self.program)
            .arg(subcommand)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| failed(format!("{} {}: {}", self.program, subcommand, e)))?;

        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input.as_bytes())
                    .map_err(|e| failed(format!("{} {}: {}", self.program, subcommand, e)))?;
            }
        }

        let output = child
            .wait_with_output()
            .map_err(|e| failed(format!("{} {}: {}", self.program, subcommand, e)))?;

        if !output.status.success() {
            return Err(failed(format!(
                "{} {} exited with {}: {}",
                self.program,
                subcommand,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let key = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if key.is_empty() {
            return Err(failed(format!(
                "{} {} produced no output",
                self.program, subcommand
            )));
        }
        Ok(key)
    }
}

impl KeyProvisioner for WgToolProvisioner {
    fn generate_keypair(&self) -> Result<KeyPair, CollaboratorError> {
        let private_key = self.run("genkey", None)?;
        let public_key = self.run("pubkey", Some(&private_key))?;
        Ok(KeyPair {
            private_key,
            public_key,
        })
    }
}
