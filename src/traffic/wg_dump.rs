//! Live state from `wg show all dump`
//!
//! With `all`, every line starts with the interface name. The first line for
//! an interface describes the interface itself (5 fields), and each following
//! line describes one peer (9 fields):
//!
//! ```text
//! wg0  <private-key>  <public-key>  <listen-port>  <fwmark>
//! wg0  <public-key>  <preshared-key>  <endpoint>  <allowed-ips>  <latest-handshake>  <rx>  <tx>  <keepalive>
//! ```

use std::process::{Command, Stdio};

use super::{LiveDevice, LivePeer, LiveStateReader};
use crate::error::CollaboratorError;

const INTERFACE_FIELDS: usize = 5;
const PEER_FIELDS: usize = 9;

/// Reads interface state by running the `wg` binary
#[derive(Debug, Clone)]
pub struct WgShowReader {
    program: String,
}

impl Default for WgShowReader {
    fn default() -> Self {
        Self::new("wg")
    }
}

impl WgShowReader {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl LiveStateReader for WgShowReader {
    fn list_devices(&self) -> Result<Vec<LiveDevice>, CollaboratorError> {
        let failed = |reason: String| CollaboratorError::LiveState { reason };

        let output = Command::new(&self.program)
            .args(["show", "all", "dump"])
            .stdin(Stdio::null())
            .output()
            .map_err(|e| failed(format!("{} show all dump: {}", self.program, e)))?;

        if !output.status.success() {
            return Err(failed(format!(
                "{} show all dump exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let devices = parse_dump(&String::from_utf8_lossy(&output.stdout))?;
        tracing::debug!("Read {} live interface(s)", devices.len());
        Ok(devices)
    }
}

/// Parse `wg show all dump` output into devices
pub fn parse_dump(dump: &str) -> Result<Vec<LiveDevice>, CollaboratorError> {
    let mut devices: Vec<LiveDevice> = Vec::new();

    for (line_num, line) in dump.lines().enumerate() {
        let line_num = line_num + 1;
        if line.trim().is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split('\t').collect();
        match fields.len() {
            INTERFACE_FIELDS => devices.push(LiveDevice {
                name: fields[0].to_string(),
                peers: Vec::new(),
            }),
            PEER_FIELDS => {
                let peer = LivePeer {
                    public_key: fields[1].to_string(),
                    allowed_ips: parse_allowed_ips(fields[4]),
                    last_handshake: parse_counter(fields[5], "latest-handshake", line_num)?,
                    rx_bytes: parse_counter(fields[6], "transfer-rx", line_num)?,
                    tx_bytes: parse_counter(fields[7], "transfer-tx", line_num)?,
                };

                match devices.last_mut() {
                    Some(device) if device.name == fields[0] => device.peers.push(peer),
                    _ => devices.push(LiveDevice {
                        name: fields[0].to_string(),
                        peers: vec![peer],
                    }),
                }
            }
            n => {
                return Err(CollaboratorError::LiveState {
                    reason: format!("line {}: expected 5 or 9 fields, got {}", line_num, n),
                })
            }
        }
    }

    Ok(devices)
}

fn parse_allowed_ips(field: &str) -> Vec<String> {
    if field == "(none)" {
        return Vec::new();
    }
    field
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_counter(field: &str, name: &str, line_num: usize) -> Result<u64, CollaboratorError> {
    field
        .trim()
        .parse()
        .map_err(|_| CollaboratorError::LiveState {
            reason: format!("line {}: invalid {} value: {}", line_num, name, field),
        })
}
