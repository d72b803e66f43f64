//! Traffic counters for provisioned peers
//!
//! Live counters come from the running interface through a [`LiveStateReader`]
//! and are joined to stored records by exact `/32` match on the peer's tunnel
//! address. A record whose `AllowedIPs` on the hub is not the plain `/32` form
//! will not match; subnet containment is not considered.

mod wg_dump;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CollaboratorError;
use crate::store::PeerRecord;

pub use wg_dump::{parse_dump, WgShowReader};

/// One interface as reported by the tunnel runtime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveDevice {
    pub name: String,
    pub peers: Vec<LivePeer>,
}

/// One peer entry of a live interface
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LivePeer {
    pub public_key: String,
    /// CIDR strings as configured on the interface
    pub allowed_ips: Vec<String>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    /// Unix seconds, 0 if the peer never completed a handshake
    pub last_handshake: u64,
}

/// Source of live interface state
pub trait LiveStateReader: Send + Sync {
    fn list_devices(&self) -> Result<Vec<LiveDevice>, CollaboratorError>;
}

/// Counters for one stored peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSample {
    pub user_id: String,
    pub ip: String,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    /// Unix seconds, 0 means never
    pub last_handshake: u64,
}

impl TrafficSample {
    /// Last handshake as `YYYY-MM-DD HH:MM:SS` UTC, empty when never
    pub fn last_handshake_display(&self) -> String {
        if self.last_handshake == 0 {
            return String::new();
        }
        i64::try_from(self.last_handshake)
            .ok()
            .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default()
    }
}

/// Join stored peers with live counters
///
/// Peers without a live entry are left out. When several live entries carry
/// the same `/32`, the first in device order wins.
pub fn correlate(peers: &[PeerRecord], devices: &[LiveDevice]) -> Vec<TrafficSample> {
    peers
        .iter()
        .filter_map(|peer| {
            let host = peer.host_cidr();
            let live = devices
                .iter()
                .flat_map(|d| d.peers.iter())
                .find(|lp| lp.allowed_ips.iter().any(|a| a.trim() == host))?;

            Some(TrafficSample {
                user_id: peer.user_id.clone(),
                ip: peer.ip.to_string(),
                rx_bytes: live.rx_bytes,
                tx_bytes: live.tx_bytes,
                last_handshake: live.last_handshake,
            })
        })
        .collect()
}

/// Human-readable byte count in binary units
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1 << 10;
    const MB: u64 = 1 << 20;
    const GB: u64 = 1 << 30;
    const TB: u64 = 1 << 40;

    let scaled = |unit: u64, suffix: &str| format!("{:.2} {}", bytes as f64 / unit as f64, suffix);
    match bytes {
        b if b >= TB => scaled(TB, "TB"),
        b if b >= GB => scaled(GB, "GB"),
        b if b >= MB => scaled(MB, "MB"),
        b if b >= KB => scaled(KB, "KB"),
        b => format!("{} B", b),
    }
}

/// Table of traffic samples for terminal output
#[derive(Debug, Clone, Default)]
pub struct TrafficReport {
    pub samples: Vec<TrafficSample>,
}

impl TrafficReport {
    pub fn new(samples: Vec<TrafficSample>) -> Self {
        Self { samples }
    }
}

impl fmt::Display for TrafficReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const HEADERS: [&str; 5] = ["USER ID", "IP", "RECEIVED", "SENT", "LAST HANDSHAKE"];

        let rows: Vec<[String; 5]> = self
            .samples
            .iter()
            .map(|s| {
                [
                    s.user_id.clone(),
                    s.ip.clone(),
                    format_bytes(s.rx_bytes),
                    format_bytes(s.tx_bytes),
                    s.last_handshake_display(),
                ]
            })
            .collect();

        let mut widths = HEADERS.map(str::len);
        for row in &rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.len());
            }
        }

        let write_row = |f: &mut fmt::Formatter<'_>, cells: [&str; 5]| -> fmt::Result {
            let line = cells
                .iter()
                .zip(widths)
                .map(|(cell, width)| format!("{:<width$}", cell, width = width))
                .collect::<Vec<_>>()
                .join("  ");
            writeln!(f, "{}", line.trim_end())
        };

        write_row(&mut *f, HEADERS)?;
        for row in &rows {
            write_row(
                &mut *f,
                [
                    row[0].as_str(),
                    row[1].as_str(),
                    row[2].as_str(),
                    row[3].as_str(),
                    row[4].as_str(),
                ],
            )?;
        }
        Ok(())
    }
}
