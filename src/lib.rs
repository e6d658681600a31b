//! Burstgen — multi-threaded UDP/ICMP traffic generator and responder.
//!
//! Builds synthetic UDP or ICMP echo packets, transmits them in paced bursts
//! from CPU-pinned worker threads across one or more interfaces, classifies
//! what comes back and aggregates per-worker counters into periodic rate
//! reports. Usable as a library or via the CLI.

pub mod checksum;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod packet;
pub mod pktio;
pub mod stats;
pub mod timer;
pub mod worker;

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::str::FromStr;

// Re-export key types for library users.
pub use config::{ConfigError, GeneratorConfig, RunPlan};
pub use coordinator::{run, GenError, GracefulStop, RunReport};
pub use pktio::loopback::{LoopbackBackend, LoopbackOptions, Responder};
pub use pktio::{PacketPool, PktioBackend};
pub use stats::StatsLine;

// ─────────────────────────────────────────────────────────────────────────────
// Mode
// ─────────────────────────────────────────────────────────────────────────────

/// What the workers do for the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Every worker transmits UDP bursts.
    #[default]
    SendUdp,
    /// One worker sends ICMP echo requests, one receives replies.
    Ping,
    /// Every worker receives and classifies.
    Receive,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendUdp => "send-udp",
            Self::Ping => "ping",
            Self::Receive => "receive",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Addressing
// ─────────────────────────────────────────────────────────────────────────────

/// 48-bit Ethernet address, written as `aa:bb:cc:dd:ee:ff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for MacAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.trim().split(':');
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| format!("invalid MAC address '{s}': expected 6 octets"))?;
            if part.is_empty() || part.len() > 2 {
                return Err(format!("invalid MAC address '{s}': bad octet '{part}'"));
            }
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| format!("invalid MAC address '{s}': bad octet '{part}'"))?;
        }
        if parts.next().is_some() {
            return Err(format!("invalid MAC address '{s}': expected 6 octets"));
        }
        Ok(Self(octets))
    }
}

impl TryFrom<String> for MacAddr {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MacAddr> for String {
    fn from(mac: MacAddr) -> Self {
        mac.to_string()
    }
}

impl std::fmt::Display for MacAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let m = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

/// Endpoint addressing shared read-only by every transmit worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressConfig {
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl Default for AddressConfig {
    fn default() -> Self {
        Self {
            src_mac: MacAddr::default(),
            dst_mac: MacAddr::default(),
            src_ip: Ipv4Addr::UNSPECIFIED,
            dst_ip: Ipv4Addr::UNSPECIFIED,
            src_port: 0,
            dst_port: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_parse_and_display() {
        let mac: MacAddr = "02:1A:ff:00:9:10".parse().unwrap();
        assert_eq!(mac.octets(), [0x02, 0x1a, 0xff, 0x00, 0x09, 0x10]);
        assert_eq!(mac.to_string(), "02:1a:ff:00:09:10");
    }

    #[test]
    fn test_mac_parse_rejects_malformed() {
        let malformed = [
            "",
            "02:00:00:00:00",
            "02:00:00:00:00:00:00",
            "02:00:00:00:00:zz",
            "002:00:00:00:00:00",
        ];
        for bad in malformed {
            assert!(bad.parse::<MacAddr>().is_err(), "'{bad}' must be rejected");
        }
    }

    #[test]
    fn test_mac_serde_as_string() {
        let mac = MacAddr::new([0xde, 0xad, 0xbe, 0xef, 0, 1]);
        let json = serde_json::to_string(&mac).unwrap();
        assert_eq!(json, "\"de:ad:be:ef:00:01\"");
        let back: MacAddr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mac);
    }

    #[test]
    fn test_mode_serde_kebab_case() {
        assert_eq!(serde_json::to_string(&Mode::SendUdp).unwrap(), "\"send-udp\"");
        assert_eq!(Mode::Ping.to_string(), "ping");
    }
}
