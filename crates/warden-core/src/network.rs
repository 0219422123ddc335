//! Recognized client networks.
//!
//! Clients outside these prefixes are treated as foreign: their TLS
//! connections are blocked and their plain HTTP requests are tarpitted.

use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// An address prefix such as `10.19.0.0/16`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkPrefix {
    addr: IpAddr,
    len: u8,
}

impl NetworkPrefix {
    /// Creates a prefix, rejecting lengths longer than the address.
    pub fn new(addr: IpAddr, len: u8) -> Result<Self, ConfigError> {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if len > max {
            return Err(ConfigError::Invalid(format!(
                "prefix length {} too long for {}",
                len, addr
            )));
        }
        Ok(Self { addr, len })
    }

    /// True if `ip` lies inside this prefix.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = mask_u32(self.len);
                u32::from(net) & mask == u32::from(*ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = mask_u128(self.len);
                u128::from(net) & mask == u128::from(*ip) & mask
            }
            (IpAddr::V6(_), IpAddr::V4(v4)) => self.contains(&IpAddr::V6(v4.to_ipv6_mapped())),
            (IpAddr::V4(_), IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
                Some(v4) => self.contains(&IpAddr::V4(v4)),
                None => false,
            },
        }
    }
}

fn mask_u32(len: u8) -> u32 {
    if len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(len))
    }
}

fn mask_u128(len: u8) -> u128 {
    if len == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(len))
    }
}

impl FromStr for NetworkPrefix {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (addr, len) = match s.split_once('/') {
            Some((addr, len)) => {
                let len = len
                    .parse::<u8>()
                    .map_err(|_| ConfigError::Invalid(format!("bad prefix length in {}", s)))?;
                (addr, Some(len))
            }
            None => (s, None),
        };
        let addr = addr
            .parse::<IpAddr>()
            .map_err(|_| ConfigError::Invalid(format!("bad network address {}", s)))?;
        let len = len.unwrap_or(match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        });
        Self::new(addr, len)
    }
}

impl std::fmt::Display for NetworkPrefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

impl Serialize for NetworkPrefix {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for NetworkPrefix {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The set of prefixes clients are expected to come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalNetwork {
    prefixes: Vec<NetworkPrefix>,
}

impl LocalNetwork {
    /// Creates a network from prefixes.
    pub fn new(prefixes: Vec<NetworkPrefix>) -> Self {
        Self { prefixes }
    }

    /// Private, loopback and unique-local ranges.
    pub fn private_defaults() -> Self {
        let prefixes = [
            "10.0.0.0/8",
            "172.16.0.0/12",
            "192.168.0.0/16",
            "127.0.0.0/8",
            "::1/128",
            "fd00::/8",
        ]
        .iter()
        .filter_map(|p| p.parse().ok())
        .collect();
        Self { prefixes }
    }

    /// True if the address belongs to a recognized prefix.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.prefixes.iter().any(|p| p.contains(ip))
    }

    /// Parses and checks an address given as text; unparseable is foreign.
    pub fn contains_str(&self, ip: &str) -> bool {
        ip.trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .map(|ip| self.contains(&ip))
            .unwrap_or(false)
    }

    /// Returns the configured prefixes.
    pub fn prefixes(&self) -> &[NetworkPrefix] {
        &self.prefixes
    }
}

impl Default for LocalNetwork {
    fn default() -> Self {
        Self::private_defaults()
    }
}
