//! IPv4 network (CIDR) type.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::de::{self, Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};
use thiserror::Error;

/// Error parsing an IPv4 CIDR literal.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Ipv4NetError {
    #[error("invalid IPv4 CIDR {0:?}: expected <address>/<prefix-length>")]
    MissingPrefix(String),

    #[error("invalid IPv4 address in {0:?}")]
    InvalidAddress(String),

    #[error("invalid prefix length in {0:?}: must be 0-32")]
    InvalidPrefixLen(String),

    #[error("{0:?} has host bits set")]
    HostBitsSet(String),
}

/// An IPv4 network in CIDR notation, e.g. `192.0.2.0/24`.
///
/// The address must be the network address: host bits set is a parse error,
/// matching how route destinations are expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Net {
    addr: Ipv4Addr,
    prefix_len: u8,
}

impl Ipv4Net {
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Result<Self, Ipv4NetError> {
        if prefix_len > 32 {
            return Err(Ipv4NetError::InvalidPrefixLen(format!(
                "{}/{}",
                addr, prefix_len
            )));
        }
        let mask = Self::mask(prefix_len);
        if u32::from(addr) & !mask != 0 {
            return Err(Ipv4NetError::HostBitsSet(format!("{}/{}", addr, prefix_len)));
        }
        Ok(Self { addr, prefix_len })
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    fn mask(prefix_len: u8) -> u32 {
        if prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(prefix_len))
        }
    }
}

impl FromStr for Ipv4Net {
    type Err = Ipv4NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_str, len_str) = s
            .split_once('/')
            .ok_or_else(|| Ipv4NetError::MissingPrefix(s.to_string()))?;
        let addr: Ipv4Addr = addr_str
            .parse()
            .map_err(|_| Ipv4NetError::InvalidAddress(s.to_string()))?;
        let prefix_len: u8 = len_str
            .parse()
            .map_err(|_| Ipv4NetError::InvalidPrefixLen(s.to_string()))?;
        Self::new(addr, prefix_len)
    }
}

impl fmt::Display for Ipv4Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl<'de> Deserialize<'de> for Ipv4Net {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

impl Serialize for Ipv4Net {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}
