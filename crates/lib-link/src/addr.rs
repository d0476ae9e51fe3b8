use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const LINK_ADDR_LEN: usize = 8;

/// A fixed-size link-layer address shared by all interfaces of a node. Two
/// neighbors carrying the same address on two radios are the same neighbor.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct LinkAddr([u8; LINK_ADDR_LEN]);

impl LinkAddr {
    /// The null address, used as the receiver of broadcast frames.
    pub const NULL: LinkAddr = LinkAddr([0; LINK_ADDR_LEN]);

    pub const fn new(bytes: [u8; LINK_ADDR_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; LINK_ADDR_LEN] {
        &self.0
    }

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

impl fmt::Display for LinkAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for LinkAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LinkAddrParseError {
    #[error("expected {LINK_ADDR_LEN} colon-separated octets, found {0}")]
    WrongLength(usize),

    #[error("invalid octet '{0}'")]
    InvalidOctet(String),
}

impl FromStr for LinkAddr {
    type Err = LinkAddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != LINK_ADDR_LEN {
            return Err(LinkAddrParseError::WrongLength(parts.len()));
        }
        let mut bytes = [0u8; LINK_ADDR_LEN];
        for (i, part) in parts.iter().enumerate() {
            bytes[i] = u8::from_str_radix(part, 16)
                .map_err(|_| LinkAddrParseError::InvalidOctet(part.to_string()))?;
        }
        Ok(Self(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_display() {
        let addr = LinkAddr::new([0x00, 0x12, 0x4b, 0x00, 0x06, 0x0d, 0x9b, 0x21]);
        let shown = addr.to_string();
        assert_eq!(shown, "00:12:4b:00:06:0d:9b:21");
        assert_eq!(shown.parse::<LinkAddr>().unwrap(), addr);
    }

    #[test]
    fn rejects_malformed_input() {
        assert_eq!(
            "00:11:22".parse::<LinkAddr>(),
            Err(LinkAddrParseError::WrongLength(3))
        );
        assert!(matches!(
            "00:11:22:33:44:55:66:zz".parse::<LinkAddr>(),
            Err(LinkAddrParseError::InvalidOctet(_))
        ));
    }

    #[test]
    fn null_address_is_broadcast() {
        assert!(LinkAddr::NULL.is_null());
        assert!(!LinkAddr::new([1; 8]).is_null());
    }
}
