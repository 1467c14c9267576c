use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// 48-bit hardware address. NIC identity throughout the agent.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr([u8; 6]);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MacParseError {
    #[error("expected 6 colon-separated octets, got {0}")]
    OctetCount(usize),
    #[error("invalid octet {0:?}")]
    Octet(String),
}

impl MacAddr {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = MacParseError;

    // sysinfo does not zero-pad octets, so "90:b8:d0:4:3:f1" must parse.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut count = 0;
        for part in s.split(':') {
            if count == 6 {
                return Err(MacParseError::OctetCount(s.split(':').count()));
            }
            if part.is_empty() || part.len() > 2 {
                return Err(MacParseError::Octet(part.to_string()));
            }
            octets[count] = u8::from_str_radix(part, 16)
                .map_err(|_| MacParseError::Octet(part.to_string()))?;
            count += 1;
        }
        if count != 6 {
            return Err(MacParseError::OctetCount(count));
        }
        Ok(Self(octets))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_padded_and_unpadded() {
        let a: MacAddr = "aa:bb:cc:11:22:33".parse().unwrap();
        assert_eq!(a.to_string(), "aa:bb:cc:11:22:33");

        let b: MacAddr = "90:b8:d0:4:3:f1".parse().unwrap();
        assert_eq!(b.to_string(), "90:b8:d0:04:03:f1");
    }

    #[test]
    fn rejects_malformed() {
        assert!("aa:bb:cc:11:22".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:11:22:33:44".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:11:22:zz".parse::<MacAddr>().is_err());
        assert!("aabbcc112233".parse::<MacAddr>().is_err());
    }

    #[test]
    fn serde_round_trip() {
        let mac: MacAddr = "0a:0b:0c:0d:0e:0f".parse().unwrap();
        let json = serde_json::to_string(&mac).unwrap();
        assert_eq!(json, "\"0a:0b:0c:0d:0e:0f\"");
        let back: MacAddr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mac);
    }
}
