//! Canonical account addresses
//!
//! The indexer and users hand us addresses in two encodings:
//! - raw: `<workchain>:<64 hex chars>` (e.g. `0:83df...`)
//! - friendly: 48 chars of base64 or base64url wrapping
//!   `[flags][workchain][32-byte hash][crc16]`
//!
//! Both parse into the same [`Address`], whose `Display` is the lowercase raw
//! form. Every map key in the crate is an `Address`, so two spellings of the
//! same account always land on the same entry.

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Friendly-form flag for bounceable addresses
const BOUNCEABLE_TAG: u8 = 0x11;

/// Friendly-form flag for non-bounceable addresses
const NON_BOUNCEABLE_TAG: u8 = 0x51;

/// Bit set on the flag byte for testnet-only addresses
const TESTNET_FLAG: u8 = 0x80;

/// Length of a friendly address once base64 is decoded
const FRIENDLY_BYTES: usize = 36;

/// Length of a friendly address in base64
const FRIENDLY_CHARS: usize = 48;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AddressError {
    #[error("empty address")]
    Empty,

    #[error("invalid workchain in '{0}'")]
    Workchain(String),

    #[error("invalid account hash in '{0}'")]
    Hash(String),

    #[error("invalid friendly address '{0}'")]
    Friendly(String),

    #[error("checksum mismatch in '{0}'")]
    Checksum(String),
}

/// An account on a workchain, identified by its 256-bit hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    workchain: i32,
    hash: [u8; 32],
}

impl Address {
    pub fn new(workchain: i32, hash: [u8; 32]) -> Self {
        Self { workchain, hash }
    }

    pub fn workchain(&self) -> i32 {
        self.workchain
    }

    pub fn hash(&self) -> &[u8; 32] {
        &self.hash
    }

    /// Canonical raw form, the key used everywhere in caches
    pub fn to_raw(&self) -> String {
        format!("{}:{}", self.workchain, hex::encode(self.hash))
    }

    /// User-facing base64url form
    pub fn to_friendly(&self, bounceable: bool, testnet: bool) -> String {
        let mut tag = if bounceable {
            BOUNCEABLE_TAG
        } else {
            NON_BOUNCEABLE_TAG
        };
        if testnet {
            tag |= TESTNET_FLAG;
        }

        let mut bytes = Vec::with_capacity(FRIENDLY_BYTES);
        bytes.push(tag);
        // Friendly encoding only has room for an 8-bit workchain
        bytes.push(self.workchain as i8 as u8);
        bytes.extend_from_slice(&self.hash);
        let crc = crc16(&bytes);
        bytes.extend_from_slice(&crc.to_be_bytes());

        URL_SAFE.encode(bytes)
    }

    /// Short form for console output
    pub fn short(&self) -> String {
        let raw = self.to_raw();
        let split = raw.find(':').map_or(0, |i| i + 1);
        format!("{}…{}", &raw[..split + 6], &raw[raw.len() - 4..])
    }

    fn parse_raw(s: &str) -> Result<Self, AddressError> {
        let (workchain, hash_hex) = s
            .split_once(':')
            .ok_or_else(|| AddressError::Workchain(s.to_string()))?;

        let workchain: i32 = workchain
            .parse()
            .map_err(|_| AddressError::Workchain(s.to_string()))?;

        let bytes = hex::decode(hash_hex).map_err(|_| AddressError::Hash(s.to_string()))?;
        let hash: [u8; 32] = bytes
            .try_into()
            .map_err(|_| AddressError::Hash(s.to_string()))?;

        Ok(Self { workchain, hash })
    }

    fn parse_friendly(s: &str) -> Result<Self, AddressError> {
        if s.len() != FRIENDLY_CHARS {
            return Err(AddressError::Friendly(s.to_string()));
        }

        // Users paste both alphabets; '-'/'_' only occur in base64url
        let bytes = if s.contains(['-', '_']) {
            URL_SAFE.decode(s)
        } else {
            STANDARD.decode(s)
        }
        .map_err(|_| AddressError::Friendly(s.to_string()))?;

        if bytes.len() != FRIENDLY_BYTES {
            return Err(AddressError::Friendly(s.to_string()));
        }

        let tag = bytes[0] & !TESTNET_FLAG;
        if tag != BOUNCEABLE_TAG && tag != NON_BOUNCEABLE_TAG {
            return Err(AddressError::Friendly(s.to_string()));
        }

        let expected = u16::from_be_bytes([bytes[34], bytes[35]]);
        if crc16(&bytes[..34]) != expected {
            return Err(AddressError::Checksum(s.to_string()));
        }

        let workchain = bytes[1] as i8 as i32;
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes[2..34]);

        Ok(Self { workchain, hash })
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AddressError::Empty);
        }

        if s.contains(':') {
            Self::parse_raw(s)
        } else {
            Self::parse_friendly(s)
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_raw())
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_raw()
    }
}

/// Parse any surface encoding into its canonical raw string
pub fn normalize(address: &str) -> Result<String, AddressError> {
    address.parse::<Address>().map(|a| a.to_raw())
}

/// CRC-16/XMODEM as used by the friendly address checksum
fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for byte in data {
        crc ^= (*byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Address {
        let mut hash = [0u8; 32];
        for (i, b) in hash.iter_mut().enumerate() {
            *b = i as u8;
        }
        Address::new(0, hash)
    }

    #[test]
    fn test_crc16_check_value() {
        assert_eq!(crc16(b"123456789"), 0x31c3);
    }

    #[test]
    fn test_zero_address_vectors() {
        let zero = Address::new(0, [0u8; 32]);
        assert_eq!(
            zero.to_friendly(true, false),
            "EQAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAM9c"
        );
        assert_eq!(
            zero.to_friendly(false, false),
            "UQAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAJKZ"
        );
        assert_eq!(
            "EQAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAM9c"
                .parse::<Address>()
                .unwrap(),
            zero
        );
    }

    #[test]
    fn test_friendly_and_raw_normalize_to_same_key() {
        let address = sample();
        let raw = "0:000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";
        let friendly = "EQAAAQIDBAUGBwgJCgsMDQ4PEBESExQVFhcYGRobHB0eHx2j";

        assert_eq!(address.to_raw(), raw);
        assert_eq!(address.to_friendly(true, false), friendly);
        assert_eq!(normalize(friendly).unwrap(), normalize(raw).unwrap());
        assert_eq!(
            normalize(&address.to_friendly(false, true)).unwrap(),
            normalize(raw).unwrap()
        );
    }

    #[test]
    fn test_uppercase_hex_normalizes() {
        let upper = "0:000102030405060708090A0B0C0D0E0F101112131415161718191A1B1C1D1E1F";
        assert_eq!(upper.parse::<Address>().unwrap(), sample());
    }

    #[test]
    fn test_masterchain_address() {
        let address = Address::new(-1, [0xab; 32]);
        assert_eq!(
            address.to_friendly(true, false),
            "Ef-rq6urq6urq6urq6urq6urq6urq6urq6urq6urq6urqzps"
        );
        let parsed: Address = "Ef-rq6urq6urq6urq6urq6urq6urq6urq6urq6urq6urqzps"
            .parse()
            .unwrap();
        assert_eq!(parsed.workchain(), -1);
        assert_eq!(parsed, address);
        assert!(parsed.to_raw().starts_with("-1:abab"));
    }

    #[test]
    fn test_standard_base64_alphabet_accepted() {
        // Same bytes as the masterchain vector, '-' swapped for '+'
        let parsed: Address = "Ef+rq6urq6urq6urq6urq6urq6urq6urq6urq6urq6urqzps"
            .parse()
            .unwrap();
        assert_eq!(parsed, Address::new(-1, [0xab; 32]));
    }

    #[test]
    fn test_checksum_mismatch_rejected() {
        let err = "EQAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAM9d"
            .parse::<Address>()
            .unwrap_err();
        assert!(matches!(err, AddressError::Checksum(_)));
    }

    #[test]
    fn test_malformed_addresses_rejected() {
        assert_eq!("".parse::<Address>().unwrap_err(), AddressError::Empty);
        assert!(matches!(
            "x:00".parse::<Address>().unwrap_err(),
            AddressError::Workchain(_)
        ));
        assert!(matches!(
            "0:abcd".parse::<Address>().unwrap_err(),
            AddressError::Hash(_)
        ));
        assert!(matches!(
            "not-an-address".parse::<Address>().unwrap_err(),
            AddressError::Friendly(_)
        ));
    }

    #[test]
    fn test_serde_uses_raw_form() {
        let address = sample();
        let json = serde_json::to_string(&address).unwrap();
        assert_eq!(
            json,
            "\"0:000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f\""
        );

        let from_friendly: Address =
            serde_json::from_str("\"EQAAAQIDBAUGBwgJCgsMDQ4PEBESExQVFhcYGRobHB0eHx2j\"").unwrap();
        assert_eq!(from_friendly, address);
    }
}
