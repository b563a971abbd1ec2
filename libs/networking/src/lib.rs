//! Link-layer helpers for Wake-on-LAN.
//!
//! This library provides:
//! - Hardware (MAC) address parsing and formatting
//! - Magic packet construction
//! - Conventional Wake-on-LAN ports and broadcast destination

use std::net::Ipv4Addr;
use std::str::FromStr;

use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid hardware address.
    #[error("invalid MAC address: {0}")]
    InvalidMac(String),

    /// Invalid Wake-on-LAN port.
    #[error("invalid wake-on-lan port: {0} (expected 7 or 9)")]
    InvalidWolPort(u16),
}

// ============================================================================
// Hardware addresses
// ============================================================================

/// A 6-octet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// Create from raw octets.
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Get the raw octets.
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for MacAddress {
    type Err = NetworkError;

    /// Parse `aa:bb:cc:dd:ee:ff`, `aa-bb-cc-dd-ee-ff` or `aabbccddeeff`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s.trim().chars().filter(|c| *c != ':' && *c != '-').collect();

        if digits.len() != 12 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(NetworkError::InvalidMac(s.to_string()));
        }

        let mut octets = [0u8; 6];
        for (i, octet) in octets.iter_mut().enumerate() {
            *octet = u8::from_str_radix(&digits[i * 2..i * 2 + 2], 16)
                .map_err(|_| NetworkError::InvalidMac(s.to_string()))?;
        }

        Ok(Self(octets))
    }
}

impl std::fmt::Display for MacAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a, b, c, d, e, g
        )
    }
}

// ============================================================================
// Magic packet
// ============================================================================

/// Default Wake-on-LAN port (discard).
pub const WOL_DEFAULT_PORT: u16 = 9;

/// Alternate Wake-on-LAN port (echo).
pub const WOL_ALTERNATE_PORT: u16 = 7;

/// Limited broadcast address used for magic packets.
pub const WOL_BROADCAST_ADDR: Ipv4Addr = Ipv4Addr::BROADCAST;

/// Number of 0xFF sync bytes at the start of a magic packet.
const SYNC_LEN: usize = 6;

/// Number of times the hardware address is repeated.
const MAC_REPEAT: usize = 16;

/// Total magic packet length.
pub const MAGIC_PACKET_LEN: usize = SYNC_LEN + MAC_REPEAT * 6;

/// A Wake-on-LAN magic packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagicPacket([u8; MAGIC_PACKET_LEN]);

impl MagicPacket {
    /// Build the magic packet for a hardware address.
    pub fn new(mac: MacAddress) -> Self {
        let mut bytes = [0xFFu8; MAGIC_PACKET_LEN];
        for chunk in bytes[SYNC_LEN..].chunks_exact_mut(6) {
            chunk.copy_from_slice(&mac.octets());
        }
        Self(bytes)
    }

    /// Get the packet payload.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Extract the target hardware address if this is a well-formed magic packet.
    pub fn parse(bytes: &[u8]) -> Option<MacAddress> {
        if bytes.len() != MAGIC_PACKET_LEN || bytes[..SYNC_LEN].iter().any(|b| *b != 0xFF) {
            return None;
        }

        let mut octets = [0u8; 6];
        octets.copy_from_slice(&bytes[SYNC_LEN..SYNC_LEN + 6]);

        let repeated = bytes[SYNC_LEN..]
            .chunks_exact(6)
            .all(|chunk| chunk == octets);

        repeated.then_some(MacAddress(octets))
    }
}

/// Validate a Wake-on-LAN port.
pub fn validate_wol_port(port: u16) -> Result<u16, NetworkError> {
    match port {
        WOL_DEFAULT_PORT | WOL_ALTERNATE_PORT => Ok(port),
        other => Err(NetworkError::InvalidWolPort(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_parse_formats() {
        let expected = MacAddress::new([0x00, 0x11, 0x22, 0xaa, 0xbb, 0xcc]);

        assert_eq!("00:11:22:aa:bb:cc".parse::<MacAddress>().unwrap(), expected);
        assert_eq!("00-11-22-AA-BB-CC".parse::<MacAddress>().unwrap(), expected);
        assert_eq!("001122aabbcc".parse::<MacAddress>().unwrap(), expected);
    }

    #[test]
    fn test_mac_parse_rejects_garbage() {
        assert!("00:11:22:aa:bb".parse::<MacAddress>().is_err());
        assert!("00:11:22:aa:bb:cc:dd".parse::<MacAddress>().is_err());
        assert!("zz:11:22:aa:bb:cc".parse::<MacAddress>().is_err());
        assert!("".parse::<MacAddress>().is_err());
    }

    #[test]
    fn test_mac_display() {
        let mac: MacAddress = "AA-BB-CC-DD-EE-0F".parse().unwrap();
        assert_eq!(mac.to_string(), "aa:bb:cc:dd:ee:0f");
    }

    #[test]
    fn test_magic_packet_layout() {
        let mac: MacAddress = "01:23:45:67:89:ab".parse().unwrap();
        let packet = MagicPacket::new(mac);
        let bytes = packet.as_bytes();

        assert_eq!(bytes.len(), 102);
        assert!(bytes[..6].iter().all(|b| *b == 0xFF));
        for chunk in bytes[6..].chunks(6) {
            assert_eq!(chunk, &[0x01, 0x23, 0x45, 0x67, 0x89, 0xab]);
        }
        assert_eq!(MagicPacket::parse(bytes), Some(mac));
    }

    #[test]
    fn test_magic_packet_parse_rejects_corruption() {
        let mac: MacAddress = "01:23:45:67:89:ab".parse().unwrap();
        let mut bytes = MagicPacket::new(mac).as_bytes().to_vec();
        bytes[50] ^= 0x01;
        assert_eq!(MagicPacket::parse(&bytes), None);
        assert_eq!(MagicPacket::parse(&bytes[..96]), None);
    }

    #[test]
    fn test_wol_port_validation() {
        assert!(validate_wol_port(9).is_ok());
        assert!(validate_wol_port(7).is_ok());
        assert!(validate_wol_port(80).is_err());
    }
}
