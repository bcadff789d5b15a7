//! DHCP option codes and the typed string codec for administered options.
//!
//! The management API and the persisted snapshot carry option values as human
//! strings (`"255.255.255.0"`, `"1500"`, `"0xdeadbeef"`). Each option code
//! belongs to one [`OptionFamily`] that fixes how its string form maps to the
//! raw bytes sent on the wire. Values are validated at admission: a code with
//! no family, or a string that does not parse for its family, is rejected.

use std::net::Ipv4Addr;

use crate::error::{Error, Result};

pub const OPT_SUBNET_MASK: u8 = 1;
pub const OPT_REQUESTED_IP: u8 = 50;
pub const OPT_LEASE_TIME: u8 = 51;
pub const OPT_MESSAGE_TYPE: u8 = 53;
pub const OPT_SERVER_IDENTIFIER: u8 = 54;
pub const OPT_RENEWAL_TIME: u8 = 58;
pub const OPT_REBINDING_TIME: u8 = 59;
pub const OPT_CLIENT_IDENTIFIER: u8 = 61;
pub const OPT_BOOTFILE_NAME: u8 = 67;
pub const OPT_USER_CLASS: u8 = 77;

/// User-class payload that selects the bootstrap image over the iPXE loader.
pub const IPXE_USER_CLASS: &[u8] = b"iPXE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            8 => Ok(Self::Inform),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discover => write!(f, "DISCOVER"),
            Self::Offer => write!(f, "OFFER"),
            Self::Request => write!(f, "REQUEST"),
            Self::Decline => write!(f, "DECLINE"),
            Self::Ack => write!(f, "ACK"),
            Self::Nak => write!(f, "NAK"),
            Self::Release => write!(f, "RELEASE"),
            Self::Inform => write!(f, "INFORM"),
        }
    }
}

/// Wire encoding family of an administrable option code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionFamily {
    /// Single IPv4 address, dotted-quad.
    Ip,
    /// One or more IPv4 addresses, comma-separated.
    IpList,
    /// Unsigned decimal, one byte.
    U8,
    /// Unsigned decimal, two bytes big-endian.
    U16,
    /// Unsigned decimal, four bytes big-endian.
    U32,
    /// Boolean flag, `0`/`1`/`true`/`false`, one byte.
    Flag,
    /// Text, passed through as UTF-8 bytes.
    Str,
    /// Opaque payload, `0x`-prefixed hex.
    Hex,
}

/// Encoding family for `code`, or `None` for codes this server refuses to
/// administer (including 0 and 255, which are wire framing, not options).
pub fn family(code: u8) -> Option<OptionFamily> {
    use OptionFamily::*;

    Some(match code {
        1 | 16 | 28 | 32 | 50 | 54 => Ip,
        3..=11 | 41 | 42 | 44 | 45 | 48 | 49 | 65 | 69..=76 => IpList,
        23 | 37 | 46 | 52 | 53 => U8,
        13 | 22 | 26 | 57 => U16,
        2 | 24 | 35 | 38 | 51 | 58 | 59 => U32,
        19 | 20 | 27 | 29 | 30 | 31 | 34 | 36 | 39 => Flag,
        12 | 14 | 15 | 17 | 18 | 40 | 47 | 56 | 60 | 62 | 64 | 66 | 67 | 77 => Str,
        43 | 61 | 82 => Hex,
        _ => return None,
    })
}

/// Encodes a human string into the wire bytes for `code`.
pub fn encode_value(code: u8, value: &str) -> Result<Vec<u8>> {
    let family = family(code)
        .ok_or_else(|| Error::Validation(format!("unknown option code {}", code)))?;
    let bad = |reason: &str| {
        Error::Validation(format!("option {}: invalid value {:?} ({})", code, value, reason))
    };

    match family {
        OptionFamily::Ip => {
            let ip: Ipv4Addr = value.parse().map_err(|_| bad("expected dotted-quad"))?;
            Ok(ip.octets().to_vec())
        }
        OptionFamily::IpList => {
            let mut bytes = Vec::new();
            for part in value.split(',') {
                let ip: Ipv4Addr = part
                    .trim()
                    .parse()
                    .map_err(|_| bad("expected comma-separated dotted-quads"))?;
                bytes.extend_from_slice(&ip.octets());
            }
            if bytes.is_empty() {
                return Err(bad("expected at least one address"));
            }
            Ok(bytes)
        }
        OptionFamily::U8 => {
            let n: u8 = value.parse().map_err(|_| bad("expected 0..=255"))?;
            Ok(vec![n])
        }
        OptionFamily::U16 => {
            let n: u16 = value.parse().map_err(|_| bad("expected 0..=65535"))?;
            Ok(n.to_be_bytes().to_vec())
        }
        OptionFamily::U32 => {
            let n: u32 = value.parse().map_err(|_| bad("expected a 32-bit decimal"))?;
            Ok(n.to_be_bytes().to_vec())
        }
        OptionFamily::Flag => match value {
            "1" | "true" => Ok(vec![1]),
            "0" | "false" => Ok(vec![0]),
            _ => Err(bad("expected 0/1/true/false")),
        },
        OptionFamily::Str => {
            if value.is_empty() {
                return Err(bad("expected non-empty text"));
            }
            Ok(value.as_bytes().to_vec())
        }
        OptionFamily::Hex => {
            let digits = value
                .strip_prefix("0x")
                .or_else(|| value.strip_prefix("0X"))
                .ok_or_else(|| bad("expected 0x-prefixed hex"))?;
            if digits.is_empty() || digits.len() % 2 != 0 {
                return Err(bad("expected an even number of hex digits"));
            }
            let mut bytes = Vec::with_capacity(digits.len() / 2);
            for chunk in digits.as_bytes().chunks_exact(2) {
                let pair = std::str::from_utf8(chunk).map_err(|_| bad("non-ASCII hex"))?;
                bytes.push(u8::from_str_radix(pair, 16).map_err(|_| bad("non-hex digit"))?);
            }
            Ok(bytes)
        }
    }
}

/// Decodes wire bytes back into the human string form; exact inverse of
/// [`encode_value`] for values that were admitted through it. Bytes that do
/// not fit the family (e.g. loaded from an old snapshot) fall back to hex so
/// nothing is silently lost.
pub fn decode_value(code: u8, data: &[u8]) -> String {
    let to_hex = |data: &[u8]| {
        let mut out = String::with_capacity(2 + data.len() * 2);
        out.push_str("0x");
        for byte in data {
            out.push_str(&format!("{:02x}", byte));
        }
        out
    };

    match family(code) {
        Some(OptionFamily::Ip) if data.len() == 4 => {
            Ipv4Addr::new(data[0], data[1], data[2], data[3]).to_string()
        }
        Some(OptionFamily::IpList) if !data.is_empty() && data.len() % 4 == 0 => data
            .chunks_exact(4)
            .map(|c| Ipv4Addr::new(c[0], c[1], c[2], c[3]).to_string())
            .collect::<Vec<_>>()
            .join(","),
        Some(OptionFamily::U8) if data.len() == 1 => data[0].to_string(),
        Some(OptionFamily::U16) if data.len() == 2 => {
            u16::from_be_bytes([data[0], data[1]]).to_string()
        }
        Some(OptionFamily::U32) if data.len() == 4 => {
            u32::from_be_bytes([data[0], data[1], data[2], data[3]]).to_string()
        }
        Some(OptionFamily::Flag) if data.len() == 1 => {
            if data[0] == 0 { "0" } else { "1" }.to_string()
        }
        Some(OptionFamily::Str) => match std::str::from_utf8(data) {
            Ok(text) => text.to_string(),
            Err(_) => to_hex(data),
        },
        _ => to_hex(data),
    }
}
