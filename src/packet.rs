use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::options::{self, MessageType};

const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
const FIXED_HEADER_LEN: usize = 240;
/// BOOTP minimum frame length; shorter replies are zero-padded up to this.
const MIN_FRAME_LEN: usize = 300;
const MAX_HOPS: u8 = 16;

pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;
pub const HTYPE_ETHERNET: u8 = 1;
pub const HLEN_ETHERNET: u8 = 6;

/// One option as it appears on the wire. Replies are composed from merged
/// code→bytes maps, so options stay raw instead of a closed enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawOption {
    pub code: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct DhcpPacket {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub sname: [u8; 64],
    pub file: [u8; 128],
    pub options: Vec<RawOption>,
}

fn be_u16(data: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([data[at], data[at + 1]])
}

fn be_u32(data: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn ipv4(data: &[u8], at: usize) -> Ipv4Addr {
    Ipv4Addr::new(data[at], data[at + 1], data[at + 2], data[at + 3])
}

/// Walks the variable option region: pads are skipped, the end marker stops
/// the walk, and a declared length running past the buffer is an error.
fn parse_options(mut data: &[u8]) -> Result<Vec<RawOption>> {
    let mut parsed = Vec::new();

    loop {
        match data {
            [] | [255, ..] => break,
            [0, rest @ ..] => data = rest,
            [code, len, rest @ ..] => {
                let len = *len as usize;
                if rest.len() < len {
                    return Err(Error::InvalidPacket(format!(
                        "option {} runs past the end of the packet",
                        code
                    )));
                }
                parsed.push(RawOption {
                    code: *code,
                    data: rest[..len].to_vec(),
                });
                data = &rest[len..];
            }
            [code] => {
                return Err(Error::InvalidPacket(format!(
                    "option {} is missing its length",
                    code
                )));
            }
        }
    }

    Ok(parsed)
}

impl DhcpPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < FIXED_HEADER_LEN {
            return Err(Error::InvalidPacket(format!(
                "{} bytes is shorter than the {}-byte BOOTP header",
                data.len(),
                FIXED_HEADER_LEN
            )));
        }
        if data[236..240] != MAGIC_COOKIE {
            return Err(Error::InvalidPacket("Missing DHCP magic cookie".to_string()));
        }
        if data[3] > MAX_HOPS {
            return Err(Error::InvalidPacket(format!(
                "Excessive hop count: {}",
                data[3]
            )));
        }

        let mut packet = Self {
            op: data[0],
            htype: data[1],
            hlen: data[2],
            hops: data[3],
            xid: be_u32(data, 4),
            secs: be_u16(data, 8),
            flags: be_u16(data, 10),
            ciaddr: ipv4(data, 12),
            yiaddr: ipv4(data, 16),
            siaddr: ipv4(data, 20),
            giaddr: ipv4(data, 24),
            chaddr: [0u8; 16],
            sname: [0u8; 64],
            file: [0u8; 128],
            options: Vec::new(),
        };
        packet.chaddr.copy_from_slice(&data[28..44]);
        packet.sname.copy_from_slice(&data[44..108]);
        packet.file.copy_from_slice(&data[108..236]);
        packet.options = parse_options(&data[FIXED_HEADER_LEN..])?;

        Ok(packet)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MIN_FRAME_LEN);

        out.extend_from_slice(&[self.op, self.htype, self.hlen, self.hops]);
        out.extend_from_slice(&self.xid.to_be_bytes());
        out.extend_from_slice(&self.secs.to_be_bytes());
        out.extend_from_slice(&self.flags.to_be_bytes());
        for addr in [self.ciaddr, self.yiaddr, self.siaddr, self.giaddr] {
            out.extend_from_slice(&addr.octets());
        }
        out.extend_from_slice(&self.chaddr);
        out.extend_from_slice(&self.sname);
        out.extend_from_slice(&self.file);
        out.extend_from_slice(&MAGIC_COOKIE);

        for option in &self.options {
            out.push(option.code);
            out.push(option.data.len() as u8);
            out.extend_from_slice(&option.data);
        }
        out.push(255);

        out.resize(out.len().max(MIN_FRAME_LEN), 0);
        out
    }

    /// First occurrence of `code`, if any.
    pub fn option(&self, code: u8) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|option| option.code == code)
            .map(|option| option.data.as_slice())
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.option(options::OPT_MESSAGE_TYPE)
            .filter(|data| data.len() == 1)
            .and_then(|data| MessageType::try_from(data[0]).ok())
    }

    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.option(options::OPT_REQUESTED_IP)
            .filter(|data| data.len() == 4)
            .map(|data| ipv4(data, 0))
    }

    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        self.option(options::OPT_SERVER_IDENTIFIER)
            .filter(|data| data.len() == 4)
            .map(|data| ipv4(data, 0))
    }

    pub fn user_class(&self) -> Option<&[u8]> {
        self.option(options::OPT_USER_CLASS)
    }

    /// Client hardware address in canonical form: lowercase hex, colons.
    /// Every lease and binding table is keyed by this form.
    pub fn mac_address(&self) -> String {
        let mac = &self.chaddr[..6];
        format!(
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
        )
    }

    pub fn is_broadcast(&self) -> bool {
        (self.flags & 0x8000) != 0
    }

    /// Reply skeleton echoing the request's transaction id, flags, relay
    /// address, and hardware address. The message type is always the first
    /// option on the wire.
    pub fn create_reply(
        request: &DhcpPacket,
        message_type: MessageType,
        your_ip: Ipv4Addr,
        siaddr: Ipv4Addr,
        options: Vec<RawOption>,
    ) -> Self {
        let mut reply = Self {
            op: BOOTREPLY,
            htype: HTYPE_ETHERNET,
            hlen: HLEN_ETHERNET,
            hops: 0,
            xid: request.xid,
            secs: 0,
            flags: request.flags,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: your_ip,
            siaddr,
            giaddr: request.giaddr,
            chaddr: request.chaddr,
            sname: [0u8; 64],
            file: [0u8; 128],
            options: Vec::with_capacity(options.len() + 1),
        };
        reply.options.push(RawOption {
            code: options::OPT_MESSAGE_TYPE,
            data: vec![message_type as u8],
        });
        reply.options.extend(options);
        reply
    }
}
