//! Minimal STUN/TURN message codec (RFC 5389, RFC 5766).
//!
//! Covers what the traversal client exchanges: binding and allocate
//! requests, their responses, short-term credential integrity, and the
//! address and error attributes.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::error::{Error, Result};

/// Fixed value in every STUN header.
pub const MAGIC_COOKIE: u32 = 0x2112_A442;
const HEADER_LEN: usize = 20;
const INTEGRITY_LEN: usize = 20;

/// STUN error code reported when an allocation already exists.
pub const ALLOCATION_MISMATCH: u16 = 437;
/// IANA protocol number for UDP, used in REQUESTED-TRANSPORT.
pub const TRANSPORT_UDP: u8 = 17;

mod attr {
    pub const MAPPED_ADDRESS: u16 = 0x0001;
    pub const USERNAME: u16 = 0x0006;
    pub const MESSAGE_INTEGRITY: u16 = 0x0008;
    pub const ERROR_CODE: u16 = 0x0009;
    pub const LIFETIME: u16 = 0x000D;
    pub const XOR_RELAYED_ADDRESS: u16 = 0x0016;
    pub const REQUESTED_TRANSPORT: u16 = 0x0019;
    pub const XOR_MAPPED_ADDRESS: u16 = 0x0020;
    pub const SOFTWARE: u16 = 0x8022;
}

/// Request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    /// Binding.
    Binding,
    /// TURN allocate.
    Allocate,
    /// TURN refresh.
    Refresh,
}

impl Method {
    fn code(self) -> u16 {
        match self {
            Method::Binding => 0x001,
            Method::Allocate => 0x003,
            Method::Refresh => 0x004,
        }
    }

    fn from_code(code: u16) -> Result<Self> {
        match code {
            0x001 => Ok(Method::Binding),
            0x003 => Ok(Method::Allocate),
            0x004 => Ok(Method::Refresh),
            other => Err(Error::validation(format!("unsupported stun method {other:#05x}"))),
        }
    }
}

/// Message class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Class {
    /// Request.
    Request,
    /// Indication.
    Indication,
    /// Success response.
    Success,
    /// Error response.
    Error,
}

impl Class {
    fn bits(self) -> u16 {
        match self {
            Class::Request => 0x0000,
            Class::Indication => 0x0010,
            Class::Success => 0x0100,
            Class::Error => 0x0110,
        }
    }
}

fn encode_type(method: Method, class: Class) -> u16 {
    let m = method.code();
    (m & 0x000F) | ((m & 0x0070) << 1) | ((m & 0x0F80) << 2) | class.bits()
}

fn decode_type(raw: u16) -> Result<(Method, Class)> {
    let class = match raw & 0x0110 {
        0x0000 => Class::Request,
        0x0010 => Class::Indication,
        0x0100 => Class::Success,
        _ => Class::Error,
    };
    let m = (raw & 0x000F) | ((raw & 0x00E0) >> 1) | ((raw & 0x3E00) >> 2);
    Ok((Method::from_code(m)?, class))
}

/// A decoded attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    /// Legacy reflexive address.
    MappedAddress(SocketAddr),
    /// Reflexive address.
    XorMappedAddress(SocketAddr),
    /// Relayed address of an allocation.
    XorRelayedAddress(SocketAddr),
    /// Credential user name.
    Username(String),
    /// Error code and reason phrase.
    ErrorCode {
        /// Numeric code, e.g. 437.
        code: u16,
        /// Reason phrase.
        reason: String,
    },
    /// Transport protocol for an allocation.
    RequestedTransport(u8),
    /// Allocation lifetime in seconds.
    Lifetime(u32),
    /// HMAC-SHA1 over the preceding message.
    MessageIntegrity([u8; INTEGRITY_LEN]),
    /// Agent description.
    Software(String),
    /// Anything else, kept raw.
    Other {
        /// Attribute type.
        typ: u16,
        /// Raw value.
        value: Vec<u8>,
    },
}

/// A STUN message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Method.
    pub method: Method,
    /// Class.
    pub class: Class,
    /// Transaction identifier.
    pub transaction_id: [u8; 12],
    /// Attributes in wire order.
    pub attributes: Vec<Attribute>,
}

impl Message {
    /// New request with a random transaction id.
    pub fn request(method: Method) -> Self {
        Self {
            method,
            class: Class::Request,
            transaction_id: rand::random(),
            attributes: Vec::new(),
        }
    }

    /// Response of `class` to `request`.
    pub fn response_to(request: &Message, class: Class) -> Self {
        Self {
            method: request.method,
            class,
            transaction_id: request.transaction_id,
            attributes: Vec::new(),
        }
    }

    /// Append an attribute.
    pub fn with(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// First reflexive address (XOR form preferred).
    pub fn mapped_address(&self) -> Option<SocketAddr> {
        self.attributes
            .iter()
            .find_map(|a| match a {
                Attribute::XorMappedAddress(addr) => Some(*addr),
                _ => None,
            })
            .or_else(|| {
                self.attributes.iter().find_map(|a| match a {
                    Attribute::MappedAddress(addr) => Some(*addr),
                    _ => None,
                })
            })
    }

    /// Relayed address, if present.
    pub fn relayed_address(&self) -> Option<SocketAddr> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::XorRelayedAddress(addr) => Some(*addr),
            _ => None,
        })
    }

    /// Error code and reason, if present.
    pub fn error_code(&self) -> Option<(u16, &str)> {
        self.attributes.iter().find_map(|a| match a {
            Attribute::ErrorCode { code, reason } => Some((*code, reason.as_str())),
            _ => None,
        })
    }

    /// Serialize; when `integrity_key` is set a MESSAGE-INTEGRITY attribute
    /// is computed and appended.
    pub fn encode(&self, integrity_key: Option<&[u8]>) -> Vec<u8> {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(&encode_type(self.method, self.class).to_be_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(&self.transaction_id);

        for attribute in &self.attributes {
            if matches!(attribute, Attribute::MessageIntegrity(_)) {
                continue;
            }
            let (typ, value) = encode_attribute(attribute, &self.transaction_id);
            push_attribute(&mut buf, typ, &value);
        }

        if let Some(key) = integrity_key {
            let len = buf.len() - HEADER_LEN + 4 + INTEGRITY_LEN;
            set_length(&mut buf, len);
            let mac = hmac_sha1(key, &buf);
            push_attribute(&mut buf, attr::MESSAGE_INTEGRITY, &mac);
        }
        let len = buf.len() - HEADER_LEN;
        set_length(&mut buf, len);
        buf
    }

    /// Parse a message from the wire.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::validation("stun message shorter than header"));
        }
        let raw_type = u16::from_be_bytes([bytes[0], bytes[1]]);
        if raw_type & 0xC000 != 0 {
            return Err(Error::validation("not a stun message"));
        }
        let length = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        let cookie = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if cookie != MAGIC_COOKIE {
            return Err(Error::validation("bad stun magic cookie"));
        }
        if HEADER_LEN + length != bytes.len() || length % 4 != 0 {
            return Err(Error::validation("stun length mismatch"));
        }

        let (method, class) = decode_type(raw_type)?;
        let mut transaction_id = [0u8; 12];
        transaction_id.copy_from_slice(&bytes[8..20]);

        let mut attributes = Vec::new();
        let mut offset = HEADER_LEN;
        while offset + 4 <= bytes.len() {
            let typ = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
            let len = u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]) as usize;
            let start = offset + 4;
            let end = start + len;
            if end > bytes.len() {
                return Err(Error::validation("truncated stun attribute"));
            }
            attributes.push(decode_attribute(typ, &bytes[start..end], &transaction_id)?);
            offset = start + padded(len);
        }

        Ok(Self {
            method,
            class,
            transaction_id,
            attributes,
        })
    }
}

/// Check the MESSAGE-INTEGRITY attribute of a raw message against `key`.
pub fn verify_integrity(bytes: &[u8], key: &[u8]) -> Result<()> {
    let mut offset = HEADER_LEN;
    while offset + 4 <= bytes.len() {
        let typ = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
        let len = u16::from_be_bytes([bytes[offset + 2], bytes[offset + 3]]) as usize;
        if typ == attr::MESSAGE_INTEGRITY && len == INTEGRITY_LEN && offset + 4 + len <= bytes.len() {
            let mut prefix = bytes[..offset].to_vec();
            set_length(&mut prefix, offset - HEADER_LEN + 4 + INTEGRITY_LEN);
            let expected = hmac_sha1(key, &prefix);
            return if expected[..] == bytes[offset + 4..offset + 4 + len] {
                Ok(())
            } else {
                Err(Error::validation("stun message integrity mismatch"))
            };
        }
        offset += 4 + padded(len);
    }
    Err(Error::validation("stun message has no integrity attribute"))
}

fn padded(len: usize) -> usize {
    (len + 3) & !3
}

fn set_length(buf: &mut [u8], len: usize) {
    let len = len as u16;
    buf[2..4].copy_from_slice(&len.to_be_bytes());
}

fn push_attribute(buf: &mut Vec<u8>, typ: u16, value: &[u8]) {
    buf.extend_from_slice(&typ.to_be_bytes());
    buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buf.extend_from_slice(value);
    buf.resize(buf.len() + padded(value.len()) - value.len(), 0);
}

fn hmac_sha1(key: &[u8], data: &[u8]) -> [u8; INTEGRITY_LEN] {
    // HMAC accepts keys of any length
    let mut mac = match Hmac::<Sha1>::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => return [0; INTEGRITY_LEN],
    };
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn xor_mask(transaction_id: &[u8; 12]) -> [u8; 16] {
    let mut mask = [0u8; 16];
    mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    mask[4..].copy_from_slice(transaction_id);
    mask
}

fn encode_address(addr: &SocketAddr, xor: Option<&[u8; 12]>) -> Vec<u8> {
    let mask = xor.map(xor_mask);
    let port_mask = if mask.is_some() { (MAGIC_COOKIE >> 16) as u16 } else { 0 };
    let mut out = vec![0u8];
    match addr.ip() {
        IpAddr::V4(ip) => {
            out.push(0x01);
            out.extend_from_slice(&(addr.port() ^ port_mask).to_be_bytes());
            let mut octets = ip.octets();
            if let Some(mask) = mask {
                octets.iter_mut().zip(mask.iter()).for_each(|(o, m)| *o ^= m);
            }
            out.extend_from_slice(&octets);
        }
        IpAddr::V6(ip) => {
            out.push(0x02);
            out.extend_from_slice(&(addr.port() ^ port_mask).to_be_bytes());
            let mut octets = ip.octets();
            if let Some(mask) = mask {
                octets.iter_mut().zip(mask.iter()).for_each(|(o, m)| *o ^= m);
            }
            out.extend_from_slice(&octets);
        }
    }
    out
}

fn decode_address(value: &[u8], xor: Option<&[u8; 12]>) -> Result<SocketAddr> {
    if value.len() < 4 {
        return Err(Error::validation("stun address attribute too short"));
    }
    let mask = xor.map(xor_mask);
    let port_mask = if mask.is_some() { (MAGIC_COOKIE >> 16) as u16 } else { 0 };
    let port = u16::from_be_bytes([value[2], value[3]]) ^ port_mask;
    let ip = match (value[1], value.len()) {
        (0x01, 8) => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&value[4..8]);
            if let Some(mask) = mask {
                octets.iter_mut().zip(mask.iter()).for_each(|(o, m)| *o ^= m);
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        (0x02, 20) => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            if let Some(mask) = mask {
                octets.iter_mut().zip(mask.iter()).for_each(|(o, m)| *o ^= m);
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return Err(Error::validation("unknown stun address family")),
    };
    Ok(SocketAddr::new(ip, port))
}

fn encode_attribute(attribute: &Attribute, tid: &[u8; 12]) -> (u16, Vec<u8>) {
    match attribute {
        Attribute::MappedAddress(a) => (attr::MAPPED_ADDRESS, encode_address(a, None)),
        Attribute::XorMappedAddress(a) => (attr::XOR_MAPPED_ADDRESS, encode_address(a, Some(tid))),
        Attribute::XorRelayedAddress(a) => (attr::XOR_RELAYED_ADDRESS, encode_address(a, Some(tid))),
        Attribute::Username(u) => (attr::USERNAME, u.as_bytes().to_vec()),
        Attribute::ErrorCode { code, reason } => {
            let mut v = vec![0, 0, (code / 100) as u8, (code % 100) as u8];
            v.extend_from_slice(reason.as_bytes());
            (attr::ERROR_CODE, v)
        }
        Attribute::RequestedTransport(proto) => (attr::REQUESTED_TRANSPORT, vec![*proto, 0, 0, 0]),
        Attribute::Lifetime(secs) => (attr::LIFETIME, secs.to_be_bytes().to_vec()),
        Attribute::MessageIntegrity(mac) => (attr::MESSAGE_INTEGRITY, mac.to_vec()),
        Attribute::Software(s) => (attr::SOFTWARE, s.as_bytes().to_vec()),
        Attribute::Other { typ, value } => (*typ, value.clone()),
    }
}

fn decode_attribute(typ: u16, value: &[u8], tid: &[u8; 12]) -> Result<Attribute> {
    let text = |v: &[u8]| String::from_utf8_lossy(v).into_owned();
    Ok(match typ {
        attr::MAPPED_ADDRESS => Attribute::MappedAddress(decode_address(value, None)?),
        attr::XOR_MAPPED_ADDRESS => Attribute::XorMappedAddress(decode_address(value, Some(tid))?),
        attr::XOR_RELAYED_ADDRESS => Attribute::XorRelayedAddress(decode_address(value, Some(tid))?),
        attr::USERNAME => Attribute::Username(text(value)),
        attr::ERROR_CODE if value.len() >= 4 => Attribute::ErrorCode {
            code: (value[2] & 0x07) as u16 * 100 + value[3] as u16,
            reason: text(&value[4..]),
        },
        attr::REQUESTED_TRANSPORT if !value.is_empty() => Attribute::RequestedTransport(value[0]),
        attr::LIFETIME if value.len() == 4 => {
            Attribute::Lifetime(u32::from_be_bytes([value[0], value[1], value[2], value[3]]))
        }
        attr::MESSAGE_INTEGRITY if value.len() == INTEGRITY_LEN => {
            let mut mac = [0u8; INTEGRITY_LEN];
            mac.copy_from_slice(value);
            Attribute::MessageIntegrity(mac)
        }
        attr::SOFTWARE => Attribute::Software(text(value)),
        _ => Attribute::Other {
            typ,
            value: value.to_vec(),
        },
    })
}
