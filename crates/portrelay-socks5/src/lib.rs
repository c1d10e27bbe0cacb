//! SOCKS5 handshake parsing and reply assembly
//!
//! Stateless helpers consumed by a SOCKS5-speaking listener: parse the
//! method negotiation, the username/password sub-negotiation, and the
//! target request, and build the connect reply. Port bytes are big-endian
//! on the wire in both directions, the same convention for the request
//! parser and the reply encoder.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;

/// SOCKS protocol version byte
pub const VERSION: u8 = 0x05;

/// Parse errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Socks5Error {
    #[error("Message truncated: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("Unknown address type: {0:#04x}")]
    UnknownAddressType(u8),

    #[error("Credentials are not valid UTF-8")]
    InvalidUtf8,
}

/// Authentication methods offered by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    NoAuth,
    Gssapi,
    UserPass,
    Other(u8),
}

impl From<u8> for AuthMethod {
    fn from(value: u8) -> Self {
        match value {
            0x00 => AuthMethod::NoAuth,
            0x01 => AuthMethod::Gssapi,
            0x02 => AuthMethod::UserPass,
            other => AuthMethod::Other(other),
        }
    }
}

/// Reply codes for the connect response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    Succeeded = 0x00,
    ServerFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// Address carried by a target request.
///
/// Domains are returned unresolved; name resolution happens outside the
/// parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
    Domain(String),
}

/// Target endpoint requested by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRequest {
    pub address: Address,
    pub port: u16,
}

const ATYP_V4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_V6: u8 = 0x04;

fn need(data: &[u8], needed: usize) -> Result<(), Socks5Error> {
    if data.len() < needed {
        return Err(Socks5Error::Truncated {
            needed,
            got: data.len(),
        });
    }
    Ok(())
}

/// Parse the method negotiation: `[version][count][methods...]`.
///
/// The count byte governs how many method ids follow.
pub fn parse_auth_methods(data: &[u8]) -> Result<Vec<AuthMethod>, Socks5Error> {
    need(data, 2)?;
    let count = data[1] as usize;
    need(data, 2 + count)?;

    Ok(data[2..2 + count].iter().map(|&m| m.into()).collect())
}

/// Parse the username/password sub-negotiation:
/// `[subversion][ulen][username][plen][password]`.
pub fn parse_userpass_auth(data: &[u8]) -> Result<(String, String), Socks5Error> {
    need(data, 2)?;
    let ulen = data[1] as usize;
    need(data, 2 + ulen + 1)?;
    let plen = data[2 + ulen] as usize;
    need(data, 2 + ulen + 1 + plen)?;

    let username = std::str::from_utf8(&data[2..2 + ulen])
        .map_err(|_| Socks5Error::InvalidUtf8)?
        .to_string();
    let password = std::str::from_utf8(&data[2 + ulen + 1..2 + ulen + 1 + plen])
        .map_err(|_| Socks5Error::InvalidUtf8)?
        .to_string();

    Ok((username, password))
}

/// Parse a target request: `[version][command][reserved][atyp][addr][port]`.
pub fn parse_target_request(data: &[u8]) -> Result<TargetRequest, Socks5Error> {
    need(data, 4)?;
    // Skip VERSION, COMMAND, RSV.
    let body = &data[3..];

    let (address, addr_len) = match body[0] {
        ATYP_V4 => {
            need(body, 1 + 4 + 2)?;
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&body[1..5]);
            (Address::V4(Ipv4Addr::from(octets)), 4)
        }
        ATYP_V6 => {
            need(body, 1 + 16 + 2)?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&body[1..17]);
            (Address::V6(Ipv6Addr::from(octets)), 16)
        }
        ATYP_DOMAIN => {
            need(body, 2)?;
            let len = body[1] as usize;
            need(body, 2 + len + 2)?;
            let name = std::str::from_utf8(&body[2..2 + len])
                .map_err(|_| Socks5Error::InvalidUtf8)?
                .to_string();
            (Address::Domain(name), 1 + len)
        }
        other => return Err(Socks5Error::UnknownAddressType(other)),
    };

    let port_off = 1 + addr_len;
    let port = u16::from_be_bytes([body[port_off], body[port_off + 1]]);

    Ok(TargetRequest { address, port })
}

/// Build a connect reply:
/// `[0x05][reply][0x00][atyp][address][port]`, port big-endian.
pub fn build_connect_reply(address: &IpAddr, port: u16, reply: ReplyCode) -> Vec<u8> {
    let mut res = Vec::with_capacity(22);
    res.push(VERSION);
    res.push(reply as u8);
    res.push(0x00);

    match address {
        IpAddr::V4(v4) => {
            res.push(ATYP_V4);
            res.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            res.push(ATYP_V6);
            res.extend_from_slice(&v6.octets());
        }
    }

    res.extend_from_slice(&port.to_be_bytes());
    res
}
