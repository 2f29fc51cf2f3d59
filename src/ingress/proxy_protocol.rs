//! PROXY protocol preamble parsing using nom
//!
//! Fronting L4 load balancers prepend a preamble carrying the real client
//! address: v1 is a single ASCII line, v2 is a binary frame with optional
//! TLV extensions. The parser works on a growing buffer: it reports
//! "need more bytes" until a complete preamble (or a definite error) is
//! seen, and on success returns how many bytes the preamble consumed so
//! the HTTP bytes behind it stay untouched.
//!
//! Frame layouts follow the HAProxy `proxy-protocol.txt` specification:
//! <https://www.haproxy.org/download/1.8/doc/proxy-protocol.txt>

use bytes::Bytes;
use nom::branch::alt;
use nom::bytes::complete::{tag as tag_c, take as take_c, take_while1};
use nom::bytes::streaming::{tag, take};
use nom::character::complete::{char, digit1};
use nom::combinator::{all_consuming, map, map_res, rest, verify};
use nom::error::{Error as NomError, ErrorKind};
use nom::multi::many0;
use nom::number::complete::{be_u16 as be_u16_c, be_u8 as be_u8_c};
use nom::number::streaming::{be_u16, be_u8};
use nom::sequence::preceded;
use nom::{IResult, Needed};
use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::ProxyError;

/// The 12-byte v2 magic signature
pub const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

const V1_PREFIX: &[u8] = b"PROXY ";

/// Longest legal v1 line including its CRLF
pub const V1_MAX_LEN: usize = 107;

/// Which preamble flavor a connection carried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyVersion {
    V1,
    V2,
}

impl ProxyVersion {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::V1 => "v1",
            Self::V2 => "v2",
        }
    }
}

impl std::fmt::Display for ProxyVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Proxied endpoint pair carried by a preamble
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxiedAddresses {
    /// Original client address
    pub source: SocketAddr,
    /// Address the client connected to on the load balancer
    pub destination: SocketAddr,
}

/// One v2 type-length-value extension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTlv {
    pub kind: u8,
    pub value: Bytes,
}

/// Command nibble of a v2 frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum V2Command {
    /// Health-check traffic from the load balancer itself
    Local,
    /// A genuinely proxied client connection
    Proxy,
}

/// A decoded preamble
///
/// TLVs exist only on the v2 variant; a v1 line cannot carry them, so the
/// invalid combination is unrepresentable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyHeader {
    V1 {
        /// None for `PROXY UNKNOWN` lines
        addresses: Option<ProxiedAddresses>,
    },
    V2 {
        command: V2Command,
        addresses: Option<ProxiedAddresses>,
        tlvs: Vec<ProxyTlv>,
    },
}

impl ProxyHeader {
    #[must_use]
    pub const fn version(&self) -> ProxyVersion {
        match self {
            Self::V1 { .. } => ProxyVersion::V1,
            Self::V2 { .. } => ProxyVersion::V2,
        }
    }

    #[must_use]
    pub const fn addresses(&self) -> Option<&ProxiedAddresses> {
        match self {
            Self::V1 { addresses } | Self::V2 { addresses, .. } => addresses.as_ref(),
        }
    }

    #[must_use]
    pub fn tlvs(&self) -> &[ProxyTlv] {
        match self {
            Self::V1 { .. } => &[],
            Self::V2 { tlvs, .. } => tlvs,
        }
    }

    /// Drop the TLV payloads, keeping only the frame itself
    #[must_use]
    pub fn without_tlvs(self) -> Self {
        match self {
            v1 @ Self::V1 { .. } => v1,
            Self::V2 {
                command, addresses, ..
            } => Self::V2 {
                command,
                addresses,
                tlvs: Vec::new(),
            },
        }
    }
}

/// Outcome of sniffing the first buffered bytes of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detection {
    /// No preamble; the bytes are the application protocol itself
    Absent,
    Present(ProxyVersion),
}

/// Sniff whether a preamble is present
///
/// A buffer too short to show a full magic prefix counts as absent; the
/// decision is made once, on the first bytes the connection delivers.
#[must_use]
pub fn detect(preamble: &[u8]) -> Detection {
    if preamble.len() >= V2_SIGNATURE.len() && preamble[..V2_SIGNATURE.len()] == V2_SIGNATURE {
        return Detection::Present(ProxyVersion::V2);
    }
    if preamble.len() >= V1_PREFIX.len() && &preamble[..V1_PREFIX.len()] == V1_PREFIX {
        return Detection::Present(ProxyVersion::V1);
    }
    Detection::Absent
}

/// Parse a complete preamble from the front of `input`
///
/// Returns the header and the number of bytes it occupied, or `Ok(None)`
/// when the buffer does not yet hold the whole preamble.
pub fn parse_preamble(input: &[u8]) -> Result<Option<(ProxyHeader, usize)>, ProxyError> {
    let total = input.len();
    match preamble(input) {
        Ok((remaining, header)) => Ok(Some((header, total - remaining.len()))),
        Err(nom::Err::Incomplete(_)) => Ok(None),
        Err(nom::Err::Error(e) | nom::Err::Failure(e)) => Err(ProxyError::ProxyProtocolDecode {
            reason: format!(
                "invalid preamble at offset {} ({:?})",
                total - e.input.len(),
                e.code
            ),
        }),
    }
}

fn preamble(input: &[u8]) -> IResult<&[u8], ProxyHeader> {
    // The v2 signature begins with CR LF, which can never open a v1 line
    alt((v2_frame, v1_line))(input)
}

// --- v1: one ASCII line terminated by CRLF -------------------------------

fn v1_line(input: &[u8]) -> IResult<&[u8], ProxyHeader> {
    let window = &input[..input.len().min(V1_MAX_LEN)];
    let Some(line_len) = window.windows(2).position(|pair| pair == b"\r\n") else {
        if input.len() >= V1_MAX_LEN {
            return Err(nom::Err::Failure(NomError::new(input, ErrorKind::CrLf)));
        }
        return Err(nom::Err::Incomplete(Needed::Unknown));
    };

    let line = &input[..line_len];
    let remaining = &input[line_len + 2..];
    let text = std::str::from_utf8(line)
        .map_err(|_| nom::Err::Failure(NomError::new(input, ErrorKind::Char)))?;

    match all_consuming(v1_body)(text) {
        Ok((_, addresses)) => Ok((remaining, ProxyHeader::V1 { addresses })),
        Err(_) => Err(nom::Err::Failure(NomError::new(input, ErrorKind::Verify))),
    }
}

fn v1_body(input: &str) -> IResult<&str, Option<ProxiedAddresses>> {
    let (input, _) = tag_c("PROXY ")(input)?;
    alt((
        // Anything after UNKNOWN up to the CRLF is ignored
        map(preceded(tag_c("UNKNOWN"), rest), |_| None),
        map(v1_tcp4, Some),
        map(v1_tcp6, Some),
    ))(input)
}

fn v1_tcp4(input: &str) -> IResult<&str, ProxiedAddresses> {
    let (input, _) = tag_c("TCP4 ")(input)?;
    let (input, src_ip) = v1_ipv4(input)?;
    let (input, _) = char(' ')(input)?;
    let (input, dst_ip) = v1_ipv4(input)?;
    let (input, _) = char(' ')(input)?;
    let (input, src_port) = v1_port(input)?;
    let (input, _) = char(' ')(input)?;
    let (input, dst_port) = v1_port(input)?;
    Ok((
        input,
        ProxiedAddresses {
            source: SocketAddr::new(IpAddr::V4(src_ip), src_port),
            destination: SocketAddr::new(IpAddr::V4(dst_ip), dst_port),
        },
    ))
}

fn v1_tcp6(input: &str) -> IResult<&str, ProxiedAddresses> {
    let (input, _) = tag_c("TCP6 ")(input)?;
    let (input, src_ip) = v1_ipv6(input)?;
    let (input, _) = char(' ')(input)?;
    let (input, dst_ip) = v1_ipv6(input)?;
    let (input, _) = char(' ')(input)?;
    let (input, src_port) = v1_port(input)?;
    let (input, _) = char(' ')(input)?;
    let (input, dst_port) = v1_port(input)?;
    Ok((
        input,
        ProxiedAddresses {
            source: SocketAddr::new(IpAddr::V6(src_ip), src_port),
            destination: SocketAddr::new(IpAddr::V6(dst_ip), dst_port),
        },
    ))
}

fn v1_ipv4(input: &str) -> IResult<&str, Ipv4Addr> {
    map_res(take_while1(|c: char| c != ' '), str::parse::<Ipv4Addr>)(input)
}

fn v1_ipv6(input: &str) -> IResult<&str, Ipv6Addr> {
    map_res(take_while1(|c: char| c != ' '), str::parse::<Ipv6Addr>)(input)
}

fn v1_port(input: &str) -> IResult<&str, u16> {
    map_res(digit1, str::parse::<u16>)(input)
}

// --- v2: binary frame ----------------------------------------------------

const V2_FAMILY_INET: u8 = 0x1;
const V2_FAMILY_INET6: u8 = 0x2;
const V2_FAMILY_UNIX: u8 = 0x3;

const V2_UNIX_ADDR_LEN: usize = 216;

fn v2_frame(input: &[u8]) -> IResult<&[u8], ProxyHeader> {
    let (input, _) = tag(&V2_SIGNATURE[..])(input)?;
    let (input, ver_cmd) = verify(be_u8, |b| b >> 4 == 0x2)(input)?;
    let (input, fam) = be_u8(input)?;
    let (input, payload_len) = be_u16(input)?;
    let (remaining, payload) = take(payload_len as usize)(input)?;

    let command = match ver_cmd & 0x0F {
        0x0 => V2Command::Local,
        0x1 => V2Command::Proxy,
        _ => return Err(nom::Err::Failure(NomError::new(input, ErrorKind::Verify))),
    };

    // LOCAL frames carry the load balancer's own traffic; their payload
    // holds nothing a proxied request needs
    if command == V2Command::Local {
        return Ok((
            remaining,
            ProxyHeader::V2 {
                command,
                addresses: None,
                tlvs: Vec::new(),
            },
        ));
    }

    let family = fam >> 4;
    let transport = fam & 0x0F;
    if family > V2_FAMILY_UNIX || transport > 0x2 {
        return Err(nom::Err::Failure(NomError::new(input, ErrorKind::Verify)));
    }

    let (addresses, tlv_bytes) = match family {
        V2_FAMILY_INET => {
            let (tlv_bytes, addresses) = v2_inet(payload)
                .map_err(|_| nom::Err::Failure(NomError::new(input, ErrorKind::Eof)))?;
            (Some(addresses), tlv_bytes)
        }
        V2_FAMILY_INET6 => {
            let (tlv_bytes, addresses) = v2_inet6(payload)
                .map_err(|_| nom::Err::Failure(NomError::new(input, ErrorKind::Eof)))?;
            (Some(addresses), tlv_bytes)
        }
        V2_FAMILY_UNIX => {
            if payload.len() < V2_UNIX_ADDR_LEN {
                return Err(nom::Err::Failure(NomError::new(input, ErrorKind::Eof)));
            }
            // Socket paths have no meaning to an IP edge; skip to the TLVs
            (None, &payload[V2_UNIX_ADDR_LEN..])
        }
        // UNSPEC: opaque payload, nothing to extract
        _ => (None, &payload[payload.len()..]),
    };

    let tlvs = match all_consuming(many0(v2_tlv))(tlv_bytes) {
        Ok((_, tlvs)) => tlvs,
        Err(_) => return Err(nom::Err::Failure(NomError::new(input, ErrorKind::LengthValue))),
    };

    Ok((
        remaining,
        ProxyHeader::V2 {
            command,
            addresses,
            tlvs,
        },
    ))
}

fn v2_inet(payload: &[u8]) -> IResult<&[u8], ProxiedAddresses> {
    let (payload, src) = take_c(4usize)(payload)?;
    let (payload, dst) = take_c(4usize)(payload)?;
    let (payload, src_port) = be_u16_c(payload)?;
    let (payload, dst_port) = be_u16_c(payload)?;
    Ok((
        payload,
        ProxiedAddresses {
            source: SocketAddr::new(
                IpAddr::V4(Ipv4Addr::new(src[0], src[1], src[2], src[3])),
                src_port,
            ),
            destination: SocketAddr::new(
                IpAddr::V4(Ipv4Addr::new(dst[0], dst[1], dst[2], dst[3])),
                dst_port,
            ),
        },
    ))
}

fn v2_inet6(payload: &[u8]) -> IResult<&[u8], ProxiedAddresses> {
    let (payload, src) = take_c(16usize)(payload)?;
    let (payload, dst) = take_c(16usize)(payload)?;
    let (payload, src_port) = be_u16_c(payload)?;
    let (payload, dst_port) = be_u16_c(payload)?;

    let mut src_octets = [0u8; 16];
    src_octets.copy_from_slice(src);
    let mut dst_octets = [0u8; 16];
    dst_octets.copy_from_slice(dst);

    Ok((
        payload,
        ProxiedAddresses {
            source: SocketAddr::new(IpAddr::V6(Ipv6Addr::from(src_octets)), src_port),
            destination: SocketAddr::new(IpAddr::V6(Ipv6Addr::from(dst_octets)), dst_port),
        },
    ))
}

fn v2_tlv(input: &[u8]) -> IResult<&[u8], ProxyTlv> {
    let (input, kind) = be_u8_c(input)?;
    let (input, len) = be_u16_c(input)?;
    let (input, value) = take_c(len as usize)(input)?;
    Ok((
        input,
        ProxyTlv {
            kind,
            value: Bytes::copy_from_slice(value),
        },
    ))
}

/// Render bytes as an offset-prefixed hex dump for decode-failure logs
#[must_use]
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 4);
    for (offset, line) in bytes.chunks(16).enumerate() {
        if offset > 0 {
            out.push('\n');
        }
        let _ = write!(out, "{:04x}: ", offset * 16);
        for byte in line {
            let _ = write!(out, "{:02x} ", byte);
        }
        for _ in line.len()..16 {
            out.push_str("   ");
        }
        out.push('|');
        for byte in line {
            out.push(if byte.is_ascii_graphic() || *byte == b' ' {
                *byte as char
            } else {
                '.'
            });
        }
        out.push('|');
    }
    out
}
