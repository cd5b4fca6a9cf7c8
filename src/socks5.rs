//! SOCKS5 front door (RFC 1928 subset)
//!
//! No-auth greeting and CONNECT requests only. The byte-level parsers work on
//! plain slices so they can be checked without a socket; the async helpers
//! drive them over any `AsyncRead + AsyncWrite` stream.

use crate::{Result, SsrError};
use std::fmt;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// SOCKS5 protocol constants
pub const SOCKS5_VERSION: u8 = 0x05;
const NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;

/// Greeting reply: always "no authentication required"
pub const HANDSHAKE_REPLY: [u8; 2] = [SOCKS5_VERSION, NO_AUTH];

/// Address types shared by SOCKS5 requests and SSR headers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressType {
    IPv4 = 0x01,
    Domain = 0x03,
    IPv6 = 0x04,
}

impl AddressType {
    pub fn from_byte(atyp: u8) -> Result<Self> {
        match atyp {
            0x01 => Ok(AddressType::IPv4),
            0x03 => Ok(AddressType::Domain),
            0x04 => Ok(AddressType::IPv6),
            _ => Err(SsrError::InvalidAddressType),
        }
    }

    /// Pick the type by pattern-matching the host string
    pub fn for_host(host: &str) -> Self {
        if host.parse::<Ipv4Addr>().is_ok() {
            AddressType::IPv4
        } else if host.parse::<Ipv6Addr>().is_ok() {
            AddressType::IPv6
        } else {
            AddressType::Domain
        }
    }
}

/// SOCKS5 reply codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyCode {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TTLExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl ReplyCode {
    /// Reply to send the client when a session fails with `err`
    pub fn from_error(err: &SsrError) -> Self {
        match err {
            SsrError::UnsupportedCommand => ReplyCode::CommandNotSupported,
            SsrError::InvalidAddressType => ReplyCode::AddressTypeNotSupported,
            SsrError::OperationTimeout => ReplyCode::TTLExpired,
            _ => ReplyCode::GeneralFailure,
        }
    }

    /// Reply for a failed upstream dial
    pub fn from_io_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::ConnectionRefused => ReplyCode::ConnectionRefused,
            ErrorKind::NetworkUnreachable | ErrorKind::NetworkDown => {
                ReplyCode::NetworkUnreachable
            }
            ErrorKind::HostUnreachable => ReplyCode::HostUnreachable,
            ErrorKind::TimedOut => ReplyCode::TTLExpired,
            _ => ReplyCode::GeneralFailure,
        }
    }
}

/// Destination requested by the client
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetAddress {
    pub addr_type: AddressType,
    pub host: String,
    pub port: u16,
}

impl TargetAddress {
    /// Build a target, inferring the address type from `host`
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let host = host.into();
        Self {
            addr_type: AddressType::for_host(&host),
            host,
            port,
        }
    }

    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        self.host
            .parse::<IpAddr>()
            .ok()
            .map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr_type {
            AddressType::IPv6 => write!(f, "[{}]:{}", self.host, self.port),
            _ => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

fn format_ipv6(addr: &[u8]) -> String {
    addr.chunks_exact(2)
        .map(|pair| format!("{:02x}{:02x}", pair[0], pair[1]))
        .collect::<Vec<_>>()
        .join(":")
}

/// Decode `ATYP DST.ADDR DST.PORT` starting at `data[0]`
///
/// Returns the target and the number of bytes consumed.
pub(crate) fn decode_address(data: &[u8]) -> Result<(TargetAddress, usize)> {
    let atyp = *data.first().ok_or(SsrError::InvalidAddress)?;
    let addr_type = AddressType::from_byte(atyp)?;

    let (host, addr_end) = match addr_type {
        AddressType::IPv4 => {
            let addr = data.get(1..5).ok_or(SsrError::InvalidAddress)?;
            (Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]).to_string(), 5)
        }
        AddressType::Domain => {
            let len = *data.get(1).ok_or(SsrError::InvalidAddress)? as usize;
            let raw = data.get(2..2 + len).ok_or(SsrError::InvalidAddress)?;
            let domain = std::str::from_utf8(raw).map_err(|_| SsrError::InvalidAddress)?;
            (domain.to_string(), 2 + len)
        }
        AddressType::IPv6 => {
            let addr = data.get(1..17).ok_or(SsrError::InvalidAddress)?;
            (format_ipv6(addr), 17)
        }
    };

    let port = data
        .get(addr_end..addr_end + 2)
        .ok_or(SsrError::InvalidPort)?;
    let port = u16::from_be_bytes([port[0], port[1]]);

    Ok((
        TargetAddress {
            addr_type,
            host,
            port,
        },
        addr_end + 2,
    ))
}

/// Parse the client greeting
///
/// ```text
/// +----+----------+----------+
/// |VER | NMETHODS | METHODS  |
/// +----+----------+----------+
/// | 1  |    1     | 1 to 255 |
/// +----+----------+----------+
/// ```
///
/// Returns the number of bytes belonging to the greeting. Offered methods are
/// ignored; the reply is always [`HANDSHAKE_REPLY`].
pub fn parse_handshake(data: &[u8]) -> Result<usize> {
    if data.len() < 2 || data[0] != SOCKS5_VERSION {
        return Err(SsrError::InvalidProtocol);
    }
    let nmethods = data[1] as usize;
    Ok(data.len().min(2 + nmethods))
}

/// Parse a connect request
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
pub fn parse_connect_request(data: &[u8]) -> Result<(TargetAddress, usize)> {
    if data.len() < 4 || data[0] != SOCKS5_VERSION {
        return Err(SsrError::InvalidProtocol);
    }
    if data[1] != CMD_CONNECT {
        return Err(SsrError::UnsupportedCommand);
    }
    let (target, used) = decode_address(&data[3..])?;
    Ok((target, 3 + used))
}

/// Reply with a fixed `0.0.0.0:0` bound address
pub fn build_response(reply: ReplyCode) -> [u8; 10] {
    [SOCKS5_VERSION, reply as u8, 0x00, AddressType::IPv4 as u8, 0, 0, 0, 0, 0, 0]
}

fn truncated(err: std::io::Error, on_eof: SsrError) -> SsrError {
    if err.kind() == ErrorKind::UnexpectedEof {
        on_eof
    } else {
        err.into()
    }
}

/// Read the greeting from `stream` and answer it
pub async fn read_handshake<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    stream
        .read_exact(&mut head)
        .await
        .map_err(|e| truncated(e, SsrError::InvalidProtocol))?;
    parse_handshake(&head)?;

    let mut methods = vec![0u8; head[1] as usize];
    stream
        .read_exact(&mut methods)
        .await
        .map_err(|e| truncated(e, SsrError::InvalidProtocol))?;
    log::trace!("[SOCKS5] Auth methods offered: {:?}", methods);

    stream.write_all(&HANDSHAKE_REPLY).await?;
    log::trace!("[SOCKS5] Accepted auth method: NoAuth");
    Ok(())
}

/// Read one connect request from `stream`
pub async fn read_connect_request<S>(stream: &mut S) -> Result<TargetAddress>
where
    S: AsyncRead + Unpin,
{
    let mut request = vec![0u8; 4];
    stream
        .read_exact(&mut request)
        .await
        .map_err(|e| truncated(e, SsrError::InvalidProtocol))?;

    if request[0] != SOCKS5_VERSION {
        return Err(SsrError::InvalidProtocol);
    }
    if request[1] != CMD_CONNECT {
        log::warn!("[SOCKS5] Unsupported command: {}", request[1]);
        return Err(SsrError::UnsupportedCommand);
    }

    let addr_len = match AddressType::from_byte(request[3])? {
        AddressType::IPv4 => 4,
        AddressType::IPv6 => 16,
        AddressType::Domain => {
            let mut len = [0u8; 1];
            stream
                .read_exact(&mut len)
                .await
                .map_err(|e| truncated(e, SsrError::InvalidAddress))?;
            request.push(len[0]);
            len[0] as usize
        }
    };

    let start = request.len();
    request.resize(start + addr_len, 0);
    stream
        .read_exact(&mut request[start..])
        .await
        .map_err(|e| truncated(e, SsrError::InvalidAddress))?;

    let mut port = [0u8; 2];
    stream
        .read_exact(&mut port)
        .await
        .map_err(|e| truncated(e, SsrError::InvalidPort))?;
    request.extend_from_slice(&port);

    let (target, _) = parse_connect_request(&request)?;
    log::debug!("[SOCKS5] CONNECT {}", target);
    Ok(target)
}

/// Write a reply to the client
pub async fn send_response<S>(stream: &mut S, reply: ReplyCode) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    log::trace!("[SOCKS5] Sending reply: code={:?}", reply);
    stream.write_all(&build_response(reply)).await?;
    Ok(())
}
