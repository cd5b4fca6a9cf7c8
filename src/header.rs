//! SSR destination header
//!
//! The first logical chunk of every upstream stream, encrypted together with
//! the payload that follows it:
//!
//! ```text
//! +------+----------+----------+
//! | ATYP | DST.ADDR | DST.PORT |
//! +------+----------+----------+
//! |  1   | Variable |    2     |
//! +------+----------+----------+
//! ```

use crate::socks5::{decode_address, AddressType, TargetAddress};
use crate::{Result, SsrError};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Serialize `target` as `ATYP + address + BE port`
///
/// The address type is chosen from the host string, not from
/// `target.addr_type`, so a domain that happens to be an IP literal is sent
/// in its compact form.
pub fn encode_header(target: &TargetAddress) -> Result<Vec<u8>> {
    let mut header = Vec::with_capacity(1 + 1 + target.host.len() + 2);

    match AddressType::for_host(&target.host) {
        AddressType::IPv4 => {
            let ip: Ipv4Addr = target.host.parse().map_err(|_| SsrError::InvalidAddress)?;
            header.push(AddressType::IPv4 as u8);
            header.extend_from_slice(&ip.octets());
        }
        AddressType::IPv6 => {
            let ip: Ipv6Addr = target.host.parse().map_err(|_| SsrError::InvalidAddress)?;
            header.push(AddressType::IPv6 as u8);
            header.extend_from_slice(&ip.octets());
        }
        AddressType::Domain => {
            let host = target.host.as_bytes();
            if host.is_empty() || host.len() > u8::MAX as usize {
                return Err(SsrError::InvalidAddress);
            }
            header.push(AddressType::Domain as u8);
            header.push(host.len() as u8);
            header.extend_from_slice(host);
        }
    }

    header.extend_from_slice(&target.port.to_be_bytes());
    Ok(header)
}

/// Parse a header produced by [`encode_header`]
///
/// Returns the target and the header length; the rest of `data` is payload.
pub fn decode_header(data: &[u8]) -> Result<(TargetAddress, usize)> {
    decode_address(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socks5::parse_connect_request;

    #[test]
    fn test_domain_header() {
        let header = encode_header(&TargetAddress::new("example.com", 443)).unwrap();
        let mut expected = vec![0x03, 0x0b];
        expected.extend_from_slice(b"example.com");
        expected.extend_from_slice(&[0x01, 0xbb]);
        assert_eq!(header, expected);
    }

    #[test]
    fn test_ipv4_header() {
        let header = encode_header(&TargetAddress::new("10.0.0.1", 8080)).unwrap();
        assert_eq!(header, vec![0x01, 10, 0, 0, 1, 0x1f, 0x90]);
    }

    #[test]
    fn test_ipv6_header() {
        let header = encode_header(&TargetAddress::new("::1", 53)).unwrap();
        assert_eq!(header.len(), 1 + 16 + 2);
        assert_eq!(header[0], 0x04);
        assert_eq!(header[16], 1);
        assert_eq!(&header[17..], &[0, 53]);
    }

    #[test]
    fn test_domain_too_long() {
        let host = "a".repeat(256);
        assert_eq!(
            encode_header(&TargetAddress::new(host, 80)),
            Err(SsrError::InvalidAddress)
        );
        assert!(encode_header(&TargetAddress::new("a".repeat(255), 80)).is_ok());
    }

    #[test]
    fn test_request_to_header_is_lossless() {
        let requests: Vec<Vec<u8>> = vec![
            vec![5, 1, 0, 1, 127, 0, 0, 1, 0x04, 0x38],
            [&[5u8, 1, 0, 3, 7][..], b"foo.bar", &[0, 80][..]].concat(),
            [
                &[5u8, 1, 0, 4][..],
                &[0xfe, 0x80][..],
                &[0u8; 13][..],
                &[0x42, 0xff, 0xff][..],
            ]
            .concat(),
        ];

        for request in requests {
            let (parsed, _) = parse_connect_request(&request).unwrap();
            let header = encode_header(&parsed).unwrap();
            assert_eq!(&header[..], &request[3..]);

            let (decoded, used) = decode_header(&header).unwrap();
            assert_eq!(used, header.len());
            assert_eq!(decoded.port, parsed.port);
            assert_eq!(
                decoded.host.parse::<std::net::IpAddr>().ok(),
                parsed.host.parse::<std::net::IpAddr>().ok()
            );
            assert_eq!(decoded.host, parsed.host);
        }
    }

    #[test]
    fn test_decode_leaves_payload() {
        let mut data = encode_header(&TargetAddress::new("example.org", 80)).unwrap();
        let header_len = data.len();
        data.extend_from_slice(b"GET /");
        let (target, used) = decode_header(&data).unwrap();
        assert_eq!(target.host, "example.org");
        assert_eq!(&data[used..], b"GET /");
        assert_eq!(used, header_len);
    }
}
