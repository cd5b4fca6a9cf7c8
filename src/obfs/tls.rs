//! TLS 1.2 session-ticket disguise (`tls1.2_ticket_auth`)
//!
//! The client opens with a complete fast-auth flight in a single write:
//!
//! ```text
//! ClientHello          16 03 01 ...  random = time(4) rand(18) hmac(10)
//!                                    session_id = client id (32)
//!                                    SNI, session ticket, ...
//! ChangeCipherSpec     14 03 03 00 01 01
//! Finished             16 03 03 00 20 rand(22) hmac(10)
//! ApplicationData      17 03 03 len <ciphertext>
//! ```
//!
//! Every HMAC is SHA1 truncated to 10 bytes, keyed with the cipher key
//! followed by the client id. The server answers with its own hello flight,
//! authenticated the same way, then application data records.

use super::{ObfsContext, ObfsMode, Obfuscator};
use crate::{Result, SsrError};
use bytes::{Buf, BytesMut};
use hmac::{Hmac, Mac};
use rand::seq::SliceRandom;
use rand::{Rng, RngCore};
use sha1::Sha1;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha1 = Hmac<Sha1>;

/// TLS content types used by the disguise
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TlsContentType {
    ChangeCipherSpec = 0x14,
    Handshake = 0x16,
    ApplicationData = 0x17,
}

const TLS_VERSION: [u8; 2] = [0x03, 0x03];
const RECORD_HEADER_LEN: usize = 5;
pub const CLIENT_ID_LEN: usize = 32;
pub const HMAC_LEN: usize = 10;

/// Records above this size are split into randomly sized fragments
const FRAGMENT_THRESHOLD: usize = 2048;

/// Server flight larger than this is not a server hello
const MAX_HANDSHAKE_FLIGHT: usize = 16 * 1024;

const CIPHER_SUITES: &[u8] = &[
    0x00, 0x1c, 0xc0, 0x2b, 0xc0, 0x2f, 0xcc, 0xa9, 0xcc, 0xa8, 0xcc, 0x14, 0xcc, 0x13, 0xc0,
    0x0a, 0xc0, 0x14, 0xc0, 0x09, 0xc0, 0x13, 0x00, 0x9c, 0x00, 0x35, 0x00, 0x2f, 0x00, 0x0a,
];
const COMPRESSION: &[u8] = &[0x01, 0x00];
const EXT_RENEGOTIATION_INFO: &[u8] = &[0xff, 0x01, 0x00, 0x01, 0x00];
const EXT_EXTENDED_MASTER_SECRET: &[u8] = &[0x00, 0x17, 0x00, 0x00];
const EXT_SIGNATURE_ALGORITHMS: &[u8] = &[
    0x00, 0x0d, 0x00, 0x16, 0x00, 0x14, 0x06, 0x01, 0x06, 0x03, 0x05, 0x01, 0x05, 0x03, 0x04,
    0x01, 0x04, 0x03, 0x03, 0x01, 0x03, 0x03, 0x02, 0x01, 0x02, 0x03,
];
const EXT_STATUS_REQUEST: &[u8] = &[0x00, 0x05, 0x00, 0x05, 0x01, 0x00, 0x00, 0x00, 0x00];
const EXT_SCT: &[u8] = &[0x00, 0x12, 0x00, 0x00];
const EXT_CHANNEL_ID: &[u8] = &[0x75, 0x50, 0x00, 0x00];
const EXT_EC_POINT_FORMATS: &[u8] = &[0x00, 0x0b, 0x00, 0x02, 0x01, 0x00];
const EXT_SUPPORTED_GROUPS: &[u8] = &[0x00, 0x0a, 0x00, 0x06, 0x00, 0x04, 0x00, 0x17, 0x00, 0x18];

/// Truncated HMAC-SHA1 over `parts`, keyed with `key || client_id`
pub fn auth_tag(key: &[u8], client_id: &[u8], parts: &[&[u8]]) -> Result<[u8; HMAC_LEN]> {
    let mut mac_key = Vec::with_capacity(key.len() + client_id.len());
    mac_key.extend_from_slice(key);
    mac_key.extend_from_slice(client_id);

    let mut mac = <HmacSha1 as Mac>::new_from_slice(&mac_key)
        .map_err(|e| SsrError::OperationFailed(format!("hmac init: {}", e)))?;
    for part in parts {
        mac.update(part);
    }
    let digest = mac.finalize().into_bytes();

    let mut tag = [0u8; HMAC_LEN];
    tag.copy_from_slice(&digest[..HMAC_LEN]);
    Ok(tag)
}

fn record(content_type: TlsContentType, version: [u8; 2], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
    out.push(content_type as u8);
    out.extend_from_slice(&version);
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Wrap `data` in application data records, fragmenting large writes
pub fn wrap_application_data(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + RECORD_HEADER_LEN * (1 + data.len() / 2048));
    let mut rest = data;
    let mut rng = rand::thread_rng();

    while rest.len() > FRAGMENT_THRESHOLD {
        let size = (rng.gen::<u16>() as usize % 4096 + 100).min(rest.len());
        out.extend(record(TlsContentType::ApplicationData, TLS_VERSION, &rest[..size]));
        rest = &rest[size..];
    }
    if !rest.is_empty() {
        out.extend(record(TlsContentType::ApplicationData, TLS_VERSION, rest));
    }
    out
}

fn server_name_extension(host: &str) -> Vec<u8> {
    let name = host.as_bytes();
    let mut entry = vec![0x00];
    entry.extend_from_slice(&(name.len() as u16).to_be_bytes());
    entry.extend_from_slice(name);

    let mut list = ((entry.len()) as u16).to_be_bytes().to_vec();
    list.extend(entry);

    let mut ext = vec![0x00, 0x00];
    ext.extend_from_slice(&(list.len() as u16).to_be_bytes());
    ext.extend(list);
    ext
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Nothing sent yet
    Hello,
    /// Client flight sent, waiting for the server hello flight
    AwaitServer,
    /// Both flights done, pure application data
    Established,
}

pub struct TlsTicketAuth {
    ctx: ObfsContext,
    client_id: [u8; CLIENT_ID_LEN],
    phase: Phase,
    recv_buffer: BytesMut,
}

impl TlsTicketAuth {
    pub fn new(ctx: ObfsContext) -> Self {
        let mut client_id = [0u8; CLIENT_ID_LEN];
        rand::thread_rng().fill_bytes(&mut client_id);
        Self::with_client_id(ctx, client_id)
    }

    pub fn with_client_id(ctx: ObfsContext, client_id: [u8; CLIENT_ID_LEN]) -> Self {
        Self {
            ctx,
            client_id,
            phase: Phase::Hello,
            recv_buffer: BytesMut::new(),
        }
    }

    pub fn client_id(&self) -> &[u8; CLIENT_ID_LEN] {
        &self.client_id
    }

    fn tag(&self, parts: &[&[u8]]) -> Result<[u8; HMAC_LEN]> {
        auth_tag(&self.ctx.key, &self.client_id, parts)
    }

    /// `time(4) || random(18) || hmac(10)`
    fn auth_random(&self) -> Result<Vec<u8>> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or_default();

        let mut data = now.to_be_bytes().to_vec();
        let mut noise = [0u8; 18];
        rand::thread_rng().fill_bytes(&mut noise);
        data.extend_from_slice(&noise);
        let tag = self.tag(&[&data])?;
        data.extend_from_slice(&tag);
        Ok(data)
    }

    fn sni_host(&self) -> String {
        let mut rng = rand::thread_rng();
        let host = self.ctx.hosts().choose(&mut rng).cloned().unwrap_or_default();
        // an IP literal is never sent as a server name
        if host.chars().last().map_or(true, |c| c.is_ascii_digit()) {
            String::new()
        } else {
            host
        }
    }

    fn client_hello(&self) -> Result<Vec<u8>> {
        let mut rng = rand::thread_rng();

        let mut body = TLS_VERSION.to_vec();
        body.extend(self.auth_random()?);
        body.push(CLIENT_ID_LEN as u8);
        body.extend_from_slice(&self.client_id);
        body.extend_from_slice(CIPHER_SUITES);
        body.extend_from_slice(COMPRESSION);

        let mut ticket = vec![0u8; (rng.gen::<u16>() as usize % 17 + 8) * 16];
        rng.fill_bytes(&mut ticket);

        let mut ext = EXT_RENEGOTIATION_INFO.to_vec();
        ext.extend(server_name_extension(&self.sni_host()));
        ext.extend_from_slice(EXT_EXTENDED_MASTER_SECRET);
        ext.extend_from_slice(&[0x00, 0x23]);
        ext.extend_from_slice(&(ticket.len() as u16).to_be_bytes());
        ext.extend(ticket);
        ext.extend_from_slice(EXT_SIGNATURE_ALGORITHMS);
        ext.extend_from_slice(EXT_STATUS_REQUEST);
        ext.extend_from_slice(EXT_SCT);
        ext.extend_from_slice(EXT_CHANNEL_ID);
        ext.extend_from_slice(EXT_EC_POINT_FORMATS);
        ext.extend_from_slice(EXT_SUPPORTED_GROUPS);

        body.extend_from_slice(&(ext.len() as u16).to_be_bytes());
        body.extend(ext);

        // handshake header: type 1 (ClientHello), 24-bit length
        let mut handshake = vec![0x01, 0x00];
        handshake.extend_from_slice(&(body.len() as u16).to_be_bytes());
        handshake.extend(body);

        Ok(record(TlsContentType::Handshake, [0x03, 0x01], &handshake))
    }

    /// ChangeCipherSpec followed by an authenticated Finished
    fn client_finished(&self) -> Result<Vec<u8>> {
        let mut flight = record(TlsContentType::ChangeCipherSpec, TLS_VERSION, &[0x01]);
        flight.push(TlsContentType::Handshake as u8);
        flight.extend_from_slice(&TLS_VERSION);
        flight.extend_from_slice(&[0x00, 0x20]);

        let mut noise = [0u8; 22];
        rand::thread_rng().fill_bytes(&mut noise);
        flight.extend_from_slice(&noise);

        let tag = self.tag(&[&flight])?;
        flight.extend_from_slice(&tag);
        Ok(flight)
    }

    /// Length of the complete server hello flight at the head of the buffer
    ///
    /// The flight ends with the handshake record that follows the server's
    /// ChangeCipherSpec.
    fn server_flight_len(&self) -> Result<Option<usize>> {
        let buf = &self.recv_buffer;
        let mut pos = 0;
        let mut seen_ccs = false;

        while buf.len() >= pos + RECORD_HEADER_LEN {
            let content_type = buf[pos];
            let size = u16::from_be_bytes([buf[pos + 3], buf[pos + 4]]) as usize;
            let end = pos + RECORD_HEADER_LEN + size;
            if buf.len() < end {
                break;
            }

            match content_type {
                0x14 => seen_ccs = true,
                0x16 if seen_ccs => return Ok(Some(end)),
                0x16 => {}
                other => {
                    return Err(SsrError::OperationFailed(format!(
                        "tls obfs: unexpected record 0x{:02x} in server hello",
                        other
                    )))
                }
            }
            pos = end;
        }

        if buf.len() > MAX_HANDSHAKE_FLIGHT {
            return Err(SsrError::OperationFailed(
                "tls obfs: server hello too large".into(),
            ));
        }
        Ok(None)
    }

    fn verify_server_flight(&self, flight: &[u8]) -> Result<()> {
        if flight.len() < 11 + 32 + 1 + 32 {
            return Err(SsrError::OperationFailed("tls obfs: short server hello".into()));
        }
        let hello_tag = self.tag(&[&flight[11..33]])?;
        if hello_tag[..] != flight[33..43] {
            return Err(SsrError::OperationFailed(
                "tls obfs: server hello authentication failed".into(),
            ));
        }
        let (signed, tag) = flight.split_at(flight.len() - HMAC_LEN);
        if self.tag(&[signed])?[..] != *tag {
            return Err(SsrError::OperationFailed(
                "tls obfs: server finished authentication failed".into(),
            ));
        }
        Ok(())
    }

    /// Pull every complete application data record out of the buffer
    fn drain_application_data(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut pos = 0;
        let buf = &self.recv_buffer;

        while buf.len() >= pos + RECORD_HEADER_LEN {
            if buf[pos] != TlsContentType::ApplicationData as u8 {
                return Err(SsrError::OperationFailed(format!(
                    "tls obfs: expected application data, got 0x{:02x}",
                    buf[pos]
                )));
            }
            let size = u16::from_be_bytes([buf[pos + 3], buf[pos + 4]]) as usize;
            let end = pos + RECORD_HEADER_LEN + size;
            if buf.len() < end {
                break;
            }
            out.extend_from_slice(&buf[pos + RECORD_HEADER_LEN..end]);
            pos = end;
        }

        self.recv_buffer.advance(pos);
        Ok(out)
    }
}

impl Obfuscator for TlsTicketAuth {
    fn obfuscate(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        if self.phase != Phase::Hello {
            return Ok(wrap_application_data(data));
        }

        let mut out = self.client_hello()?;
        out.extend(self.client_finished()?);
        out.extend(wrap_application_data(data));
        self.phase = Phase::AwaitServer;
        Ok(out)
    }

    fn deobfuscate(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.recv_buffer.extend_from_slice(data);

        if self.phase != Phase::Established {
            let flight_len = match self.server_flight_len()? {
                Some(len) => len,
                None => return Ok(Vec::new()),
            };
            let flight = self.recv_buffer.split_to(flight_len);
            self.verify_server_flight(&flight)?;
            self.phase = Phase::Established;
            log::trace!("[OBFS] tls server hello verified ({} bytes)", flight_len);
        }

        self.drain_application_data()
    }

    fn mode(&self) -> ObfsMode {
        ObfsMode::TlsTicketAuth
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 32] = [0x42; 32];

    fn context(param: Option<&str>) -> ObfsContext {
        ObfsContext {
            host: "203.0.113.7".into(),
            port: 443,
            param: param.map(str::to_string),
            key: KEY.to_vec(),
            iv_len: 16,
            head_len: 7,
        }
    }

    /// Server hello flight as an SSR relay would send it
    fn server_flight(client_id: &[u8]) -> Vec<u8> {
        let mut hello_body = vec![0x02, 0x00, 0x00, 0x46, 0x03, 0x03];
        let mut random = vec![0x11u8; 22];
        let tag = auth_tag(&KEY, client_id, &[&random]).unwrap();
        random.extend_from_slice(&tag);
        hello_body.extend(random);
        hello_body.push(0x20);
        hello_body.extend_from_slice(client_id);
        hello_body.extend_from_slice(&[0xc0, 0x2f, 0x00, 0x00, 0x00]);

        let mut flight = record(TlsContentType::Handshake, TLS_VERSION, &hello_body);
        flight.extend(record(TlsContentType::ChangeCipherSpec, TLS_VERSION, &[0x01]));
        flight.push(0x16);
        flight.extend_from_slice(&TLS_VERSION);
        flight.extend_from_slice(&[0x00, 0x20]);
        flight.extend_from_slice(&[0x33u8; 22]);
        let tag = auth_tag(&KEY, client_id, &[&flight]).unwrap();
        flight.extend_from_slice(&tag);
        flight
    }

    #[test]
    fn test_first_write_is_full_client_flight() {
        let mut obfs = TlsTicketAuth::new(context(Some("cloudflare.com")));
        let client_id = *obfs.client_id();
        let wire = obfs.obfuscate(b"ciphertext").unwrap();

        // ClientHello record
        assert_eq!(&wire[..3], &[0x16, 0x03, 0x01]);
        let hello_len = u16::from_be_bytes([wire[3], wire[4]]) as usize;
        let hello = &wire[5..5 + hello_len];
        assert_eq!(hello[0], 0x01);
        assert_eq!(&hello[4..6], &TLS_VERSION);

        // random carries an authenticated timestamp
        let random = &hello[6..38];
        let tag = auth_tag(&KEY, &client_id, &[&random[..22]]).unwrap();
        assert_eq!(&random[22..], &tag);
        assert_eq!(hello[38], 32);
        assert_eq!(&hello[39..71], &client_id);
        assert!(wire.windows(14).any(|w| w == b"cloudflare.com"));

        // ChangeCipherSpec + Finished
        let rest = &wire[5 + hello_len..];
        assert_eq!(&rest[..6], &[0x14, 0x03, 0x03, 0x00, 0x01, 0x01]);
        assert_eq!(&rest[6..11], &[0x16, 0x03, 0x03, 0x00, 0x20]);
        let finished_end = 6 + 5 + 32;
        let tag = auth_tag(&KEY, &client_id, &[&rest[..finished_end - HMAC_LEN]]).unwrap();
        assert_eq!(&rest[finished_end - HMAC_LEN..finished_end], &tag);

        // application data
        let mut expected = vec![0x17, 0x03, 0x03, 0x00, 0x0a];
        expected.extend_from_slice(b"ciphertext");
        assert_eq!(&rest[finished_end..], &expected[..]);
    }

    #[test]
    fn test_ip_host_sends_empty_sni() {
        let obfs = TlsTicketAuth::new(context(None));
        assert_eq!(obfs.sni_host(), "");
    }

    #[test]
    fn test_later_writes_are_records() {
        let mut obfs = TlsTicketAuth::new(context(None));
        obfs.obfuscate(b"").unwrap();
        assert_eq!(obfs.obfuscate(b"abc").unwrap(), vec![0x17, 3, 3, 0, 3, b'a', b'b', b'c']);
        assert!(obfs.obfuscate(b"").unwrap().is_empty());
    }

    #[test]
    fn test_fragmentation() {
        let data = vec![0x5a; 10_000];
        let wire = wrap_application_data(&data);
        let mut pos = 0;
        let mut payload = Vec::new();
        while pos < wire.len() {
            assert_eq!(wire[pos], 0x17);
            let size = u16::from_be_bytes([wire[pos + 3], wire[pos + 4]]) as usize;
            assert!(size <= 4096 + 100);
            payload.extend_from_slice(&wire[pos + 5..pos + 5 + size]);
            pos += 5 + size;
        }
        assert_eq!(payload, data);
    }

    #[test]
    fn test_server_flight_then_data_across_reads() {
        let mut obfs = TlsTicketAuth::new(context(None));
        obfs.obfuscate(b"hello").unwrap();
        let client_id = *obfs.client_id();

        let mut wire = server_flight(&client_id);
        wire.extend(wrap_application_data(b"response body"));

        let (a, b) = wire.split_at(20);
        let (b, c) = b.split_at(b.len() - 6);
        assert!(obfs.deobfuscate(a).unwrap().is_empty());
        let mut out = obfs.deobfuscate(b).unwrap();
        out.extend(obfs.deobfuscate(c).unwrap());
        assert_eq!(out, b"response body");
    }

    #[test]
    fn test_forged_server_hello_rejected() {
        let mut obfs = TlsTicketAuth::new(context(None));
        obfs.obfuscate(b"hello").unwrap();

        let wire = server_flight(&[0u8; CLIENT_ID_LEN]);
        assert!(matches!(
            obfs.deobfuscate(&wire),
            Err(SsrError::OperationFailed(_))
        ));
    }

    #[test]
    fn test_unexpected_record_rejected() {
        let mut obfs = TlsTicketAuth::new(context(None));
        obfs.obfuscate(b"hello").unwrap();
        assert!(obfs.deobfuscate(&[0x15, 0x03, 0x03, 0x00, 0x02, 0x02, 0x28]).is_err());
    }
}
