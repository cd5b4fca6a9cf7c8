//! HTTP disguise (`http_simple`, `http_post`)
//!
//! The first outbound chunk becomes an HTTP request whose path carries the
//! leading ciphertext bytes percent-encoded:
//!
//! ```text
//! GET /%3f%a1%09... HTTP/1.1\r\n
//! Host: cdn.example.com:8388\r\n
//! User-Agent: ...\r\n
//! \r\n
//! <remaining ciphertext>
//! ```
//!
//! Inbound, everything up to the first blank line is the fake response head
//! and is dropped. After that both directions are pass-through.

use super::{ObfsContext, ObfsMode, Obfuscator};
use crate::Result;
use rand::seq::SliceRandom;
use rand::Rng;
use std::fmt::Write;

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/115.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:109.0) Gecko/20100101 Firefox/115.0",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 17_1 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Mobile/15E148 Safari/604.1",
];

const ACCEPT_HEADERS: &str = "Accept: text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8\r\n\
                              Accept-Language: en-US,en;q=0.8\r\n\
                              Accept-Encoding: gzip, deflate\r\n";

/// Extra random bytes that may ride in the URL beyond IV and header
const MAX_EXTRA_HEAD: usize = 64;

const HEADER_END: &[u8] = b"\r\n\r\n";

/// Cap on a fake response head before giving up
const MAX_RESPONSE_HEAD: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

pub struct HttpObfs {
    ctx: ObfsContext,
    method: HttpMethod,
    header_sent: bool,
    header_received: bool,
    /// Partial response head awaiting its terminator
    pending: Vec<u8>,
}

impl HttpObfs {
    pub fn new(ctx: ObfsContext, method: HttpMethod) -> Self {
        Self {
            ctx,
            method,
            header_sent: false,
            header_received: false,
            pending: Vec::new(),
        }
    }

    fn percent_encode(data: &[u8]) -> String {
        let mut out = String::with_capacity(data.len() * 3);
        for byte in data {
            // writing into a String cannot fail
            let _ = write!(out, "%{:02x}", byte);
        }
        out
    }

    fn boundary() -> String {
        let mut rng = rand::thread_rng();
        let suffix: String = (0..16)
            .map(|_| rng.sample(rand::distributions::Alphanumeric) as char)
            .collect();
        format!("----WebKitFormBoundary{}", suffix)
    }

    fn request_head(&self, url_bytes: &[u8]) -> String {
        let mut rng = rand::thread_rng();
        let hosts = self.ctx.hosts();
        let host = hosts.choose(&mut rng).cloned().unwrap_or_default();
        let port = if self.ctx.port == 80 {
            String::new()
        } else {
            format!(":{}", self.ctx.port)
        };
        let verb = match self.method {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
        };

        let mut head = format!(
            "{} /{} HTTP/1.1\r\nHost: {}{}\r\n",
            verb,
            Self::percent_encode(url_bytes),
            host,
            port
        );

        match self.ctx.custom_headers() {
            Some(custom) => {
                head.push_str(&custom);
                head.push_str("\r\n\r\n");
            }
            None => {
                let agent = USER_AGENTS.choose(&mut rng).copied().unwrap_or(USER_AGENTS[0]);
                head.push_str("User-Agent: ");
                head.push_str(agent);
                head.push_str("\r\n");
                head.push_str(ACCEPT_HEADERS);
                if self.method == HttpMethod::Post {
                    head.push_str("Content-Type: multipart/form-data; boundary=");
                    head.push_str(&Self::boundary());
                    head.push_str("\r\n");
                }
                head.push_str("DNT: 1\r\nConnection: keep-alive\r\n\r\n");
            }
        }
        head
    }
}

impl Obfuscator for HttpObfs {
    fn obfuscate(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        if self.header_sent {
            return Ok(data.to_vec());
        }

        let head_size = self.ctx.iv_len + self.ctx.head_len;
        let url_len = if data.len() > head_size + MAX_EXTRA_HEAD {
            head_size + rand::thread_rng().gen_range(0..=MAX_EXTRA_HEAD)
        } else {
            data.len()
        };

        let (url_bytes, rest) = data.split_at(url_len);
        let head = self.request_head(url_bytes);
        self.header_sent = true;

        let mut out = Vec::with_capacity(head.len() + rest.len());
        out.extend_from_slice(head.as_bytes());
        out.extend_from_slice(rest);
        Ok(out)
    }

    fn deobfuscate(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        if self.header_received {
            return Ok(data.to_vec());
        }

        self.pending.extend_from_slice(data);
        match self
            .pending
            .windows(HEADER_END.len())
            .position(|w| w == HEADER_END)
        {
            Some(pos) => {
                self.header_received = true;
                let body = self.pending.split_off(pos + HEADER_END.len());
                self.pending = Vec::new();
                Ok(body)
            }
            None if self.pending.len() > MAX_RESPONSE_HEAD => Err(crate::SsrError::OperationFailed(
                "http obfs response head too large".into(),
            )),
            None => Ok(Vec::new()),
        }
    }

    fn mode(&self) -> ObfsMode {
        match self.method {
            HttpMethod::Get => ObfsMode::HttpSimple,
            HttpMethod::Post => ObfsMode::HttpPost,
        }
    }
}
