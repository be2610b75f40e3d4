//! Proxy-Protocol-v2 parsing and the fronting TCP bridge.
//!
//! When proxy enforcement is on, this bridge owns the public port. Each
//! connection must open with one or more stacked v2 headers; the last
//! PROXY-command header names the real client. The HTTP head is then
//! rewritten (fresh `X-Forwarded-For` / `X-Real-IP`) and the connection is
//! relayed byte-for-byte to the internal HTTP listener.

use anyhow::{Context, Result, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// v2 signature preceding every header.
pub const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Upper bound on stacked v2 headers per connection.
pub const MAX_PROXY_CHAIN: usize = 32;
/// Upper bound on the buffered HTTP head while splicing.
pub const MAX_HTTP_HEAD: usize = 128 * 1024;

const CANNED_400: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\
Content-Type: text/html; charset=utf-8\r\n\
Connection: close\r\n\
Content-Length: 93\r\n\
\r\n\
<html><head><title>400</title></head><body><h1>400 Bad Request</h1><p>proxy</p></body></html>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum V2Command {
    Local,
    Proxy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum V2Family {
    Unspec,
    Inet,
    Inet6,
    Unix,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum V2Protocol {
    Unspec,
    Stream,
    Dgram,
}

/// One parsed v2 header.
#[derive(Debug, Clone)]
pub struct ProxyV2Header {
    pub command: V2Command,
    pub family: V2Family,
    pub protocol: V2Protocol,
    pub source: Option<SocketAddr>,
    pub destination: Option<SocketAddr>,
    pub header_len: usize,
}

/// Parse a single v2 header at the start of `buf`. `Ok(None)` means more
/// bytes are needed; `Err` means the bytes are not a v2 header.
pub fn parse_v2_header(buf: &[u8]) -> Result<Option<ProxyV2Header>> {
    if buf.len() < V2_SIGNATURE.len() {
        if V2_SIGNATURE.starts_with(buf) {
            return Ok(None);
        }
        bail!("not a proxy-v2 signature");
    }
    if buf[..12] != V2_SIGNATURE {
        bail!("not a proxy-v2 signature");
    }
    if buf.len() < 16 {
        return Ok(None);
    }

    let ver_cmd = buf[12];
    if (ver_cmd & 0xF0) >> 4 != 2 {
        bail!("unsupported proxy protocol version {}", (ver_cmd & 0xF0) >> 4);
    }
    let command = match ver_cmd & 0x0F {
        0 => V2Command::Local,
        1 => V2Command::Proxy,
        other => bail!("unsupported proxy command {other}"),
    };
    let fam_proto = buf[13];
    let family = match (fam_proto & 0xF0) >> 4 {
        0 => V2Family::Unspec,
        1 => V2Family::Inet,
        2 => V2Family::Inet6,
        3 => V2Family::Unix,
        other => bail!("unsupported address family {other}"),
    };
    let protocol = match fam_proto & 0x0F {
        0 => V2Protocol::Unspec,
        1 => V2Protocol::Stream,
        2 => V2Protocol::Dgram,
        other => bail!("unsupported transport protocol {other}"),
    };

    let addr_len = u16::from_be_bytes([buf[14], buf[15]]) as usize;
    let header_len = 16 + addr_len;
    if buf.len() < header_len {
        return Ok(None);
    }
    let data = &buf[16..header_len];

    let (source, destination) = match (command, family) {
        (V2Command::Proxy, V2Family::Inet) => {
            if data.len() < 12 {
                bail!("short inet address block");
            }
            let src = Ipv4Addr::new(data[0], data[1], data[2], data[3]);
            let dst = Ipv4Addr::new(data[4], data[5], data[6], data[7]);
            let src_port = u16::from_be_bytes([data[8], data[9]]);
            let dst_port = u16::from_be_bytes([data[10], data[11]]);
            (
                Some(SocketAddr::new(IpAddr::V4(src), src_port)),
                Some(SocketAddr::new(IpAddr::V4(dst), dst_port)),
            )
        }
        (V2Command::Proxy, V2Family::Inet6) => {
            if data.len() < 36 {
                bail!("short inet6 address block");
            }
            let mut src = [0u8; 16];
            src.copy_from_slice(&data[0..16]);
            let mut dst = [0u8; 16];
            dst.copy_from_slice(&data[16..32]);
            let src_port = u16::from_be_bytes([data[32], data[33]]);
            let dst_port = u16::from_be_bytes([data[34], data[35]]);
            (
                Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(src)), src_port)),
                Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(dst)), dst_port)),
            )
        }
        _ => (None, None),
    };

    Ok(Some(ProxyV2Header {
        command,
        family,
        protocol,
        source,
        destination,
        header_len,
    }))
}

/// Parse a chain of stacked v2 headers. Returns the authoritative client
/// address (last PROXY header's source) and the bytes consumed. `Ok(None)`
/// means more bytes are needed to finish the chain.
pub fn parse_v2_chain(buf: &[u8]) -> Result<Option<(Option<SocketAddr>, usize)>> {
    let mut offset = 0;
    let mut client = None;
    let mut headers = 0;

    loop {
        let rest = &buf[offset..];
        let sig_prefix = rest.len() >= 12 && rest[..12] == V2_SIGNATURE
            || rest.len() < 12 && V2_SIGNATURE.starts_with(rest) && !rest.is_empty();
        if !sig_prefix {
            if headers == 0 {
                bail!("not a proxy-v2 signature");
            }
            return Ok(Some((client, offset)));
        }
        match parse_v2_header(rest)? {
            None => return Ok(None),
            Some(header) => {
                headers += 1;
                if headers > MAX_PROXY_CHAIN {
                    bail!("proxy-v2 chain too long");
                }
                if header.command == V2Command::Proxy
                    && let Some(source) = header.source
                {
                    client = Some(source);
                }
                offset += header.header_len;
            }
        }
        if offset == buf.len() {
            // Could be the end of the chain or another stacked header; the
            // caller must supply more bytes to decide.
            return Ok(None);
        }
    }
}

/// Decode the `X-Proxy-Protocol-V2` header value (base64 or hex) and pull
/// the client address out of the embedded chain.
pub fn client_from_header_value(value: &str) -> Option<IpAddr> {
    let bytes = STANDARD
        .decode(value.trim())
        .ok()
        .or_else(|| crate::auth::hex_decode(value.trim()))?;
    match parse_v2_chain(&bytes) {
        Ok(Some((Some(addr), _))) => Some(addr.ip()),
        // A complete chain is required here; an exactly-chain-length buffer
        // reports "need more", so retry with a sentinel byte appended.
        Ok(None) => {
            let mut padded = bytes.clone();
            padded.push(0);
            match parse_v2_chain(&padded) {
                Ok(Some((Some(addr), consumed))) if consumed == bytes.len() => Some(addr.ip()),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Fronting TCP bridge; relays each connection to the internal HTTP target.
pub struct ProxyBridge {
    listener: TcpListener,
    target: SocketAddr,
}

impl ProxyBridge {
    pub async fn bind(addr: SocketAddr, target: SocketAddr) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, %target, "proxy bridge listening");
        Ok(Self { listener, target })
    }

    pub async fn run(self) -> std::io::Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let target = self.target;
                    tokio::spawn(async move {
                        if let Err(err) = relay(stream, peer, target).await {
                            debug!(%peer, error = %err, "bridge connection ended");
                        }
                    });
                }
                Err(err) => {
                    error!(error = %err, "bridge accept failed");
                }
            }
        }
    }
}

async fn relay(mut inbound: TcpStream, peer: SocketAddr, target: SocketAddr) -> Result<()> {
    let mut buf: Vec<u8> = Vec::with_capacity(4096);

    // Enough bytes to judge the signature.
    while buf.len() < 16 {
        if !read_some(&mut inbound, &mut buf).await? {
            break;
        }
    }
    if buf.len() < 12 || buf[..12] != V2_SIGNATURE {
        warn!(%peer, "non proxy-v2 prefix rejected");
        let _ = inbound.write_all(CANNED_400).await;
        return Ok(());
    }

    // Consume the header chain, pulling more bytes as needed.
    let (client, consumed) = loop {
        match parse_v2_chain(&buf)? {
            Some(done) => break done,
            None => {
                if !read_some(&mut inbound, &mut buf).await? {
                    bail!("connection closed inside proxy-v2 chain");
                }
            }
        }
    };
    buf.drain(..consumed);
    let client_ip = client.map(|addr| addr.ip()).unwrap_or(peer.ip());

    // Buffer the HTTP head up to the blank line.
    let head_end = loop {
        if let Some(pos) = find_head_end(&buf) {
            break pos;
        }
        if buf.len() > MAX_HTTP_HEAD {
            bail!("http head exceeds budget");
        }
        if !read_some(&mut inbound, &mut buf).await? {
            bail!("connection closed before http head completed");
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let pending = buf.split_off(head_end + 4);
    let rewritten = rewrite_head(&head, client_ip);

    let mut outbound = TcpStream::connect(target)
        .await
        .context("connect internal http target")?;
    outbound.write_all(rewritten.as_bytes()).await?;
    outbound.write_all(b"\r\n\r\n").await?;
    if !pending.is_empty() {
        outbound.write_all(&pending).await?;
    }

    tokio::io::copy_bidirectional(&mut inbound, &mut outbound)
        .await
        .context("relay")?;
    Ok(())
}

async fn read_some(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Result<bool> {
    let mut chunk = [0u8; 4096];
    let n = stream.read(&mut chunk).await?;
    if n == 0 {
        return Ok(false);
    }
    buf.extend_from_slice(&chunk[..n]);
    Ok(true)
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

/// Rebuild the head with any inbound forwarding headers stripped and fresh
/// ones naming the parsed client.
fn rewrite_head(head: &str, client: IpAddr) -> String {
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let mut rewritten = String::with_capacity(head.len() + 64);
    rewritten.push_str(request_line);
    for line in lines {
        let lowered = line.to_ascii_lowercase();
        if lowered.starts_with("x-forwarded-for:") || lowered.starts_with("x-real-ip:") {
            continue;
        }
        rewritten.push_str("\r\n");
        rewritten.push_str(line);
    }
    rewritten.push_str(&format!("\r\nX-Forwarded-For: {client}"));
    rewritten.push_str(&format!("\r\nX-Real-IP: {client}"));
    rewritten
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v2_header(cmd: u8, src: [u8; 4], src_port: u16) -> Vec<u8> {
        let mut buf = V2_SIGNATURE.to_vec();
        buf.push(0x20 | cmd);
        buf.push(0x11); // INET / STREAM
        buf.extend_from_slice(&12u16.to_be_bytes());
        buf.extend_from_slice(&src);
        buf.extend_from_slice(&[10, 0, 0, 1]); // dst
        buf.extend_from_slice(&src_port.to_be_bytes());
        buf.extend_from_slice(&80u16.to_be_bytes());
        buf
    }

    #[test]
    fn parses_single_proxy_header() {
        let buf = v2_header(1, [203, 0, 113, 7], 51234);
        let header = parse_v2_header(&buf).expect("parse").expect("complete");
        assert_eq!(header.command, V2Command::Proxy);
        assert_eq!(header.family, V2Family::Inet);
        assert_eq!(header.protocol, V2Protocol::Stream);
        assert_eq!(
            header.source.expect("source").to_string(),
            "203.0.113.7:51234"
        );
        assert_eq!(header.header_len, 28);
    }

    #[test]
    fn incomplete_header_requests_more_bytes() {
        let buf = v2_header(1, [1, 2, 3, 4], 1);
        assert!(parse_v2_header(&buf[..10]).expect("prefix").is_none());
        assert!(parse_v2_header(&buf[..20]).expect("truncated").is_none());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_v2_header(b"GET / HTTP/1.1\r\n").is_err());
    }

    #[test]
    fn chain_takes_last_proxy_source() {
        let mut buf = v2_header(1, [192, 0, 2, 1], 1111);
        buf.extend_from_slice(&v2_header(1, [198, 51, 100, 9], 2222));
        buf.extend_from_slice(b"GET / HTTP/1.1\r\n\r\n");

        let (client, consumed) = parse_v2_chain(&buf).expect("parse").expect("complete");
        assert_eq!(
            client.expect("client").to_string(),
            "198.51.100.9:2222"
        );
        assert_eq!(consumed, 56);
    }

    #[test]
    fn local_command_falls_back_to_no_client() {
        let mut buf = v2_header(0, [0, 0, 0, 0], 0);
        buf.extend_from_slice(b"GET / HTTP/1.1\r\n\r\n");
        let (client, _) = parse_v2_chain(&buf).expect("parse").expect("complete");
        assert!(client.is_none());
    }

    #[test]
    fn overlong_chain_is_rejected() {
        let one = v2_header(1, [1, 2, 3, 4], 5);
        let mut buf = Vec::new();
        for _ in 0..(MAX_PROXY_CHAIN + 1) {
            buf.extend_from_slice(&one);
        }
        buf.extend_from_slice(b"GET / HTTP/1.1\r\n\r\n");
        assert!(parse_v2_chain(&buf).is_err());
    }

    #[test]
    fn header_value_decodes_base64_and_hex() {
        let raw = v2_header(1, [203, 0, 113, 42], 4000);
        let b64 = STANDARD.encode(&raw);
        assert_eq!(
            client_from_header_value(&b64).expect("base64").to_string(),
            "203.0.113.42"
        );
        let hex = crate::auth::hex_encode(&raw);
        assert_eq!(
            client_from_header_value(&hex).expect("hex").to_string(),
            "203.0.113.42"
        );
        assert!(client_from_header_value("not-a-header").is_none());
    }

    #[test]
    fn canned_response_length_matches_body() {
        let text = std::str::from_utf8(CANNED_400).expect("ascii");
        let (head, body) = text.split_once("\r\n\r\n").expect("head/body split");
        let declared: usize = head
            .lines()
            .find_map(|line| line.strip_prefix("Content-Length: "))
            .expect("content-length header")
            .trim()
            .parse()
            .expect("numeric");
        assert_eq!(declared, body.len());
    }

    #[test]
    fn rewrite_head_replaces_forwarding_headers() {
        let head = "GET /api/list HTTP/1.1\r\nHost: share\r\nX-Forwarded-For: 6.6.6.6\r\nx-real-ip: 6.6.6.6\r\nAccept: */*";
        let out = rewrite_head(head, "203.0.113.7".parse().unwrap());
        assert!(out.contains("Host: share"));
        assert!(out.contains("Accept: */*"));
        assert!(!out.contains("6.6.6.6"));
        assert!(out.contains("X-Forwarded-For: 203.0.113.7"));
        assert!(out.contains("X-Real-IP: 203.0.113.7"));
    }
}
