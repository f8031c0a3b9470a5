//! PROXY protocol v1/v2 support.
//!
//! When tidegate runs behind HAProxy or a cloud load balancer, the real
//! client address arrives in a PROXY header ahead of the SSH stream.
//! The parsers here are pure over byte slices; the stream reader peeks
//! to detect the header without consuming SSH bytes when none is
//! present.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use tidegate_core::pattern_matches;

/// v2 signature: `\r\n\r\n\0\r\nQUIT\n`
const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];

/// Longest possible v1 line including CRLF
const V1_MAX_LINE: usize = 107;

/// Header handling policy derived from the configuration
#[derive(Debug, Clone)]
pub enum ProxyPolicy {
    /// Never read a header
    Disabled,
    /// Use the header when the upstream is allowed, ignore it otherwise
    Optional { allowed: Vec<String> },
    /// Demand a header; reject upstreams not in the non-empty list
    Required { allowed: Vec<String> },
}

impl ProxyPolicy {
    pub fn from_config(proxy_protocol: u8, allowed: &[String]) -> Self {
        match proxy_protocol {
            1 => ProxyPolicy::Optional {
                allowed: allowed.to_vec(),
            },
            2 => ProxyPolicy::Required {
                allowed: allowed.to_vec(),
            },
            _ => ProxyPolicy::Disabled,
        }
    }

    fn upstream_allowed(&self, upstream: IpAddr) -> bool {
        let list = match self {
            ProxyPolicy::Disabled => return false,
            ProxyPolicy::Optional { allowed } => allowed,
            ProxyPolicy::Required { allowed } => allowed,
        };
        if list.is_empty() {
            // optional mode trusts nobody by default, required mode
            // demands the header from everybody
            return matches!(self, ProxyPolicy::Required { .. });
        }
        let upstream = upstream.to_string();
        list.iter().any(|pattern| pattern_matches(pattern, &upstream))
    }
}

/// Read an optional PROXY header from the socket front. Returns the
/// advertised source address when a header was present and trusted.
pub async fn read_proxy_header(
    stream: &mut TcpStream,
    policy: &ProxyPolicy,
    upstream: IpAddr,
) -> Result<Option<SocketAddr>> {
    if matches!(policy, ProxyPolicy::Disabled) {
        return Ok(None);
    }
    let mut probe = [0u8; 12];
    let n = stream
        .peek(&mut probe)
        .await
        .map_err(|e| Error::Connection(format!("peek failed: {}", e)))?;

    let has_v2 = n >= 12 && probe == V2_SIGNATURE;
    let has_v1 = n >= 6 && &probe[..6] == b"PROXY ";

    if !has_v1 && !has_v2 {
        return match policy {
            ProxyPolicy::Required { .. } => Err(Error::Connection(
                "proxy protocol header required but missing".to_string(),
            )),
            _ => Ok(None),
        };
    }

    let source = if has_v2 {
        read_v2(stream).await?
    } else {
        read_v1(stream).await?
    };

    if !policy.upstream_allowed(upstream) {
        return match policy {
            ProxyPolicy::Required { .. } => {
                warn!(%upstream, "proxy header from a disallowed upstream");
                Err(Error::Connection(format!(
                    "proxy header not allowed from {}",
                    upstream
                )))
            }
            _ => {
                // header consumed but not trusted
                debug!(%upstream, "ignoring proxy header from untrusted upstream");
                Ok(None)
            }
        };
    }
    Ok(source)
}

async fn read_v1(stream: &mut TcpStream) -> Result<Option<SocketAddr>> {
    let mut line = Vec::with_capacity(V1_MAX_LINE);
    loop {
        let mut byte = [0u8; 1];
        stream
            .read_exact(&mut byte)
            .await
            .map_err(|e| Error::Connection(format!("proxy header read failed: {}", e)))?;
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > V1_MAX_LINE {
            return Err(Error::Protocol("proxy v1 line too long".to_string()));
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    let line = String::from_utf8(line)
        .map_err(|_| Error::Protocol("proxy v1 line is not ASCII".to_string()))?;
    parse_v1_line(&line)
}

async fn read_v2(stream: &mut TcpStream) -> Result<Option<SocketAddr>> {
    let mut header = [0u8; 16];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|e| Error::Connection(format!("proxy header read failed: {}", e)))?;
    let len = u16::from_be_bytes([header[14], header[15]]) as usize;
    let mut payload = vec![0u8; len];
    stream
        .read_exact(&mut payload)
        .await
        .map_err(|e| Error::Connection(format!("proxy payload read failed: {}", e)))?;
    parse_v2(&header, &payload)
}

/// Parse a v1 line without its CRLF, e.g.
/// `PROXY TCP4 192.168.0.1 192.168.0.11 56324 443`
pub fn parse_v1_line(line: &str) -> Result<Option<SocketAddr>> {
    let parts: Vec<&str> = line.split(' ').collect();
    if parts.first() != Some(&"PROXY") {
        return Err(Error::Protocol("missing PROXY prefix".to_string()));
    }
    match parts.get(1) {
        Some(&"UNKNOWN") => Ok(None),
        Some(&"TCP4") | Some(&"TCP6") => {
            if parts.len() != 6 {
                return Err(Error::Protocol(format!("malformed proxy v1 line: {}", line)));
            }
            let ip: IpAddr = parts[2]
                .parse()
                .map_err(|_| Error::Protocol(format!("invalid source address {}", parts[2])))?;
            let port: u16 = parts[4]
                .parse()
                .map_err(|_| Error::Protocol(format!("invalid source port {}", parts[4])))?;
            Ok(Some(SocketAddr::new(ip, port)))
        }
        _ => Err(Error::Protocol(format!("invalid proxy v1 family: {}", line))),
    }
}

/// Parse a v2 binary header (16 bytes) and its address payload
pub fn parse_v2(header: &[u8], payload: &[u8]) -> Result<Option<SocketAddr>> {
    if header.len() < 16 || header[..12] != V2_SIGNATURE {
        return Err(Error::Protocol("invalid proxy v2 signature".to_string()));
    }
    let ver_cmd = header[12];
    if ver_cmd >> 4 != 0x2 {
        return Err(Error::Protocol(format!(
            "unsupported proxy v2 version {:#04x}",
            ver_cmd
        )));
    }
    // LOCAL command: health checks and the like carry no address
    if ver_cmd & 0x0F == 0x0 {
        return Ok(None);
    }
    let family = header[13] >> 4;
    match family {
        // AF_INET: src(4) dst(4) src_port(2) dst_port(2)
        0x1 => {
            if payload.len() < 12 {
                return Err(Error::Protocol("short proxy v2 ipv4 payload".to_string()));
            }
            let ip = Ipv4Addr::new(payload[0], payload[1], payload[2], payload[3]);
            let port = u16::from_be_bytes([payload[8], payload[9]]);
            Ok(Some(SocketAddr::new(IpAddr::V4(ip), port)))
        }
        // AF_INET6: src(16) dst(16) src_port(2) dst_port(2)
        0x2 => {
            if payload.len() < 36 {
                return Err(Error::Protocol("short proxy v2 ipv6 payload".to_string()));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&payload[..16]);
            let ip = Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([payload[32], payload[33]]);
            Ok(Some(SocketAddr::new(IpAddr::V6(ip), port)))
        }
        0x0 => Ok(None),
        other => Err(Error::Protocol(format!(
            "unsupported proxy v2 family {:#03x}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_v1_tcp4() {
        let addr = parse_v1_line("PROXY TCP4 192.168.0.1 192.168.0.11 56324 443")
            .unwrap()
            .unwrap();
        assert_eq!(addr, "192.168.0.1:56324".parse().unwrap());
    }

    #[test]
    fn test_parse_v1_tcp6() {
        let addr = parse_v1_line("PROXY TCP6 2001:db8::1 2001:db8::2 4000 22")
            .unwrap()
            .unwrap();
        assert_eq!(addr.port(), 4000);
        assert!(addr.ip().is_ipv6());
    }

    #[test]
    fn test_parse_v1_unknown_and_errors() {
        assert!(parse_v1_line("PROXY UNKNOWN").unwrap().is_none());
        assert!(parse_v1_line("NOPROXY TCP4 1 2 3 4").is_err());
        assert!(parse_v1_line("PROXY TCP4 bad addr 1 2").is_err());
        assert!(parse_v1_line("PROXY TCP4 192.168.0.1 192.168.0.2 1").is_err());
    }

    #[test]
    fn test_parse_v2_ipv4() {
        let mut header = Vec::from(V2_SIGNATURE);
        header.push(0x21); // v2, PROXY
        header.push(0x11); // INET, STREAM
        header.extend_from_slice(&12u16.to_be_bytes());
        let mut payload = vec![10, 0, 0, 7, 10, 0, 0, 1];
        payload.extend_from_slice(&55000u16.to_be_bytes());
        payload.extend_from_slice(&22u16.to_be_bytes());

        let addr = parse_v2(&header, &payload).unwrap().unwrap();
        assert_eq!(addr, "10.0.0.7:55000".parse().unwrap());
    }

    #[test]
    fn test_parse_v2_local_command() {
        let mut header = Vec::from(V2_SIGNATURE);
        header.push(0x20); // v2, LOCAL
        header.push(0x00);
        header.extend_from_slice(&0u16.to_be_bytes());
        assert!(parse_v2(&header, &[]).unwrap().is_none());
    }

    #[test]
    fn test_parse_v2_rejects_bad_version() {
        let mut header = Vec::from(V2_SIGNATURE);
        header.push(0x31);
        header.push(0x11);
        header.extend_from_slice(&0u16.to_be_bytes());
        assert!(parse_v2(&header, &[]).is_err());
    }

    #[test]
    fn test_policy_allowed_lists() {
        let policy = ProxyPolicy::from_config(1, &["10.0.0.*".to_string()]);
        assert!(policy.upstream_allowed("10.0.0.9".parse().unwrap()));
        assert!(!policy.upstream_allowed("10.0.1.9".parse().unwrap()));

        // required mode with an empty list accepts any upstream
        let policy = ProxyPolicy::from_config(2, &[]);
        assert!(policy.upstream_allowed("203.0.113.5".parse().unwrap()));

        // optional mode with an empty list trusts nobody
        let policy = ProxyPolicy::from_config(1, &[]);
        assert!(!policy.upstream_allowed("203.0.113.5".parse().unwrap()));

        let policy = ProxyPolicy::from_config(0, &[]);
        assert!(matches!(policy, ProxyPolicy::Disabled));
    }
}
