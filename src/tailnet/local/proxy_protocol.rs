//! PROXY protocol v1 header parsing.
//!
//! tailscaled forwards serve connections from loopback; the header it
//! prepends carries the address of the actual caller.

use std::io;
use std::net::{IpAddr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Longest v1 header allowed, including the trailing CRLF.
const MAX_HEADER_LEN: usize = 107;

/// Parse one header line, without its CRLF. `UNKNOWN` yields `None`.
pub fn parse_v1(line: &str) -> io::Result<Option<SocketAddr>> {
    let mut fields = line.split(' ');
    if fields.next() != Some("PROXY") {
        return Err(invalid("missing PROXY signature"));
    }

    match fields.next() {
        Some("TCP4") | Some("TCP6") => {}
        Some("UNKNOWN") => return Ok(None),
        _ => return Err(invalid("unsupported protocol family")),
    }

    let src: IpAddr = fields
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| invalid("bad source address"))?;
    let _dst: IpAddr = fields
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| invalid("bad destination address"))?;
    let src_port: u16 = fields
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| invalid("bad source port"))?;

    Ok(Some(SocketAddr::new(src, src_port)))
}

/// Read a v1 header from the front of `stream`, leaving the payload unread.
pub async fn read_v1<S>(stream: &mut S) -> io::Result<Option<SocketAddr>>
where
    S: AsyncRead + Unpin,
{
    let mut line = Vec::with_capacity(MAX_HEADER_LEN);
    loop {
        let byte = stream.read_u8().await?;
        line.push(byte);
        if line.ends_with(b"\r\n") {
            break;
        }
        if line.len() >= MAX_HEADER_LEN {
            return Err(invalid("header too long"));
        }
    }
    line.truncate(line.len() - 2);

    let line = std::str::from_utf8(&line).map_err(|_| invalid("header is not ASCII"))?;
    parse_v1(line)
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("PROXY header: {}", msg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp4() {
        let addr = parse_v1("PROXY TCP4 100.64.0.7 127.0.0.1 51234 443").unwrap();
        assert_eq!(addr, Some("100.64.0.7:51234".parse().unwrap()));
    }

    #[test]
    fn test_parse_tcp6() {
        let addr = parse_v1("PROXY TCP6 fd7a:115c:a1e0::7 ::1 51234 443").unwrap();
        assert_eq!(addr, Some("[fd7a:115c:a1e0::7]:51234".parse().unwrap()));
    }

    #[test]
    fn test_parse_unknown() {
        assert_eq!(parse_v1("PROXY UNKNOWN").unwrap(), None);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_v1("GET / HTTP/1.1").is_err());
        assert!(parse_v1("PROXY UDP4 1.2.3.4 5.6.7.8 1 2").is_err());
        assert!(parse_v1("PROXY TCP4 nope 127.0.0.1 1 2").is_err());
    }

    #[tokio::test]
    async fn test_read_leaves_payload() {
        let mut input: &[u8] = b"PROXY TCP4 100.64.0.7 127.0.0.1 51234 443\r\nGET / HTTP/1.1\r\n";
        let addr = read_v1(&mut input).await.unwrap();
        assert_eq!(addr, Some("100.64.0.7:51234".parse().unwrap()));
        assert_eq!(input, b"GET / HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn test_read_rejects_overlong_header() {
        let long = format!("PROXY TCP4 {}\r\n", "1".repeat(200));
        let mut input = long.as_bytes();
        assert!(read_v1(&mut input).await.is_err());
    }
}
