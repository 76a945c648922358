//! Destination handshake carried at the start of every tunneled stream
//!
//! The opening side (the relay) writes a minimal HTTP/1.x request naming the
//! destination authority and the original requester; the accepting side (the
//! agent) answers with a bare `200` response before any payload bytes flow.
//!
//! ```text
//! CONNECT db.internal:5432 HTTP/1.1
//! Host: db.internal:5432
//! Forwarded: for="203.0.113.7:51234"
//!
//! HTTP/1.1 200 OK
//! ```

use bytes::{Bytes, BytesMut};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::MAX_HANDSHAKE_SIZE;

/// Maximum number of headers accepted in a handshake head
const MAX_HEADERS: usize = 64;

/// Characters that force quoting of a header token (RFC 7230 §3.2.6)
const DELIMITERS: &[char] = &[
    '(', ')', ',', '/', ':', ';', '<', '=', '>', '?', '@', '[', '\\', ']', '{', '}',
];

/// Handshake errors
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed handshake: {0}")]
    Malformed(String),

    #[error("Handshake head exceeds {0} bytes")]
    HeadTooLarge(usize),

    #[error("Stream closed before the handshake completed")]
    UnexpectedEof,
}

/// How the original requester address is carried in a [`DestinationRequest`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequesterHeader {
    /// `Forwarded: for=<quoted-addr>` (RFC 7239)
    #[default]
    Forwarded,
    /// `Client: <addr>`
    Client,
}

impl fmt::Display for RequesterHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequesterHeader::Forwarded => f.write_str("forwarded"),
            RequesterHeader::Client => f.write_str("client"),
        }
    }
}

impl FromStr for RequesterHeader {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "forwarded" => Ok(RequesterHeader::Forwarded),
            "client" => Ok(RequesterHeader::Client),
            other => Err(format!(
                "unknown requester header '{}' (expected 'forwarded' or 'client')",
                other
            )),
        }
    }
}

/// Quote an address for use as a header token value.
///
/// Values containing any RFC 7230 delimiter are wrapped in double quotes,
/// everything else is returned unchanged.
pub fn quote(addr: &str) -> Cow<'_, str> {
    if addr.contains(DELIMITERS) {
        Cow::Owned(format!("\"{}\"", addr))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Extract the `for=` parameter from a `Forwarded` header value.
///
/// Only the first forwarded element is considered.
pub fn parse_forwarded_for(value: &str) -> Option<String> {
    let element = value.split(',').next()?;
    element.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        if !name.trim().eq_ignore_ascii_case("for") {
            return None;
        }
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .unwrap_or(value);
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// The request written by the opening side naming the destination to dial
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationRequest {
    /// Method of the external request (normally `CONNECT`)
    pub method: String,
    /// Destination authority ("host:port")
    pub target: String,
    /// HTTP/1.x minor version of the external request
    pub version: u8,
    /// Address of the original client
    pub requester: Option<String>,
    /// Additional headers, passed through untouched
    pub headers: Vec<(String, String)>,
}

impl DestinationRequest {
    /// Create a `CONNECT` request for the given authority
    pub fn connect(target: impl Into<String>) -> Self {
        Self {
            method: "CONNECT".to_string(),
            target: target.into(),
            version: 1,
            requester: None,
            headers: Vec::new(),
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    pub fn with_version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    pub fn with_requester(mut self, requester: impl Into<String>) -> Self {
        self.requester = Some(requester.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Look up an additional header by name (case-insensitive)
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Encode the request head, carrying the requester in the given form
    pub fn encode(&self, form: RequesterHeader) -> Bytes {
        let mut head = format!(
            "{} {} HTTP/1.{}\r\nHost: {}\r\n",
            self.method, self.target, self.version, self.target
        );

        for (name, value) in &self.headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }

        if let Some(requester) = &self.requester {
            match form {
                RequesterHeader::Forwarded => {
                    head.push_str(&format!("Forwarded: for={}\r\n", quote(requester)));
                }
                RequesterHeader::Client => {
                    head.push_str(&format!("Client: {}\r\n", requester));
                }
            }
        }

        head.push_str("\r\n");
        Bytes::from(head)
    }

    /// Parse a request head.
    ///
    /// Returns `Ok(None)` if more data is needed, otherwise the request and
    /// the number of bytes consumed by the head.
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>, HandshakeError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        let head_len = match req.parse(buf) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => return Ok(None),
            Err(e) => return Err(HandshakeError::Malformed(e.to_string())),
        };

        let method = req.method.unwrap_or("").to_string();
        let target = req.path.unwrap_or("").to_string();
        if target.is_empty() {
            return Err(HandshakeError::Malformed("missing request target".to_string()));
        }

        // The requester header closest to the end was added by the nearest
        // hop; earlier ones are kept as ordinary headers
        let mut nearest: Option<(String, String)> = None;
        let mut extra = Vec::new();

        for header in req.headers.iter() {
            let value = String::from_utf8_lossy(header.value).trim().to_string();
            if header.name.eq_ignore_ascii_case("host") {
                continue;
            } else if header.name.eq_ignore_ascii_case("client")
                || header.name.eq_ignore_ascii_case("forwarded")
            {
                if let Some(previous) = nearest.replace((header.name.to_string(), value)) {
                    extra.push(previous);
                }
            } else {
                extra.push((header.name.to_string(), value));
            }
        }

        let requester = nearest.and_then(|(name, value)| {
            if name.eq_ignore_ascii_case("client") {
                (!value.is_empty()).then_some(value)
            } else {
                parse_forwarded_for(&value)
            }
        });

        Ok(Some((
            Self {
                method,
                target,
                version: req.version.unwrap_or(1),
                requester,
                headers: extra,
            },
            head_len,
        )))
    }

    /// Read a request off a stream.
    ///
    /// Returns the request and any payload bytes that followed the head.
    pub async fn read_from<R>(reader: &mut R) -> Result<(Self, Bytes), HandshakeError>
    where
        R: AsyncRead + Unpin,
    {
        let (request, mut buf, head_len) = read_head(reader, Self::parse).await?;
        let leftover = buf.split_off(head_len).freeze();
        Ok((request, leftover))
    }

    /// Write the encoded request to a stream
    pub async fn write_to<W>(&self, writer: &mut W, form: RequesterHeader) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.encode(form)).await?;
        writer.flush().await
    }
}

/// The response written by the accepting side once the request has been read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestinationAck {
    /// HTTP/1.x minor version, mirrored from the request
    pub version: u8,
    pub status: u16,
}

impl DestinationAck {
    /// A success acknowledgment matching the request's protocol version
    pub fn ok(request: &DestinationRequest) -> Self {
        Self {
            version: request.version,
            status: 200,
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn encode(&self) -> Bytes {
        let reason = match self.status {
            200 => "OK",
            _ => "",
        };
        Bytes::from(format!(
            "HTTP/1.{} {} {}\r\n\r\n",
            self.version, self.status, reason
        ))
    }

    /// Parse a response head, see [`DestinationRequest::parse`]
    pub fn parse(buf: &[u8]) -> Result<Option<(Self, usize)>, HandshakeError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut resp = httparse::Response::new(&mut headers);

        match resp.parse(buf) {
            Ok(httparse::Status::Complete(n)) => Ok(Some((
                Self {
                    version: resp.version.unwrap_or(1),
                    status: resp.code.unwrap_or(0),
                },
                n,
            ))),
            Ok(httparse::Status::Partial) => Ok(None),
            Err(e) => Err(HandshakeError::Malformed(e.to_string())),
        }
    }

    /// Read an acknowledgment off a stream.
    ///
    /// Returns the ack together with every byte read so far (the raw ack head
    /// followed by any payload that arrived with it), so the caller can relay
    /// it verbatim.
    pub async fn read_from<R>(reader: &mut R) -> Result<(Self, Bytes), HandshakeError>
    where
        R: AsyncRead + Unpin,
    {
        let (ack, buf, _) = read_head(reader, Self::parse).await?;
        Ok((ack, buf.freeze()))
    }

    pub async fn write_to<W>(&self, writer: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.encode()).await?;
        writer.flush().await
    }
}

/// Read from `reader` until `parse` recognizes a complete head
async fn read_head<R, T, F>(
    reader: &mut R,
    parse: F,
) -> Result<(T, BytesMut, usize), HandshakeError>
where
    R: AsyncRead + Unpin,
    F: Fn(&[u8]) -> Result<Option<(T, usize)>, HandshakeError>,
{
    let mut buf = BytesMut::with_capacity(1024);

    loop {
        if !buf.is_empty() {
            if let Some((value, head_len)) = parse(&buf)? {
                return Ok((value, buf, head_len));
            }
        }

        if buf.len() >= MAX_HANDSHAKE_SIZE {
            return Err(HandshakeError::HeadTooLarge(MAX_HANDSHAKE_SIZE));
        }

        buf.reserve(1024);
        if reader.read_buf(&mut buf).await? == 0 {
            return Err(HandshakeError::UnexpectedEof);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_plain_token_unchanged() {
        assert_eq!(quote("localhost"), "localhost");
        assert_eq!(quote("agent-01.example"), "agent-01.example");
        assert!(matches!(quote("unix"), Cow::Borrowed(_)));
    }

    #[test]
    fn test_quote_delimiters() {
        assert_eq!(quote("192.0.2.1:1234"), "\"192.0.2.1:1234\"");
        assert_eq!(quote("[2001:db8::1]:80"), "\"[2001:db8::1]:80\"");
        for c in DELIMITERS {
            let value = format!("a{}b", c);
            assert_eq!(quote(&value), format!("\"{}\"", value));
        }
    }

    #[test]
    fn test_parse_forwarded_for() {
        assert_eq!(
            parse_forwarded_for("for=\"192.0.2.1:1234\"").as_deref(),
            Some("192.0.2.1:1234")
        );
        assert_eq!(parse_forwarded_for("for=unknown").as_deref(), Some("unknown"));
        assert_eq!(
            parse_forwarded_for("proto=http;For=\"[::1]:80\", for=10.0.0.1").as_deref(),
            Some("[::1]:80")
        );
        assert_eq!(parse_forwarded_for("proto=https"), None);
        assert_eq!(parse_forwarded_for("for=\"\""), None);
    }

    #[test]
    fn test_encode_forwarded_form() {
        let request = DestinationRequest::connect("example.internal:80")
            .with_requester("203.0.113.7:51234");

        let encoded = request.encode(RequesterHeader::Forwarded);
        assert_eq!(
            &encoded[..],
            b"CONNECT example.internal:80 HTTP/1.1\r\n\
              Host: example.internal:80\r\n\
              Forwarded: for=\"203.0.113.7:51234\"\r\n\r\n"
        );
    }

    #[test]
    fn test_encode_client_form() {
        let request = DestinationRequest::connect("db:5432")
            .with_version(0)
            .with_requester("10.1.2.3:4000");

        let encoded = request.encode(RequesterHeader::Client);
        assert_eq!(
            &encoded[..],
            b"CONNECT db:5432 HTTP/1.0\r\nHost: db:5432\r\nClient: 10.1.2.3:4000\r\n\r\n"
        );
    }

    #[test]
    fn test_parse_recovers_requester_from_either_form() {
        let request = DestinationRequest::connect("svc:443")
            .with_requester("198.51.100.2:999")
            .with_header("User-Agent", "curl/8.0");

        for form in [RequesterHeader::Forwarded, RequesterHeader::Client] {
            let encoded = request.encode(form);
            let (parsed, len) = DestinationRequest::parse(&encoded).unwrap().unwrap();
            assert_eq!(len, encoded.len());
            assert_eq!(parsed.target, "svc:443");
            assert_eq!(parsed.method, "CONNECT");
            assert_eq!(parsed.requester.as_deref(), Some("198.51.100.2:999"));
            assert_eq!(parsed.header("user-agent"), Some("curl/8.0"));
        }
    }

    #[test]
    fn test_parse_keeps_upstream_forwarded_headers() {
        let head = b"CONNECT a:1 HTTP/1.1\r\nForwarded: for=upstream\r\nForwarded: for=\"1.2.3.4:5\"\r\n\r\n";
        let (parsed, _) = DestinationRequest::parse(head).unwrap().unwrap();

        assert_eq!(parsed.requester.as_deref(), Some("1.2.3.4:5"));
        assert_eq!(parsed.header("forwarded"), Some("for=upstream"));
    }

    #[test]
    fn test_requester_comes_from_last_requester_header() {
        // A client-supplied Client header must not override the Forwarded
        // header appended after it
        let request = DestinationRequest::connect("svc:443")
            .with_header("Client", "6.6.6.6:666")
            .with_requester("203.0.113.7:51234");

        let encoded = request.encode(RequesterHeader::Forwarded);
        let (parsed, _) = DestinationRequest::parse(&encoded).unwrap().unwrap();
        assert_eq!(parsed.requester.as_deref(), Some("203.0.113.7:51234"));
        assert_eq!(parsed.header("client"), Some("6.6.6.6:666"));

        // And the other way round in client mode
        let request = DestinationRequest::connect("svc:443")
            .with_header("Forwarded", "for=6.6.6.6")
            .with_requester("203.0.113.7:51234");

        let encoded = request.encode(RequesterHeader::Client);
        let (parsed, _) = DestinationRequest::parse(&encoded).unwrap().unwrap();
        assert_eq!(parsed.requester.as_deref(), Some("203.0.113.7:51234"));
        assert_eq!(parsed.header("forwarded"), Some("for=6.6.6.6"));
    }

    #[test]
    fn test_parse_partial_and_malformed() {
        assert!(DestinationRequest::parse(b"CONNECT a:1 HTTP/1.1\r\nHo")
            .unwrap()
            .is_none());
        assert!(matches!(
            DestinationRequest::parse(b"\x00\x01garbage\r\n\r\n"),
            Err(HandshakeError::Malformed(_))
        ));
    }

    #[test]
    fn test_ack_mirrors_request_version() {
        let request = DestinationRequest::connect("a:1").with_version(0);
        let ack = DestinationAck::ok(&request);
        assert_eq!(&ack.encode()[..], b"HTTP/1.0 200 OK\r\n\r\n");

        let (parsed, len) = DestinationAck::parse(&ack.encode()).unwrap().unwrap();
        assert_eq!(parsed, ack);
        assert_eq!(len, ack.encode().len());
        assert!(parsed.is_success());
    }

    #[tokio::test]
    async fn test_read_request_returns_trailing_payload() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let request = DestinationRequest::connect("echo:7").with_requester("1.1.1.1:1");
        let mut bytes = request.encode(RequesterHeader::Forwarded).to_vec();
        bytes.extend_from_slice(b"early payload");
        client.write_all(&bytes).await.unwrap();

        let (parsed, leftover) = DestinationRequest::read_from(&mut server).await.unwrap();
        assert_eq!(parsed.target, "echo:7");
        assert_eq!(&leftover[..], b"early payload");
    }

    #[tokio::test]
    async fn test_read_request_in_fragments() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let encoded = DestinationRequest::connect("frag:1").encode(RequesterHeader::Client);
        let reader = tokio::spawn(async move { DestinationRequest::read_from(&mut server).await });

        for chunk in encoded.chunks(3) {
            client.write_all(chunk).await.unwrap();
            tokio::task::yield_now().await;
        }

        let (parsed, leftover) = reader.await.unwrap().unwrap();
        assert_eq!(parsed.target, "frag:1");
        assert!(leftover.is_empty());
    }

    #[tokio::test]
    async fn test_read_ack_keeps_raw_bytes() {
        let (mut agent, mut relay) = tokio::io::duplex(1024);

        agent
            .write_all(b"HTTP/1.1 200 OK\r\n\r\nSSH-2.0-banner\r\n")
            .await
            .unwrap();

        let (ack, raw) = DestinationAck::read_from(&mut relay).await.unwrap();
        assert_eq!(ack.status, 200);
        assert_eq!(&raw[..], b"HTTP/1.1 200 OK\r\n\r\nSSH-2.0-banner\r\n");
    }

    #[tokio::test]
    async fn test_read_eof_before_head() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        assert!(matches!(
            DestinationRequest::read_from(&mut server).await,
            Err(HandshakeError::UnexpectedEof)
        ));
    }

    #[test]
    fn test_requester_header_from_str() {
        assert_eq!(
            "Forwarded".parse::<RequesterHeader>().unwrap(),
            RequesterHeader::Forwarded
        );
        assert_eq!(
            "client".parse::<RequesterHeader>().unwrap(),
            RequesterHeader::Client
        );
        assert!("x-real-ip".parse::<RequesterHeader>().is_err());
    }
}
