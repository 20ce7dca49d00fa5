//! HTTP/1.x proxy front-end.
//!
//! Handles two kinds of proxied requests, both gated by
//! `Proxy-Authorization: Basic`:
//! - `CONNECT host:port`: dial the target, answer `200`, then tunnel bytes
//! - absolute-form requests (`GET http://host/path`): dial the host, send the
//!   request in origin-form and stream the upstream response back verbatim
//!
//! Only the request head is parsed; bodies and responses are streamed.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::auth::Credentials;
use crate::dialer::EgressDialer;
use crate::error::ProxyError;
use crate::listener::{ConnectionHandler, ListenerStats};
use crate::relay::TunnelRelay;
use crate::target::TargetAddr;

/// Maximum size of a request head (request line + headers).
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Default realm in the `Proxy-Authenticate` challenge.
pub const DEFAULT_REALM: &str = "egress6";

const HTTP_DEFAULT_PORT: u16 = 80;

const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.0 200 OK\r\n\r\n";
const CONNECT_DIAL_FAILED: &[u8] =
    b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const BAD_GATEWAY: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
const BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

const AUTH_REQUIRED_BODY: &str = "407 Proxy Authentication Required\n";

/// Headers that only apply to the client-proxy hop.
const HOP_BY_HOP: &[&str] = &[
    "proxy-authorization",
    "proxy-connection",
    "connection",
    "keep-alive",
];

/// Parsed request line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

/// How the request body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    None,
    Length(u64),
    Chunked,
}

impl RequestHead {
    /// Parse a request head terminated by an empty line.
    pub fn parse(head: &[u8]) -> Result<Self, ProxyError> {
        let text = std::str::from_utf8(head)
            .map_err(|_| ProxyError::protocol("request head is not valid UTF-8"))?;
        let mut lines = text.split("\r\n");

        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split(' ');
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ProxyError::protocol(format!(
                "malformed request line: {:?}",
                request_line
            )));
        };
        if method.is_empty() || target.is_empty() || !version.starts_with("HTTP/1.") {
            return Err(ProxyError::protocol(format!(
                "malformed request line: {:?}",
                request_line
            )));
        }

        let mut headers = Vec::new();
        for line in lines.filter(|l| !l.is_empty()) {
            let Some((name, value)) = line.split_once(':') else {
                return Err(ProxyError::protocol(format!("malformed header: {:?}", line)));
            };
            if name.is_empty() || name.contains([' ', '\t']) {
                return Err(ProxyError::protocol(format!("malformed header: {:?}", line)));
            }
            headers.push((name.to_string(), value.trim_matches([' ', '\t']).to_string()));
        }

        Ok(Self {
            method: method.to_string(),
            target: target.to_string(),
            version: version.to_string(),
            headers,
        })
    }

    /// First header value with the given (case-insensitive) name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_connect(&self) -> bool {
        self.method == "CONNECT"
    }

    /// Tokens listed in `Connection` and `Proxy-Connection`, lowercased.
    fn connection_tokens(&self) -> Vec<String> {
        self.headers
            .iter()
            .filter(|(n, _)| {
                n.eq_ignore_ascii_case("connection") || n.eq_ignore_ascii_case("proxy-connection")
            })
            .flat_map(|(_, v)| v.split(','))
            .map(|t| t.trim().to_ascii_lowercase())
            .filter(|t| !t.is_empty())
            .collect()
    }

    /// Whether the client expects the connection to close after this request.
    pub fn wants_close(&self) -> bool {
        let tokens = self.connection_tokens();
        if tokens.iter().any(|t| t == "close") {
            return true;
        }
        self.version == "HTTP/1.0" && !tokens.iter().any(|t| t == "keep-alive")
    }

    /// Body framing declared by the request headers.
    pub fn body_framing(&self) -> Result<BodyFraming, ProxyError> {
        if let Some(te) = self.header("transfer-encoding") {
            return if te
                .rsplit(',')
                .next()
                .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"))
            {
                Ok(BodyFraming::Chunked)
            } else {
                Err(ProxyError::protocol(format!(
                    "unsupported transfer-encoding: {}",
                    te
                )))
            };
        }

        match self.header("content-length") {
            None => Ok(BodyFraming::None),
            Some(v) => match v.parse::<u64>() {
                Ok(0) => Ok(BodyFraming::None),
                Ok(len) => Ok(BodyFraming::Length(len)),
                Err(_) => Err(ProxyError::protocol(format!("bad content-length: {}", v))),
            },
        }
    }
}

/// Split an absolute-form `http://` URI into target and origin-form path.
pub fn parse_absolute_uri(uri: &str) -> Result<(TargetAddr, String), ProxyError> {
    let Some(rest) = strip_scheme(uri, "http://") else {
        if strip_scheme(uri, "https://").is_some() {
            return Err(ProxyError::protocol("https URIs must be tunneled with CONNECT"));
        }
        return Err(ProxyError::protocol(format!(
            "expected absolute http URI, got {:?}",
            uri
        )));
    };

    let end = rest
        .find(|c| matches!(c, '/' | '?' | '#'))
        .unwrap_or(rest.len());
    let (authority, path) = rest.split_at(end);
    // Drop any userinfo
    let authority = authority
        .rsplit_once('@')
        .map_or(authority, |(_, host)| host);

    let target = TargetAddr::parse_authority(authority, Some(HTTP_DEFAULT_PORT))
        .ok_or_else(|| ProxyError::protocol(format!("bad authority in URI: {:?}", uri)))?;

    let path = path.split('#').next().unwrap_or_default();
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path)
    };

    Ok((target, path))
}

fn strip_scheme<'a>(uri: &'a str, scheme: &str) -> Option<&'a str> {
    uri.get(..scheme.len())
        .filter(|prefix| prefix.eq_ignore_ascii_case(scheme))
        .map(|_| &uri[scheme.len()..])
}

/// Build the origin-form head sent to the upstream server.
///
/// `Host` always names the URI authority; a client-supplied `Host` is dropped.
pub fn outbound_head(request: &RequestHead, path: &str, target: &TargetAddr) -> Vec<u8> {
    let listed = request.connection_tokens();
    let mut out = format!(
        "{} {} {}\r\nHost: {}\r\n",
        request.method,
        path,
        request.version,
        target.host_header(HTTP_DEFAULT_PORT)
    );

    for (name, value) in &request.headers {
        let lower = name.to_ascii_lowercase();
        if lower == "host" || HOP_BY_HOP.contains(&lower.as_str()) || listed.contains(&lower) {
            continue;
        }
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }

    out.push_str("Connection: close\r\n\r\n");
    out.into_bytes()
}

fn proxy_auth_required(realm: &str, close: bool) -> Vec<u8> {
    format!(
        "HTTP/1.1 407 Proxy Authentication Required\r\n\
         Proxy-Authenticate: Basic realm=\"{}\"\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         Connection: {}\r\n\
         \r\n\
         {}",
        realm,
        AUTH_REQUIRED_BODY.len(),
        if close { "close" } else { "keep-alive" },
        AUTH_REQUIRED_BODY
    )
    .into_bytes()
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Read until a full request head is buffered.
///
/// Returns the head length, or `None` if the client closed cleanly between
/// requests. Bytes past the head stay in `buf`.
async fn read_head<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut Vec<u8>,
) -> Result<Option<usize>, ProxyError> {
    let mut chunk = [0u8; 4096];
    loop {
        match find_head_end(buf) {
            Some(end) if end > MAX_HEAD_BYTES => {
                return Err(ProxyError::protocol("request head too large"))
            }
            Some(end) => return Ok(Some(end)),
            None if buf.len() >= MAX_HEAD_BYTES => {
                return Err(ProxyError::protocol("request head too large"))
            }
            None => {}
        }

        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::protocol("client closed mid-request"));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// HTTP proxy front-end.
pub struct HttpFrontend {
    credentials: Credentials,
    dialer: Arc<EgressDialer>,
    realm: String,
    idle_timeout: Option<Duration>,
}

impl HttpFrontend {
    /// Create a front-end accepting `credentials` and dialing through `dialer`.
    pub fn new(credentials: Credentials, dialer: Arc<EgressDialer>) -> Self {
        Self {
            credentials,
            dialer,
            realm: DEFAULT_REALM.to_string(),
            idle_timeout: None,
        }
    }

    /// Set the realm advertised in `Proxy-Authenticate`.
    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = realm.into();
        self
    }

    /// Set an idle timeout for CONNECT tunnels.
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Serve every request on one client connection.
    pub async fn serve<S>(
        &self,
        mut client: S,
        peer_addr: SocketAddr,
        stats: &ListenerStats,
    ) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut buf = Vec::with_capacity(4096);

        loop {
            let head_len = match read_head(&mut client, &mut buf).await {
                Ok(Some(head_len)) => head_len,
                Ok(None) => return Ok(()),
                Err(e @ ProxyError::Protocol(_)) => {
                    let _ = client.write_all(BAD_REQUEST).await;
                    return Err(e);
                }
                Err(e) => return Err(e),
            };
            let head: Vec<u8> = buf.drain(..head_len).collect();

            let request = match RequestHead::parse(&head) {
                Ok(request) => request,
                Err(e) => {
                    client.write_all(BAD_REQUEST).await?;
                    return Err(e);
                }
            };

            let authorized = request
                .header("proxy-authorization")
                .is_some_and(|h| self.credentials.check_basic(h));

            if !authorized {
                stats.record_auth_failure();
                warn!(
                    peer_addr = %peer_addr,
                    method = %request.method,
                    target = %request.target,
                    "Proxy authentication failed"
                );

                // A body we would have to skip, or a tunnel request, ends the connection.
                let close = request.is_connect()
                    || request.wants_close()
                    || !matches!(request.body_framing(), Ok(BodyFraming::None));
                client
                    .write_all(&proxy_auth_required(&self.realm, close))
                    .await?;
                if close {
                    let _ = client.shutdown().await;
                    return Err(ProxyError::AuthenticationFailed);
                }
                continue;
            }

            return if request.is_connect() {
                self.tunnel(client, &request, buf, stats).await
            } else {
                self.forward(client, &request, buf, stats).await
            };
        }
    }

    /// CONNECT: dial, acknowledge, then relay raw bytes.
    async fn tunnel<S>(
        &self,
        mut client: S,
        request: &RequestHead,
        buffered: Vec<u8>,
        stats: &ListenerStats,
    ) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let Some(target) = TargetAddr::parse_authority(&request.target, None) else {
            client.write_all(BAD_REQUEST).await?;
            return Err(ProxyError::protocol(format!(
                "bad CONNECT target: {:?}",
                request.target
            )));
        };

        let mut upstream = match self.dialer.dial(&target).await {
            Ok(stream) => {
                stats.record_dial(true);
                stream
            }
            Err(e) => {
                stats.record_dial(false);
                warn!(target = %target, error = %e, "CONNECT dial failed");
                client.write_all(CONNECT_DIAL_FAILED).await?;
                let _ = client.shutdown().await;
                return Err(e.into());
            }
        };

        info!(
            target = %target,
            source = %local_ip(&upstream),
            "CONNECT tunnel established"
        );

        client.write_all(CONNECT_ESTABLISHED).await?;
        if !buffered.is_empty() {
            upstream
                .write_all(&buffered)
                .await
                .map_err(ProxyError::Relay)?;
        }

        let report = TunnelRelay::new(client, upstream)
            .with_idle_timeout(self.idle_timeout)
            .run()
            .await;
        stats.record_relay(&report);

        match report.error {
            Some(e) => Err(ProxyError::Relay(e)),
            None => Ok(()),
        }
    }

    /// Absolute-form request: forward once, stream the response, close.
    async fn forward<S>(
        &self,
        mut client: S,
        request: &RequestHead,
        buffered: Vec<u8>,
        stats: &ListenerStats,
    ) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let parsed = parse_absolute_uri(&request.target)
            .and_then(|(target, path)| Ok((target, path, request.body_framing()?)));
        let (target, path, framing) = match parsed {
            Ok(parsed) => parsed,
            Err(e) => {
                client.write_all(BAD_REQUEST).await?;
                return Err(e);
            }
        };

        let mut upstream = match self.dialer.dial(&target).await {
            Ok(stream) => {
                stats.record_dial(true);
                stream
            }
            Err(e) => {
                stats.record_dial(false);
                warn!(
                    method = %request.method,
                    target = %target,
                    error = %e,
                    "Upstream dial failed"
                );
                client.write_all(BAD_GATEWAY).await?;
                let _ = client.shutdown().await;
                return Err(e.into());
            }
        };

        info!(
            method = %request.method,
            target = %target,
            source = %local_ip(&upstream),
            "Forwarding request"
        );

        // Head plus whatever part of the body arrived with it.
        let mut first_write = outbound_head(request, &path, &target);
        let remaining = match framing {
            BodyFraming::None => BodyFraming::None,
            BodyFraming::Length(len) => {
                let early = buffered.len().min(usize::try_from(len).unwrap_or(usize::MAX));
                first_write.extend_from_slice(&buffered[..early]);
                BodyFraming::Length(len - early as u64)
            }
            BodyFraming::Chunked => {
                first_write.extend_from_slice(&buffered);
                BodyFraming::Chunked
            }
        };
        if let Err(e) = upstream.write_all(&first_write).await {
            warn!(target = %target, error = %e, "Upstream write failed");
            client.write_all(BAD_GATEWAY).await?;
            return Err(ProxyError::Relay(e));
        }

        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut upstream_read, mut upstream_write) = upstream.split();

        // Finishes only when the client goes away: EOF or a read error,
        // either mid-body or while the response is pending.
        let client_side = async {
            let uploaded = match remaining {
                BodyFraming::None => 0,
                BodyFraming::Length(len) => {
                    let copied =
                        tokio::io::copy(&mut (&mut client_read).take(len), &mut upstream_write)
                            .await?;
                    if copied < len {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("client closed after {copied} of {len} body bytes"),
                        ));
                    }
                    copied
                }
                BodyFraming::Chunked => {
                    tokio::io::copy(&mut client_read, &mut upstream_write).await?
                }
            };
            stats.bytes_to_target.fetch_add(uploaded, Ordering::Relaxed);

            // Pipelined bytes are not served; they are read and discarded.
            let mut scratch = [0u8; 1024];
            while client_read.read(&mut scratch).await? != 0 {}
            Err::<(), _>(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "client closed before the response completed",
            ))
        };
        let response = async {
            let n = tokio::io::copy(&mut upstream_read, &mut client_write).await?;
            client_write.shutdown().await?;
            Ok::<_, io::Error>(n)
        };
        tokio::pin!(client_side);
        tokio::pin!(response);

        let downloaded = tokio::select! {
            biased;
            downloaded = &mut response => downloaded,
            gone = &mut client_side => {
                let error = gone
                    .err()
                    .unwrap_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof));
                debug!(target = %target, error = %error, "Client left, abandoning upstream");
                return Err(ProxyError::Relay(error));
            }
        };

        let downloaded = downloaded.map_err(ProxyError::Relay)?;
        stats
            .bytes_from_target
            .fetch_add(downloaded, Ordering::Relaxed);
        debug!(target = %target, bytes = downloaded, "Response relayed");
        Ok(())
    }
}

fn local_ip(stream: &TcpStream) -> String {
    stream
        .local_addr()
        .map(|a| a.ip().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}

#[async_trait]
impl ConnectionHandler for HttpFrontend {
    fn protocol(&self) -> &'static str {
        "http"
    }

    async fn handle(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        stats: &ListenerStats,
    ) -> Result<(), ProxyError> {
        self.serve(stream, peer_addr, stats).await
    }
}
