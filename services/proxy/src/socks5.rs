//! SOCKS5 proxy front-end (RFC 1928 with RFC 1929 username/password auth).
//!
//! Only CONNECT is supported. Every client must authenticate; a client that
//! does not offer username/password is turned away during the greeting.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{info, warn};

use crate::auth::Credentials;
use crate::dialer::{DialError, EgressDialer};
use crate::error::ProxyError;
use crate::listener::{ConnectionHandler, ListenerStats};
use crate::relay::TunnelRelay;
use crate::target::TargetAddr;

pub const SOCKS_VERSION: u8 = 0x05;
pub const AUTH_VERSION: u8 = 0x01;

pub const METHOD_USER_PASS: u8 = 0x02;
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

pub const AUTH_SUCCESS: u8 = 0x00;
pub const AUTH_FAILURE: u8 = 0x01;

pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Reply field of a SOCKS5 response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl ReplyCode {
    /// Reply code reported for a failed outbound dial.
    pub fn from_dial_error(error: &DialError) -> Self {
        match error {
            DialError::Resolve { .. }
            | DialError::NoIpv6Route { .. }
            | DialError::Timeout { .. } => ReplyCode::HostUnreachable,
            _ => match error.kind() {
                io::ErrorKind::ConnectionRefused => ReplyCode::ConnectionRefused,
                io::ErrorKind::NetworkUnreachable => ReplyCode::NetworkUnreachable,
                io::ErrorKind::HostUnreachable | io::ErrorKind::TimedOut => {
                    ReplyCode::HostUnreachable
                }
                _ => ReplyCode::GeneralFailure,
            },
        }
    }
}

/// Encode a reply; without a bound address `0.0.0.0:0` is sent.
pub fn encode_reply(code: ReplyCode, bound: Option<SocketAddr>) -> Vec<u8> {
    let bound = bound.unwrap_or(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
    let mut buf = Vec::with_capacity(4 + 16 + 2);
    buf.extend_from_slice(&[SOCKS_VERSION, code as u8, 0x00]);
    match bound.ip() {
        IpAddr::V4(v4) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&v6.octets());
        }
    }
    buf.extend_from_slice(&bound.port().to_be_bytes());
    buf
}

/// Outcome of reading a request's destination.
enum Request {
    Connect(TargetAddr),
    Rejected(ReplyCode, String),
}

/// SOCKS5 proxy front-end.
pub struct Socks5Frontend {
    credentials: Credentials,
    dialer: Arc<EgressDialer>,
    idle_timeout: Option<Duration>,
}

impl Socks5Frontend {
    pub fn new(credentials: Credentials, dialer: Arc<EgressDialer>) -> Self {
        Self {
            credentials,
            dialer,
            idle_timeout: None,
        }
    }

    /// Set an idle timeout for established tunnels.
    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Run the handshake, dial and relay for one client connection.
    pub async fn serve<S>(
        &self,
        mut client: S,
        peer_addr: SocketAddr,
        stats: &ListenerStats,
    ) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        // Greeting: VER NMETHODS METHODS...
        let version = client.read_u8().await?;
        if version != SOCKS_VERSION {
            return Err(ProxyError::protocol(format!(
                "unsupported SOCKS version {:#04x}",
                version
            )));
        }
        let n_methods = client.read_u8().await? as usize;
        let mut methods = vec![0u8; n_methods];
        client.read_exact(&mut methods).await?;

        if !methods.contains(&METHOD_USER_PASS) {
            stats.record_auth_failure();
            warn!(peer_addr = %peer_addr, methods = ?methods, "SOCKS5 client does not offer username/password");
            client
                .write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE])
                .await?;
            let _ = client.shutdown().await;
            return Err(ProxyError::AuthenticationFailed);
        }
        client.write_all(&[SOCKS_VERSION, METHOD_USER_PASS]).await?;

        // Sub-negotiation: VER ULEN UNAME PLEN PASSWD
        let auth_version = client.read_u8().await?;
        let username = read_short_field(&mut client).await?;
        let password = read_short_field(&mut client).await?;

        if auth_version != AUTH_VERSION || !self.credentials.check(&username, &password) {
            stats.record_auth_failure();
            warn!(
                peer_addr = %peer_addr,
                username = %String::from_utf8_lossy(&username),
                "SOCKS5 authentication failed"
            );
            client.write_all(&[AUTH_VERSION, AUTH_FAILURE]).await?;
            let _ = client.shutdown().await;
            return Err(ProxyError::AuthenticationFailed);
        }
        client.write_all(&[AUTH_VERSION, AUTH_SUCCESS]).await?;

        let target = match read_request(&mut client).await? {
            Request::Connect(target) => target,
            Request::Rejected(code, reason) => {
                client.write_all(&encode_reply(code, None)).await?;
                let _ = client.shutdown().await;
                return Err(ProxyError::Protocol(reason));
            }
        };

        let upstream = match self.dialer.dial(&target).await {
            Ok(stream) => {
                stats.record_dial(true);
                stream
            }
            Err(e) => {
                stats.record_dial(false);
                let code = ReplyCode::from_dial_error(&e);
                warn!(
                    target = %target,
                    error = %e,
                    reply = code as u8,
                    "SOCKS5 dial failed"
                );
                client.write_all(&encode_reply(code, None)).await?;
                let _ = client.shutdown().await;
                return Err(e.into());
            }
        };

        let bound = upstream.local_addr().ok();
        info!(
            target = %target,
            source = %bound.map_or_else(|| "unknown".to_string(), |a| a.ip().to_string()),
            "SOCKS5 tunnel established"
        );
        client
            .write_all(&encode_reply(ReplyCode::Succeeded, bound))
            .await?;

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
}

/// Read a length-prefixed field (one length byte).
async fn read_short_field<S: AsyncRead + Unpin>(s: &mut S) -> io::Result<Vec<u8>> {
    let len = s.read_u8().await? as usize;
    let mut buf = vec![0u8; len];
    s.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Read `VER CMD RSV ATYP DST.ADDR DST.PORT`.
async fn read_request<S: AsyncRead + Unpin>(s: &mut S) -> Result<Request, ProxyError> {
    let mut head = [0u8; 4];
    s.read_exact(&mut head).await?;
    let [version, cmd, _rsv, atyp] = head;
    if version != SOCKS_VERSION {
        return Err(ProxyError::protocol(format!(
            "unsupported SOCKS version {:#04x} in request",
            version
        )));
    }

    let target = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            s.read_exact(&mut octets).await?;
            let port = s.read_u16().await?;
            TargetAddr::Ip(SocketAddr::new(Ipv4Addr::from(octets).into(), port))
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            s.read_exact(&mut octets).await?;
            let port = s.read_u16().await?;
            TargetAddr::Ip(SocketAddr::new(Ipv6Addr::from(octets).into(), port))
        }
        ATYP_DOMAIN => {
            let raw = read_short_field(s).await?;
            let port = s.read_u16().await?;
            match String::from_utf8(raw) {
                Ok(host) if !host.is_empty() => TargetAddr::Domain(host, port),
                _ => {
                    return Ok(Request::Rejected(
                        ReplyCode::GeneralFailure,
                        "invalid domain name".to_string(),
                    ))
                }
            }
        }
        other => {
            return Ok(Request::Rejected(
                ReplyCode::AddressTypeNotSupported,
                format!("unsupported address type {:#04x}", other),
            ))
        }
    };

    if cmd != CMD_CONNECT {
        return Ok(Request::Rejected(
            ReplyCode::CommandNotSupported,
            format!("unsupported command {:#04x}", cmd),
        ));
    }
    Ok(Request::Connect(target))
}

#[async_trait]
impl ConnectionHandler for Socks5Frontend {
    fn protocol(&self) -> &'static str {
        "socks5"
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
