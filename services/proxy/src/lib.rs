//! Authenticated forward proxy with per-connection IPv6 egress.
//!
//! Two front-ends share one dialer:
//! - HTTP/1.x (`CONNECT` tunnels and absolute-form requests)
//! - SOCKS5 (`CONNECT` with username/password auth)
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> HttpFrontend / Socks5Frontend -> EgressDialer -> Target
//!                              |                         (random source
//!                        Credentials                      from AddressPool)
//!                              |
//!                        TunnelRelay (client <-> target)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! let settings = Config::parse().validate()?;
//! let listeners = bind_listeners(&settings).await?;
//! for listener in listeners {
//!     tokio::spawn(listener.run(shutdown_rx.clone()));
//! }
//! ```

use std::io;
use std::sync::Arc;

pub mod auth;
pub mod config;
pub mod dialer;
pub mod error;
pub mod http;
pub mod listener;
pub mod relay;
pub mod socks5;
pub mod target;

pub use auth::Credentials;
pub use config::{Config, LogFormat, ProxySettings};
pub use dialer::{DialError, DialerConfig, EgressDialer, Network, OutboundAttempt};
pub use error::ProxyError;
pub use http::HttpFrontend;
pub use listener::{ConnectionHandler, Listener, ListenerConfig, ListenerStats};
pub use relay::{RelayReport, TunnelRelay};
pub use socks5::Socks5Frontend;
pub use target::TargetAddr;

/// Bind a listener for every enabled front-end, all sharing one dialer.
pub async fn bind_listeners(settings: &ProxySettings) -> io::Result<Vec<Arc<Listener>>> {
    let dialer = Arc::new(EgressDialer::with_config(
        settings.pool,
        settings.dialer.clone(),
    ));
    let mut listeners = Vec::new();

    if let Some(http) = &settings.http {
        let frontend = HttpFrontend::new(http.credentials.clone(), Arc::clone(&dialer))
            .with_realm(settings.realm.clone())
            .with_idle_timeout(settings.idle_timeout);
        let mut config = ListenerConfig::new(http.listen);
        config.max_connections = settings.max_connections;
        listeners.push(Arc::new(Listener::bind(config, Arc::new(frontend)).await?));
    }

    if let Some(socks) = &settings.socks {
        let frontend = Socks5Frontend::new(socks.credentials.clone(), Arc::clone(&dialer))
            .with_idle_timeout(settings.idle_timeout);
        let mut config = ListenerConfig::new(socks.listen);
        config.max_connections = settings.max_connections;
        listeners.push(Arc::new(Listener::bind(config, Arc::new(frontend)).await?));
    }

    Ok(listeners)
}
