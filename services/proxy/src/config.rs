//! Proxy configuration.
//!
//! Flags are parsed with clap (every flag also reads an `EGRESS6_*`
//! environment variable) and then validated into [`ProxySettings`].

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use egress6_networking::AddressPool;

use crate::auth::Credentials;
use crate::dialer::DialerConfig;
use crate::http::DEFAULT_REALM;
use crate::listener::DEFAULT_MAX_CONNECTIONS;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Json,
    Text,
}

/// Raw command-line / environment configuration.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "egress6",
    version,
    about = "Authenticated HTTP and SOCKS5 proxy with a random IPv6 source per connection"
)]
pub struct Config {
    /// IPv6 block to draw source addresses from (example: 2001:db8:1234::/48).
    #[arg(long, env = "EGRESS6_CIDR")]
    pub cidr: String,

    /// HTTP proxy listen address.
    #[arg(long, env = "EGRESS6_HTTP_LISTEN", default_value = "[::]:8080")]
    pub http_listen: SocketAddr,

    /// HTTP proxy username.
    #[arg(long, env = "EGRESS6_HTTP_USER")]
    pub http_user: Option<String>,

    /// HTTP proxy password.
    #[arg(long, env = "EGRESS6_HTTP_PASS", hide_env_values = true)]
    pub http_pass: Option<String>,

    /// SOCKS5 proxy listen address.
    #[arg(long, env = "EGRESS6_SOCKS_LISTEN", default_value = "[::]:1080")]
    pub socks_listen: SocketAddr,

    /// SOCKS5 proxy username.
    #[arg(long, env = "EGRESS6_SOCKS_USER")]
    pub socks_user: Option<String>,

    /// SOCKS5 proxy password.
    #[arg(long, env = "EGRESS6_SOCKS_PASS", hide_env_values = true)]
    pub socks_pass: Option<String>,

    /// Disable the HTTP front-end.
    #[arg(long, env = "EGRESS6_NO_HTTP")]
    pub no_http: bool,

    /// Disable the SOCKS5 front-end.
    #[arg(long, env = "EGRESS6_NO_SOCKS")]
    pub no_socks: bool,

    /// Realm advertised in `Proxy-Authenticate`.
    #[arg(long, env = "EGRESS6_REALM", default_value = DEFAULT_REALM)]
    pub realm: String,

    /// Outbound connect timeout in milliseconds (no timeout when unset).
    #[arg(long, env = "EGRESS6_CONNECT_TIMEOUT_MS")]
    pub connect_timeout_ms: Option<u64>,

    /// Close tunnels idle for this many seconds (no timeout when unset).
    #[arg(long, env = "EGRESS6_IDLE_TIMEOUT_SECS")]
    pub idle_timeout_secs: Option<u64>,

    /// Maximum concurrent connections per front-end.
    #[arg(long, env = "EGRESS6_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    pub max_connections: usize,

    /// Bind source addresses that are routed to this host but not assigned
    /// to an interface (Linux IPV6_FREEBIND).
    #[arg(long, env = "EGRESS6_FREEBIND")]
    pub freebind: bool,

    /// Log level (trace, debug, info, warn, error). `RUST_LOG` takes precedence.
    #[arg(long, env = "EGRESS6_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, env = "EGRESS6_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    pub log_format: LogFormat,
}

/// Listen address and credentials of one front-end.
#[derive(Debug, Clone)]
pub struct FrontendSettings {
    pub listen: SocketAddr,
    pub credentials: Credentials,
}

/// Validated settings the proxy runs with.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub pool: AddressPool,
    pub dialer: DialerConfig,
    pub http: Option<FrontendSettings>,
    pub socks: Option<FrontendSettings>,
    pub realm: String,
    pub idle_timeout: Option<Duration>,
    pub max_connections: usize,
}

impl Config {
    /// Check the raw flags and build [`ProxySettings`].
    pub fn validate(&self) -> Result<ProxySettings> {
        let pool = AddressPool::try_from_cidr(&self.cidr)
            .with_context(|| format!("Invalid --cidr {:?}", self.cidr))?;

        if self.no_http && self.no_socks {
            bail!("Both front-ends are disabled; drop --no-http or --no-socks.");
        }
        if self.max_connections == 0 {
            bail!("--max-connections must be at least 1.");
        }

        let http = if self.no_http {
            None
        } else {
            Some(FrontendSettings {
                listen: self.http_listen,
                credentials: credentials(
                    "http",
                    self.http_user.as_deref(),
                    self.http_pass.as_deref(),
                )?,
            })
        };
        let socks = if self.no_socks {
            None
        } else {
            Some(FrontendSettings {
                listen: self.socks_listen,
                credentials: credentials(
                    "socks",
                    self.socks_user.as_deref(),
                    self.socks_pass.as_deref(),
                )?,
            })
        };

        Ok(ProxySettings {
            pool,
            dialer: DialerConfig {
                connect_timeout: self.connect_timeout_ms.map(Duration::from_millis),
                freebind: self.freebind,
            },
            http,
            socks,
            realm: self.realm.clone(),
            idle_timeout: self.idle_timeout_secs.map(Duration::from_secs),
            max_connections: self.max_connections,
        })
    }
}

fn credentials(
    frontend: &str,
    user: Option<&str>,
    pass: Option<&str>,
) -> Result<Credentials> {
    let env_prefix = format!("EGRESS6_{}", frontend.to_uppercase());
    let user = user
        .filter(|u| !u.is_empty())
        .with_context(|| format!("Missing --{frontend}-user (or {env_prefix}_USER)."))?;
    let pass = pass
        .filter(|p| !p.is_empty())
        .with_context(|| format!("Missing --{frontend}-pass (or {env_prefix}_PASS)."))?;
    Ok(Credentials::new(user, pass))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["egress6"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    const FULL: &[&str] = &[
        "--cidr",
        "2001:db8:1234::/48",
        "--http-user",
        "hu",
        "--http-pass",
        "hp",
        "--socks-user",
        "su",
        "--socks-pass",
        "sp",
    ];

    #[test]
    fn test_defaults() {
        let settings = parse(FULL).validate().unwrap();
        assert_eq!(settings.pool.host_bits(), 80);
        let http = settings.http.unwrap();
        let socks = settings.socks.unwrap();
        assert_eq!(http.listen, "[::]:8080".parse().unwrap());
        assert_eq!(socks.listen, "[::]:1080".parse().unwrap());
        assert_eq!(http.credentials, Credentials::new("hu", "hp"));
        assert_eq!(socks.credentials, Credentials::new("su", "sp"));
        assert_eq!(settings.realm, "egress6");
        assert_eq!(settings.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(settings.dialer.connect_timeout, None);
        assert!(!settings.dialer.freebind);
        assert_eq!(settings.idle_timeout, None);
    }

    #[test]
    fn test_timeouts_and_log_format() {
        let mut args = FULL.to_vec();
        args.extend([
            "--connect-timeout-ms",
            "1500",
            "--idle-timeout-secs",
            "30",
            "--log-format",
            "text",
        ]);
        let config = parse(&args);
        assert_eq!(config.log_format, LogFormat::Text);
        let settings = config.validate().unwrap();
        assert_eq!(settings.dialer.connect_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(settings.idle_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_invalid_cidr_rejected() {
        let mut args = FULL.to_vec();
        args[1] = "10.0.0.0/8";
        assert!(parse(&args).validate().is_err());
    }

    #[test]
    fn test_disabled_frontend_needs_no_credentials() {
        let settings = parse(&[
            "--cidr",
            "2001:db8::/64",
            "--no-http",
            "--socks-user",
            "su",
            "--socks-pass",
            "sp",
        ])
        .validate()
        .unwrap();
        assert!(settings.http.is_none());
        assert!(settings.socks.is_some());
    }

    #[test]
    fn test_missing_or_empty_credentials_rejected() {
        let config = parse(&["--cidr", "2001:db8::/64", "--no-socks", "--http-user", "hu"]);
        assert!(config.validate().is_err());

        let config = parse(&[
            "--cidr",
            "2001:db8::/64",
            "--no-socks",
            "--http-user",
            "hu",
            "--http-pass",
            "",
        ]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_both_frontends_disabled_rejected() {
        let config = parse(&["--cidr", "2001:db8::/64", "--no-http", "--no-socks"]);
        assert!(config.validate().is_err());
    }
}
