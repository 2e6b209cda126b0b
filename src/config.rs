//! IST configuration and listener address derivation.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::IstError;

/// Port the group channel listens on when nothing is configured; IST uses
/// the next port up.
pub const BASE_PORT_DEFAULT: u16 = 4567;

/// Immutable IST configuration, fixed at construction time.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IstConfig {
    /// Advertisable listen address, `scheme://host[:port]` or bare
    /// `host[:port]`.
    pub recv_addr: Option<String>,
    /// Actual bind address; defaults to `recv_addr`.
    pub recv_bind: Option<String>,
    /// Passed through to the write-set codec.
    pub keep_keys: bool,
    /// Fallback host when `recv_addr` is not set.
    pub base_host: Option<String>,
    /// Fallback port source; IST listens on `base_port + 1`.
    pub base_port: u16,
    /// Presence enables TLS implicitly for addresses without a scheme.
    pub tls: Option<TlsOptions>,
}

impl Default for IstConfig {
    fn default() -> Self {
        Self {
            recv_addr: None,
            recv_bind: None,
            keep_keys: true,
            base_host: None,
            base_port: BASE_PORT_DEFAULT,
            tls: None,
        }
    }
}

/// TLS material for both the listener and outbound connections.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TlsOptions {
    pub key: PathBuf,
    pub cert: PathBuf,
    /// Trust anchor for peer verification. Without it, peers are not
    /// verified.
    pub ca: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Scheme {
    Tcp,
    Ssl,
}

impl Scheme {
    fn parse(raw: &str) -> Result<Self, IstError> {
        match raw {
            "tcp" => Ok(Scheme::Tcp),
            "ssl" => Ok(Scheme::Ssl),
            other => Err(IstError::Config(format!(
                "unsupported IST address scheme '{other}'"
            ))),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Scheme::Tcp => "tcp",
            Scheme::Ssl => "ssl",
        }
    }
}

/// Fully determined IST endpoint address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ResolvedAddr {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl ResolvedAddr {
    pub fn with_port(&self, port: u16) -> Self {
        Self {
            port,
            ..self.clone()
        }
    }
}

impl fmt::Display for ResolvedAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", self.scheme.as_str(), self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
        }
    }
}

/// Derive the advertisable receive address: `recv_addr`, falling back to
/// `base_host`; scheme from TLS presence; port from `base_port + 1`.
pub(crate) fn resolve_recv_addr(config: &IstConfig) -> Result<ResolvedAddr, IstError> {
    let raw = config
        .recv_addr
        .as_deref()
        .or(config.base_host.as_deref())
        .ok_or_else(|| {
            IstError::Config("could not determine IST receive address: recv_addr not set".into())
        })?;
    normalize(raw, config)
}

/// Derive the bind address, falling back to the resolved receive address.
pub(crate) fn resolve_recv_bind(config: &IstConfig) -> Result<ResolvedAddr, IstError> {
    match config.recv_bind.as_deref() {
        Some(raw) => normalize(raw, config),
        None => resolve_recv_addr(config),
    }
}

/// Normalize a peer address the same way listener addresses are derived.
pub(crate) fn resolve_peer(config: &IstConfig, peer: &str) -> Result<ResolvedAddr, IstError> {
    normalize(peer, config)
}

fn normalize(raw: &str, config: &IstConfig) -> Result<ResolvedAddr, IstError> {
    let (scheme, rest) = match raw.split_once("://") {
        Some((scheme, rest)) => (Scheme::parse(scheme)?, rest),
        None if config.tls.is_some() => (Scheme::Ssl, raw),
        None => (Scheme::Tcp, raw),
    };
    if scheme == Scheme::Ssl && config.tls.is_none() {
        return Err(IstError::Config(format!(
            "ssl scheme in '{raw}' but no TLS options configured"
        )));
    }

    let (host, port) = split_host_port(rest)?;
    if host.is_empty() {
        return Err(IstError::Config(format!("empty host in IST address '{raw}'")));
    }
    let port = match port {
        Some(port) => port,
        None => config
            .base_port
            .checked_add(1)
            .ok_or_else(|| IstError::Config("base_port out of range".into()))?,
    };

    Ok(ResolvedAddr { scheme, host, port })
}

fn split_host_port(raw: &str) -> Result<(String, Option<u16>), IstError> {
    if let Some(rest) = raw.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(|| {
            IstError::Config(format!("unterminated bracketed host in '{raw}'"))
        })?;
        let port = match tail.strip_prefix(':') {
            Some(port) => Some(parse_port(port, raw)?),
            None if tail.is_empty() => None,
            None => {
                return Err(IstError::Config(format!(
                    "trailing garbage after bracketed host in '{raw}'"
                )));
            }
        };
        return Ok((host.to_string(), port));
    }

    match raw.rsplit_once(':') {
        // More than one colon without brackets is a bare IPv6 address.
        Some((head, _)) if head.contains(':') => Ok((raw.to_string(), None)),
        Some((host, port)) => Ok((host.to_string(), Some(parse_port(port, raw)?))),
        None => Ok((raw.to_string(), None)),
    }
}

fn parse_port(raw: &str, addr: &str) -> Result<u16, IstError> {
    raw.parse::<u16>()
        .map_err(|_| IstError::Config(format!("invalid port '{raw}' in IST address '{addr}'")))
}
