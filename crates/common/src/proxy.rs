//! Proxy endpoint value types
//!
//! A `ProxyEndpoint` is the addressable part of a proxy: transport, host,
//! port and optional credentials. Health and capacity live elsewhere.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::secret::Secret;

/// Proxy transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Socks5,
    Socks4,
    #[default]
    Http,
    Https,
}

impl ProxyKind {
    /// Label used in logs and persisted records.
    pub fn label(&self) -> &'static str {
        match self {
            ProxyKind::Socks5 => "socks5",
            ProxyKind::Socks4 => "socks4",
            ProxyKind::Http => "http",
            ProxyKind::Https => "https",
        }
    }

    /// URL scheme handed to HTTP clients. SOCKS5 resolves names on the proxy side.
    pub fn url_scheme(&self) -> &'static str {
        match self {
            ProxyKind::Socks5 => "socks5h",
            ProxyKind::Socks4 => "socks4a",
            ProxyKind::Http => "http",
            ProxyKind::Https => "https",
        }
    }
}

impl FromStr for ProxyKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "socks5" | "socks5h" => Ok(ProxyKind::Socks5),
            "socks4" | "socks4a" => Ok(ProxyKind::Socks4),
            "http" => Ok(ProxyKind::Http),
            "https" => Ok(ProxyKind::Https),
            other => Err(Error::Invalid(format!("unknown proxy type: {other}"))),
        }
    }
}

impl fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Address and credentials of one proxy.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<Secret<String>>,
}

impl ProxyEndpoint {
    pub fn new(kind: ProxyKind, host: impl Into<String>, port: u16) -> Self {
        Self {
            kind,
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(Secret::new(password.into()));
        self
    }

    /// Identity of the proxy inside the pool: `host:port:username`.
    ///
    /// Two entries that differ only in password or transport are the same proxy.
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.host,
            self.port,
            self.username.as_deref().unwrap_or_default()
        )
    }

    /// Full proxy URL including credentials, for building HTTP clients.
    pub fn url(&self) -> String {
        let auth = match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!("{user}:{}@", pass.expose()),
            (Some(user), None) => format!("{user}@"),
            _ => String::new(),
        };
        format!(
            "{}://{auth}{}:{}",
            self.kind.url_scheme(),
            self.url_host(),
            self.port
        )
    }

    /// URL with the password masked, safe for logs and API responses.
    pub fn masked(&self) -> String {
        let auth = match &self.username {
            Some(user) if self.password.is_some() => format!("{user}:***@"),
            Some(user) => format!("{user}@"),
            None => String::new(),
        };
        format!(
            "{}://{auth}{}:{}",
            self.kind.label(),
            self.url_host(),
            self.port
        )
    }

    fn url_host(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        }
    }
}

impl fmt::Debug for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProxyEndpoint({})", self.masked())
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}
