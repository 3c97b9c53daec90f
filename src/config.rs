//! Listener and TLS configuration.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use crate::{Error, Result};

/// TLS protocol versions the interception stage can enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TlsVersion {
    #[serde(rename = "TLSv1")]
    Tls1,
    #[serde(rename = "TLSv1.1")]
    Tls1_1,
    #[serde(rename = "TLSv1.2")]
    Tls1_2,
    #[serde(rename = "TLSv1.3")]
    Tls1_3,
}

impl TlsVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Tls1 => "TLSv1",
            TlsVersion::Tls1_1 => "TLSv1.1",
            TlsVersion::Tls1_2 => "TLSv1.2",
            TlsVersion::Tls1_3 => "TLSv1.3",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "TLSv1" => Some(TlsVersion::Tls1),
            "TLSv1.1" => Some(TlsVersion::Tls1_1),
            "TLSv1.2" => Some(TlsVersion::Tls1_2),
            "TLSv1.3" => Some(TlsVersion::Tls1_3),
            _ => None,
        }
    }
}

/// Protocol versions supported by the runtime.
pub fn supported_tls_protocols() -> Vec<TlsVersion> {
    vec![
        TlsVersion::Tls1,
        TlsVersion::Tls1_1,
        TlsVersion::Tls1_2,
        TlsVersion::Tls1_3,
    ]
}

pub const APPLICATION_PROTOCOL_HTTP_1_1: &str = "http/1.1";
pub const APPLICATION_PROTOCOL_HTTP_2: &str = "h2";

/// Enabled-protocol set consumed by the TLS interception stage.
///
/// `validate` enforces the invariant that a configured set is non-empty,
/// deduplicated, and a subset of the runtime's supported protocols. An
/// empty set can still be constructed directly; handshakes against it
/// necessarily fail, which tests rely on.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    protocols: Vec<TlsVersion>,
    alpn_enabled: bool,
    application_protocols: Vec<String>,
}

impl TlsConfig {
    pub fn new(protocols: Vec<TlsVersion>) -> Self {
        let mut deduped = Vec::new();
        for p in protocols {
            if !deduped.contains(&p) {
                deduped.push(p);
            }
        }
        Self {
            protocols: deduped,
            alpn_enabled: false,
            application_protocols: Vec::new(),
        }
    }

    /// Parses and validates a list of protocol version names.
    pub fn validate(names: &[String]) -> Result<Self> {
        let mut protocols = Vec::new();
        for name in names {
            let version = TlsVersion::from_name(name)
                .ok_or_else(|| Error::invalid_argument(format!("unsupported TLS protocol: {name}")))?;
            if !protocols.contains(&version) {
                protocols.push(version);
            }
        }
        if protocols.is_empty() {
            return Err(Error::invalid_argument("no TLS protocols enabled"));
        }
        Ok(Self::new(protocols))
    }

    pub fn with_alpn(mut self, application_protocols: Vec<String>) -> Self {
        self.alpn_enabled = true;
        self.application_protocols = application_protocols;
        self
    }

    pub fn enabled_protocols(&self) -> &[TlsVersion] {
        &self.protocols
    }

    pub fn is_alpn_enabled(&self) -> bool {
        self.alpn_enabled
    }

    pub fn application_protocols(&self) -> &[String] {
        &self.application_protocols
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self::new(supported_tls_protocols())
    }
}

/// Read-only view over the listener configuration, consulted by the
/// recursive request guard.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    address: SocketAddr,
    any_local_address: bool,
    aliases: Vec<String>,
}

impl ServerConfig {
    pub fn new(address: SocketAddr) -> Self {
        let any_local_address = address.ip().is_unspecified();
        Self {
            address,
            any_local_address,
            aliases: Vec::new(),
        }
    }

    pub fn with_aliases(mut self, aliases: Vec<String>) -> Self {
        self.aliases = aliases;
        self
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn port(&self) -> u16 {
        self.address.port()
    }

    pub fn is_any_local_address(&self) -> bool {
        self.any_local_address
    }

    pub fn is_alias(&self, host: &str) -> bool {
        self.aliases.iter().any(|a| a.eq_ignore_ascii_case(host))
    }

    /// True when the host names this machine: loopback literals, the
    /// common local host names, or a configured alias.
    pub fn is_own_host(&self, host: &str) -> bool {
        if host.eq_ignore_ascii_case("localhost") {
            return true;
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            if ip.is_loopback() || ip == self.address.ip() {
                return true;
            }
        }
        self.is_alias(host)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub listen_host: String,
    pub listen_port: u16,
    pub cert_store_path: String,
    pub tls_protocols: Vec<String>,
    pub connect_pass_through: Vec<String>,
    pub read_timeout_secs: u64,
    pub aliases: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 8080,
            cert_store_path: "~/.intercept-proxy/certs".to_string(),
            tls_protocols: supported_tls_protocols()
                .iter()
                .map(|p| p.as_str().to_string())
                .collect(),
            connect_pass_through: Vec::new(),
            read_timeout_secs: 60,
            aliases: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path.as_ref().to_str().unwrap_or_default()))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }

    pub fn tls_config(&self) -> Result<TlsConfig> {
        TlsConfig::validate(&self.tls_protocols)
    }

    pub fn expand_path(&self, path: &str) -> String {
        if let Some(rest) = path.strip_prefix('~') {
            if let Ok(home) = std::env::var("HOME") {
                return format!("{home}{rest}");
            }
        }
        path.to_string()
    }

    pub fn cert_store_path(&self) -> String {
        self.expand_path(&self.cert_store_path)
    }
}
