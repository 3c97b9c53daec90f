//! Per-connection attribute store.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::certs::ServerCertificateService;
use crate::config::{ServerConfig, TlsConfig};
use crate::pipeline::chain::ChainAccess;

/// Callback that splices a protocol-specific processor into the chain once
/// negotiation concludes; supplied by the owner of the chain.
pub trait PipelineConfigurator: Send + Sync {
    fn configure(&self, chain: &mut dyn ChainAccess, protocol: &str);
}

/// Attribute store of one accepted connection.
///
/// Owned exclusively by the connection's task; stages communicate with each
/// other only through it. Addresses and service references are set at
/// assembly time and stay stable; the tri-state flags are filled in as
/// negotiation proceeds.
pub struct ConnectionContext {
    pub remote_address: SocketAddr,
    pub local_address: Option<SocketAddr>,

    /// Defined exactly once, by the protocol sniffer or the TLS
    /// interception stage, before any HTTP message is parsed.
    pub tls_upgraded: Option<bool>,
    /// Set by the CONNECT pass-through decision.
    pub pass_through: Option<bool>,
    /// True while a request is being handled by downstream logic; the read
    /// timeout guard consults this.
    pub processing_message: bool,
    /// Stamped per request by the recursive request guard.
    pub recursive_message: bool,

    pub certificate_service: Option<Arc<ServerCertificateService>>,
    pub tls_config: Option<TlsConfig>,
    pub server_config: Option<Arc<ServerConfig>>,
    pub pipeline_configurator: Option<Arc<dyn PipelineConfigurator>>,
}

impl std::fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("remote_address", &self.remote_address)
            .field("local_address", &self.local_address)
            .field("tls_upgraded", &self.tls_upgraded)
            .field("pass_through", &self.pass_through)
            .field("processing_message", &self.processing_message)
            .field("recursive_message", &self.recursive_message)
            .finish()
    }
}

impl ConnectionContext {
    pub fn new(remote_address: SocketAddr) -> Self {
        Self {
            remote_address,
            local_address: None,
            tls_upgraded: None,
            pass_through: None,
            processing_message: false,
            recursive_message: false,
            certificate_service: None,
            tls_config: None,
            server_config: None,
            pipeline_configurator: None,
        }
    }

    pub fn with_local_address(mut self, local_address: SocketAddr) -> Self {
        self.local_address = Some(local_address);
        self
    }

    pub fn with_certificate_service(mut self, service: Arc<ServerCertificateService>) -> Self {
        self.certificate_service = Some(service);
        self
    }

    pub fn with_tls_config(mut self, tls_config: TlsConfig) -> Self {
        self.tls_config = Some(tls_config);
        self
    }

    pub fn with_server_config(mut self, server_config: Arc<ServerConfig>) -> Self {
        self.server_config = Some(server_config);
        self
    }

    pub fn with_pipeline_configurator(
        mut self,
        configurator: Arc<dyn PipelineConfigurator>,
    ) -> Self {
        self.pipeline_configurator = Some(configurator);
        self
    }
}
