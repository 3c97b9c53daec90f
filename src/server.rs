//! Accept loop and per-connection driver.
//!
//! The server builds a default chain for every accepted socket and pumps
//! bytes through it, applying the effects the stages record: socket
//! writes, pass-through tunnels, protocol reconfiguration, close.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::certs::ServerCertificateService;
use crate::config::{Config, ServerConfig, TlsConfig};
use crate::message::HttpMessage;
use crate::pipeline::{
    Chain, ChainAccess, ConnectionContext, ConnectionRegistry, Effect, Event, PipelineConfigurator,
};
use crate::stages::classifier::{ExceptionClassifierStage, CLASSIFIER_STAGE};
use crate::stages::connect::{ConnectStage, PassThroughPredicate, CONNECT_STAGE};
use crate::stages::http1::{HttpDecodeStage, DECODE_STAGE};
use crate::stages::http2::{H2cUpgradeStage, PrefaceSniffStage, PREFACE_STAGE, UPGRADE_STAGE};
use crate::stages::recursive::{RecursiveGuardStage, RECURSIVE_STAGE};
use crate::stages::stamper::{MessageStamperStage, STAMPER_STAGE};
use crate::stages::timeout::{ReadTimeoutStage, TIMEOUT_STAGE};
use crate::stages::tls::{TlsSniffStage, TLS_SNIFF_STAGE};
use crate::Result;

const IDLE_CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// Application logic sitting behind the chain; receives every request that
/// traversed all stages and may produce a raw response.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, ctx: &ConnectionContext, message: HttpMessage) -> Option<Bytes>;
}

/// Fallback handler for a server wired without application logic.
pub struct NotImplementedHandler;

impl RequestHandler for NotImplementedHandler {
    fn handle(&self, _ctx: &ConnectionContext, message: HttpMessage) -> Option<Bytes> {
        debug!(
            method = %message.request_line.method,
            target = %message.request_line.target,
            "no request handler installed"
        );
        Some(Bytes::from_static(
            b"HTTP/1.1 501 Not Implemented\r\nConnection: close\r\nContent-Length: 0\r\n\r\n",
        ))
    }
}

enum Action {
    Continue,
    Close,
    Tunnel { host: String, port: u16 },
}

pub struct ProxyServer {
    config: Arc<Config>,
    tls_config: TlsConfig,
    certificates: Arc<ServerCertificateService>,
    registry: Arc<ConnectionRegistry>,
    configurator: Option<Arc<dyn PipelineConfigurator>>,
    handler: Arc<dyn RequestHandler>,
}

impl ProxyServer {
    pub fn new(config: Config) -> Result<Self> {
        let tls_config = config.tls_config()?;
        let certificates = Arc::new(ServerCertificateService::load_or_generate(
            config.cert_store_path(),
        )?);
        Ok(Self {
            config: Arc::new(config),
            tls_config,
            certificates,
            registry: ConnectionRegistry::new(),
            configurator: None,
            handler: Arc::new(NotImplementedHandler),
        })
    }

    pub fn with_handler(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn with_pipeline_configurator(mut self, configurator: Arc<dyn PipelineConfigurator>) -> Self {
        self.configurator = Some(configurator);
        self
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Cancels every live connection.
    pub fn shutdown(&self) {
        self.registry.close_all();
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind(self.config.listen_addr()).await?;
        let local = listener.local_addr()?;
        let server_config =
            Arc::new(ServerConfig::new(local).with_aliases(self.config.aliases.clone()));
        info!(%local, "proxy listening");

        loop {
            match listener.accept().await {
                Ok((stream, remote)) => {
                    debug!(%remote, "connection accepted");
                    let server = Arc::clone(&self);
                    let server_config = Arc::clone(&server_config);
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, server_config).await {
                            debug!(%remote, error = %e, "connection ended with error");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                }
            }
        }
    }

    fn pass_through_predicate(&self) -> Option<PassThroughPredicate> {
        if self.config.connect_pass_through.is_empty() {
            return None;
        }
        let patterns = self.config.connect_pass_through.clone();
        Some(Arc::new(move |host: &str, _port: u16| {
            patterns.iter().any(|pattern| {
                if let Some(suffix) = pattern.strip_prefix("*.") {
                    host.len() > suffix.len() && host.to_ascii_lowercase().ends_with(suffix)
                } else {
                    pattern.eq_ignore_ascii_case(host)
                }
            })
        }))
    }

    fn build_chain(
        &self,
        remote: std::net::SocketAddr,
        local: std::net::SocketAddr,
        server_config: Arc<ServerConfig>,
    ) -> Result<Chain> {
        let mut ctx = ConnectionContext::new(remote)
            .with_local_address(local)
            .with_certificate_service(Arc::clone(&self.certificates))
            .with_tls_config(self.tls_config.clone())
            .with_server_config(server_config);
        if let Some(configurator) = &self.configurator {
            ctx = ctx.with_pipeline_configurator(Arc::clone(configurator));
        }

        let mut chain = Chain::new(ctx);
        if self.config.read_timeout_secs > 0 {
            let timeout = Duration::from_secs(self.config.read_timeout_secs);
            chain.add_last(TIMEOUT_STAGE, Box::new(ReadTimeoutStage::new(timeout)?))?;
        }
        chain.add_last(TLS_SNIFF_STAGE, Box::new(TlsSniffStage::new()))?;
        chain.add_last(PREFACE_STAGE, Box::new(PrefaceSniffStage::new()))?;
        chain.add_last(DECODE_STAGE, Box::new(HttpDecodeStage::new()))?;
        chain.add_last(STAMPER_STAGE, Box::new(MessageStamperStage::new()))?;
        chain.add_last(
            CONNECT_STAGE,
            Box::new(ConnectStage::new(self.pass_through_predicate())),
        )?;
        chain.add_last(UPGRADE_STAGE, Box::new(H2cUpgradeStage::new()))?;
        chain.add_last(RECURSIVE_STAGE, Box::new(RecursiveGuardStage::new()))?;
        chain.add_last(CLASSIFIER_STAGE, Box::new(ExceptionClassifierStage::new()))?;
        Ok(chain)
    }

    async fn handle_connection(
        &self,
        mut stream: TcpStream,
        server_config: Arc<ServerConfig>,
    ) -> Result<()> {
        let guard = self.registry.register();
        let remote = stream.peer_addr()?;
        let local = stream.local_addr()?;
        let mut chain = self.build_chain(remote, local, server_config)?;

        let effects = chain.dispatch(Event::Active);
        if !matches!(
            self.apply_effects(&mut chain, &mut stream, effects).await?,
            Action::Continue
        ) {
            return Ok(());
        }

        let mut ticker = tokio::time::interval(IDLE_CHECK_INTERVAL);
        let mut buf = BytesMut::with_capacity(16 * 1024);
        loop {
            let effects = tokio::select! {
                read = stream.read_buf(&mut buf) => match read {
                    Ok(0) => {
                        debug!(%remote, "peer closed the connection");
                        chain.dispatch(Event::Inactive);
                        return Ok(());
                    }
                    Ok(_) => chain.dispatch(Event::Bytes(buf.split().freeze())),
                    Err(e) => chain.dispatch(Event::Fault(e.into())),
                },
                _ = ticker.tick() => chain.dispatch(Event::IdleCheck(Instant::now())),
                _ = guard.token().cancelled() => {
                    debug!(%remote, "connection cancelled");
                    chain.dispatch(Event::Inactive);
                    let _ = stream.shutdown().await;
                    return Ok(());
                }
            };

            match self.apply_effects(&mut chain, &mut stream, effects).await? {
                Action::Continue => {}
                Action::Close => {
                    chain.dispatch(Event::Inactive);
                    let _ = stream.shutdown().await;
                    return Ok(());
                }
                Action::Tunnel { host, port } => {
                    // Client bytes that arrived behind the CONNECT head are
                    // still buffered in the chain; they open the tunnel.
                    let residual = chain.drain_buffered();
                    chain.dispatch(Event::Inactive);
                    return run_tunnel(stream, &host, port, residual).await;
                }
            }
        }
    }

    async fn apply_effects(
        &self,
        chain: &mut Chain,
        stream: &mut TcpStream,
        effects: Vec<Effect>,
    ) -> Result<Action> {
        let mut queue: VecDeque<Effect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::Write(data) => stream.write_all(&data).await?,
                Effect::Deliver(message) => {
                    self.deliver(chain, message)?;
                    queue.extend(chain.take_effects());
                }
                Effect::ProtocolConfigured(protocol) => {
                    debug!(%protocol, "connection protocol configured");
                }
                Effect::OpenTunnel { host, port } => return Ok(Action::Tunnel { host, port }),
                Effect::Close => return Ok(Action::Close),
            }
        }
        Ok(Action::Continue)
    }

    fn deliver(&self, chain: &mut Chain, mut message: HttpMessage) -> Result<()> {
        if let Some(fault) = message.fault.take() {
            let effects = chain.dispatch(Event::Fault(fault));
            for effect in effects {
                chain.push_effect(effect);
            }
            return Ok(());
        }

        // A CONNECT that was not passed through is answered here and the
        // connection re-armed for interception of the tunneled stream.
        if message.request_line.is_connect() && chain.ctx().pass_through == Some(false) {
            return self.rearm_for_interception(chain, &message);
        }

        chain.ctx_mut().processing_message = true;
        let response = self.handler.handle(chain.ctx(), message);
        chain.ctx_mut().processing_message = false;
        if let Some(response) = response {
            chain.write_outbound(response)?;
        }
        Ok(())
    }

    fn rearm_for_interception(&self, chain: &mut Chain, message: &HttpMessage) -> Result<()> {
        let authority = message
            .target_host_port()
            .map(|(host, _)| host)
            .unwrap_or_else(|| message.request_line.target.clone());
        debug!(%authority, "intercepting CONNECT tunnel");

        chain.write_outbound(Bytes::from_static(
            b"HTTP/1.1 200 Connection established\r\n\r\n",
        ))?;
        let residual = chain.drain_buffered();
        chain.ctx_mut().tls_upgraded = None;
        chain.insert_first(
            TLS_SNIFF_STAGE,
            Box::new(TlsSniffStage::with_authority(authority)),
        )?;
        if !chain.contains_stage(PREFACE_STAGE) {
            chain.insert_after(
                TLS_SNIFF_STAGE,
                PREFACE_STAGE,
                Box::new(PrefaceSniffStage::new()),
            )?;
        }
        if !chain.contains_stage(UPGRADE_STAGE) {
            chain.insert_after(DECODE_STAGE, UPGRADE_STAGE, Box::new(H2cUpgradeStage::new()))?;
        }

        // Bytes that trailed the CONNECT head are re-sniffed by the fresh
        // stages.
        for chunk in residual {
            let effects = chain.dispatch(Event::Bytes(chunk));
            for effect in effects {
                chain.push_effect(effect);
            }
        }
        Ok(())
    }
}

/// Relays bytes between the client and the CONNECT target until either
/// side closes; a failed outbound connect closes the client right after
/// the 200 that was already written.
async fn run_tunnel(
    mut client: TcpStream,
    host: &str,
    port: u16,
    residual: Vec<Bytes>,
) -> Result<()> {
    let mut upstream = match TcpStream::connect((host, port)).await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!(%host, port, error = %e, "CONNECT target unreachable");
            let _ = client.shutdown().await;
            return Ok(());
        }
    };
    for chunk in residual {
        upstream.write_all(&chunk).await?;
    }
    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((to_upstream, to_client)) => {
            debug!(%host, port, to_upstream, to_client, "tunnel closed");
        }
        Err(e) => {
            debug!(%host, port, error = %e, "tunnel aborted");
        }
    }
    let _ = client.shutdown().await;
    let _ = upstream.shutdown().await;
    Ok(())
}
