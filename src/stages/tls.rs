//! TLS sniffing and man-in-the-middle termination.
//!
//! The sniff stage looks at the first bytes of a connection. Plaintext
//! removes the stage and lets the bytes continue unchanged; a TLS record
//! header makes it issue a leaf certificate for the connection's subject
//! and splice in the terminator stage under the well-known name [`TLS_STAGE`].
//!
//! The terminator runs an `openssl` handshake over an in-memory transport:
//! ciphertext from the chain is pushed into the transport, the handshake is
//! driven as far as the buffered bytes allow, and decrypted plaintext is
//! forwarded to the next stage. Outbound writes from later stages pass
//! through [`Stage::on_write`] and come back out encrypted.

use bytes::{Bytes, BytesMut};
use openssl::ssl::{
    AlpnError, HandshakeError, MidHandshakeSslStream, Ssl, SslContext, SslContextBuilder,
    SslMethod, SslStream, SslVersion,
};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use crate::certs::ServerCertificate;
use crate::config::{TlsConfig, TlsVersion, APPLICATION_PROTOCOL_HTTP_1_1};
use crate::pipeline::{ChainAccess, Event, Stage, StageHandle};
use crate::stages::http2::PREFACE_STAGE;
use crate::{Error, Result};

/// Well-known name of the terminator stage; the legacy adapter inserts
/// itself relative to it.
pub const TLS_STAGE: &str = "tls";

/// Name of the sniff stage in the default chain.
pub const TLS_SNIFF_STAGE: &str = "tls.sniff";

/// Whether the first bytes of a connection look like a TLS record header.
/// `None` when fewer than three bytes are available.
pub fn starts_like_tls_record(data: &[u8]) -> Option<bool> {
    if data.len() < 3 {
        return None;
    }
    Some(matches!(data[0], 20..=23) && data[1] == 0x03 && (1..=4).contains(&data[2]))
}

/// Extracts the SNI host name from a buffered ClientHello record, if the
/// client sent one.
pub fn extract_sni(record: &[u8]) -> Option<String> {
    let record_len = u16::from_be_bytes([*record.get(3)?, *record.get(4)?]) as usize;
    let payload = record.get(5..5 + record_len)?;

    // Handshake message: type (1, ClientHello) + length (3).
    if *payload.first()? != 1 {
        return None;
    }
    let mut p = payload.get(4..)?;

    // Legacy version (2) + random (32).
    p = p.get(34..)?;
    let session_id_len = *p.first()? as usize;
    p = p.get(1 + session_id_len..)?;
    let cipher_suites_len = u16::from_be_bytes([*p.first()?, *p.get(1)?]) as usize;
    p = p.get(2 + cipher_suites_len..)?;
    let compression_len = *p.first()? as usize;
    p = p.get(1 + compression_len..)?;

    let extensions_len = u16::from_be_bytes([*p.first()?, *p.get(1)?]) as usize;
    let mut extensions = p.get(2..2 + extensions_len)?;
    while extensions.len() >= 4 {
        let ext_type = u16::from_be_bytes([extensions[0], extensions[1]]);
        let ext_len = u16::from_be_bytes([extensions[2], extensions[3]]) as usize;
        let body = extensions.get(4..4 + ext_len)?;
        if ext_type == 0 {
            // server_name list: list length (2), entry type (1), name length (2).
            if *body.get(2)? != 0 {
                return None;
            }
            let name_len = u16::from_be_bytes([*body.get(3)?, *body.get(4)?]) as usize;
            let name = body.get(5..5 + name_len)?;
            return String::from_utf8(name.to_vec()).ok();
        }
        extensions = extensions.get(4 + ext_len..)?;
    }
    None
}

/// Protocol sniffer and interception bootstrap.
pub struct TlsSniffStage {
    authority_override: Option<String>,
    buffered: BytesMut,
}

impl TlsSniffStage {
    pub fn new() -> Self {
        Self {
            authority_override: None,
            buffered: BytesMut::new(),
        }
    }

    /// A sniffer whose certificate subject is fixed up front, used when the
    /// stage is reinstalled for a CONNECT target.
    pub fn with_authority(authority: impl Into<String>) -> Self {
        Self {
            authority_override: Some(authority.into()),
            buffered: BytesMut::new(),
        }
    }

    fn buffered_record_complete(&self) -> bool {
        if self.buffered.len() < 5 {
            return false;
        }
        let record_len = u16::from_be_bytes([self.buffered[3], self.buffered[4]]) as usize;
        self.buffered.len() >= 5 + record_len
    }

    fn upgrade(&mut self, handle: &mut StageHandle<'_>) -> Result<()> {
        let ctx = handle.ctx();
        let (Some(service), Some(tls_config), Some(local)) = (
            ctx.certificate_service.clone(),
            ctx.tls_config.clone(),
            ctx.local_address,
        ) else {
            tracing::error!("TLS upgrade requested on a connection without TLS wiring");
            handle.close();
            handle.remove_self();
            return Ok(());
        };

        let subject = self
            .authority_override
            .clone()
            .or_else(|| extract_sni(&self.buffered))
            .unwrap_or_else(|| local.ip().to_string());

        tracing::debug!(subject = %subject, "terminating TLS");
        let certificate = service.issue_certificate_for(&subject)?;
        let terminator = TlsTerminatorStage::new(certificate, &tls_config)?;
        handle.insert_after_self(TLS_STAGE, Box::new(terminator))?;
        handle.ctx().tls_upgraded = Some(true);
        handle.remove_self();
        handle.forward(Event::Bytes(self.buffered.split().freeze()));
        Ok(())
    }
}

impl Default for TlsSniffStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for TlsSniffStage {
    fn on_event(&mut self, handle: &mut StageHandle<'_>, event: Event) -> Result<()> {
        let Event::Bytes(data) = event else {
            handle.forward(event);
            return Ok(());
        };
        self.buffered.extend_from_slice(&data);

        match starts_like_tls_record(&self.buffered) {
            None => Ok(()),
            Some(false) => {
                handle.ctx().tls_upgraded = Some(false);
                handle.remove_self();
                handle.forward(Event::Bytes(self.buffered.split().freeze()));
                Ok(())
            }
            Some(true) => {
                // Hold off until the whole first record is buffered so the
                // certificate subject can come from the ClientHello's SNI.
                if !self.buffered_record_complete() {
                    return Ok(());
                }
                self.upgrade(handle)
            }
        }
    }

    fn take_buffered(&mut self) -> Option<Bytes> {
        if self.buffered.is_empty() {
            None
        } else {
            Some(self.buffered.split().freeze())
        }
    }
}

/// In-memory transport the handshake runs over: the chain feeds ciphertext
/// into `input`, encrypted output accumulates in `output`.
#[derive(Clone)]
struct MemTransport(Arc<Mutex<MemBuffers>>);

#[derive(Default)]
struct MemBuffers {
    input: VecDeque<u8>,
    output: Vec<u8>,
}

impl MemTransport {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(MemBuffers::default())))
    }

    fn push_input(&self, data: &[u8]) {
        self.0.lock().expect("transport lock").input.extend(data);
    }

    fn drain_output(&self) -> Option<Bytes> {
        let mut buffers = self.0.lock().expect("transport lock");
        if buffers.output.is_empty() {
            None
        } else {
            Some(Bytes::from(std::mem::take(&mut buffers.output)))
        }
    }
}

impl Read for MemTransport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut buffers = self.0.lock().expect("transport lock");
        if buffers.input.is_empty() {
            return Err(std::io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(buffers.input.len());
        for slot in buf.iter_mut().take(n) {
            *slot = buffers.input.pop_front().expect("non-empty input");
        }
        Ok(n)
    }
}

impl Write for MemTransport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .expect("transport lock")
            .output
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

enum TlsState {
    Handshaking(MidHandshakeSslStream<MemTransport>),
    Ready(SslStream<MemTransport>),
    Failed,
}

/// The terminator installed under [`TLS_STAGE`].
pub struct TlsTerminatorStage {
    transport: MemTransport,
    state: TlsState,
    alpn_enabled: bool,
    configured: bool,
}

impl TlsTerminatorStage {
    pub fn new(certificate: ServerCertificate, tls_config: &TlsConfig) -> Result<Self> {
        let context = build_ssl_context(&certificate, tls_config)?;
        let transport = MemTransport::new();

        let ssl = Ssl::new(&context)?;
        let state = match ssl.accept(transport.clone()) {
            Ok(stream) => TlsState::Ready(stream),
            Err(HandshakeError::WouldBlock(mid)) => TlsState::Handshaking(mid),
            Err(HandshakeError::Failure(mid)) => {
                return Err(Error::TlsHandshake(mid.error().to_string()))
            }
            Err(HandshakeError::SetupFailure(e)) => return Err(Error::Tls(e)),
        };

        Ok(Self {
            transport,
            state,
            alpn_enabled: tls_config.is_alpn_enabled(),
            configured: false,
        })
    }

    fn flush_output(&mut self, handle: &mut StageHandle<'_>) -> Result<()> {
        if let Some(encrypted) = self.transport.drain_output() {
            handle.write(encrypted)?;
        }
        Ok(())
    }

    fn drive(&mut self, handle: &mut StageHandle<'_>) -> Result<()> {
        loop {
            match std::mem::replace(&mut self.state, TlsState::Failed) {
                TlsState::Handshaking(mid) => match mid.handshake() {
                    Ok(stream) => {
                        self.state = TlsState::Ready(stream);
                        self.on_handshake_complete(handle)?;
                    }
                    Err(HandshakeError::WouldBlock(mid)) => {
                        self.state = TlsState::Handshaking(mid);
                        return self.flush_output(handle);
                    }
                    Err(HandshakeError::Failure(mid)) => {
                        // Flush the alert before reporting.
                        let message = mid.error().to_string();
                        self.flush_output(handle)?;
                        return Err(Error::TlsHandshake(message));
                    }
                    Err(HandshakeError::SetupFailure(e)) => return Err(Error::Tls(e)),
                },
                TlsState::Ready(mut stream) => {
                    let mut plaintext = BytesMut::new();
                    let mut chunk = [0u8; 8192];
                    let outcome = loop {
                        match stream.read(&mut chunk) {
                            Ok(0) => break Ok(true),
                            Ok(n) => plaintext.extend_from_slice(&chunk[..n]),
                            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                                break Ok(false)
                            }
                            Err(e) => break Err(Error::TlsHandshake(e.to_string())),
                        }
                    };
                    self.state = TlsState::Ready(stream);
                    self.flush_output(handle)?;
                    if !plaintext.is_empty() {
                        handle.forward(Event::Bytes(plaintext.freeze()));
                    }
                    match outcome {
                        Ok(true) => {
                            handle.close();
                            return Ok(());
                        }
                        Ok(false) => return Ok(()),
                        Err(e) => return Err(e),
                    }
                }
                TlsState::Failed => {
                    return Err(Error::TlsHandshake("handshake already failed".to_string()))
                }
            }
        }
    }

    fn on_handshake_complete(&mut self, handle: &mut StageHandle<'_>) -> Result<()> {
        if self.configured || !self.alpn_enabled {
            return Ok(());
        }
        self.configured = true;

        let negotiated = match &self.state {
            TlsState::Ready(stream) => stream
                .ssl()
                .selected_alpn_protocol()
                .map(|p| String::from_utf8_lossy(p).into_owned()),
            _ => None,
        };

        let protocol = negotiated
            .clone()
            .unwrap_or_else(|| APPLICATION_PROTOCOL_HTTP_1_1.to_string());
        tracing::debug!(protocol = %protocol, "ALPN negotiation concluded");

        if negotiated.is_some() {
            // The protocol decision is made; re-sniffing the plaintext for
            // an HTTP/2 preface would be redundant.
            handle.remove(PREFACE_STAGE);
        }
        if let Some(configurator) = handle.ctx().pipeline_configurator.clone() {
            configurator.configure(handle, &protocol);
        }
        handle.protocol_configured(&protocol);
        Ok(())
    }
}

impl Stage for TlsTerminatorStage {
    fn on_event(&mut self, handle: &mut StageHandle<'_>, event: Event) -> Result<()> {
        match event {
            Event::Bytes(data) => {
                self.transport.push_input(&data);
                self.drive(handle)
            }
            other => {
                handle.forward(other);
                Ok(())
            }
        }
    }

    fn on_write(&mut self, data: Bytes) -> Result<Vec<Bytes>> {
        let TlsState::Ready(stream) = &mut self.state else {
            return Err(Error::TlsHandshake(
                "write before the handshake completed".to_string(),
            ));
        };
        stream
            .write_all(&data)
            .map_err(|e| Error::TlsHandshake(e.to_string()))?;
        Ok(self.transport.drain_output().into_iter().collect())
    }
}

fn build_ssl_context(certificate: &ServerCertificate, tls_config: &TlsConfig) -> Result<SslContext> {
    let mut builder = SslContextBuilder::new(SslMethod::tls_server())?;
    builder.set_certificate(&certificate.cert)?;
    builder.set_private_key(&certificate.key)?;
    builder.check_private_key()?;

    let enabled = tls_config.enabled_protocols();
    if enabled.is_empty() {
        // An empty range no client can satisfy; every handshake fails.
        builder.set_min_proto_version(Some(SslVersion::TLS1_3))?;
        builder.set_max_proto_version(Some(SslVersion::TLS1))?;
    } else {
        // openssl exposes a contiguous version range rather than a set.
        let min = enabled.iter().min().expect("non-empty");
        let max = enabled.iter().max().expect("non-empty");
        builder.set_min_proto_version(Some(ssl_version(*min)))?;
        builder.set_max_proto_version(Some(ssl_version(*max)))?;
    }

    if tls_config.is_alpn_enabled() {
        let wire = alpn_wire_format(tls_config.application_protocols());
        builder.set_alpn_select_callback(move |_ssl, client| {
            // The callback must hand back a slice of the client's offer.
            let chosen =
                openssl::ssl::select_next_proto(&wire, client).ok_or(AlpnError::NOACK)?;
            client_offer(client, chosen).ok_or(AlpnError::NOACK)
        });
    }

    Ok(builder.build())
}

/// Finds `protocol` in a length-prefixed ALPN offer, returning the matching
/// subslice of `client`.
fn client_offer<'a>(client: &'a [u8], protocol: &[u8]) -> Option<&'a [u8]> {
    let mut rest = client;
    while let Some((&len, tail)) = rest.split_first() {
        let len = len as usize;
        if tail.len() < len {
            return None;
        }
        if &tail[..len] == protocol {
            return Some(&tail[..len]);
        }
        rest = &tail[len..];
    }
    None
}

fn ssl_version(version: TlsVersion) -> SslVersion {
    match version {
        TlsVersion::Tls1 => SslVersion::TLS1,
        TlsVersion::Tls1_1 => SslVersion::TLS1_1,
        TlsVersion::Tls1_2 => SslVersion::TLS1_2,
        TlsVersion::Tls1_3 => SslVersion::TLS1_3,
    }
}

fn alpn_wire_format(protocols: &[String]) -> Vec<u8> {
    let mut wire = Vec::new();
    for protocol in protocols {
        wire.push(protocol.len() as u8);
        wire.extend_from_slice(protocol.as_bytes());
    }
    wire
}
