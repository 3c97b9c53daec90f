//! HTTP/2 detection: connection-preface sniffing and the h2c cleartext
//! upgrade.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::{Bytes, BytesMut};

use crate::config::APPLICATION_PROTOCOL_HTTP_2;
use crate::pipeline::{Event, Stage, StageHandle};
use crate::{Error, Result};

pub const PREFACE_STAGE: &str = "http2.preface";
pub const UPGRADE_STAGE: &str = "http2.upgrade";

/// The fixed HTTP/2 client connection preface.
pub const HTTP2_PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Watches the leading bytes of a (possibly just-decrypted) stream for the
/// HTTP/2 connection preface.
#[derive(Default)]
pub struct PrefaceSniffStage {
    buffered: BytesMut,
}

impl PrefaceSniffStage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Stage for PrefaceSniffStage {
    fn on_event(&mut self, handle: &mut StageHandle<'_>, event: Event) -> Result<()> {
        let Event::Bytes(data) = event else {
            handle.forward(event);
            return Ok(());
        };
        self.buffered.extend_from_slice(&data);

        let compare = self.buffered.len().min(HTTP2_PREFACE.len());
        if self.buffered[..compare] != HTTP2_PREFACE[..compare] {
            handle.remove_self();
            handle.forward(Event::Bytes(self.buffered.split().freeze()));
            return Ok(());
        }
        if self.buffered.len() < HTTP2_PREFACE.len() {
            // A strict prefix of the preface; wait for more bytes.
            return Ok(());
        }

        tracing::debug!("HTTP/2 connection preface detected");
        if let Some(configurator) = handle.ctx().pipeline_configurator.clone() {
            configurator.configure(handle, APPLICATION_PROTOCOL_HTTP_2);
        }
        handle.protocol_configured(APPLICATION_PROTOCOL_HTTP_2);
        handle.remove_self();
        handle.forward(Event::Bytes(self.buffered.split().freeze()));
        Ok(())
    }

    fn take_buffered(&mut self) -> Option<Bytes> {
        if self.buffered.is_empty() {
            None
        } else {
            Some(self.buffered.split().freeze())
        }
    }
}

/// Examines exactly one parsed request for an h2c upgrade.
pub struct H2cUpgradeStage;

impl H2cUpgradeStage {
    pub fn new() -> Self {
        Self
    }
}

impl Default for H2cUpgradeStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for H2cUpgradeStage {
    fn on_event(&mut self, handle: &mut StageHandle<'_>, event: Event) -> Result<()> {
        let Event::Message(mut message) = event else {
            handle.forward(event);
            return Ok(());
        };
        if message.has_fault() {
            handle.forward(Event::Message(message));
            return Ok(());
        }

        // Upgrade can only be attempted on the first request.
        handle.remove_self();

        let wants_upgrade = message.headers.contains_token("Upgrade", "h2c")
            && message.headers.contains_token("Connection", "Upgrade")
            && message.headers.contains_token("Connection", "HTTP2-Settings");
        if !wants_upgrade {
            handle.forward(Event::Message(message));
            return Ok(());
        }

        let Some(settings) = message.headers.get("HTTP2-Settings") else {
            handle.forward(Event::Message(message));
            return Ok(());
        };
        if URL_SAFE_NO_PAD.decode(settings.trim()).is_err() {
            return Err(Error::decode(format!(
                "invalid HTTP2-Settings value: {settings}"
            )));
        }

        message.headers.remove("Connection");
        message.headers.remove("Proxy-Connection");
        message.headers.remove("Upgrade");
        message.headers.remove("HTTP2-Settings");

        tracing::debug!("upgrading connection to h2c");
        if let Some(configurator) = handle.ctx().pipeline_configurator.clone() {
            configurator.configure(handle, APPLICATION_PROTOCOL_HTTP_2);
        }
        handle.protocol_configured(APPLICATION_PROTOCOL_HTTP_2);
        // The upgraded request continues down the chain to the spliced-in
        // HTTP/2 processor (or the embedder, if none was installed).
        handle.forward(Event::Message(message));
        Ok(())
    }
}
