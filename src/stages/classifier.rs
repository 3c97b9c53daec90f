//! Terminal fault sink.
//!
//! Classifies any fault surfaced by earlier stages, logs it at the
//! matching severity, and closes the connection. Proxies cannot recover a
//! corrupted stream mid-connection, so there is no retry path.

use crate::pipeline::{Event, Stage, StageHandle};
use crate::{Error, Result};

pub const CLASSIFIER_STAGE: &str = "exception";

pub struct ExceptionClassifierStage;

impl ExceptionClassifierStage {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ExceptionClassifierStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for ExceptionClassifierStage {
    fn on_event(&mut self, handle: &mut StageHandle<'_>, event: Event) -> Result<()> {
        let Event::Fault(fault) = event else {
            handle.forward(event);
            return Ok(());
        };

        let remote = handle.ctx().remote_address;
        match &fault {
            Error::ReadTimeout(timeout) => {
                tracing::debug!(%remote, ?timeout, "connection idle, closing");
            }
            Error::TlsHandshake(cause) => {
                tracing::warn!(%remote, %cause, "TLS handshake failed");
            }
            Error::CertificateGeneration(cause) => {
                tracing::warn!(%remote, %cause, "server certificate generation failed");
            }
            Error::MissingRootCertificate(cause) => {
                tracing::warn!(%remote, %cause, "no root CA certificate available");
            }
            Error::MalformedHeader(cause) => {
                tracing::warn!(%remote, %cause, "malformed HTTP traffic");
            }
            Error::Decode(cause) => {
                tracing::error!(%remote, %cause, "failed to decode inbound traffic");
            }
            Error::Io(cause) => {
                tracing::debug!(%remote, %cause, "connection I/O failed");
            }
            other => {
                tracing::error!(%remote, error = %other, "unexpected connection fault");
            }
        }
        handle.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Chain, ConnectionContext, Effect};
    use std::time::Duration;

    fn classify(fault: Error) -> Vec<Effect> {
        let mut chain = Chain::new(ConnectionContext::new("127.0.0.1:5555".parse().unwrap()));
        chain
            .add_last(CLASSIFIER_STAGE, Box::new(ExceptionClassifierStage::new()))
            .unwrap();
        chain.dispatch(Event::Fault(fault))
    }

    #[test]
    fn test_every_fault_closes_the_connection() {
        let faults = vec![
            Error::ReadTimeout(Duration::from_secs(1)),
            Error::TlsHandshake("alert".to_string()),
            Error::CertificateGeneration("signing failed".to_string()),
            Error::MissingRootCertificate("no root".to_string()),
            Error::MalformedHeader("bad request line".to_string()),
            Error::Decode("unknown frame".to_string()),
            Error::Io(std::io::ErrorKind::ConnectionReset.into()),
            Error::Other("anything".to_string()),
        ];
        for fault in faults {
            let effects = classify(fault);
            assert!(matches!(effects.as_slice(), [Effect::Close]));
        }
    }

    #[test]
    fn test_non_fault_events_pass_through() {
        let mut chain = Chain::new(ConnectionContext::new("127.0.0.1:5555".parse().unwrap()));
        chain
            .add_last(CLASSIFIER_STAGE, Box::new(ExceptionClassifierStage::new()))
            .unwrap();
        let effects = chain.dispatch(Event::Message(crate::message::HttpMessage::new(
            crate::message::RequestLine::new("GET", "/", "HTTP/1.1"),
        )));
        assert!(matches!(effects.as_slice(), [Effect::Deliver(_)]));
    }
}
