//! CONNECT recognition and pass-through decision.

use bytes::Bytes;
use std::sync::Arc;

use crate::pipeline::{Event, Stage, StageHandle};
use crate::stages::recursive::targets_listener;
use crate::Result;

/// Decides whether a CONNECT target may be tunneled without interception.
pub type PassThroughPredicate = Arc<dyn Fn(&str, u16) -> bool + Send + Sync>;

pub const CONNECT_STAGE: &str = "http.connect";

const ESTABLISHED_RESPONSE: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// Handles the first request of a connection when it is a CONNECT.
///
/// An eligible target gets a synthetic 200 and a raw tunnel; an ineligible
/// one is forwarded like any other request so the embedder can answer it
/// (typically with a 200 followed by reinstalling the TLS sniffer for the
/// CONNECT authority).
pub struct ConnectStage {
    predicate: Option<PassThroughPredicate>,
}

impl ConnectStage {
    /// `predicate: None` disables pass-through entirely.
    pub fn new(predicate: Option<PassThroughPredicate>) -> Self {
        Self { predicate }
    }

    fn is_pass_through(&self, host: &str, port: u16) -> bool {
        match &self.predicate {
            Some(predicate) => predicate(host, port),
            None => false,
        }
    }
}

impl Stage for ConnectStage {
    fn on_event(&mut self, handle: &mut StageHandle<'_>, event: Event) -> Result<()> {
        let Event::Message(message) = event else {
            handle.forward(event);
            return Ok(());
        };
        if message.has_fault() {
            handle.forward(Event::Message(message));
            return Ok(());
        }

        // CONNECT is only legal as the first request; one way or another
        // this stage is done after it has seen a complete message.
        handle.remove_self();

        if !message.request_line.is_connect() {
            handle.forward(Event::Message(message));
            return Ok(());
        }

        let Some((host, port)) = message.target_host_port() else {
            handle.forward(Event::Message(message));
            return Ok(());
        };

        if self.is_pass_through(&host, port) {
            tracing::debug!(host = %host, port, "CONNECT target passed through");
            let ctx = handle.ctx();
            ctx.pass_through = Some(true);
            // The recursive guard sits behind this stage and never sees a
            // passed-through CONNECT; stamp the flag here.
            if let (Some(server_config), Some(local)) = (ctx.server_config.clone(), ctx.local_address)
            {
                ctx.recursive_message = targets_listener(&server_config, local, &host, port);
            }
            handle.write(Bytes::from_static(ESTABLISHED_RESPONSE))?;
            handle.open_tunnel(host, port);
        } else {
            handle.ctx().pass_through = Some(false);
            handle.forward(Event::Message(message));
        }
        Ok(())
    }
}

/// Synthetic response for a request rejected as out-of-scope while
/// tunneling.
pub fn out_of_scope_response(body: &str) -> Bytes {
    let mut response = String::new();
    response.push_str("HTTP/1.1 403 Forbidden\r\n");
    response.push_str("Content-Type: text/plain; charset=UTF-8\r\n");
    response.push_str("Cache-Control: no-cache\r\n");
    response.push_str("Pragma: no-cache\r\n");
    response.push_str(&format!("Content-Length: {}\r\n", body.len()));
    response.push_str("\r\n");
    response.push_str(body);
    Bytes::from(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{HttpMessage, RequestLine};
    use crate::pipeline::{Chain, ConnectionContext, Effect};

    fn chain_with_connect(predicate: Option<PassThroughPredicate>) -> Chain {
        let ctx = ConnectionContext::new("127.0.0.1:5555".parse().unwrap());
        let mut chain = Chain::new(ctx);
        chain
            .add_last(CONNECT_STAGE, Box::new(ConnectStage::new(predicate)))
            .unwrap();
        chain
    }

    fn connect_message(target: &str) -> Event {
        Event::Message(HttpMessage::new(RequestLine::new(
            "CONNECT", target, "HTTP/1.1",
        )))
    }

    #[test]
    fn test_pass_through_writes_200_and_opens_tunnel() {
        let predicate: PassThroughPredicate = Arc::new(|_, _| true);
        let mut chain = chain_with_connect(Some(predicate));
        let effects = chain.dispatch(connect_message("example.org:8443"));
        match effects.as_slice() {
            [Effect::Write(response), Effect::OpenTunnel { host, port }] => {
                assert!(response.starts_with(b"HTTP/1.1 200 Connection established"));
                assert_eq!(host, "example.org");
                assert_eq!(*port, 8443);
            }
            other => panic!("unexpected effects: {other:?}"),
        }
        assert_eq!(chain.ctx().pass_through, Some(true));
        assert!(!chain.contains_stage(CONNECT_STAGE));
    }

    #[test]
    fn test_denied_target_forwarded_with_flag_false() {
        let predicate: PassThroughPredicate = Arc::new(|_, _| false);
        let mut chain = chain_with_connect(Some(predicate));
        let effects = chain.dispatch(connect_message("example.org:443"));
        assert!(matches!(effects.as_slice(), [Effect::Deliver(_)]));
        assert_eq!(chain.ctx().pass_through, Some(false));
    }

    #[test]
    fn test_pass_through_to_own_listener_is_stamped_recursive() {
        use crate::config::ServerConfig;

        let listener: std::net::SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let ctx = ConnectionContext::new("127.0.0.1:50000".parse().unwrap())
            .with_local_address(listener)
            .with_server_config(Arc::new(ServerConfig::new(listener)));
        let mut chain = Chain::new(ctx);
        let predicate: PassThroughPredicate = Arc::new(|_, _| true);
        chain
            .add_last(CONNECT_STAGE, Box::new(ConnectStage::new(Some(predicate))))
            .unwrap();

        chain.dispatch(connect_message("127.0.0.1:8080"));
        assert!(chain.ctx().recursive_message);

        let mut chain = Chain::new(
            ConnectionContext::new("127.0.0.1:50000".parse().unwrap())
                .with_local_address(listener)
                .with_server_config(Arc::new(ServerConfig::new(listener))),
        );
        let predicate: PassThroughPredicate = Arc::new(|_, _| true);
        chain
            .add_last(CONNECT_STAGE, Box::new(ConnectStage::new(Some(predicate))))
            .unwrap();
        chain.dispatch(connect_message("example.org:443"));
        assert!(!chain.ctx().recursive_message);
    }

    #[test]
    fn test_no_predicate_disables_pass_through() {
        let mut chain = chain_with_connect(None);
        chain.dispatch(connect_message("example.org:443"));
        assert_eq!(chain.ctx().pass_through, Some(false));
    }

    #[test]
    fn test_non_connect_removes_stage_untouched() {
        let predicate: PassThroughPredicate = Arc::new(|_, _| true);
        let mut chain = chain_with_connect(Some(predicate));
        let effects = chain.dispatch(Event::Message(HttpMessage::new(RequestLine::new(
            "GET", "/", "HTTP/1.1",
        ))));
        assert!(matches!(effects.as_slice(), [Effect::Deliver(_)]));
        assert_eq!(chain.ctx().pass_through, None);
        assert!(!chain.contains_stage(CONNECT_STAGE));
    }

    #[test]
    fn test_faulty_message_skips_connect_logic() {
        let predicate: PassThroughPredicate = Arc::new(|_, _| true);
        let mut chain = chain_with_connect(Some(predicate));
        let effects = chain.dispatch(Event::Message(HttpMessage::faulty(
            crate::Error::MalformedHeader("bad".to_string()),
        )));
        assert!(matches!(effects.as_slice(), [Effect::Deliver(_)]));
        assert!(chain.contains_stage(CONNECT_STAGE));
    }

    #[test]
    fn test_out_of_scope_response_shape() {
        let response = out_of_scope_response("blocked");
        let text = std::str::from_utf8(&response).unwrap();
        assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"));
        assert!(text.contains("Content-Type: text/plain; charset=UTF-8\r\n"));
        assert!(text.contains("Content-Length: 7\r\n"));
        assert!(text.ends_with("\r\n\r\nblocked"));
    }
}
