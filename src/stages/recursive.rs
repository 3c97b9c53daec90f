//! Flags requests that target the proxy's own listener.

use std::net::SocketAddr;

use crate::config::ServerConfig;
use crate::pipeline::{Event, Stage, StageHandle};
use crate::{Error, Result};

pub const RECURSIVE_STAGE: &str = "http.recursive";

/// True when `(host, port)` names the proxy's own listener.
pub(crate) fn targets_listener(
    server_config: &ServerConfig,
    local: SocketAddr,
    host: &str,
    port: u16,
) -> bool {
    if port != local.port() {
        return false;
    }
    if host.parse::<std::net::IpAddr>() == Ok(local.ip()) {
        return true;
    }
    server_config.is_any_local_address() && server_config.is_own_host(host)
}

/// Stamps `recursive_message` on every request; never blocks anything.
pub struct RecursiveGuardStage;

impl RecursiveGuardStage {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RecursiveGuardStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for RecursiveGuardStage {
    fn on_event(&mut self, handle: &mut StageHandle<'_>, event: Event) -> Result<()> {
        let Event::Message(message) = event else {
            handle.forward(event);
            return Ok(());
        };

        let ctx = handle.ctx();
        let (Some(server_config), Some(local)) = (ctx.server_config.clone(), ctx.local_address)
        else {
            return Err(Error::chain_assembly(
                "recursive guard requires server config and local address",
            ));
        };

        let recursive = match message.target_host_port() {
            Some((host, port)) => targets_listener(&server_config, local, &host, port),
            None => false,
        };

        handle.ctx().recursive_message = recursive;
        if recursive {
            tracing::debug!(target = ?message.target_host_port(), "request targets this listener");
        }
        handle.forward(Event::Message(message));
        Ok(())
    }
}
