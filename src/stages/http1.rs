//! Chain stage around the HTTP/1 request decoder.

use bytes::{Bytes, BytesMut};

use crate::codec::{decode_request, Decoded};
use crate::pipeline::{Event, Stage, StageHandle};
use crate::Result;

pub const DECODE_STAGE: &str = "http.codec";

/// Accumulates inbound bytes and emits one message event per complete
/// request; a chunk may complete several pipelined requests at once.
#[derive(Default)]
pub struct HttpDecodeStage {
    buffer: BytesMut,
}

impl HttpDecodeStage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Stage for HttpDecodeStage {
    fn on_event(&mut self, handle: &mut StageHandle<'_>, event: Event) -> Result<()> {
        let Event::Bytes(data) = event else {
            handle.forward(event);
            return Ok(());
        };
        self.buffer.extend_from_slice(&data);
        loop {
            match decode_request(&mut self.buffer) {
                Decoded::Incomplete => return Ok(()),
                Decoded::Message(message) => {
                    // Bytes behind a CONNECT head belong to the tunnel, not
                    // to this decoder; they stay buffered until the driver
                    // collects them.
                    let connect = !message.has_fault() && message.request_line.is_connect();
                    handle.forward(Event::Message(message));
                    if connect {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn take_buffered(&mut self) -> Option<Bytes> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(self.buffer.split().freeze())
        }
    }
}
