//! Stamps connection-derived metadata onto every parsed request.

use crate::pipeline::{Event, Stage, StageHandle};
use crate::Result;

pub const STAMPER_STAGE: &str = "http.stamper";

pub struct MessageStamperStage;

impl MessageStamperStage {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MessageStamperStage {
    fn default() -> Self {
        Self::new()
    }
}

impl Stage for MessageStamperStage {
    fn on_event(&mut self, handle: &mut StageHandle<'_>, event: Event) -> Result<()> {
        match event {
            Event::Message(mut message) => {
                message.sender = Some(handle.ctx().remote_address);
                handle.forward(Event::Message(message));
            }
            other => handle.forward(other),
        }
        Ok(())
    }
}
