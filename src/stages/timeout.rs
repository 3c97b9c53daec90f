//! Idle read timeout.
//!
//! The driver ticks the chain with [`Event::IdleCheck`]; when the interval
//! since the last read has elapsed and no message is being processed, the
//! guard forwards a timeout fault. It stays installed afterwards, so a
//! keep-alive connection can time out more than once.

use std::time::{Duration, Instant};

use crate::pipeline::{Event, Stage, StageHandle};
use crate::{Error, Result};

pub const TIMEOUT_STAGE: &str = "timeout";

pub struct ReadTimeoutStage {
    timeout: Duration,
    last_activity: Instant,
}

impl ReadTimeoutStage {
    pub fn new(timeout: Duration) -> Result<Self> {
        if timeout.is_zero() {
            return Err(Error::invalid_argument("read timeout must be positive"));
        }
        Ok(Self {
            timeout,
            last_activity: Instant::now(),
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Stage for ReadTimeoutStage {
    fn on_event(&mut self, handle: &mut StageHandle<'_>, event: Event) -> Result<()> {
        match event {
            Event::Active => {
                self.last_activity = Instant::now();
                handle.forward(Event::Active);
                Ok(())
            }
            Event::Bytes(data) => {
                self.last_activity = Instant::now();
                handle.forward(Event::Bytes(data));
                Ok(())
            }
            Event::IdleCheck(now) => {
                if handle.ctx().processing_message {
                    // A request is in flight; suppress firing entirely.
                    self.last_activity = now;
                    return Ok(());
                }
                if now.saturating_duration_since(self.last_activity) >= self.timeout {
                    self.last_activity = now;
                    handle.forward(Event::Fault(Error::ReadTimeout(self.timeout)));
                }
                Ok(())
            }
            other => {
                handle.forward(other);
                Ok(())
            }
        }
    }
}
