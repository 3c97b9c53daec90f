//! Blocking byte-stream view of a connection for legacy synchronous code.
//!
//! The adapter inserts a capture stage into the chain: inbound chunks are
//! queued and handed out by blocking reads on the caller's own thread,
//! woken by a condvar on data arrival, close, or interrupt. Writes are
//! queued the other way and pumped back through the chain by the
//! connection's driver, so they still pass the TLS terminator when one is
//! installed.

use bytes::Bytes;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex};
use tokio::sync::Notify;

use crate::pipeline::{Chain, ChainAccess, Event, Stage, StageHandle};
use crate::stages::timeout::TIMEOUT_STAGE;
use crate::stages::tls::TLS_STAGE;
use crate::{Error, Result};

pub const LEGACY_STAGE: &str = "legacy";

#[derive(Default)]
struct Inner {
    chunks: VecDeque<Bytes>,
    offset: usize,
    inactive: bool,
    interrupted: bool,
    closed: bool,
    outbound: VecDeque<Bytes>,
    nodelay: Option<bool>,
    keepalive: Option<bool>,
}

struct Shared {
    inner: Mutex<Inner>,
    readable: Condvar,
    /// Wakes the async driver when there is outbound data or a close to act on.
    driver: Notify,
}

/// Capture stage living in the chain; feeds the blocking side.
struct LegacyAdapterStage {
    shared: Arc<Shared>,
}

impl Stage for LegacyAdapterStage {
    fn on_event(&mut self, handle: &mut StageHandle<'_>, event: Event) -> Result<()> {
        match event {
            Event::Bytes(data) => {
                let mut inner = self.shared.inner.lock().expect("legacy lock");
                inner.chunks.push_back(data);
                self.shared.readable.notify_all();
            }
            Event::Inactive => {
                let mut inner = self.shared.inner.lock().expect("legacy lock");
                inner.inactive = true;
                self.shared.readable.notify_all();
                drop(inner);
                handle.forward(Event::Inactive);
            }
            other => handle.forward(other),
        }
        Ok(())
    }
}

/// Handle held by the legacy caller; clones share the same connection.
#[derive(Clone)]
pub struct LegacyStream {
    shared: Arc<Shared>,
}

impl LegacyStream {
    /// Splices the adapter into `chain`.
    ///
    /// `tls_upgraded` must already be decided, and the chain must still
    /// carry its read timeout stage (which is removed here, since legacy
    /// callers manage their own timeouts). With TLS upgraded the capture
    /// stage goes right after the terminator so it sees plaintext;
    /// otherwise it goes first.
    pub fn attach(chain: &mut Chain) -> Result<Self> {
        let upgraded = chain.ctx().tls_upgraded.ok_or_else(|| {
            Error::chain_assembly("legacy adapter requires tls_upgraded to be decided")
        })?;
        // Validate the insertion point before mutating the chain, so a
        // failed attach leaves it untouched.
        if upgraded && !chain.contains(TLS_STAGE) {
            return Err(Error::chain_assembly(
                "legacy adapter requires the TLS terminator as insertion point",
            ));
        }
        if !chain.remove(TIMEOUT_STAGE) {
            return Err(Error::chain_assembly(
                "legacy adapter requires a read timeout stage to remove",
            ));
        }

        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner::default()),
            readable: Condvar::new(),
            driver: Notify::new(),
        });
        let stage = Box::new(LegacyAdapterStage {
            shared: Arc::clone(&shared),
        });
        if upgraded {
            chain.insert_after(TLS_STAGE, LEGACY_STAGE, stage)?;
        } else {
            chain.insert_first(LEGACY_STAGE, stage)?;
        }
        Ok(Self { shared })
    }

    /// Blocking read into `buf`. Returns 0 at end-of-stream: the connection
    /// went inactive, the stream was closed, or the waiting caller was
    /// interrupted. A read never splits data out of order and may combine
    /// bytes from several arrived chunks.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut inner = self.shared.inner.lock().expect("legacy lock");
        loop {
            if !inner.chunks.is_empty() {
                break;
            }
            if inner.inactive || inner.closed || inner.interrupted {
                return Ok(0);
            }
            inner = self.shared.readable.wait(inner).expect("legacy lock");
        }

        let mut copied = 0;
        while copied < buf.len() {
            let Some(front) = inner.chunks.front() else {
                break;
            };
            let available = &front[inner.offset..];
            let n = available.len().min(buf.len() - copied);
            buf[copied..copied + n].copy_from_slice(&available[..n]);
            copied += n;
            if inner.offset + n == front.len() {
                inner.chunks.pop_front();
                inner.offset = 0;
            } else {
                inner.offset += n;
            }
        }
        Ok(copied)
    }

    /// Single-byte read is unsupported; callers must use the buffer form.
    pub fn read_byte(&self) -> io::Result<u8> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "single-byte read is not supported",
        ))
    }

    /// Queues `data` for the connection; the driver flushes it through the
    /// chain (encrypting it when a TLS terminator is installed).
    pub fn write(&self, data: &[u8]) -> io::Result<()> {
        let mut inner = self.shared.inner.lock().expect("legacy lock");
        if inner.closed || inner.inactive {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "stream is closed",
            ));
        }
        inner.outbound.push_back(Bytes::copy_from_slice(data));
        drop(inner);
        self.shared.driver.notify_one();
        Ok(())
    }

    /// Single-byte write is unsupported; callers must use the buffer form.
    pub fn write_byte(&self, _byte: u8) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "single-byte write is not supported",
        ))
    }

    /// Closes the connection. Idempotent; closing either stream side ends
    /// up here.
    pub fn close(&self) {
        let mut inner = self.shared.inner.lock().expect("legacy lock");
        if inner.closed {
            return;
        }
        inner.closed = true;
        drop(inner);
        self.shared.readable.notify_all();
        self.shared.driver.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        let inner = self.shared.inner.lock().expect("legacy lock");
        inner.closed || inner.inactive
    }

    /// The adapter never represents a not-yet-connected socket.
    pub fn is_connected(&self) -> bool {
        true
    }

    /// Wakes a blocked reader, which then observes end-of-stream.
    pub fn interrupt(&self) {
        self.shared.inner.lock().expect("legacy lock").interrupted = true;
        self.shared.readable.notify_all();
    }

    pub fn set_nodelay(&self, nodelay: bool) {
        self.shared.inner.lock().expect("legacy lock").nodelay = Some(nodelay);
        self.shared.driver.notify_one();
    }

    pub fn set_keepalive(&self, keepalive: bool) {
        self.shared.inner.lock().expect("legacy lock").keepalive = Some(keepalive);
        self.shared.driver.notify_one();
    }

    /// Requested socket options, consumed by the driver.
    pub fn take_socket_options(&self) -> (Option<bool>, Option<bool>) {
        let mut inner = self.shared.inner.lock().expect("legacy lock");
        (inner.nodelay.take(), inner.keepalive.take())
    }

    /// True once `close` was requested from the legacy side.
    pub fn close_requested(&self) -> bool {
        self.shared.inner.lock().expect("legacy lock").closed
    }

    /// Completes when there is driver work pending (outbound data, socket
    /// options, or a close request).
    pub async fn driver_wakeup(&self) {
        self.shared.driver.notified().await;
    }

    /// Flushes queued writes into the chain at the adapter's position.
    pub fn pump_writes(&self, chain: &mut Chain) -> Result<()> {
        loop {
            let data = {
                let mut inner = self.shared.inner.lock().expect("legacy lock");
                inner.outbound.pop_front()
            };
            match data {
                Some(data) => chain.write_from(LEGACY_STAGE, data)?,
                None => return Ok(()),
            }
        }
    }
}

impl io::Read for LegacyStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        LegacyStream::read(self, buf)
    }
}

impl io::Write for LegacyStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        LegacyStream::write(self, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{ConnectionContext, Effect};
    use crate::stages::timeout::ReadTimeoutStage;
    use std::time::Duration;

    fn chain_with_timeout(tls_upgraded: Option<bool>) -> Chain {
        let mut ctx = ConnectionContext::new("127.0.0.1:5555".parse().unwrap());
        ctx.tls_upgraded = tls_upgraded;
        let mut chain = Chain::new(ctx);
        chain
            .add_last(
                TIMEOUT_STAGE,
                Box::new(ReadTimeoutStage::new(Duration::from_secs(60)).unwrap()),
            )
            .unwrap();
        chain
    }

    #[test]
    fn test_attach_requires_tls_decision() {
        let mut chain = chain_with_timeout(None);
        assert!(matches!(
            LegacyStream::attach(&mut chain),
            Err(Error::ChainAssembly(_))
        ));
    }

    #[test]
    fn test_attach_requires_timeout_stage() {
        let mut chain = Chain::new(ConnectionContext::new("127.0.0.1:5555".parse().unwrap()));
        chain.ctx_mut().tls_upgraded = Some(false);
        assert!(matches!(
            LegacyStream::attach(&mut chain),
            Err(Error::ChainAssembly(_))
        ));
    }

    #[test]
    fn test_attach_requires_tls_stage_when_upgraded() {
        let mut chain = chain_with_timeout(Some(true));
        assert!(matches!(
            LegacyStream::attach(&mut chain),
            Err(Error::ChainAssembly(_))
        ));
        // The failed attach must not have mutated the chain.
        assert_eq!(chain.stage_names(), vec![TIMEOUT_STAGE]);
    }

    #[test]
    fn test_attach_removes_timeout_and_inserts_first() {
        let mut chain = chain_with_timeout(Some(false));
        LegacyStream::attach(&mut chain).unwrap();
        assert_eq!(chain.stage_names(), vec![LEGACY_STAGE]);
    }

    #[test]
    fn test_read_recombines_chunks_in_order() {
        let mut chain = chain_with_timeout(Some(false));
        let stream = LegacyStream::attach(&mut chain).unwrap();

        for piece in [&b"ab"[..], b"cd", b"efg", b"hijk"] {
            chain.dispatch(Event::Bytes(Bytes::copy_from_slice(piece)));
        }

        let mut first = [0u8; 5];
        assert_eq!(stream.read(&mut first).unwrap(), 5);
        assert_eq!(&first, b"abcde");

        let mut second = [0u8; 6];
        assert_eq!(stream.read(&mut second).unwrap(), 6);
        assert_eq!(&second, b"fghijk");
    }

    #[test]
    fn test_short_read_leaves_remainder_queued() {
        let mut chain = chain_with_timeout(Some(false));
        let stream = LegacyStream::attach(&mut chain).unwrap();
        chain.dispatch(Event::Bytes(Bytes::from_static(b"hello")));

        let mut buf = [0u8; 2];
        assert_eq!(stream.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf, b"he");
        let mut rest = [0u8; 8];
        assert_eq!(stream.read(&mut rest).unwrap(), 3);
        assert_eq!(&rest[..3], b"llo");
    }

    #[test]
    fn test_writes_reach_the_connection_in_order() {
        let mut chain = chain_with_timeout(Some(false));
        let stream = LegacyStream::attach(&mut chain).unwrap();

        stream.write(b"one").unwrap();
        stream.write(b"two").unwrap();
        stream.pump_writes(&mut chain).unwrap();

        let effects = chain.take_effects();
        match effects.as_slice() {
            [Effect::Write(a), Effect::Write(b)] => {
                assert_eq!(&a[..], b"one");
                assert_eq!(&b[..], b"two");
            }
            other => panic!("unexpected effects: {other:?}"),
        }
    }

    #[test]
    fn test_interrupt_unblocks_reader_with_end_of_stream() {
        let mut chain = chain_with_timeout(Some(false));
        let stream = LegacyStream::attach(&mut chain).unwrap();

        let reader = stream.clone();
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 4];
            reader.read(&mut buf)
        });
        std::thread::sleep(Duration::from_millis(50));
        stream.interrupt();
        assert_eq!(handle.join().unwrap().unwrap(), 0);
    }

    #[test]
    fn test_inactive_connection_ends_the_stream() {
        let mut chain = chain_with_timeout(Some(false));
        let stream = LegacyStream::attach(&mut chain).unwrap();
        chain.dispatch(Event::Inactive);

        let mut buf = [0u8; 4];
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
        assert!(stream.is_closed());
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut chain = chain_with_timeout(Some(false));
        let stream = LegacyStream::attach(&mut chain).unwrap();
        stream.close();
        stream.close();
        assert!(stream.is_closed());
        assert!(stream.close_requested());
    }

    #[test]
    fn test_single_byte_operations_fail() {
        let mut chain = chain_with_timeout(Some(false));
        let stream = LegacyStream::attach(&mut chain).unwrap();
        assert!(stream.read_byte().is_err());
        assert!(stream.write_byte(b'x').is_err());
    }

    #[test]
    fn test_socket_options_are_forwarded() {
        let mut chain = chain_with_timeout(Some(false));
        let stream = LegacyStream::attach(&mut chain).unwrap();
        stream.set_nodelay(true);
        stream.set_keepalive(false);
        assert_eq!(stream.take_socket_options(), (Some(true), Some(false)));
        assert_eq!(stream.take_socket_options(), (None, None));
    }
}
