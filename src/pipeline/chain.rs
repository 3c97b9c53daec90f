//! Explicit per-connection stage chain.
//!
//! The chain is an ordered list of named stage handles. Events are fed to
//! the first stage; each stage may consume them, transform them, forward
//! them to the next stage, or mutate the chain (remove itself, insert
//! stages relative to itself or to a named stage). The dispatch loop
//! re-reads the list after every stage run, so mutations take effect for
//! the very next delivery.
//!
//! Stages never touch the transport directly; they record effects (writes,
//! tunnel hand-offs, close) that the owning driver applies.

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use crate::message::HttpMessage;
use crate::pipeline::context::ConnectionContext;
use crate::{Error, Result};

/// Inbound event delivered through the chain.
#[derive(Debug)]
pub enum Event {
    /// The connection became active.
    Active,
    /// Raw (or decrypted) bytes arrived from the client.
    Bytes(Bytes),
    /// A parsed HTTP request.
    Message(HttpMessage),
    /// Periodic idle tick from the driver.
    IdleCheck(Instant),
    /// A fault surfaced by an earlier stage.
    Fault(Error),
    /// The connection went inactive.
    Inactive,
}

/// Side effect recorded by a stage for the transport driver.
#[derive(Debug)]
pub enum Effect {
    /// Bytes to write to the client socket.
    Write(Bytes),
    /// Switch the connection to raw pass-through tunneling to this target.
    OpenTunnel { host: String, port: u16 },
    /// The pipeline configurator switched the connection to this protocol.
    ProtocolConfigured(String),
    /// A request that traversed the whole chain, ready for application logic.
    Deliver(HttpMessage),
    /// Close the connection.
    Close,
}

/// One stage of the per-connection chain.
pub trait Stage: Send {
    fn on_event(&mut self, handle: &mut StageHandle<'_>, event: Event) -> Result<()>;

    /// Outbound transformation applied to data written from a stage further
    /// down the chain. The default passes data through unchanged; the TLS
    /// terminator overrides this to encrypt.
    fn on_write(&mut self, data: Bytes) -> Result<Vec<Bytes>> {
        Ok(vec![data])
    }

    /// Inbound bytes this stage has buffered but not yet processed. The
    /// driver collects these when it stops feeding the chain and hands the
    /// raw stream elsewhere (pass-through tunneling, re-sniffing an
    /// intercepted CONNECT).
    fn take_buffered(&mut self) -> Option<Bytes> {
        None
    }
}

/// Chain mutation operations exposed to stages and to the pipeline
/// configurator.
pub trait ChainAccess {
    fn ctx_mut(&mut self) -> &mut ConnectionContext;
    fn insert_first(&mut self, name: &str, stage: Box<dyn Stage>) -> Result<()>;
    fn insert_after(&mut self, anchor: &str, name: &str, stage: Box<dyn Stage>) -> Result<()>;
    fn remove(&mut self, name: &str) -> bool;
    fn contains(&self, name: &str) -> bool;
}

struct Slot {
    name: String,
    stage: Option<Box<dyn Stage>>,
}

/// Handle given to a stage while it runs.
pub struct StageHandle<'a> {
    name: &'a str,
    ctx: &'a mut ConnectionContext,
    slots: &'a mut Vec<Slot>,
    effects: &'a mut Vec<Effect>,
    retargets: &'a mut HashMap<String, Option<String>>,
    forwards: Vec<Event>,
    removed: bool,
}

impl<'a> StageHandle<'a> {
    pub fn ctx(&mut self) -> &mut ConnectionContext {
        self.ctx
    }

    /// Passes an event to the stage following this one.
    pub fn forward(&mut self, event: Event) {
        self.forwards.push(event);
    }

    /// Writes data outbound, letting every stage closer to the transport
    /// transform it (e.g. TLS encryption).
    pub fn write(&mut self, data: Bytes) -> Result<()> {
        let pos = self.own_position();
        write_through(self.slots, self.effects, pos, data)
    }

    pub fn close(&mut self) {
        self.effects.push(Effect::Close);
    }

    pub fn open_tunnel(&mut self, host: String, port: u16) {
        self.effects.push(Effect::OpenTunnel { host, port });
    }

    pub fn protocol_configured(&mut self, protocol: &str) {
        self.effects
            .push(Effect::ProtocolConfigured(protocol.to_string()));
    }

    /// Removes this stage from the chain once it returns.
    pub fn remove_self(&mut self) {
        self.removed = true;
    }

    pub fn insert_after_self(&mut self, name: &str, stage: Box<dyn Stage>) -> Result<()> {
        ensure_unique(self.slots, name)?;
        let pos = self.own_position();
        self.slots.insert(
            pos + 1,
            Slot {
                name: name.to_string(),
                stage: Some(stage),
            },
        );
        Ok(())
    }

    pub fn insert_before_self(&mut self, name: &str, stage: Box<dyn Stage>) -> Result<()> {
        ensure_unique(self.slots, name)?;
        let pos = self.own_position();
        self.slots.insert(
            pos,
            Slot {
                name: name.to_string(),
                stage: Some(stage),
            },
        );
        Ok(())
    }

    fn own_position(&self) -> usize {
        self.slots
            .iter()
            .position(|s| s.name == self.name)
            .expect("running stage present in chain")
    }
}

impl ChainAccess for StageHandle<'_> {
    fn ctx_mut(&mut self) -> &mut ConnectionContext {
        self.ctx
    }

    fn insert_first(&mut self, name: &str, stage: Box<dyn Stage>) -> Result<()> {
        ensure_unique(self.slots, name)?;
        self.slots.insert(
            0,
            Slot {
                name: name.to_string(),
                stage: Some(stage),
            },
        );
        Ok(())
    }

    fn insert_after(&mut self, anchor: &str, name: &str, stage: Box<dyn Stage>) -> Result<()> {
        ensure_unique(self.slots, name)?;
        let pos = position_of(self.slots, anchor)
            .ok_or_else(|| Error::chain_assembly(format!("no stage named {anchor:?}")))?;
        self.slots.insert(
            pos + 1,
            Slot {
                name: name.to_string(),
                stage: Some(stage),
            },
        );
        Ok(())
    }

    fn remove(&mut self, name: &str) -> bool {
        if name == self.name {
            self.removed = true;
            return true;
        }
        match position_of(self.slots, name) {
            Some(pos) => {
                let successor = self.slots.get(pos + 1).map(|s| s.name.clone());
                self.slots.remove(pos);
                // Events already queued for the removed stage continue at
                // its successor.
                self.retargets.insert(name.to_string(), successor);
                true
            }
            None => false,
        }
    }

    fn contains(&self, name: &str) -> bool {
        position_of(self.slots, name).is_some()
    }
}

fn position_of(slots: &[Slot], name: &str) -> Option<usize> {
    slots.iter().position(|s| s.name == name)
}

/// Resolves an event target against the current stage list, chasing the
/// recorded successors of removed stages. The outer `None` means the event
/// has no destination left; `Some(None)` means the end of the chain.
fn resolve_target(
    slots: &[Slot],
    retargets: &HashMap<String, Option<String>>,
    mut target: Option<String>,
) -> Option<Option<String>> {
    loop {
        match target {
            None => return Some(None),
            Some(name) => {
                if position_of(slots, &name).is_some() {
                    return Some(Some(name));
                }
                match retargets.get(&name) {
                    Some(successor) => target = successor.clone(),
                    None => return None,
                }
            }
        }
    }
}

fn ensure_unique(slots: &[Slot], name: &str) -> Result<()> {
    if position_of(slots, name).is_some() {
        return Err(Error::chain_assembly(format!(
            "duplicate stage name {name:?}"
        )));
    }
    Ok(())
}

fn write_through(
    slots: &mut [Slot],
    effects: &mut Vec<Effect>,
    from: usize,
    data: Bytes,
) -> Result<()> {
    let mut chunks = vec![data];
    let mut i = from;
    while i > 0 {
        i -= 1;
        if let Some(mut stage) = slots[i].stage.take() {
            let mut out = Vec::new();
            let mut failure = None;
            for chunk in chunks.drain(..) {
                match stage.on_write(chunk) {
                    Ok(transformed) => out.extend(transformed),
                    Err(e) => {
                        failure = Some(e);
                        break;
                    }
                }
            }
            slots[i].stage = Some(stage);
            if let Some(e) = failure {
                return Err(e);
            }
            chunks = out;
        }
    }
    for chunk in chunks {
        effects.push(Effect::Write(chunk));
    }
    Ok(())
}

/// The per-connection chain: context plus ordered stage list.
pub struct Chain {
    ctx: ConnectionContext,
    slots: Vec<Slot>,
    effects: Vec<Effect>,
}

impl Chain {
    pub fn new(ctx: ConnectionContext) -> Self {
        Self {
            ctx,
            slots: Vec::new(),
            effects: Vec::new(),
        }
    }

    pub fn ctx(&self) -> &ConnectionContext {
        &self.ctx
    }

    pub fn add_last(&mut self, name: &str, stage: Box<dyn Stage>) -> Result<()> {
        ensure_unique(&self.slots, name)?;
        self.slots.push(Slot {
            name: name.to_string(),
            stage: Some(stage),
        });
        Ok(())
    }

    pub fn stage_names(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.name.clone()).collect()
    }

    pub fn contains_stage(&self, name: &str) -> bool {
        position_of(&self.slots, name).is_some()
    }

    /// Feeds one event into the chain and drains the recorded effects.
    pub fn dispatch(&mut self, event: Event) -> Vec<Effect> {
        let mut queue: VecDeque<(Option<String>, Event)> = VecDeque::new();
        queue.push_back((self.slots.first().map(|s| s.name.clone()), event));
        // Successor of each stage removed mid-dispatch; queued events for a
        // removed stage continue there instead of being dropped.
        let mut retargets: HashMap<String, Option<String>> = HashMap::new();

        while let Some((target, event)) = queue.pop_front() {
            let Some(resolved) = resolve_target(&self.slots, &retargets, target) else {
                tracing::debug!("event for a removed stage with no successor, dropping");
                continue;
            };
            let Some(name) = resolved else {
                self.at_end(event);
                continue;
            };
            let Some(pos) = position_of(&self.slots, &name) else {
                continue;
            };
            let Some(mut stage) = self.slots[pos].stage.take() else {
                continue;
            };

            let mut handle = StageHandle {
                name: &name,
                ctx: &mut self.ctx,
                slots: &mut self.slots,
                effects: &mut self.effects,
                retargets: &mut retargets,
                forwards: Vec::new(),
                removed: false,
            };
            let result = stage.on_event(&mut handle, event);
            let forwards = std::mem::take(&mut handle.forwards);
            let removed = handle.removed;

            // Re-read the (possibly mutated) list before routing onward.
            let next_name = match position_of(&self.slots, &name) {
                Some(pos_now) => {
                    if removed {
                        self.slots.remove(pos_now);
                        let successor = self.slots.get(pos_now).map(|s| s.name.clone());
                        retargets.insert(name.clone(), successor.clone());
                        successor
                    } else {
                        self.slots[pos_now].stage = Some(stage);
                        self.slots.get(pos_now + 1).map(|s| s.name.clone())
                    }
                }
                None => None,
            };

            for forwarded in forwards {
                queue.push_back((next_name.clone(), forwarded));
            }
            if let Err(err) = result {
                queue.push_back((next_name.clone(), Event::Fault(err)));
            }
        }

        std::mem::take(&mut self.effects)
    }

    /// Writes data outbound from the position of the named stage; used by
    /// consumers that live off-chain, such as the legacy adapter's writer.
    pub fn write_from(&mut self, name: &str, data: Bytes) -> Result<()> {
        let pos = position_of(&self.slots, name)
            .ok_or_else(|| Error::chain_assembly(format!("no stage named {name:?}")))?;
        write_through(&mut self.slots, &mut self.effects, pos, data)
    }

    /// Writes data outbound through every installed stage, starting past
    /// the end of the chain; responses produced by the embedder enter here
    /// so they are encrypted when a TLS terminator is installed.
    pub fn write_outbound(&mut self, data: Bytes) -> Result<()> {
        let end = self.slots.len();
        write_through(&mut self.slots, &mut self.effects, end, data)
    }

    /// Collects inbound bytes still buffered inside the stages, in chain
    /// order. Called by the driver before it stops feeding the chain, so
    /// bytes that arrived behind a CONNECT head are not lost.
    pub fn drain_buffered(&mut self) -> Vec<Bytes> {
        self.slots
            .iter_mut()
            .filter_map(|slot| slot.stage.as_mut().and_then(|stage| stage.take_buffered()))
            .collect()
    }

    /// Drains effects recorded outside of `dispatch` (e.g. by `write_from`).
    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    /// Re-queues an effect for the next drain; used by drivers that nest
    /// dispatches while applying effects.
    pub fn push_effect(&mut self, effect: Effect) {
        self.effects.push(effect);
    }

    fn at_end(&mut self, event: Event) {
        match event {
            Event::Message(msg) => self.effects.push(Effect::Deliver(msg)),
            Event::Fault(err) => {
                tracing::error!(error = %err, "fault reached end of chain");
                self.effects.push(Effect::Close);
            }
            Event::Bytes(data) => {
                tracing::debug!(len = data.len(), "bytes reached end of chain, dropping");
            }
            Event::Active | Event::IdleCheck(_) | Event::Inactive => {}
        }
    }
}

impl ChainAccess for Chain {
    fn ctx_mut(&mut self) -> &mut ConnectionContext {
        &mut self.ctx
    }

    fn insert_first(&mut self, name: &str, stage: Box<dyn Stage>) -> Result<()> {
        ensure_unique(&self.slots, name)?;
        self.slots.insert(
            0,
            Slot {
                name: name.to_string(),
                stage: Some(stage),
            },
        );
        Ok(())
    }

    fn insert_after(&mut self, anchor: &str, name: &str, stage: Box<dyn Stage>) -> Result<()> {
        ensure_unique(&self.slots, name)?;
        let pos = position_of(&self.slots, anchor)
            .ok_or_else(|| Error::chain_assembly(format!("no stage named {anchor:?}")))?;
        self.slots.insert(
            pos + 1,
            Slot {
                name: name.to_string(),
                stage: Some(stage),
            },
        );
        Ok(())
    }

    fn remove(&mut self, name: &str) -> bool {
        match position_of(&self.slots, name) {
            Some(pos) => {
                self.slots.remove(pos);
                true
            }
            None => false,
        }
    }

    fn contains(&self, name: &str) -> bool {
        position_of(&self.slots, name).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn test_ctx() -> ConnectionContext {
        let addr: SocketAddr = "127.0.0.1:1234".parse().unwrap();
        ConnectionContext::new(addr)
    }

    /// Forwards every event, counting deliveries.
    struct Counter {
        seen: usize,
    }

    impl Stage for Counter {
        fn on_event(&mut self, handle: &mut StageHandle<'_>, event: Event) -> Result<()> {
            self.seen += 1;
            handle.forward(event);
            Ok(())
        }
    }

    /// Removes itself on the first byte event, forwarding the bytes.
    struct RemoveOnBytes;

    impl Stage for RemoveOnBytes {
        fn on_event(&mut self, handle: &mut StageHandle<'_>, event: Event) -> Result<()> {
            if matches!(event, Event::Bytes(_)) {
                handle.remove_self();
            }
            handle.forward(event);
            Ok(())
        }
    }

    /// Prefixes outbound writes with a marker.
    struct MarkWrites;

    impl Stage for MarkWrites {
        fn on_event(&mut self, handle: &mut StageHandle<'_>, event: Event) -> Result<()> {
            handle.forward(event);
            Ok(())
        }

        fn on_write(&mut self, data: Bytes) -> Result<Vec<Bytes>> {
            let mut out = Vec::from(&b"<"[..]);
            out.extend_from_slice(&data);
            Ok(vec![Bytes::from(out)])
        }
    }

    /// Writes a fixed response on any message event.
    struct Responder;

    impl Stage for Responder {
        fn on_event(&mut self, handle: &mut StageHandle<'_>, event: Event) -> Result<()> {
            if matches!(event, Event::Message(_)) {
                handle.write(Bytes::from_static(b"hi"))?;
            }
            Ok(())
        }
    }

    fn message_event() -> Event {
        use crate::message::{HttpMessage, RequestLine};
        Event::Message(HttpMessage::new(RequestLine::new("GET", "/", "HTTP/1.1")))
    }

    #[test]
    fn test_event_reaches_end_as_delivery() {
        let mut chain = Chain::new(test_ctx());
        chain.add_last("a", Box::new(Counter { seen: 0 })).unwrap();
        let effects = chain.dispatch(message_event());
        assert!(matches!(effects.as_slice(), [Effect::Deliver(_)]));
    }

    #[test]
    fn test_removed_stage_not_consulted_again() {
        let mut chain = Chain::new(test_ctx());
        chain.add_last("remove", Box::new(RemoveOnBytes)).unwrap();
        chain.add_last("count", Box::new(Counter { seen: 0 })).unwrap();

        chain.dispatch(Event::Bytes(Bytes::from_static(b"x")));
        assert_eq!(chain.stage_names(), vec!["count"]);

        chain.dispatch(Event::Bytes(Bytes::from_static(b"y")));
        assert_eq!(chain.stage_names(), vec!["count"]);
    }

    #[test]
    fn test_forward_after_remove_goes_to_next_stage() {
        let mut chain = Chain::new(test_ctx());
        chain.add_last("remove", Box::new(RemoveOnBytes)).unwrap();
        chain.add_last("end", Box::new(Counter { seen: 0 })).unwrap();
        let effects = chain.dispatch(Event::Bytes(Bytes::from_static(b"x")));
        // Bytes traversed the counter and fell off the end of the chain.
        assert!(effects.is_empty());
    }

    /// Turns one byte event into two message events.
    struct SplitToMessages;

    impl Stage for SplitToMessages {
        fn on_event(&mut self, handle: &mut StageHandle<'_>, event: Event) -> Result<()> {
            use crate::message::{HttpMessage, RequestLine};
            if matches!(event, Event::Bytes(_)) {
                for target in ["/1", "/2"] {
                    handle.forward(Event::Message(HttpMessage::new(RequestLine::new(
                        "GET", target, "HTTP/1.1",
                    ))));
                }
            } else {
                handle.forward(event);
            }
            Ok(())
        }
    }

    /// Removes itself on the first message, forwarding every event.
    struct RemoveOnMessage;

    impl Stage for RemoveOnMessage {
        fn on_event(&mut self, handle: &mut StageHandle<'_>, event: Event) -> Result<()> {
            if matches!(event, Event::Message(_)) {
                handle.remove_self();
            }
            handle.forward(event);
            Ok(())
        }
    }

    fn delivered_targets(effects: &[Effect]) -> Vec<String> {
        effects
            .iter()
            .filter_map(|effect| match effect {
                Effect::Deliver(message) => Some(message.request_line.target.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_queued_event_follows_removed_stage_to_successor() {
        let mut chain = Chain::new(test_ctx());
        chain.add_last("split", Box::new(SplitToMessages)).unwrap();
        chain.add_last("oneshot", Box::new(RemoveOnMessage)).unwrap();

        // Both messages are queued for "oneshot" before it runs; the first
        // removes it and the second must still reach the end of the chain.
        let effects = chain.dispatch(Event::Bytes(Bytes::from_static(b"x")));
        assert_eq!(delivered_targets(&effects), vec!["/1", "/2"]);
    }

    #[test]
    fn test_event_in_flight_to_a_stage_removed_by_another() {
        /// Removes the "mid" stage when it sees its second event.
        struct RemoveMidOnSecond {
            seen: usize,
        }

        impl Stage for RemoveMidOnSecond {
            fn on_event(&mut self, handle: &mut StageHandle<'_>, event: Event) -> Result<()> {
                self.seen += 1;
                if self.seen == 2 {
                    handle.remove("mid");
                }
                handle.forward(event);
                Ok(())
            }
        }

        let mut chain = Chain::new(test_ctx());
        chain.add_last("split", Box::new(SplitToMessages)).unwrap();
        chain
            .add_last("gate", Box::new(RemoveMidOnSecond { seen: 0 }))
            .unwrap();
        chain.add_last("mid", Box::new(Counter { seen: 0 })).unwrap();

        // "/1" is queued for "mid" when "gate" removes it on "/2".
        let effects = chain.dispatch(Event::Bytes(Bytes::from_static(b"x")));
        assert_eq!(delivered_targets(&effects), vec!["/1", "/2"]);
        assert_eq!(chain.stage_names(), vec!["split", "gate"]);
    }

    #[test]
    fn test_write_traverses_earlier_stages() {
        let mut chain = Chain::new(test_ctx());
        chain.add_last("mark", Box::new(MarkWrites)).unwrap();
        chain.add_last("respond", Box::new(Responder)).unwrap();
        let effects = chain.dispatch(message_event());
        match effects.as_slice() {
            [Effect::Write(data)] => assert_eq!(&data[..], b"<hi"),
            other => panic!("unexpected effects: {other:?}"),
        }
    }

    #[test]
    fn test_stage_error_becomes_fault_for_next_stage() {
        struct Failing;
        impl Stage for Failing {
            fn on_event(&mut self, _: &mut StageHandle<'_>, _: Event) -> Result<()> {
                Err(Error::decode("boom"))
            }
        }
        struct FaultSink {
            faults: usize,
        }
        impl Stage for FaultSink {
            fn on_event(&mut self, handle: &mut StageHandle<'_>, event: Event) -> Result<()> {
                if matches!(event, Event::Fault(_)) {
                    self.faults += 1;
                    handle.close();
                }
                Ok(())
            }
        }

        let mut chain = Chain::new(test_ctx());
        chain.add_last("fail", Box::new(Failing)).unwrap();
        chain.add_last("sink", Box::new(FaultSink { faults: 0 })).unwrap();
        let effects = chain.dispatch(Event::Bytes(Bytes::from_static(b"x")));
        assert!(matches!(effects.as_slice(), [Effect::Close]));
    }

    #[test]
    fn test_duplicate_stage_name_rejected() {
        let mut chain = Chain::new(test_ctx());
        chain.add_last("a", Box::new(Counter { seen: 0 })).unwrap();
        assert!(chain.add_last("a", Box::new(Counter { seen: 0 })).is_err());
    }

    #[test]
    fn test_insert_after_unknown_anchor_rejected() {
        let mut chain = Chain::new(test_ctx());
        let err = chain
            .insert_after("missing", "b", Box::new(Counter { seen: 0 }))
            .unwrap_err();
        assert!(matches!(err, Error::ChainAssembly(_)));
    }
}
