//! Client-side mirror of server entities
//!
//! Applies `a`/`u`/`r` deltas to a local table of raw payloads and, for types
//! with a linked factory, to live instances that receive lifecycle hooks.

use hashbrown::HashMap;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::net::connection::FrameSink;
use crate::net::protocol::{self, EntityPacket, Envelope, ADD, REMOVE, UPDATE};
use crate::world::entity::AsAny;
use crate::world::identity::EntityId;
use crate::world::scheduler::TickClock;

/// Client frame rate used to normalize `dt`
pub const CLIENT_FRAME_RATE: u32 = 60;

/// Client-side counterpart of a server entity type
pub trait Instance: AsAny + Send {
    fn on_add(&mut self, _data: &Value) {}
    fn on_update(&mut self, _data: &Value) {}
    fn on_remove(&mut self, _data: &Value) {}
}

/// A live instance with its current and previous network snapshots
pub struct BoundInstance {
    pub net: EntityPacket,
    pub old_net: EntityPacket,
    inner: Box<dyn Instance>,
}

impl BoundInstance {
    pub fn instance(&self) -> &dyn Instance {
        &*self.inner
    }

    pub fn downcast_ref<T: Instance>(&self) -> Option<&T> {
        let inner: &dyn Instance = &*self.inner;
        inner.as_any().downcast_ref::<T>()
    }

    pub fn downcast_mut<T: Instance>(&mut self) -> Option<&mut T> {
        let inner: &mut dyn Instance = &mut *self.inner;
        inner.as_any_mut().downcast_mut::<T>()
    }
}

type Factory = Box<dyn Fn() -> Box<dyn Instance> + Send>;
type MessageHandler = Box<dyn FnMut(&mut ClientMirror, &Value) + Send>;

/// Local view of the entities in the room the client is subscribed to
pub struct ClientMirror {
    objects: HashMap<EntityId, EntityPacket>,
    instances: HashMap<EntityId, BoundInstance>,
    links: HashMap<String, Factory>,
    handlers: HashMap<String, Vec<MessageHandler>>,
    outbound: Vec<Envelope>,
    clock: TickClock,
    dt: f64,
    transport: Option<Box<dyn FrameSink>>,
}

impl ClientMirror {
    pub fn new() -> Self {
        Self {
            objects: HashMap::new(),
            instances: HashMap::new(),
            links: HashMap::new(),
            handlers: HashMap::new(),
            outbound: Vec::new(),
            clock: TickClock::from_rate(CLIENT_FRAME_RATE),
            dt: 0.0,
            transport: None,
        }
    }

    /// Attach the outbound half of the transport
    pub fn connect(&mut self, sink: impl FrameSink + 'static) {
        self.transport = Some(Box::new(sink));
    }

    pub fn is_connected(&self) -> bool {
        self.transport.as_ref().map_or(false, |t| t.is_open())
    }

    /// Instantiate `factory` for every `a` of entity type `kind`
    pub fn link<I, F>(&mut self, kind: impl Into<String>, factory: F)
    where
        I: Instance,
        F: Fn() -> I + Send + 'static,
    {
        self.links
            .insert(kind.into(), Box::new(move || Box::new(factory()) as Box<dyn Instance>));
    }

    /// Register a handler for messages of `kind`
    ///
    /// Handlers get the mirror itself, so they can `emit` replies. Handlers
    /// for reserved types run after the built-in delta processing.
    pub fn on<F>(&mut self, kind: impl Into<String>, handler: F)
    where
        F: FnMut(&mut ClientMirror, &Value) + Send + 'static,
    {
        self.handlers
            .entry(kind.into())
            .or_default()
            .push(Box::new(handler));
    }

    /// Queue a message for the next `update`
    pub fn emit(&mut self, kind: impl Into<String>, data: Value) {
        self.outbound.push(Envelope::new(kind, data));
    }

    /// Messages waiting for the next `update`
    pub fn queued(&self) -> &[Envelope] {
        &self.outbound
    }

    /// Decode one frame and apply every message in it
    ///
    /// A frame that fails to decode counts as an empty batch.
    pub fn execute_frame(&mut self, frame: &[u8]) -> usize {
        match protocol::decode(frame) {
            Ok(messages) => {
                let count = messages.len();
                self.execute(messages);
                count
            }
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                0
            }
        }
    }

    /// Apply a batch of messages in order
    pub fn execute(&mut self, messages: Vec<Envelope>) {
        for envelope in messages {
            self.dispatch(envelope);
        }
    }

    fn dispatch(&mut self, envelope: Envelope) {
        match envelope.kind.as_str() {
            ADD => self.apply_add(&envelope.data),
            UPDATE => self.apply_update(&envelope.data),
            REMOVE => self.apply_remove(&envelope.data),
            _ => {}
        }

        // Handlers are taken out while they run so they can borrow the mirror
        let Some(mut handlers) = self.handlers.remove(&envelope.kind) else {
            if !protocol::is_reserved(&envelope.kind) {
                debug!("No handler for message type '{}'", envelope.kind);
            }
            return;
        };

        for handler in handlers.iter_mut() {
            handler(self, &envelope.data);
        }

        // Handlers registered while dispatching go after the existing ones
        if let Some(added) = self.handlers.remove(&envelope.kind) {
            handlers.extend(added);
        }
        self.handlers.insert(envelope.kind, handlers);
    }

    fn apply_add(&mut self, data: &Value) {
        let Some(packet) = parse_packet(ADD, data) else {
            return;
        };
        let id = packet.id;
        self.objects.insert(id, packet.clone());

        let Some(factory) = self.links.get(&packet.kind) else {
            warn!("Entity type '{}' is not linked", packet.kind);
            return;
        };

        let mut inner = factory();
        inner.on_add(&packet.data);
        self.instances.insert(
            id,
            BoundInstance {
                net: packet.clone(),
                old_net: packet,
                inner,
            },
        );
    }

    fn apply_update(&mut self, data: &Value) {
        let Some(rows) = data.as_array() else {
            warn!("Malformed '{}' payload: expected an array", UPDATE);
            return;
        };

        for row in rows {
            let Some(packet) = parse_packet(UPDATE, row) else {
                continue;
            };
            self.objects.insert(packet.id, packet.clone());

            if let Some(bound) = self.instances.get_mut(&packet.id) {
                bound.old_net = std::mem::replace(&mut bound.net, packet);
                bound.inner.on_update(&bound.net.data);
            }
        }
    }

    fn apply_remove(&mut self, data: &Value) {
        let Some(packet) = parse_packet(REMOVE, data) else {
            return;
        };

        if let Some(mut bound) = self.instances.remove(&packet.id) {
            bound.inner.on_remove(&packet.data);
        }
        self.objects.remove(&packet.id);
    }

    /// Per-frame tick: compute the normalized dt and flush the outbound queue
    ///
    /// The queue is sent as one frame when it is non-empty and the transport
    /// is open; otherwise it is kept for a later frame.
    pub fn update(&mut self, now: Instant) -> f64 {
        self.dt = self.clock.tick(now);

        if !self.outbound.is_empty() {
            self.flush();
        }
        self.dt
    }

    fn flush(&mut self) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        if !transport.is_open() {
            return;
        }

        let frame = match protocol::encode(&self.outbound) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping {} queued messages: {}", self.outbound.len(), e);
                self.outbound.clear();
                return;
            }
        };

        match transport.send_frame(frame) {
            Ok(()) => self.outbound.clear(),
            Err(e) => warn!("Send failed, keeping {} messages queued: {}", self.outbound.len(), e),
        }
    }

    /// Normalized delta computed by the last `update`
    pub fn dt(&self) -> f64 {
        self.dt
    }

    /// Last raw packet received for an entity
    pub fn object(&self, id: EntityId) -> Option<&EntityPacket> {
        self.objects.get(&id)
    }

    pub fn instance(&self, id: EntityId) -> Option<&BoundInstance> {
        self.instances.get(&id)
    }

    pub fn instance_as<T: Instance>(&self, id: EntityId) -> Option<&T> {
        self.instances.get(&id)?.downcast_ref::<T>()
    }

    pub fn instance_as_mut<T: Instance>(&mut self, id: EntityId) -> Option<&mut T> {
        self.instances.get_mut(&id)?.downcast_mut::<T>()
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }
}

impl Default for ClientMirror {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_packet(kind: &str, data: &Value) -> Option<EntityPacket> {
    match EntityPacket::from_value(data.clone()) {
        Ok(packet) => Some(packet),
        Err(e) => {
            warn!("Malformed '{}' packet: {}", kind, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::tests::RecordingSink;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Default)]
    struct Ship {
        x: f64,
        updates: usize,
    }

    impl Instance for Ship {
        fn on_add(&mut self, data: &Value) {
            self.x = data["x"].as_f64().unwrap_or(0.0);
        }

        fn on_update(&mut self, data: &Value) {
            self.x = data["x"].as_f64().unwrap_or(self.x);
            self.updates += 1;
        }
    }

    struct Logged {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Instance for Logged {
        fn on_add(&mut self, data: &Value) {
            self.log.lock().push(format!("add {}", data));
        }

        fn on_remove(&mut self, data: &Value) {
            self.log.lock().push(format!("remove {}", data));
        }
    }

    fn add(kind: &str, id: EntityId, data: Value) -> Envelope {
        Envelope::add(EntityPacket::new(kind, id, data))
    }

    #[test]
    fn test_add_linked_creates_instance() {
        let mut mirror = ClientMirror::new();
        mirror.link("ship", Ship::default);

        mirror.execute(vec![add("ship", 3, json!({ "x": 1.5 }))]);

        assert_eq!(mirror.instance_as::<Ship>(3).map(|s| s.x), Some(1.5));
        let bound = mirror.instance(3).unwrap();
        assert_eq!(bound.net, bound.old_net);
        assert_eq!(mirror.object(3).map(|p| p.kind.as_str()), Some("ship"));
    }

    #[test]
    fn test_unlinked_type_tracks_raw_payload_only() {
        let mut mirror = ClientMirror::new();

        mirror.execute(vec![add("y", 0, json!({ "v": 1 }))]);
        assert_eq!(mirror.instance_count(), 0);
        assert_eq!(mirror.object_count(), 1);

        mirror.execute(vec![Envelope::update(vec![EntityPacket::new("y", 0, json!({ "v": 2 }))])]);

        assert!(mirror.instance(0).is_none());
        assert_eq!(mirror.object(0).map(|p| p.data.clone()), Some(json!({ "v": 2 })));
    }

    #[test]
    fn test_update_shifts_snapshots() {
        let mut mirror = ClientMirror::new();
        mirror.link("ship", Ship::default);
        mirror.execute(vec![add("ship", 1, json!({ "x": 0.0 }))]);

        mirror.execute(vec![Envelope::update(vec![
            EntityPacket::new("ship", 1, json!({ "x": 2.0 })),
            EntityPacket::new("ship", 99, json!({ "x": 5.0 })),
        ])]);
        mirror.execute(vec![Envelope::update(vec![EntityPacket::new("ship", 1, json!({ "x": 3.0 }))])]);

        let bound = mirror.instance(1).unwrap();
        assert_eq!(bound.old_net.data, json!({ "x": 2.0 }));
        assert_eq!(bound.net.data, json!({ "x": 3.0 }));
        assert_eq!(mirror.instance_as::<Ship>(1).map(|s| (s.x, s.updates)), Some((3.0, 2)));
        // Rows for identities never added are tracked, not fatal
        assert!(mirror.object(99).is_some());
    }

    #[test]
    fn test_remove_calls_hook_and_discards() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut mirror = ClientMirror::new();
        let factory_log = log.clone();
        mirror.link("marker", move || Logged { log: factory_log.clone() });

        mirror.execute(vec![
            add("marker", 4, json!(1)),
            Envelope::remove(EntityPacket::new("marker", 4, json!("bye"))),
        ]);

        assert_eq!(*log.lock(), vec!["add 1".to_string(), "remove \"bye\"".to_string()]);
        assert!(mirror.instance(4).is_none());
        assert!(mirror.object(4).is_none());
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let mut mirror = ClientMirror::new();
        mirror.execute(vec![Envelope::remove(EntityPacket::new("ghost", 8, Value::Null))]);
        assert_eq!(mirror.object_count(), 0);
    }

    #[test]
    fn test_handlers_for_custom_and_reserved_types() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut mirror = ClientMirror::new();

        let chat = seen.clone();
        mirror.on("chat", move |_, data| chat.lock().push(format!("chat {}", data)));
        let adds = seen.clone();
        mirror.on("a", move |_, data| adds.lock().push(format!("a {}", data["id"])));

        mirror.execute(vec![
            Envelope::new("chat", json!("hi")),
            add("y", 2, Value::Null),
            Envelope::new("unhandled", Value::Null),
        ]);

        assert_eq!(*seen.lock(), vec!["chat \"hi\"".to_string(), "a 2".to_string()]);
        assert!(mirror.object(2).is_some());
    }

    #[test]
    fn test_malformed_packets_skipped() {
        let mut mirror = ClientMirror::new();
        mirror.execute(vec![
            Envelope::new("a", json!({ "t": "ship" })),
            Envelope::new("u", json!({ "not": "an array" })),
            Envelope::new("u", json!([{ "id": "x" }])),
        ]);
        assert_eq!(mirror.object_count(), 0);
    }

    #[test]
    fn test_execute_frame() {
        let mut mirror = ClientMirror::new();
        let frame = protocol::encode(&[add("y", 0, json!({ "v": 1 }))]).unwrap();

        assert_eq!(mirror.execute_frame(&frame), 1);
        assert_eq!(mirror.execute_frame(&[0xc1, 0x00]), 0);
        assert_eq!(mirror.object_count(), 1);
    }

    #[test]
    fn test_update_flushes_queue_as_one_frame() {
        let sink = RecordingSink::default();
        let mut mirror = ClientMirror::new();
        let t0 = Instant::now();

        mirror.emit("ready", Value::Null);
        assert_eq!(mirror.update(t0), 1.0);
        assert_eq!(mirror.queued().len(), 1);

        mirror.connect(sink.clone());
        mirror.emit("move", json!({ "dx": 1 }));
        let dt = mirror.update(t0 + Duration::from_secs_f64(2.0 / 60.0));

        assert!((dt - 2.0).abs() < 1e-6);
        assert!(mirror.queued().is_empty());
        let frames = sink.frames.lock();
        assert_eq!(frames.len(), 1);
        let batch = protocol::decode(&frames[0]).unwrap();
        assert_eq!(batch[0].kind, "ready");
        assert_eq!(batch[1].kind, "move");
    }

    #[test]
    fn test_update_keeps_queue_when_closed() {
        let sink = RecordingSink::default();
        let mut mirror = ClientMirror::new();
        mirror.connect(sink.clone());
        *sink.closed.lock() = true;

        mirror.emit("move", Value::Null);
        mirror.update(Instant::now());

        assert!(!mirror.is_connected());
        assert_eq!(mirror.queued().len(), 1);
        assert!(sink.frames.lock().is_empty());
    }

    #[test]
    fn test_empty_queue_sends_nothing() {
        let sink = RecordingSink::default();
        let mut mirror = ClientMirror::new();
        mirror.connect(sink.clone());

        mirror.update(Instant::now());

        assert!(sink.frames.lock().is_empty());
    }

    #[test]
    fn test_handler_can_emit_reply() {
        let mut mirror = ClientMirror::new();
        mirror.on("ping", |mirror, data| mirror.emit("pong", data.clone()));

        mirror.execute(vec![Envelope::new("ping", json!(7)), Envelope::new("ping", json!(8))]);

        assert_eq!(
            mirror.queued(),
            &[Envelope::new("pong", json!(7)), Envelope::new("pong", json!(8))]
        );
    }

    #[test]
    fn test_handler_registered_during_dispatch() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut mirror = ClientMirror::new();

        let outer = seen.clone();
        mirror.on("tick", move |mirror, _| {
            outer.lock().push("first");
            let inner = outer.clone();
            mirror.on("tick", move |_, _| inner.lock().push("late"));
        });

        mirror.execute(vec![Envelope::new("tick", Value::Null)]);
        assert_eq!(*seen.lock(), vec!["first"]);

        mirror.execute(vec![Envelope::new("tick", Value::Null)]);
        assert_eq!(*seen.lock(), vec!["first", "first", "late"]);
    }
}
