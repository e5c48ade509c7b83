// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hipc contributors

//! Subscriber core.
//!
//! Maintains one receiver per enabled transport layer, deduplicates
//! frames by (sender entity id, data clock) so a payload arriving on
//! several layers is delivered exactly once, optionally drops reordered
//! frames, and hands payloads to the user receive callback. A blocking
//! `receive_buffer` poll is available for callback-free consumers.

use crate::config::SubscriberConfiguration;
use crate::core::runtime::{current_runtime, Runtime};
use crate::core::types::{
    AdvertisedLayer, DataTypeInformation, EntityId, EntityKey, EntityState, RegistrationCmd,
    Sample, SubscriberEntry, TopicCounters, TopicId, TransportLayer,
};
use crate::error::{Error, Result};
use crate::pubsub::counters::{FrequencyCalculator, MessageDropCalculator};
use crate::pubsub::events::{EventCallbacks, EventToken};
use crate::pubsub::{PayloadView, ReceiveCallback};
use crate::registration::{CallbackToken, LocalEntity, RegistrationEventType};
use crate::transport::shm::ShmReader;
use crate::transport::tcp::TcpPayloadSession;
use crate::transport::udp::UdpReceiver;
use crate::transport::{FrameMeta, FrameSink};
use arc_swap::ArcSwapOption;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Frames remembered per sender for duplicate suppression.
const DEDUP_WINDOW: usize = 64;

/// Connection transitions reported to subscriber event callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriberEvent {
    Connected(TopicId),
    Disconnected(TopicId),
    /// Frames from a connected publisher were lost (clock gap).
    Dropped { publisher: TopicId, count: u64 },
}

/// One consumed payload from `receive_buffer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPayload {
    pub buffer: Vec<u8>,
    pub send_timestamp_us: i64,
    pub send_clock: u64,
}

#[derive(Default)]
struct SenderState {
    last_clock: Option<u64>,
    recent: VecDeque<u64>,
    drop_calc: MessageDropCalculator,
}

struct CallbackHolder {
    callback: ReceiveCallback,
}

struct SubscriberInner {
    /// Back-reference handed to receiver sinks (no ownership cycle).
    self_weak: Weak<SubscriberInner>,
    runtime: Arc<Runtime>,
    id: TopicId,
    datatype_filter: Option<DataTypeInformation>,
    config: SubscriberConfiguration,
    loopback: bool,

    receive_callback: ArcSwapOption<CallbackHolder>,
    senders: Mutex<HashMap<u64, SenderState>>,
    /// Publisher identity by sender entity id, for callback context.
    publishers: RwLock<HashMap<u64, (TopicId, DataTypeInformation)>>,

    bytes_received: AtomicU64,
    last_clock: AtomicU64,
    message_drops: AtomicU64,
    reorder_drops: AtomicU64,
    frequency: Mutex<FrequencyCalculator>,

    latest: Mutex<Option<ReceivedPayload>>,
    latest_cv: Condvar,

    shm_readers: Mutex<HashMap<TopicId, ShmReader>>,
    udp_receiver: Mutex<Option<UdpReceiver>>,
    tcp_sessions: Mutex<HashMap<TopicId, TcpPayloadSession>>,

    events: EventCallbacks<SubscriberEvent>,
    gate_token: Mutex<Option<CallbackToken>>,
}

/// Handle to one subscriber.
pub struct Subscriber {
    inner: Arc<SubscriberInner>,
}

/// Builder for [`Subscriber`].
pub struct SubscriberBuilder {
    topic_name: String,
    datatype_filter: Option<DataTypeInformation>,
    config: Option<SubscriberConfiguration>,
}

impl SubscriberBuilder {
    /// Only connect to publishers advertising this datatype name.
    pub fn datatype_filter(mut self, datatype: DataTypeInformation) -> Self {
        self.datatype_filter = Some(datatype);
        self
    }

    pub fn config(mut self, config: SubscriberConfiguration) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> Result<Subscriber> {
        let runtime = current_runtime()?;
        if self.topic_name.is_empty() {
            return Err(Error::InvalidTopicName(self.topic_name));
        }
        let config = self
            .config
            .unwrap_or_else(|| runtime.config().subscriber.clone());

        let entity_id = EntityId::generate();
        let id = TopicId {
            entity: EntityKey {
                entity_id,
                process_id: runtime.process_id(),
                host_name: runtime.host_name().to_string(),
            },
            topic_name: self.topic_name,
        };

        let inner = Arc::new_cyclic(|self_weak| SubscriberInner {
            self_weak: Weak::clone(self_weak),
            loopback: runtime.config().registration.loopback,
            runtime,
            id,
            datatype_filter: self.datatype_filter,
            config,
            receive_callback: ArcSwapOption::empty(),
            senders: Mutex::new(HashMap::new()),
            publishers: RwLock::new(HashMap::new()),
            bytes_received: AtomicU64::new(0),
            last_clock: AtomicU64::new(0),
            message_drops: AtomicU64::new(0),
            reorder_drops: AtomicU64::new(0),
            frequency: Mutex::new(FrequencyCalculator::default()),
            latest: Mutex::new(None),
            latest_cv: Condvar::new(),
            shm_readers: Mutex::new(HashMap::new()),
            udp_receiver: Mutex::new(None),
            tcp_sessions: Mutex::new(HashMap::new()),
            events: EventCallbacks::new(),
            gate_token: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let token = inner.runtime.descgate().add_publisher_event_callback(Arc::new(
            move |id: &TopicId, _event: RegistrationEventType| {
                if let Some(inner) = weak.upgrade() {
                    if id.topic_name == inner.id.topic_name {
                        inner.update_connections();
                    }
                }
            },
        ));
        *inner.gate_token.lock() = Some(token);
        inner.update_connections();

        inner
            .runtime
            .provider()
            .register_entity(entity_id, Arc::clone(&inner) as Arc<dyn LocalEntity>);

        Ok(Subscriber { inner })
    }
}

impl Subscriber {
    /// Subscriber with default configuration.
    pub fn new(topic_name: &str) -> Result<Self> {
        Self::builder(topic_name).build()
    }

    pub fn builder(topic_name: &str) -> SubscriberBuilder {
        SubscriberBuilder {
            topic_name: topic_name.to_string(),
            datatype_filter: None,
            config: None,
        }
    }

    pub fn id(&self) -> &TopicId {
        &self.inner.id
    }

    pub fn topic_name(&self) -> &str {
        &self.inner.id.topic_name
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.publishers.read().is_empty()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.publishers.read().len()
    }

    /// Frames dropped because they arrived out of order (only counted
    /// with `drop_out_of_order_messages`).
    pub fn reorder_drops(&self) -> u64 {
        self.inner.reorder_drops.load(Ordering::Relaxed)
    }

    /// Frames lost on the wire, derived from per-sender clock gaps.
    pub fn message_drops(&self) -> u64 {
        self.inner.message_drops.load(Ordering::Relaxed)
    }

    /// Install the receive callback (replaces any previous one).
    pub fn set_receive_callback(&self, callback: ReceiveCallback) {
        self.inner
            .receive_callback
            .store(Some(Arc::new(CallbackHolder { callback })));
    }

    pub fn remove_receive_callback(&self) {
        self.inner.receive_callback.store(None);
    }

    /// Blocking poll: returns the stored unconsumed payload immediately,
    /// otherwise waits up to `timeout` for the next arrival.
    pub fn receive_buffer(&self, timeout: Duration) -> Option<ReceivedPayload> {
        let mut latest = self.inner.latest.lock();
        if let Some(payload) = latest.take() {
            return Some(payload);
        }
        if timeout.is_zero() {
            return None;
        }
        let _ = self.inner.latest_cv.wait_for(&mut latest, timeout);
        latest.take()
    }

    pub fn add_event_callback(
        &self,
        cb: Arc<dyn Fn(&SubscriberEvent) + Send + Sync>,
    ) -> EventToken {
        self.inner.events.add(cb)
    }

    pub fn rem_event_callback(&self, token: EventToken) {
        self.inner.events.remove(token);
    }

}

impl Drop for Subscriber {
    fn drop(&mut self) {
        if let Some(token) = self.inner.gate_token.lock().take() {
            self.inner
                .runtime
                .descgate()
                .rem_publisher_event_callback(token);
        }
        let sample = Sample {
            cmd: RegistrationCmd::Unregister,
            state: EntityState::Subscriber(self.inner.entry_snapshot()),
        };
        self.inner
            .runtime
            .provider()
            .unregister_entity(self.inner.id.entity.entity_id, &sample);

        // Join the receiver threads while the handle still owns an Arc;
        // a receiver thread must never run the inner's drop itself.
        self.inner.shm_readers.lock().clear();
        self.inner.udp_receiver.lock().take();
        self.inner.tcp_sessions.lock().clear();
    }
}

impl SubscriberInner {
    fn enabled_layers(&self) -> Vec<TransportLayer> {
        let mut layers = Vec::new();
        if self.config.layer.shm.enable {
            layers.push(TransportLayer::Shm);
        }
        if self.config.layer.udp.enable {
            layers.push(TransportLayer::Udp);
        }
        if self.config.layer.tcp.enable {
            layers.push(TransportLayer::Tcp);
        }
        layers
    }

    fn entry_snapshot(&self) -> SubscriberEntry {
        SubscriberEntry {
            id: self.id.clone(),
            datatype: self.datatype_filter.clone().unwrap_or_default(),
            layers: self.enabled_layers(),
            counters: TopicCounters {
                bytes: self.bytes_received.load(Ordering::Relaxed),
                data_clock: self.last_clock.load(Ordering::Relaxed),
                data_frequency: self.frequency.lock().rate_mhz(Instant::now()),
                message_drops: self.message_drops.load(Ordering::Relaxed)
                    + self.reorder_drops.load(Ordering::Relaxed),
            },
        }
    }

    fn sink(&self) -> FrameSink {
        let weak = Weak::clone(&self.self_weak);
        Arc::new(move |meta, payload| {
            if let Some(inner) = weak.upgrade() {
                inner.dispatch(meta, payload);
            }
        })
    }

    /// Reconcile layer receivers with the current registry state.
    fn update_connections(&self) {
        let pubs = self
            .runtime
            .descgate()
            .publishers_for_topic(&self.id.topic_name);
        let own_host = self.runtime.host_name();
        let own_pid = self.runtime.process_id();

        let mut next: HashMap<u64, (TopicId, DataTypeInformation)> = HashMap::new();
        let mut fired = Vec::new();

        for entry in &pubs {
            let process_local =
                entry.id.entity.process_id == own_pid && entry.id.entity.host_name == own_host;
            if process_local && !self.loopback {
                continue;
            }
            if let Some(filter) = &self.datatype_filter {
                // Publishers that do not share their type pass the filter.
                if !entry.datatype.name.is_empty() && entry.datatype.name != filter.name {
                    continue;
                }
            }

            next.insert(
                entry.id.entity.entity_id.0,
                (entry.id.clone(), entry.datatype.clone()),
            );

            let local = entry.id.entity.host_name == own_host;
            if self.config.layer.shm.enable && local {
                if let Some(AdvertisedLayer::Shm { memfile_names }) =
                    entry.layer_params(TransportLayer::Shm)
                {
                    self.ensure_shm_reader(&entry.id, memfile_names);
                }
            }
            if self.config.layer.udp.enable
                && entry.layer_params(TransportLayer::Udp).is_some()
            {
                self.ensure_udp_receiver();
            }
            if self.config.layer.tcp.enable {
                if let Some(AdvertisedLayer::Tcp { host, port }) =
                    entry.layer_params(TransportLayer::Tcp)
                {
                    self.ensure_tcp_session(&entry.id, host, *port);
                }
            }
        }

        // Diff for events and tear down receivers of vanished publishers.
        {
            let mut publishers = self.publishers.write();
            for (sender, (id, _)) in &next {
                if !publishers.contains_key(sender) {
                    fired.push(SubscriberEvent::Connected(id.clone()));
                }
            }
            for (sender, (id, _)) in publishers.iter() {
                if !next.contains_key(sender) {
                    fired.push(SubscriberEvent::Disconnected(id.clone()));
                }
            }
            *publishers = next;
        }
        {
            let publishers = self.publishers.read();
            let alive: std::collections::HashSet<&TopicId> =
                publishers.values().map(|(id, _)| id).collect();
            self.shm_readers.lock().retain(|id, _| alive.contains(id));
            self.tcp_sessions.lock().retain(|id, _| alive.contains(id));
        }

        for event in fired {
            log::debug!("[SUB] {:?} event {:?}", self.id.topic_name, event);
            self.events.notify(&event);
        }
    }

    fn ensure_shm_reader(&self, publisher: &TopicId, names: &[String]) {
        let mut readers = self.shm_readers.lock();
        if let Some(reader) = readers.get(publisher) {
            if reader.matches(names) {
                return;
            }
            // Ring reallocated under new names; re-attach.
            readers.remove(publisher);
        }
        match ShmReader::attach(names.to_vec(), self.sink()) {
            Ok(reader) => {
                readers.insert(publisher.clone(), reader);
            }
            Err(e) => {
                // Files may not exist yet right after a reallocation; the
                // next refresh retries.
                log::debug!("[SUB] shm attach to {:?} failed: {}", names, e);
            }
        }
    }

    fn ensure_udp_receiver(&self) {
        let mut receiver = self.udp_receiver.lock();
        if receiver.is_some() {
            return;
        }
        match UdpReceiver::spawn(
            &self.runtime.config().transport.udp,
            &self.id.topic_name,
            self.sink(),
        ) {
            Ok(r) => *receiver = Some(r),
            Err(e) => log::warn!(
                "[SUB] udp receiver for {:?} disabled: {}",
                self.id.topic_name,
                e
            ),
        }
    }

    fn ensure_tcp_session(&self, publisher: &TopicId, host: &str, port: u16) {
        let mut sessions = self.tcp_sessions.lock();
        if let Some(session) = sessions.get(publisher) {
            let (current_host, current_port) = session.endpoint();
            if current_host == host && current_port == port {
                return;
            }
            sessions.remove(publisher);
        }
        let max_reconnections = self.runtime.config().transport.tcp.max_reconnections;
        match TcpPayloadSession::spawn(
            host,
            port,
            max_reconnections,
            Arc::clone(self.runtime.reader_pool()),
            self.sink(),
        ) {
            Ok(session) => {
                sessions.insert(publisher.clone(), session);
            }
            Err(e) => log::debug!("[SUB] tcp session to {}:{} failed: {}", host, port, e),
        }
    }

    /// Receive path, shared by all layers.
    fn dispatch(&self, meta: FrameMeta, payload: &[u8]) {
        let gap = {
            let mut senders = self.senders.lock();
            let state = senders.entry(meta.sender_entity_id).or_default();

            // Exactly-once per (sender, clock) across layers.
            if state.recent.contains(&meta.data_clock) {
                return;
            }
            if self.config.drop_out_of_order_messages {
                if let Some(last) = state.last_clock {
                    if meta.data_clock <= last {
                        self.reorder_drops.fetch_add(1, Ordering::Relaxed);
                        log::debug!(
                            "[SUB] {:?} reorder drop clock {} (last {})",
                            self.id.topic_name,
                            meta.data_clock,
                            last
                        );
                        return;
                    }
                }
            }

            let gap = state.drop_calc.register_received(meta.data_clock);
            state.last_clock = Some(state.last_clock.map_or(meta.data_clock, |l| {
                l.max(meta.data_clock)
            }));
            state.recent.push_back(meta.data_clock);
            if state.recent.len() > DEDUP_WINDOW {
                state.recent.pop_front();
            }
            gap
        };

        if gap > 0 {
            self.message_drops.fetch_add(gap, Ordering::Relaxed);
        }
        self.bytes_received
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        self.last_clock.store(meta.data_clock, Ordering::Relaxed);
        self.frequency.lock().tick(Instant::now());

        // Park a copy for receive_buffer consumers.
        {
            let mut latest = self.latest.lock();
            *latest = Some(ReceivedPayload {
                buffer: payload.to_vec(),
                send_timestamp_us: meta.send_timestamp_us,
                send_clock: meta.data_clock,
            });
            self.latest_cv.notify_one();
        }

        if let Some(holder) = self.receive_callback.load_full() {
            let (publisher_id, datatype) = self
                .publishers
                .read()
                .get(&meta.sender_entity_id)
                .cloned()
                .unwrap_or_else(|| {
                    (
                        TopicId {
                            entity: EntityKey {
                                entity_id: EntityId(meta.sender_entity_id),
                                process_id: 0,
                                host_name: String::new(),
                            },
                            topic_name: self.id.topic_name.clone(),
                        },
                        DataTypeInformation::default(),
                    )
                });
            let view = PayloadView {
                buffer: payload,
                send_timestamp_us: meta.send_timestamp_us,
                send_clock: meta.data_clock,
            };
            (holder.callback)(&publisher_id, &datatype, &view);
        }

        if gap > 0 {
            if let Some((publisher_id, _)) =
                self.publishers.read().get(&meta.sender_entity_id).cloned()
            {
                self.events.notify(&SubscriberEvent::Dropped {
                    publisher: publisher_id,
                    count: gap,
                });
            }
        }
    }
}

impl LocalEntity for SubscriberInner {
    fn registration_sample(&self) -> Sample {
        // Piggyback on the refresh tick: publisher entry updates (memfile
        // reallocation, endpoint changes) fire no new/deleted event, so
        // the receiver set is reconciled here.
        self.update_connections();
        Sample {
            cmd: RegistrationCmd::Register,
            state: EntityState::Subscriber(self.entry_snapshot()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Out-of-order dropping and dedup are pure receive-path logic; they
    // are tested here through dispatch() without any transport.

    fn meta(sender: u64, clock: u64) -> FrameMeta {
        FrameMeta {
            sender_entity_id: sender,
            data_clock: clock,
            send_timestamp_us: 0,
            layer: TransportLayer::Udp,
        }
    }

    fn inner(drop_out_of_order: bool) -> Arc<SubscriberInner> {
        // A transport-free inner for receive-path tests.
        let mut config = SubscriberConfiguration::default();
        config.drop_out_of_order_messages = drop_out_of_order;
        Arc::new_cyclic(|self_weak| SubscriberInner {
            self_weak: Weak::clone(self_weak),
            runtime: test_runtime(),
            id: TopicId {
                entity: EntityKey {
                    entity_id: EntityId(1),
                    process_id: 1,
                    host_name: "host".to_string(),
                },
                topic_name: "t".to_string(),
            },
            datatype_filter: None,
            config,
            loopback: true,
            receive_callback: ArcSwapOption::empty(),
            senders: Mutex::new(HashMap::new()),
            publishers: RwLock::new(HashMap::new()),
            bytes_received: AtomicU64::new(0),
            last_clock: AtomicU64::new(0),
            message_drops: AtomicU64::new(0),
            reorder_drops: AtomicU64::new(0),
            frequency: Mutex::new(FrequencyCalculator::default()),
            latest: Mutex::new(None),
            latest_cv: Condvar::new(),
            shm_readers: Mutex::new(HashMap::new()),
            udp_receiver: Mutex::new(None),
            tcp_sessions: Mutex::new(HashMap::new()),
            events: EventCallbacks::new(),
            gate_token: Mutex::new(None),
        })
    }

    fn test_runtime() -> Arc<Runtime> {
        use crate::config::Configuration;
        use crate::core::runtime::Components;
        let mut config = Configuration::default();
        // No sockets in unit tests.
        config.registration.layer.udp.enable = false;
        Runtime::new("subscriber-unit-test", Components::default(), config)
            .expect("test runtime")
    }

    #[test]
    fn drops_out_of_order_frames() {
        let inner = inner(true);
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let store = Arc::clone(&delivered);
        inner.receive_callback.store(Some(Arc::new(CallbackHolder {
            callback: Box::new(move |_, _, view| {
                store.lock().push(view.send_clock);
            }),
        })));

        for clock in [5u64, 4, 6, 3, 7] {
            inner.dispatch(meta(1, clock), b"x");
        }

        assert_eq!(*delivered.lock(), vec![5, 6, 7]);
        assert_eq!(inner.reorder_drops.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn duplicate_clocks_deliver_once() {
        let inner = inner(false);
        let delivered = Arc::new(Mutex::new(Vec::new()));
        let store = Arc::clone(&delivered);
        inner.receive_callback.store(Some(Arc::new(CallbackHolder {
            callback: Box::new(move |_, _, view| {
                store.lock().push(view.send_clock);
            }),
        })));

        // Same frame arriving over SHM and UDP.
        inner.dispatch(meta(1, 1), b"x");
        inner.dispatch(meta(1, 1), b"x");
        inner.dispatch(meta(1, 2), b"x");
        inner.dispatch(meta(1, 2), b"x");

        assert_eq!(*delivered.lock(), vec![1, 2]);
    }

    #[test]
    fn reordering_is_per_sender() {
        let inner = inner(true);
        inner.dispatch(meta(1, 10), b"x");
        // Sender 2 starting at a lower clock is not a reorder.
        inner.dispatch(meta(2, 1), b"x");
        assert_eq!(inner.reorder_drops.load(Ordering::Relaxed), 0);

        inner.dispatch(meta(2, 1), b"x"); // duplicate, not a reorder
        inner.dispatch(meta(1, 9), b"x"); // reorder for sender 1
        assert_eq!(inner.reorder_drops.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn clock_gaps_count_as_message_drops() {
        let inner = inner(false);
        inner.dispatch(meta(1, 1), b"x");
        inner.dispatch(meta(1, 5), b"x");
        assert_eq!(inner.message_drops.load(Ordering::Relaxed), 3);
    }
}
