// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hipc contributors

//! DescGate: process-local descriptor registry of all known entities.
//!
//! The authoritative view of every live publisher, subscriber, server and
//! client across the mesh, fed by the registration bus. Re-applying a
//! structurally identical sample is a no-op: no event fires and nothing
//! is allocated beyond the hash lookup. This fast path is a performance
//! contract, exercised by `benches/descgate.rs`.
//!
//! Queries take a read lock only; sample application holds the write lock
//! for the duration of compare+insert. Event callbacks run *after* the
//! lock is released, so a blocking callback cannot stall queries or other
//! sample application.

use crate::core::types::{
    ClientEntry, DataTypeInformation, EntityState, MethodInformation, PublisherEntry,
    RegistrationCmd, Sample, ServiceEntry, ServiceId, SubscriberEntry, TopicId,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Token returned by callback registration, used for removal.
pub type CallbackToken = usize;

/// Entity lifecycle transitions reported to event callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationEventType {
    NewEntity,
    DeletedEntity,
}

/// Effect of applying one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliedChange {
    /// First registration of this entity.
    New,
    /// Entity known, but some attribute changed.
    Updated,
    /// Structurally identical re-registration (fast path).
    Unchanged,
    /// Entity removed (unregister or expiry).
    Removed,
    /// Unregister for an unknown entity.
    Ignored,
}

pub type TopicEventCallback = Arc<dyn Fn(&TopicId, RegistrationEventType) + Send + Sync>;
pub type ServiceEventCallback = Arc<dyn Fn(&ServiceId, RegistrationEventType) + Send + Sync>;

struct GateEntry<T> {
    entry: T,
    /// None for local entities (they never expire).
    deadline: Option<Instant>,
    /// Application order, used to let later registrations win aggregated
    /// per-topic-name views.
    seq: u64,
}

struct CallbackRegistry<C> {
    callbacks: Mutex<HashMap<CallbackToken, C>>,
}

impl<C: Clone> CallbackRegistry<C> {
    fn new() -> Self {
        Self {
            callbacks: Mutex::new(HashMap::new()),
        }
    }

    fn add(&self, token: CallbackToken, cb: C) -> CallbackToken {
        self.callbacks.lock().insert(token, cb);
        token
    }

    fn remove(&self, token: CallbackToken) {
        self.callbacks.lock().remove(&token);
    }

    fn snapshot(&self) -> Vec<C> {
        self.callbacks.lock().values().cloned().collect()
    }
}

/// Process-local descriptor registry.
pub struct DescGate {
    publishers: RwLock<HashMap<TopicId, GateEntry<PublisherEntry>>>,
    subscribers: RwLock<HashMap<TopicId, GateEntry<SubscriberEntry>>>,
    servers: RwLock<HashMap<ServiceId, GateEntry<ServiceEntry>>>,
    clients: RwLock<HashMap<ServiceId, GateEntry<ClientEntry>>>,

    publisher_callbacks: CallbackRegistry<TopicEventCallback>,
    subscriber_callbacks: CallbackRegistry<TopicEventCallback>,
    server_callbacks: CallbackRegistry<ServiceEventCallback>,
    client_callbacks: CallbackRegistry<ServiceEventCallback>,

    next_token: AtomicUsize,
    apply_seq: AtomicU64,
}

impl Default for DescGate {
    fn default() -> Self {
        Self::new()
    }
}

impl DescGate {
    pub fn new() -> Self {
        Self {
            publishers: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            servers: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            publisher_callbacks: CallbackRegistry::new(),
            subscriber_callbacks: CallbackRegistry::new(),
            server_callbacks: CallbackRegistry::new(),
            client_callbacks: CallbackRegistry::new(),
            next_token: AtomicUsize::new(1),
            apply_seq: AtomicU64::new(0),
        }
    }

    // ===== Sample application =====

    /// Apply a sample from a local entity; local entries never expire.
    pub fn apply_local(&self, sample: &Sample) -> AppliedChange {
        self.apply(sample, None)
    }

    /// Apply a sample from a remote entity, arming its expiry deadline.
    pub fn apply_remote(&self, sample: &Sample, deadline: Instant) -> AppliedChange {
        self.apply(sample, Some(deadline))
    }

    fn apply(&self, sample: &Sample, deadline: Option<Instant>) -> AppliedChange {
        match (&sample.cmd, &sample.state) {
            (RegistrationCmd::Register, EntityState::Publisher(entry)) => {
                let (change, event) = Self::upsert(
                    &self.publishers,
                    entry.id.clone(),
                    entry,
                    deadline,
                    &self.apply_seq,
                );
                if let Some(id) = event {
                    self.notify_topic(&self.publisher_callbacks, &id, RegistrationEventType::NewEntity);
                }
                change
            }
            (RegistrationCmd::Register, EntityState::Subscriber(entry)) => {
                let (change, event) = Self::upsert(
                    &self.subscribers,
                    entry.id.clone(),
                    entry,
                    deadline,
                    &self.apply_seq,
                );
                if let Some(id) = event {
                    self.notify_topic(
                        &self.subscriber_callbacks,
                        &id,
                        RegistrationEventType::NewEntity,
                    );
                }
                change
            }
            (RegistrationCmd::Register, EntityState::Server(entry)) => {
                let (change, event) = Self::upsert(
                    &self.servers,
                    entry.id.clone(),
                    entry,
                    deadline,
                    &self.apply_seq,
                );
                if let Some(id) = event {
                    self.notify_service(&self.server_callbacks, &id, RegistrationEventType::NewEntity);
                }
                change
            }
            (RegistrationCmd::Register, EntityState::Client(entry)) => {
                let (change, event) = Self::upsert(
                    &self.clients,
                    entry.id.clone(),
                    entry,
                    deadline,
                    &self.apply_seq,
                );
                if let Some(id) = event {
                    self.notify_service(&self.client_callbacks, &id, RegistrationEventType::NewEntity);
                }
                change
            }
            (RegistrationCmd::Unregister, EntityState::Publisher(entry)) => {
                let change = Self::remove(&self.publishers, &entry.id);
                if change == AppliedChange::Removed {
                    self.notify_topic(
                        &self.publisher_callbacks,
                        &entry.id,
                        RegistrationEventType::DeletedEntity,
                    );
                }
                change
            }
            (RegistrationCmd::Unregister, EntityState::Subscriber(entry)) => {
                let change = Self::remove(&self.subscribers, &entry.id);
                if change == AppliedChange::Removed {
                    self.notify_topic(
                        &self.subscriber_callbacks,
                        &entry.id,
                        RegistrationEventType::DeletedEntity,
                    );
                }
                change
            }
            (RegistrationCmd::Unregister, EntityState::Server(entry)) => {
                let change = Self::remove(&self.servers, &entry.id);
                if change == AppliedChange::Removed {
                    self.notify_service(
                        &self.server_callbacks,
                        &entry.id,
                        RegistrationEventType::DeletedEntity,
                    );
                }
                change
            }
            (RegistrationCmd::Unregister, EntityState::Client(entry)) => {
                let change = Self::remove(&self.clients, &entry.id);
                if change == AppliedChange::Removed {
                    self.notify_service(
                        &self.client_callbacks,
                        &entry.id,
                        RegistrationEventType::DeletedEntity,
                    );
                }
                change
            }
        }
    }

    /// Insert or refresh; returns the change and, for inserts, the id to
    /// fire `NewEntity` for (after the lock is gone).
    fn upsert<K, T>(
        map: &RwLock<HashMap<K, GateEntry<T>>>,
        key: K,
        entry: &T,
        deadline: Option<Instant>,
        apply_seq: &AtomicU64,
    ) -> (AppliedChange, Option<K>)
    where
        K: std::hash::Hash + Eq + Clone,
        T: PartialEq + Clone,
    {
        let mut map = map.write();
        match map.get_mut(&key) {
            Some(existing) => {
                // Deadline refresh happens on every sample, changed or not.
                existing.deadline = deadline;
                if existing.entry == *entry {
                    (AppliedChange::Unchanged, None)
                } else {
                    existing.entry = entry.clone();
                    existing.seq = apply_seq.fetch_add(1, Ordering::Relaxed);
                    (AppliedChange::Updated, None)
                }
            }
            None => {
                map.insert(
                    key.clone(),
                    GateEntry {
                        entry: entry.clone(),
                        deadline,
                        seq: apply_seq.fetch_add(1, Ordering::Relaxed),
                    },
                );
                (AppliedChange::New, Some(key))
            }
        }
    }

    fn remove<K, T>(map: &RwLock<HashMap<K, GateEntry<T>>>, key: &K) -> AppliedChange
    where
        K: std::hash::Hash + Eq,
    {
        if map.write().remove(key).is_some() {
            AppliedChange::Removed
        } else {
            AppliedChange::Ignored
        }
    }

    /// Sweep expired remote entries and fire `DeletedEntity` for each.
    pub fn expire(&self, now: Instant) {
        let expired_pubs = Self::drain_expired(&self.publishers, now);
        let expired_subs = Self::drain_expired(&self.subscribers, now);
        let expired_servers = Self::drain_expired(&self.servers, now);
        let expired_clients = Self::drain_expired(&self.clients, now);

        for id in &expired_pubs {
            log::debug!("[REG] publisher {:?} expired", id.topic_name);
            self.notify_topic(&self.publisher_callbacks, id, RegistrationEventType::DeletedEntity);
        }
        for id in &expired_subs {
            log::debug!("[REG] subscriber {:?} expired", id.topic_name);
            self.notify_topic(
                &self.subscriber_callbacks,
                id,
                RegistrationEventType::DeletedEntity,
            );
        }
        for id in &expired_servers {
            self.notify_service(&self.server_callbacks, id, RegistrationEventType::DeletedEntity);
        }
        for id in &expired_clients {
            self.notify_service(&self.client_callbacks, id, RegistrationEventType::DeletedEntity);
        }
    }

    fn drain_expired<K, T>(map: &RwLock<HashMap<K, GateEntry<T>>>, now: Instant) -> Vec<K>
    where
        K: std::hash::Hash + Eq + Clone,
    {
        let mut map = map.write();
        let expired: Vec<K> = map
            .iter()
            .filter(|(_, e)| e.deadline.is_some_and(|d| d <= now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            map.remove(key);
        }
        expired
    }

    // ===== Queries =====

    pub fn publisher_ids(&self) -> Vec<TopicId> {
        let mut ids: Vec<TopicId> = self.publishers.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn subscriber_ids(&self) -> Vec<TopicId> {
        let mut ids: Vec<TopicId> = self.subscribers.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn server_ids(&self) -> Vec<ServiceId> {
        let mut ids: Vec<ServiceId> = self.servers.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn client_ids(&self) -> Vec<ServiceId> {
        let mut ids: Vec<ServiceId> = self.clients.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn publisher_info(&self, id: &TopicId) -> Option<DataTypeInformation> {
        self.publishers.read().get(id).map(|e| e.entry.datatype.clone())
    }

    pub fn subscriber_info(&self, id: &TopicId) -> Option<DataTypeInformation> {
        self.subscribers.read().get(id).map(|e| e.entry.datatype.clone())
    }

    pub fn server_info(&self, id: &ServiceId) -> Option<Vec<MethodInformation>> {
        self.servers.read().get(id).map(|e| e.entry.methods.clone())
    }

    pub fn client_info(&self, id: &ServiceId) -> Option<Vec<MethodInformation>> {
        self.clients.read().get(id).map(|e| e.entry.methods.clone())
    }

    /// Full publisher entries for one topic name (matching).
    pub fn publishers_for_topic(&self, topic_name: &str) -> Vec<PublisherEntry> {
        self.publishers
            .read()
            .values()
            .filter(|e| e.entry.id.topic_name == topic_name)
            .map(|e| e.entry.clone())
            .collect()
    }

    /// Full subscriber entries for one topic name (matching).
    pub fn subscribers_for_topic(&self, topic_name: &str) -> Vec<SubscriberEntry> {
        self.subscribers
            .read()
            .values()
            .filter(|e| e.entry.id.topic_name == topic_name)
            .map(|e| e.entry.clone())
            .collect()
    }

    /// Server entries for one service name (instance discovery).
    pub fn servers_for_service(&self, service_name: &str) -> Vec<ServiceEntry> {
        self.servers
            .read()
            .values()
            .filter(|e| e.entry.id.service_name == service_name)
            .map(|e| e.entry.clone())
            .collect()
    }

    /// Aggregated per-topic-name datatype view; the latest applied
    /// registration of a topic name wins.
    pub fn topics(&self) -> HashMap<String, DataTypeInformation> {
        let mut latest: HashMap<String, (u64, DataTypeInformation)> = HashMap::new();
        {
            let publishers = self.publishers.read();
            for entry in publishers.values() {
                let candidate = (entry.seq, entry.entry.datatype.clone());
                match latest.get(&entry.entry.id.topic_name) {
                    Some((seq, _)) if *seq >= entry.seq => {}
                    _ => {
                        latest.insert(entry.entry.id.topic_name.clone(), candidate);
                    }
                }
            }
        }
        {
            let subscribers = self.subscribers.read();
            for entry in subscribers.values() {
                match latest.get(&entry.entry.id.topic_name) {
                    Some((seq, _)) if *seq >= entry.seq => {}
                    _ => {
                        latest.insert(
                            entry.entry.id.topic_name.clone(),
                            (entry.seq, entry.entry.datatype.clone()),
                        );
                    }
                }
            }
        }
        latest.into_iter().map(|(k, (_, v))| (k, v)).collect()
    }

    /// Snapshots of all full entries (monitoring).
    pub fn publisher_entries(&self) -> Vec<PublisherEntry> {
        self.publishers.read().values().map(|e| e.entry.clone()).collect()
    }

    pub fn subscriber_entries(&self) -> Vec<SubscriberEntry> {
        self.subscribers.read().values().map(|e| e.entry.clone()).collect()
    }

    pub fn server_entries(&self) -> Vec<ServiceEntry> {
        self.servers.read().values().map(|e| e.entry.clone()).collect()
    }

    pub fn client_entries(&self) -> Vec<ClientEntry> {
        self.clients.read().values().map(|e| e.entry.clone()).collect()
    }

    // ===== Event callbacks =====

    fn token(&self) -> CallbackToken {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    pub fn add_publisher_event_callback(&self, cb: TopicEventCallback) -> CallbackToken {
        self.publisher_callbacks.add(self.token(), cb)
    }

    pub fn rem_publisher_event_callback(&self, token: CallbackToken) {
        self.publisher_callbacks.remove(token);
    }

    pub fn add_subscriber_event_callback(&self, cb: TopicEventCallback) -> CallbackToken {
        self.subscriber_callbacks.add(self.token(), cb)
    }

    pub fn rem_subscriber_event_callback(&self, token: CallbackToken) {
        self.subscriber_callbacks.remove(token);
    }

    pub fn add_server_event_callback(&self, cb: ServiceEventCallback) -> CallbackToken {
        self.server_callbacks.add(self.token(), cb)
    }

    pub fn rem_server_event_callback(&self, token: CallbackToken) {
        self.server_callbacks.remove(token);
    }

    pub fn add_client_event_callback(&self, cb: ServiceEventCallback) -> CallbackToken {
        self.client_callbacks.add(self.token(), cb)
    }

    pub fn rem_client_event_callback(&self, token: CallbackToken) {
        self.client_callbacks.remove(token);
    }

    fn notify_topic(
        &self,
        registry: &CallbackRegistry<TopicEventCallback>,
        id: &TopicId,
        event: RegistrationEventType,
    ) {
        for cb in registry.snapshot() {
            cb(id, event);
        }
    }

    fn notify_service(
        &self,
        registry: &CallbackRegistry<ServiceEventCallback>,
        id: &ServiceId,
        event: RegistrationEventType,
    ) {
        for cb in registry.snapshot() {
            cb(id, event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{AdvertisedLayer, EntityId, EntityKey, TopicCounters};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn publisher_sample(id: u64, topic: &str, type_name: &str) -> Sample {
        Sample {
            cmd: RegistrationCmd::Register,
            state: EntityState::Publisher(PublisherEntry {
                id: TopicId {
                    entity: EntityKey {
                        entity_id: EntityId(id),
                        process_id: 1,
                        host_name: "host".to_string(),
                    },
                    topic_name: topic.to_string(),
                },
                datatype: DataTypeInformation {
                    name: type_name.to_string(),
                    encoding: "raw".to_string(),
                    descriptor: Vec::new(),
                },
                layers: vec![AdvertisedLayer::Udp {
                    group: "239.0.0.2".to_string(),
                    port: 14002,
                }],
                counters: TopicCounters::default(),
            }),
        }
    }

    fn unregister(sample: &Sample) -> Sample {
        Sample {
            cmd: RegistrationCmd::Unregister,
            state: sample.state.clone(),
        }
    }

    #[test]
    fn reapply_identical_sample_is_noop() {
        let gate = DescGate::new();
        let sample = publisher_sample(1, "A1", "typeA1");

        assert_eq!(gate.apply_local(&sample), AppliedChange::New);
        assert_eq!(gate.apply_local(&sample), AppliedChange::Unchanged);
        assert_eq!(gate.apply_local(&sample), AppliedChange::Unchanged);
        assert_eq!(gate.publisher_ids().len(), 1);
    }

    #[test]
    fn changed_attribute_updates_without_event() {
        let gate = DescGate::new();
        let events = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&events);
        gate.add_publisher_event_callback(Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let v1 = publisher_sample(1, "A1", "typeA1");
        let v2 = publisher_sample(1, "A1", "typeA1.2");
        assert_eq!(gate.apply_local(&v1), AppliedChange::New);
        assert_eq!(gate.apply_local(&v2), AppliedChange::Updated);

        // Only the insert fired an event.
        assert_eq!(events.load(Ordering::SeqCst), 1);
        let info = gate
            .publisher_info(&gate.publisher_ids()[0])
            .expect("info");
        assert_eq!(info.name, "typeA1.2");
    }

    #[test]
    fn later_registration_wins_per_topic_view() {
        let gate = DescGate::new();
        gate.apply_local(&publisher_sample(1, "A1", "typeA1"));
        gate.apply_local(&publisher_sample(2, "A1", "typeA1.2"));

        let topics = gate.topics();
        assert_eq!(topics.len(), 1);
        assert_eq!(topics["A1"].name, "typeA1.2");
    }

    #[test]
    fn unregister_removes_and_notifies() {
        let gate = DescGate::new();
        let deleted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&deleted);
        gate.add_publisher_event_callback(Arc::new(move |_, event| {
            if event == RegistrationEventType::DeletedEntity {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));

        let sample = publisher_sample(1, "A1", "typeA1");
        gate.apply_local(&sample);
        assert_eq!(gate.apply_local(&unregister(&sample)), AppliedChange::Removed);
        assert_eq!(deleted.load(Ordering::SeqCst), 1);
        assert!(gate.publisher_ids().is_empty());

        // Unregister of an unknown entity is ignored.
        assert_eq!(gate.apply_local(&unregister(&sample)), AppliedChange::Ignored);
        assert_eq!(deleted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remote_entries_expire() {
        let gate = DescGate::new();
        let sample = publisher_sample(1, "A1", "typeA1");
        let now = Instant::now();
        gate.apply_remote(&sample, now + Duration::from_millis(50));

        gate.expire(now);
        assert_eq!(gate.publisher_ids().len(), 1);

        gate.expire(now + Duration::from_millis(60));
        assert!(gate.publisher_ids().is_empty());
    }

    #[test]
    fn refresh_rearms_deadline() {
        let gate = DescGate::new();
        let sample = publisher_sample(1, "A1", "typeA1");
        let now = Instant::now();
        gate.apply_remote(&sample, now + Duration::from_millis(50));
        // Identical refresh with a later deadline keeps the entry alive.
        gate.apply_remote(&sample, now + Duration::from_millis(500));

        gate.expire(now + Duration::from_millis(60));
        assert_eq!(gate.publisher_ids().len(), 1);
    }

    #[test]
    fn local_entries_never_expire() {
        let gate = DescGate::new();
        gate.apply_local(&publisher_sample(1, "A1", "typeA1"));
        gate.expire(Instant::now() + Duration::from_secs(3600));
        assert_eq!(gate.publisher_ids().len(), 1);
    }

    #[test]
    fn removed_callbacks_stop_firing() {
        let gate = DescGate::new();
        let events = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&events);
        let token = gate.add_publisher_event_callback(Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        gate.apply_local(&publisher_sample(1, "A1", "t"));
        gate.rem_publisher_event_callback(token);
        gate.apply_local(&publisher_sample(2, "A2", "t"));

        assert_eq!(events.load(Ordering::SeqCst), 1);
    }
}
