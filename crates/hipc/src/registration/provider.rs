// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hipc contributors

//! Local registration provider: the refresh loop.
//!
//! Every `registration_refresh_ms` the provider pulls a fresh sample from
//! each local entity (counters included), applies it to the local DescGate
//! and emits it over the enabled registration transports. The expiration
//! sweep for remote entries runs on the same tick. An out-of-cycle refresh
//! can be triggered (memfile reallocation must reach subscribers before
//! the next payload).

use super::descgate::DescGate;
use super::sample::encode_sample;
use crate::core::types::{EntityId, Sample};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// A local entity the provider announces periodically.
pub trait LocalEntity: Send + Sync {
    /// Current registration state, counters included.
    fn registration_sample(&self) -> Sample;
}

/// Outbound half of a registration transport.
pub trait SampleSender: Send + Sync {
    fn send_serialized(&self, bytes: &[u8]);
}

struct WakeState {
    triggered: bool,
    stopped: bool,
}

/// Periodic announcer of all local entities.
pub struct RegistrationProvider {
    entities: Mutex<BTreeMap<EntityId, Arc<dyn LocalEntity>>>,
    senders: Vec<Arc<dyn SampleSender>>,
    descgate: Arc<DescGate>,
    refresh: Duration,
    wake: Mutex<WakeState>,
    wake_cv: Condvar,
    running: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RegistrationProvider {
    pub fn new(
        descgate: Arc<DescGate>,
        senders: Vec<Arc<dyn SampleSender>>,
        refresh: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            entities: Mutex::new(BTreeMap::new()),
            senders,
            descgate,
            refresh,
            wake: Mutex::new(WakeState {
                triggered: false,
                stopped: false,
            }),
            wake_cv: Condvar::new(),
            running: AtomicBool::new(false),
            thread: Mutex::new(None),
        })
    }

    /// Start the refresh loop.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let provider = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("hipc-reg-refresh".to_string())
            .spawn(move || provider.refresh_loop());
        match handle {
            Ok(h) => *self.thread.lock() = Some(h),
            Err(e) => log::error!("[REG] refresh thread spawn failed: {}", e),
        }
    }

    /// Stop the loop and join it.
    pub fn stop(&self) {
        {
            let mut wake = self.wake.lock();
            wake.stopped = true;
            self.wake_cv.notify_all();
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
        self.running.store(false, Ordering::Release);
    }

    /// Announce a new local entity: applied and emitted immediately, then
    /// re-announced on every tick until unregistered.
    pub fn register_entity(&self, id: EntityId, entity: Arc<dyn LocalEntity>) {
        let sample = entity.registration_sample();
        self.entities.lock().insert(id, entity);
        self.emit(&sample);
    }

    /// Emit the final unregister sample; returns once it is applied
    /// locally and handed to every transport (destruction is
    /// deterministic: the sample leaves before the entity's drop returns).
    pub fn unregister_entity(&self, id: EntityId, final_sample: &Sample) {
        self.entities.lock().remove(&id);
        self.emit(final_sample);
    }

    /// Request an out-of-cycle refresh tick.
    pub fn trigger_refresh(&self) {
        let mut wake = self.wake.lock();
        wake.triggered = true;
        self.wake_cv.notify_all();
    }

    fn emit(&self, sample: &Sample) {
        self.descgate.apply_local(sample);
        if self.senders.is_empty() {
            return;
        }
        let encoded = encode_sample(sample);
        for sender in &self.senders {
            sender.send_serialized(&encoded);
        }
    }

    /// One refresh pass: re-announce every local entity, sweep expired
    /// remote entries.
    pub fn tick(&self) {
        let entities: Vec<Arc<dyn LocalEntity>> =
            self.entities.lock().values().cloned().collect();
        for entity in entities {
            self.emit(&entity.registration_sample());
        }
        self.descgate.expire(Instant::now());
    }

    fn refresh_loop(&self) {
        loop {
            {
                let mut wake = self.wake.lock();
                if !wake.stopped && !wake.triggered {
                    let _ = self.wake_cv.wait_for(&mut wake, self.refresh);
                }
                if wake.stopped {
                    return;
                }
                wake.triggered = false;
            }
            self.tick();
        }
    }
}

impl Drop for RegistrationProvider {
    fn drop(&mut self) {
        // Normally stopped by the runtime; this is the safety net.
        let stopped = self.wake.lock().stopped;
        if !stopped {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{
        DataTypeInformation, EntityKey, EntityState, PublisherEntry, RegistrationCmd,
        TopicCounters, TopicId,
    };

    struct FixedEntity {
        sample: Sample,
    }

    impl LocalEntity for FixedEntity {
        fn registration_sample(&self) -> Sample {
            self.sample.clone()
        }
    }

    struct CountingSender {
        count: std::sync::atomic::AtomicUsize,
    }

    impl SampleSender for CountingSender {
        fn send_serialized(&self, _bytes: &[u8]) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn publisher_sample(id: u64, topic: &str) -> Sample {
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
                datatype: DataTypeInformation::raw("t"),
                layers: Vec::new(),
                counters: TopicCounters::default(),
            }),
        }
    }

    #[test]
    fn register_applies_and_emits_immediately() {
        let gate = Arc::new(DescGate::new());
        let sender = Arc::new(CountingSender {
            count: std::sync::atomic::AtomicUsize::new(0),
        });
        let provider = RegistrationProvider::new(
            Arc::clone(&gate),
            vec![Arc::clone(&sender) as Arc<dyn SampleSender>],
            Duration::from_secs(3600),
        );

        provider.register_entity(
            EntityId(1),
            Arc::new(FixedEntity {
                sample: publisher_sample(1, "T"),
            }),
        );

        assert_eq!(gate.publisher_ids().len(), 1);
        assert_eq!(sender.count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn tick_reannounces_all_entities() {
        let gate = Arc::new(DescGate::new());
        let sender = Arc::new(CountingSender {
            count: std::sync::atomic::AtomicUsize::new(0),
        });
        let provider = RegistrationProvider::new(
            Arc::clone(&gate),
            vec![Arc::clone(&sender) as Arc<dyn SampleSender>],
            Duration::from_secs(3600),
        );

        provider.register_entity(
            EntityId(1),
            Arc::new(FixedEntity {
                sample: publisher_sample(1, "A"),
            }),
        );
        provider.register_entity(
            EntityId(2),
            Arc::new(FixedEntity {
                sample: publisher_sample(2, "B"),
            }),
        );

        let before = sender.count.load(Ordering::SeqCst);
        provider.tick();
        assert_eq!(sender.count.load(Ordering::SeqCst), before + 2);
    }

    #[test]
    fn unregister_emits_final_sample() {
        let gate = Arc::new(DescGate::new());
        let provider =
            RegistrationProvider::new(Arc::clone(&gate), Vec::new(), Duration::from_secs(3600));

        let sample = publisher_sample(1, "T");
        provider.register_entity(
            EntityId(1),
            Arc::new(FixedEntity {
                sample: sample.clone(),
            }),
        );
        assert_eq!(gate.publisher_ids().len(), 1);

        let unregister = Sample {
            cmd: RegistrationCmd::Unregister,
            state: sample.state.clone(),
        };
        provider.unregister_entity(EntityId(1), &unregister);
        assert!(gate.publisher_ids().is_empty());

        // Gone from the announce set: a tick must not resurrect it.
        provider.tick();
        assert!(gate.publisher_ids().is_empty());
    }

    #[test]
    fn refresh_loop_ticks_periodically() {
        let gate = Arc::new(DescGate::new());
        let sender = Arc::new(CountingSender {
            count: std::sync::atomic::AtomicUsize::new(0),
        });
        let provider = RegistrationProvider::new(
            Arc::clone(&gate),
            vec![Arc::clone(&sender) as Arc<dyn SampleSender>],
            Duration::from_millis(20),
        );
        provider.register_entity(
            EntityId(1),
            Arc::new(FixedEntity {
                sample: publisher_sample(1, "T"),
            }),
        );

        provider.start();
        std::thread::sleep(Duration::from_millis(120));
        provider.stop();

        // 1 immediate + several periodic re-announcements.
        assert!(sender.count.load(Ordering::SeqCst) >= 3);
    }
}
