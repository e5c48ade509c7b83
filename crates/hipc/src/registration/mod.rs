// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hipc contributors

//! Registration plane: discovery, liveness and the public registry API.
//!
//! The [`RegistrationBus`] owns the refresh provider and the inbound
//! receivers for the enabled registration transports (SHM ring and/or UDP
//! multicast), all feeding the process-local [`DescGate`].
//!
//! The free functions at the bottom mirror the classic registration API
//! (`get_publisher_ids`, event callbacks, ...) on top of the initialized
//! runtime.

pub mod descgate;
pub mod provider;
pub mod sample;
pub mod shm;
pub mod udp;

pub use descgate::{
    AppliedChange, CallbackToken, DescGate, RegistrationEventType, ServiceEventCallback,
    TopicEventCallback,
};
pub use provider::{LocalEntity, RegistrationProvider, SampleSender};

use crate::config::Configuration;
use crate::core::process;
use crate::core::types::{
    DataTypeInformation, EntityId, MethodInformation, Sample, ServiceId, TopicId,
};
use crate::error::Result;
use shm::{RegistrationRing, ShmRegistrationReceiver};
use std::sync::Arc;
use std::time::{Duration, Instant};
use udp::{SampleHandler, UdpRegistrationReceiver, UdpRegistrationSender};

/// Registration bus: provider plus inbound receivers.
pub struct RegistrationBus {
    provider: Arc<RegistrationProvider>,
    // Receivers stop their threads on drop.
    _udp_receiver: Option<UdpRegistrationReceiver>,
    _shm_receiver: Option<ShmRegistrationReceiver>,
}

impl RegistrationBus {
    /// Wire up the configured registration transports and start the
    /// refresh loop.
    ///
    /// A transport that fails to initialize disables itself with a log
    /// line; registration falls back to the remaining transports (local
    /// matching always works through the direct DescGate path).
    pub fn start(descgate: Arc<DescGate>, config: &Configuration) -> Self {
        let reg = &config.registration;
        let own_host = process::host_name();
        let own_pid = process::process_id();
        let network_enabled = reg.network_enabled;
        let timeout = Duration::from_millis(reg.registration_timeout_ms);

        let handler_gate = Arc::clone(&descgate);
        let handler: SampleHandler = Arc::new(move |sample: Sample| {
            let key = sample.state.entity_key();
            // Own samples were already applied through the local path.
            if key.host_name == own_host && key.process_id == own_pid {
                return;
            }
            if !network_enabled && key.host_name != own_host {
                return;
            }
            handler_gate.apply_remote(&sample, Instant::now() + timeout);
        });

        let mut senders: Vec<Arc<dyn SampleSender>> = Vec::new();
        let mut udp_receiver = None;
        let mut shm_receiver = None;

        if reg.layer.udp.enable {
            let sender_id = EntityId::generate().0;
            match UdpRegistrationSender::new(&config.transport.udp, sender_id) {
                Ok(sender) => senders.push(Arc::new(sender)),
                Err(e) => log::warn!("[REG] udp registration sender disabled: {}", e),
            }
            match UdpRegistrationReceiver::spawn(&config.transport.udp, Arc::clone(&handler)) {
                Ok(receiver) => udp_receiver = Some(receiver),
                Err(e) => log::warn!("[REG] udp registration receiver disabled: {}", e),
            }
        }

        if reg.layer.shm.enable {
            match RegistrationRing::create_or_open(&reg.layer.shm.domain, reg.layer.shm.queue_size)
            {
                Ok(ring) => {
                    let ring = Arc::new(ring);
                    senders.push(Arc::new(RingSender {
                        ring: Arc::clone(&ring),
                    }));
                    match ShmRegistrationReceiver::spawn(ring, Arc::clone(&handler)) {
                        Ok(receiver) => shm_receiver = Some(receiver),
                        Err(e) => log::warn!("[REG] shm registration receiver disabled: {}", e),
                    }
                }
                Err(e) => log::warn!("[REG] shm registration ring disabled: {}", e),
            }
        }

        let provider = RegistrationProvider::new(
            descgate,
            senders,
            Duration::from_millis(reg.registration_refresh_ms),
        );
        provider.start();

        Self {
            provider,
            _udp_receiver: udp_receiver,
            _shm_receiver: shm_receiver,
        }
    }

    pub fn provider(&self) -> &Arc<RegistrationProvider> {
        &self.provider
    }

    pub fn stop(&self) {
        self.provider.stop();
    }
}

struct RingSender {
    ring: Arc<RegistrationRing>,
}

impl SampleSender for RingSender {
    fn send_serialized(&self, bytes: &[u8]) {
        self.ring.push(bytes);
    }
}

// =======================================================================
// Public registry API (initialized runtime required)
// =======================================================================

/// Snapshot of all known publishers.
pub fn get_publisher_ids() -> Result<Vec<TopicId>> {
    Ok(crate::core::runtime::current_runtime()?.descgate().publisher_ids())
}

/// Datatype information of a specific publisher.
pub fn get_publisher_info(id: &TopicId) -> Result<Option<DataTypeInformation>> {
    Ok(crate::core::runtime::current_runtime()?
        .descgate()
        .publisher_info(id))
}

/// Snapshot of all known subscribers.
pub fn get_subscriber_ids() -> Result<Vec<TopicId>> {
    Ok(crate::core::runtime::current_runtime()?.descgate().subscriber_ids())
}

/// Datatype information of a specific subscriber.
pub fn get_subscriber_info(id: &TopicId) -> Result<Option<DataTypeInformation>> {
    Ok(crate::core::runtime::current_runtime()?
        .descgate()
        .subscriber_info(id))
}

/// Snapshot of all known servers.
pub fn get_server_ids() -> Result<Vec<ServiceId>> {
    Ok(crate::core::runtime::current_runtime()?.descgate().server_ids())
}

/// Method information set of a specific server.
pub fn get_server_info(id: &ServiceId) -> Result<Option<Vec<MethodInformation>>> {
    Ok(crate::core::runtime::current_runtime()?.descgate().server_info(id))
}

/// Snapshot of all known clients.
pub fn get_client_ids() -> Result<Vec<ServiceId>> {
    Ok(crate::core::runtime::current_runtime()?.descgate().client_ids())
}

/// Method information set of a specific client.
pub fn get_client_info(id: &ServiceId) -> Result<Option<Vec<MethodInformation>>> {
    Ok(crate::core::runtime::current_runtime()?.descgate().client_info(id))
}

/// Notify about new/deleted publishers. The callback must not block for
/// longer than the registration refresh period.
pub fn add_publisher_event_callback(cb: TopicEventCallback) -> Result<CallbackToken> {
    Ok(crate::core::runtime::current_runtime()?
        .descgate()
        .add_publisher_event_callback(cb))
}

pub fn rem_publisher_event_callback(token: CallbackToken) -> Result<()> {
    crate::core::runtime::current_runtime()?
        .descgate()
        .rem_publisher_event_callback(token);
    Ok(())
}

/// Notify about new/deleted subscribers.
pub fn add_subscriber_event_callback(cb: TopicEventCallback) -> Result<CallbackToken> {
    Ok(crate::core::runtime::current_runtime()?
        .descgate()
        .add_subscriber_event_callback(cb))
}

pub fn rem_subscriber_event_callback(token: CallbackToken) -> Result<()> {
    crate::core::runtime::current_runtime()?
        .descgate()
        .rem_subscriber_event_callback(token);
    Ok(())
}

/// Aggregated topic name -> datatype view (latest registration wins).
pub fn get_topics() -> Result<std::collections::HashMap<String, DataTypeInformation>> {
    Ok(crate::core::runtime::current_runtime()?.descgate().topics())
}
