// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hipc contributors

//! Global configuration - single source of truth.
//!
//! This module centralizes the wire/transport constants and the runtime
//! [`Configuration`] tree. **Never hardcode elsewhere!**
//!
//! Every option has a default and is overridable by passing a custom
//! [`Configuration`] to [`crate::initialize_with`]. Validation happens at
//! initialization and at entity construction; a violation is fatal for the
//! affected subsystem only.

use crate::error::{Error, Result};

// =======================================================================
// Wire Constants
// =======================================================================

/// Maximum UDP datagram payload used for fragmentation (bytes).
///
/// Conservative Ethernet MTU minus IP/UDP headers. Each fragment, header
/// included, fits under this size.
pub const UDP_MTU: usize = 1400;

/// Reassembly timeout for a partially received UDP message (milliseconds).
///
/// Timed-out partials are dropped and counted.
pub const FRAGMENT_TIMEOUT_MS: u64 = 500;

/// Maximum number of messages under reassembly at once.
///
/// The reassembly table is an LRU: exceeding this evicts (and counts) the
/// least recently touched partial.
pub const FRAGMENT_CACHE_SIZE: usize = 256;

/// Port range width used to derive per-topic ports in
/// [`UdpConfigVersion::V1`] mode.
pub const TOPIC_PORT_RANGE: u16 = 100;

/// Offset of the payload port above the registration port.
pub const PAYLOAD_PORT_OFFSET: u16 = 2;

/// Maximum accepted TCP payload frame (anti-OOM guard).
pub const TCP_MAX_FRAME_SIZE: usize = 128 * 1024 * 1024;

/// Maximum accepted service request/response frame.
pub const SERVICE_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Memfile sizes are rounded up to a multiple of this page size.
pub const MEMFILE_PAGE_SIZE: usize = 4096;

/// Slot payload capacity of the shared registration ring (bytes).
///
/// Samples that serialize larger than this are logged and dropped from the
/// SHM registration path (UDP registration still carries them).
pub const REGISTRATION_SLOT_SIZE: usize = 4096;

// =======================================================================
// Configuration Tree
// =======================================================================

/// UDP multicast addressing scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpConfigVersion {
    /// Fixed group from configuration, per-topic derived port offset.
    V1,
    /// Per-topic group addresses hashed into the range left free by `mask`.
    V2,
}

/// SHM registration transport options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationShmConfiguration {
    pub enable: bool,
    /// Slot count of the shared sample ring.
    pub queue_size: usize,
    /// Name suffix of the shared sample ring.
    pub domain: String,
}

impl Default for RegistrationShmConfiguration {
    fn default() -> Self {
        Self {
            enable: false,
            queue_size: 1024,
            domain: "hipc_mon".to_string(),
        }
    }
}

/// UDP registration transport options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationUdpConfiguration {
    pub enable: bool,
}

impl Default for RegistrationUdpConfiguration {
    fn default() -> Self {
        Self { enable: true }
    }
}

/// Registration transport selection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegistrationLayerConfiguration {
    pub shm: RegistrationShmConfiguration,
    pub udp: RegistrationUdpConfiguration,
}

/// Registration plane options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationConfiguration {
    /// Cross-host communication. Disabled restricts discovery to this host.
    pub network_enabled: bool,
    /// Deliver own publications to subscribers in the same process.
    pub loopback: bool,
    /// Period of the local re-announcement loop (milliseconds).
    pub registration_refresh_ms: u64,
    /// Remote entries expire after this long without a refresh (milliseconds).
    pub registration_timeout_ms: u64,
    /// Administrative tag grouping processes that may share SHM payloads.
    pub shm_transport_domain: String,
    pub layer: RegistrationLayerConfiguration,
}

impl Default for RegistrationConfiguration {
    fn default() -> Self {
        Self {
            network_enabled: false,
            loopback: true,
            registration_refresh_ms: 1000,
            registration_timeout_ms: 10_000,
            shm_transport_domain: String::new(),
            layer: RegistrationLayerConfiguration::default(),
        }
    }
}

/// UDP multicast transport options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpConfiguration {
    pub config_version: UdpConfigVersion,
    /// Multicast group (registration traffic; payload derivation starts here).
    pub group: String,
    /// Mask bounding the per-topic address range in `V2` mode.
    pub mask: String,
    /// Registration port; payload ports are derived above it.
    pub port: u16,
    pub ttl: u32,
    pub send_buffer: usize,
    pub receive_buffer: usize,
    /// Join the group on every interface instead of the default one.
    pub join_all_interfaces: bool,
    /// Windows-only capture acceleration; ignored on other platforms.
    pub npcap_enabled: bool,
}

impl Default for UdpConfiguration {
    fn default() -> Self {
        Self {
            config_version: UdpConfigVersion::V2,
            group: "239.0.0.1".to_string(),
            mask: "255.255.255.240".to_string(),
            port: 14000,
            ttl: 3,
            send_buffer: 5 * 1024 * 1024,
            receive_buffer: 5 * 1024 * 1024,
            join_all_interfaces: false,
            npcap_enabled: false,
        }
    }
}

/// TCP transport options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpConfiguration {
    /// Max workers of the reader executor pool.
    pub number_executor_reader: usize,
    /// Max workers of the writer executor pool.
    pub number_executor_writer: usize,
    /// Reconnection attempts of a subscriber session (negative = infinite).
    pub max_reconnections: i32,
}

impl Default for TcpConfiguration {
    fn default() -> Self {
        Self {
            number_executor_reader: 4,
            number_executor_writer: 4,
            max_reconnections: 5,
        }
    }
}

/// Transport plane options.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransportConfiguration {
    pub udp: UdpConfiguration,
    pub tcp: TcpConfiguration,
}

/// Publisher-side SHM layer options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherShmConfiguration {
    pub enable: bool,
    /// Hand the receive callback a pointer into the memfile instead of a copy.
    pub zero_copy_mode: bool,
    /// Wait this long for every connected subscriber to acknowledge before
    /// the next send (0 = no handshake).
    pub acknowledge_timeout_ms: u64,
    /// Memfiles per publisher, written as a ring.
    pub memfile_buffer_count: usize,
    /// Minimum memfile size; must be a multiple of 4096.
    pub memfile_min_size_bytes: usize,
    /// Grow a memfile this percentage above the latest payload size.
    pub memfile_reserve_percent: usize,
}

impl Default for PublisherShmConfiguration {
    fn default() -> Self {
        Self {
            enable: true,
            zero_copy_mode: false,
            acknowledge_timeout_ms: 0,
            memfile_buffer_count: 1,
            memfile_min_size_bytes: MEMFILE_PAGE_SIZE,
            memfile_reserve_percent: 50,
        }
    }
}

/// Per-layer enable switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerEnable {
    pub enable: bool,
}

/// Publisher layer set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherLayerConfiguration {
    pub shm: PublisherShmConfiguration,
    pub udp: LayerEnable,
    pub tcp: LayerEnable,
}

impl Default for PublisherLayerConfiguration {
    fn default() -> Self {
        Self {
            shm: PublisherShmConfiguration::default(),
            udp: LayerEnable { enable: true },
            tcp: LayerEnable { enable: false },
        }
    }
}

/// Publisher options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherConfiguration {
    pub layer: PublisherLayerConfiguration,
    /// Layer preference when a connected subscriber is on this host.
    pub layer_priority_local: Vec<crate::core::types::TransportLayer>,
    /// Layer preference for subscribers on other hosts.
    pub layer_priority_remote: Vec<crate::core::types::TransportLayer>,
    /// Advertise the topic type name/encoding in registration samples.
    pub share_topic_type: bool,
    /// Advertise the (possibly large) type descriptor blob.
    pub share_topic_description: bool,
}

impl Default for PublisherConfiguration {
    fn default() -> Self {
        use crate::core::types::TransportLayer::{Shm, Tcp, Udp};
        Self {
            layer: PublisherLayerConfiguration::default(),
            layer_priority_local: vec![Shm, Udp, Tcp],
            layer_priority_remote: vec![Udp, Tcp],
            share_topic_type: true,
            share_topic_description: true,
        }
    }
}

impl PublisherConfiguration {
    /// Validate the SHM sizing rules.
    pub fn validate(&self) -> Result<()> {
        let shm = &self.layer.shm;
        if shm.memfile_min_size_bytes < MEMFILE_PAGE_SIZE
            || shm.memfile_min_size_bytes % MEMFILE_PAGE_SIZE != 0
        {
            return Err(Error::InvalidConfig(format!(
                "memfile_min_size_bytes must be >= {} and divisible by {}, got {}",
                MEMFILE_PAGE_SIZE, MEMFILE_PAGE_SIZE, shm.memfile_min_size_bytes
            )));
        }
        if !(50..=100).contains(&shm.memfile_reserve_percent) {
            return Err(Error::InvalidConfig(format!(
                "memfile_reserve_percent must be in [50, 100], got {}",
                shm.memfile_reserve_percent
            )));
        }
        if shm.memfile_buffer_count == 0 {
            return Err(Error::InvalidConfig(
                "memfile_buffer_count must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Subscriber layer set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberLayerConfiguration {
    pub shm: LayerEnable,
    pub udp: LayerEnable,
    pub tcp: LayerEnable,
}

impl Default for SubscriberLayerConfiguration {
    fn default() -> Self {
        Self {
            shm: LayerEnable { enable: true },
            udp: LayerEnable { enable: true },
            tcp: LayerEnable { enable: false },
        }
    }
}

/// Subscriber options.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SubscriberConfiguration {
    pub layer: SubscriberLayerConfiguration,
    /// Drop frames whose data clock is not ahead of the sender's last one.
    pub drop_out_of_order_messages: bool,
}

/// Time synchronization module selection (consumed by the time collaborator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeConfiguration {
    pub timesync_module_rt: String,
    pub timesync_module_replay: String,
}

impl Default for TimeConfiguration {
    fn default() -> Self {
        Self {
            timesync_module_rt: "hipctime-localtime".to_string(),
            timesync_module_replay: String::new(),
        }
    }
}

/// Complete runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Configuration {
    pub registration: RegistrationConfiguration,
    pub transport: TransportConfiguration,
    pub publisher: PublisherConfiguration,
    pub subscriber: SubscriberConfiguration,
    pub time: TimeConfiguration,
}

impl Configuration {
    /// Validate every subsystem section.
    pub fn validate(&self) -> Result<()> {
        if self.registration.registration_refresh_ms == 0 {
            return Err(Error::InvalidConfig(
                "registration_refresh_ms must be > 0".to_string(),
            ));
        }
        if self.registration.registration_timeout_ms < self.registration.registration_refresh_ms {
            return Err(Error::InvalidConfig(format!(
                "registration_timeout_ms ({}) must be >= registration_refresh_ms ({})",
                self.registration.registration_timeout_ms,
                self.registration.registration_refresh_ms
            )));
        }
        self.publisher.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_configuration_is_valid() {
        assert!(Configuration::default().validate().is_ok());
    }

    #[test]
    fn memfile_min_size_must_be_page_aligned() {
        let mut cfg = PublisherConfiguration::default();
        cfg.layer.shm.memfile_min_size_bytes = 5000;
        assert!(cfg.validate().is_err());

        cfg.layer.shm.memfile_min_size_bytes = 8192;
        assert!(cfg.validate().is_ok());

        cfg.layer.shm.memfile_min_size_bytes = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn memfile_reserve_percent_range() {
        let mut cfg = PublisherConfiguration::default();
        cfg.layer.shm.memfile_reserve_percent = 49;
        assert!(cfg.validate().is_err());
        cfg.layer.shm.memfile_reserve_percent = 100;
        assert!(cfg.validate().is_ok());
        cfg.layer.shm.memfile_reserve_percent = 101;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn refresh_must_not_exceed_timeout() {
        let mut cfg = Configuration::default();
        cfg.registration.registration_refresh_ms = 2000;
        cfg.registration.registration_timeout_ms = 1000;
        assert!(cfg.validate().is_err());
    }
}
