// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hipc contributors

//! # hipc - High-performance IPC middleware
//!
//! A pure Rust publish/subscribe and RPC middleware for inter-process
//! communication on a single host and across a cluster, built for
//! high-throughput, low-latency exchange of typed messages between
//! independent processes (sensor pipelines, control loops, recorders,
//! monitors).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hipc::{Publisher, Subscriber, Result};
//! use std::time::Duration;
//!
//! fn main() -> Result<()> {
//!     hipc::initialize("my_app");
//!
//!     let subscriber = Subscriber::new("CLOCK")?;
//!     subscriber.set_receive_callback(Box::new(|_id, _datatype, payload| {
//!         println!("received {} bytes", payload.buffer.len());
//!     }));
//!
//!     let publisher = Publisher::new("CLOCK")?;
//!     std::thread::sleep(Duration::from_secs(2)); // let them match
//!     publisher.send(b"Hi")?;
//!
//!     hipc::finalize();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +-------------------------------------------------------------------+
//! |                        Application Layer                          |
//! |        Publisher / Subscriber / ServiceServer / ServiceClient     |
//! +-------------------------------------------------------------------+
//! |                       Registration Plane                          |
//! |    DescGate | refresh provider | SHM ring / UDP multicast bus     |
//! +-------------------------------------------------------------------+
//! |                        Transport Plane                            |
//! |    Shared memory (memfile ring) | UDP multicast | TCP sessions    |
//! +-------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Publisher`] | Publishes payloads to a topic over the enabled layers |
//! | [`Subscriber`] | Receives payloads, deduplicated per (sender, clock) |
//! | [`ServiceServer`] | Request/response server with a method table |
//! | [`ServiceClient`] | Per-instance RPC with blocking/callback variants |
//! | [`Configuration`] | Complete runtime configuration tree |
//!
//! ## Transport selection
//!
//! Publishers dispatch to the highest-priority layer the connected
//! subscribers can receive on: SHM > UDP > TCP for same-host traffic,
//! UDP > TCP across hosts (both lists configurable). Subscribers
//! deliver each payload exactly once per (sender, data clock) even when
//! it arrives on several layers.

pub mod config;
/// Core building blocks (identity types, runtime, thread pool).
pub mod core;
mod error;
/// Monitoring snapshots of the mesh.
pub mod monitoring;
/// Publish/subscribe core.
pub mod pubsub;
/// Registration plane (discovery, liveness, registry queries).
pub mod registration;
/// Service plane (RPC over TCP).
pub mod service;
/// Payload transport layers.
pub mod transport;

pub use crate::core::process;
pub use crate::core::runtime::{
    finalize, initialize, initialize_with, is_initialized, ok, unit_name, Components,
};
pub use crate::core::threadpool::DynamicThreadPool;
pub use crate::core::types::{
    DataTypeInformation, EntityId, EntityKey, MethodInformation, ServiceId, TopicId,
    TransportLayer,
};
pub use config::Configuration;
pub use error::{Error, Result};
pub use monitoring::{get_monitoring, MonitoringSnapshot};
pub use pubsub::{
    BufferPayloadWriter, PayloadView, PayloadWriter, Publisher, PublisherEvent, ReceivedPayload,
    Subscriber, SubscriberEvent,
};
pub use service::{CallState, ClientInstance, ServiceClient, ServiceResponse, ServiceServer};

/// Crate version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version as separated integer values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

/// Parsed crate version.
pub fn version() -> Version {
    let mut parts = VERSION.split('.').map(|p| p.parse().unwrap_or(0));
    Version {
        major: parts.next().unwrap_or(0),
        minor: parts.next().unwrap_or(0),
        patch: parts.next().unwrap_or(0),
    }
}
