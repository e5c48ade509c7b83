// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hipc contributors

//! Monitoring snapshot of the mesh as this process sees it.
//!
//! Materialized from the DescGate; only available when the monitoring
//! component was enabled at initialization.

use crate::core::runtime::current_runtime;
use crate::core::types::{ClientEntry, PublisherEntry, ServiceEntry, SubscriberEntry};
use crate::error::{Error, Result};

/// One process observed in the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessEntry {
    pub host_name: String,
    pub process_id: i32,
}

/// Full mesh snapshot.
#[derive(Debug, Clone, Default)]
pub struct MonitoringSnapshot {
    pub processes: Vec<ProcessEntry>,
    pub publishers: Vec<PublisherEntry>,
    pub subscribers: Vec<SubscriberEntry>,
    pub servers: Vec<ServiceEntry>,
    pub clients: Vec<ClientEntry>,
}

/// Snapshot all known entities.
///
/// Fails with [`Error::ComponentNotAvailable`] when monitoring was not
/// enabled at initialization.
pub fn get_monitoring() -> Result<MonitoringSnapshot> {
    let runtime = current_runtime()?;
    if !runtime.components().monitoring {
        return Err(Error::ComponentNotAvailable("monitoring"));
    }

    let gate = runtime.descgate();
    let publishers = gate.publisher_entries();
    let subscribers = gate.subscriber_entries();
    let servers = gate.server_entries();
    let clients = gate.client_entries();

    let mut processes: Vec<ProcessEntry> = publishers
        .iter()
        .map(|e| &e.id.entity)
        .chain(subscribers.iter().map(|e| &e.id.entity))
        .chain(servers.iter().map(|e| &e.id.entity))
        .chain(clients.iter().map(|e| &e.id.entity))
        .map(|key| ProcessEntry {
            host_name: key.host_name.clone(),
            process_id: key.process_id,
        })
        .collect();
    processes.sort_by(|a, b| (&a.host_name, a.process_id).cmp(&(&b.host_name, b.process_id)));
    processes.dedup();

    Ok(MonitoringSnapshot {
        processes,
        publishers,
        subscribers,
        servers,
        clients,
    })
}
