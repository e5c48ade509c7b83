// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hipc contributors

//! Publisher-side UDP multicast sender.

use super::fragment::fragment_message;
use super::{build_send_socket, topic_address, topic_hash};
use crate::config::{UdpConfiguration, UDP_MTU};
use crate::transport::{PayloadHeader, PAYLOAD_HEADER_SIZE};
use std::io;
use std::net::{SocketAddr, UdpSocket};

/// Fragmenting datagram sender for one topic.
pub struct UdpSender {
    socket: UdpSocket,
    destination: SocketAddr,
    topic_hash: u64,
    sender_entity_id: u64,
    mtu: usize,
}

impl UdpSender {
    pub fn new(
        cfg: &UdpConfiguration,
        topic_name: &str,
        sender_entity_id: u64,
    ) -> io::Result<Self> {
        let hash = topic_hash(topic_name);
        let (group, port) = topic_address(cfg, hash);
        let socket = build_send_socket(cfg)?;
        log::debug!(
            "[UDP] sender for topic {:?} -> {}:{}",
            topic_name,
            group,
            port
        );
        Ok(Self {
            socket,
            destination: SocketAddr::from((group, port)),
            topic_hash: hash,
            sender_entity_id,
            mtu: UDP_MTU,
        })
    }

    /// Group/port this sender publishes to (advertised via registration).
    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    /// Send one payload frame, fragmenting as needed.
    ///
    /// Datagram loss past the socket is expected and not reported; only
    /// local socket failures surface.
    pub fn send(&self, header: &PayloadHeader, payload: &[u8]) -> io::Result<()> {
        let mut message = vec![0u8; PAYLOAD_HEADER_SIZE + payload.len()];
        header.encode(&mut message);
        message[PAYLOAD_HEADER_SIZE..].copy_from_slice(payload);

        for datagram in fragment_message(
            self.sender_entity_id,
            self.topic_hash,
            header.data_clock,
            &message,
            self.mtu,
        ) {
            self.socket.send_to(&datagram, self.destination)?;
        }
        Ok(())
    }
}
