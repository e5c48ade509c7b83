// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hipc contributors

//! UDP multicast payload transport.
//!
//! Payloads are split into application-layer fragments that fit under the
//! configured MTU and reassembled on the receiver side. Loss is expected
//! and not recovered at this layer.
//!
//! # Topic Addressing
//!
//! - `V1`: a single multicast group from configuration; every topic hashes
//!   into a port offset above the payload base port.
//! - `V2`: per-topic group addresses hashed into the host range left free
//!   by the configured mask; a single payload port.

mod fragment;
mod receiver;
mod sender;

pub use fragment::{fragment_message, FragmentHeader, Reassembly, FRAGMENT_HEADER_SIZE};
pub use receiver::UdpReceiver;
pub use sender::UdpSender;

use crate::config::{UdpConfigVersion, UdpConfiguration, PAYLOAD_PORT_OFFSET, TOPIC_PORT_RANGE};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

/// FNV-1a hash of a topic name; stable across processes and hosts.
pub fn topic_hash(topic_name: &str) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
    let mut hash = FNV_OFFSET;
    for byte in topic_name.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

fn parse_group(cfg: &UdpConfiguration) -> Ipv4Addr {
    cfg.group.parse().unwrap_or(Ipv4Addr::new(239, 0, 0, 1))
}

fn parse_mask(cfg: &UdpConfiguration) -> Ipv4Addr {
    cfg.mask
        .parse()
        .unwrap_or(Ipv4Addr::new(255, 255, 255, 240))
}

/// Multicast (group, port) a topic's payload travels on.
pub fn topic_address(cfg: &UdpConfiguration, hash: u64) -> (Ipv4Addr, u16) {
    let group = parse_group(cfg);
    match cfg.config_version {
        UdpConfigVersion::V1 => {
            // Fixed group, per-topic derived port offset.
            let offset = (hash % u64::from(TOPIC_PORT_RANGE)) as u16;
            (group, cfg.port + PAYLOAD_PORT_OFFSET + offset)
        }
        UdpConfigVersion::V2 => {
            // Per-topic group hashed into the range the mask leaves free.
            let mask = u32::from(parse_mask(cfg));
            let network = u32::from(group) & mask;
            let host_range = !mask;
            let host = if host_range <= 1 {
                1
            } else {
                1 + (hash % u64::from(host_range - 1)) as u32
            };
            (
                Ipv4Addr::from(network | host),
                cfg.port + PAYLOAD_PORT_OFFSET,
            )
        }
    }
}

/// Multicast (group, port) registration samples travel on.
pub fn registration_address(cfg: &UdpConfiguration) -> (Ipv4Addr, u16) {
    (parse_group(cfg), cfg.port)
}

/// Non-loopback IPv4 interfaces usable for multicast joins.
pub fn multicast_interfaces() -> Vec<Ipv4Addr> {
    let interfaces = match local_ip_address::list_afinet_netifas() {
        Ok(ifs) => ifs,
        Err(e) => {
            log::debug!("[UDP] failed to list network interfaces: {}", e);
            return Vec::new();
        }
    };

    interfaces
        .into_iter()
        .filter_map(|(_name, ip)| match ip {
            IpAddr::V4(ipv4) if !ipv4.is_loopback() => Some(ipv4),
            _ => None,
        })
        .collect()
}

/// Primary interface address advertised for point-to-point connections.
pub fn primary_interface_ip() -> Ipv4Addr {
    match local_ip_address::local_ip() {
        Ok(IpAddr::V4(ipv4)) => ipv4,
        _ => multicast_interfaces()
            .first()
            .copied()
            .unwrap_or(Ipv4Addr::LOCALHOST),
    }
}

/// Build a multicast receive socket bound to `port` and joined to `group`.
pub fn build_receive_socket(
    group: Ipv4Addr,
    port: u16,
    cfg: &UdpConfiguration,
) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    set_reuseport(&socket)?;
    if cfg.receive_buffer > 0 {
        if let Err(e) = socket.set_recv_buffer_size(cfg.receive_buffer) {
            log::debug!("[UDP] set_recv_buffer_size failed (non-fatal): {}", e);
        }
    }

    let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    socket.bind(&bind_addr.into())?;
    let socket: UdpSocket = socket.into();

    join_group(&socket, group, cfg)?;
    Ok(socket)
}

/// Join `group`, either on every interface or on the default one.
fn join_group(socket: &UdpSocket, group: Ipv4Addr, cfg: &UdpConfiguration) -> io::Result<()> {
    if cfg.join_all_interfaces {
        let interfaces = multicast_interfaces();
        if interfaces.is_empty() {
            socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
        }
        for iface in interfaces {
            match socket.join_multicast_v4(&group, &iface) {
                Ok(()) => {
                    log::debug!("[UDP] joined {} on {}", group, iface);
                }
                Err(e) => {
                    // Interfaces that cannot join multicast are skipped.
                    log::debug!("[UDP] join {} on {} failed (non-fatal): {}", group, iface, e);
                }
            }
        }
    } else {
        socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
    }
    socket.set_multicast_loop_v4(true)?;
    Ok(())
}

/// Enable SO_REUSEPORT so several subscribers in different processes on
/// one host can bind the same derived topic port.
#[cfg(unix)]
fn set_reuseport(socket: &Socket) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let fd = socket.as_raw_fd();
    let optval: libc::c_int = 1;
    // SAFETY: setsockopt FFI with a valid fd, standard socket option and
    // a correctly sized optval pointer.
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            std::ptr::from_ref(&optval).cast::<libc::c_void>(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Build a send socket bound to an ephemeral port.
pub fn build_send_socket(cfg: &UdpConfiguration) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    if cfg.send_buffer > 0 {
        if let Err(e) = socket.set_send_buffer_size(cfg.send_buffer) {
            log::debug!("[UDP] set_send_buffer_size failed (non-fatal): {}", e);
        }
    }
    socket.set_multicast_ttl_v4(cfg.ttl)?;
    socket.set_multicast_loop_v4(true)?;

    let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
    socket.bind(&bind_addr.into())?;
    Ok(socket.into())
}
