// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hipc contributors

//! Errors returned by hipc operations.
//!
//! Transport-transient failures (peer disconnect, datagram loss, buffer
//! overflow) are *not* represented here; they surface as counters and
//! events and never escalate past the affected publisher/subscriber.
//! This enum covers what the API caller can actually act on: invalid
//! configuration, lifecycle misuse, and handle-construction failures.

use crate::transport::shm::ShmError;
use std::io;

/// Errors surfaced through the public API.
#[derive(Debug)]
pub enum Error {
    /// Invalid or out-of-range configuration; fatal for the affected
    /// subsystem only.
    InvalidConfig(String),
    /// The runtime has not been initialized in this process.
    NotInitialized,
    /// The requested component was not enabled at initialization.
    ComponentNotAvailable(&'static str),
    /// Topic name empty or otherwise unusable.
    InvalidTopicName(String),
    /// Service name empty or otherwise unusable.
    InvalidServiceName(String),
    /// I/O error with underlying cause.
    Io(io::Error),
    /// Failed to bind a listener or datagram socket.
    BindFailed(String),
    /// Failed to join a multicast group.
    MulticastJoinFailed(String),
    /// Shared memory allocation or mapping failure.
    Shm(ShmError),
    /// Every selected transport failed to take the payload.
    SendFailed(String),
    /// No server instance matched the call target.
    ServiceUnavailable(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidConfig(msg) => write!(f, "Invalid configuration: {}", msg),
            Error::NotInitialized => write!(f, "hipc runtime not initialized"),
            Error::ComponentNotAvailable(which) => {
                write!(f, "Component not available: {}", which)
            }
            Error::InvalidTopicName(name) => write!(f, "Invalid topic name: {:?}", name),
            Error::InvalidServiceName(name) => write!(f, "Invalid service name: {:?}", name),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::BindFailed(msg) => write!(f, "Bind failed: {}", msg),
            Error::MulticastJoinFailed(msg) => write!(f, "Multicast join failed: {}", msg),
            Error::Shm(e) => write!(f, "Shared memory error: {}", e),
            Error::SendFailed(msg) => write!(f, "Send failed: {}", msg),
            Error::ServiceUnavailable(name) => write!(f, "Service unavailable: {}", name),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Shm(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<ShmError> for Error {
    fn from(e: ShmError) -> Self {
        Error::Shm(e)
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
