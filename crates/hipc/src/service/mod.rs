// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hipc contributors

//! Service plane: request/response RPC over dedicated TCP sessions.
//!
//! Servers advertise one listener per protocol version (v0 and v1);
//! clients discover server instances through the registration plane and
//! pick the highest common version at connect. Calls are routed per
//! instance; client-level variants fan out to every instance.

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{ClientInstance, ServiceClient, ServiceResponse};
pub use server::ServiceServer;

use crate::core::types::ServiceId;

/// Outcome of one service call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallState {
    /// No call executed yet.
    #[default]
    None,
    /// Method ran and produced a response.
    Executed,
    /// The client-side deadline elapsed; any late response is discarded.
    Timeouted,
    /// Protocol, routing or method failure.
    Failed,
}

impl CallState {
    pub fn as_u8(self) -> u8 {
        match self {
            CallState::None => 0,
            CallState::Executed => 1,
            CallState::Timeouted => 2,
            CallState::Failed => 3,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => CallState::Executed,
            2 => CallState::Timeouted,
            3 => CallState::Failed,
            _ => CallState::None,
        }
    }
}

/// Per-instance service lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    Connected(ServiceId),
    Disconnected(ServiceId),
    /// A call against this instance hit its deadline (at most one per
    /// request).
    Timeout(ServiceId),
}

/// Method callback: untyped request bytes in, response bytes or an error
/// message out.
pub type MethodCallback =
    Arc<dyn Fn(&[u8]) -> std::result::Result<Vec<u8>, String> + Send + Sync>;

use std::sync::Arc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_state_roundtrip() {
        for state in [
            CallState::None,
            CallState::Executed,
            CallState::Timeouted,
            CallState::Failed,
        ] {
            assert_eq!(CallState::from_u8(state.as_u8()), state);
        }
    }
}
