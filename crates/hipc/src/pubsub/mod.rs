// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hipc contributors

//! Publish/subscribe core.
//!
//! Publishers own the payload buffers and dispatch to the enabled
//! transport layers in priority order; subscribers maintain the layer
//! receivers, deduplicate by (sender, data clock) and hand payloads to
//! the user callback.

pub mod counters;
pub mod events;
pub mod payload;
pub mod publisher;
pub mod subscriber;

pub use events::EventToken;
pub use payload::{BufferPayloadWriter, PayloadWriter};
pub use publisher::{Publisher, PublisherBuilder, PublisherEvent};
pub use subscriber::{ReceivedPayload, Subscriber, SubscriberBuilder, SubscriberEvent};

use crate::core::types::TopicId;

/// Borrowed view of one received payload.
///
/// With a zero-copy SHM publisher `buffer` points straight into the
/// memfile; it must not be retained past the callback's return.
pub struct PayloadView<'a> {
    pub buffer: &'a [u8],
    pub send_timestamp_us: i64,
    pub send_clock: u64,
}

/// Receive callback: `(publisher id, datatype, payload)`.
pub type ReceiveCallback =
    Box<dyn Fn(&TopicId, &crate::core::types::DataTypeInformation, &PayloadView<'_>) + Send + Sync>;
