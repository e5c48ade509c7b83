// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hipc contributors

//! Wire codec for registration samples.
//!
//! A sample serializes to one self-delimited record:
//!
//! ```text
//! u32 body_len | u8 wire_version | u8 cmd | u8 entity_kind | entity body
//! ```
//!
//! All integers are little-endian; strings are u16-length-prefixed UTF-8,
//! blobs are u32-length-prefixed. Records from a newer wire version are
//! discarded by the receiver (logged, never fatal).

use crate::core::types::{
    AdvertisedLayer, ClientEntry, DataTypeInformation, EntityId, EntityKey, EntityState,
    MethodInformation, PublisherEntry, RegistrationCmd, Sample, ServiceEntry, ServiceId,
    SubscriberEntry, TopicCounters, TopicId, TransportLayer,
};

/// Current registration wire version.
pub const WIRE_VERSION: u8 = 1;

/// Codec failures; malformed samples are logged and discarded upstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleCodecError {
    UnexpectedEof,
    BadVersion(u8),
    BadTag(u8),
    Utf8,
}

impl std::fmt::Display for SampleCodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SampleCodecError::UnexpectedEof => write!(f, "unexpected end of record"),
            SampleCodecError::BadVersion(v) => write!(f, "unknown wire version {}", v),
            SampleCodecError::BadTag(t) => write!(f, "unknown tag {}", t),
            SampleCodecError::Utf8 => write!(f, "invalid UTF-8 in string field"),
        }
    }
}

impl std::error::Error for SampleCodecError {}

type Result<T> = std::result::Result<T, SampleCodecError>;

// ===== Writer =====

struct RecordWriter {
    buf: Vec<u8>,
}

impl RecordWriter {
    fn new() -> Self {
        // Leave room for the length prefix, patched at the end.
        Self { buf: vec![0u8; 4] }
    }

    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn put_str(&mut self, s: &str) {
        let bytes = s.as_bytes();
        self.put_u16(bytes.len().min(u16::MAX as usize) as u16);
        self.buf
            .extend_from_slice(&bytes[..bytes.len().min(u16::MAX as usize)]);
    }

    fn put_blob(&mut self, b: &[u8]) {
        self.put_u32(b.len() as u32);
        self.buf.extend_from_slice(b);
    }

    fn finish(mut self) -> Vec<u8> {
        let body_len = (self.buf.len() - 4) as u32;
        self.buf[0..4].copy_from_slice(&body_len.to_le_bytes());
        self.buf
    }
}

// ===== Reader =====

struct RecordReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> RecordReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(SampleCodecError::UnexpectedEof);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn get_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn get_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn get_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn get_i32(&mut self) -> Result<i32> {
        let b = self.take(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn get_str(&mut self) -> Result<String> {
        let len = self.get_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| SampleCodecError::Utf8)
    }

    fn get_blob(&mut self) -> Result<Vec<u8>> {
        let len = self.get_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}

// ===== Field codecs =====

fn put_entity_key(w: &mut RecordWriter, key: &EntityKey) {
    w.put_u64(key.entity_id.0);
    w.put_i32(key.process_id);
    w.put_str(&key.host_name);
}

fn get_entity_key(r: &mut RecordReader) -> Result<EntityKey> {
    Ok(EntityKey {
        entity_id: EntityId(r.get_u64()?),
        process_id: r.get_i32()?,
        host_name: r.get_str()?,
    })
}

fn put_datatype(w: &mut RecordWriter, dti: &DataTypeInformation) {
    w.put_str(&dti.name);
    w.put_str(&dti.encoding);
    w.put_blob(&dti.descriptor);
}

fn get_datatype(r: &mut RecordReader) -> Result<DataTypeInformation> {
    Ok(DataTypeInformation {
        name: r.get_str()?,
        encoding: r.get_str()?,
        descriptor: r.get_blob()?,
    })
}

fn put_counters(w: &mut RecordWriter, c: &TopicCounters) {
    w.put_u64(c.bytes);
    w.put_u64(c.data_clock);
    w.put_u32(c.data_frequency);
    w.put_u64(c.message_drops);
}

fn get_counters(r: &mut RecordReader) -> Result<TopicCounters> {
    Ok(TopicCounters {
        bytes: r.get_u64()?,
        data_clock: r.get_u64()?,
        data_frequency: r.get_u32()?,
        message_drops: r.get_u64()?,
    })
}

fn layer_tag(layer: TransportLayer) -> u8 {
    match layer {
        TransportLayer::Shm => 0,
        TransportLayer::Udp => 1,
        TransportLayer::Tcp => 2,
    }
}

fn layer_from_tag(tag: u8) -> Result<TransportLayer> {
    match tag {
        0 => Ok(TransportLayer::Shm),
        1 => Ok(TransportLayer::Udp),
        2 => Ok(TransportLayer::Tcp),
        other => Err(SampleCodecError::BadTag(other)),
    }
}

fn put_advertised_layer(w: &mut RecordWriter, layer: &AdvertisedLayer) {
    w.put_u8(layer_tag(layer.layer()));
    match layer {
        AdvertisedLayer::Shm { memfile_names } => {
            w.put_u16(memfile_names.len() as u16);
            for name in memfile_names {
                w.put_str(name);
            }
        }
        AdvertisedLayer::Udp { group, port } => {
            w.put_str(group);
            w.put_u16(*port);
        }
        AdvertisedLayer::Tcp { host, port } => {
            w.put_str(host);
            w.put_u16(*port);
        }
    }
}

fn get_advertised_layer(r: &mut RecordReader) -> Result<AdvertisedLayer> {
    match layer_from_tag(r.get_u8()?)? {
        TransportLayer::Shm => {
            let count = r.get_u16()? as usize;
            let mut memfile_names = Vec::with_capacity(count);
            for _ in 0..count {
                memfile_names.push(r.get_str()?);
            }
            Ok(AdvertisedLayer::Shm { memfile_names })
        }
        TransportLayer::Udp => Ok(AdvertisedLayer::Udp {
            group: r.get_str()?,
            port: r.get_u16()?,
        }),
        TransportLayer::Tcp => Ok(AdvertisedLayer::Tcp {
            host: r.get_str()?,
            port: r.get_u16()?,
        }),
    }
}

fn put_method(w: &mut RecordWriter, m: &MethodInformation) {
    w.put_str(&m.name);
    put_datatype(w, &m.request_type);
    put_datatype(w, &m.response_type);
    w.put_u64(m.call_count);
}

fn get_method(r: &mut RecordReader) -> Result<MethodInformation> {
    Ok(MethodInformation {
        name: r.get_str()?,
        request_type: get_datatype(r)?,
        response_type: get_datatype(r)?,
        call_count: r.get_u64()?,
    })
}

// ===== Entity codecs =====

const KIND_PUBLISHER: u8 = 0;
const KIND_SUBSCRIBER: u8 = 1;
const KIND_SERVER: u8 = 2;
const KIND_CLIENT: u8 = 3;

/// Serialize a sample into one self-delimited record.
pub fn encode_sample(sample: &Sample) -> Vec<u8> {
    let mut w = RecordWriter::new();
    w.put_u8(WIRE_VERSION);
    w.put_u8(match sample.cmd {
        RegistrationCmd::Register => 0,
        RegistrationCmd::Unregister => 1,
    });

    match &sample.state {
        EntityState::Publisher(entry) => {
            w.put_u8(KIND_PUBLISHER);
            put_entity_key(&mut w, &entry.id.entity);
            w.put_str(&entry.id.topic_name);
            put_datatype(&mut w, &entry.datatype);
            w.put_u8(entry.layers.len() as u8);
            for layer in &entry.layers {
                put_advertised_layer(&mut w, layer);
            }
            put_counters(&mut w, &entry.counters);
        }
        EntityState::Subscriber(entry) => {
            w.put_u8(KIND_SUBSCRIBER);
            put_entity_key(&mut w, &entry.id.entity);
            w.put_str(&entry.id.topic_name);
            put_datatype(&mut w, &entry.datatype);
            w.put_u8(entry.layers.len() as u8);
            for layer in &entry.layers {
                w.put_u8(layer_tag(*layer));
            }
            put_counters(&mut w, &entry.counters);
        }
        EntityState::Server(entry) => {
            w.put_u8(KIND_SERVER);
            put_entity_key(&mut w, &entry.id.entity);
            w.put_str(&entry.id.service_name);
            w.put_u16(entry.methods.len() as u16);
            for method in &entry.methods {
                put_method(&mut w, method);
            }
            w.put_str(&entry.host);
            w.put_u16(entry.port_v0);
            w.put_u16(entry.port_v1);
        }
        EntityState::Client(entry) => {
            w.put_u8(KIND_CLIENT);
            put_entity_key(&mut w, &entry.id.entity);
            w.put_str(&entry.id.service_name);
            w.put_u16(entry.methods.len() as u16);
            for method in &entry.methods {
                put_method(&mut w, method);
            }
            w.put_u8(entry.protocol_version_max);
        }
    }

    w.finish()
}

/// Parse one record; returns the sample and the total bytes consumed
/// (length prefix included), so callers can tail a byte stream.
pub fn decode_sample(buf: &[u8]) -> Result<(Sample, usize)> {
    if buf.len() < 4 {
        return Err(SampleCodecError::UnexpectedEof);
    }
    let body_len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if buf.len() < 4 + body_len {
        return Err(SampleCodecError::UnexpectedEof);
    }

    let mut r = RecordReader::new(&buf[4..4 + body_len]);
    let version = r.get_u8()?;
    if version != WIRE_VERSION {
        return Err(SampleCodecError::BadVersion(version));
    }

    let cmd = match r.get_u8()? {
        0 => RegistrationCmd::Register,
        1 => RegistrationCmd::Unregister,
        other => return Err(SampleCodecError::BadTag(other)),
    };

    let state = match r.get_u8()? {
        KIND_PUBLISHER => {
            let entity = get_entity_key(&mut r)?;
            let topic_name = r.get_str()?;
            let datatype = get_datatype(&mut r)?;
            let count = r.get_u8()? as usize;
            let mut layers = Vec::with_capacity(count);
            for _ in 0..count {
                layers.push(get_advertised_layer(&mut r)?);
            }
            EntityState::Publisher(PublisherEntry {
                id: TopicId { entity, topic_name },
                datatype,
                layers,
                counters: get_counters(&mut r)?,
            })
        }
        KIND_SUBSCRIBER => {
            let entity = get_entity_key(&mut r)?;
            let topic_name = r.get_str()?;
            let datatype = get_datatype(&mut r)?;
            let count = r.get_u8()? as usize;
            let mut layers = Vec::with_capacity(count);
            for _ in 0..count {
                layers.push(layer_from_tag(r.get_u8()?)?);
            }
            EntityState::Subscriber(SubscriberEntry {
                id: TopicId { entity, topic_name },
                datatype,
                layers,
                counters: get_counters(&mut r)?,
            })
        }
        KIND_SERVER => {
            let entity = get_entity_key(&mut r)?;
            let service_name = r.get_str()?;
            let count = r.get_u16()? as usize;
            let mut methods = Vec::with_capacity(count);
            for _ in 0..count {
                methods.push(get_method(&mut r)?);
            }
            EntityState::Server(ServiceEntry {
                id: ServiceId {
                    entity,
                    service_name,
                },
                methods,
                host: r.get_str()?,
                port_v0: r.get_u16()?,
                port_v1: r.get_u16()?,
            })
        }
        KIND_CLIENT => {
            let entity = get_entity_key(&mut r)?;
            let service_name = r.get_str()?;
            let count = r.get_u16()? as usize;
            let mut methods = Vec::with_capacity(count);
            for _ in 0..count {
                methods.push(get_method(&mut r)?);
            }
            EntityState::Client(ClientEntry {
                id: ServiceId {
                    entity,
                    service_name,
                },
                methods,
                protocol_version_max: r.get_u8()?,
            })
        }
        other => return Err(SampleCodecError::BadTag(other)),
    };

    Ok((Sample { cmd, state }, 4 + body_len))
}
