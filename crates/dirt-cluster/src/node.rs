//! Container types and attribute encoding

use crate::error::{ClusterError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unique container identifier (last segment of its ephemeral node)
pub type ContainerId = String;

/// Attribute keys published by containers at registration time
pub mod attributes {
    pub const HOST: &str = "host";
    pub const IP: &str = "ip";
    pub const PID: &str = "pid";
    pub const GROUPS: &str = "groups";
}

/// A live container (worker node) in the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    /// Unique container identifier
    pub id: ContainerId,

    /// Metadata published by the container
    pub attributes: BTreeMap<String, String>,
}

impl Container {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Set an attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn host(&self) -> Option<&str> {
        self.attribute(attributes::HOST)
    }

    /// Deployment groups this container belongs to (comma-separated attribute)
    pub fn groups(&self) -> Vec<&str> {
        self.attribute(attributes::GROUPS)
            .map(|g| {
                g.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Encode an attribute map as node data.
///
/// Layout: `u32` pair count, then per pair `u32` key length, key bytes,
/// `u32` value length, value bytes. All integers big-endian, strings UTF-8,
/// keys in sorted order.
pub fn encode_attributes(attributes: &BTreeMap<String, String>) -> Bytes {
    let size = 4 + attributes
        .iter()
        .map(|(k, v)| 8 + k.len() + v.len())
        .sum::<usize>();
    let mut buf = BytesMut::with_capacity(size);
    buf.put_u32(attributes.len() as u32);
    for (key, value) in attributes {
        buf.put_u32(key.len() as u32);
        buf.put_slice(key.as_bytes());
        buf.put_u32(value.len() as u32);
        buf.put_slice(value.as_bytes());
    }
    buf.freeze()
}

/// Decode node data produced by [`encode_attributes`].
///
/// Empty data decodes to an empty map (containers may register without
/// metadata).
pub fn decode_attributes(data: &[u8]) -> Result<BTreeMap<String, String>> {
    let mut buf = data;
    let mut attributes = BTreeMap::new();
    if buf.is_empty() {
        return Ok(attributes);
    }

    let count = read_len(&mut buf, "pair count")?;
    for _ in 0..count {
        let key = read_string(&mut buf, "key")?;
        let value = read_string(&mut buf, "value")?;
        attributes.insert(key, value);
    }

    if buf.has_remaining() {
        return Err(ClusterError::CorruptData(format!(
            "{} trailing bytes after {} attributes",
            buf.remaining(),
            count
        )));
    }
    Ok(attributes)
}

fn read_len(buf: &mut &[u8], what: &str) -> Result<usize> {
    if buf.remaining() < 4 {
        return Err(ClusterError::CorruptData(format!("truncated {what}")));
    }
    Ok(buf.get_u32() as usize)
}

fn read_string(buf: &mut &[u8], what: &str) -> Result<String> {
    let len = read_len(buf, what)?;
    if buf.remaining() < len {
        return Err(ClusterError::CorruptData(format!(
            "{what} length {len} exceeds remaining {} bytes",
            buf.remaining()
        )));
    }
    let bytes = buf.copy_to_bytes(len);
    Ok(String::from_utf8(bytes.to_vec())?)
}
