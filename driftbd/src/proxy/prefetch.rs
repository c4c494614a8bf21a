//! Speculative read-ahead cache for the proxy.
//!
//! When the downstream client issues a small read, the proxy asks the
//! upstream for twice the range and keeps the second half. A client
//! walking the device sequentially then gets every other read answered
//! locally. The cache holds exactly one entry and is blown away by any
//! write and by every upstream reconnect; it must never change what the
//! client observes, only when.

use bytes::Bytes;

use nbd::NbdRequest;

struct Cached {
    from: u64,
    data: Bytes,
}

pub struct Prefetch {
    capacity: u32,
    cache: Option<Cached>,
}

impl Prefetch {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            cache: None,
        }
    }

    /// Serve a read locally if it matches the cached range exactly.
    pub fn lookup(&self, offset: u64, len: u32) -> Option<Bytes> {
        let cached = self.cache.as_ref()?;
        if cached.from == offset && cached.data.len() == len as usize {
            Some(cached.data.clone())
        } else {
            None
        }
    }

    /// Whether this read is worth doubling: small enough to cache, and
    /// the doubled range still fits the device.
    pub fn should_extend(&self, req: &NbdRequest, upstream_size: u64) -> bool {
        req.len <= self.capacity
            && req.len > 0
            && req
                .offset
                .checked_add(req.len as u64 * 2)
                .map(|end| end <= upstream_size)
                .unwrap_or(false)
    }

    /// Keep the speculative half of a doubled read.
    pub fn fill(&mut self, from: u64, data: Bytes) {
        self.cache = Some(Cached { from, data });
    }

    /// Writes and reconnects make the cached bytes untrustworthy.
    pub fn invalidate(&mut self) {
        self.cache = None;
    }
}
