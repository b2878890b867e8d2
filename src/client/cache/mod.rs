/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Client-side caching of read replies, kept correct by server-assisted invalidation.
//!
//! Entries are keyed by the encoded request ("fingerprint") and indexed by the keys the request
//! reads, so an invalidation naming a key drops every reply that depended on it. A fill that
//! overlaps an invalidation of one of its keys is not stored.

pub(crate) mod tracker;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::protocol::RespValue;

pub(crate) const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// What the server said is no longer valid
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    /// These keys changed
    Keys(Vec<Vec<u8>>),
    /// Everything is gone, e.g. after `FLUSHALL` or a lost tracking connection
    Flush,
}

struct CacheEntry {
    value: Arc<RespValue>,
    keys: Vec<Vec<u8>>,
    seq: u64,
}

struct Fill {
    keys: Vec<Vec<u8>>,
    dirty: bool,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<Vec<u8>, CacheEntry>,
    /// Key to the fingerprints of entries that read it
    by_key: HashMap<Vec<u8>, HashSet<Vec<u8>>>,
    /// Insertion order, oldest first, for eviction
    order: BTreeMap<u64, Vec<u8>>,
    next_seq: u64,
    fills: HashMap<u64, Fill>,
    next_fill: u64,
}

impl CacheInner {
    fn remove(&mut self, fingerprint: &[u8]) {
        if let Some(entry) = self.entries.remove(fingerprint) {
            self.order.remove(&entry.seq);
            for key in &entry.keys {
                if let Some(fingerprints) = self.by_key.get_mut(key) {
                    fingerprints.remove(fingerprint);
                    if fingerprints.is_empty() {
                        self.by_key.remove(key);
                    }
                }
            }
        }
    }

    fn evict_to(&mut self, max_entries: usize) {
        while self.entries.len() > max_entries {
            let oldest = match self.order.iter().next() {
                Some((_, fingerprint)) => fingerprint.clone(),
                None => return,
            };
            self.remove(&oldest);
        }
    }
}

pub(crate) struct ClientCache {
    inner: Mutex<CacheInner>,
    max_entries: usize,
}

impl fmt::Debug for ClientCache {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ClientCache")
            .field("entries", &self.len())
            .field("max_entries", &self.max_entries)
            .finish()
    }
}

impl ClientCache {
    pub(crate) fn new(max_entries: usize) -> Self {
        ClientCache {
            inner: Mutex::new(CacheInner::default()),
            max_entries: max_entries.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn get(&self, fingerprint: &[u8]) -> Option<Arc<RespValue>> {
        self.lock()
            .entries
            .get(fingerprint)
            .map(|entry| entry.value.clone())
    }

    /// Note that a reply for `keys` is being fetched, so invalidations arriving meanwhile
    /// are noticed
    pub(crate) fn begin_fill(self: &Arc<Self>, keys: Vec<Vec<u8>>) -> FillTicket {
        let mut inner = self.lock();
        let id = inner.next_fill;
        inner.next_fill += 1;
        inner.fills.insert(id, Fill { keys, dirty: false });
        FillTicket {
            cache: self.clone(),
            id,
        }
    }

    pub(crate) fn invalidate(&self, invalidation: &Invalidation) {
        let mut inner = self.lock();
        match invalidation {
            Invalidation::Flush => {
                inner.entries.clear();
                inner.by_key.clear();
                inner.order.clear();
                for fill in inner.fills.values_mut() {
                    fill.dirty = true;
                }
            }
            Invalidation::Keys(keys) => {
                for key in keys {
                    let fingerprints = inner.by_key.remove(key).unwrap_or_default();
                    for fingerprint in fingerprints {
                        inner.remove(&fingerprint);
                    }
                }
                for fill in inner.fills.values_mut() {
                    if fill.keys.iter().any(|k| keys.contains(k)) {
                        fill.dirty = true;
                    }
                }
            }
        }
    }

    pub(crate) fn clear(&self) {
        self.invalidate(&Invalidation::Flush);
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().entries.len()
    }
}

/// An outstanding cache fill, withdrawn if dropped before completion
pub(crate) struct FillTicket {
    cache: Arc<ClientCache>,
    id: u64,
}

impl FillTicket {
    /// Store `value` unless one of its keys was invalidated since the fill began. The value is
    /// returned either way.
    pub(crate) fn complete(self, fingerprint: Vec<u8>, value: RespValue) -> Arc<RespValue> {
        let value = Arc::new(value);
        let mut inner = self.cache.lock();
        let fill = match inner.fills.remove(&self.id) {
            Some(fill) => fill,
            None => return value,
        };
        if fill.dirty {
            log::debug!("Not caching a reply invalidated while in flight");
            return value;
        }
        inner.remove(&fingerprint);
        let seq = inner.next_seq;
        inner.next_seq += 1;
        for key in &fill.keys {
            inner
                .by_key
                .entry(key.clone())
                .or_default()
                .insert(fingerprint.clone());
        }
        inner.order.insert(seq, fingerprint.clone());
        inner.entries.insert(
            fingerprint,
            CacheEntry {
                value: value.clone(),
                keys: fill.keys,
                seq,
            },
        );
        inner.evict_to(self.cache.max_entries);
        value
    }
}

impl Drop for FillTicket {
    fn drop(&mut self) {
        self.cache.lock().fills.remove(&self.id);
    }
}
