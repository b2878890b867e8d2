/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Hash slots and the map from slot to owning node

use crc16::{State, XMODEM};

use crate::{
    client::connect::Endpoint,
    error::{self, Error},
    protocol::RespValue,
};

pub(crate) const SLOT_COUNT: usize = 16384;

const UNASSIGNED: u16 = u16::MAX;

/// The part of `key` that is hashed: the contents of the first `{...}` if non-empty, otherwise
/// the whole key
fn hash_tag(key: &[u8]) -> &[u8] {
    if let Some(open) = key.iter().position(|b| *b == b'{') {
        let rest = &key[open + 1..];
        if let Some(close) = rest.iter().position(|b| *b == b'}') {
            if close > 0 {
                return &rest[..close];
            }
        }
    }
    key
}

pub(crate) fn hash_slot(key: &[u8]) -> u16 {
    State::<XMODEM>::calculate(hash_tag(key)) % SLOT_COUNT as u16
}

/// Which node owns each of the 16384 slots
#[derive(Debug, Clone, Default)]
pub(crate) struct SlotMap {
    /// Index into `nodes`, per slot
    slots: Vec<u16>,
    nodes: Vec<Endpoint>,
}

fn malformed(value: RespValue) -> Error {
    error::resp("Malformed CLUSTER SLOTS reply", value)
}

fn integer(value: &RespValue) -> Option<i64> {
    match value {
        RespValue::Integer(i) => Some(*i),
        other => other
            .as_bytes()
            .and_then(|b| std::str::from_utf8(b).ok())
            .and_then(|s| s.parse().ok()),
    }
}

impl SlotMap {
    /// Build from a `CLUSTER SLOTS` reply. Every slot must be covered. A node advertised with an
    /// empty host lives on the host that was queried.
    pub(crate) fn from_cluster_slots(reply: RespValue, queried: &Endpoint) -> Result<Self, Error> {
        let entries = match reply {
            RespValue::Array(entries) => entries,
            other => return Err(malformed(other)),
        };
        let mut map = SlotMap {
            slots: vec![UNASSIGNED; SLOT_COUNT],
            nodes: Vec::new(),
        };
        for entry in entries {
            let (start, end, endpoint) = match parse_range(&entry, queried) {
                Some(range) => range,
                None => return Err(malformed(entry)),
            };
            let index = map.node_index(endpoint);
            for slot in start..=end {
                map.slots[slot] = index;
            }
        }
        if let Some(slot) = map.slots.iter().position(|index| *index == UNASSIGNED) {
            return Err(Error::Cluster(format!(
                "CLUSTER SLOTS does not cover every slot, {} is unassigned",
                slot
            )));
        }
        Ok(map)
    }

    fn node_index(&mut self, endpoint: Endpoint) -> u16 {
        match self.nodes.iter().position(|node| *node == endpoint) {
            Some(index) => index as u16,
            None => {
                self.nodes.push(endpoint);
                (self.nodes.len() - 1) as u16
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub(crate) fn node_for(&self, slot: u16) -> Option<&Endpoint> {
        self.slots
            .get(slot as usize)
            .and_then(|index| self.nodes.get(*index as usize))
    }

    /// Every node owning at least one slot
    pub(crate) fn nodes(&self) -> Vec<Endpoint> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(index, _)| self.slots.contains(&(*index as u16)))
            .map(|(_, node)| node.clone())
            .collect()
    }

    /// Reassign one slot, as told by a `MOVED` redirect
    pub(crate) fn update_slot(&mut self, slot: u16, endpoint: Endpoint) {
        if self.is_empty() || slot as usize >= SLOT_COUNT {
            return;
        }
        let index = self.node_index(endpoint);
        self.slots[slot as usize] = index;
    }
}

fn parse_range(entry: &RespValue, queried: &Endpoint) -> Option<(usize, usize, Endpoint)> {
    let items = match entry {
        RespValue::Array(items) if items.len() >= 3 => items,
        _ => return None,
    };
    let start = usize::try_from(integer(&items[0])?).ok()?;
    let end = usize::try_from(integer(&items[1])?).ok()?;
    if start > end || end >= SLOT_COUNT {
        return None;
    }
    let node = match &items[2] {
        RespValue::Array(node) if node.len() >= 2 => node,
        _ => return None,
    };
    let host = std::str::from_utf8(node[0].as_bytes()?).ok()?;
    let host = if host.is_empty() { queried.host() } else { host };
    let port = u16::try_from(integer(&node[1])?).ok()?;
    Some((start, end, Endpoint::new(host, port)))
}

/// A redirect reply from a cluster node
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Redirect {
    Moved { slot: u16, endpoint: Endpoint },
    Ask { slot: u16, endpoint: Endpoint },
}

impl Redirect {
    /// Parse a `MOVED`/`ASK` error sent by `origin`. An address without a host (`:6381`)
    /// refers to the host of `origin`.
    pub(crate) fn parse(reply: &RespValue, origin: &Endpoint) -> Option<Redirect> {
        let line = match reply {
            RespValue::Error(line) => line,
            _ => return None,
        };
        let mut parts = line.split_whitespace();
        let kind = parts.next()?;
        let slot = parts.next()?.parse().ok()?;
        let address = parts.next()?;
        let endpoint = match address.strip_prefix(':') {
            Some(port) => Endpoint::new(origin.host(), port.parse().ok()?),
            None => Endpoint::parse(address)?,
        };
        match kind {
            "MOVED" => Some(Redirect::Moved { slot, endpoint }),
            "ASK" => Some(Redirect::Ask { slot, endpoint }),
            _ => None,
        }
    }
}
