/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! The connection that receives invalidation messages for one node.
//!
//! Data connections enable `CLIENT TRACKING ON REDIRECT <id>` pointing at the tracker. Each time
//! the tracker (re)connects it gets a new id and a new epoch, connections redirecting to an older
//! epoch are no longer tracked and the cache is cleared.
//!
//! Losing the tracker only disables caching, data connections keep working, so it reconnects
//! for as long as the client lives, waiting the backoff's capped delay between attempts rather
//! than giving up after its attempt ceiling.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::{
    client::{
        connect::{roundtrip, RespConnection},
        session::{Session, Target},
    },
    error::{self, ConnectionReason},
    events::ClientEvent,
    protocol::{FromResp, RespValue},
    task,
};

use super::{ClientCache, Invalidation};

const INVALIDATE_CHANNEL: &str = "__redis__:invalidate";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TrackerState {
    Down,
    Ready { id: i64, epoch: u64 },
}

/// Handle to a running tracker, the tracker stops when this is dropped
pub(crate) struct Tracker {
    state_rx: watch::Receiver<TrackerState>,
    handle: JoinHandle<()>,
}

impl Tracker {
    pub(crate) fn spawn(session: Arc<Session>, target: Target, cache: Arc<ClientCache>) -> Self {
        let (state_tx, state_rx) = watch::channel(TrackerState::Down);
        let handle = task::spawn(run(session, target, cache, state_tx));
        Tracker { state_rx, handle }
    }

    pub(crate) fn state(&self) -> TrackerState {
        *self.state_rx.borrow()
    }

    /// Wait up to `timeout` for the tracker to be connected, returning its client id and epoch
    pub(crate) async fn wait_ready(&self, timeout: Option<Duration>) -> Option<(i64, u64)> {
        let mut state_rx = self.state_rx.clone();
        let ready = async move {
            loop {
                let state = *state_rx.borrow_and_update();
                if let TrackerState::Ready { id, epoch } = state {
                    return Some((id, epoch));
                }
                if state_rx.changed().await.is_err() {
                    return None;
                }
            }
        };
        task::timeout(timeout, ready).await.ok().flatten()
    }
}

impl Drop for Tracker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run(
    session: Arc<Session>,
    target: Target,
    cache: Arc<ClientCache>,
    state_tx: watch::Sender<TrackerState>,
) {
    let mut epoch = 0;
    let mut attempt = 0;
    loop {
        let mut connected = false;
        let result = listen(&session, &target, &cache, &state_tx, &mut epoch, &mut connected).await;
        state_tx.send_replace(TrackerState::Down);
        cache.clear();
        if connected {
            attempt = 0;
            session
                .events
                .emit(ClientEvent::Invalidated(Invalidation::Flush));
        }
        let delay = session.backoff.delay(attempt);
        attempt = attempt.saturating_add(1);
        match result {
            Ok(()) => log::info!("Invalidation connection closed, reconnecting in {:?}", delay),
            Err(e) => log::warn!("Invalidation connection failed: {}, retrying in {:?}", e, delay),
        }
        session.events.emit(ClientEvent::Reconnecting {
            address: format!("{:?}", target),
            attempt,
            delay,
        });
        tokio::time::sleep(delay).await;
    }
}

async fn subscribe(connection: &mut RespConnection) -> Result<i64, error::Error> {
    let id = i64::from_resp(roundtrip(connection, resp_array!["CLIENT", "ID"]).await?)?;
    // The acknowledgement of a subscription is a push in RESP3, `roundtrip` would skip it
    connection
        .send(resp_array!["SUBSCRIBE", INVALIDATE_CHANNEL])
        .await?;
    match connection.next().await {
        Some(Ok(RespValue::Push(items))) | Some(Ok(RespValue::Array(items)))
            if items.first().and_then(RespValue::as_bytes) == Some(&b"subscribe"[..]) =>
        {
            Ok(id)
        }
        Some(Ok(other)) => Err(error::resp("Unexpected reply to SUBSCRIBE", other)),
        Some(Err(e)) => Err(e),
        None => Err(error::Error::Connection(ConnectionReason::NotConnected)),
    }
}

async fn listen(
    session: &Session,
    target: &Target,
    cache: &ClientCache,
    state_tx: &watch::Sender<TrackerState>,
    epoch: &mut u64,
    connected: &mut bool,
) -> Result<(), error::Error> {
    let endpoint = target.resolve(session).await?;
    let mut connection = session.open_raw(&endpoint, None).await?;
    let id = subscribe(&mut connection).await?;

    // Nothing cached so far can be trusted to be invalidated
    cache.clear();
    *epoch += 1;
    *connected = true;
    state_tx.send_replace(TrackerState::Ready { id, epoch: *epoch });
    log::debug!("Tracking invalidations for {} as client {}", endpoint, id);

    while let Some(frame) = connection.next().await {
        let items = match frame? {
            RespValue::Push(items) | RespValue::Array(items) => items,
            other => {
                log::debug!("Ignoring {:?} on invalidation connection", other);
                continue;
            }
        };
        if let Some(invalidation) = parse_invalidation(items) {
            cache.invalidate(&invalidation);
            session.events.emit(ClientEvent::Invalidated(invalidation));
        }
    }
    Ok(())
}

/// Read an invalidation from a `message` on the invalidation channel, or a RESP3 `invalidate`
/// push. A null or empty payload means everything.
fn parse_invalidation(items: Vec<RespValue>) -> Option<Invalidation> {
    let mut items = items.into_iter();
    let payload = match items.next()?.as_bytes()? {
        b"message" => {
            let channel = items.next()?;
            if channel.as_bytes()? != INVALIDATE_CHANNEL.as_bytes() {
                return None;
            }
            items.next()?
        }
        b"invalidate" => items.next()?,
        _ => return None,
    };
    match payload {
        RespValue::Nil => Some(Invalidation::Flush),
        RespValue::Array(keys) if keys.is_empty() => Some(Invalidation::Flush),
        RespValue::Array(keys) => Some(Invalidation::Keys(
            keys.into_iter()
                .filter_map(|key| key.as_bytes().map(<[u8]>::to_vec))
                .collect(),
        )),
        _ => None,
    }
}
