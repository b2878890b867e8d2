/*
 * Copyright 2017-2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Pub/Sub multiplexing.
//!
//! Any number of streams share one server connection. The first stream of a channel (or pattern)
//! subscribes on the server, the last one to go away unsubscribes. If the connection is lost a
//! new one is opened and every live subscription is restored before anything else is sent.

mod inner;

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_channel::{mpsc, oneshot};
use futures_util::stream::{Fuse, Stream, StreamExt};
use pin_project::{pin_project, pinned_drop};

use crate::{
    error::{self, ConnectionReason},
    protocol::RespValue,
    task,
};

use super::{
    connect::{Endpoint, RespConnection},
    session::Session,
};

use self::inner::{PubsubConnectionInner, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SubscriptionKind {
    /// `SUBSCRIBE` to a channel name
    Channel,
    /// `PSUBSCRIBE` to a glob-style pattern
    Pattern,
}

/// A message published on a subscribed channel
#[derive(Debug, Clone, PartialEq)]
pub struct PubsubMessage {
    pub channel: String,
    /// The pattern that matched, for pattern subscriptions
    pub pattern: Option<String>,
    pub payload: RespValue,
}

#[derive(Debug)]
pub(crate) enum PubsubEvent {
    /// A new listener, `signal` fires once the server has confirmed the subscription
    Subscribe {
        kind: SubscriptionKind,
        topic: String,
        id: u64,
        sink: PubsubSink,
        signal: PubsubSignal,
    },
    /// Drop every listener of the topic
    Unsubscribe { kind: SubscriptionKind, topic: String },
    /// One stream went away
    Dropped {
        kind: SubscriptionKind,
        topic: String,
        id: u64,
    },
}

type PubsubStreamInner = mpsc::UnboundedReceiver<Result<PubsubMessage, error::Error>>;
type PubsubSink = mpsc::UnboundedSender<Result<PubsubMessage, error::Error>>;
/// Completed when the server confirms or refuses a subscription
type PubsubSignal = oneshot::Sender<Result<(), error::Error>>;

/// A shareable reference to subscribe to PUBSUB topics
#[derive(Debug, Clone)]
pub struct PubsubConnection {
    out_tx: mpsc::UnboundedSender<PubsubEvent>,
    next_id: Arc<AtomicU64>,
}

impl PubsubConnection {
    pub(crate) async fn connect(
        session: Arc<Session>,
        endpoint: Endpoint,
    ) -> Result<Self, error::Error> {
        let connection = session.open_raw_with_retry(&endpoint).await?;
        let (out_tx, out_rx) = mpsc::unbounded();
        task::spawn(run(session, endpoint, connection, out_rx));
        Ok(PubsubConnection {
            out_tx,
            next_id: Arc::new(AtomicU64::new(0)),
        })
    }

    async fn listen(
        &self,
        kind: SubscriptionKind,
        topic: &str,
    ) -> Result<PubsubStream, error::Error> {
        let (tx, rx) = mpsc::unbounded();
        let (signal_t, signal_r) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.out_tx.unbounded_send(PubsubEvent::Subscribe {
            kind,
            topic: topic.to_owned(),
            id,
            sink: tx,
            signal: signal_t,
        })?;

        // Built before waiting, so a caller giving up still releases its listener
        let stream = PubsubStream {
            kind,
            topic: topic.to_owned(),
            id,
            underlying: rx,
            con: self.clone(),
        };
        match signal_r.await {
            Ok(Ok(())) => Ok(stream),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(error::internal("Subscription failed, try again later...")),
        }
    }

    /// Subscribes to a particular PUBSUB topic.
    ///
    /// Returns a future that resolves, once the server has confirmed the subscription, to a
    /// `Stream` of every message published on that topic from then on. Several streams may
    /// subscribe to the same topic, the server is only subscribed once.
    ///
    /// If the underlying connection is lost it is re-established and the subscription restored,
    /// the stream carries on. Only if reconnecting fails for good does the stream yield an
    /// error and end.
    pub async fn subscribe(&self, topic: &str) -> Result<PubsubStream, error::Error> {
        self.listen(SubscriptionKind::Channel, topic).await
    }

    pub async fn psubscribe(&self, topic: &str) -> Result<PubsubStream, error::Error> {
        self.listen(SubscriptionKind::Pattern, topic).await
    }

    /// Tells the client to unsubscribe from a particular topic. This will return immediately, the
    /// actual unsubscription will be confirmed when the streams returned from `subscribe` end.
    pub fn unsubscribe<T: Into<String>>(&self, topic: T) {
        // Ignoring any results, as any errors communicating with Redis would de-facto unsubscribe
        // anyway, and would be reported/logged elsewhere
        let _ = self.out_tx.unbounded_send(PubsubEvent::Unsubscribe {
            kind: SubscriptionKind::Channel,
            topic: topic.into(),
        });
    }

    pub fn punsubscribe<T: Into<String>>(&self, topic: T) {
        let _ = self.out_tx.unbounded_send(PubsubEvent::Unsubscribe {
            kind: SubscriptionKind::Pattern,
            topic: topic.into(),
        });
    }
}

async fn run(
    session: Arc<Session>,
    endpoint: Endpoint,
    connection: RespConnection,
    out_rx: mpsc::UnboundedReceiver<PubsubEvent>,
) {
    let mut out_rx: Fuse<_> = out_rx.fuse();
    let mut registry = Registry::default();
    let mut connection = Some(connection);

    loop {
        let con = match connection.take() {
            Some(con) => con,
            None => match session.open_raw_with_retry(&endpoint).await {
                Ok(con) => con,
                Err(e) => {
                    log::error!("Pub/Sub connection to {} cannot be restored: {}", endpoint, e);
                    registry.close_all(ConnectionReason::ConnectionFailed);
                    // Try again only once somebody subscribes
                    loop {
                        match out_rx.next().await {
                            Some(event) => {
                                registry.apply(event);
                                if !registry.is_empty() {
                                    break;
                                }
                            }
                            None => return,
                        }
                    }
                    continue;
                }
            },
        };

        match PubsubConnectionInner::new(con, &mut out_rx, &mut registry).await {
            Ok(()) => {
                log::debug!("Pub/Sub connection to {} no longer used", endpoint);
                return;
            }
            Err(e) => log::warn!(
                "Pub/Sub connection to {} lost: {}, resubscribing",
                endpoint,
                e
            ),
        }
    }
}

/// The messages of one subscription, unsubscribes when dropped
#[pin_project(PinnedDrop)]
#[derive(Debug)]
pub struct PubsubStream {
    kind: SubscriptionKind,
    topic: String,
    id: u64,
    #[pin]
    underlying: PubsubStreamInner,
    con: PubsubConnection,
}

impl PubsubStream {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn kind(&self) -> SubscriptionKind {
        self.kind
    }
}

impl Stream for PubsubStream {
    type Item = Result<PubsubMessage, error::Error>;

    #[inline]
    fn poll_next(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        self.project().underlying.poll_next(cx)
    }
}

#[pinned_drop]
impl PinnedDrop for PubsubStream {
    fn drop(self: Pin<&mut Self>) {
        let this = self.project();
        let _ = this.con.out_tx.unbounded_send(PubsubEvent::Dropped {
            kind: *this.kind,
            topic: this.topic.clone(),
            id: *this.id,
        });
    }
}
