/*
 * Copyright 2017-2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_channel::{mpsc, oneshot};
use futures_sink::Sink;
use futures_util::stream::{Fuse, StreamExt};

use crate::{
    client::connect::RespConnection,
    error::{self, ConnectionReason, ServerError},
    protocol::{FromResp, RespValue},
};

use super::{PubsubEvent, PubsubMessage, PubsubSignal, PubsubSink, SubscriptionKind};

type Key = (SubscriptionKind, String);

struct Subscription {
    listeners: Vec<(u64, PubsubSink)>,
    /// Callers waiting for the server to confirm the subscription
    waiting: Vec<PubsubSignal>,
    /// Identifies the SUBSCRIBE whose acknowledgement confirms this subscription
    serial: u64,
    confirmed: bool,
}

/// An acknowledgement the server owes us, they arrive in the order the commands were sent
struct PendingAck {
    ack: &'static str,
    key: Key,
    serial: Option<u64>,
}

/// Every subscription of a Pub/Sub connection and its listeners. Outlives individual server
/// connections so subscriptions can be replayed after a reconnect.
#[derive(Default)]
pub(crate) struct Registry {
    subscriptions: BTreeMap<Key, Subscription>,
    pending: VecDeque<PendingAck>,
    next_serial: u64,
}

impl Registry {
    pub(crate) fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    fn expect(&mut self, ack: &'static str, key: Key, serial: Option<u64>) -> RespValue {
        let command = resp_array![ack.to_ascii_uppercase(), key.1.as_str()];
        self.pending.push_back(PendingAck { ack, key, serial });
        command
    }

    fn serial(&mut self) -> u64 {
        self.next_serial += 1;
        self.next_serial
    }

    /// Apply a request from a handle, returning the command the server must be sent, if any
    pub(crate) fn apply(&mut self, event: PubsubEvent) -> Option<RespValue> {
        match event {
            PubsubEvent::Subscribe {
                kind,
                topic,
                id,
                sink,
                signal,
            } => {
                let key = (kind, topic);
                if let Some(subscription) = self.subscriptions.get_mut(&key) {
                    subscription.listeners.push((id, sink));
                    if subscription.confirmed {
                        let _ = signal.send(Ok(()));
                    } else {
                        subscription.waiting.push(signal);
                    }
                    return None;
                }
                let serial = self.serial();
                self.subscriptions.insert(
                    key.clone(),
                    Subscription {
                        listeners: vec![(id, sink)],
                        waiting: vec![signal],
                        serial,
                        confirmed: false,
                    },
                );
                Some(self.expect(kind.subscribe_ack(), key, Some(serial)))
            }
            PubsubEvent::Unsubscribe { kind, topic } => {
                let key = (kind, topic);
                self.subscriptions.remove(&key)?;
                Some(self.expect(kind.unsubscribe_ack(), key, None))
            }
            PubsubEvent::Dropped { kind, topic, id } => {
                let key = (kind, topic);
                let subscription = self.subscriptions.get_mut(&key)?;
                subscription.listeners.retain(|(listener, _)| *listener != id);
                if !subscription.listeners.is_empty() {
                    return None;
                }
                self.subscriptions.remove(&key);
                Some(self.expect(kind.unsubscribe_ack(), key, None))
            }
        }
    }

    /// The commands that restore every subscription on a fresh connection
    pub(crate) fn replay(&mut self) -> Vec<RespValue> {
        self.pending.clear();
        let keys: Vec<Key> = self.subscriptions.keys().cloned().collect();
        let mut commands = Vec::with_capacity(keys.len());
        for key in keys {
            let serial = self.serial();
            if let Some(subscription) = self.subscriptions.get_mut(&key) {
                subscription.serial = serial;
                subscription.confirmed = false;
            }
            let ack = key.0.subscribe_ack();
            commands.push(self.expect(ack, key, Some(serial)));
        }
        commands
    }

    /// End every stream with `reason`, forgetting all subscriptions
    pub(crate) fn close_all(&mut self, reason: ConnectionReason) {
        for (_, subscription) in std::mem::take(&mut self.subscriptions) {
            for (_, sink) in subscription.listeners {
                let _ = sink.unbounded_send(Err(error::Error::Connection(reason)));
            }
        }
        self.pending.clear();
    }

    fn acknowledge(&mut self, ack: &[u8], topic: String) -> Result<(), error::Error> {
        let expected = match self.pending.pop_front() {
            Some(expected) if expected.ack.as_bytes() == ack && expected.key.1 == topic => expected,
            _ => {
                return Err(error::internal(format!(
                    "Unexpected {} acknowledgement for: {}",
                    String::from_utf8_lossy(ack),
                    topic
                )))
            }
        };
        let serial = match expected.serial {
            Some(serial) => serial,
            None => return Ok(()),
        };
        if let Some(subscription) = self.subscriptions.get_mut(&expected.key) {
            if subscription.serial == serial {
                subscription.confirmed = true;
                for signal in subscription.waiting.drain(..) {
                    let _ = signal.send(Ok(()));
                }
            }
        }
        Ok(())
    }

    /// The server refused the oldest command still owed an acknowledgement. A refused subscribe
    /// fails its callers and streams and is forgotten, so it is not replayed.
    fn reject(&mut self, error: ServerError) {
        let expected = match self.pending.pop_front() {
            Some(expected) => expected,
            None => {
                log::warn!("Unexpected error on Pub/Sub connection: {}", error);
                return;
            }
        };
        log::warn!("{} {} refused: {}", expected.ack, expected.key.1, error);
        let serial = match expected.serial {
            Some(serial) => serial,
            None => return,
        };
        let current = matches!(
            self.subscriptions.get(&expected.key),
            Some(subscription) if subscription.serial == serial
        );
        if !current {
            return;
        }
        if let Some(subscription) = self.subscriptions.remove(&expected.key) {
            for signal in subscription.waiting {
                let _ = signal.send(Err(error::Error::Remote(error.clone())));
            }
            for (_, sink) in subscription.listeners {
                let _ = sink.unbounded_send(Err(error::Error::Remote(error.clone())));
            }
        }
    }

    fn deliver(&self, key: Key, message: PubsubMessage) {
        match self.subscriptions.get(&key) {
            Some(subscription) => {
                for (_, sink) in &subscription.listeners {
                    let _ = sink.unbounded_send(Ok(message.clone()));
                }
            }
            None => log::debug!("Message for {:?} arrived after unsubscribing", key),
        }
    }
}

impl SubscriptionKind {
    fn subscribe_ack(self) -> &'static str {
        match self {
            SubscriptionKind::Channel => "subscribe",
            SubscriptionKind::Pattern => "psubscribe",
        }
    }

    fn unsubscribe_ack(self) -> &'static str {
        match self {
            SubscriptionKind::Channel => "unsubscribe",
            SubscriptionKind::Pattern => "punsubscribe",
        }
    }
}

fn topic(value: Option<RespValue>) -> Result<String, error::Error> {
    match value {
        Some(value) => String::from_resp(value),
        None => Err(error::unexpected("Wrong number of parts for a PUBSUB message")),
    }
}

/// Drives one server connection of a Pub/Sub client: sends subscription changes and routes
/// messages to streams for downstream consumption
pub(crate) struct PubsubConnectionInner<'a> {
    /// The actual Redis connection
    connection: RespConnection,
    /// A stream onto which subscription/unsubscription requests are read
    out_rx: &'a mut Fuse<mpsc::UnboundedReceiver<PubsubEvent>>,
    registry: &'a mut Registry,
    /// Commands not yet accepted by the connection
    send_pending: VecDeque<RespValue>,
}

impl<'a> PubsubConnectionInner<'a> {
    /// Take over `connection`, starting by restoring every subscription in `registry`
    pub(crate) fn new(
        connection: RespConnection,
        out_rx: &'a mut Fuse<mpsc::UnboundedReceiver<PubsubEvent>>,
        registry: &'a mut Registry,
    ) -> Self {
        let send_pending = registry.replay().into();
        PubsubConnectionInner {
            connection,
            out_rx,
            registry,
            send_pending,
        }
    }

    /// Returns `true` if data sent, or `false` if stream not ready...
    fn do_send(&mut self, cx: &mut Context, msg: RespValue) -> Result<bool, error::Error> {
        match Pin::new(&mut self.connection).poll_ready(cx) {
            Poll::Ready(Ok(())) => {
                Pin::new(&mut self.connection).start_send(msg)?;
                Ok(true)
            }
            Poll::Ready(Err(e)) => Err(e),
            Poll::Pending => {
                self.send_pending.push_front(msg);
                Ok(false)
            }
        }
    }

    fn do_flush(&mut self, cx: &mut Context) -> Result<(), error::Error> {
        match Pin::new(&mut self.connection).poll_flush(cx) {
            Poll::Ready(r) => r,
            Poll::Pending => Ok(()),
        }
    }

    fn handle_new_subs(&mut self, cx: &mut Context) -> Result<(), error::Error> {
        while let Some(msg) = self.send_pending.pop_front() {
            if !self.do_send(cx, msg)? {
                return Ok(());
            }
        }
        loop {
            match self.out_rx.poll_next_unpin(cx) {
                Poll::Pending | Poll::Ready(None) => return Ok(()),
                Poll::Ready(Some(pubsub_event)) => {
                    if let Some(message) = self.registry.apply(pubsub_event) {
                        if !self.do_send(cx, message)? {
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    fn handle_message(&mut self, msg: RespValue) -> Result<(), error::Error> {
        let mut parts = match msg {
            RespValue::Array(parts) | RespValue::Push(parts) => parts.into_iter(),
            RespValue::Error(line) => {
                self.registry.reject(ServerError::new(line));
                return Ok(());
            }
            other => {
                log::debug!("Ignoring {:?} on Pub/Sub connection", other);
                return Ok(());
            }
        };
        let message_type = match parts.next() {
            Some(RespValue::BulkString(bytes)) => bytes,
            Some(RespValue::SimpleString(s)) => s.into_bytes(),
            _ => return Err(error::unexpected("Incorrect format of a PUBSUB message")),
        };

        match message_type.as_slice() {
            b"message" => {
                let channel = topic(parts.next())?;
                let payload = parts.next().unwrap_or(RespValue::Nil);
                self.registry.deliver(
                    (SubscriptionKind::Channel, channel.clone()),
                    PubsubMessage {
                        channel,
                        pattern: None,
                        payload,
                    },
                );
            }
            b"pmessage" => {
                let pattern = topic(parts.next())?;
                let channel = topic(parts.next())?;
                let payload = parts.next().unwrap_or(RespValue::Nil);
                self.registry.deliver(
                    (SubscriptionKind::Pattern, pattern.clone()),
                    PubsubMessage {
                        channel,
                        pattern: Some(pattern),
                        payload,
                    },
                );
            }
            ack @ (b"subscribe" | b"psubscribe" | b"unsubscribe" | b"punsubscribe") => {
                let topic = topic(parts.next())?;
                self.registry.acknowledge(ack, topic)?;
            }
            t => {
                return Err(error::internal(format!(
                    "Unexpected data on Pub/Sub connection: {}",
                    String::from_utf8_lossy(t)
                )));
            }
        }
        Ok(())
    }

    fn handle_messages(&mut self, cx: &mut Context) -> Result<(), error::Error> {
        loop {
            match self.connection.poll_next_unpin(cx) {
                Poll::Pending => return Ok(()),
                Poll::Ready(None) => {
                    return Err(error::Error::Connection(ConnectionReason::NotConnected))
                }
                Poll::Ready(Some(Ok(message))) => self.handle_message(message)?,
                Poll::Ready(Some(Err(e))) => return Err(e),
            }
        }
    }
}

impl Future for PubsubConnectionInner<'_> {
    /// `Ok` once every handle and stream is gone, `Err` if the connection is lost
    type Output = Result<(), error::Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let this_self = self.get_mut();
        this_self.handle_new_subs(cx)?;
        this_self.do_flush(cx)?;
        this_self.handle_messages(cx)?;
        if this_self.out_rx.is_done() && this_self.registry.is_empty() {
            Poll::Ready(Ok(()))
        } else {
            Poll::Pending
        }
    }
}
