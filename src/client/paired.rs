/*
 * Copyright 2017-2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_channel::{mpsc, oneshot};
use futures_sink::Sink;
use futures_util::stream::{Fuse, StreamExt};
use tokio::sync::watch;

use super::connect::RespConnection;

use crate::{
    error::{self, ConnectionReason},
    events::{ClientEvent, Events},
    protocol::{FromResp, RespValue},
    task,
};

/// The lifecycle of a single connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    /// No new requests are accepted, outstanding ones are still answered
    Closing,
    Closed,
}

type ReplyCallback = Box<dyn FnOnce(Result<RespValue, error::Error>) + Send>;

/// Whoever is waiting for a particular reply
enum Responder {
    Channel(oneshot::Sender<Result<RespValue, error::Error>>),
    Callback(ReplyCallback),
    Discard,
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Responder::Channel(_) => f.write_str("Channel"),
            Responder::Callback(_) => f.write_str("Callback"),
            Responder::Discard => f.write_str("Discard"),
        }
    }
}

#[derive(Debug)]
enum Request {
    Send(RespValue, Responder),
    /// Requests that must be written back-to-back
    Batch(Vec<(RespValue, Responder)>),
    Close,
}

impl Request {
    fn into_responders(self) -> Vec<Responder> {
        match self {
            Request::Send(_, responder) => vec![responder],
            Request::Batch(batch) => batch.into_iter().map(|(_, r)| r).collect(),
            Request::Close => Vec::new(),
        }
    }
}

pub(crate) struct PairedOptions {
    pub(crate) address: Arc<str>,
    pub(crate) max_in_flight: usize,
    /// Generation of the invalidation tracker this connection reports to, zero if none
    pub(crate) epoch: u64,
    /// Where push data goes, it is logged and dropped if `None`
    pub(crate) push_tx: Option<mpsc::UnboundedSender<RespValue>>,
    pub(crate) events: Events,
}

/// The PairedConnectionInner is a spawned future that is responsible for pairing commands and
/// results onto a `RespConnection` that is otherwise unpaired
struct PairedConnectionInner {
    /// The underlying connection that talks the RESP protocol
    connection: RespConnection,
    /// The channel upon which commands are received
    out_rx: Fuse<mpsc::UnboundedReceiver<Request>>,
    /// The queue of waiting responders for commands sent but results not yet received
    waiting: VecDeque<Responder>,
    /// Messages accepted from `out_rx` that the connection was not yet ready to take
    send_pending: VecDeque<RespValue>,
    push_tx: Option<mpsc::UnboundedSender<RespValue>>,
    in_flight: Arc<AtomicUsize>,
    state_tx: watch::Sender<ConnectionState>,
    events: Events,
    address: Arc<str>,
    closing: bool,
}

impl PairedConnectionInner {
    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
        self.events.emit(ClientEvent::ConnectionState {
            address: self.address.to_string(),
            state,
        });
    }

    /// Returns `true` if everything pending was handed to the connection
    fn do_send(&mut self, cx: &mut Context) -> Result<bool, error::Error> {
        while let Some(msg) = self.send_pending.pop_front() {
            match Pin::new(&mut self.connection).poll_ready(cx) {
                Poll::Ready(Ok(())) => Pin::new(&mut self.connection).start_send(msg)?,
                Poll::Ready(Err(e)) => return Err(e),
                Poll::Pending => {
                    self.send_pending.push_front(msg);
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn do_flush(&mut self, cx: &mut Context) -> Result<(), error::Error> {
        match Pin::new(&mut self.connection).poll_flush(cx) {
            Poll::Ready(r) => r,
            Poll::Pending => Ok(()),
        }
    }

    fn enqueue(&mut self, msg: RespValue, responder: Responder) {
        self.waiting.push_back(responder);
        self.send_pending.push_back(msg);
    }

    fn handle_requests(&mut self, cx: &mut Context) -> Result<(), error::Error> {
        if !self.do_send(cx)? {
            return Ok(());
        }
        while !self.closing {
            match self.out_rx.poll_next_unpin(cx) {
                Poll::Pending => return Ok(()),
                Poll::Ready(None) | Poll::Ready(Some(Request::Close)) => {
                    self.closing = true;
                    self.set_state(ConnectionState::Closing);
                }
                Poll::Ready(Some(Request::Send(msg, responder))) => {
                    self.enqueue(msg, responder);
                    if !self.do_send(cx)? {
                        return Ok(());
                    }
                }
                Poll::Ready(Some(Request::Batch(batch))) => {
                    for (msg, responder) in batch {
                        self.enqueue(msg, responder);
                    }
                    if !self.do_send(cx)? {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    fn respond(&self, responder: Responder, result: Result<RespValue, error::Error>) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        match responder {
            // The receiver may have been dropped, the reply is discarded
            Responder::Channel(tx) => {
                let _ = tx.send(result);
            }
            Responder::Callback(callback) => {
                self.events.isolate("reply callback", move || callback(result));
            }
            Responder::Discard => {
                if let Err(e) = result {
                    log::debug!("Discarded request failed: {}", e);
                }
            }
        }
    }

    fn route_push(&self, items: Vec<RespValue>) {
        match &self.push_tx {
            Some(push_tx) => {
                if push_tx.unbounded_send(RespValue::Push(items)).is_err() {
                    log::debug!("Push receiver for {} has gone away", self.address);
                }
            }
            None => log::debug!("Dropping push message from {}: {:?}", self.address, items),
        }
    }

    /// Returns `false` once the connection has been closed cleanly and nothing is outstanding
    fn handle_replies(&mut self, cx: &mut Context) -> Result<bool, error::Error> {
        loop {
            if self.closing && self.waiting.is_empty() && self.send_pending.is_empty() {
                return Ok(false);
            }
            match self.connection.poll_next_unpin(cx) {
                Poll::Pending => return Ok(true),
                Poll::Ready(None) => {
                    return Err(error::Error::Connection(ConnectionReason::NotConnected));
                }
                Poll::Ready(Some(Ok(RespValue::Push(items)))) => self.route_push(items),
                Poll::Ready(Some(Ok(value))) => match self.waiting.pop_front() {
                    Some(responder) => self.respond(responder, Ok(value)),
                    None => {
                        return Err(error::resp(
                            "Received a reply with no request outstanding",
                            value,
                        ));
                    }
                },
                Poll::Ready(Some(Err(e))) => return Err(e),
            }
        }
    }

    fn poll_inner(&mut self, cx: &mut Context) -> Result<bool, error::Error> {
        self.handle_requests(cx)?;
        self.do_flush(cx)?;
        self.handle_replies(cx)
    }

    /// Fail everything outstanding or still queued, then mark the connection closed
    fn shutdown(&mut self) {
        let waiting: Vec<_> = self.waiting.drain(..).collect();
        for responder in waiting {
            self.respond(
                responder,
                Err(error::Error::Connection(ConnectionReason::NotConnected)),
            );
        }
        self.out_rx.get_mut().close();
        while let Ok(Some(request)) = self.out_rx.get_mut().try_next() {
            for responder in request.into_responders() {
                self.respond(
                    responder,
                    Err(error::Error::Connection(ConnectionReason::NotConnected)),
                );
            }
        }
        self.set_state(ConnectionState::Closed);
    }
}

impl Future for PairedConnectionInner {
    type Output = Result<(), error::Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let this_self = self.get_mut();
        match this_self.poll_inner(cx) {
            Ok(true) => Poll::Pending,
            Ok(false) => {
                this_self.shutdown();
                Poll::Ready(Ok(()))
            }
            Err(e) => {
                this_self.shutdown();
                Poll::Ready(Err(e))
            }
        }
    }
}

/// A shareable and cheaply cloneable connection to which Redis commands can be sent
#[derive(Clone)]
pub struct PairedConnection {
    out_tx: mpsc::UnboundedSender<Request>,
    state_rx: watch::Receiver<ConnectionState>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: usize,
    epoch: u64,
    address: Arc<str>,
}

impl fmt::Debug for PairedConnection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PairedConnection")
            .field("address", &self.address)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

fn not_connected() -> error::Error {
    error::Error::Connection(ConnectionReason::NotConnected)
}

fn check_command(msg: &RespValue) -> Result<(), error::Error> {
    match msg {
        RespValue::Array(_) => Ok(()),
        _ => Err(error::internal("Command must be a RespValue::Array")),
    }
}

impl PairedConnection {
    /// Take over an established connection, spawning the task that drives it
    pub(crate) fn new(connection: RespConnection, options: PairedOptions) -> Self {
        let (out_tx, out_rx) = mpsc::unbounded();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connected);
        let in_flight = Arc::new(AtomicUsize::new(0));

        let inner = PairedConnectionInner {
            connection,
            out_rx: out_rx.fuse(),
            waiting: VecDeque::new(),
            send_pending: VecDeque::new(),
            push_tx: options.push_tx,
            in_flight: in_flight.clone(),
            state_tx,
            events: options.events,
            address: options.address.clone(),
            closing: false,
        };
        inner.set_state(ConnectionState::Connected);

        let address = options.address.clone();
        task::spawn(async move {
            match inner.await {
                Ok(()) => log::debug!("Connection to {} closed", address),
                Err(e) => log::error!("Connection to {} failed: {}", address, e),
            }
        });

        PairedConnection {
            out_tx,
            state_rx,
            in_flight,
            max_in_flight: options.max_in_flight,
            epoch: options.epoch,
            address: options.address,
        }
    }

    fn submit(&self, request: Request, count: usize) -> Result<(), error::Error> {
        let previous = self.in_flight.fetch_add(count, Ordering::SeqCst);
        if previous + count > self.max_in_flight {
            self.in_flight.fetch_sub(count, Ordering::SeqCst);
            return Err(error::Error::Backpressure);
        }
        if self.out_tx.unbounded_send(request).is_err() {
            self.in_flight.fetch_sub(count, Ordering::SeqCst);
            return Err(not_connected());
        }
        Ok(())
    }

    fn submit_one(
        &self,
        msg: RespValue,
    ) -> Result<oneshot::Receiver<Result<RespValue, error::Error>>, error::Error> {
        check_command(&msg)?;
        let (tx, rx) = oneshot::channel();
        self.submit(Request::Send(msg, Responder::Channel(tx)), 1)?;
        Ok(rx)
    }

    /// Sends a command to Redis.
    ///
    /// The message must be in the format of a single RESP message, this can be constructed
    /// manually or with the `resp_array!` macro.  Returned is a future that resolves to the value
    /// returned from Redis.  The type must be one for which the `resp::FromResp` trait is defined.
    ///
    /// The future will fail for numerous reasons, including but not limited to: IO issues, conversion
    /// problems, and server-side errors being returned by Redis.
    ///
    /// Behind the scenes the message is queued up and sent to Redis asynchronously before the
    /// future is realised.  As such, it is guaranteed that messages are sent in the same order
    /// that `send` is called. Dropping the future does not withdraw the command, its reply is
    /// read and discarded.
    pub fn send<T>(&self, msg: RespValue) -> impl Future<Output = Result<T, error::Error>>
    where
        T: FromResp,
    {
        let rx = self.submit_one(msg);
        async move {
            let value = rx?.await.map_err(|_| not_connected())??;
            T::from_resp(value)
        }
    }

    /// As `send`, but error replies are returned as `RespValue::Error` rather than `Err`
    pub fn send_raw(&self, msg: RespValue) -> impl Future<Output = Result<RespValue, error::Error>> {
        let rx = self.submit_one(msg);
        async move { rx?.await.map_err(|_| not_connected())? }
    }

    /// Send a command without waiting for the reply. The reply still occupies its place in the
    /// queue and is discarded when it arrives.
    pub fn send_and_forget(&self, msg: RespValue) {
        let result = check_command(&msg).and_then(|()| self.submit(Request::Send(msg, Responder::Discard), 1));
        if let Err(e) = result {
            log::warn!("Cannot send to {}: {}", self.address, e);
        }
    }

    /// Send a command and have `callback` invoked with the reply on the connection's own task.
    ///
    /// A panic inside `callback` is caught and reported as `ClientEvent::CallbackFailed`, the
    /// connection carries on with the next reply.
    pub fn send_with<F>(&self, msg: RespValue, callback: F) -> Result<(), error::Error>
    where
        F: FnOnce(Result<RespValue, error::Error>) + Send + 'static,
    {
        check_command(&msg)?;
        self.submit(Request::Send(msg, Responder::Callback(Box::new(callback))), 1)
    }

    /// Send `ASKING` immediately followed by `msg`, returning the reply to `msg`
    pub(crate) fn send_asking(
        &self,
        msg: RespValue,
    ) -> impl Future<Output = Result<RespValue, error::Error>> {
        let (tx, rx) = oneshot::channel();
        let result = check_command(&msg).and_then(|()| {
            self.submit(
                Request::Batch(vec![
                    (resp_array!["ASKING"], Responder::Discard),
                    (msg, Responder::Channel(tx)),
                ]),
                2,
            )
        });
        async move {
            result?;
            rx.await.map_err(|_| not_connected())?
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Stop accepting requests, answer those already sent, then close
    pub fn close(&self) {
        let _ = self.out_tx.unbounded_send(Request::Close);
    }

    /// Resolves once the connection is closed, for whatever reason
    pub async fn closed(&self) {
        let mut state_rx = self.state_rx.clone();
        loop {
            if *state_rx.borrow_and_update() == ConnectionState::Closed {
                return;
            }
            if state_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// The number of requests sent but not yet answered
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }
}
