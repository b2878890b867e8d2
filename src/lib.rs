/*
 * Copyright 2017-2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! A client for Redis using Tokio and Futures, speaking RESP2 and RESP3.
//!
//! ## Low-level
//!
//! [`client::connect`](client/fn.connect.html) returns a `RespConnection`, a `Sink` and `Stream`
//! of [`resp::RespValue`](resp/enum.RespValue.html)s. It is the responsibility of the caller to
//! match responses to requests. Useful for `MONITOR` and similar streaming commands.
//!
//! ## Paired
//!
//! [`client::paired_connect`](client/fn.paired_connect.html) returns a `PairedConnection` on which
//! each command returns a future of its reply. Commands are written in the order `send` is called
//! and replies are matched to them in that order, so commands are implicitly pipelined.
//!
//! ## Pooled client
//!
//! [`client::ConnectionBuilder::connect`](client/struct.ConnectionBuilder.html#method.connect)
//! returns a [`Client`](client/struct.Client.html) holding a pool of paired connections. The same
//! client talks to a standalone server, the master found through Sentinel, or a cluster, where
//! commands are routed by the hash slot of their keys and `MOVED`/`ASK` redirections are
//! followed. Reads sent with `send_cached` can be answered from a client-side cache that the
//! server keeps coherent through invalidation messages.
//!
//! ## PUBSUB
//!
//! [`client::pubsub_connect`](client/fn.pubsub_connect.html) returns a `PubsubConnection`. Any
//! number of streams can subscribe to the same topic over one connection. Subscriptions are
//! restored if the connection is re-established.

#[macro_use]
pub mod protocol;

pub mod client;
pub mod error;
pub mod events;
pub mod reconnect;

mod task;

#[cfg(test)]
mod test_support;

pub use protocol::resp;
