/*
 * Copyright 2017-2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! The client API itself.
//!
//! * `connect` returns a `RespConnection`, a `Sink` and `Stream` of RESP values. Pairing requests
//! to responses is up to the caller.
//! * `paired_connect` returns a `PairedConnection`, where one request results in one response
//! and commands are pipelined in the order they are sent.
//! * `pubsub_connect` returns a `PubsubConnection` for Redis's PUBSUB functionality.
//! * `ConnectionBuilder::connect` returns a `Client`: pooled connections to a server, the master
//! behind Sentinel or a cluster, with optional client-side caching.

mod builder;
pub(crate) mod cache;
pub(crate) mod cluster;
pub(crate) mod connect;
mod managed;
mod node;
mod paired;
mod pool;
mod pubsub;
mod sentinel;
mod session;

pub use self::builder::{paired_connect, pubsub_connect, ConnectionBuilder};
pub use self::cache::Invalidation;
pub use self::connect::{
    connect, connect_with_auth, AsyncStream, Connector, Endpoint, RespConnection, TcpConnector,
};
pub use self::managed::Client;
pub use self::paired::{ConnectionState, PairedConnection};
pub use self::pool::{PoolConfig, PoolStatus, PooledConnection};
pub use self::pubsub::{PubsubConnection, PubsubMessage, PubsubStream, SubscriptionKind};
pub use self::session::{Credentials, CredentialsProvider, ProviderError};
