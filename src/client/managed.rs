/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! The high-level client: pooled connections to a standalone server, the master behind Sentinel
//! or a whole cluster, with optional client-side caching.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;

use crate::{
    error,
    events::ClientEvent,
    protocol::{codec, command, FromResp, RespValue},
    task,
};

use super::{
    cache::ClientCache,
    cluster::{Cluster, ClusterConfig},
    connect::Endpoint,
    node::Node,
    pool::{PoolConfig, PoolStatus, PooledConnection},
    pubsub::PubsubConnection,
    sentinel::SentinelDiscovery,
    session::{Credentials, Session, Target},
};

/// What a client connects to
#[derive(Debug, Clone)]
pub(crate) enum Topology {
    Standalone(Endpoint),
    Sentinel {
        sentinels: Vec<Endpoint>,
        master_name: String,
        credentials: Option<Credentials>,
    },
    Cluster(Vec<Endpoint>),
}

pub(crate) struct ClientConfig {
    pub(crate) topology: Topology,
    pub(crate) pool: PoolConfig,
    /// Capacity of the client-side cache, `None` disables caching
    pub(crate) cache_entries: Option<usize>,
    pub(crate) max_redirects: usize,
}

enum Mode {
    Single { node: Node, target: Target },
    Cluster(Cluster),
}

struct ClientInner {
    session: Arc<Session>,
    mode: Mode,
    cache: Option<Arc<ClientCache>>,
    pubsub: OnceCell<PubsubConnection>,
}

/// A client for any topology. Cheap to clone, clones share connections, cache and listeners.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut debug = f.debug_struct("Client");
        match &self.inner.mode {
            Mode::Single { node, .. } => debug.field("node", node),
            Mode::Cluster(_) => debug.field("mode", &"cluster"),
        };
        debug.field("cache", &self.inner.cache).finish()
    }
}

impl Client {
    /// Connect according to `config`. Resolves once the topology is known and, for a single
    /// server, a first connection has been made.
    pub(crate) async fn connect(
        session: Arc<Session>,
        config: ClientConfig,
    ) -> Result<Client, error::Error> {
        let cache = config
            .cache_entries
            .map(|entries| Arc::new(ClientCache::new(entries)));

        let target = match config.topology {
            Topology::Standalone(endpoint) => Target::Direct(endpoint),
            Topology::Sentinel {
                sentinels,
                master_name,
                credentials,
            } => Target::Sentinel(Arc::new(SentinelDiscovery::new(
                sentinels,
                master_name,
                credentials,
            ))),
            Topology::Cluster(seeds) => {
                let cluster = Cluster::connect(
                    session.clone(),
                    ClusterConfig {
                        seeds,
                        pool: config.pool,
                        max_redirects: config.max_redirects,
                        cache: cache.clone(),
                    },
                )
                .await?;
                return Ok(Client::new(session, Mode::Cluster(cluster), cache));
            }
        };

        let node = Node::new(
            session.clone(),
            target.clone(),
            config.pool,
            cache.clone(),
            true,
        );
        drop(node.pool.acquire().await?);
        Ok(Client::new(session, Mode::Single { node, target }, cache))
    }

    fn new(session: Arc<Session>, mode: Mode, cache: Option<Arc<ClientCache>>) -> Self {
        Client {
            inner: Arc::new(ClientInner {
                session,
                mode,
                cache,
                pubsub: OnceCell::new(),
            }),
        }
    }

    /// Send to whichever connection serves `msg`, also reporting whether that connection's reads
    /// are tracked for invalidation
    async fn dispatch(&self, msg: RespValue) -> Result<(RespValue, bool), error::Error> {
        match &self.inner.mode {
            Mode::Single { node, .. } => {
                let connection = node.pool.acquire().await?;
                let reply = connection.send_raw(msg).await?;
                Ok((reply, node.is_tracked(&connection)))
            }
            Mode::Cluster(cluster) => cluster.send(msg).await,
        }
    }

    /// Send a command, converting the reply to `T`. Error replies become `Error::Remote`.
    pub async fn send<T>(&self, msg: RespValue) -> Result<T, error::Error>
    where
        T: FromResp,
    {
        T::from_resp(self.send_raw(msg).await?)
    }

    /// As `send`, but error replies are returned as `RespValue::Error`
    pub async fn send_raw(&self, msg: RespValue) -> Result<RespValue, error::Error> {
        self.dispatch(msg).await.map(|(reply, _)| reply)
    }

    /// As `send`, failing with `Error::Timeout` if there is no reply within `timeout`. The
    /// command may still be executed.
    pub async fn send_timeout<T>(&self, msg: RespValue, timeout: Duration) -> Result<T, error::Error>
    where
        T: FromResp,
    {
        task::timeout(Some(timeout), self.send(msg)).await?
    }

    /// Send a command in the background, any failure is only logged
    pub fn send_and_forget(&self, msg: RespValue) {
        let client = self.clone();
        task::spawn(async move {
            if let Err(e) = client.send_raw(msg).await {
                log::warn!("Error in send_and_forget: {}", e);
            }
        });
    }

    /// Send a read, answering from the client-side cache when possible.
    ///
    /// Every hit for the same request returns the same shared value until one of the keys it
    /// read is invalidated. Commands that cannot be cached, or any command while invalidation
    /// tracking is not in place, go to the server as with `send_raw`.
    pub async fn send_cached(&self, msg: RespValue) -> Result<Arc<RespValue>, error::Error> {
        let cache = match &self.inner.cache {
            Some(cache) if command::is_cacheable(&msg) => cache,
            _ => return Ok(Arc::new(RespValue::from_resp(self.send_raw(msg).await?)?)),
        };

        let fingerprint = codec::to_bytes(&msg);
        if let Some(hit) = cache.get(&fingerprint) {
            return Ok(hit);
        }

        let keys = command::keys(&msg).into_iter().map(<[u8]>::to_vec).collect();
        let ticket = cache.begin_fill(keys);
        let (reply, tracked) = self.dispatch(msg).await?;
        let reply = RespValue::from_resp(reply)?;
        if tracked {
            Ok(ticket.complete(fingerprint, reply))
        } else {
            Ok(Arc::new(reply))
        }
    }

    /// Borrow a connection for exclusive use, e.g. for `MULTI`/`EXEC`. Not available for a
    /// cluster, where each command is routed by its keys.
    pub async fn acquire(&self) -> Result<PooledConnection, error::Error> {
        match &self.inner.mode {
            Mode::Single { node, .. } => node.pool.acquire().await,
            Mode::Cluster(_) => Err(error::internal(
                "Connections of a cluster client are chosen per command",
            )),
        }
    }

    /// Status of the connection pool, for a single server
    pub fn pool_status(&self) -> Option<PoolStatus> {
        match &self.inner.mode {
            Mode::Single { node, .. } => Some(node.pool.status()),
            Mode::Cluster(_) => None,
        }
    }

    /// The client's Pub/Sub connection, opened on first use and shared afterwards
    pub async fn pubsub(&self) -> Result<PubsubConnection, error::Error> {
        self.inner
            .pubsub
            .get_or_try_init(|| async {
                let endpoint = match &self.inner.mode {
                    Mode::Single { target, .. } => target.resolve(&self.inner.session).await?,
                    Mode::Cluster(cluster) => cluster.any_node().ok_or_else(|| {
                        error::Error::Cluster("No cluster node is known".to_string())
                    })?,
                };
                PubsubConnection::connect(self.inner.session.clone(), endpoint).await
            })
            .await
            .cloned()
    }

    /// Register a listener for client events. A panicking listener is reported as
    /// `ClientEvent::CallbackFailed` to the others and stays registered.
    pub fn on_event<F>(&self, listener: F)
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.inner.session.events.subscribe(listener);
    }

    /// Use `credentials` for every connection opened from now on
    pub fn set_credentials(&self, credentials: Credentials) {
        self.inner.session.set_credentials(credentials);
    }

    /// Number of replies held in the client-side cache
    pub fn cached_entries(&self) -> usize {
        self.inner.cache.as_ref().map_or(0, |cache| cache.len())
    }

    /// Close idle connections and refuse new commands. Borrowed connections close as they are
    /// returned.
    pub fn close(&self) {
        match &self.inner.mode {
            Mode::Single { node, .. } => node.close(),
            Mode::Cluster(cluster) => cluster.close(),
        }
        if let Some(cache) = &self.inner.cache {
            cache.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use futures_util::StreamExt;

    use crate::{
        client::{
            builder::ConnectionBuilder, cache::Invalidation, session::Credentials, Client,
        },
        error::Error,
        events::ClientEvent,
        protocol::{ProtocolVersion, RespValue},
        reconnect::Backoff,
        test_support::{FakeServer, HOST},
    };

    fn builder(server: &FakeServer) -> ConnectionBuilder {
        let mut builder = ConnectionBuilder::new(HOST, 6379).unwrap();
        builder
            .connector(Arc::new(server.connector()))
            .backoff(Backoff::new(
                Duration::from_millis(1),
                Duration::from_millis(5),
                3,
            ));
        builder
    }

    fn count(server: &FakeServer, command: &[&str]) -> usize {
        server
            .command_log()
            .iter()
            .filter(|c| c.iter().map(String::as_str).eq(command.iter().copied()))
            .count()
    }

    fn invalidations(client: &Client) -> Arc<Mutex<Vec<Invalidation>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_c = seen.clone();
        client.on_event(move |event| {
            if let ClientEvent::Invalidated(invalidation) = event {
                seen_c.lock().unwrap().push(invalidation.clone());
            }
        });
        seen
    }

    async fn wait_for(seen: &Mutex<Vec<Invalidation>>, n: usize) {
        while seen.lock().unwrap().len() < n {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    #[tokio::test]
    async fn typed_replies() {
        let server = FakeServer::new();
        let client = builder(&server).connect().await.unwrap();

        let () = client.send(resp_array!["SET", "greeting", "hello"]).await.unwrap();
        let value: String = client.send(resp_array!["GET", "greeting"]).await.unwrap();
        assert_eq!(value, "hello");
        let missing: Option<String> = client.send(resp_array!["GET", "nope"]).await.unwrap();
        assert_eq!(missing, None);

        let _: i64 = client
            .send(resp_array!["HSET", "user:1", "active", "true", "name", "ada"])
            .await
            .unwrap();
        let active: bool = client
            .send(resp_array!["HGET", "user:1", "active"])
            .await
            .unwrap();
        assert!(active);
        let all: HashMap<String, String> = client
            .send(resp_array!["HGETALL", "user:1"])
            .await
            .unwrap();
        assert_eq!(all["name"], "ada");
    }

    #[tokio::test]
    async fn resp3_maps_convert_too() {
        let server = FakeServer::new();
        let client = builder(&server)
            .protocol(ProtocolVersion::Resp3)
            .connect()
            .await
            .unwrap();

        let _: i64 = client
            .send(resp_array!["HSET", "h", "a", "1"])
            .await
            .unwrap();
        let all: HashMap<String, i64> = client.send(resp_array!["HGETALL", "h"]).await.unwrap();
        assert_eq!(all["a"], 1);
        assert_eq!(count(&server, &["HELLO", "3"]), 1);
    }

    #[tokio::test]
    async fn server_errors_keep_code_and_message() {
        let server = FakeServer::new();
        let client = builder(&server).connect().await.unwrap();

        let () = client.send(resp_array!["SET", "k", "abc"]).await.unwrap();
        let err = client
            .send::<i64>(resp_array!["INCR", "k"])
            .await
            .unwrap_err();
        let remote = err.server_error().unwrap();
        assert_eq!(remote.code(), "ERR");
        assert_eq!(remote.message(), "value is not an integer or out of range");

        // The connection is still usable
        let value: String = client.send(resp_array!["GET", "k"]).await.unwrap();
        assert_eq!(value, "abc");
    }

    #[tokio::test]
    async fn slow_replies_time_out() {
        let server = FakeServer::new();
        let client = builder(&server).default_cache().connect().await.unwrap();
        assert_eq!(client.pool_status().unwrap().size, 1);

        let err = client
            .send_timeout::<RespValue>(resp_array!["HANG"], Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }

    #[tokio::test]
    async fn cache_hits_share_one_value() {
        let server = FakeServer::new();
        let client = builder(&server).cache(100).connect().await.unwrap();

        let () = client.send(resp_array!["SET", "k", "v"]).await.unwrap();
        let first = client.send_cached(resp_array!["GET", "k"]).await.unwrap();
        let second = client.send_cached(resp_array!["GET", "k"]).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*first, RespValue::BulkString(b"v".to_vec()));
        assert_eq!(count(&server, &["GET", "k"]), 1);
        assert_eq!(client.cached_entries(), 1);
    }

    #[tokio::test]
    async fn writes_elsewhere_invalidate_cached_reads() {
        let server = FakeServer::new();
        let client = builder(&server).cache(100).connect().await.unwrap();
        let seen = invalidations(&client);

        let () = client.send(resp_array!["MSET", "a", "1", "b", "2"]).await.unwrap();
        client.send_cached(resp_array!["GET", "a"]).await.unwrap();
        client.send_cached(resp_array!["GET", "b"]).await.unwrap();

        server.external_set("a", "10");
        wait_for(&seen, 1).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Invalidation::Keys(vec![b"a".to_vec()])]
        );
        assert_eq!(client.cached_entries(), 1);

        let a = client.send_cached(resp_array!["GET", "a"]).await.unwrap();
        assert_eq!(*a, RespValue::BulkString(b"10".to_vec()));

        server.external_flush();
        wait_for(&seen, 2).await;
        assert_eq!(seen.lock().unwrap()[1], Invalidation::Flush);
        assert_eq!(client.cached_entries(), 0);
    }

    #[tokio::test]
    async fn error_replies_are_not_cached() {
        let server = FakeServer::new();
        let client = builder(&server).cache(100).connect().await.unwrap();

        let _: i64 = client.send(resp_array!["HSET", "h", "f", "v"]).await.unwrap();
        let err = client
            .send_cached(resp_array!["GET", "h"])
            .await
            .unwrap_err();
        assert_eq!(err.server_error().map(|e| e.code()), Some("WRONGTYPE"));
        assert_eq!(client.cached_entries(), 0);
    }

    #[tokio::test]
    async fn without_cache_reads_go_to_the_server() {
        let server = FakeServer::new();
        let client = builder(&server).connect().await.unwrap();

        let first = client.send_cached(resp_array!["GET", "k"]).await.unwrap();
        let second = client.send_cached(resp_array!["GET", "k"]).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(count(&server, &["GET", "k"]), 2);
    }

    #[tokio::test]
    async fn cluster_client_routes_by_key() {
        let server = FakeServer::new();
        server.set_cluster(&[(0..=8191, 7000), (8192..=16383, 7001)]);
        let client = builder(&server)
            .cluster(vec![(HOST.to_string(), 7000)])
            .connect()
            .await
            .unwrap();

        let () = client
            .send(resp_array!["MSET", "{user}a", "1", "{user}b", "2"])
            .await
            .unwrap();
        let err = client
            .send::<()>(resp_array!["MSET", "foo", "1", "bar", "2"])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CrossSlot(_)));

        let () = client.send(resp_array!["SET", "foo", "1"]).await.unwrap();
        assert_eq!(server.node_log(7001).last().unwrap(), &vec!["SET", "foo", "1"]);
        assert!(client.acquire().await.is_err());
    }

    #[tokio::test]
    async fn sentinel_client_finds_the_master() {
        let server = FakeServer::new();
        server.set_sentinel_master(HOST, 6390);
        let client = builder(&server)
            .sentinel(vec![(HOST.to_string(), 26379)], "mymaster")
            .connect()
            .await
            .unwrap();

        let () = client.send(resp_array!["SET", "k", "v"]).await.unwrap();
        assert_eq!(server.node_log(6390).last().unwrap(), &vec!["SET", "k", "v"]);
    }

    #[tokio::test]
    async fn rotated_credentials_apply_to_new_connections() {
        let server = FakeServer::new();
        server.require_password("first");
        let client = builder(&server)
            .password("first")
            .pool_size(1)
            .connect()
            .await
            .unwrap();
        let pong: String = client.send(resp_array!["PING"]).await.unwrap();
        assert_eq!(pong, "PONG");

        server.require_password("second");
        client.set_credentials(Credentials::new(None::<&str>, "second"));
        server.kill_connections();

        // The pool replaces the dead connection, authenticating with the new password
        loop {
            match client.send::<String>(resp_array!["PING"]).await {
                Ok(pong) => {
                    assert_eq!(pong, "PONG");
                    break;
                }
                Err(e) if e.is_transient() => tokio::time::sleep(Duration::from_millis(1)).await,
                Err(e) => panic!("Unexpected error: {}", e),
            }
        }
        assert!(count(&server, &["AUTH", "second"]) >= 1);
    }

    #[tokio::test]
    async fn panicking_listener_does_not_stop_the_client() {
        let server = FakeServer::new();
        let client = builder(&server).cache(100).connect().await.unwrap();
        client.on_event(|event| {
            if let ClientEvent::Invalidated(_) = event {
                panic!("listener bug");
            }
        });
        let failures = Arc::new(Mutex::new(Vec::new()));
        let failures_c = failures.clone();
        client.on_event(move |event| {
            if let ClientEvent::CallbackFailed { message, .. } = event {
                failures_c.lock().unwrap().push(message.clone());
            }
        });
        let seen = invalidations(&client);

        client.send_cached(resp_array!["GET", "k"]).await.unwrap();
        server.external_set("k", "v");
        wait_for(&seen, 1).await;
        while failures.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(*failures.lock().unwrap(), vec!["listener bug".to_string()]);

        let value = client.send_cached(resp_array!["GET", "k"]).await.unwrap();
        assert_eq!(*value, RespValue::BulkString(b"v".to_vec()));
    }

    #[tokio::test]
    async fn pubsub_connection_is_shared() {
        let server = FakeServer::new();
        let client = builder(&server).connect().await.unwrap();

        let first = client.pubsub().await.unwrap();
        let accepted = server.accepted();
        let second = client.pubsub().await.unwrap();
        assert_eq!(server.accepted(), accepted);

        let mut a = first.subscribe("news").await.unwrap();
        let mut b = second.subscribe("news").await.unwrap();
        let receivers: i64 = client
            .send(resp_array!["PUBLISH", "news", "hi"])
            .await
            .unwrap();
        assert_eq!(receivers, 1);

        assert_eq!(a.next().await.unwrap().unwrap().payload, "hi".into());
        assert_eq!(b.next().await.unwrap().unwrap().payload, "hi".into());
    }
}
