/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Routing commands across a sharded deployment.
//!
//! The slot map is fetched with `CLUSTER SLOTS` from any reachable node. A `MOVED` redirect
//! reassigns that one slot and the command is retried, an `ASK` redirect sends the command once
//! more, preceded by `ASKING`, to the importing node without touching the map. A node that cannot
//! be reached is suspected and the whole map is fetched again.

pub(crate) mod slots;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crate::{
    error::{self, Error},
    events::ClientEvent,
    protocol::{command, RespValue},
};

use self::slots::{hash_slot, Redirect, SlotMap};

use super::{
    cache::ClientCache,
    connect::{roundtrip, Endpoint},
    node::Node,
    pool::PoolConfig,
    session::{Session, Target},
};

pub(crate) const DEFAULT_MAX_REDIRECTS: usize = 5;

pub(crate) struct ClusterConfig {
    pub(crate) seeds: Vec<Endpoint>,
    pub(crate) pool: PoolConfig,
    pub(crate) max_redirects: usize,
    pub(crate) cache: Option<Arc<ClientCache>>,
}

pub(crate) struct Cluster {
    session: Arc<Session>,
    config: ClusterConfig,
    slots: RwLock<SlotMap>,
    nodes: Mutex<HashMap<Endpoint, Node>>,
    suspects: Mutex<HashSet<Endpoint>>,
    needs_refresh: AtomicBool,
    /// Completed refreshes, so callers queued behind one refresh do not repeat it
    generation: AtomicU64,
    refresh_lock: tokio::sync::Mutex<()>,
}

/// Where the next attempt of a command goes
enum Hop {
    Slot,
    Moved(Endpoint),
    Ask(Endpoint),
}

impl Cluster {
    /// Fetch the slot map from the seeds, failing if none can provide a complete one
    pub(crate) async fn connect(
        session: Arc<Session>,
        config: ClusterConfig,
    ) -> Result<Self, Error> {
        if config.seeds.is_empty() {
            return Err(error::internal("A cluster needs at least one seed node"));
        }
        let cluster = Cluster {
            session,
            config,
            slots: RwLock::new(SlotMap::default()),
            nodes: Mutex::new(HashMap::new()),
            suspects: Mutex::new(HashSet::new()),
            needs_refresh: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            refresh_lock: tokio::sync::Mutex::new(()),
        };
        cluster.refresh().await?;
        Ok(cluster)
    }

    fn nodes(&self) -> MutexGuard<'_, HashMap<Endpoint, Node>> {
        self.nodes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn suspects(&self) -> MutexGuard<'_, HashSet<Endpoint>> {
        self.suspects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn node_for_slot(&self, slot: u16) -> Option<Endpoint> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .node_for(slot)
            .cloned()
    }

    /// Some node of the cluster, for commands that are not tied to a slot
    pub(crate) fn any_node(&self) -> Option<Endpoint> {
        let suspects = self.suspects();
        let nodes = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .nodes();
        nodes
            .iter()
            .find(|node| !suspects.contains(*node))
            .or_else(|| nodes.first())
            .cloned()
    }

    fn node(&self, endpoint: &Endpoint) -> Node {
        self.nodes()
            .entry(endpoint.clone())
            .or_insert_with(|| {
                Node::new(
                    self.session.clone(),
                    Target::Direct(endpoint.clone()),
                    self.config.pool.clone(),
                    self.config.cache.clone(),
                    false,
                )
            })
            .clone()
    }

    fn suspect(&self, endpoint: &Endpoint) {
        log::warn!("Cluster node {} is suspected to be down", endpoint);
        self.suspects().insert(endpoint.clone());
        self.needs_refresh.store(true, Ordering::SeqCst);
    }

    /// Nodes to ask for the slot map: healthy known nodes, then the seeds, then suspects
    fn refresh_candidates(&self) -> Vec<Endpoint> {
        let suspects = self.suspects().clone();
        let known = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .nodes();
        let mut candidates: Vec<Endpoint> = Vec::new();
        let healthy = known.iter().filter(|node| !suspects.contains(*node));
        for node in healthy.chain(&self.config.seeds).chain(&known) {
            if !candidates.contains(node) {
                candidates.push(node.clone());
            }
        }
        let (mut first, last): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|node| !suspects.contains(node));
        first.extend(last);
        first
    }

    async fn fetch_slots(&self, endpoint: &Endpoint) -> Result<SlotMap, Error> {
        let mut connection = self.session.open_raw(endpoint, None).await?;
        let reply = roundtrip(&mut connection, resp_array!["CLUSTER", "SLOTS"]).await?;
        SlotMap::from_cluster_slots(reply, endpoint)
    }

    /// Replace the slot map with a fresh one. Concurrent callers share a single refresh.
    pub(crate) async fn refresh(&self) -> Result<(), Error> {
        let generation = self.generation.load(Ordering::SeqCst);
        let _guard = self.refresh_lock.lock().await;
        if self.generation.load(Ordering::SeqCst) != generation {
            return Ok(());
        }

        for candidate in self.refresh_candidates() {
            match self.fetch_slots(&candidate).await {
                Ok(map) => {
                    self.install(map);
                    return Ok(());
                }
                Err(e) => log::warn!("Cannot fetch slot map from {}: {}", candidate, e),
            }
        }
        Err(Error::Cluster(
            "No cluster node could provide the slot map".to_string(),
        ))
    }

    fn install(&self, map: SlotMap) {
        let live: HashSet<Endpoint> = map.nodes().into_iter().collect();
        let count = live.len();
        *self.slots.write().unwrap_or_else(PoisonError::into_inner) = map;

        let stale: Vec<Node> = {
            let mut nodes = self.nodes();
            let gone: Vec<Endpoint> = nodes
                .keys()
                .filter(|endpoint| !live.contains(*endpoint))
                .cloned()
                .collect();
            gone.iter().filter_map(|e| nodes.remove(e)).collect()
        };
        for node in stale {
            node.close();
        }

        self.suspects().clear();
        self.needs_refresh.store(false, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        log::info!("Cluster slot map refreshed, {} nodes", count);
        self.session
            .events
            .emit(ClientEvent::TopologyRefreshed { nodes: count });
    }

    /// The slot every key of `msg` hashes to. Keyless commands have none.
    pub(crate) fn slot_for(msg: &RespValue) -> Result<Option<u16>, Error> {
        let slots: BTreeSet<u16> = command::keys(msg).into_iter().map(hash_slot).collect();
        match slots.len() {
            0 => Ok(None),
            1 => Ok(slots.into_iter().next()),
            _ => Err(Error::CrossSlot(slots.into_iter().collect())),
        }
    }

    fn route(&self, slot: Option<u16>) -> Result<Endpoint, Error> {
        let endpoint = match slot {
            Some(slot) => self.node_for_slot(slot),
            None => self.any_node(),
        };
        endpoint.ok_or_else(|| Error::Cluster("The slot map is empty".to_string()))
    }

    /// Send `msg` to the node owning its slot, following redirects. Returns the reply, and
    /// whether the connection that served it had invalidation tracking in place.
    pub(crate) async fn send(&self, msg: RespValue) -> Result<(RespValue, bool), Error> {
        let slot = Cluster::slot_for(&msg)?;
        let mut hop = Hop::Slot;
        let mut redirects = 0;
        let mut failures = 0;

        loop {
            if self.needs_refresh.load(Ordering::SeqCst) {
                if let Err(e) = self.refresh().await {
                    log::warn!("Slot map refresh failed: {}", e);
                }
            }

            let (endpoint, asking) = match hop {
                Hop::Slot => (self.route(slot)?, false),
                Hop::Moved(endpoint) => (endpoint, false),
                Hop::Ask(endpoint) => (endpoint, true),
            };
            let node = self.node(&endpoint);

            let connection = match node.pool.acquire().await {
                Ok(connection) => connection,
                Err(e) if e.is_transient() => {
                    self.suspect(&endpoint);
                    failures += 1;
                    if failures > self.config.max_redirects {
                        return Err(Error::Cluster(format!(
                            "Cannot reach a node for the command, last tried {}",
                            endpoint
                        )));
                    }
                    self.refresh().await?;
                    hop = Hop::Slot;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let reply = if asking {
                connection.send_asking(msg.clone()).await
            } else {
                connection.send_raw(msg.clone()).await
            };
            let reply = match reply {
                Ok(reply) => reply,
                Err(e) => {
                    if e.is_transient() {
                        self.suspect(&endpoint);
                    }
                    return Err(e);
                }
            };

            let redirect = match Redirect::parse(&reply, &endpoint) {
                Some(redirect) => redirect,
                None => {
                    let tracked = node.is_tracked(&connection);
                    return Ok((reply, tracked));
                }
            };
            redirects += 1;
            if redirects > self.config.max_redirects {
                return Err(Error::Redirect(format!(
                    "Gave up after {} redirects, last was {:?}",
                    self.config.max_redirects, redirect
                )));
            }
            log::debug!("Following {:?}", redirect);
            hop = match redirect {
                Redirect::Moved { slot, endpoint } => {
                    self.slots
                        .write()
                        .unwrap_or_else(PoisonError::into_inner)
                        .update_slot(slot, endpoint.clone());
                    Hop::Moved(endpoint)
                }
                Redirect::Ask { endpoint, .. } => Hop::Ask(endpoint),
            };
        }
    }

    pub(crate) fn close(&self) {
        for (_, node) in self.nodes().drain() {
            node.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use crate::{
        client::{connect::Endpoint, pool::PoolConfig, session::tests::session_for},
        error::Error,
        events::ClientEvent,
        protocol::RespValue,
        reconnect::Backoff,
        test_support::{FakeServer, HOST},
    };

    use super::{Cluster, ClusterConfig, DEFAULT_MAX_REDIRECTS};

    const FOO: u16 = 12182;
    const BAR: u16 = 5061;

    fn two_nodes() -> FakeServer {
        let server = FakeServer::new();
        server.set_cluster(&[(0..=8191, 7000), (8192..=16383, 7001)]);
        server
    }

    async fn cluster(server: &FakeServer) -> Cluster {
        let cluster = Cluster::connect(
            Arc::new(session_for(server)),
            ClusterConfig {
                seeds: vec![Endpoint::new(HOST, 7000)],
                pool: PoolConfig::default(),
                max_redirects: DEFAULT_MAX_REDIRECTS,
                cache: None,
            },
        )
        .await
        .unwrap();
        server.clear_log();
        cluster
    }

    async fn send(cluster: &Cluster, msg: RespValue) -> Result<RespValue, Error> {
        cluster.send(msg).await.map(|(reply, _)| reply)
    }

    #[tokio::test]
    async fn commands_go_to_the_slot_owner() {
        let server = two_nodes();
        let cluster = cluster(&server).await;

        send(&cluster, resp_array!["SET", "foo", "1"]).await.unwrap();
        send(&cluster, resp_array!["SET", "bar", "2"]).await.unwrap();

        assert_eq!(server.node_log(7001), vec![vec!["SET", "foo", "1"]]);
        assert_eq!(server.node_log(7000), vec![vec!["SET", "bar", "2"]]);
    }

    #[tokio::test]
    async fn moved_reassigns_only_that_slot() {
        let server = two_nodes();
        let cluster = cluster(&server).await;
        server.set_slot_owner(FOO, 7000);

        let reply = send(&cluster, resp_array!["GET", "foo"]).await.unwrap();
        assert_eq!(reply, RespValue::Nil);

        let node = |port| Some(Endpoint::new(HOST, port));
        assert_eq!(cluster.node_for_slot(FOO), node(7000));
        assert_eq!(cluster.node_for_slot(FOO + 1), node(7001));
        assert_eq!(cluster.node_for_slot(FOO - 1), node(7001));
        assert_eq!(cluster.node_for_slot(BAR), node(7000));
        assert_eq!(server.node_log(7001), vec![vec!["GET", "foo"]]);
        assert_eq!(server.node_log(7000), vec![vec!["GET", "foo"]]);
    }

    #[tokio::test]
    async fn moved_without_host_goes_to_the_same_host() {
        let server = two_nodes();
        let cluster = cluster(&server).await;
        server.set_hostless_redirects(true);
        server.set_slot_owner(FOO, 7000);

        let reply = send(&cluster, resp_array!["GET", "foo"]).await.unwrap();
        assert_eq!(reply, RespValue::Nil);
        assert_eq!(cluster.node_for_slot(FOO), Some(Endpoint::new(HOST, 7000)));
        assert_eq!(server.node_log(7000), vec![vec!["GET", "foo"]]);
    }

    #[tokio::test]
    async fn ask_is_followed_without_touching_the_map() {
        let server = two_nodes();
        let cluster = cluster(&server).await;
        server.migrate(FOO, 7000);

        let reply = send(&cluster, resp_array!["GET", "foo"]).await.unwrap();
        assert_eq!(reply, RespValue::Nil);

        assert_eq!(cluster.node_for_slot(FOO), Some(Endpoint::new(HOST, 7001)));
        assert_eq!(
            server.node_log(7000),
            vec![vec!["ASKING"], vec!["GET", "foo"]]
        );
    }

    #[tokio::test]
    async fn keys_in_different_slots_are_refused_locally() {
        let server = two_nodes();
        let cluster = cluster(&server).await;

        let err = send(&cluster, resp_array!["MSET", "foo", "1", "bar", "2"])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CrossSlot(ref slots) if *slots == vec![BAR, FOO]));
        assert!(server.command_log().is_empty());

        let reply = send(&cluster, resp_array!["MSET", "{user}a", "1", "{user}b", "2"])
            .await
            .unwrap();
        assert_eq!(reply, RespValue::SimpleString("OK".into()));
    }

    #[tokio::test]
    async fn redirects_are_bounded() {
        let server = two_nodes();
        let cluster = cluster(&server).await;
        // The owner keeps asking the client to come back to itself
        server.migrate(FOO, 7001);

        let err = send(&cluster, resp_array!["GET", "foo"]).await.unwrap_err();
        assert!(matches!(err, Error::Redirect(_)));
    }

    #[tokio::test]
    async fn unreachable_node_forces_a_refresh() {
        let server = two_nodes();
        let cluster = cluster(&server).await;
        let refreshes = Arc::new(Mutex::new(Vec::new()));
        let refreshes_c = refreshes.clone();
        cluster.session.events.subscribe(move |event| {
            if let ClientEvent::TopologyRefreshed { nodes } = event {
                refreshes_c.lock().unwrap().push(*nodes);
            }
        });

        // 7001 fails over to 7000
        server.set_down(7001, true);
        server.set_cluster(&[(0..=16383, 7000)]);

        send(&cluster, resp_array!["SET", "foo", "1"]).await.unwrap();
        assert_eq!(cluster.node_for_slot(FOO), Some(Endpoint::new(HOST, 7000)));
        assert_eq!(*refreshes.lock().unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn dead_node_is_bypassed_without_waiting_for_backoff() {
        let server = two_nodes();
        let mut session = session_for(&server);
        session.backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(10), 10);
        let cluster = Cluster::connect(
            Arc::new(session),
            ClusterConfig {
                seeds: vec![Endpoint::new(HOST, 7000)],
                pool: PoolConfig::default(),
                max_redirects: DEFAULT_MAX_REDIRECTS,
                cache: None,
            },
        )
        .await
        .unwrap();

        server.set_down(7001, true);
        server.set_cluster(&[(0..=16383, 7000)]);

        let reply = tokio::time::timeout(
            Duration::from_millis(500),
            send(&cluster, resp_array!["SET", "foo", "1"]),
        )
        .await
        .expect("a dead node must not be retried with the session backoff")
        .unwrap();
        assert_eq!(reply, RespValue::SimpleString("OK".into()));
        assert_eq!(cluster.node_for_slot(FOO), Some(Endpoint::new(HOST, 7000)));
    }

    #[tokio::test]
    async fn nothing_reachable_is_a_cluster_error() {
        let server = two_nodes();
        let cluster = cluster(&server).await;
        server.set_down(7000, true);
        server.set_down(7001, true);

        let err = send(&cluster, resp_array!["GET", "foo"]).await.unwrap_err();
        assert!(matches!(err, Error::Cluster(_)));
    }

    #[tokio::test]
    async fn incomplete_slot_map_is_refused() {
        let server = FakeServer::new();
        server.set_cluster(&[(0..=100, 7000)]);
        let result = Cluster::connect(
            Arc::new(session_for(&server)),
            ClusterConfig {
                seeds: vec![Endpoint::new(HOST, 7000)],
                pool: PoolConfig::default(),
                max_redirects: DEFAULT_MAX_REDIRECTS,
                cache: None,
            },
        )
        .await;
        assert!(matches!(result, Err(Error::Cluster(_))));
    }
}
