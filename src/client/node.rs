/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! One server as seen by a client: a pool of data connections and, when caching, the tracker
//! those connections redirect their invalidations to.

use std::fmt;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::error;

use super::{
    cache::{
        tracker::{Tracker, TrackerState},
        ClientCache,
    },
    paired::PairedConnection,
    pool::{ConnectionFactory, Pool, PoolConfig},
    session::{Session, Target},
};

pub(crate) struct NodeFactory {
    session: Arc<Session>,
    target: Target,
    tracker: Option<Tracker>,
    retry: bool,
}

impl NodeFactory {
    /// Whether invalidations for reads made on `connection` are being received
    fn is_tracked(&self, connection: &PairedConnection) -> bool {
        match self.tracker.as_ref().map(Tracker::state) {
            Some(TrackerState::Ready { epoch, .. }) => epoch != 0 && epoch == connection.epoch(),
            _ => false,
        }
    }
}

impl ConnectionFactory for NodeFactory {
    fn connect(&self) -> BoxFuture<'_, Result<PairedConnection, error::Error>> {
        Box::pin(async move {
            // Without a tracker the connection is still usable, just never cached from
            let tracking = match &self.tracker {
                Some(tracker) => tracker.wait_ready(self.session.connect_timeout()).await,
                None => None,
            };
            let endpoint = self.target.resolve(&self.session).await?;
            if self.retry {
                self.session.open_paired(&endpoint, tracking, None).await
            } else {
                self.session.open_paired_once(&endpoint, tracking).await
            }
        })
    }

    /// Connections redirecting to a previous tracker are replaced once a new one is ready
    fn is_valid(&self, connection: &PairedConnection) -> bool {
        if !connection.is_connected() {
            return false;
        }
        match self.tracker.as_ref().map(Tracker::state) {
            Some(TrackerState::Ready { epoch, .. }) => epoch == connection.epoch(),
            _ => true,
        }
    }
}

#[derive(Clone)]
pub(crate) struct Node {
    pub(crate) pool: Pool,
    factory: Arc<NodeFactory>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Node")
            .field("target", &self.factory.target)
            .field("pool", &self.pool)
            .finish()
    }
}

impl Node {
    /// `retry` applies the session's backoff to each new connection, otherwise one attempt is
    /// made and the failure is left to the caller
    pub(crate) fn new(
        session: Arc<Session>,
        target: Target,
        pool_config: PoolConfig,
        cache: Option<Arc<ClientCache>>,
        retry: bool,
    ) -> Self {
        let tracker = cache.map(|cache| Tracker::spawn(session.clone(), target.clone(), cache));
        let name = format!("{:?}", target);
        let factory = Arc::new(NodeFactory {
            session,
            target,
            tracker,
            retry,
        });
        let pool = Pool::new(name, pool_config, factory.clone());
        Node { pool, factory }
    }

    pub(crate) fn is_tracked(&self, connection: &PairedConnection) -> bool {
        self.factory.is_tracked(connection)
    }

    pub(crate) fn close(&self) {
        self.pool.close();
    }
}
