/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! A bounded pool of paired connections to one node.
//!
//! Idle connections are reused newest first. When none is idle and the pool is at its size limit
//! callers queue in FIFO order, and a full queue is refused straight away.

use std::cmp;
use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use futures_channel::oneshot;
use futures_util::future::BoxFuture;

use crate::{
    error::{self, ConnectionReason},
    task,
};

use super::paired::PairedConnection;

const MIN_REAP_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections open at once, idle or borrowed
    pub max_size: usize,
    /// Callers allowed to wait for a connection
    pub max_waiting: usize,
    /// Idle connections older than this are closed
    pub idle_timeout: Duration,
    pub acquire_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_size: 8,
            max_waiting: 64,
            idle_timeout: Duration::from_secs(60),
            acquire_timeout: None,
        }
    }
}

/// Opens the connections of one pool
pub(crate) trait ConnectionFactory: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'_, Result<PairedConnection, error::Error>>;

    /// Whether an idle or returned connection may be handed out again
    fn is_valid(&self, connection: &PairedConnection) -> bool {
        connection.is_connected()
    }
}

/// What a waiting caller is given: a connection, or the right to open one
enum Grant {
    Connection(PairedConnection),
    Capacity,
}

struct PoolState {
    idle: VecDeque<(PairedConnection, Instant)>,
    /// Connections open, plus those being opened
    total: usize,
    waiters: VecDeque<oneshot::Sender<Grant>>,
    closed: bool,
}

impl PoolState {
    /// Offer `grant` to the oldest live waiter, returning it if nobody took it
    fn offer(&mut self, mut grant: Grant) -> Option<Grant> {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.send(grant) {
                Ok(()) => return None,
                Err(returned) => grant = returned,
            }
        }
        Some(grant)
    }

    fn free_capacity(&mut self) {
        if self.offer(Grant::Capacity).is_some() {
            self.total = self.total.saturating_sub(1);
        }
    }
}

struct PoolInner {
    name: String,
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, connection: PairedConnection) {
        let mut state = self.lock();
        if state.closed {
            state.total = state.total.saturating_sub(1);
            connection.close();
            return;
        }
        if !self.factory.is_valid(&connection) {
            log::debug!("Discarding unusable connection to {}", self.name);
            connection.close();
            state.free_capacity();
            return;
        }
        if let Some(Grant::Connection(connection)) = state.offer(Grant::Connection(connection)) {
            state.idle.push_back((connection, Instant::now()));
        }
    }

    fn release_grant(&self, grant: Grant) {
        match grant {
            Grant::Connection(connection) => self.release(connection),
            Grant::Capacity => self.lock().free_capacity(),
        }
    }

    /// Close idle connections past their time. Returns `false` once the pool is closed.
    fn reap(&self) -> bool {
        let mut state = self.lock();
        if state.closed {
            return false;
        }
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout;
        let (keep, expired): (VecDeque<_>, VecDeque<_>) =
            state.idle.drain(..).partition(|(connection, since)| {
                now.duration_since(*since) < idle_timeout && self.factory.is_valid(connection)
            });
        state.idle = keep;
        if !expired.is_empty() {
            log::debug!("Closing {} idle connections to {}", expired.len(), self.name);
        }
        for (connection, _) in expired {
            connection.close();
            state.free_capacity();
        }
        true
    }
}

/// Capacity reserved for a connection being opened, returned if opening fails
struct Capacity {
    pool: Option<Arc<PoolInner>>,
}

impl Capacity {
    fn disarm(mut self) {
        self.pool = None;
    }
}

impl Drop for Capacity {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.lock().free_capacity();
        }
    }
}

/// A queued caller. Anything granted after the caller gave up goes back to the pool.
struct Waiter {
    rx: oneshot::Receiver<Grant>,
    pool: Arc<PoolInner>,
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.rx.close();
        if let Ok(Some(grant)) = self.rx.try_recv() {
            self.pool.release_grant(grant);
        }
    }
}

enum Step {
    Ready(PairedConnection),
    Create(Capacity),
    Wait(Waiter),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Connections open, idle or borrowed
    pub size: usize,
    pub idle: usize,
    pub waiting: usize,
}

/// A pool of connections to a single node, cheap to clone
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.inner.name)
            .field("status", &self.status())
            .finish()
    }
}

impl Pool {
    pub(crate) fn new(
        name: impl Into<String>,
        config: PoolConfig,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        let inner = Arc::new(PoolInner {
            name: name.into(),
            config,
            factory,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                total: 0,
                waiters: VecDeque::new(),
                closed: false,
            }),
        });
        spawn_reaper(&inner);
        Pool { inner }
    }

    /// Borrow a connection, it goes back to the pool when the guard is dropped
    pub async fn acquire(&self) -> Result<PooledConnection, error::Error> {
        task::timeout(self.inner.config.acquire_timeout, self.acquire_inner()).await?
    }

    fn next_step(&self) -> Result<Step, error::Error> {
        let mut state = self.inner.lock();
        if state.closed {
            return Err(error::Error::Connection(ConnectionReason::NotConnected));
        }
        while let Some((connection, _)) = state.idle.pop_back() {
            if self.inner.factory.is_valid(&connection) {
                return Ok(Step::Ready(connection));
            }
            connection.close();
            state.total = state.total.saturating_sub(1);
        }
        if state.total < self.inner.config.max_size {
            state.total += 1;
            return Ok(Step::Create(Capacity {
                pool: Some(self.inner.clone()),
            }));
        }
        state.waiters.retain(|waiter| !waiter.is_canceled());
        if state.waiters.len() >= self.inner.config.max_waiting {
            return Err(error::Error::PoolExhausted);
        }
        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(tx);
        Ok(Step::Wait(Waiter {
            rx,
            pool: self.inner.clone(),
        }))
    }

    async fn acquire_inner(&self) -> Result<PooledConnection, error::Error> {
        match self.next_step()? {
            Step::Ready(connection) => Ok(self.wrap(connection)),
            Step::Create(capacity) => self.create(capacity).await,
            Step::Wait(mut waiter) => match (&mut waiter.rx).await {
                Ok(Grant::Connection(connection)) => Ok(self.wrap(connection)),
                Ok(Grant::Capacity) => {
                    let capacity = Capacity {
                        pool: Some(self.inner.clone()),
                    };
                    self.create(capacity).await
                }
                Err(oneshot::Canceled) => {
                    Err(error::Error::Connection(ConnectionReason::NotConnected))
                }
            },
        }
    }

    async fn create(&self, capacity: Capacity) -> Result<PooledConnection, error::Error> {
        let connection = self.inner.factory.connect().await?;
        capacity.disarm();
        log::debug!("Pool for {} opened a connection", self.inner.name);
        Ok(self.wrap(connection))
    }

    fn wrap(&self, connection: PairedConnection) -> PooledConnection {
        PooledConnection {
            connection,
            pool: self.inner.clone(),
        }
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.lock();
        PoolStatus {
            size: state.total,
            idle: state.idle.len(),
            waiting: state.waiters.iter().filter(|w| !w.is_canceled()).count(),
        }
    }

    /// Close idle connections and fail every waiter. Borrowed connections are closed as they
    /// come back.
    pub fn close(&self) {
        let mut state = self.inner.lock();
        state.closed = true;
        let idle: Vec<_> = state.idle.drain(..).collect();
        state.total = state.total.saturating_sub(idle.len());
        for (connection, _) in idle {
            connection.close();
        }
        state.waiters.clear();
    }
}

fn spawn_reaper(inner: &Arc<PoolInner>) {
    let weak: Weak<PoolInner> = Arc::downgrade(inner);
    let period = cmp::max(inner.config.idle_timeout / 2, MIN_REAP_INTERVAL);
    task::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            match weak.upgrade() {
                Some(inner) if inner.reap() => (),
                _ => return,
            }
        }
    });
}

/// A connection borrowed from a `Pool`
pub struct PooledConnection {
    connection: PairedConnection,
    pool: Arc<PoolInner>,
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("PooledConnection")
            .field(&self.connection)
            .finish()
    }
}

impl Deref for PooledConnection {
    type Target = PairedConnection;

    fn deref(&self) -> &PairedConnection {
        &self.connection
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.pool.release(self.connection.clone());
    }
}
