/*
 * Copyright 2020-2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::{error, events::Events, protocol::ProtocolVersion, reconnect::Backoff};

use super::{
    cache::DEFAULT_MAX_ENTRIES,
    cluster::DEFAULT_MAX_REDIRECTS,
    connect::{Connector, Endpoint, TcpConnector},
    managed::{Client, ClientConfig, Topology},
    paired::PairedConnection,
    pool::PoolConfig,
    pubsub::PubsubConnection,
    session::{Credentials, CredentialsProvider, Session, SessionConfig, Target},
    sentinel::SentinelDiscovery,
};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_MAX_IN_FLIGHT: usize = 10_000;

enum Mode {
    Standalone,
    Sentinel {
        sentinels: Vec<Endpoint>,
        master_name: String,
        credentials: Option<Credentials>,
    },
    Cluster(Vec<Endpoint>),
}

/// Connection builder
pub struct ConnectionBuilder {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) username: Option<Arc<str>>,
    pub(crate) password: Option<Arc<str>>,
    provider: Option<Arc<dyn CredentialsProvider>>,
    connector: Option<Arc<dyn Connector>>,
    #[cfg(feature = "tls")]
    tls: bool,
    protocol: ProtocolVersion,
    database: u32,
    client_name: Option<Arc<str>>,
    pool: PoolConfig,
    backoff: Backoff,
    connect_timeout: Option<Duration>,
    max_in_flight: usize,
    max_redirects: usize,
    cache_entries: Option<usize>,
    mode: Mode,
}

impl fmt::Debug for ConnectionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ConnectionBuilder")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("protocol", &self.protocol)
            .field("database", &self.database)
            .field("pool", &self.pool)
            .finish()
    }
}

impl ConnectionBuilder {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, error::Error> {
        let host = host.into();
        if host.is_empty() {
            return Err(error::internal("Host must not be empty"));
        }
        Ok(Self {
            host,
            port,
            username: None,
            password: None,
            provider: None,
            connector: None,
            #[cfg(feature = "tls")]
            tls: false,
            protocol: ProtocolVersion::default(),
            database: 0,
            client_name: None,
            pool: PoolConfig::default(),
            backoff: Backoff::default(),
            connect_timeout: Some(DEFAULT_CONNECT_TIMEOUT),
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            cache_entries: None,
            mode: Mode::Standalone,
        })
    }

    /// Set the password used when connecting
    pub fn password<V: Into<Arc<str>>>(&mut self, password: V) -> &mut Self {
        self.password = Some(password.into());
        self
    }

    /// Set the username used when connecting
    pub fn username<V: Into<Arc<str>>>(&mut self, username: V) -> &mut Self {
        self.username = Some(username.into());
        self
    }

    /// Fetch credentials from `provider` before each connection authenticates, in place of a
    /// fixed username and password
    pub fn credentials_provider<P: CredentialsProvider>(&mut self, provider: P) -> &mut Self {
        self.provider = Some(Arc::new(provider));
        self
    }

    /// Open streams with `connector` instead of plain TCP
    pub fn connector(&mut self, connector: Arc<dyn Connector>) -> &mut Self {
        self.connector = Some(connector);
        self
    }

    /// Wrap connections in TLS
    #[cfg(feature = "tls")]
    pub fn tls(&mut self) -> &mut Self {
        self.tls = true;
        self
    }

    pub fn protocol(&mut self, protocol: ProtocolVersion) -> &mut Self {
        self.protocol = protocol;
        self
    }

    /// Database selected on every new connection
    pub fn database(&mut self, database: u32) -> &mut Self {
        self.database = database;
        self
    }

    /// Name reported by `CLIENT LIST`
    pub fn client_name<V: Into<Arc<str>>>(&mut self, name: V) -> &mut Self {
        self.client_name = Some(name.into());
        self
    }

    pub fn pool(&mut self, pool: PoolConfig) -> &mut Self {
        self.pool = pool;
        self
    }

    /// Maximum number of connections per server
    pub fn pool_size(&mut self, max_size: usize) -> &mut Self {
        self.pool.max_size = max_size;
        self
    }

    pub fn backoff(&mut self, backoff: Backoff) -> &mut Self {
        self.backoff = backoff;
        self
    }

    /// Time allowed to open and authenticate one connection, `None` waits forever
    pub fn connect_timeout(&mut self, timeout: Option<Duration>) -> &mut Self {
        self.connect_timeout = timeout;
        self
    }

    /// Commands awaiting a reply on one connection before further sends are refused with
    /// `Error::Backpressure`
    pub fn max_in_flight(&mut self, max_in_flight: usize) -> &mut Self {
        self.max_in_flight = max_in_flight;
        self
    }

    /// Redirections followed for one cluster command before giving up
    pub fn max_redirects(&mut self, max_redirects: usize) -> &mut Self {
        self.max_redirects = max_redirects;
        self
    }

    /// Keep up to `max_entries` replies of `Client::send_cached` in memory, invalidated by the
    /// server as the keys they read change
    pub fn cache(&mut self, max_entries: usize) -> &mut Self {
        self.cache_entries = Some(max_entries);
        self
    }

    /// As `cache` with the default capacity
    pub fn default_cache(&mut self) -> &mut Self {
        self.cache(DEFAULT_MAX_ENTRIES)
    }

    /// Connect to the master named `master_name` as reported by `sentinels`, tried in order.
    /// The builder's host and port are not used.
    pub fn sentinel<I, H>(&mut self, sentinels: I, master_name: impl Into<String>) -> &mut Self
    where
        I: IntoIterator<Item = (H, u16)>,
        H: Into<Arc<str>>,
    {
        self.mode = Mode::Sentinel {
            sentinels: sentinels
                .into_iter()
                .map(|(host, port)| Endpoint::new(host, port))
                .collect(),
            master_name: master_name.into(),
            credentials: None,
        };
        self
    }

    /// Credentials for the sentinels themselves, when they differ from the master's
    pub fn sentinel_credentials(&mut self, credentials: Credentials) -> &mut Self {
        if let Mode::Sentinel {
            credentials: sentinel_credentials,
            ..
        } = &mut self.mode
        {
            *sentinel_credentials = Some(credentials);
        }
        self
    }

    /// Treat the server as one node of a cluster, with `seeds` as further nodes to learn the
    /// slot map from
    pub fn cluster<I, H>(&mut self, seeds: I) -> &mut Self
    where
        I: IntoIterator<Item = (H, u16)>,
        H: Into<Arc<str>>,
    {
        self.mode = Mode::Cluster(
            seeds
                .into_iter()
                .map(|(host, port)| Endpoint::new(host, port))
                .collect(),
        );
        self
    }

    fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.as_str(), self.port)
    }

    fn session(&self) -> Arc<Session> {
        let connector = match &self.connector {
            Some(connector) => connector.clone(),
            None => Arc::new(self.tcp_connector()),
        };
        let credentials = self
            .password
            .as_ref()
            .map(|password| Credentials::new(self.username.as_deref(), password.as_ref()));
        Arc::new(Session::new(SessionConfig {
            connector,
            credentials,
            provider: self.provider.clone(),
            backoff: self.backoff.clone(),
            protocol: self.protocol,
            database: self.database,
            client_name: self.client_name.clone(),
            connect_timeout: self.connect_timeout,
            max_in_flight: self.max_in_flight,
            events: Events::default(),
        }))
    }

    #[cfg(feature = "tls")]
    fn tcp_connector(&self) -> TcpConnector {
        if self.tls {
            TcpConnector::with_tls()
        } else {
            TcpConnector::new()
        }
    }

    #[cfg(not(feature = "tls"))]
    fn tcp_connector(&self) -> TcpConnector {
        TcpConnector::new()
    }

    /// Where single connections go: the builder's address or the master behind Sentinel
    fn target(&self) -> Result<Target, error::Error> {
        match &self.mode {
            Mode::Standalone => Ok(Target::Direct(self.endpoint())),
            Mode::Sentinel {
                sentinels,
                master_name,
                credentials,
            } => Ok(Target::Sentinel(Arc::new(SentinelDiscovery::new(
                sentinels.clone(),
                master_name.clone(),
                credentials.clone(),
            )))),
            Mode::Cluster(_) => Err(error::internal(
                "A single connection cannot serve a cluster, use `connect`",
            )),
        }
    }

    /// Connect a pooled `Client`
    pub async fn connect(&self) -> Result<Client, error::Error> {
        let topology = match &self.mode {
            Mode::Standalone => Topology::Standalone(self.endpoint()),
            Mode::Sentinel {
                sentinels,
                master_name,
                credentials,
            } => Topology::Sentinel {
                sentinels: sentinels.clone(),
                master_name: master_name.clone(),
                credentials: credentials.clone(),
            },
            Mode::Cluster(seeds) => {
                let first = self.endpoint();
                let mut all: Vec<Endpoint> =
                    seeds.iter().filter(|seed| **seed != first).cloned().collect();
                all.insert(0, first);
                Topology::Cluster(all)
            }
        };
        Client::connect(
            self.session(),
            ClientConfig {
                topology,
                pool: self.pool.clone(),
                cache_entries: self.cache_entries,
                max_redirects: self.max_redirects,
            },
        )
        .await
    }

    /// Connect one `PairedConnection`
    pub async fn paired_connect(&self) -> Result<PairedConnection, error::Error> {
        let target = self.target()?;
        let session = self.session();
        let endpoint = target.resolve(&session).await?;
        session.open_paired(&endpoint, None, None).await
    }

    /// Connect a `PubsubConnection`
    pub async fn pubsub_connect(&self) -> Result<PubsubConnection, error::Error> {
        let target = self.target()?;
        let session = self.session();
        let endpoint = target.resolve(&session).await?;
        PubsubConnection::connect(session, endpoint).await
    }
}

/// Connect a `PairedConnection` to the server at `host:port` with default settings
pub async fn paired_connect(
    host: impl Into<String>,
    port: u16,
) -> Result<PairedConnection, error::Error> {
    ConnectionBuilder::new(host, port)?.paired_connect().await
}

/// Connect a `PubsubConnection` to the server at `host:port` with default settings
pub async fn pubsub_connect(
    host: impl Into<String>,
    port: u16,
) -> Result<PubsubConnection, error::Error> {
    ConnectionBuilder::new(host, port)?.pubsub_connect().await
}
