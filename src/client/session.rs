/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Opening connections: transport, identity (authentication, name, database, tracking) and
//! the retry policy around both.

use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures_channel::mpsc;
use futures_util::future::BoxFuture;

use crate::{
    error,
    events::Events,
    protocol::{ProtocolVersion, RespValue},
    reconnect::{reconnect, Backoff},
    task,
};

use super::{
    connect::{framed, Connector, Endpoint, Handshake, RespConnection},
    paired::{PairedConnection, PairedOptions},
    sentinel::SentinelDiscovery,
};

/// A username (optional, `default` is implied) and password
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: Option<Arc<str>>,
    password: Arc<str>,
}

impl Credentials {
    pub fn new<U, P>(username: Option<U>, password: P) -> Self
    where
        U: Into<Arc<str>>,
        P: Into<Arc<str>>,
    {
        Credentials {
            username: username.map(Into::into),
            password: password.into(),
        }
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

pub type ProviderError = Box<dyn StdError + Send + Sync>;

/// A source of credentials consulted before each new connection authenticates, e.g. to fetch
/// short-lived tokens. Any function returning a future of `Result<Credentials, _>` is one.
pub trait CredentialsProvider: Send + Sync + 'static {
    fn credentials(&self) -> BoxFuture<'_, Result<Credentials, ProviderError>>;
}

impl<F, Fut> CredentialsProvider for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Credentials, ProviderError>> + Send + 'static,
{
    fn credentials(&self) -> BoxFuture<'_, Result<Credentials, ProviderError>> {
        Box::pin(self())
    }
}

/// Where connections go: a fixed address or the current master according to Sentinel
#[derive(Clone)]
pub(crate) enum Target {
    Direct(Endpoint),
    Sentinel(Arc<SentinelDiscovery>),
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Target::Direct(endpoint) => write!(f, "Direct({})", endpoint),
            Target::Sentinel(discovery) => write!(f, "Sentinel({})", discovery.master_name()),
        }
    }
}

impl Target {
    pub(crate) async fn resolve(&self, session: &Session) -> Result<Endpoint, error::Error> {
        match self {
            Target::Direct(endpoint) => Ok(endpoint.clone()),
            Target::Sentinel(discovery) => discovery.discover(session).await,
        }
    }
}

/// Connection settings shared by every connection a client opens
pub(crate) struct Session {
    connector: Arc<dyn Connector>,
    credentials: RwLock<Option<Credentials>>,
    provider: Option<Arc<dyn CredentialsProvider>>,
    pub(crate) backoff: Backoff,
    protocol: ProtocolVersion,
    database: u32,
    client_name: Option<Arc<str>>,
    connect_timeout: Option<Duration>,
    max_in_flight: usize,
    pub(crate) events: Events,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Session")
            .field("protocol", &self.protocol)
            .field("database", &self.database)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

pub(crate) struct SessionConfig {
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) credentials: Option<Credentials>,
    pub(crate) provider: Option<Arc<dyn CredentialsProvider>>,
    pub(crate) backoff: Backoff,
    pub(crate) protocol: ProtocolVersion,
    pub(crate) database: u32,
    pub(crate) client_name: Option<Arc<str>>,
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) max_in_flight: usize,
    pub(crate) events: Events,
}

impl Session {
    pub(crate) fn new(config: SessionConfig) -> Self {
        Session {
            connector: config.connector,
            credentials: RwLock::new(config.credentials),
            provider: config.provider,
            backoff: config.backoff,
            protocol: config.protocol,
            database: config.database,
            client_name: config.client_name,
            connect_timeout: config.connect_timeout,
            max_in_flight: config.max_in_flight,
            events: config.events,
        }
    }

    pub(crate) fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    pub(crate) fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    /// Replace the credentials used by connections opened from now on. Established connections
    /// keep the identity they authenticated with.
    pub(crate) fn set_credentials(&self, credentials: Credentials) {
        *self
            .credentials
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(credentials);
    }

    pub(crate) fn credentials(&self) -> Option<Credentials> {
        self.credentials
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The credentials for the next connection, asking the provider if there is one. A provider
    /// failure is returned as is, wrapped only in `Error::CredentialProvider`.
    async fn next_credentials(&self) -> Result<Option<Credentials>, error::Error> {
        if let Some(provider) = &self.provider {
            let credentials = provider
                .credentials()
                .await
                .map_err(error::Error::CredentialProvider)?;
            self.set_credentials(credentials);
        }
        Ok(self.credentials())
    }

    /// Open and handshake an unpaired connection, once
    pub(crate) async fn open_raw(
        &self,
        endpoint: &Endpoint,
        tracking_redirect: Option<i64>,
    ) -> Result<RespConnection, error::Error> {
        let handshake = Handshake {
            protocol: self.protocol,
            credentials: self.next_credentials().await?,
            client_name: self.client_name.clone(),
            database: self.database,
            tracking_redirect,
        };
        task::timeout(self.connect_timeout, async {
            let stream = self.connector.connect(endpoint).await?;
            let mut connection = framed(stream);
            handshake.perform(&mut connection).await?;
            log::debug!("Connected to {}", endpoint);
            Ok::<_, error::Error>(connection)
        })
        .await?
    }

    /// Open an unpaired connection with the backoff policy applied
    pub(crate) async fn open_raw_with_retry(
        &self,
        endpoint: &Endpoint,
    ) -> Result<RespConnection, error::Error> {
        reconnect(&self.backoff, &self.events, &endpoint.to_string(), || {
            self.open_raw(endpoint, None)
        })
        .await
    }

    /// Open a paired connection with the backoff policy applied
    pub(crate) async fn open_paired(
        &self,
        endpoint: &Endpoint,
        tracking: Option<(i64, u64)>,
        push_tx: Option<mpsc::UnboundedSender<RespValue>>,
    ) -> Result<PairedConnection, error::Error> {
        let connection = reconnect(&self.backoff, &self.events, &endpoint.to_string(), || {
            self.open_raw(endpoint, tracking.map(|(id, _)| id))
        })
        .await?;
        Ok(self.pair(connection, endpoint, tracking, push_tx))
    }

    /// Open a paired connection in a single attempt, bounded by the connect timeout
    pub(crate) async fn open_paired_once(
        &self,
        endpoint: &Endpoint,
        tracking: Option<(i64, u64)>,
    ) -> Result<PairedConnection, error::Error> {
        let connection = self
            .open_raw(endpoint, tracking.map(|(id, _)| id))
            .await?;
        Ok(self.pair(connection, endpoint, tracking, None))
    }

    fn pair(
        &self,
        connection: RespConnection,
        endpoint: &Endpoint,
        tracking: Option<(i64, u64)>,
        push_tx: Option<mpsc::UnboundedSender<RespValue>>,
    ) -> PairedConnection {
        PairedConnection::new(
            connection,
            PairedOptions {
                address: endpoint.to_string().into(),
                max_in_flight: self.max_in_flight,
                epoch: tracking.map(|(_, epoch)| epoch).unwrap_or(0),
                push_tx,
                events: self.events.clone(),
            },
        )
    }

    /// Connect to the sentinel at `endpoint`, which may have its own credentials
    pub(crate) async fn open_sentinel(
        &self,
        endpoint: &Endpoint,
        credentials: Option<Credentials>,
        timeout: Duration,
    ) -> Result<RespConnection, error::Error> {
        let handshake = Handshake {
            credentials,
            ..Handshake::default()
        };
        task::timeout(Some(timeout), async {
            let stream = self.connector.connect(endpoint).await?;
            let mut connection = framed(stream);
            handshake.perform(&mut connection).await?;
            Ok::<_, error::Error>(connection)
        })
        .await?
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use crate::{
        error::Error,
        events::Events,
        protocol::ProtocolVersion,
        reconnect::Backoff,
        test_support::FakeServer,
    };

    use super::{Credentials, CredentialsProvider, ProviderError, Session, SessionConfig};
    use crate::client::connect::Endpoint;

    pub(crate) fn session_for(server: &FakeServer) -> Session {
        Session::new(SessionConfig {
            connector: Arc::new(server.connector()),
            credentials: None,
            provider: None,
            backoff: Backoff::new(Duration::from_millis(1), Duration::from_millis(5), 3),
            protocol: ProtocolVersion::Resp2,
            database: 0,
            client_name: None,
            connect_timeout: Some(Duration::from_secs(5)),
            max_in_flight: 1000,
            events: Events::default(),
        })
    }

    pub(crate) fn resp3_session_for(server: &FakeServer) -> Session {
        let mut session = session_for(server);
        session.protocol = ProtocolVersion::Resp3;
        session
    }

    #[tokio::test]
    async fn provider_is_consulted_for_each_connection() {
        let server = FakeServer::new();
        server.require_password("token-2");

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_c = calls.clone();
        let provider = move || {
            let n = calls_c.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                Ok::<_, ProviderError>(Credentials::new(Some("svc"), format!("token-{}", n)))
            }
        };
        let mut session = session_for(&server);
        session.provider = Some(Arc::new(provider));
        let endpoint = Endpoint::new("localhost", 6379);

        // The first token is stale, authentication fails and is not retried
        let Err(err) = session.open_raw(&endpoint, None).await else {
            panic!("expected open_raw to fail");
        };
        assert_eq!(err.server_error().map(|e| e.code()), Some("WRONGPASS"));

        session.open_raw(&endpoint, None).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(session.credentials().unwrap().password(), "token-2");
    }

    #[tokio::test]
    async fn provider_errors_surface_verbatim() {
        #[derive(Debug)]
        struct VaultSealed;

        impl std::fmt::Display for VaultSealed {
            fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("vault is sealed")
            }
        }

        impl std::error::Error for VaultSealed {}

        struct Failing;

        impl CredentialsProvider for Failing {
            fn credentials(
                &self,
            ) -> futures_util::future::BoxFuture<'_, Result<Credentials, ProviderError>>
            {
                Box::pin(async { Err(Box::new(VaultSealed) as ProviderError) })
            }
        }

        let server = FakeServer::new();
        let mut session = session_for(&server);
        session.provider = Some(Arc::new(Failing));

        let err = session
            .open_paired(&Endpoint::new("localhost", 6379), None, None)
            .await
            .unwrap_err();
        match err {
            Error::CredentialProvider(inner) => {
                assert!(inner.downcast_ref::<VaultSealed>().is_some());
                assert_eq!(inner.to_string(), "vault is sealed");
            }
            other => panic!("Unexpected: {:?}", other),
        }
        assert!(server.command_log().is_empty());
    }

    #[tokio::test]
    async fn rotation_applies_to_new_connections_only() {
        let server = FakeServer::new();
        server.require_password("old");
        let session = session_for(&server);
        session.set_credentials(Credentials::new(None::<&str>, "old"));
        let endpoint = Endpoint::new("localhost", 6379);

        let first = session.open_paired(&endpoint, None, None).await.unwrap();

        server.require_password("new");
        session.set_credentials(Credentials::new(None::<&str>, "new"));
        let second = session.open_paired(&endpoint, None, None).await.unwrap();

        // The established connection keeps working with the identity it had
        let pong: String = first.send(resp_array!["PING"]).await.unwrap();
        assert_eq!(pong, "PONG");
        let pong: String = second.send(resp_array!["PING"]).await.unwrap();
        assert_eq!(pong, "PONG");

        let auths: Vec<_> = server
            .command_log()
            .into_iter()
            .filter(|c| c[0] == "AUTH")
            .collect();
        assert_eq!(auths, vec![vec!["AUTH", "old"], vec!["AUTH", "new"]]);
    }
}
