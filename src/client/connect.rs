/*
 * Copyright 2017-2024 Ben Ashford
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

use futures_util::{future::BoxFuture, SinkExt, StreamExt};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Framed};

use crate::{
    error::{self, ConnectionReason},
    protocol::{FromResp, ProtocolVersion, RespCodec, RespValue},
};

use super::session::Credentials;

const KEEPALIVE_TIME: Duration = Duration::from_secs(60);

/// Any byte stream a RESP connection can run over
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type RespConnection = Framed<Box<dyn AsyncStream>, RespCodec>;

/// A server address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    host: Arc<str>,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<Arc<str>>, port: u16) -> Self {
        Endpoint {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Parse the `host:port` form used in redirects and topology replies
    pub fn parse(address: &str) -> Option<Self> {
        let (host, port) = address.rsplit_once(':')?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return None;
        }
        Some(Endpoint::new(host, port.parse().ok()?))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Opens byte streams to servers. Plain TCP and TLS are provided by `TcpConnector`, anything
/// else (proxies, in-memory transports, ...) can be plugged in by implementing this trait.
pub trait Connector: Send + Sync + 'static {
    fn connect<'a>(
        &'a self,
        endpoint: &'a Endpoint,
    ) -> BoxFuture<'a, Result<Box<dyn AsyncStream>, error::Error>>;
}

/// The default `Connector`: TCP with `TCP_NODELAY` and keepalive, optionally wrapped in TLS
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    #[cfg(feature = "tls")]
    tls: bool,
}

impl TcpConnector {
    pub fn new() -> Self {
        TcpConnector::default()
    }

    #[cfg(feature = "tls")]
    pub fn with_tls() -> Self {
        TcpConnector { tls: true }
    }
}

async fn connect_tcp(endpoint: &Endpoint) -> Result<TcpStream, error::Error> {
    let tcp_stream = TcpStream::connect((endpoint.host(), endpoint.port())).await?;
    tcp_stream.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_TIME);
    if let Err(e) = SockRef::from(&tcp_stream).set_tcp_keepalive(&keepalive) {
        log::warn!("Cannot set TCP keepalive on {}: {}", endpoint, e);
    }
    Ok(tcp_stream)
}

#[cfg(feature = "with-rustls")]
async fn connect_tls(
    endpoint: &Endpoint,
    tcp_stream: TcpStream,
) -> Result<Box<dyn AsyncStream>, error::Error> {
    use tokio_rustls::{
        rustls::{pki_types::ServerName, ClientConfig, RootCertStore},
        TlsConnector,
    };

    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from(endpoint.host().to_string())
        .map_err(|_err| error::Error::InvalidDnsName)?;

    let stream = connector.connect(server_name, tcp_stream).await?;
    Ok(Box::new(stream))
}

#[cfg(all(feature = "with-native-tls", not(feature = "with-rustls")))]
async fn connect_tls(
    endpoint: &Endpoint,
    tcp_stream: TcpStream,
) -> Result<Box<dyn AsyncStream>, error::Error> {
    let connector =
        native_tls::TlsConnector::new().map_err(|e| error::Error::Tls(e.to_string()))?;
    let connector = tokio_native_tls::TlsConnector::from(connector);
    let stream = connector
        .connect(endpoint.host(), tcp_stream)
        .await
        .map_err(|e| error::Error::Tls(e.to_string()))?;
    Ok(Box::new(stream))
}

impl Connector for TcpConnector {
    fn connect<'a>(
        &'a self,
        endpoint: &'a Endpoint,
    ) -> BoxFuture<'a, Result<Box<dyn AsyncStream>, error::Error>> {
        Box::pin(async move {
            let tcp_stream = connect_tcp(endpoint).await?;
            #[cfg(feature = "tls")]
            if self.tls {
                return connect_tls(endpoint, tcp_stream).await;
            }
            Ok(Box::new(tcp_stream) as Box<dyn AsyncStream>)
        })
    }
}

/// Everything sent to a fresh connection before it is handed out
#[derive(Debug, Clone, Default)]
pub(crate) struct Handshake {
    pub(crate) protocol: ProtocolVersion,
    pub(crate) credentials: Option<Credentials>,
    pub(crate) client_name: Option<Arc<str>>,
    pub(crate) database: u32,
    /// Client id of the connection receiving invalidations for this one
    pub(crate) tracking_redirect: Option<i64>,
}

/// Send one command on an unpaired connection and read its reply, skipping any push data
pub(crate) async fn roundtrip(
    connection: &mut RespConnection,
    command: RespValue,
) -> Result<RespValue, error::Error> {
    connection.send(command).await?;
    loop {
        match connection.next().await {
            Some(Ok(RespValue::Push(_))) => continue,
            Some(Ok(value)) => return RespValue::from_resp(value),
            Some(Err(e)) => return Err(e),
            None => return Err(error::Error::Connection(ConnectionReason::NotConnected)),
        }
    }
}

impl Handshake {
    pub(crate) async fn perform(&self, connection: &mut RespConnection) -> Result<(), error::Error> {
        match self.protocol {
            ProtocolVersion::Resp3 => {
                let mut hello = resp_array!["HELLO", "3"];
                if let Some(credentials) = &self.credentials {
                    hello.push("AUTH");
                    hello.push(credentials.username().unwrap_or("default"));
                    hello.push(credentials.password());
                }
                roundtrip(connection, hello).await?;
            }
            ProtocolVersion::Resp2 => {
                if let Some(credentials) = &self.credentials {
                    let mut auth = resp_array!["AUTH"];
                    if let Some(username) = credentials.username() {
                        auth.push(username);
                    }
                    auth.push(credentials.password());
                    let () = FromResp::from_resp(roundtrip(connection, auth).await?)?;
                }
            }
        }
        if let Some(name) = &self.client_name {
            roundtrip(connection, resp_array!["CLIENT", "SETNAME", name.as_ref()]).await?;
        }
        if self.database != 0 {
            roundtrip(connection, resp_array!["SELECT", self.database.to_string()]).await?;
        }
        if let Some(id) = self.tracking_redirect {
            roundtrip(
                connection,
                resp_array!["CLIENT", "TRACKING", "ON", "REDIRECT", id.to_string()],
            )
            .await?;
        }
        Ok(())
    }
}

/// Frame a stream with the RESP codec
pub(crate) fn framed(stream: Box<dyn AsyncStream>) -> RespConnection {
    RespCodec::default().framed(stream)
}

/// Connect to a Redis server and return a Future that resolves to a
/// `RespConnection` for reading and writing asynchronously.
///
/// Each `RespConnection` implements both `Sink` and `Stream` and read and
/// writes `RESP` objects.
///
/// This is a low-level interface to enable the creation of higher-level
/// functionality.
///
/// The sink and stream sides behave independently of each other, it is the
/// responsibility of the calling application to determine what results are
/// paired to a particular command.
///
/// But since most Redis usages involve issue commands that result in one
/// single result, this library also implements `paired_connect`.
pub async fn connect(host: &str, port: u16) -> Result<RespConnection, error::Error> {
    let stream = TcpConnector::new()
        .connect(&Endpoint::new(host, port))
        .await?;
    Ok(framed(stream))
}

/// As `connect`, authenticating with `AUTH` before the connection is returned
pub async fn connect_with_auth(
    host: &str,
    port: u16,
    username: Option<&str>,
    password: Option<&str>,
) -> Result<RespConnection, error::Error> {
    let mut connection = connect(host, port).await?;
    let handshake = Handshake {
        credentials: password.map(|password| Credentials::new(username, password)),
        ..Handshake::default()
    };
    handshake.perform(&mut connection).await?;
    Ok(connection)
}
