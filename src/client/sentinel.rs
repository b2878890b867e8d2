/*
 * Copyright 2023-2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Finding the current master through Redis Sentinel

use std::cmp;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::{
    error::{self, ConnectionReason},
    protocol::RespValue,
};

use super::{
    connect::{roundtrip, Endpoint},
    session::{Credentials, Session},
};

pub(crate) const SENTINEL_CONNECTION_TIMEOUT: Duration = Duration::from_millis(500);

/// How far discovery got with one sentinel, later stages are "further"
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum DiscoveryError {
    SentinelConnectionFailure,
    SentinelCommunicationFailure,
    SentinelDoesNotKnowMasterAddress,
    RedisConnectionFailure,
    RedisCommunicationFailure,
    RedisIsNotMaster,
}

pub(crate) struct SentinelDiscovery {
    /// Sentinels in the order they are tried, the last one to answer goes first
    sentinels: Mutex<Vec<Endpoint>>,
    master_name: String,
    credentials: Option<Credentials>,
    timeout: Duration,
}

impl SentinelDiscovery {
    pub(crate) fn new(
        sentinels: Vec<Endpoint>,
        master_name: impl Into<String>,
        credentials: Option<Credentials>,
    ) -> Self {
        SentinelDiscovery {
            sentinels: Mutex::new(sentinels),
            master_name: master_name.into(),
            credentials,
            timeout: SENTINEL_CONNECTION_TIMEOUT,
        }
    }

    pub(crate) fn master_name(&self) -> &str {
        &self.master_name
    }

    fn sentinels(&self) -> Vec<Endpoint> {
        self.sentinels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn promote(&self, sentinel: &Endpoint) {
        let mut sentinels = self.sentinels.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(i) = sentinels.iter().position(|s| s == sentinel) {
            sentinels[0..=i].rotate_right(1);
        }
    }

    /// Ask each sentinel in turn for the master, and check the master agrees that it is one
    pub(crate) async fn discover(&self, session: &Session) -> Result<Endpoint, error::Error> {
        let mut furthest_error = DiscoveryError::SentinelConnectionFailure;

        for sentinel in self.sentinels() {
            match self.discover_master(session, &sentinel).await {
                Ok(master) => {
                    self.promote(&sentinel);
                    log::debug!("Sentinel {} reports master {} at {}", sentinel, self.master_name, master);
                    return Ok(master);
                }
                Err(error) => {
                    furthest_error = cmp::max(furthest_error, error);
                    if error > DiscoveryError::SentinelDoesNotKnowMasterAddress {
                        self.promote(&sentinel);
                    }
                }
            }
        }

        log::warn!(
            "Discovery of master {} failed at {:?}",
            self.master_name,
            furthest_error
        );
        Err(error::Error::Connection(ConnectionReason::ConnectionFailed))
    }

    async fn discover_master(
        &self,
        session: &Session,
        sentinel: &Endpoint,
    ) -> Result<Endpoint, DiscoveryError> {
        let mut sentinel_connection = session
            .open_sentinel(sentinel, self.credentials.clone(), self.timeout)
            .await
            .map_err(|_| DiscoveryError::SentinelConnectionFailure)?;

        let reply = roundtrip(
            &mut sentinel_connection,
            resp_array!["SENTINEL", "get-master-addr-by-name", self.master_name.as_str()],
        )
        .await
        .map_err(|_| DiscoveryError::SentinelCommunicationFailure)?;

        let master = match master_address_from_resp_value(reply) {
            Ok(Some(address)) => address,
            Ok(None) => return Err(DiscoveryError::SentinelDoesNotKnowMasterAddress),
            Err(e) => {
                log::debug!("Bad reply from sentinel {}: {}", sentinel, e);
                return Err(DiscoveryError::SentinelCommunicationFailure);
            }
        };
        drop(sentinel_connection);

        let mut redis_connection = session
            .open_raw(&master, None)
            .await
            .map_err(|_| DiscoveryError::RedisConnectionFailure)?;

        let role = roundtrip(&mut redis_connection, resp_array!["ROLE"])
            .await
            .map_err(|_| DiscoveryError::RedisCommunicationFailure)
            .and_then(|value| {
                role_from_resp_value(value).map_err(|_| DiscoveryError::RedisCommunicationFailure)
            })?;

        if role == "master" {
            Ok(master)
        } else {
            Err(DiscoveryError::RedisIsNotMaster)
        }
    }
}

/// Extracts master address from a response to SENTINEL get-master-addr-by-name
/// command. The function returns the address when it is known and None otherwise.
fn master_address_from_resp_value(value: RespValue) -> Result<Option<Endpoint>, String> {
    if let RespValue::Nil = value {
        return Ok(None);
    }

    let array = match value {
        RespValue::Array(array) => array,
        _ => return Err("Response is not an array".to_owned()),
    };

    let mut iter = array.into_iter();
    let (host_raw, port_raw) = match (iter.next(), iter.next(), iter.next()) {
        (Some(RespValue::BulkString(host_raw)), Some(RespValue::BulkString(port_raw)), None) => {
            (host_raw, port_raw)
        }
        _ => return Err("Response array does not contain exactly two bulk strings".to_owned()),
    };

    let host = match String::from_utf8(host_raw) {
        Ok(host) if !host.is_empty() => host,
        Ok(_) => return Err("Sentinel returned an empty host".to_owned()),
        Err(_) => return Err("Sentinel returned non-utf-8 host".to_owned()),
    };

    let port = match String::from_utf8(port_raw).map(|s| s.parse::<u16>()) {
        Ok(Ok(port)) => port,
        Ok(_) => return Err("Sentinel returned non-u16 port".to_owned()),
        _ => return Err("Sentinel returned non-utf-8 port".to_owned()),
    };

    Ok(Some(Endpoint::new(host, port)))
}

/// Extracts role string from a response to ROLE command.
fn role_from_resp_value(value: RespValue) -> Result<String, String> {
    let array = match value {
        RespValue::Array(array) => array,
        _ => return Err("Response is not an array".to_owned()),
    };

    let role_raw = match array.into_iter().next() {
        Some(RespValue::BulkString(role_raw)) => role_raw,
        Some(RespValue::SimpleString(role)) => return Ok(role),
        _ => return Err("Response array does not start with a string".to_owned()),
    };

    String::from_utf8(role_raw).map_err(|_| "Redis returned non-utf-8 role".to_owned())
}

#[cfg(test)]
mod tests {
    use crate::{
        client::{connect::Endpoint, session::tests::session_for},
        error::{ConnectionReason, Error},
        protocol::RespValue,
        test_support::{FakeServer, HOST},
    };

    use super::{master_address_from_resp_value, SentinelDiscovery};

    #[test]
    fn parses_master_address() {
        assert_eq!(
            master_address_from_resp_value(resp_array!["10.0.0.5", "6379"]),
            Ok(Some(Endpoint::new("10.0.0.5", 6379)))
        );
        assert_eq!(master_address_from_resp_value(RespValue::Nil), Ok(None));
        assert!(master_address_from_resp_value(resp_array!["10.0.0.5", "port"]).is_err());
        assert!(master_address_from_resp_value(resp_array!["10.0.0.5"]).is_err());
    }

    #[tokio::test]
    async fn first_responsive_sentinel_moves_to_front() {
        let server = FakeServer::new();
        server.set_sentinel_master(HOST, 6380);
        server.set_down(26379, true);
        let session = session_for(&server);
        let discovery = SentinelDiscovery::new(
            vec![Endpoint::new(HOST, 26379), Endpoint::new(HOST, 26380)],
            "mymaster",
            None,
        );

        let master = discovery.discover(&session).await.unwrap();
        assert_eq!(master, Endpoint::new(HOST, 6380));
        assert_eq!(
            discovery.sentinels(),
            vec![Endpoint::new(HOST, 26380), Endpoint::new(HOST, 26379)]
        );
        assert_eq!(
            server.node_log(26380),
            vec![vec!["SENTINEL", "get-master-addr-by-name", "mymaster"]]
        );
        assert_eq!(server.node_log(6380), vec![vec!["ROLE"]]);
    }

    #[tokio::test]
    async fn replica_is_not_accepted_as_master() {
        let server = FakeServer::new();
        server.set_sentinel_master(HOST, 6380);
        server.set_replica(6380);
        let session = session_for(&server);
        let discovery =
            SentinelDiscovery::new(vec![Endpoint::new(HOST, 26379)], "mymaster", None);

        assert!(matches!(
            discovery.discover(&session).await,
            Err(Error::Connection(ConnectionReason::ConnectionFailed))
        ));
    }

    #[tokio::test]
    async fn unknown_master_fails() {
        let server = FakeServer::new();
        let session = session_for(&server);
        let discovery =
            SentinelDiscovery::new(vec![Endpoint::new(HOST, 26379)], "mymaster", None);

        assert!(discovery.discover(&session).await.is_err());
    }
}
