/*
 * Copyright 2018-2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Bounded exponential backoff for re-establishing lost connections.

use std::cmp;
use std::future::Future;
use std::time::Duration;

use crate::{
    error::{self, ConnectionReason},
    events::{ClientEvent, Events},
};

const DEFAULT_BASE: Duration = Duration::from_millis(100);
const DEFAULT_CAP: Duration = Duration::from_secs(10);
const DEFAULT_MAX_ATTEMPTS: u32 = 10;

/// Retry policy: retry `i` (counting from zero) waits `min(cap, base * 2^i)`, and at most
/// `max_attempts` retries follow the first failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff {
            base: DEFAULT_BASE,
            cap: DEFAULT_CAP,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Backoff {
            base,
            cap,
            max_attempts,
        }
    }

    /// The delay before retry `attempt`
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        match self.base.checked_mul(factor) {
            Some(delay) => cmp::min(delay, self.cap),
            None => self.cap,
        }
    }
}

/// Keep calling `connect` until it succeeds, sleeping between attempts according to `backoff`.
///
/// Only transient failures are retried, anything else (e.g. a credentials provider error or an
/// authentication failure) is returned straight away.
pub(crate) async fn reconnect<T, F, Fut>(
    backoff: &Backoff,
    events: &Events,
    address: &str,
    mut connect: F,
) -> Result<T, error::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, error::Error>>,
{
    let mut attempt = 0;
    loop {
        match connect().await {
            Ok(t) => {
                if attempt > 0 {
                    log::info!("Reconnected to {} after {} retries", address, attempt);
                }
                return Ok(t);
            }
            Err(e) if e.is_transient() => {
                if attempt >= backoff.max_attempts {
                    log::error!(
                        "Giving up connecting to {} after {} retries: {}",
                        address,
                        attempt,
                        e
                    );
                    return Err(error::Error::Connection(ConnectionReason::ConnectionFailed));
                }
                let delay = backoff.delay(attempt);
                attempt += 1;
                log::warn!(
                    "Connection to {} failed: {}, retry {} in {:?}",
                    address,
                    e,
                    attempt,
                    delay
                );
                events.emit(ClientEvent::Reconnecting {
                    address: address.to_string(),
                    attempt,
                    delay,
                });
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
