/*
 * Copyright 2020-2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::error::Error;

pub(crate) fn spawn<F>(f: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(f)
}

/// Apply an optional deadline to a future, expiry is reported as `Error::Timeout`
pub(crate) async fn timeout<T>(duration: Option<Duration>, future: T) -> Result<T::Output, Error>
where
    T: Future,
{
    match duration {
        Some(duration) => Ok(tokio::time::timeout(duration, future).await?),
        None => Ok(future.await),
    }
}
