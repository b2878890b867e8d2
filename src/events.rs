/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Client events, for observing connection state, reconnection, cache invalidation and failures
//! inside caller-supplied callbacks.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::client::{ConnectionState, Invalidation};

/// Something that happened inside a client, delivered to listeners registered with
/// `Client::on_event`
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A connection to `address` changed state
    ConnectionState {
        address: String,
        state: ConnectionState,
    },
    /// A connection attempt to `address` failed, another will be made after `delay`
    Reconnecting {
        address: String,
        attempt: u32,
        delay: Duration,
    },
    /// Cached entries were invalidated by the server
    Invalidated(Invalidation),
    /// A caller-supplied callback panicked, the panic was contained
    CallbackFailed { context: String, message: String },
    /// The cluster slot map was rebuilt
    TopologyRefreshed { nodes: usize },
}

type Listener = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

/// The listeners of one client, shared by everything the client owns
#[derive(Clone, Default)]
pub(crate) struct Events {
    listeners: Arc<RwLock<Vec<Listener>>>,
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let count = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("Events").field("listeners", &count).finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl Events {
    pub(crate) fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(listener));
    }

    fn snapshot(&self) -> Vec<Listener> {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Deliver an event to every listener. A listener that panics is reported to the others as
    /// `CallbackFailed` and does not prevent later listeners from running.
    pub(crate) fn emit(&self, event: ClientEvent) {
        let listeners = self.snapshot();
        let mut failures = Vec::new();
        for listener in &listeners {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| listener(&event))) {
                let message = panic_message(payload.as_ref());
                log::error!("Event listener panicked handling {:?}: {}", event, message);
                failures.push(message);
            }
        }
        if matches!(event, ClientEvent::CallbackFailed { .. }) {
            return;
        }
        for message in failures {
            self.emit(ClientEvent::CallbackFailed {
                context: "event listener".into(),
                message,
            });
        }
    }

    /// Run caller-supplied code, containing any panic. Returns `false` if it panicked.
    pub(crate) fn isolate<F>(&self, context: &str, f: F) -> bool
    where
        F: FnOnce(),
    {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(()) => true,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::error!("Callback panicked in {}: {}", context, message);
                self.emit(ClientEvent::CallbackFailed {
                    context: context.to_string(),
                    message,
                });
                false
            }
        }
    }
}
