/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! An in-process server speaking enough of the protocol to drive the client end to end. Every
//! node of a fake cluster (or sentinel) shares one keyspace, nodes are told apart by port.

use std::collections::{HashMap, HashSet};
use std::io;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_channel::mpsc;
use futures_util::{future::BoxFuture, SinkExt, StreamExt};
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::watch;
use tokio_util::codec::Framed;

use crate::{
    client::{
        cluster::slots::hash_slot,
        connect::{AsyncStream, Connector, Endpoint},
    },
    error,
    protocol::{command, RespCodec, RespValue},
};

pub(crate) const HOST: &str = "127.0.0.1";

const INVALIDATE_CHANNEL: &[u8] = b"__redis__:invalidate";

enum Reply {
    Value(RespValue),
    /// Bytes that are not valid RESP
    Raw(&'static [u8]),
}

enum Entry {
    Str(Vec<u8>),
    Hash(Vec<(Vec<u8>, Vec<u8>)>),
}

struct Client {
    port: u16,
    tx: mpsc::UnboundedSender<Reply>,
    resp3: bool,
    authed: bool,
    asking: bool,
    tracking_redirect: Option<i64>,
    channels: HashSet<Vec<u8>>,
    patterns: HashSet<Vec<u8>>,
}

#[derive(Default)]
struct State {
    data: HashMap<Vec<u8>, Entry>,
    password: Option<String>,
    log: Vec<(u16, Vec<String>)>,
    down: HashSet<u16>,
    next_id: i64,
    accepted: usize,
    clients: HashMap<i64, Client>,
    /// Owning port of every slot, when running as a cluster
    slots: Option<Vec<u16>>,
    /// Slots being migrated, and the port they are moving to
    migrating: HashMap<u16, u16>,
    /// Redirects name only the port, as nodes do when they do not know their own address
    hostless_redirects: bool,
    replicas: HashSet<u16>,
    sentinel_master: Option<(String, u16)>,
    /// Key to the client ids that receive its invalidation
    tracking: HashMap<Vec<u8>, HashSet<i64>>,
}

struct Shared {
    state: Mutex<State>,
    /// Bumped to close connections, all of them or those of one port
    kill: watch::Sender<(u64, Option<u16>)>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub(crate) struct FakeServer {
    shared: Arc<Shared>,
}

#[derive(Clone)]
pub(crate) struct FakeConnector {
    shared: Arc<Shared>,
}

impl FakeServer {
    pub(crate) fn new() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let (kill, _) = watch::channel((0, None));
        FakeServer {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    next_id: 1,
                    ..State::default()
                }),
                kill,
            }),
        }
    }

    pub(crate) fn connector(&self) -> FakeConnector {
        FakeConnector {
            shared: self.shared.clone(),
        }
    }

    pub(crate) fn require_password(&self, password: &str) {
        self.shared.lock().password = Some(password.to_string());
    }

    /// Every command received, in order, by any node
    pub(crate) fn command_log(&self) -> Vec<Vec<String>> {
        self.shared
            .lock()
            .log
            .iter()
            .map(|(_, command)| command.clone())
            .collect()
    }

    /// The commands received by the node on `port`
    pub(crate) fn node_log(&self, port: u16) -> Vec<Vec<String>> {
        self.shared
            .lock()
            .log
            .iter()
            .filter(|(p, _)| *p == port)
            .map(|(_, command)| command.clone())
            .collect()
    }

    pub(crate) fn clear_log(&self) {
        self.shared.lock().log.clear();
    }

    /// Drop every open connection
    pub(crate) fn kill_connections(&self) {
        let generation = self.shared.kill.borrow().0 + 1;
        self.shared.kill.send_replace((generation, None));
    }

    pub(crate) fn kill_node(&self, port: u16) {
        let generation = self.shared.kill.borrow().0 + 1;
        self.shared.kill.send_replace((generation, Some(port)));
    }

    /// Refuse connections to `port`, dropping the ones already open
    pub(crate) fn set_down(&self, port: u16, down: bool) {
        {
            let mut state = self.shared.lock();
            if down {
                state.down.insert(port);
            } else {
                state.down.remove(&port);
            }
        }
        if down {
            self.kill_node(port);
        }
    }

    /// Number of connections accepted so far
    pub(crate) fn accepted(&self) -> usize {
        self.shared.lock().accepted
    }

    pub(crate) fn set_cluster(&self, layout: &[(RangeInclusive<u16>, u16)]) {
        let mut slots = vec![0; 16384];
        for (range, port) in layout {
            for slot in range.clone() {
                slots[slot as usize] = *port;
            }
        }
        self.shared.lock().slots = Some(slots);
    }

    pub(crate) fn set_slot_owner(&self, slot: u16, port: u16) {
        if let Some(slots) = &mut self.shared.lock().slots {
            slots[slot as usize] = port;
        }
    }

    /// Start moving `slot` to `port`, its owner answers with ASK for keys it does not hold
    pub(crate) fn migrate(&self, slot: u16, port: u16) {
        self.shared.lock().migrating.insert(slot, port);
    }

    pub(crate) fn set_hostless_redirects(&self, hostless: bool) {
        self.shared.lock().hostless_redirects = hostless;
    }

    pub(crate) fn set_replica(&self, port: u16) {
        self.shared.lock().replicas.insert(port);
    }

    pub(crate) fn set_sentinel_master(&self, host: &str, port: u16) {
        self.shared.lock().sentinel_master = Some((host.to_string(), port));
    }

    /// Ids of the connections subscribed to `channel`, in ascending order
    pub(crate) fn subscribers(&self, channel: &str) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .shared
            .lock()
            .clients
            .iter()
            .filter(|(_, c)| c.channels.contains(channel.as_bytes()))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn subscriber_count(&self, channel: &str) -> usize {
        self.subscribers(channel).len()
    }

    /// A write by some other client
    pub(crate) fn external_set(&self, key: &str, value: &str) {
        let mut state = self.shared.lock();
        state
            .data
            .insert(key.as_bytes().to_vec(), Entry::Str(value.as_bytes().to_vec()));
        state.invalidate(&[key.as_bytes().to_vec()]);
    }

    pub(crate) fn external_flush(&self) {
        let mut state = self.shared.lock();
        state.data.clear();
        state.flush_tracking();
    }
}

impl Connector for FakeConnector {
    fn connect<'a>(
        &'a self,
        endpoint: &'a Endpoint,
    ) -> BoxFuture<'a, Result<Box<dyn AsyncStream>, error::Error>> {
        Box::pin(async move {
            let port = endpoint.port();
            let (tx, rx) = mpsc::unbounded();
            let id = {
                let mut state = self.shared.lock();
                if state.down.contains(&port) {
                    return Err(io::Error::from(io::ErrorKind::ConnectionRefused).into());
                }
                let id = state.next_id;
                state.next_id += 1;
                state.accepted += 1;
                state.clients.insert(
                    id,
                    Client {
                        port,
                        tx,
                        resp3: false,
                        authed: false,
                        asking: false,
                        tracking_redirect: None,
                        channels: HashSet::new(),
                        patterns: HashSet::new(),
                    },
                );
                id
            };
            let (client_half, server_half) = tokio::io::duplex(1 << 16);
            let shared = self.shared.clone();
            tokio::spawn(async move {
                let _ = serve(&shared, id, port, server_half, rx).await;
                shared.lock().clients.remove(&id);
            });
            Ok(Box::new(client_half) as Box<dyn AsyncStream>)
        })
    }
}

async fn write(
    framed: &mut Framed<DuplexStream, RespCodec>,
    reply: Reply,
) -> Result<(), error::Error> {
    match reply {
        Reply::Value(value) => framed.send(value).await,
        Reply::Raw(bytes) => {
            framed.flush().await?;
            framed.get_mut().write_all(bytes).await?;
            Ok(())
        }
    }
}

async fn serve(
    shared: &Shared,
    id: i64,
    port: u16,
    stream: DuplexStream,
    mut rx: mpsc::UnboundedReceiver<Reply>,
) -> Result<(), error::Error> {
    let mut kill_rx = shared.kill.subscribe();
    let mut framed = Framed::new(stream, RespCodec::default());
    loop {
        tokio::select! {
            frame = framed.next() => match frame {
                Some(Ok(request)) => {
                    let replies = shared.lock().handle(id, request);
                    for reply in replies {
                        write(&mut framed, reply).await?;
                    }
                }
                _ => return Ok(()),
            },
            Some(reply) = rx.next() => write(&mut framed, reply).await?,
            changed = kill_rx.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let target = kill_rx.borrow().1;
                if target.map_or(true, |p| p == port) {
                    return Ok(());
                }
            }
        }
    }
}

fn bulk(bytes: &[u8]) -> RespValue {
    RespValue::BulkString(bytes.to_vec())
}

fn ok() -> Vec<Reply> {
    vec![Reply::Value(RespValue::SimpleString("OK".into()))]
}

fn err(line: &str) -> Vec<Reply> {
    vec![Reply::Value(RespValue::Error(line.into()))]
}

fn value(value: RespValue) -> Vec<Reply> {
    vec![Reply::Value(value)]
}

fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            glob_match(&pattern[1..], text) || (!text.is_empty() && glob_match(pattern, &text[1..]))
        }
        (Some(b'?'), Some(_)) => glob_match(&pattern[1..], &text[1..]),
        (Some(p), Some(t)) if p == t => glob_match(&pattern[1..], &text[1..]),
        _ => false,
    }
}

fn arg_bytes(arg: &RespValue) -> Vec<u8> {
    match arg {
        RespValue::Integer(i) => i.to_string().into_bytes(),
        other => other.as_bytes().map(<[u8]>::to_vec).unwrap_or_default(),
    }
}

impl State {
    fn client(&mut self, id: i64) -> &mut Client {
        self.clients.get_mut(&id).expect("client registered on connect")
    }

    fn handle(&mut self, id: i64, request: RespValue) -> Vec<Reply> {
        let args: Vec<Vec<u8>> = match &request {
            RespValue::Array(items) if !items.is_empty() => items.iter().map(arg_bytes).collect(),
            _ => return err("ERR Protocol error: expected an array of bulk strings"),
        };
        let port = self.client(id).port;
        self.log.push((
            port,
            args.iter()
                .map(|a| String::from_utf8_lossy(a).into_owned())
                .collect(),
        ));

        let name = args[0].to_ascii_uppercase();
        if self.password.is_some()
            && !self.client(id).authed
            && name != b"HELLO"
            && name != b"AUTH"
        {
            return err("NOAUTH Authentication required.");
        }

        let asking = std::mem::replace(&mut self.client(id).asking, false);
        if let Some(redirect) = self.route(port, asking, &request) {
            return redirect;
        }

        self.execute(id, &name, &args)
    }

    /// Cluster redirection for keyed commands
    fn route(&self, port: u16, asking: bool, request: &RespValue) -> Option<Vec<Reply>> {
        let slots = self.slots.as_ref()?;
        let keys = command::keys(request);
        let first = keys.first()?;
        let slot = hash_slot(first);
        let owner = slots[slot as usize];
        let host = if self.hostless_redirects { "" } else { HOST };
        if let Some(target) = self.migrating.get(&slot) {
            if port == owner && !self.data.contains_key(*first) {
                return Some(err(&format!("ASK {} {}:{}", slot, host, target)));
            }
            if port == *target && asking {
                return None;
            }
        }
        if owner != port {
            return Some(err(&format!("MOVED {} {}:{}", slot, host, owner)));
        }
        None
    }

    fn check_password(&mut self, id: i64, password: &[u8]) -> Result<(), Vec<Reply>> {
        match &self.password {
            Some(expected) if expected.as_bytes() != password => {
                Err(err("WRONGPASS invalid username-password pair"))
            }
            _ => {
                self.client(id).authed = true;
                Ok(())
            }
        }
    }

    fn track(&mut self, id: i64, keys: &[Vec<u8>]) {
        if let Some(redirect) = self.client(id).tracking_redirect {
            for key in keys {
                self.tracking.entry(key.clone()).or_default().insert(redirect);
            }
        }
    }

    fn send_invalidation(&self, target: i64, payload: RespValue) {
        if let Some(client) = self.clients.get(&target) {
            if client.channels.contains(INVALIDATE_CHANNEL) {
                let items = vec![bulk(b"message"), bulk(INVALIDATE_CHANNEL), payload];
                let frame = if client.resp3 {
                    RespValue::Push(items)
                } else {
                    RespValue::Array(items)
                };
                let _ = client.tx.unbounded_send(Reply::Value(frame));
            }
        }
    }

    fn invalidate(&mut self, keys: &[Vec<u8>]) {
        let mut by_target: HashMap<i64, Vec<RespValue>> = HashMap::new();
        for key in keys {
            if let Some(targets) = self.tracking.remove(key) {
                for target in targets {
                    by_target.entry(target).or_default().push(bulk(key));
                }
            }
        }
        for (target, keys) in by_target {
            self.send_invalidation(target, RespValue::Array(keys));
        }
    }

    fn flush_tracking(&mut self) {
        self.tracking.clear();
        let targets: Vec<i64> = self
            .clients
            .iter()
            .filter(|(_, c)| c.channels.contains(INVALIDATE_CHANNEL))
            .map(|(id, _)| *id)
            .collect();
        for target in targets {
            self.send_invalidation(target, RespValue::Nil);
        }
    }

    fn publish(&self, channel: &[u8], message: &[u8]) -> i64 {
        let mut receivers = 0;
        for client in self.clients.values() {
            let wrap = |items| {
                Reply::Value(if client.resp3 {
                    RespValue::Push(items)
                } else {
                    RespValue::Array(items)
                })
            };
            if client.channels.contains(channel) {
                receivers += 1;
                let _ = client.tx.unbounded_send(wrap(vec![
                    bulk(b"message"),
                    bulk(channel),
                    bulk(message),
                ]));
            }
            for pattern in &client.patterns {
                if glob_match(pattern, channel) {
                    receivers += 1;
                    let _ = client.tx.unbounded_send(wrap(vec![
                        bulk(b"pmessage"),
                        bulk(pattern),
                        bulk(channel),
                        bulk(message),
                    ]));
                }
            }
        }
        receivers
    }

    fn subscription_frames(&mut self, id: i64, kind: &[u8], targets: &[Vec<u8>]) -> Vec<Reply> {
        let client = self.client(id);
        let pattern = kind.starts_with(b"p");
        let subscribing = !kind.starts_with(b"unsub") && !kind.starts_with(b"punsub");
        let mut targets = targets.to_vec();
        if !subscribing && targets.is_empty() {
            let current = if pattern { &client.patterns } else { &client.channels };
            targets = current.iter().cloned().collect();
            targets.sort();
        }
        let mut frames = Vec::new();
        if targets.is_empty() {
            frames.push((RespValue::Nil, 0));
        }
        for target in targets {
            let set = if pattern {
                &mut client.patterns
            } else {
                &mut client.channels
            };
            if subscribing {
                set.insert(target.clone());
            } else {
                set.remove(&target);
            }
            let count = (client.channels.len() + client.patterns.len()) as i64;
            frames.push((bulk(&target), count));
        }
        let resp3 = client.resp3;
        frames
            .into_iter()
            .map(|(target, count)| {
                let items = vec![bulk(kind), target, RespValue::Integer(count)];
                Reply::Value(if resp3 {
                    RespValue::Push(items)
                } else {
                    RespValue::Array(items)
                })
            })
            .collect()
    }

    fn cluster_slots(&self) -> Vec<Reply> {
        let slots = match &self.slots {
            Some(slots) => slots,
            None => return err("ERR This instance has cluster support disabled"),
        };
        let mut ranges = Vec::new();
        let mut start = 0usize;
        for slot in 1..=slots.len() {
            if slot == slots.len() || slots[slot] != slots[start] {
                let port = slots[start];
                // Port 0 marks a slot nobody serves
                if port != 0 {
                    ranges.push(resp_array![
                        RespValue::Integer(start as i64),
                        RespValue::Integer(slot as i64 - 1),
                        resp_array![HOST, RespValue::Integer(port as i64), format!("node-{}", port)]
                    ]);
                }
                start = slot;
            }
        }
        value(RespValue::Array(ranges))
    }

    fn execute(&mut self, id: i64, name: &[u8], args: &[Vec<u8>]) -> Vec<Reply> {
        let arg = |i: usize| args.get(i).map(Vec::as_slice).unwrap_or_default();
        match name {
            b"HELLO" => {
                if arg(2).eq_ignore_ascii_case(b"AUTH") {
                    if let Err(reply) = self.check_password(id, arg(4)) {
                        return reply;
                    }
                } else if self.password.is_some() {
                    return err("NOAUTH HELLO must be called with the client already authenticated");
                }
                let resp3 = arg(1) == b"3";
                self.client(id).resp3 = resp3;
                value(RespValue::Map(vec![
                    (bulk(b"server"), bulk(b"redis")),
                    (bulk(b"version"), bulk(b"7.2.0")),
                    (bulk(b"proto"), RespValue::Integer(if resp3 { 3 } else { 2 })),
                    (bulk(b"id"), RespValue::Integer(id)),
                ]))
            }
            b"AUTH" => {
                let password = if args.len() > 2 { arg(2) } else { arg(1) };
                match self.check_password(id, password) {
                    Ok(()) => ok(),
                    Err(reply) => reply,
                }
            }
            b"CLIENT" => match arg(1).to_ascii_uppercase().as_slice() {
                b"ID" => value(RespValue::Integer(id)),
                b"TRACKING" => {
                    let redirect = args
                        .iter()
                        .position(|a| a.eq_ignore_ascii_case(b"REDIRECT"))
                        .and_then(|i| args.get(i + 1))
                        .and_then(|r| String::from_utf8_lossy(r).parse().ok());
                    self.client(id).tracking_redirect = redirect;
                    ok()
                }
                _ => ok(),
            },
            b"SELECT" | b"QUIT" => ok(),
            b"ASKING" => {
                self.client(id).asking = true;
                ok()
            }
            b"PING" => match args.get(1) {
                Some(payload) => value(bulk(payload)),
                None => value(RespValue::SimpleString("PONG".into())),
            },
            b"ECHO" => value(bulk(arg(1))),
            b"HANG" => Vec::new(),
            b"GARBAGE" => vec![Reply::Raw(b"@@@\r\n")],
            b"PUSHTEST" => vec![
                Reply::Value(RespValue::Push(vec![bulk(b"test"), bulk(b"abc")])),
                Reply::Value(RespValue::SimpleString("OK".into())),
            ],
            b"SET" => {
                self.data.insert(arg(1).to_vec(), Entry::Str(arg(2).to_vec()));
                self.invalidate(&args[1..2]);
                ok()
            }
            b"MSET" => {
                let keys: Vec<Vec<u8>> = args[1..].chunks(2).map(|kv| kv[0].clone()).collect();
                for kv in args[1..].chunks(2) {
                    if let [k, v] = kv {
                        self.data.insert(k.clone(), Entry::Str(v.clone()));
                    }
                }
                self.invalidate(&keys);
                ok()
            }
            b"GET" => {
                self.track(id, &args[1..2]);
                match self.data.get(arg(1)) {
                    Some(Entry::Str(v)) => value(bulk(v)),
                    Some(Entry::Hash(_)) => err(
                        "WRONGTYPE Operation against a key holding the wrong kind of value",
                    ),
                    None => value(RespValue::Nil),
                }
            }
            b"MGET" => {
                self.track(id, &args[1..]);
                let values = args[1..]
                    .iter()
                    .map(|k| match self.data.get(k) {
                        Some(Entry::Str(v)) => bulk(v),
                        _ => RespValue::Nil,
                    })
                    .collect();
                value(RespValue::Array(values))
            }
            b"EXISTS" => {
                self.track(id, &args[1..]);
                let n = args[1..].iter().filter(|k| self.data.contains_key(*k)).count();
                value(RespValue::Integer(n as i64))
            }
            b"DEL" => {
                let n = args[1..]
                    .iter()
                    .filter(|k| self.data.remove(*k).is_some())
                    .count();
                self.invalidate(&args[1..]);
                value(RespValue::Integer(n as i64))
            }
            b"INCR" => {
                let current = match self.data.get(arg(1)) {
                    None => 0,
                    Some(Entry::Str(v)) => match String::from_utf8_lossy(v).parse::<i64>() {
                        Ok(n) => n,
                        Err(_) => return err("ERR value is not an integer or out of range"),
                    },
                    Some(Entry::Hash(_)) => {
                        return err(
                            "WRONGTYPE Operation against a key holding the wrong kind of value",
                        )
                    }
                };
                let next = current + 1;
                self.data
                    .insert(arg(1).to_vec(), Entry::Str(next.to_string().into_bytes()));
                self.invalidate(&args[1..2]);
                value(RespValue::Integer(next))
            }
            b"HSET" => {
                let entry = self
                    .data
                    .entry(arg(1).to_vec())
                    .or_insert_with(|| Entry::Hash(Vec::new()));
                let fields = match entry {
                    Entry::Hash(fields) => fields,
                    Entry::Str(_) => {
                        return err(
                            "WRONGTYPE Operation against a key holding the wrong kind of value",
                        )
                    }
                };
                let mut added = 0;
                for fv in args[2..].chunks(2) {
                    if let [f, v] = fv {
                        match fields.iter_mut().find(|(existing, _)| existing == f) {
                            Some((_, existing)) => *existing = v.clone(),
                            None => {
                                fields.push((f.clone(), v.clone()));
                                added += 1;
                            }
                        }
                    }
                }
                self.invalidate(&args[1..2]);
                value(RespValue::Integer(added))
            }
            b"HGET" | b"HGETALL" => {
                self.track(id, &args[1..2]);
                let resp3 = self.client(id).resp3;
                let fields: &[(Vec<u8>, Vec<u8>)] = match self.data.get(arg(1)) {
                    Some(Entry::Hash(fields)) => fields,
                    Some(Entry::Str(_)) => {
                        return err(
                            "WRONGTYPE Operation against a key holding the wrong kind of value",
                        )
                    }
                    None => &[],
                };
                if name == b"HGET" {
                    return value(
                        fields
                            .iter()
                            .find(|(f, _)| f.as_slice() == arg(2))
                            .map(|(_, v)| bulk(v))
                            .unwrap_or(RespValue::Nil),
                    );
                }
                if resp3 {
                    value(RespValue::Map(
                        fields.iter().map(|(f, v)| (bulk(f), bulk(v))).collect(),
                    ))
                } else {
                    value(RespValue::Array(
                        fields.iter().flat_map(|(f, v)| [bulk(f), bulk(v)]).collect(),
                    ))
                }
            }
            b"FLUSHALL" => {
                self.data.clear();
                self.flush_tracking();
                ok()
            }
            b"PUBLISH" => value(RespValue::Integer(self.publish(arg(1), arg(2)))),
            b"SUBSCRIBE" | b"PSUBSCRIBE" | b"UNSUBSCRIBE" | b"PUNSUBSCRIBE" => {
                let kind = name.to_ascii_lowercase();
                self.subscription_frames(id, &kind, &args[1..])
            }
            b"CLUSTER" if arg(1).eq_ignore_ascii_case(b"SLOTS") => self.cluster_slots(),
            b"ROLE" => {
                let port = self.client(id).port;
                if self.replicas.contains(&port) {
                    value(resp_array![
                        "slave",
                        HOST,
                        RespValue::Integer(6379),
                        "connected",
                        RespValue::Integer(0)
                    ])
                } else {
                    value(resp_array![
                        "master",
                        RespValue::Integer(0),
                        RespValue::Array(vec![])
                    ])
                }
            }
            b"SENTINEL" => match &self.sentinel_master {
                Some((host, port)) => value(resp_array![host.as_str(), port.to_string()]),
                None => value(RespValue::Nil),
            },
            _ => err(&format!(
                "ERR unknown command '{}'",
                String::from_utf8_lossy(name)
            )),
        }
    }
}
