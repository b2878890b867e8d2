/*
 * Copyright 2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! Command metadata: where the keys of a request are, and whether its reply may be cached.

use std::str;

use super::resp::RespValue;

/// Positions of the keys among a command's arguments, the command name is argument zero
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeySpec {
    None,
    /// Keys from `first` to `last` (negative counts back from the end) every `step` arguments
    Range { first: usize, last: isize, step: usize },
    /// The argument at `at` holds the number of keys that follow it, optionally preceded by a
    /// destination key at position 1
    NumKeys { at: usize, dest: bool },
    /// `XREAD`-style: keys are the first half of the arguments after `STREAMS`
    Streams,
}

#[derive(Debug, Clone, Copy)]
struct CommandInfo {
    keys: KeySpec,
    cacheable: bool,
}

const fn range(first: usize, last: isize, step: usize) -> KeySpec {
    KeySpec::Range { first, last, step }
}

const FIRST: KeySpec = range(1, 1, 1);
const ALL: KeySpec = range(1, -1, 1);

fn lookup(name: &[u8]) -> CommandInfo {
    let (keys, cacheable) = match name {
        // Reads that server-assisted tracking can invalidate
        b"GET" | b"STRLEN" | b"GETRANGE" | b"GETBIT" | b"BITCOUNT" | b"TYPE" | b"HGET"
        | b"HGETALL" | b"HMGET" | b"HEXISTS" | b"HKEYS" | b"HVALS" | b"HLEN" | b"HSTRLEN"
        | b"LRANGE" | b"LLEN" | b"LINDEX" | b"LPOS" | b"SMEMBERS" | b"SISMEMBER" | b"SMISMEMBER"
        | b"SCARD" | b"ZRANGE" | b"ZRANGEBYSCORE" | b"ZREVRANGE" | b"ZREVRANGEBYSCORE"
        | b"ZSCORE" | b"ZMSCORE" | b"ZCARD" | b"ZRANK" | b"ZREVRANK" | b"ZCOUNT" | b"XRANGE"
        | b"XREVRANGE" | b"XLEN" => (FIRST, true),
        b"MGET" | b"EXISTS" => (ALL, true),

        b"SET" | b"SETNX" | b"SETEX" | b"PSETEX" | b"GETSET" | b"GETDEL" | b"GETEX"
        | b"APPEND" | b"INCR" | b"DECR" | b"INCRBY" | b"DECRBY" | b"INCRBYFLOAT" | b"SETRANGE"
        | b"SETBIT" | b"EXPIRE" | b"PEXPIRE" | b"EXPIREAT" | b"PEXPIREAT" | b"TTL" | b"PTTL"
        | b"PERSIST" | b"DUMP" | b"RESTORE" | b"HSET" | b"HMSET" | b"HSETNX" | b"HDEL"
        | b"HINCRBY" | b"HINCRBYFLOAT" | b"HSCAN" | b"HRANDFIELD" | b"LPUSH" | b"RPUSH"
        | b"LPUSHX" | b"RPUSHX" | b"LPOP" | b"RPOP" | b"LSET" | b"LREM" | b"LTRIM"
        | b"LINSERT" | b"SADD" | b"SREM" | b"SPOP" | b"SRANDMEMBER" | b"SSCAN" | b"ZADD"
        | b"ZREM" | b"ZINCRBY" | b"ZPOPMIN" | b"ZPOPMAX" | b"ZREMRANGEBYSCORE"
        | b"ZREMRANGEBYRANK" | b"ZRANDMEMBER" | b"ZSCAN" | b"XADD" | b"XDEL" | b"XTRIM"
        | b"XACK" | b"XCLAIM" | b"XAUTOCLAIM" | b"XPENDING" | b"PFADD" => (FIRST, false),

        b"DEL" | b"UNLINK" | b"TOUCH" | b"WATCH" | b"SUNION" | b"SINTER" | b"SDIFF"
        | b"SUNIONSTORE" | b"SINTERSTORE" | b"SDIFFSTORE" | b"PFCOUNT" | b"PFMERGE" => {
            (ALL, false)
        }
        b"MSET" | b"MSETNX" => (range(1, -1, 2), false),
        b"RENAME" | b"RENAMENX" | b"RPOPLPUSH" | b"BRPOPLPUSH" | b"LMOVE" | b"BLMOVE"
        | b"SMOVE" | b"COPY" => (range(1, 2, 1), false),
        b"BLPOP" | b"BRPOP" | b"BZPOPMIN" | b"BZPOPMAX" => (range(1, -2, 1), false),
        b"XGROUP" => (range(2, 2, 1), false),

        b"EVAL" | b"EVALSHA" | b"EVAL_RO" | b"EVALSHA_RO" | b"FCALL" | b"FCALL_RO" => {
            (KeySpec::NumKeys { at: 2, dest: false }, false)
        }
        b"ZUNIONSTORE" | b"ZINTERSTORE" | b"ZDIFFSTORE" => {
            (KeySpec::NumKeys { at: 2, dest: true }, false)
        }
        b"ZUNION" | b"ZINTER" | b"ZDIFF" | b"SINTERCARD" | b"ZINTERCARD" | b"LMPOP"
        | b"ZMPOP" => (KeySpec::NumKeys { at: 1, dest: false }, false),
        b"XREAD" | b"XREADGROUP" => (KeySpec::Streams, false),

        _ => (KeySpec::None, false),
    };
    CommandInfo { keys, cacheable }
}

fn parse_count(value: &RespValue) -> Option<usize> {
    match value {
        RespValue::Integer(i) => usize::try_from(*i).ok(),
        other => other
            .as_bytes()
            .and_then(|bytes| str::from_utf8(bytes).ok())
            .and_then(|s| s.parse().ok()),
    }
}

fn args_of(request: &RespValue) -> &[RespValue] {
    match request {
        RespValue::Array(args) => args,
        _ => &[],
    }
}

/// The keys a request touches, in argument order. Unknown commands have no keys.
pub(crate) fn keys(request: &RespValue) -> Vec<&[u8]> {
    let args = args_of(request);
    let name = match request.command_name() {
        Some(name) => name,
        None => return Vec::new(),
    };
    let positions: Vec<usize> = match lookup(&name).keys {
        KeySpec::None => Vec::new(),
        KeySpec::Range { first, last, step } => {
            let last = if last < 0 {
                args.len() as isize + last
            } else {
                last
            };
            if last < first as isize {
                Vec::new()
            } else {
                (first..=last as usize).step_by(step).collect()
            }
        }
        KeySpec::NumKeys { at, dest } => {
            let mut positions = Vec::new();
            if dest {
                positions.push(1);
            }
            // The count is caller input, only arguments actually present are keys
            if let Some(count) = args.get(at).and_then(parse_count) {
                let end = (at + 1).saturating_add(count).min(args.len());
                positions.extend(at + 1..end);
            }
            positions
        }
        KeySpec::Streams => {
            let streams = args.iter().position(|arg| {
                arg.as_bytes()
                    .map(|bytes| bytes.eq_ignore_ascii_case(b"STREAMS"))
                    .unwrap_or(false)
            });
            match streams {
                Some(idx) => {
                    let rest = args.len() - idx - 1;
                    (idx + 1..idx + 1 + rest / 2).collect()
                }
                None => Vec::new(),
            }
        }
    };
    positions
        .into_iter()
        .filter_map(|pos| args.get(pos).and_then(RespValue::as_bytes))
        .collect()
}

/// Whether the reply to this request may be stored in the client-side cache
pub(crate) fn is_cacheable(request: &RespValue) -> bool {
    match request.command_name() {
        Some(name) => lookup(&name).cacheable && !keys(request).is_empty(),
        None => false,
    }
}
