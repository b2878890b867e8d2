/*
 * Copyright 2020-2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

use std::cmp;

use bytes::{BufMut, BytesMut};

use crate::protocol::resp::RespValue;

const DEFAULT_MESSAGE_SIZE: usize = 1024;

fn check_and_reserve(buf: &mut BytesMut, amt: usize) {
    let remaining_bytes = buf.capacity() - buf.len();
    if remaining_bytes < amt {
        buf.reserve(cmp::max(amt, DEFAULT_MESSAGE_SIZE));
    }
}

fn write_rn(buf: &mut BytesMut) {
    buf.put_u8(b'\r');
    buf.put_u8(b'\n');
}

fn write_simple_string(symb: u8, string: &str, buf: &mut BytesMut) {
    let bytes = string.as_bytes();
    let size = 1 + bytes.len() + 2;
    check_and_reserve(buf, size);
    buf.put_u8(symb);
    buf.extend_from_slice(bytes);
    write_rn(buf);
}

fn write_header(symb: u8, len: i64, buf: &mut BytesMut) {
    let len_as_string = len.to_string();
    let len_as_bytes = len_as_string.as_bytes();
    let header_bytes = 1 + len_as_bytes.len() + 2;
    check_and_reserve(buf, header_bytes);
    buf.put_u8(symb);
    buf.extend_from_slice(len_as_bytes);
    write_rn(buf);
}

fn write_blob(symb: u8, bytes: &[u8], buf: &mut BytesMut) {
    let len = bytes.len();
    write_header(symb, len as i64, buf);
    check_and_reserve(buf, len + 2);
    buf.extend_from_slice(bytes);
    write_rn(buf);
}

fn encode_nil(buf: &mut BytesMut) {
    write_header(b'$', -1, buf);
}

fn encode_aggregate(symb: u8, ary: &[RespValue], buf: &mut BytesMut) {
    write_header(symb, ary.len() as i64, buf);
    for v in ary {
        encode(v, buf);
    }
}

fn encode_map(pairs: &[(RespValue, RespValue)], buf: &mut BytesMut) {
    write_header(b'%', pairs.len() as i64, buf);
    for (k, v) in pairs {
        encode(k, buf);
        encode(v, buf);
    }
}

fn encode_error(err: &str, buf: &mut BytesMut) {
    // Error lines cannot hold a line break, those are sent as blob errors instead
    if err.contains(['\r', '\n']) {
        write_blob(b'!', err.as_bytes(), buf);
    } else {
        write_simple_string(b'-', err, buf);
    }
}

fn encode_integer(val: i64, buf: &mut BytesMut) {
    // Simple integer are just the header
    write_header(b':', val, buf);
}

fn encode_double(val: f64, buf: &mut BytesMut) {
    let text = if val.is_nan() {
        "nan".to_string()
    } else if val.is_infinite() {
        if val > 0.0 { "inf" } else { "-inf" }.to_string()
    } else {
        val.to_string()
    };
    write_simple_string(b',', &text, buf);
}

fn encode_verbatim(format: &str, text: &[u8], buf: &mut BytesMut) {
    let mut payload = Vec::with_capacity(4 + text.len());
    payload.extend_from_slice(format.as_bytes());
    payload.push(b':');
    payload.extend_from_slice(text);
    write_blob(b'=', &payload, buf);
}

pub(crate) fn encode(msg: &RespValue, buf: &mut BytesMut) {
    match msg {
        RespValue::Nil => encode_nil(buf),
        RespValue::Array(ary) => encode_aggregate(b'*', ary, buf),
        RespValue::BulkString(bstr) => write_blob(b'$', bstr, buf),
        RespValue::Error(string) => encode_error(string, buf),
        RespValue::Integer(val) => encode_integer(*val, buf),
        RespValue::SimpleString(string) => write_simple_string(b'+', string, buf),
        RespValue::Map(pairs) => encode_map(pairs, buf),
        RespValue::Set(ary) => encode_aggregate(b'~', ary, buf),
        RespValue::Double(val) => encode_double(*val, buf),
        RespValue::Boolean(val) => write_simple_string(b'#', if *val { "t" } else { "f" }, buf),
        RespValue::BigNumber(digits) => write_simple_string(b'(', digits, buf),
        RespValue::Verbatim { format, text } => encode_verbatim(format, text, buf),
        RespValue::Push(ary) => encode_aggregate(b'>', ary, buf),
    }
}

/// The wire bytes of a single value
pub(crate) fn to_bytes(msg: &RespValue) -> Vec<u8> {
    let mut buf = BytesMut::new();
    encode(msg, &mut buf);
    buf.to_vec()
}
