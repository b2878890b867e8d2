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
use std::str;

use crate::{error::Error, protocol::resp::RespValue};

use super::Limits;

type DecodeResult = Result<Option<(usize, RespValue)>, Error>;

/// Pre-allocate at most this many elements for an aggregate, regardless of its declared size
const MAX_PREALLOCATE: usize = 1024;

#[inline]
fn parse_error(message: String) -> Error {
    Error::RESP(message, None)
}

/// Many RESP types have their length (which is either bytes or "number of elements", depending on context)
/// encoded as a string, terminated by "\r\n", this looks for them.
///
/// Only return the string if the whole sequence is complete, including the terminator bytes (but those final
/// two bytes will not be returned)
fn scan_integer(buf: &[u8], idx: usize) -> Result<Option<(usize, &[u8])>, Error> {
    let length = buf.len();
    let mut at_end = false;
    let mut pos = idx;
    loop {
        if length <= pos {
            return Ok(None);
        }
        match (at_end, buf[pos]) {
            (true, b'\n') => return Ok(Some((pos + 1, &buf[idx..pos - 1]))),
            (false, b'\r') => at_end = true,
            (false, b'0'..=b'9') => (),
            (false, b'-') => (),
            (_, val) => {
                return Err(parse_error(format!(
                    "Unexpected byte in size_string: {}",
                    val
                )));
            }
        }
        pos += 1;
    }
}

/// Find the next "\r\n" terminated line, returning the position after the terminator and the
/// line itself
fn scan_line(buf: &[u8], idx: usize) -> Option<(usize, &[u8])> {
    let length = buf.len();
    let mut at_end = false;
    let mut pos = idx;
    loop {
        if length <= pos {
            return None;
        }
        match (at_end, buf[pos]) {
            (true, b'\n') => return Some((pos + 1, &buf[idx..pos - 1])),
            (true, b'\r') => (),
            (true, _) => at_end = false,
            (false, b'\r') => at_end = true,
            (false, _) => (),
        }
        pos += 1;
    }
}

fn scan_string(buf: &[u8], idx: usize) -> Option<(usize, String)> {
    scan_line(buf, idx).map(|(pos, line)| (pos, String::from_utf8_lossy(line).into_owned()))
}

fn decode_raw_integer(buf: &[u8], idx: usize) -> Result<Option<(usize, i64)>, Error> {
    match scan_integer(buf, idx) {
        Ok(None) => Ok(None),
        Ok(Some((pos, int_str))) => {
            // Redis integers are transmitted as strings, so we first convert the raw bytes into a string...
            match str::from_utf8(int_str) {
                Ok(string) => {
                    // ...and then parse the string.
                    match string.parse() {
                        Ok(int) => Ok(Some((pos, int))),
                        Err(_) => Err(parse_error(format!("Not an integer: {}", string))),
                    }
                }
                Err(_) => Err(parse_error(format!("Not a valid string: {:?}", int_str))),
            }
        }
        Err(e) => Err(e),
    }
}

/// Reads a length-prefixed blob, used by bulk strings, blob errors and verbatim strings. The
/// null length (-1) yields `None` in the inner option.
#[allow(clippy::type_complexity)]
fn decode_blob<'a>(
    buf: &'a [u8],
    idx: usize,
    limits: &Limits,
) -> Result<Option<(usize, Option<&'a [u8]>)>, Error> {
    match decode_raw_integer(buf, idx)? {
        None => Ok(None),
        Some((pos, -1)) => Ok(Some((pos, None))),
        Some((pos, size)) if size >= 0 => {
            let size = size as usize;
            if size > limits.max_bulk_len {
                return Err(parse_error(format!(
                    "Bulk length {} exceeds limit of {}",
                    size, limits.max_bulk_len
                )));
            }
            let remaining = buf.len() - pos;
            let required_bytes = size + 2;

            if remaining < required_bytes {
                return Ok(None);
            }
            if &buf[pos + size..pos + required_bytes] != b"\r\n" {
                return Err(parse_error("Bulk string is not terminated by CRLF".into()));
            }

            Ok(Some((pos + required_bytes, Some(&buf[pos..(pos + size)]))))
        }
        Some((_, size)) => Err(parse_error(format!("Invalid string size: {}", size))),
    }
}

fn decode_bulk_string(buf: &[u8], idx: usize, limits: &Limits) -> DecodeResult {
    match decode_blob(buf, idx, limits)? {
        None => Ok(None),
        Some((pos, None)) => Ok(Some((pos, RespValue::Nil))),
        Some((pos, Some(bytes))) => Ok(Some((pos, RespValue::BulkString(bytes.to_vec())))),
    }
}

fn decode_blob_error(buf: &[u8], idx: usize, limits: &Limits) -> DecodeResult {
    match decode_blob(buf, idx, limits)? {
        None => Ok(None),
        Some((_, None)) => Err(parse_error("Blob error cannot be null".into())),
        Some((pos, Some(bytes))) => Ok(Some((
            pos,
            RespValue::Error(String::from_utf8_lossy(bytes).into_owned()),
        ))),
    }
}

fn decode_verbatim(buf: &[u8], idx: usize, limits: &Limits) -> DecodeResult {
    match decode_blob(buf, idx, limits)? {
        None => Ok(None),
        Some((pos, Some(bytes))) if bytes.len() >= 4 && bytes[3] == b':' => {
            let format = String::from_utf8_lossy(&bytes[..3]).into_owned();
            let text = bytes[4..].to_vec();
            Ok(Some((pos, RespValue::Verbatim { format, text })))
        }
        Some(_) => Err(parse_error("Malformed verbatim string".into())),
    }
}

/// Reads the element count of an aggregate type. `None` in the inner option is the null
/// aggregate, only valid for RESP2 arrays.
fn decode_count(
    buf: &[u8],
    idx: usize,
    limits: &Limits,
    depth: usize,
    allow_null: bool,
) -> Result<Option<(usize, Option<usize>)>, Error> {
    if depth >= limits.max_depth {
        return Err(parse_error(format!(
            "Aggregates nested deeper than {}",
            limits.max_depth
        )));
    }
    match decode_raw_integer(buf, idx)? {
        None => Ok(None),
        Some((pos, -1)) if allow_null => Ok(Some((pos, None))),
        Some((pos, size)) if size >= 0 => {
            let size = size as usize;
            if size > limits.max_elements {
                return Err(parse_error(format!(
                    "Aggregate of {} elements exceeds limit of {}",
                    size, limits.max_elements
                )));
            }
            Ok(Some((pos, Some(size))))
        }
        Some((_, size)) => Err(parse_error(format!("Invalid aggregate size: {}", size))),
    }
}

fn decode_elements(
    buf: &[u8],
    idx: usize,
    count: usize,
    limits: &Limits,
    depth: usize,
) -> Result<Option<(usize, Vec<RespValue>)>, Error> {
    let mut pos = idx;
    let mut values = Vec::with_capacity(cmp::min(count, MAX_PREALLOCATE));
    for _ in 0..count {
        match decode_value(buf, pos, limits, depth + 1)? {
            None => return Ok(None),
            Some((new_pos, value)) => {
                values.push(value);
                pos = new_pos;
            }
        }
    }
    Ok(Some((pos, values)))
}

fn decode_array(buf: &[u8], idx: usize, limits: &Limits, depth: usize) -> DecodeResult {
    match decode_count(buf, idx, limits, depth, true)? {
        None => Ok(None),
        Some((pos, None)) => Ok(Some((pos, RespValue::Nil))),
        Some((pos, Some(size))) => Ok(decode_elements(buf, pos, size, limits, depth)?
            .map(|(pos, values)| (pos, RespValue::Array(values)))),
    }
}

fn decode_set(buf: &[u8], idx: usize, limits: &Limits, depth: usize) -> DecodeResult {
    match decode_count(buf, idx, limits, depth, false)? {
        Some((pos, Some(size))) => Ok(decode_elements(buf, pos, size, limits, depth)?
            .map(|(pos, values)| (pos, RespValue::Set(values)))),
        _ => Ok(None),
    }
}

fn decode_push(buf: &[u8], idx: usize, limits: &Limits, depth: usize) -> DecodeResult {
    match decode_count(buf, idx, limits, depth, false)? {
        Some((pos, Some(size))) => Ok(decode_elements(buf, pos, size, limits, depth)?
            .map(|(pos, values)| (pos, RespValue::Push(values)))),
        _ => Ok(None),
    }
}

#[allow(clippy::type_complexity)]
fn decode_pairs(
    buf: &[u8],
    idx: usize,
    limits: &Limits,
    depth: usize,
) -> Result<Option<(usize, Vec<(RespValue, RespValue)>)>, Error> {
    let (pos, size) = match decode_count(buf, idx, limits, depth, false)? {
        Some((pos, Some(size))) => (pos, size),
        _ => return Ok(None),
    };
    match decode_elements(buf, pos, size.saturating_mul(2), limits, depth)? {
        None => Ok(None),
        Some((pos, values)) => {
            let mut pairs = Vec::with_capacity(size);
            let mut values = values.into_iter();
            while let (Some(k), Some(v)) = (values.next(), values.next()) {
                pairs.push((k, v));
            }
            Ok(Some((pos, pairs)))
        }
    }
}

fn decode_map(buf: &[u8], idx: usize, limits: &Limits, depth: usize) -> DecodeResult {
    Ok(decode_pairs(buf, idx, limits, depth)?.map(|(pos, pairs)| (pos, RespValue::Map(pairs))))
}

/// Attributes annotate the value that follows them, they are read and discarded
fn decode_attribute(buf: &[u8], idx: usize, limits: &Limits, depth: usize) -> DecodeResult {
    match decode_pairs(buf, idx, limits, depth)? {
        None => Ok(None),
        Some((pos, attributes)) => {
            log::trace!("Discarding {} RESP3 attribute(s)", attributes.len());
            decode_value(buf, pos, limits, depth)
        }
    }
}

fn decode_integer(buf: &[u8], idx: usize) -> DecodeResult {
    match decode_raw_integer(buf, idx) {
        Ok(None) => Ok(None),
        Ok(Some((pos, int))) => Ok(Some((pos, RespValue::Integer(int)))),
        Err(e) => Err(e),
    }
}

/// A simple string is any series of bytes that ends with `\r\n`
#[allow(clippy::unnecessary_wraps)]
fn decode_simple_string(buf: &[u8], idx: usize) -> DecodeResult {
    match scan_string(buf, idx) {
        None => Ok(None),
        Some((pos, string)) => Ok(Some((pos, RespValue::SimpleString(string)))),
    }
}

#[allow(clippy::unnecessary_wraps)]
fn decode_error(buf: &[u8], idx: usize) -> DecodeResult {
    match scan_string(buf, idx) {
        None => Ok(None),
        Some((pos, string)) => Ok(Some((pos, RespValue::Error(string)))),
    }
}

fn decode_null(buf: &[u8], idx: usize) -> DecodeResult {
    match scan_line(buf, idx) {
        None => Ok(None),
        Some((pos, b"")) => Ok(Some((pos, RespValue::Nil))),
        Some(_) => Err(parse_error("Null must not carry a payload".into())),
    }
}

fn decode_boolean(buf: &[u8], idx: usize) -> DecodeResult {
    match scan_line(buf, idx) {
        None => Ok(None),
        Some((pos, b"t")) => Ok(Some((pos, RespValue::Boolean(true)))),
        Some((pos, b"f")) => Ok(Some((pos, RespValue::Boolean(false)))),
        Some((_, other)) => Err(parse_error(format!("Not a boolean: {:?}", other))),
    }
}

fn decode_double(buf: &[u8], idx: usize) -> DecodeResult {
    match scan_line(buf, idx) {
        None => Ok(None),
        Some((pos, line)) => match str::from_utf8(line).map(str::parse::<f64>) {
            Ok(Ok(double)) => Ok(Some((pos, RespValue::Double(double)))),
            _ => Err(parse_error(format!("Not a double: {:?}", line))),
        },
    }
}

fn decode_big_number(buf: &[u8], idx: usize) -> DecodeResult {
    match scan_integer(buf, idx)? {
        None => Ok(None),
        Some((pos, digits)) => Ok(Some((
            pos,
            RespValue::BigNumber(String::from_utf8_lossy(digits).into_owned()),
        ))),
    }
}

/// Decode one complete value starting at `idx`. `Ok(None)` means more bytes are required, the
/// caller should retry from the same position once they arrive; nothing is consumed until a
/// whole value is available.
pub(crate) fn decode(buf: &[u8], idx: usize, limits: &Limits) -> DecodeResult {
    decode_value(buf, idx, limits, 0)
}

/// `depth` is the number of aggregates enclosing the value at `idx`
fn decode_value(buf: &[u8], idx: usize, limits: &Limits, depth: usize) -> DecodeResult {
    let length = buf.len();
    if length <= idx {
        return Ok(None);
    }

    let first_byte = buf[idx];
    match first_byte {
        b'$' => decode_bulk_string(buf, idx + 1, limits),
        b'*' => decode_array(buf, idx + 1, limits, depth),
        b':' => decode_integer(buf, idx + 1),
        b'+' => decode_simple_string(buf, idx + 1),
        b'-' => decode_error(buf, idx + 1),
        b'_' => decode_null(buf, idx + 1),
        b'#' => decode_boolean(buf, idx + 1),
        b',' => decode_double(buf, idx + 1),
        b'(' => decode_big_number(buf, idx + 1),
        b'!' => decode_blob_error(buf, idx + 1, limits),
        b'=' => decode_verbatim(buf, idx + 1, limits),
        b'%' => decode_map(buf, idx + 1, limits, depth),
        b'~' => decode_set(buf, idx + 1, limits, depth),
        b'>' => decode_push(buf, idx + 1, limits, depth),
        b'|' => decode_attribute(buf, idx + 1, limits, depth),
        _ => Err(parse_error(format!("Unexpected byte: {}", first_byte))),
    }
}
