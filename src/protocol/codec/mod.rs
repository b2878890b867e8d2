/*
 * Copyright 2020-2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

use bytes::{Buf, BytesMut};

use tokio_util::codec::{Decoder, Encoder};

use crate::{error::Error, protocol::resp::RespValue};

mod decode;
mod encode;

pub(crate) use encode::to_bytes;

const DEFAULT_MAX_BULK_LEN: usize = 512 * 1024 * 1024;
const DEFAULT_MAX_ELEMENTS: usize = 1 << 24;
const DEFAULT_MAX_DEPTH: usize = 128;

/// Upper bounds on declared lengths and on aggregate nesting, a frame exceeding them is
/// rejected before any of it is buffered
#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    pub(crate) max_bulk_len: usize,
    pub(crate) max_elements: usize,
    pub(crate) max_depth: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_bulk_len: DEFAULT_MAX_BULK_LEN,
            max_elements: DEFAULT_MAX_ELEMENTS,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// Codec to read and write RESP2 and RESP3 frames.
///
/// Decoding is incremental: a partial frame leaves the buffer untouched, so the same value is
/// produced however the bytes were split across reads.
#[derive(Debug, Clone, Default)]
pub struct RespCodec {
    limits: Limits,
}

impl RespCodec {
    /// A codec with custom limits on bulk string length and aggregate element count
    pub fn with_limits(max_bulk_len: usize, max_elements: usize) -> Self {
        RespCodec {
            limits: Limits {
                max_bulk_len,
                max_elements,
                max_depth: DEFAULT_MAX_DEPTH,
            },
        }
    }

    /// Limit how deeply aggregates may be nested inside one another
    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.limits.max_depth = max_depth;
        self
    }
}

impl Decoder for RespCodec {
    type Item = RespValue;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match decode::decode(buf, 0, &self.limits) {
            Ok(None) => Ok(None),
            Ok(Some((pos, item))) => {
                buf.advance(pos);
                Ok(Some(item))
            }
            Err(e) => Err(e),
        }
    }
}

impl Encoder<RespValue> for RespCodec {
    type Error = Error;

    fn encode(&mut self, msg: RespValue, buf: &mut BytesMut) -> Result<(), Self::Error> {
        encode::encode(&msg, buf);
        Ok(())
    }
}
