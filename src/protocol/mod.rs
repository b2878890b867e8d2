/*
 * Copyright 2020-2024 Ben Ashford
 *
 * Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
 * http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
 * <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
 * option. This file may not be copied, modified, or distributed
 * except according to those terms.
 */

//! The RESP wire protocol: values, conversions, framing and command metadata.

#[macro_use]
pub mod resp;

pub(crate) mod codec;
pub(crate) mod command;

pub use codec::RespCodec;

pub use resp::{FromResp, RespValue};

/// The protocol version negotiated with the server during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    #[default]
    Resp2,
    /// Negotiated with `HELLO 3`, enables maps, sets, doubles, booleans and push messages
    Resp3,
}
