//! ## JSON-RPC 2.0 envelope codec
//!
//! [JSON-RPC 2.0]: https://www.jsonrpc.org/specification
//!
//! Every frame exchanged between fabric nodes is a [JSON-RPC 2.0] object
//! carried in a websocket text frame.  A Request object carries `method`
//! and an optional `params` structure; the Server replies with a Response
//! object carrying either `result` or `error`, never both, correlated by
//! the `id` member echoed from the Request.
//!
//! The fabric always generates string ids and preserves them verbatim when
//! a request is relayed toward another node, so responses find their way
//! back along the reverse path without additional bookkeeping.

pub mod message;

pub use self::message::{Request, Response, RpcError};

use std::str::Utf8Error;

/// "The method does not exist / is not available."
pub const METHOD_NOT_FOUND: i64 = -32601;

/// "Invalid method parameter(s)."
pub const INVALID_PARAMS: i64 = -32602;

/// "Internal JSON-RPC error."
pub const INTERNAL_ERROR: i64 = -32603;

/// "Invalid JSON was received by the server."
pub const PARSE_ERROR: i64 = -32700;

#[derive(Debug)]
pub enum Error {
    InvalidJson,
    UnexpectedPayload,
    Utf8Error(Utf8Error),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<Utf8Error> for Error {
    fn from(value: Utf8Error) -> Self {
        Self::Utf8Error(value)
    }
}

impl From<serde_json::Error> for Error {
    fn from(_: serde_json::Error) -> Self {
        Self::InvalidJson
    }
}

/// A classified inbound frame.
///
/// A frame with a `method` member is a request, a frame with a `result` or
/// `error` member is a response, anything else is rejected.
#[derive(Debug)]
pub enum Payload {
    Request(Request),
    Response(Response),
}

/// Decode one complete text frame.
///
/// ```
/// use blade_server_codec::{decode, Payload};
///
/// let frame = r#"{"jsonrpc":"2.0","id":"1","method":"blade.register","params":{"nodeid":"n"}}"#;
/// assert!(matches!(decode(frame), Ok(Payload::Request(_))));
///
/// let frame = r#"{"jsonrpc":"2.0","id":"1","result":{}}"#;
/// assert!(matches!(decode(frame), Ok(Payload::Response(_))));
/// ```
pub fn decode(frame: &str) -> Result<Payload, Error> {
    let value: serde_json::Value = serde_json::from_str(frame)?;
    let object = value.as_object().ok_or(Error::UnexpectedPayload)?;

    if object.contains_key("method") {
        Ok(Payload::Request(serde_json::from_value(value)?))
    } else if object.contains_key("result") || object.contains_key("error") {
        Ok(Payload::Response(serde_json::from_value(value)?))
    } else {
        Err(Error::UnexpectedPayload)
    }
}

/// Encode a request or response to a text frame.
pub fn encode<T: serde::Serialize>(message: &T) -> Result<String, Error> {
    Ok(serde_json::to_string(message)?)
}
