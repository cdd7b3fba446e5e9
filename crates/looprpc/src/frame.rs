//! # Wire Frames
//!
//! Protobuf messages exchanged over a transport. Every transport message is
//! exactly one encoded `Frame`.
//!
//! ## Protocol
//!
//! - The client sends `Call`, optionally `Cancel`.
//! - The server answers each call with exactly one `Reply`. Streaming calls
//!   first yield any number of `StreamItem`s carrying the same `seq`.
//! - A `Reply` with a non-zero `code` is a failure; `message` explains it.

use std::collections::HashMap;

use prost::Message;

use crate::metadata::Metadata;
use crate::status::Code;
use crate::status::Status;

#[derive(Clone, PartialEq, prost::Message)]
pub struct Frame {
    #[prost(oneof = "Kind", tags = "1, 2, 3, 4")]
    pub kind: Option<Kind>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum Kind {
    #[prost(message, tag = "1")]
    Call(CallFrame),
    #[prost(message, tag = "2")]
    Reply(ReplyFrame),
    #[prost(message, tag = "3")]
    StreamItem(StreamItemFrame),
    #[prost(message, tag = "4")]
    Cancel(CancelFrame),
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CallFrame {
    #[prost(uint64, tag = "1")]
    pub seq: u64,
    #[prost(string, tag = "2")]
    pub method: String,
    #[prost(map = "string, string", tag = "3")]
    pub metadata: HashMap<String, String>,
    #[prost(bytes = "vec", tag = "4")]
    pub payload: Vec<u8>,
    #[prost(bool, tag = "5")]
    pub streaming: bool,
    /// Remaining caller budget in milliseconds; zero means no deadline.
    #[prost(uint64, tag = "6")]
    pub timeout_ms: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ReplyFrame {
    #[prost(uint64, tag = "1")]
    pub seq: u64,
    #[prost(int32, tag = "2")]
    pub code: i32,
    #[prost(string, tag = "3")]
    pub message: String,
    #[prost(bytes = "vec", tag = "4")]
    pub payload: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct StreamItemFrame {
    #[prost(uint64, tag = "1")]
    pub seq: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct CancelFrame {
    #[prost(uint64, tag = "1")]
    pub seq: u64,
}

/// Broker side-channel announcement: "endpoint `service_id` is listening at
/// `address`", or with `withdrawn` set, "it no longer is".
#[derive(Clone, PartialEq, prost::Message)]
pub struct ConnInfo {
    #[prost(uint32, tag = "1")]
    pub service_id: u32,
    #[prost(string, tag = "2")]
    pub network: String,
    #[prost(string, tag = "3")]
    pub address: String,
    #[prost(bool, tag = "4")]
    pub withdrawn: bool,
}

impl Frame {
    pub fn call(seq: u64, method: &str, metadata: Metadata, payload: Vec<u8>, streaming: bool, timeout_ms: u64) -> Self {
        Self {
            kind: Some(Kind::Call(CallFrame {
                seq,
                method: method.to_string(),
                metadata: metadata.into(),
                payload,
                streaming,
                timeout_ms,
            })),
        }
    }

    pub fn reply(seq: u64, result: Result<Vec<u8>, Status>) -> Self {
        let reply = match result {
            Ok(payload) => ReplyFrame {
                seq,
                code: Code::Ok.as_i32(),
                message: String::new(),
                payload,
            },
            Err(status) => ReplyFrame {
                seq,
                code: status.code().as_i32(),
                message: status.message().to_string(),
                payload: Vec::new(),
            },
        };
        Self { kind: Some(Kind::Reply(reply)) }
    }

    pub fn stream_item(seq: u64, payload: Vec<u8>) -> Self {
        Self {
            kind: Some(Kind::StreamItem(StreamItemFrame { seq, payload })),
        }
    }

    pub fn cancel(seq: u64) -> Self {
        Self {
            kind: Some(Kind::Cancel(CancelFrame { seq })),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// Decodes one frame. Malformed bytes and empty frames are protocol violations.
    pub fn from_bytes(bytes: &[u8]) -> Result<Kind, Status> {
        let frame = Frame::decode(bytes)
            .map_err(|e| Status::internal(format!("malformed frame: {e}")))?;
        frame
            .kind
            .ok_or_else(|| Status::internal("frame without a kind"))
    }
}

impl ReplyFrame {
    /// Splits a reply into the caller-facing result.
    pub fn into_result(self) -> Result<Vec<u8>, Status> {
        match Code::from_i32(self.code) {
            Code::Ok => Ok(self.payload),
            code => Err(Status::new(code, self.message)),
        }
    }
}
