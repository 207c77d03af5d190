//! Datagram wire protocol
//!
//! Every datagram is one frame: a signed `kind` byte, a big-endian request
//! id, and a bincode body. Positive kinds are requests, zero is a success
//! response, negative kinds are application-level error responses carrying
//! the code itself.
//!
//! GET/PUBLISH/DOWNLOAD parameters travel as raw bytes rather than typed
//! values so that a syntactically invalid id or signature still reaches the
//! request handler; the protocol answers those with [`ERROR_PARAM`] instead
//! of dropping them on the floor.

use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::crypto::Signature;

pub const MSG_RESPONSE: i8 = 0;
pub const MSG_PING: i8 = 1;
pub const MSG_GET: i8 = 2;
pub const MSG_PUBLISH: i8 = 3;
pub const MSG_DOWNLOAD: i8 = 4;

pub const ERROR_UNKNOWN: i8 = -1;
pub const ERROR_PARAM: i8 = -2;
pub const ERROR_NOT_FOUND: i8 = -3;

/// Request id correlating a request with its replies
pub type Rid = u16;

const HEADER_SIZE: usize = 3;

/// Errors that can occur encoding or decoding datagrams
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("datagram shorter than the frame header")]
    Truncated,
    #[error("malformed frame body: {0}")]
    Body(#[from] bincode::Error),
}

/// An inbound or outbound request
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Ping,
    /// Look up the current signature for a variable id (raw bytes,
    /// validated by the handler)
    Get { id: Vec<u8> },
    /// Offer a signature to the remote (raw envelope bytes)
    Publish { signature: Vec<u8> },
    /// Ask the remote to stream the value matching a signature
    Download { signature: Vec<u8> },
}

impl Request {
    pub fn kind(&self) -> i8 {
        match self {
            Request::Ping => MSG_PING,
            Request::Get { .. } => MSG_GET,
            Request::Publish { .. } => MSG_PUBLISH,
            Request::Download { .. } => MSG_DOWNLOAD,
        }
    }
}

/// Payload of a success response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Empty,
    Signature(Signature),
    /// One fragment of a value transfer; a download produces a run of these
    /// under a single rid
    Chunk { offset: u64, data: Vec<u8> },
}

/// One decoded datagram
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request { rid: Rid, request: Request },
    Response { rid: Rid, reply: Reply },
    Error { rid: Rid, code: i8, message: Option<String> },
    /// A positive kind this implementation does not recognize; answered
    /// with [`ERROR_UNKNOWN`]
    Unknown { rid: Rid, kind: i8 },
}

impl Frame {
    pub fn rid(&self) -> Rid {
        match self {
            Frame::Request { rid, .. }
            | Frame::Response { rid, .. }
            | Frame::Error { rid, .. }
            | Frame::Unknown { rid, .. } => *rid,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + 64);
        match self {
            Frame::Request { rid, request } => {
                buf.put_i8(request.kind());
                buf.put_u16(*rid);
                match request {
                    Request::Ping => {}
                    Request::Get { id } => buf.extend_from_slice(&bincode::serialize(id)?),
                    Request::Publish { signature } | Request::Download { signature } => {
                        buf.extend_from_slice(&bincode::serialize(signature)?)
                    }
                }
            }
            Frame::Response { rid, reply } => {
                buf.put_i8(MSG_RESPONSE);
                buf.put_u16(*rid);
                buf.extend_from_slice(&bincode::serialize(reply)?);
            }
            Frame::Error { rid, code, message } => {
                buf.put_i8(*code);
                buf.put_u16(*rid);
                buf.extend_from_slice(&bincode::serialize(message)?);
            }
            Frame::Unknown { rid, kind } => {
                buf.put_i8(*kind);
                buf.put_u16(*rid);
            }
        }
        Ok(buf.to_vec())
    }

    pub fn decode(buffer: &[u8]) -> Result<Frame, WireError> {
        if buffer.len() < HEADER_SIZE {
            return Err(WireError::Truncated);
        }
        let kind = buffer[0] as i8;
        let rid = u16::from_be_bytes([buffer[1], buffer[2]]);
        let body = &buffer[HEADER_SIZE..];

        let frame = match kind {
            MSG_RESPONSE => Frame::Response {
                rid,
                reply: bincode::deserialize(body)?,
            },
            MSG_PING => Frame::Request {
                rid,
                request: Request::Ping,
            },
            MSG_GET => Frame::Request {
                rid,
                request: Request::Get {
                    id: bincode::deserialize(body)?,
                },
            },
            MSG_PUBLISH => Frame::Request {
                rid,
                request: Request::Publish {
                    signature: bincode::deserialize(body)?,
                },
            },
            MSG_DOWNLOAD => Frame::Request {
                rid,
                request: Request::Download {
                    signature: bincode::deserialize(body)?,
                },
            },
            k if k > 0 => Frame::Unknown { rid, kind: k },
            // negative: an error response; a missing or garbled message
            // field degrades to no message rather than dropping the frame
            k => Frame::Error {
                rid,
                code: k,
                message: bincode::deserialize(body).unwrap_or(None),
            },
        };
        Ok(frame)
    }
}

/// Encode an application value for hashing, publishing and transfer
pub fn encode_value<V: Serialize>(value: &V) -> Result<Bytes, WireError> {
    Ok(Bytes::from(bincode::serialize(value)?))
}

/// Decode an application value fetched from a peer
pub fn decode_value<V: DeserializeOwned>(bytes: &[u8]) -> Result<V, WireError> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::{sha256, SecretKey, Signature, Timestamp};

    fn round_trip(frame: Frame) -> Frame {
        Frame::decode(&frame.encode().unwrap()).unwrap()
    }

    #[test]
    fn test_request_round_trips() {
        let requests = vec![
            Request::Ping,
            Request::Get {
                id: vec![7u8; 33],
            },
            Request::Publish {
                signature: vec![1, 2, 3],
            },
            Request::Download {
                signature: vec![9u8; 137],
            },
        ];

        for request in requests {
            let frame = Frame::Request { rid: 0x1234, request };
            assert_eq!(round_trip(frame.clone()), frame);
        }
    }

    #[test]
    fn test_response_round_trips() {
        let secret = SecretKey::generate();
        let signature = Signature::sign(&secret, sha256(b"v"), Timestamp::now());

        let replies = vec![
            Reply::Empty,
            Reply::Signature(signature),
            Reply::Chunk {
                offset: 500,
                data: b"fragment".to_vec(),
            },
        ];

        for reply in replies {
            let frame = Frame::Response { rid: 42, reply };
            assert_eq!(round_trip(frame.clone()), frame);
        }
    }

    #[test]
    fn test_error_round_trips() {
        let with_message = Frame::Error {
            rid: 7,
            code: ERROR_PARAM,
            message: Some("Invalid `id` param".into()),
        };
        assert_eq!(round_trip(with_message.clone()), with_message);

        let without_message = Frame::Error {
            rid: 7,
            code: ERROR_NOT_FOUND,
            message: None,
        };
        assert_eq!(round_trip(without_message.clone()), without_message);
    }

    #[test]
    fn test_unrecognized_kind_decodes_as_unknown() {
        let frame = Frame::Unknown { rid: 3, kind: 9 };
        assert_eq!(round_trip(frame.clone()), frame);
    }

    #[test]
    fn test_truncated_datagram_rejected() {
        assert!(matches!(Frame::decode(&[1, 0]), Err(WireError::Truncated)));
        assert!(matches!(Frame::decode(&[]), Err(WireError::Truncated)));
    }

    #[test]
    fn test_garbage_body_rejected() {
        // kind 0 (response) with a body that is not a valid Reply
        let mut buf = vec![0u8, 0, 1];
        buf.extend_from_slice(&[0xff; 3]);
        assert!(Frame::decode(&buf).is_err());
    }

    #[test]
    fn test_value_codec() {
        let value = vec!["a".to_string(), "b".to_string()];
        let bytes = encode_value(&value).unwrap();
        let decoded: Vec<String> = decode_value(&bytes).unwrap();
        assert_eq!(decoded, value);
    }
}
