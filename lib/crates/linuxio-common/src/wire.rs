//! Length-framed IPC transport shared by the bridge and the webserver-side
//! client.
//!
//! Two framings coexist on one AF_UNIX connection and are multiplexed by a
//! one-byte kind tag that follows the length prefix:
//!
//! ```text
//! frame    := len:u32be  kind:u8  body[len-1]
//! kind 0x01  request    (JSON)
//! kind 0x02  response   (JSON)
//! kind 0x10  stream     (opcode:u8  stream_id:u32be  payload)
//! ```
//!
//! Readers reject any frame whose declared length exceeds the cap for its
//! kind by returning a `Transport` error; the connection owner closes the
//! socket without an error frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;

/// Cap on a request/response frame body.
pub const REQUEST_FRAME_MAX: usize = 16 * 1024 * 1024;
/// Cap on a single stream chunk payload.
pub const STREAM_FRAME_MAX: usize = 1024 * 1024;

const KIND_REQUEST: u8 = 0x01;
const KIND_RESPONSE: u8 = 0x02;
const KIND_STREAM: u8 = 0x10;

/// Bytes of stream framing ahead of the payload: opcode + stream id.
const STREAM_HEADER: usize = 5;

/// Namespace reserved for the mandatory first frame on a connection.
pub const AUTH_NAMESPACE: &str = "auth";
/// Namespace that opens a stream instead of running a command.
pub const STREAM_NAMESPACE: &str = "stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOpcode {
    Data,
    Progress,
    ResultOk,
    ResultErr,
    StreamClose,
}

impl StreamOpcode {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(StreamOpcode::Data),
            2 => Some(StreamOpcode::Progress),
            3 => Some(StreamOpcode::ResultOk),
            4 => Some(StreamOpcode::ResultErr),
            5 => Some(StreamOpcode::StreamClose),
            _ => None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            StreamOpcode::Data => 1,
            StreamOpcode::Progress => 2,
            StreamOpcode::ResultOk => 3,
            StreamOpcode::ResultErr => 4,
            StreamOpcode::StreamClose => 5,
        }
    }
}

/// A command or stream-open request.
///
/// `namespace` is serialized as `type` on the wire; `auth` and `stream` are
/// reserved namespaces handled by the connection itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub namespace: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub id: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseError {
    pub message: String,
    pub code: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl Response {
    #[must_use]
    pub fn success(id: u64, payload: serde_json::Value) -> Self {
        Response {
            id,
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    #[must_use]
    pub fn failure(id: u64, message: impl Into<String>, code: u16) -> Self {
        Response {
            id,
            ok: false,
            payload: None,
            error: Some(ResponseError {
                message: message.into(),
                code,
            }),
        }
    }

    #[must_use]
    pub fn from_error(id: u64, err: &Error) -> Self {
        Response::failure(id, err.to_string(), err.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFrame {
    pub opcode: StreamOpcode,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl StreamFrame {
    #[must_use]
    pub fn data(stream_id: u32, payload: impl Into<Bytes>) -> Self {
        StreamFrame {
            opcode: StreamOpcode::Data,
            stream_id,
            payload: payload.into(),
        }
    }

    /// PROGRESS frame carrying a JSON payload.
    #[must_use]
    pub fn progress(stream_id: u32, payload: &serde_json::Value) -> Self {
        StreamFrame {
            opcode: StreamOpcode::Progress,
            stream_id,
            payload: Bytes::from(payload.to_string()),
        }
    }

    #[must_use]
    pub fn result_ok(stream_id: u32, payload: &serde_json::Value) -> Self {
        StreamFrame {
            opcode: StreamOpcode::ResultOk,
            stream_id,
            payload: Bytes::from(payload.to_string()),
        }
    }

    #[must_use]
    pub fn result_err(stream_id: u32, message: &str, code: u16) -> Self {
        let body = serde_json::json!({ "message": message, "code": code });
        StreamFrame {
            opcode: StreamOpcode::ResultErr,
            stream_id,
            payload: Bytes::from(body.to_string()),
        }
    }

    #[must_use]
    pub fn close(stream_id: u32) -> Self {
        StreamFrame {
            opcode: StreamOpcode::StreamClose,
            stream_id,
            payload: Bytes::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request(Request),
    Response(Response),
    Stream(StreamFrame),
}

/// Codec implementing the framing above for `tokio_util::codec::Framed`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Error> {
        if src.len() < 5 {
            return Ok(None);
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&src[..4]);
        let declared = u32::from_be_bytes(len_bytes) as usize;
        let kind = src[4];
        if declared == 0 {
            return Err(Error::Transport("zero-length frame".to_string()));
        }
        let body_len = declared - 1;

        // Enforce the cap on the declared length before buffering the body,
        // so a hostile peer cannot make us allocate it.
        match kind {
            KIND_REQUEST | KIND_RESPONSE => {
                if body_len > REQUEST_FRAME_MAX {
                    return Err(Error::Transport(format!(
                        "request frame of {body_len} bytes exceeds cap"
                    )));
                }
            }
            KIND_STREAM => {
                if body_len > STREAM_FRAME_MAX + STREAM_HEADER {
                    return Err(Error::Transport(format!(
                        "stream frame of {body_len} bytes exceeds cap"
                    )));
                }
            }
            other => {
                return Err(Error::Transport(format!(
                    "unknown frame kind {other:#04x}"
                )));
            }
        }

        if src.len() < 4 + declared {
            src.reserve(4 + declared - src.len());
            return Ok(None);
        }
        src.advance(5);
        let body = src.split_to(body_len).freeze();

        match kind {
            KIND_REQUEST => {
                let req: Request = serde_json::from_slice(&body)
                    .map_err(|e| Error::Transport(format!("malformed request frame: {e}")))?;
                Ok(Some(Frame::Request(req)))
            }
            KIND_RESPONSE => {
                let resp: Response = serde_json::from_slice(&body)
                    .map_err(|e| Error::Transport(format!("malformed response frame: {e}")))?;
                Ok(Some(Frame::Response(resp)))
            }
            _ => {
                if body.len() < STREAM_HEADER {
                    return Err(Error::Transport("truncated stream frame".to_string()));
                }
                let opcode = StreamOpcode::from_u8(body[0]).ok_or_else(|| {
                    Error::Transport(format!("unknown stream opcode {:#04x}", body[0]))
                })?;
                let mut id_bytes = [0u8; 4];
                id_bytes.copy_from_slice(&body[1..5]);
                Ok(Some(Frame::Stream(StreamFrame {
                    opcode,
                    stream_id: u32::from_be_bytes(id_bytes),
                    payload: body.slice(STREAM_HEADER..),
                })))
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Error> {
        match item {
            Frame::Request(req) => {
                let body = serde_json::to_vec(&req)
                    .map_err(|e| Error::Transport(format!("encoding request: {e}")))?;
                encode_json(KIND_REQUEST, &body, dst)
            }
            Frame::Response(resp) => {
                let body = serde_json::to_vec(&resp)
                    .map_err(|e| Error::Transport(format!("encoding response: {e}")))?;
                encode_json(KIND_RESPONSE, &body, dst)
            }
            Frame::Stream(frame) => {
                if frame.payload.len() > STREAM_FRAME_MAX {
                    return Err(Error::Transport(format!(
                        "stream payload of {} bytes exceeds cap",
                        frame.payload.len()
                    )));
                }
                let declared = 1 + STREAM_HEADER + frame.payload.len();
                dst.reserve(4 + declared);
                #[allow(clippy::cast_possible_truncation)]
                dst.put_u32(declared as u32);
                dst.put_u8(KIND_STREAM);
                dst.put_u8(frame.opcode.as_u8());
                dst.put_u32(frame.stream_id);
                dst.put_slice(&frame.payload);
                Ok(())
            }
        }
    }
}

fn encode_json(kind: u8, body: &[u8], dst: &mut BytesMut) -> Result<(), Error> {
    if body.len() > REQUEST_FRAME_MAX {
        return Err(Error::Transport(format!(
            "frame body of {} bytes exceeds cap",
            body.len()
        )));
    }
    let declared = 1 + body.len();
    dst.reserve(4 + declared);
    #[allow(clippy::cast_possible_truncation)]
    dst.put_u32(declared as u32);
    dst.put_u8(kind);
    dst.put_slice(body);
    Ok(())
}
