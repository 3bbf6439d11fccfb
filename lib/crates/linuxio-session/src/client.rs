//! Framed IPC client for a per-session bridge socket.

use futures::{SinkExt, StreamExt};
use linuxio_common::Error;
use linuxio_common::wire::{
    AUTH_NAMESPACE, Frame, FrameCodec, Request, Response, STREAM_NAMESPACE, StreamFrame,
};
use tokio::net::UnixStream;
use tokio_util::codec::Framed;

/// Map a response error code back onto the taxonomy.
fn error_from_response(message: String, code: u16) -> Error {
    match code {
        400 => Error::InvalidArgs(message),
        401 => Error::Unauthorized(message),
        404 => Error::NotFound(message),
        409 => Error::Conflict(message),
        504 => Error::Timeout(message),
        _ => Error::External {
            tool: "bridge".to_string(),
            detail: message,
        },
    }
}

#[derive(Debug)]
pub struct BridgeClient {
    framed: Framed<UnixStream, FrameCodec>,
    next_id: u64,
}

impl BridgeClient {
    /// Dial the bridge socket and present the session secret. The bridge
    /// closes silently on a bad secret, which surfaces here as
    /// `Unauthorized`.
    pub async fn connect(socket_path: &str, secret: &str) -> Result<Self, Error> {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(|e| Error::Transport(format!("dialing {socket_path}: {e}")))?;
        let mut framed = Framed::new(stream, FrameCodec);

        framed
            .send(Frame::Request(Request {
                namespace: AUTH_NAMESPACE.to_string(),
                command: AUTH_NAMESPACE.to_string(),
                args: vec![secret.to_string()],
                id: 0,
            }))
            .await?;
        match framed.next().await {
            Some(Ok(Frame::Response(resp))) if resp.ok => Ok(BridgeClient {
                framed,
                next_id: 1,
            }),
            Some(Ok(_)) | None => Err(Error::Unauthorized(
                "bridge rejected the session secret".to_string(),
            )),
            Some(Err(err)) => Err(err),
        }
    }

    async fn round_trip(&mut self, request: Request) -> Result<Response, Error> {
        let id = request.id;
        self.framed.send(Frame::Request(request)).await?;
        loop {
            match self.framed.next().await {
                Some(Ok(Frame::Response(resp))) if resp.id == id => return Ok(resp),
                // Responses for other in-flight ids or stray stream frames
                // are not ours to consume here.
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(err),
                None => {
                    return Err(Error::Transport(
                        "bridge closed the connection mid-request".to_string(),
                    ));
                }
            }
        }
    }

    /// Issue one command and return its payload.
    pub async fn request(
        &mut self,
        namespace: &str,
        command: &str,
        args: &[String],
    ) -> Result<serde_json::Value, Error> {
        let id = self.next_id;
        self.next_id += 1;
        let resp = self
            .round_trip(Request {
                namespace: namespace.to_string(),
                command: command.to_string(),
                args: args.to_vec(),
                id,
            })
            .await?;
        if resp.ok {
            Ok(resp.payload.unwrap_or(serde_json::Value::Null))
        } else {
            let err = resp.error.unwrap_or(linuxio_common::wire::ResponseError {
                message: "bridge reported failure without detail".to_string(),
                code: 500,
            });
            Err(error_from_response(err.message, err.code))
        }
    }

    /// Open a stream and return its id; frames follow via
    /// [`BridgeClient::next_stream_frame`].
    pub async fn open_stream(&mut self, stream_type: &str, args: &[String]) -> Result<u32, Error> {
        let payload = self.request(STREAM_NAMESPACE, stream_type, args).await?;
        payload
            .get("stream_id")
            .and_then(serde_json::Value::as_u64)
            .and_then(|id| u32::try_from(id).ok())
            .ok_or_else(|| Error::Transport("stream open reply missing stream_id".to_string()))
    }

    /// Next stream frame from the connection; `None` on EOF.
    pub async fn next_stream_frame(&mut self) -> Result<Option<StreamFrame>, Error> {
        loop {
            match self.framed.next().await {
                Some(Ok(Frame::Stream(frame))) => return Ok(Some(frame)),
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(err),
                None => return Ok(None),
            }
        }
    }

    /// Ask the bridge to cancel a stream. Idempotent on the receiving side.
    pub async fn close_stream(&mut self, stream_id: u32) -> Result<(), Error> {
        self.framed
            .send(Frame::Stream(StreamFrame::close(stream_id)))
            .await
    }
}
