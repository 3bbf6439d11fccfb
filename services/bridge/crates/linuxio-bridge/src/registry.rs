//! Handler registries: command table and stream table.
//!
//! Registration happens once at startup; lookups are read-only afterwards.
//! Double registration is a programming error and is rejected
//! deterministically so a bad merge cannot silently shadow a handler.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use linuxio_common::Error;
use linuxio_common::wire::{Frame, StreamFrame};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::state::BridgeState;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), Error>> + Send>>;
pub type CommandHandler = Arc<dyn Fn(RequestCtx, Vec<String>, Emit) -> HandlerFuture + Send + Sync>;
pub type StreamHandler = Arc<dyn Fn(StreamCtx) -> HandlerFuture + Send + Sync>;

/// Per-request context handed to command handlers.
#[derive(Clone)]
pub struct RequestCtx {
    pub state: Arc<BridgeState>,
    pub cancel: CancellationToken,
}

/// Context handed to stream handlers; owns the stream id and a sink for
/// emitting frames on the originating connection.
#[derive(Clone)]
pub struct StreamCtx {
    pub state: Arc<BridgeState>,
    pub stream_id: u32,
    pub args: Vec<String>,
    pub cancel: CancellationToken,
    pub sink: StreamSink,
}

#[derive(Debug)]
enum EmitOutcome {
    Ok(serde_json::Value),
    Err { message: String, code: u16 },
}

/// Capability object for producing exactly one command outcome.
///
/// A second call, or a handler that returns `Ok(())` without calling either
/// method, is a bug; the dispatcher reports the latter as an internal error.
#[derive(Clone, Default)]
pub struct Emit {
    slot: Arc<Mutex<Option<EmitOutcome>>>,
}

impl Emit {
    #[must_use]
    pub fn new() -> Self {
        Emit::default()
    }

    pub fn result(&self, value: serde_json::Value) -> Result<(), Error> {
        self.put(EmitOutcome::Ok(value))
    }

    pub fn error(&self, message: impl Into<String>, code: u16) -> Result<(), Error> {
        self.put(EmitOutcome::Err {
            message: message.into(),
            code,
        })
    }

    fn put(&self, outcome: EmitOutcome) -> Result<(), Error> {
        let mut slot = self.slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if slot.is_some() {
            return Err(Error::Fatal(
                "handler emitted more than one outcome".to_string(),
            ));
        }
        *slot = Some(outcome);
        Ok(())
    }

    /// Consume the emitted outcome, mapping it to `(ok, payload, error)`
    /// response parts. `None` when the handler never emitted.
    #[must_use]
    pub fn take(&self) -> Option<(bool, Option<serde_json::Value>, Option<(String, u16)>)> {
        let mut slot = self.slot.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        slot.take().map(|outcome| match outcome {
            EmitOutcome::Ok(value) => (true, Some(value), None),
            EmitOutcome::Err { message, code } => (false, None, Some((message, code))),
        })
    }
}

/// Clonable writer for stream frames, backed by the connection's outbound
/// channel. Send failures mean the peer is gone and are ignored; the stream
/// task notices cancellation separately.
#[derive(Clone)]
pub struct StreamSink {
    tx: mpsc::Sender<Frame>,
}

impl StreamSink {
    #[must_use]
    pub fn new(tx: mpsc::Sender<Frame>) -> Self {
        StreamSink { tx }
    }

    pub async fn data(&self, stream_id: u32, payload: impl Into<bytes::Bytes>) {
        let _ = self
            .tx
            .send(Frame::Stream(StreamFrame::data(stream_id, payload)))
            .await;
    }

    pub async fn progress(&self, stream_id: u32, payload: &serde_json::Value) {
        let _ = self
            .tx
            .send(Frame::Stream(StreamFrame::progress(stream_id, payload)))
            .await;
    }

    pub async fn result_ok(&self, stream_id: u32, payload: &serde_json::Value) {
        let _ = self
            .tx
            .send(Frame::Stream(StreamFrame::result_ok(stream_id, payload)))
            .await;
    }

    pub async fn result_err(&self, stream_id: u32, message: &str, code: u16) {
        let _ = self
            .tx
            .send(Frame::Stream(StreamFrame::result_err(
                stream_id, message, code,
            )))
            .await;
    }

    pub async fn close(&self, stream_id: u32) {
        let _ = self
            .tx
            .send(Frame::Stream(StreamFrame::close(stream_id)))
            .await;
    }
}

#[derive(Default)]
pub struct Registry {
    commands: HashMap<(String, String), CommandHandler>,
    streams: HashMap<String, StreamHandler>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn command(
        &mut self,
        namespace: &str,
        command: &str,
        handler: CommandHandler,
    ) -> Result<(), Error> {
        let key = (namespace.to_string(), command.to_string());
        if self.commands.contains_key(&key) {
            return Err(Error::Conflict(format!(
                "handler {namespace}/{command} is already registered"
            )));
        }
        self.commands.insert(key, handler);
        Ok(())
    }

    pub fn stream(&mut self, stream_type: &str, handler: StreamHandler) -> Result<(), Error> {
        if self.streams.contains_key(stream_type) {
            return Err(Error::Conflict(format!(
                "stream handler {stream_type} is already registered"
            )));
        }
        self.streams.insert(stream_type.to_string(), handler);
        Ok(())
    }

    #[must_use]
    pub fn lookup_command(&self, namespace: &str, command: &str) -> Option<CommandHandler> {
        self.commands
            .get(&(namespace.to_string(), command.to_string()))
            .cloned()
    }

    #[must_use]
    pub fn lookup_stream(&self, stream_type: &str) -> Option<StreamHandler> {
        self.streams.get(stream_type).cloned()
    }
}

/// Box a plain async fn into a [`CommandHandler`].
pub fn handler<F, Fut>(f: F) -> CommandHandler
where
    F: Fn(RequestCtx, Vec<String>, Emit) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    Arc::new(move |ctx, args, emit| Box::pin(f(ctx, args, emit)))
}

/// Box a plain async fn into a [`StreamHandler`].
pub fn stream_handler<F, Fut>(f: F) -> StreamHandler
where
    F: Fn(StreamCtx) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(f(ctx)))
}

/// Arity check shared by all command handlers.
pub fn require_args(args: &[String], want: usize, usage: &str) -> Result<(), Error> {
    if args.len() < want {
        return Err(Error::InvalidArgs(format!(
            "expected at least {want} argument(s): {usage}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn noop() -> CommandHandler {
        handler(|_ctx, _args, emit| async move { emit.result(serde_json::json!(null)) })
    }

    #[test]
    fn double_registration_is_rejected() {
        let mut reg = Registry::new();
        reg.command("dbus", "ListServices", noop()).unwrap();
        let err = reg.command("dbus", "ListServices", noop()).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn lookup_returns_registered_handler() {
        let mut reg = Registry::new();
        reg.command("storage", "ListVolumeGroups", noop()).unwrap();
        assert!(reg.lookup_command("storage", "ListVolumeGroups").is_some());
        assert!(reg.lookup_command("storage", "Nope").is_none());
    }

    #[test]
    fn stream_double_registration_is_rejected() {
        let mut reg = Registry::new();
        let h = stream_handler(|_ctx| async move { Ok(()) });
        reg.stream("service-logs", h.clone()).unwrap();
        assert!(reg.stream("service-logs", h).is_err());
    }

    #[test]
    fn emit_accepts_exactly_one_outcome() {
        let emit = Emit::new();
        emit.result(serde_json::json!({"x": 1})).unwrap();
        assert!(emit.error("again", 500).is_err());
        let (ok, payload, error) = emit.take().unwrap();
        assert!(ok);
        assert_eq!(payload.unwrap()["x"], 1);
        assert!(error.is_none());
    }

    #[test]
    fn emit_take_is_none_when_never_emitted() {
        let emit = Emit::new();
        assert!(emit.take().is_none());
    }

    #[test]
    fn require_args_maps_to_invalid_args() {
        let args = vec!["one".to_string()];
        assert!(require_args(&args, 1, "unit").is_ok());
        let err = require_args(&args, 2, "unit size").unwrap_err();
        assert_eq!(err.code(), 400);
    }
}
