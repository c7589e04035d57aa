//! Bidirectional control channel between a worker and its supervisor.
//!
//! # Responsibilities
//! - Feed every chunk read from the inbound endpoint into a private deframer
//! - Parse frames as [`ControlMessage`]s and dispatch them to one handler
//! - Write outbound commands as frames on the outbound endpoint
//!
//! # Design Decisions
//! - Inbound and outbound endpoints are independent; no ordering between them
//! - A malformed frame is dropped and reported; the channel keeps going
//! - Dispatch without a handler is a configuration error and is returned

use std::sync::Arc;

use futures_util::SinkExt;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::unix::pipe;
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;

use crate::activation::ControlEndpoints;
use crate::protocol::frame::{FrameCodec, FramingError};
use crate::protocol::message::ControlMessage;

/// Read buffer size for the inbound endpoint.
const READ_CHUNK: usize = 4096;

/// Errors surfaced by the control channel.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A command arrived before any handler was installed.
    #[error("no handler installed for inbound command `{0}`")]
    NoHandler(String),

    /// A handler was already installed; a channel has exactly one.
    #[error("control command handler already installed")]
    HandlerInstalled,

    /// Reading the inbound endpoint failed.
    #[error("control channel I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An outbound command could not be framed or written.
    #[error(transparent)]
    Framing(#[from] FramingError),
}

/// Receiver of inbound commands.
pub trait CommandHandler: Send {
    fn on_command(&mut self, message: ControlMessage);
}

impl<F> CommandHandler for F
where
    F: FnMut(ControlMessage) + Send,
{
    fn on_command(&mut self, message: ControlMessage) {
        self(message)
    }
}

/// Outcome of feeding one inbound chunk.
#[derive(Debug, Default)]
pub struct IngestReport {
    /// Messages handed to the handler.
    pub dispatched: usize,
    /// Frames that were dropped, with the reason.
    pub dropped: Vec<FramingError>,
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Cloneable outbound half of a [`ControlChannel`].
#[derive(Clone)]
pub struct ControlSender {
    writer: Arc<Mutex<FramedWrite<BoxedWriter, FrameCodec>>>,
}

impl ControlSender {
    fn new(writer: BoxedWriter, max_frame_len: Option<usize>) -> Self {
        Self {
            writer: Arc::new(Mutex::new(FramedWrite::new(writer, FrameCodec::with_limit(max_frame_len)))),
        }
    }

    /// Send a command with arguments.
    pub async fn send(&self, command: &str, args: Map<String, Value>) -> Result<(), ProtocolError> {
        self.send_message(&ControlMessage::with_args(command, args)).await
    }

    /// Send an already-built message as one frame.
    pub async fn send_message(&self, message: &ControlMessage) -> Result<(), ProtocolError> {
        let payload = message.to_payload()?;
        let mut writer = self.writer.lock().await;
        writer.send(payload).await?;
        tracing::debug!(command = %message.command, "Control command sent");
        Ok(())
    }
}

impl std::fmt::Debug for ControlSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlSender").finish_non_exhaustive()
    }
}

/// Framed command channel over a pair of byte streams.
pub struct ControlChannel<R> {
    reader: R,
    sender: ControlSender,
    codec: FrameCodec,
    handler: Option<Box<dyn CommandHandler>>,
}

impl<R> ControlChannel<R>
where
    R: AsyncRead + Unpin,
{
    /// Create a channel without a frame size limit.
    pub fn new<W>(reader: R, writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::with_max_frame_len(reader, writer, None)
    }

    pub fn with_max_frame_len<W>(reader: R, writer: W, max_frame_len: Option<usize>) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader,
            sender: ControlSender::new(Box::new(writer), max_frame_len),
            codec: FrameCodec::with_limit(max_frame_len),
            handler: None,
        }
    }

    /// Install the command handler. Only the first call succeeds.
    pub fn on_command<H>(&mut self, handler: H) -> Result<(), ProtocolError>
    where
        H: CommandHandler + 'static,
    {
        if self.handler.is_some() {
            return Err(ProtocolError::HandlerInstalled);
        }
        self.handler = Some(Box::new(handler));
        Ok(())
    }

    /// Outbound half, usable independently of the inbound loop.
    pub fn sender(&self) -> ControlSender {
        self.sender.clone()
    }

    /// Feed one inbound chunk and dispatch every frame it completes.
    pub fn ingest(&mut self, chunk: &[u8]) -> Result<IngestReport, ProtocolError> {
        self.codec.feed(bytes::Bytes::copy_from_slice(chunk));

        let mut report = IngestReport::default();
        loop {
            let frame = match self.codec.pull() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "Dropping control frame");
                    report.dropped.push(err);
                    continue;
                }
            };

            let message = match ControlMessage::from_payload(frame.payload()) {
                Ok(message) => message,
                Err(err) => {
                    tracing::warn!(error = %err, frame_len = frame.len(), "Dropping control frame");
                    report.dropped.push(err);
                    continue;
                }
            };

            let Some(handler) = self.handler.as_mut() else {
                return Err(ProtocolError::NoHandler(message.command));
            };

            tracing::debug!(command = %message.command, "Control command received");
            handler.on_command(message);
            report.dispatched += 1;
        }

        Ok(report)
    }

    /// Read the inbound endpoint until EOF, dispatching as frames complete.
    pub async fn run(mut self) -> Result<(), ProtocolError> {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = self.reader.read(&mut buf).await?;
            if n == 0 {
                if self.codec.buffered() > 0 {
                    tracing::warn!(
                        pending_bytes = self.codec.buffered(),
                        "Control channel closed mid-frame"
                    );
                } else {
                    tracing::info!("Control channel closed by supervisor");
                }
                return Ok(());
            }
            self.ingest(&buf[..n])?;
        }
    }
}

impl ControlChannel<pipe::Receiver> {
    /// Build a channel over the pipe descriptors inherited from the supervisor.
    ///
    /// Both ends are switched to non-blocking mode and registered with the
    /// reactor, so a pending read is dropped with the task that owns it.
    /// Must be called from within a runtime.
    pub fn from_inherited(endpoints: ControlEndpoints, max_frame_len: Option<usize>) -> std::io::Result<Self> {
        let reader = pipe::Receiver::from_owned_fd(endpoints.read)?;
        let writer = pipe::Sender::from_owned_fd(endpoints.write)?;
        Ok(Self::with_max_frame_len(reader, writer, max_frame_len))
    }
}
