//! Supervisor control protocol.
//!
//! # Data Flow
//! ```text
//! Inbound (supervisor → worker):
//!     pipe read end (fd 4)
//!     → frame.rs (4-byte big-endian length prefix, chunk-queue deframer)
//!     → message.rs (JSON `[command, args]` payload)
//!     → channel.rs (dispatch to the single installed handler)
//!
//! Outbound (worker → supervisor):
//!     ControlSender::send(command, args)
//!     → message.rs (JSON encode)
//!     → frame.rs (length prefix)
//!     → pipe write end (fd 5)
//! ```
//!
//! # Design Decisions
//! - Partial input is flow control, never an error
//! - A malformed frame is dropped; decoding resumes at the next frame
//! - No frame size limit unless one is configured

pub mod channel;
pub mod frame;
pub mod message;

pub use channel::{CommandHandler, ControlChannel, ControlSender, IngestReport, ProtocolError};
pub use frame::{Frame, FrameCodec, FramingError};
pub use message::{commands, ControlMessage};
