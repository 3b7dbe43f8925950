//! Live stream consumption.
//!
//! `subscriber` owns the SSE connection for one session and turns frames into
//! [`skein_protocol::StreamEvent`]s; `assembler` folds those events into the
//! per-session in-progress buffer.

mod assembler;
mod subscriber;

pub use assembler::{AssemblerOutput, StreamAssembler, StreamPhase, StreamingState};
pub use subscriber::StreamSubscriber;
