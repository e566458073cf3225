//! Asynchronous, multiplexed block I/O against the shard files.

pub use buffer::IoBuf;
pub use stripedio::{SessionId, StripedIo};

mod buffer;
mod queue;
mod stripedio;
