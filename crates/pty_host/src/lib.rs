#![deny(dead_code)]

pub mod error;
pub mod host;

pub use crate::error::PtyHostError;
pub use crate::host::{
    EventSink, ExitInfo, KillRequest, PtyHost, ResizeRequest, SpawnOptions, SpawnRequest,
    SpawnResponse, TerminalInfo, TerminalSnapshot, TerminalState, WriteRequest,
};
