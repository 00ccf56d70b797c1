//! IPC bridge for host-worker communication.
//!
//! This module provides the wire protocol and codec for communication between
//! the supervisor (host) and the worker subprocess over its standard streams.
//!
//! # Architecture
//!
//! - **framer**: newline framing that survives records split across reads
//! - **protocol**: message and command types (InboundMessage, Command, payloads)
//! - **codec**: JSON line codec for AsyncRead/AsyncWrite

pub mod codec;
pub mod framer;
pub mod protocol;
